mod config;
mod db;
mod error;
mod handlers;
mod models;
mod repository;
mod services;
mod storage;
mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{parse_perm, AssetConfig, HttpConfig, StorageConfig};
use crate::db::Database;
use crate::handlers::AppState;
use crate::models::StoreExtra;
use crate::repository::AssetRepository;
use crate::services::AssetService;
use crate::storage::DirStorage;

#[derive(Parser)]
#[command(name = "assetstore", about = "Content-addressed asset storage service.")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalOpts {
    /// Directory to store asset files.
    #[arg(long, env = "ASSETS_DIR", default_value = "./storage")]
    dir: PathBuf,

    /// Maximum directory tree depth.
    #[arg(long, env = "ASSETS_PATH_DEPTH", default_value_t = 2)]
    path_depth: u8,

    /// Permission flags for new directories within a tree.
    #[arg(long, env = "ASSETS_DIR_PERM", default_value = "0755", value_parser = parse_perm)]
    dir_perm: u32,

    /// Permission flags for new files within a tree.
    #[arg(long, env = "ASSETS_FILE_PERM", default_value = "0655", value_parser = parse_perm)]
    file_perm: u32,

    /// Size limit for resources fetched by URL. 0 disables the check.
    #[arg(long, env = "ASSETS_MAX_REMOTE_SIZE", default_value_t = 1000 * 1024 * 1024)]
    max_remote_size: i64,

    /// Size limit to wait for resources fetched by URL.
    #[arg(long, env = "ASSETS_MAX_REMOTE_WAIT_SIZE", default_value_t = 10 * 1024 * 1024, hide = true)]
    max_remote_wait_size: i64,

    /// Size limit for resources pushed directly. 0 disables the check.
    #[arg(long, env = "ASSETS_MAX_SIZE", default_value_t = 0)]
    max_size: i64,

    /// Pattern to check URLs before fetch. Example: '^https?://.'.
    #[arg(long, env = "ASSETS_ORIGINAL_URL_PATTERN")]
    original_url_pattern: Option<String>,

    /// User-Agent header used when fetching remote resources.
    #[arg(long, env = "ASSETS_HTTP_USER_AGENT", default_value = "AssetsClient")]
    http_user_agent: String,

    /// Data source name. Example: 'sqlite3:./storage/assets.db'.
    #[arg(long, env = "ASSETS_DSN")]
    dsn: String,
}

#[derive(Subcommand)]
enum Command {
    /// Apply migrations on the current database
    Migrate,

    /// Start the HTTP server
    Http {
        /// Address to bind the HTTP server.
        #[arg(long, env = "ASSETS_HTTP_BIND", default_value = "0.0.0.0:8080")]
        bind: String,

        /// Fallback value for the response Content-Type header.
        #[arg(long, env = "ASSETS_HTTP_FALLBACK_MIMETYPE", default_value = "application/octet-stream")]
        fallback_mimetype: String,

        /// Cache lifetime in seconds advertised to clients. 0 disables cache
        /// headers.
        #[arg(long, env = "ASSETS_HTTP_CACHE_TTL", default_value_t = 0)]
        cache_ttl: u64,
    },

    /// Store assets by original URLs; '-' reads more URLs from stdin
    Storeurls {
        #[arg(value_name = "URL")]
        urls: Vec<String>,
    },

    /// Store local files as assets; '-' reads more paths from stdin
    Storefiles {
        #[arg(value_name = "PATH")]
        paths: Vec<String>,
    },

    /// Store stdin as a single asset
    Storepipe {
        /// Value for the asset's content_type field.
        #[arg(long, visible_alias = "mime")]
        content_type: Option<String>,

        /// Value for the asset's original_name field.
        #[arg(long, visible_alias = "name")]
        original_name: Option<String>,

        /// Value for the asset's original_url field.
        #[arg(long, visible_alias = "url")]
        original_url: Option<String>,

        /// Value for the asset's info field.
        #[arg(long)]
        info: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "assetstore=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Migrate => run_migrate(&cli.opts).await,
        Command::Http {
            bind,
            fallback_mimetype,
            cache_ttl,
        } => {
            run_http(
                &cli.opts,
                HttpConfig {
                    bind,
                    fallback_mimetype,
                    cache_ttl,
                },
            )
            .await
        }
        Command::Storeurls { urls } => run_store_urls(&cli.opts, urls).await,
        Command::Storefiles { paths } => run_store_files(&cli.opts, paths).await,
        Command::Storepipe {
            content_type,
            original_name,
            original_url,
            info,
        } => {
            let extra = StoreExtra {
                content_type: content_type.unwrap_or_default(),
                original_name: original_name.unwrap_or_default(),
                original_url: original_url.unwrap_or_default(),
                info: info.unwrap_or_default(),
                ..Default::default()
            };
            run_store_pipe(&cli.opts, extra).await
        }
    }
}

async fn init_repo(opts: &GlobalOpts) -> anyhow::Result<AssetRepository> {
    let db = Database::connect(&opts.dsn)
        .await
        .context("unable to connect to db")?;
    Ok(AssetRepository::new(db))
}

async fn init_service(opts: &GlobalOpts) -> anyhow::Result<(Arc<AssetService>, CancellationToken)> {
    // an absent pattern compiles to the empty regex, which matches any URL
    let pattern = regex::Regex::new(opts.original_url_pattern.as_deref().unwrap_or(""))
        .context("invalid pattern passed for original-url-pattern flag")?;

    let asset_config = AssetConfig {
        max_remote_size: opts.max_remote_size,
        max_remote_wait_size: opts.max_remote_wait_size,
        max_size: opts.max_size,
        original_url_pattern: Some(pattern),
        http_user_agent: opts.http_user_agent.clone(),
    };

    let storage = Arc::new(DirStorage::new(StorageConfig {
        dir: opts.dir.clone(),
        path_depth: opts.path_depth,
        dir_perm: opts.dir_perm,
        file_perm: opts.file_perm,
    }));

    let repo = init_repo(opts).await?;
    let shutdown = CancellationToken::new();
    let service = AssetService::new(storage, repo, asset_config, shutdown.clone());
    Ok((service, shutdown))
}

async fn run_migrate(opts: &GlobalOpts) -> anyhow::Result<()> {
    let repo = init_repo(opts).await?;
    repo.migrate().await.context("unable to migrate db")?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn run_http(opts: &GlobalOpts, http_config: HttpConfig) -> anyhow::Result<()> {
    let (service, shutdown) = init_service(opts).await?;

    let state = AppState {
        service,
        http: http_config.clone(),
    };
    let app = create_router(state);

    // a Go-style ":8080" means all interfaces
    let bind = if http_config.bind.starts_with(':') {
        format!("0.0.0.0{}", http_config.bind)
    } else {
        http_config.bind.clone()
    };

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            // background fetches observe the cancellation and finalize rows
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/describeByKey", get(handlers::describe_by_key))
        .route("/getByKey", get(handlers::get_by_key))
        .route("/getByOriginalUrl", get(handlers::get_by_original_url))
        .route("/storeByOriginalUrl", get(handlers::store_by_original_url))
        .route("/store", post(handlers::store).put(handlers::store))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn run_store_urls(opts: &GlobalOpts, args: Vec<String>) -> anyhow::Result<()> {
    let (service, _shutdown) = init_service(opts).await?;

    let mut read_stdin = false;
    for url in &args {
        if url == "-" {
            read_stdin = true;
            continue;
        }
        store_one_url(&service, url).await;
    }

    if read_stdin {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            store_one_url(&service, &line).await;
        }
    }

    Ok(())
}

async fn store_one_url(service: &Arc<AssetService>, original_url: &str) {
    match service.store_by_original_url(original_url, true).await {
        Ok(asset) => print_asset(&asset),
        Err(e) => tracing::error!("store {original_url:?}: {e}"),
    }
}

async fn run_store_files(opts: &GlobalOpts, args: Vec<String>) -> anyhow::Result<()> {
    let (service, _shutdown) = init_service(opts).await?;

    let mut read_stdin = false;
    for path in &args {
        if path == "-" {
            read_stdin = true;
            continue;
        }
        store_one_file(&service, path).await;
    }

    if read_stdin {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            store_one_file(&service, &line).await;
        }
    }

    Ok(())
}

async fn store_one_file(service: &Arc<AssetService>, path: &str) {
    let result = async {
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;

        let absolute_path = std::fs::canonicalize(path)?;
        let mtime = metadata
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        let info = serde_json::json!({
            "file": {
                "absolutePath": absolute_path,
                "mtime": mtime,
            }
        });

        let extra = StoreExtra {
            original_name: Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            info: info.to_string(),
            ..Default::default()
        };
        service.store(extra, Box::pin(file)).await.map_err(anyhow::Error::from)
    }
    .await;

    match result {
        Ok(asset) => print_asset(&asset),
        Err(e) => tracing::error!("store {path:?}: {e}"),
    }
}

async fn run_store_pipe(opts: &GlobalOpts, extra: StoreExtra) -> anyhow::Result<()> {
    let (service, _shutdown) = init_service(opts).await?;
    let asset = service.store(extra, Box::pin(tokio::io::stdin())).await?;
    print_asset(&asset);
    Ok(())
}

fn print_asset(asset: &models::Asset) {
    match serde_json::to_string(asset) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("encode asset: {e}"),
    }
}
