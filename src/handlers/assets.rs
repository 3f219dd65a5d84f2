//! HTTP endpoints: a thin mapping onto the asset engine.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::config::HttpConfig;
use crate::error::{ApiResponse, AppError, Result};
use crate::models::{Asset, StoreExtra};
use crate::services::{AssetContent, AssetService};
use crate::utils::range::{parse_http_range_header, HttpRange};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AssetService>,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyQuery {
    #[serde(default)]
    pub asset_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlQuery {
    #[serde(default)]
    pub original_url: String,
    /// Any non-empty value means "block until the fetch completes".
    #[serde(default)]
    pub wait: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreQuery {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub info: String,
}

/// GET /describeByKey?assetKey=…
pub async fn describe_by_key(
    State(state): State<AppState>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<ApiResponse<Asset>>> {
    let asset = state.service.describe_by_key(&q.asset_key).await?;
    Ok(Json(ApiResponse::ok(asset)))
}

/// GET /getByKey?assetKey=…
pub async fn get_by_key(
    State(state): State<AppState>,
    Query(q): Query<KeyQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let range = range_from_headers(&headers)?;
    let content = state.service.get_by_key(&q.asset_key, range).await?;
    respond_asset(&state.http, &headers, content)
}

/// GET /getByOriginalUrl?originalUrl=…
pub async fn get_by_original_url(
    State(state): State<AppState>,
    Query(q): Query<UrlQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let range = range_from_headers(&headers)?;
    let content = state
        .service
        .get_by_original_url(&q.original_url, range)
        .await?;
    respond_asset(&state.http, &headers, content)
}

/// GET /storeByOriginalUrl?originalUrl=…&wait=…
pub async fn store_by_original_url(
    State(state): State<AppState>,
    Query(q): Query<UrlQuery>,
) -> Result<Json<ApiResponse<Asset>>> {
    let wait = !q.wait.is_empty();
    let asset = state
        .service
        .store_by_original_url(&q.original_url, wait)
        .await?;
    Ok(Json(ApiResponse::ok(asset)))
}

/// POST|PUT /store — the request body is the asset content.
pub async fn store(
    State(state): State<AppState>,
    Query(q): Query<StoreQuery>,
    request: Request,
) -> Result<Json<ApiResponse<Asset>>> {
    let extra = StoreExtra {
        content_type: q.content_type,
        original_name: q.original_name,
        original_url: q.original_url,
        info: q.info,
        ..Default::default()
    };

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    let asset = state.service.store(extra, Box::pin(reader)).await?;
    Ok(Json(ApiResponse::ok(asset)))
}

fn range_from_headers(headers: &HeaderMap) -> Result<Option<HttpRange>> {
    match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => Ok(Some(parse_http_range_header(value)?)),
        None => Ok(None),
    }
}

/// Serve asset bytes with metadata, cache and range headers.
fn respond_asset(config: &HttpConfig, req_headers: &HeaderMap, content: AssetContent) -> Result<Response> {
    let asset = &content.asset;

    let mut builder = Response::builder();
    builder = set_header(builder, "x-asset-btime", &asset.btime);
    if let Some(mtime) = &asset.mtime {
        builder = set_header(builder, "x-asset-mtime", mtime);
    }
    if !asset.original_url.is_empty() {
        builder = set_header(builder, "x-asset-original-url", &asset.original_url);
    }
    if !asset.original_name.is_empty() {
        builder = set_header(builder, "x-asset-original-name", &asset.original_name);
    }

    // conditional retrieval against the stored content hash
    if let Some(tag) = req_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if etag_matches(tag, &asset.content_hash) {
            let response = builder
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, asset.content_hash.as_str())
                .body(Body::empty())
                .map_err(|e| AppError::Internal(format!("build response: {e}")))?;
            return Ok(response);
        }
    }

    let content_type = if asset.content_type.is_empty() {
        &config.fallback_mimetype
    } else {
        &asset.content_type
    };
    builder = set_header(builder, header::CONTENT_TYPE.as_str(), content_type);

    if !asset.original_name.is_empty() {
        builder = set_header(
            builder,
            header::CONTENT_DISPOSITION.as_str(),
            &format!("inline; *filename='{}'", asset.original_name),
        );
    }

    if asset.size > 0 {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    if config.cache_ttl > 0 {
        let ttl = config.cache_ttl;
        builder = builder
            .header(header::CACHE_CONTROL, format!("public, max-age={ttl}"))
            .header(header::PRAGMA, "cache")
            .header(
                header::EXPIRES,
                (Utc::now() + chrono::Duration::seconds(ttl as i64))
                    .format("%a, %d %b %Y %H:%M:%S GMT")
                    .to_string(),
            );
        if !asset.content_hash.is_empty() {
            builder = set_header(builder, header::ETAG.as_str(), &asset.content_hash);
        }
    }

    let builder = match content.range {
        Some(range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.http_header(asset.size))
            .header(header::CONTENT_LENGTH, range.length()),
        None => {
            let builder = builder.status(StatusCode::OK);
            if asset.size > 0 {
                builder.header(header::CONTENT_LENGTH, asset.size)
            } else {
                builder
            }
        }
    };

    builder
        .body(Body::from_stream(ReaderStream::new(content.reader)))
        .map_err(|e| AppError::Internal(format!("build response: {e}")))
}

/// Set a header, percent-encoding the value if it is not directly
/// representable.
fn set_header(
    builder: axum::http::response::Builder,
    name: &str,
    value: &str,
) -> axum::http::response::Builder {
    match HeaderValue::from_str(value) {
        Ok(v) => builder.header(name, v),
        Err(_) => builder.header(name, urlencoding::encode(value).into_owned()),
    }
}

fn etag_matches(if_none_match: &str, content_hash: &str) -> bool {
    if content_hash.is_empty() {
        return false;
    }
    if_none_match.split(',').any(|tag| {
        let tag = tag.trim();
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        let tag = tag.trim_matches('"');
        tag == "*" || tag == content_hash
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetConfig, StorageConfig};
    use crate::db::Database;
    use crate::repository::AssetRepository;
    use crate::storage::DirStorage;
    use axum::routing::get as route_get;
    use axum::Router;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/describeByKey", route_get(describe_by_key))
            .route("/getByKey", route_get(get_by_key))
            .route("/getByOriginalUrl", route_get(get_by_original_url))
            .route("/storeByOriginalUrl", route_get(store_by_original_url))
            .route(
                "/store",
                axum::routing::post(store).put(store),
            )
            .with_state(state)
    }

    /// Spawn the full HTTP surface on an ephemeral port.
    async fn spawn_app(root: &TempDir) -> String {
        let storage = Arc::new(DirStorage::new(StorageConfig {
            dir: root.path().to_path_buf(),
            path_depth: 2,
            ..Default::default()
        }));
        let db = Database::connect_in_memory().await.unwrap();
        let repo = AssetRepository::new(db);
        repo.migrate().await.unwrap();
        let config = AssetConfig {
            original_url_pattern: Some(regex::Regex::new("^http://").unwrap()),
            ..Default::default()
        };
        let service = AssetService::new(storage, repo, config, CancellationToken::new());

        let state = AppState {
            service,
            http: HttpConfig {
                cache_ttl: 60,
                ..Default::default()
            },
        };
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    async fn store_hello(base: &str, client: &reqwest::Client) -> String {
        let response = client
            .post(format!("{base}/store?contentType=text/plain&originalName=hello.txt"))
            .body("hello")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        body["res"]["assetKey"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn store_then_get_serves_the_bytes() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();

        let key = store_hello(&base, &client).await;
        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/plain"
        );
        assert_eq!(response.headers()["content-length"].to_str().unwrap(), "5");
        assert_eq!(response.headers()["accept-ranges"].to_str().unwrap(), "bytes");
        assert!(response.headers().contains_key("x-asset-btime"));
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn range_request_is_partial_content() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();
        let key = store_hello(&base, &client).await;

        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .header("range", "bytes=1-3")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(
            response.headers()["content-range"].to_str().unwrap(),
            "bytes 1-3/5"
        );
        assert_eq!(response.headers()["content-length"].to_str().unwrap(), "3");
        assert_eq!(response.text().await.unwrap(), "ell");
    }

    #[tokio::test]
    async fn tail_range_serves_the_last_bytes() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();
        let key = store_hello(&base, &client).await;

        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .header("range", "bytes=-2")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(
            response.headers()["content-range"].to_str().unwrap(),
            "bytes 3-4/5"
        );
        assert_eq!(response.text().await.unwrap(), "lo");
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();
        let key = store_hello(&base, &client).await;

        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .header("range", "bytes=10-20")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 416);
    }

    #[tokio::test]
    async fn matching_etag_is_not_modified() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();
        let key = store_hello(&base, &client).await;

        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .send()
            .await
            .unwrap();
        let etag = response.headers()["etag"].to_str().unwrap().to_string();

        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .header("if-none-match", &etag)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 304);

        // a stale validator still gets the full body
        let response = client
            .get(format!("{base}/getByKey?assetKey={key}"))
            .header("if-none-match", "stale")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn rejected_url_redirects_to_it() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();

        let response = client
            .get(format!(
                "{base}/getByOriginalUrl?originalUrl=ftp://example.com/x"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 307);
        assert_eq!(
            response.headers()["location"].to_str().unwrap(),
            "ftp://example.com/x"
        );
    }

    #[tokio::test]
    async fn unknown_key_is_a_json_error() {
        let root = TempDir::new().unwrap();
        let base = spawn_app(&root).await;
        let client = client();

        let response = client
            .get(format!("{base}/describeByKey?assetKey=missing"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["res"].is_null());
        assert!(body["err"].as_str().unwrap().contains("row not found"));
    }

    #[test]
    fn etag_comparison() {
        assert!(etag_matches("abc", "abc"));
        assert!(etag_matches("\"abc\"", "abc"));
        assert!(etag_matches("W/\"abc\"", "abc"));
        assert!(etag_matches("*", "abc"));
        assert!(etag_matches("x, \"abc\"", "abc"));
        assert!(!etag_matches("xyz", "abc"));
        assert!(!etag_matches("*", ""));
        assert!(!etag_matches("", "abc"));
    }
}
