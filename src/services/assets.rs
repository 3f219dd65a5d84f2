//! The asset engine: coordinates the content-addressed storage, the metadata
//! repository, and the remote-URL fetcher.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, USER_AGENT};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::AssetConfig;
use crate::error::{AppError, Result};
use crate::models::{Asset, AssetStatus, StoreExtra};
use crate::repository::AssetRepository;
use crate::services::pipe::{pipe, PipeWriter};
use crate::storage::{BoxReader, Storage};
use crate::utils::range::HttpRange;

/// Frames buffered by the pipes between the fetcher, the storage writer and
/// a live reader.
const PIPE_FRAMES: usize = 8;

/// An asset served together with its content stream.
pub struct AssetContent {
    pub asset: Asset,
    pub reader: BoxReader,
    /// The normalized range actually applied to `reader`, when one was
    /// requested and could be honored.
    pub range: Option<HttpRange>,
}

pub struct AssetService {
    storage: Arc<dyn Storage>,
    repo: AssetRepository,
    config: AssetConfig,
    http: reqwest::Client,
    /// Parent lifetime for background fetches; cancelled on server shutdown.
    shutdown: CancellationToken,
    content_disposition_matcher: Regex,
}

impl AssetService {
    pub fn new(
        storage: Arc<dyn Storage>,
        repo: AssetRepository,
        config: AssetConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            repo,
            config,
            http: reqwest::Client::new(),
            shutdown,
            content_disposition_matcher: Regex::new(
                r#"\*?filename="([^"]+)|\*?filename='([^']+)|\*?filename=([^;]+)"#,
            )
            .expect("static pattern"),
        })
    }

    /// Metadata lookup by asset key.
    pub async fn describe_by_key(&self, asset_key: &str) -> Result<Asset> {
        guarded(async {
            self.repo
                .get_by_asset_key(asset_key)
                .await
                .map_err(|e| e.context(format!("query asset by asset_key={asset_key:?}")))
        })
        .await
    }

    /// Open the content of a terminal asset, optionally restricted to a
    /// byte range.
    pub async fn get_by_key(&self, asset_key: &str, range: Option<HttpRange>) -> Result<AssetContent> {
        guarded(async {
            let asset = self
                .repo
                .get_by_asset_key(asset_key)
                .await
                .map_err(|e| e.context(format!("query asset by asset_key={asset_key:?}")))?;
            self.read_asset(asset, range).await
        })
        .await
    }

    /// Serve an asset by its source URL, fetching it on a cache miss. On the
    /// miss path the returned reader is a live tee of the ongoing fetch.
    pub async fn get_by_original_url(
        self: &Arc<Self>,
        original_url: &str,
        range: Option<HttpRange>,
    ) -> Result<AssetContent> {
        let this = Arc::clone(self);
        guarded(async move {
            if let Some(existing) = this
                .get_by_original_url_or_none(original_url)
                .await
                .map_err(|e| e.context("find existing asset"))?
            {
                return this.read_asset(existing, range).await;
            }

            if let Err(e) = this.check_original_url(original_url) {
                tracing::debug!("unable to store by original url: {e}");
                return Err(AppError::SeeUrl {
                    url: original_url.to_string(),
                });
            }

            let (ack_tx, ack_rx) = oneshot::channel();
            let (writer, reader) = pipe(PIPE_FRAMES);
            let token = this.shutdown.child_token();
            let service = Arc::clone(&this);
            let url = original_url.to_string();
            let handle =
                tokio::spawn(async move { service.run_fetch(url, ack_tx, Some(writer), token).await });

            match ack_rx.await {
                Ok(snapshot) => {
                    let mut boxed: BoxReader = Box::pin(reader);
                    let mut applied = None;
                    if let Some(mut r) = range {
                        // a pipe cannot seek; honor the range by discarding
                        // the head when the advertised size is known
                        if snapshot.size > 0 {
                            r.normalize(snapshot.size)?;
                            boxed = skip_take(boxed, r).await?;
                            applied = Some(r);
                        }
                    }
                    Ok(AssetContent {
                        asset: snapshot,
                        reader: boxed,
                        range: applied,
                    })
                }
                Err(_) => {
                    // the fetch failed before publishing a snapshot
                    match handle.await.map_err(join_to_error)? {
                        Ok(_) => Err(AppError::Internal(
                            "fetch finished without publishing a snapshot".into(),
                        )),
                        Err(e) => Err(e),
                    }
                }
            }
        })
        .await
    }

    /// Direct push: write the stream, then insert a terminal row.
    pub async fn store(&self, extra: StoreExtra, data: BoxReader) -> Result<Asset> {
        guarded(async {
            let outcome = self
                .storage
                .write(data, self.config.max_size)
                .await
                .map_err(|e| e.context("write asset"))?;

            let mut asset = Asset {
                btime: Utc::now().to_rfc3339(),
                size: outcome.size,
                content_hash: outcome.content_hash,
                content_type: extra.content_type,
                original_name: extra.original_name,
                user_id: extra.user_id,
                original_url: extra.original_url,
                status: AssetStatus::Done,
                info: extra.info,
                ..Default::default()
            };
            asset.generate_asset_key();

            self.repo
                .insert(&asset)
                .await
                .map_err(|e| e.context("save done asset"))?;
            Ok(asset)
        })
        .await
    }

    /// Ingest a remote URL. With `wait = true` the call blocks until the
    /// fetch reaches a terminal state; otherwise it returns the processing
    /// snapshot as soon as the upstream headers are in, and the fetch
    /// continues on a background task bound to the server lifetime.
    pub async fn store_by_original_url(
        self: &Arc<Self>,
        original_url: &str,
        wait: bool,
    ) -> Result<Asset> {
        let this = Arc::clone(self);
        guarded(async move {
            if let Some(existing) = this
                .get_by_original_url_or_none(original_url)
                .await
                .map_err(|e| e.context("find existing asset"))?
            {
                if existing.error.is_empty() {
                    return Ok(existing);
                }
                // the previous fetch failed; try again with a fresh row
            }

            this.check_original_url(original_url)
                .map_err(|e| e.context("unable to store by original url"))?;

            let (ack_tx, ack_rx) = oneshot::channel();
            let token = this.shutdown.child_token();
            // tie the fetch to the caller only when it waits for the result
            let guard = wait.then(|| token.clone().drop_guard());

            let service = Arc::clone(&this);
            let url = original_url.to_string();
            let handle = tokio::spawn(async move { service.run_fetch(url, ack_tx, None, token).await });

            if wait {
                let result = handle.await.map_err(join_to_error)?;
                drop(guard);
                return result;
            }

            match ack_rx.await {
                Ok(snapshot) => Ok(snapshot),
                Err(_) => match handle.await.map_err(join_to_error)? {
                    Ok(asset) => Ok(asset),
                    Err(e) => Err(e),
                },
            }
        })
        .await
    }

    async fn read_asset(&self, asset: Asset, range: Option<HttpRange>) -> Result<AssetContent> {
        if asset.status != AssetStatus::Done {
            if asset.original_url.is_empty() {
                return Err(AppError::BadRequest(format!(
                    "found asset is not done yet, status={}",
                    asset.status
                )));
            }
            return Err(AppError::SeeUrl {
                url: asset.original_url.clone(),
            });
        }

        if !asset.error.is_empty() {
            return Err(AppError::BadRequest(format!(
                "open asset content_hash={:?}: {}",
                asset.content_hash, asset.error
            )));
        }

        let mut applied = None;
        if let Some(mut r) = range {
            r.normalize(asset.size)?;
            applied = Some(r);
        }

        let reader = self
            .storage
            .open_read(&asset.content_hash, applied)
            .await
            .map_err(|e| e.context(format!("open asset content_hash={:?}", asset.content_hash)))?;

        Ok(AssetContent {
            asset,
            reader,
            range: applied,
        })
    }

    async fn get_by_original_url_or_none(&self, original_url: &str) -> Result<Option<Asset>> {
        // prefer the canonical row; fall back to an errored one
        match self.repo.get_by_original_url(original_url, false).await {
            Ok(asset) => Ok(Some(asset)),
            Err(e) if e.is_not_found() => {
                match self.repo.get_by_original_url(original_url, true).await {
                    Ok(asset) => Ok(Some(asset)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e.context(format!("query asset by original_url={original_url:?}"))),
                }
            }
            Err(e) => Err(e.context(format!("query asset by original_url={original_url:?}"))),
        }
    }

    fn check_original_url(&self, original_url: &str) -> Result<()> {
        if original_url.is_empty() {
            return Err(AppError::BadRequest(
                "value of originalUrl can't be empty".into(),
            ));
        }
        match &self.config.original_url_pattern {
            None => Err(AppError::BadRequest(
                "not allowed, because no original url pattern is configured".into(),
            )),
            Some(pattern) if !pattern.is_match(original_url) => Err(AppError::BadRequest(
                "not allowed, because originalUrl doesn't match the configured pattern".into(),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Drive one fetch from row insert to the terminal row update. Owns the
    /// asset row for its whole lifetime.
    async fn run_fetch(
        self: Arc<Self>,
        original_url: String,
        ack_tx: oneshot::Sender<Asset>,
        live: Option<PipeWriter>,
        cancel: CancellationToken,
    ) -> Result<Asset> {
        let mut asset = Asset {
            btime: Utc::now().to_rfc3339(),
            original_url,
            status: AssetStatus::Processing,
            ..Default::default()
        };
        asset.generate_asset_key();

        self.repo
            .insert(&asset)
            .await
            .map_err(|e| e.context("save processing asset"))?;

        let fetch = guarded(self.fetch_into_storage(&mut asset, ack_tx, live, &cancel));
        let result = fetch.await;

        // terminal update runs on every exit path
        asset.status = AssetStatus::Done;
        if let Err(e) = &result {
            asset.error = e.to_string();
        }
        let updated = self.repo.update(&mut asset).await;

        tracing::info!(asset_key = %asset.asset_key, "background fetch done");
        match (result, updated) {
            (Err(e), _) => {
                tracing::warn!(asset_key = %asset.asset_key, "background fetch error: {e}");
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e.context("save done asset")),
            (Ok(()), Ok(())) => Ok(asset),
        }
    }

    async fn fetch_into_storage(
        &self,
        asset: &mut Asset,
        ack_tx: oneshot::Sender<Asset>,
        live: Option<PipeWriter>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            res = self.fetch_streaming(asset, ack_tx, live) => res,
            _ = cancel.cancelled() => Err(AppError::Context("cancelled".into())),
        }
    }

    async fn fetch_streaming(
        &self,
        asset: &mut Asset,
        ack_tx: oneshot::Sender<Asset>,
        mut live: Option<PipeWriter>,
    ) -> Result<()> {
        let response = self
            .http
            .get(&asset.original_url)
            .header(USER_AGENT, &self.config.http_user_agent)
            .send()
            .await
            .map_err(|e| {
                AppError::from(e).context(format!("fetch remote object {:?}", asset.original_url))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        asset.content_type = header_str(response.headers().get(CONTENT_TYPE));
        asset.original_name = self.extract_original_name(
            &header_str(response.headers().get(CONTENT_DISPOSITION)),
            &asset.original_url,
        );

        let content_length = response.content_length().map(|v| v as i64).unwrap_or(-1);
        check_length_limit(content_length, self.config.max_remote_size, "max-remote-size")?;
        check_length_limit(content_length, self.config.max_size, "max-size")?;
        asset.size = content_length;

        // early ack: the caller may return before the body is transferred
        let _ = ack_tx.send(asset.clone());

        // tee the body into the storage writer and the optional live reader
        let (store_tx, store_rx) = pipe(PIPE_FRAMES);
        let storage = Arc::clone(&self.storage);
        let max_size = self.config.max_size;
        let write_task =
            tokio::spawn(async move { storage.write(Box::pin(store_rx), max_size).await });

        let mut stream = response.bytes_stream();
        let mut stream_result: Result<()> = Ok(());
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = match chunk {
                Ok(c) => c,
                Err(e) => {
                    stream_result = Err(AppError::from(e).context("read remote object body"));
                    break;
                }
            };
            if store_tx.write(chunk.clone()).await.is_err() {
                // the storage side bailed out; its error surfaces below
                break;
            }
            if let Some(w) = &live {
                if let Err(e) = w.write(chunk).await {
                    stream_result = Err(AppError::Io(e).context("write to live reader"));
                    break;
                }
            }
        }
        drop(store_tx);

        let write_outcome = write_task.await.map_err(join_to_error)?;
        let outcome = match stream_result {
            Ok(()) => write_outcome.map_err(|e| {
                e.context(format!(
                    "storage write for asset asset_key={:?}",
                    asset.asset_key
                ))
            }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                asset.content_hash = outcome.content_hash;
                asset.size = outcome.size;
                Ok(())
            }
            Err(e) => {
                if let Some(w) = live.take() {
                    w.close_with_error(io::Error::other(e.to_string())).await;
                }
                Err(e)
            }
        }
    }

    fn extract_original_name(&self, content_disposition: &str, original_url: &str) -> String {
        if let Some(captures) = self.content_disposition_matcher.captures(content_disposition) {
            for group in captures.iter().skip(1).flatten() {
                if !group.as_str().is_empty() {
                    return group.as_str().to_string();
                }
            }
        }
        if let Ok(url) = reqwest::Url::parse(original_url) {
            if let Some(name) = url.path().rsplit('/').next().filter(|s| !s.is_empty()) {
                return name.to_string();
            }
        }
        String::new()
    }
}

fn header_str(value: Option<&reqwest::header::HeaderValue>) -> String {
    value
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn check_length_limit(content_length: i64, limit: i64, flag: &str) -> Result<()> {
    if limit <= 0 {
        return Ok(());
    }
    if content_length < 0 {
        return Err(AppError::BadRequest(format!(
            "remote size is unknown while the limit is enabled ({flag}={limit})"
        )));
    }
    if content_length > limit {
        return Err(AppError::SizeExceeded {
            size: content_length,
            limit,
        });
    }
    Ok(())
}

/// Discard `range.from` bytes, then expose at most `range.length()` bytes.
/// Used for non-seekable live streams.
async fn skip_take(mut reader: BoxReader, range: HttpRange) -> Result<BoxReader> {
    if range.from > 0 {
        let mut head = (&mut reader).take(range.from as u64);
        let skipped = tokio::io::copy(&mut head, &mut tokio::io::sink()).await?;
        if skipped < range.from as u64 {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended before the requested offset",
            )));
        }
    }
    Ok(Box::pin(reader.take(range.length() as u64)))
}

/// Convert an unexpected panic in a public operation into an error.
async fn guarded<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            tracing::error!("recovered panic: {msg}");
            Err(AppError::Internal(msg))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn join_to_error(e: tokio::task::JoinError) -> AppError {
    if e.is_panic() {
        AppError::Internal(format!("background task panicked: {e}"))
    } else {
        AppError::Internal("background task cancelled".into())
    }
}
