pub mod dir;

pub use dir::*;

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::utils::range::HttpRange;

/// Boxed byte stream handed across the storage boundary.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Result of a completed store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// A blob with the same content hash was already present.
    pub exists: bool,
    pub content_hash: String,
    pub size: i64,
}

/// Content-addressed blob storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream `reader` to storage, returning the content hash and final size.
    /// `max_size > 0` bounds the accepted byte count.
    async fn write(&self, reader: BoxReader, max_size: i64) -> Result<WriteOutcome>;

    /// Open a blob for reading. `range` must already be normalized against
    /// the blob size.
    async fn open_read(&self, content_hash: &str, range: Option<HttpRange>) -> Result<BoxReader>;

    /// Existence check without opening the blob.
    async fn check(&self, content_hash: &str) -> Result<bool>;
}
