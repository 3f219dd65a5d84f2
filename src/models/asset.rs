use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::utils::qid::generate_qid;

/// Length of generated asset keys.
pub const ASSET_KEY_LEN: usize = 32;

/// Processing status of an asset. Only URL-sourced assets pass through the
/// non-terminal states; direct pushes are inserted as `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Processing,
    Done,
}

impl Default for AssetStatus {
    fn default() -> Self {
        AssetStatus::Pending
    }
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Processing => "processing",
            AssetStatus::Done => "done",
        };
        f.write_str(s)
    }
}

/// The indexed metadata record for one stored blob.
///
/// Timestamps are RFC 3339 strings; `mtime` is stamped on every update and
/// `dtime` marks logical deletion. `content_hash` stays empty until the
/// content is fully written, and `error` is non-empty only after a terminal
/// fetch failure.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub asset_key: String,
    pub btime: String,
    pub mtime: Option<String>,
    pub dtime: Option<String>,
    pub size: i64,
    pub content_hash: String,
    pub content_type: String,
    pub original_name: String,
    pub user_id: String,
    pub original_url: String,
    pub deleted: bool,
    pub storage_name: String,
    pub status: AssetStatus,
    pub info: String,
    pub error: String,
}

impl Asset {
    pub fn generate_asset_key(&mut self) {
        self.asset_key = generate_qid(ASSET_KEY_LEN);
    }

    /// Whether the asset reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.status == AssetStatus::Done
    }
}

/// Caller-supplied fields for a direct push.
#[derive(Debug, Clone, Default)]
pub struct StoreExtra {
    pub content_type: String,
    pub original_name: String,
    pub user_id: String,
    pub original_url: String,
    pub info: String,
}
