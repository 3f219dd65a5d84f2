use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::utils::range::RangeError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Range(#[from] RangeError),

    /// The client should retry against `url` directly: either the URL was
    /// rejected before a fetch could start, or the asset is still being
    /// fetched from it.
    #[error("see {url}")]
    SeeUrl { url: String },

    #[error("size {size} exceeds limit {limit}")]
    SizeExceeded { size: i64, limit: i64 },

    #[error("upstream http status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Context(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wrap with a message describing the failed operation, preserving the
    /// kinds the HTTP layer must recover by inspection.
    pub fn context(self, msg: impl std::fmt::Display) -> AppError {
        match self {
            AppError::SeeUrl { .. } | AppError::Range(_) => self,
            other => AppError::Context(format!("{msg}: {other}")),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

/// JSON envelope used by every non-binary response.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub res: Option<T>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(res: T) -> Self {
        Self {
            res: Some(res),
            err: String::new(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: &str) -> Self {
        Self {
            res: None,
            err: message.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::SeeUrl { url } => {
                return (
                    StatusCode::TEMPORARY_REDIRECT,
                    [(header::LOCATION, url.clone())],
                )
                    .into_response();
            }
            AppError::Range(e) => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    Json(ApiResponse::error(&e.to_string())),
                )
                    .into_response();
            }
            AppError::Database(e) => {
                tracing::error!("database error: {e:?}");
            }
            AppError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
            }
            _ => {}
        }

        (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(&self.to_string())),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_recoverable_kinds() {
        let err = AppError::SeeUrl {
            url: "http://example.com/a".into(),
        }
        .context("unable to store by original url");
        assert!(matches!(err, AppError::SeeUrl { .. }));

        let err = AppError::NotFound("row not found".into()).context("query asset");
        assert!(err.to_string().starts_with("query asset:"));
    }

    #[test]
    fn envelope_omits_empty_error() {
        let json = serde_json::to_string(&ApiResponse::ok(1)).unwrap();
        assert_eq!(json, r#"{"res":1}"#);

        let json = serde_json::to_string(&ApiResponse::error("boom")).unwrap();
        assert_eq!(json, r#"{"res":null,"err":"boom"}"#);
    }
}
