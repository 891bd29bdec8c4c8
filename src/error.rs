use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::api::ErrorResponse;
use crate::model::BookmarkId;

/// Malformed user input. Never reaches the store.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("title required")]
    TitleRequired,
    #[error("title too long")]
    TitleTooLong,
    #[error("url required")]
    UrlRequired,
    #[error("url invalid")]
    UrlInvalid,
    #[error("unsupported scheme")]
    UnsupportedScheme,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid or expired session")]
    InvalidSession,
    #[error("session exchange rejected")]
    ExchangeRejected,
    #[error("identity provider failure")]
    Provider(#[source] anyhow::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingToken | AuthError::InvalidSession => StatusCode::UNAUTHORIZED,
            AuthError::ExchangeRejected => StatusCode::FORBIDDEN,
            AuthError::Provider(ref e) => {
                tracing::error!(error = %crate::unpack_error(&**e), "identity provider failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// The record store rejected or failed a request.
#[derive(Debug, Error)]
#[error("persistence failure")]
pub struct PersistenceError(#[from] anyhow::Error);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("{0} is closed")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    Insert,
    Delete,
}

impl fmt::Display for PersistOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistOp::Insert => write!(f, "insert"),
            PersistOp::Delete => write!(f, "delete"),
        }
    }
}

/// Reported by a sync session on its error channel. The optimistic state
/// change that triggered a failed persist stays applied.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to persist {op} of bookmark {id}")]
    Persist {
        op: PersistOp,
        id: BookmarkId,
        #[source]
        source: PersistenceError,
    },
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}
