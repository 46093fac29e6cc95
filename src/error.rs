use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDateTime;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::ApiResponse;

/// A timestamp string that no accepted format could read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unparseable timestamp {0:?}")]
pub struct TimestampError(pub String);

/// Bad event shape, rejected at the boundary before anything is appended.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("count must be a positive integer, got {0}")]
    NonPositiveCount(i64),

    #[error("count {0} is too large for a single event")]
    CountTooLarge(i64),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    #[error("timestamp {got} is earlier than the last recorded event at {last}")]
    OutOfOrder {
        got: NaiveDateTime,
        last: NaiveDateTime,
    },

    #[error("live mode is off; events are only accepted during a live session")]
    NotLive,

    #[error("invalid query parameter {name}: {value:?}")]
    Query { name: &'static str, value: String },
}

/// A persisted record that could not be turned back into an event.
/// Readers skip the record and keep going.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed event record #{index}: {reason}")]
pub struct MalformedEventError {
    pub index: usize,
    pub reason: String,
}

/// I/O or encoding failure against durable state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Raised by non-file backends.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Everything the dashboard surfaces to the delivery layer.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("no entries to undo")]
    NothingToUndo,
}

impl DashboardError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DashboardError::Validation(ValidationError::NotLive) => StatusCode::CONFLICT,
            DashboardError::Validation(_) | DashboardError::NothingToUndo => {
                StatusCode::BAD_REQUEST
            }
            DashboardError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ApiResponse {
            status: "error".to_string(),
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}
