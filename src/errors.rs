use crate::services::engine::TransferError;
use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub headers: HeaderMap,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Attach a response header. Values that are not valid header text are
    /// dropped.
    pub fn with_header(mut self, name: header::HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, self.headers, body).into_response()
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let status = match &err {
            TransferError::FileNotFound(_)
            | TransferError::ShardNotFound(_)
            | TransferError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            TransferError::NotReady { .. } | TransferError::AlreadyCompleted(_) => {
                StatusCode::CONFLICT
            }
            TransferError::InvalidRequest(_) | TransferError::Source(_) => StatusCode::BAD_REQUEST,
            TransferError::RangeNotSatisfiable { total_size, .. } => {
                let total = format!("bytes */{total_size}");
                return AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, err.to_string())
                    .with_header(header::CONTENT_RANGE, &total);
            }
            TransferError::Remote(_) => StatusCode::BAD_GATEWAY,
            TransferError::LedgerInconsistency(_)
            | TransferError::Sqlx(_)
            | TransferError::Io(_)
            | TransferError::Aborted => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError::new(status, err.to_string())
    }
}
