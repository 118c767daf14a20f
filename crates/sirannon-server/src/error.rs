//! Aggregate error type for the HTTP/WebSocket front end, with an
//! [`IntoResponse`] impl that renders the same `{code, message}` shape the
//! wire protocol uses for in-band errors.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] sirannon_core::Error),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Core(e) => e.code(),
            Error::UnknownDatabase(_) => "UNKNOWN_DATABASE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::UnknownDatabase(_) => StatusCode::NOT_FOUND,
            Error::Config(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Core(sirannon_core::Error::UnknownDatabase(_)) => StatusCode::NOT_FOUND,
            Error::Core(sirannon_core::Error::DatabaseClosed(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Core(sirannon_core::Error::Hook(_)) => StatusCode::FORBIDDEN,
            Error::Core(sirannon_core::Error::Transport(_)) => StatusCode::BAD_REQUEST,
            Error::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
