// ── Gateway error types ──
//
// Every failure a proxied client can observe. Upstream trouble becomes a
// gateway status on the wire; it is never an internal fault.

use std::net::SocketAddr;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use sdcp_core::CoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind the {surface} surface on {addr}: {source}")]
    Bind {
        surface: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("No printers registered")]
    NoPrinters,

    #[error("Unknown printer: {id}")]
    UnknownPrinter { id: String },

    #[error("Upstream printer {device} unavailable: {reason}")]
    Upstream { device: String, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn upstream(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Upstream {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoPrinters => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownPrinter { .. } => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Core(err) => core_status(err),
            Self::Bind { .. } | Self::Client(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn core_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CoreError::ConnectionFailed { .. }
        | CoreError::ConnectionLost { .. }
        | CoreError::TooManyClients
        | CoreError::RegistrationRejected { .. } => StatusCode::BAD_GATEWAY,
        CoreError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Unsupported { .. } | CoreError::Config { .. } => StatusCode::BAD_REQUEST,
        CoreError::DeviceNotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Malformed { .. } | CoreError::Discovery { .. } | CoreError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Upstream { device, .. } => {
                json!({ "error": "upstream unavailable", "device": device })
            }
            Self::UnknownPrinter { id } => json!({ "error": "unknown printer", "device": id }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
