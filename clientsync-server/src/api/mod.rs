//! HTTP API handlers for clientsync-server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clientsync_common::Error;
use serde_json::json;

pub mod buildinfo;
pub mod claims;
pub mod clients;
pub mod health;
pub mod sse;

pub use buildinfo::get_build_info;
pub use claims::submit_claim;
pub use clients::group_clients;
pub use health::health_routes;
pub use sse::event_stream;

/// Handler error rendered as `{"error": message}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamClaim { status, .. } => status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .filter(|code| code.is_client_error() || code.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            Error::UpstreamClaim { message, .. } => message.clone(),
            Error::InvalidInput(message) => message.clone(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "Request failed: {}", message);
        }

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
