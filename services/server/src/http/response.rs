//! Error-to-HTTP translation.
//!
//! Handlers return `Result<Json<T>, ServerError>`; the taxonomy decides the
//! status code and wire error code, and internal detail never leaves the
//! process.

use crate::error::ServerError;
use arena_protocol::HttpErrorEnvelope;
use axum::Json;
use axum::response::{IntoResponse, Response};
use tracing::error;

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(self, ServerError::Db(_) | ServerError::Internal(_)) {
            error!(error = %self, "request failed");
        }
        (
            self.http_status(),
            Json(HttpErrorEnvelope {
                code: self.code().to_owned(),
                message: self.client_message(),
            }),
        )
            .into_response()
    }
}
