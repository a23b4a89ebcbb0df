//! HTTP rendering of service errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use octopolicy_core::Error;

/// Service error rendered as `{"id", "kind", "message"}` with the status
/// mapped from its kind.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error_id = %self.0.id(), kind = %self.0.kind(), error = %self.0, "Request failed");
        } else {
            tracing::debug!(error_id = %self.0.id(), kind = %self.0.kind(), error = %self.0, "Request rejected");
        }
        (status, Json(self.0)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
