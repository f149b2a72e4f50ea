use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use maestro_core::{ErrorKind, ErrorReport, MaestroError};

/// Error returned by a handler, rendered as an [`ErrorReport`] body.
#[derive(Debug)]
pub enum ApiError {
    /// Unknown resource (404).
    NotFound(String),
    /// Any engine error, mapped by its kind.
    Maestro(MaestroError),
}

impl From<MaestroError> for ApiError {
    fn from(e: MaestroError) -> Self {
        ApiError::Maestro(e)
    }
}

/// HTTP status for an error class.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::LoopPrevention | ErrorKind::StateCorruption => StatusCode::CONFLICT,
        ErrorKind::PoolExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Process => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "kind": "not_found", "message": message })),
            )
                .into_response(),
            ApiError::Maestro(e) => {
                let report: ErrorReport = e.report();
                (status_for(report.kind), Json(report)).into_response()
            }
        }
    }
}
