use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use shellgate_core::ShellgateError;
use tracing::error;

/// Failure of one API call, rendered as `{error, code}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Core(ShellgateError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Core(err) => match err {
                ShellgateError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                ShellgateError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                ShellgateError::HelperUnavailable(_) | ShellgateError::PoolExhausted { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ShellgateError::SessionLimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
                ShellgateError::SpawnFailed { .. }
                | ShellgateError::Io(_)
                | ShellgateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::Core(err) => err.to_string(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Core(err) => err.error_code(),
        }
    }
}

impl From<ShellgateError> for ApiError {
    fn from(err: ShellgateError) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.message());
        }
        let body = ErrorBody {
            error: self.message(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
