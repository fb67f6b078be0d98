use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;
use trellis_core::CollabError;

/// Error body: `{"error": <code>, "message": <text>}`.
#[derive(Debug)]
pub enum ApiError {
    Core(CollabError),
    /// Identity header missing on an endpoint that acts on behalf of a caller.
    Unauthenticated,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Core(err) => match err {
                CollabError::NotFound { .. } => StatusCode::NOT_FOUND,
                CollabError::PreconditionFailed { .. } | CollabError::LeaseExpired { .. } => {
                    StatusCode::PRECONDITION_FAILED
                }
                CollabError::PreconditionRequired => StatusCode::PRECONDITION_REQUIRED,
                CollabError::LeaseHeld { .. }
                | CollabError::LeaseStillLive { .. }
                | CollabError::AlreadyExists { .. } => StatusCode::CONFLICT,
                CollabError::NotHolder { .. } => StatusCode::FORBIDDEN,
                CollabError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                CollabError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                CollabError::DirLocked { .. }
                | CollabError::StorageUnavailable(_)
                | CollabError::Serialization(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Core(err) => err.code(),
        }
    }
}

impl From<CollabError> for ApiError {
    fn from(err: CollabError) -> Self {
        Self::Core(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Core(CollabError::InvalidArgument(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Unauthenticated => {
                format!("the {} header is required", super::caller::ACTOR_HEADER)
            }
            Self::Core(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(code = self.code(), %message, "request failed");
        }
        (status, Json(json!({"error": self.code(), "message": message}))).into_response()
    }
}
