//! Request identity and precondition headers.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::IF_MATCH;
use axum::http::request::Parts;
use trellis_core::CollabError;
use trellis_core::domain::ETag;

use super::error::ApiError;

/// Set by the fronting identity provider.
pub const ACTOR_HEADER: &str = "x-trellis-actor";

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from(&parts.headers)
            .map(Caller)
            .ok_or(ApiError::Unauthenticated)
    }
}

pub fn actor_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `If-Match`, with surrounding quotes stripped. Missing is `PreconditionRequired`.
pub fn if_match(headers: &HeaderMap) -> Result<ETag, ApiError> {
    let value = headers
        .get(IF_MATCH)
        .ok_or(CollabError::PreconditionRequired)?
        .to_str()
        .map_err(|_| CollabError::InvalidArgument("If-Match is not valid ASCII".into()))?
        .trim();
    let value = value.strip_prefix("W/").unwrap_or(value).trim_matches('"');
    if value.is_empty() {
        return Err(CollabError::PreconditionRequired.into());
    }
    Ok(ETag::new(value))
}
