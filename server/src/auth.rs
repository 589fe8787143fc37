//! Local UI authentication.
//!
//! Both authenticated entry points check the configured `auth.api_key`
//! through [`check_key`]: `/api/status` takes it as `Authorization: Bearer`,
//! the UI WebSocket as `?token=` since browsers cannot set headers on an
//! upgrade. Failures use the daemon's `{"error": kind}` shape.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No key supplied.
    Missing,
    /// Key supplied but wrong.
    Invalid,
}

impl AuthError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "auth_missing",
            Self::Invalid => "auth_invalid",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::Missing => StatusCode::UNAUTHORIZED,
            Self::Invalid => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.as_str() }))).into_response()
    }
}

/// Compare `provided` against the configured key.
///
/// The comparison touches every byte of `expected` whatever `provided`
/// looks like, so response timing does not leak the key or its length.
pub fn check_key(expected: &str, provided: Option<&str>) -> Result<(), AuthError> {
    let provided = provided.filter(|p| !p.is_empty()).ok_or(AuthError::Missing)?;
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    let mismatch = expected
        .iter()
        .enumerate()
        .fold(u8::from(expected.len() != provided.len()), |acc, (i, b)| {
            acc | (b ^ provided.get(i).copied().unwrap_or(!b))
        });
    if mismatch == 0 {
        Ok(())
    } else {
        Err(AuthError::Invalid)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Middleware guarding the REST routes.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match check_key(&state.config.auth.api_key, bearer_token(request.headers())) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::debug!("HTTP: rejected {} ({})", request.uri().path(), e.as_str());
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_check_key() {
        assert_eq!(check_key("test-key", Some("test-key")), Ok(()));
        assert_eq!(check_key("test-key", Some("test-kex")), Err(AuthError::Invalid));
        assert_eq!(check_key("test-key", Some("test-key-longer")), Err(AuthError::Invalid));
        assert_eq!(check_key("test-key", Some("test")), Err(AuthError::Invalid));
        assert_eq!(check_key("test-key", Some("")), Err(AuthError::Missing));
        assert_eq!(check_key("test-key", None), Err(AuthError::Missing));
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn test_error_response_status() {
        assert_eq!(AuthError::Missing.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Invalid.into_response().status(), StatusCode::FORBIDDEN);
    }
}
