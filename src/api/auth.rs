use axum::{extract::Request, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    let value = req.headers().get("authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|t| t.to_string())
}

/// Extract a `?token=` value from the query string. Browsers cannot set
/// headers on a WebSocket handshake, so sockets authenticate this way.
fn extract_query_token(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(|v| v.to_string()))
    })
}

/// Auth middleware function.
///
/// Accepts the bearer token from the Authorization header, falling back to
/// the `token` query parameter. A header with the wrong token is rejected
/// outright rather than falling through to the query.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = expected_token.as_bytes();
    if let Some(ref token) = extract_bearer(&req) {
        if token.as_bytes().ct_eq(expected).into() {
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    if let Some(ref token) = extract_query_token(&req) {
        if token.as_bytes().ct_eq(expected).into() {
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    Err(ApiError::AuthRequired)
}
