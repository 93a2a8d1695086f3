//! Optional auth token middleware.
//!
//! When `--auth-token` is configured, requests to `/ws` and `/status` must
//! include `Authorization: Bearer <token>` (or `?token=<token>` for WebSocket).
//! The `/health` endpoint remains unauthenticated.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

/// Axum middleware that checks for a valid auth token.
/// Skips authentication for the `/health` endpoint.
pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" || is_authorized(&req, &expected_token) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.request.rejected",
        path = %req.uri().path(),
        "Missing or invalid auth token"
    );
    Err(StatusCode::UNAUTHORIZED)
}

fn is_authorized<B>(req: &Request<B>, expected_token: &str) -> bool {
    // Check Authorization header first
    let header_token = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if header_token == Some(expected_token) {
        return true;
    }

    // Then ?token= (browsers cannot set headers on WebSocket upgrades)
    req.uri()
        .query()
        .map(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.strip_prefix("token="))
                .any(|token| token == expected_token)
        })
        .unwrap_or(false)
}
