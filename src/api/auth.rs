//! Static bearer-token authentication.
//!
//! There are no user accounts or sessions in this service: a single admin
//! token from configuration is compared, in constant time, against the
//! caller-supplied credential. On success the configured `ownerId` is
//! attached to the request so downstream handlers can scope queries and
//! quota checks to it.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::AppState;

/// The `ownerId` attributed to an authenticated request, stored in
/// request extensions by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthenticatedOwner(pub String);

fn extract_token(request: &Request<Body>) -> Option<String> {
    if let Some(header) = request.headers().get("Authorization").and_then(|h| h.to_str().ok()) {
        return Some(
            header
                .strip_prefix("Bearer ")
                .unwrap_or(header)
                .to_string(),
        );
    }

    if let Some(api_key) = request.headers().get("X-API-Key").and_then(|h| h.to_str().ok()) {
        return Some(api_key.to_string());
    }

    // EventSource/SSE clients can't set custom headers, so the stream
    // endpoint also accepts the token as a query parameter.
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next()?;
            (key == "token").then(|| value.to_string())
        })
    })
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_token(&request).ok_or(StatusCode::UNAUTHORIZED)?;

    let admin_token = state.config.auth.admin_token.as_bytes();
    let provided = token.as_bytes();

    let matches = admin_token.len() == provided.len() && admin_token.ct_eq(provided).into();
    if !matches {
        return Err(StatusCode::UNAUTHORIZED);
    }

    request
        .extensions_mut()
        .insert(AuthenticatedOwner(state.config.auth.owner_id.clone()));

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let request = Request::builder()
            .uri("/api/previews")
            .header("Authorization", "Bearer secret123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request), Some("secret123".to_string()));
    }

    #[test]
    fn extracts_api_key_header() {
        let request = Request::builder()
            .uri("/api/previews")
            .header("X-API-Key", "secret123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request), Some("secret123".to_string()));
    }

    #[test]
    fn extracts_query_token_for_sse() {
        let request = Request::builder()
            .uri("/api/previews/pr-1/logs/stream?token=secret123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request), Some("secret123".to_string()));
    }

    #[test]
    fn no_credential_yields_none() {
        let request = Request::builder().uri("/api/previews").body(Body::empty()).unwrap();
        assert_eq!(extract_token(&request), None);
    }
}
