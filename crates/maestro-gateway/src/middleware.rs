use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use maestro_security::RateLimiter;
use std::sync::Arc;
use tracing::warn;

/// Auth configuration for the gateway.
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// API keys that are allowed to connect. Empty = no auth required.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Auth over the given keys.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

/// Shared middleware state.
#[derive(Clone)]
pub struct MiddlewareState {
    /// Per-caller token buckets.
    pub rate_limiter: Arc<RateLimiter<String>>,
    /// Accepted API keys.
    pub auth: AuthConfig,
}

/// `?api_key=` query parameter.
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// Key passed in the query string.
    pub api_key: Option<String>,
}

fn presented_key(headers: &HeaderMap, query: &AuthQuery) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.api_key.clone())
}

/// Validates `Authorization: Bearer <key>` or `?api_key=<key>`.
///
/// `/health` stays open so the watchdog can probe without credentials.
pub async fn auth_middleware(
    State(state): State<Arc<MiddlewareState>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !state.auth.is_enabled() || request.uri().path() == "/health" {
        return next.run(request).await;
    }

    match presented_key(&headers, &query) {
        Some(k) if state.auth.api_keys.contains(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "rejected request: invalid API key");
            (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

/// Token-bucket limit per presented API key (anonymous callers share one bucket).
pub async fn rate_limit_middleware(
    State(state): State<Arc<MiddlewareState>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    let caller = presented_key(&headers, &query).unwrap_or_else(|| "anonymous".to_string());
    if !state.rate_limiter.check(&caller).await {
        warn!(path = %request.uri().path(), "rate limited request");
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }
    next.run(request).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_disabled() {
        assert!(!AuthConfig::new(vec![]).is_enabled());
    }

    #[test]
    fn test_bearer_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        let query = AuthQuery {
            api_key: Some("xyz".into()),
        };
        assert_eq!(presented_key(&headers, &query).as_deref(), Some("abc"));
        assert_eq!(
            presented_key(&HeaderMap::new(), &query).as_deref(),
            Some("xyz")
        );
    }
}
