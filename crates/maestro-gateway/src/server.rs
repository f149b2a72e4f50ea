use crate::handlers;
use crate::middleware::{auth_middleware, rate_limit_middleware, AuthConfig, MiddlewareState};
use axum::middleware as axum_mw;
use axum::routing::{get, post, put};
use axum::Router;
use chrono::{DateTime, Utc};
use maestro_orchestrator::{AgentMonitor, Orchestrator};
use maestro_pool::PoolRegistry;
use maestro_security::RateLimiter;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    /// Message dispatcher.
    pub orchestrator: Arc<Orchestrator>,
    /// Worker pools and the agent table.
    pub registry: Arc<PoolRegistry>,
    /// Per-agent activity.
    pub monitor: AgentMonitor,
    /// Daemon start time, for uptime.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// State stamped with the current time.
    pub fn new(orchestrator: Arc<Orchestrator>, registry: Arc<PoolRegistry>, monitor: AgentMonitor) -> Self {
        Self {
            orchestrator,
            registry,
            monitor,
            started_at: Utc::now(),
        }
    }
}

/// The HTTP gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth or rate limiting.
    pub fn build(state: Arc<AppState>) -> Router {
        Self::build_with_middleware(state, None, AuthConfig::default())
    }

    /// Build the gateway with optional rate limiting and auth middleware.
    pub fn build_with_middleware(
        state: Arc<AppState>,
        rate_limiter: Option<Arc<RateLimiter<String>>>,
        auth_config: AuthConfig,
    ) -> Router {
        let app = Router::new()
            .route("/health", get(handlers::health))
            .route("/api/multi-agent/agents", get(handlers::list_agents))
            .route("/api/multi-agent/agents/{agent_id}", put(handlers::update_agent))
            .route("/api/sessions/{origin}/stop", post(handlers::stop_origin))
            .route("/api/messages", post(handlers::post_message))
            .with_state(state);

        if rate_limiter.is_none() && !auth_config.is_enabled() {
            return app;
        }
        let mw_state = Arc::new(MiddlewareState {
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new(1000.0, 1000.0))),
            auth: auth_config,
        });
        // The last layer runs first: auth before rate limiting.
        app.layer(axum_mw::from_fn_with_state(mw_state.clone(), rate_limit_middleware))
            .layer(axum_mw::from_fn_with_state(mw_state, auth_middleware))
    }
}
