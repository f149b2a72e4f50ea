//! HTTP gateway for the maestro daemon.
//!
//! Serves the health endpoint the watchdog polls, the multi-agent config API
//! (whose writes trigger a pool hot reload), session stop control and a
//! plain message endpoint in front of the [`maestro_orchestrator::Orchestrator`].

/// Error responses.
pub mod error;
/// Route handlers.
pub mod handlers;
/// API-key auth and rate limiting.
pub mod middleware;
/// Router construction and shared state.
pub mod server;

pub use error::ApiError;
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
