use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use maestro_core::{AgentConfig, AgentConfigPatch, AgentKey, MaestroError};
use maestro_security::{validate_identifier, SanitizeResult, Sanitizer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// `GET /health`: liveness plus pool and agent activity.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "service": "maestro",
        "uptime_secs": uptime,
        "config_generation": state.registry.generation().await,
        "agents": state.monitor.to_json().await,
        "workers": state.registry.snapshot().await,
        "active_runs": state.orchestrator.sessions().active(),
    }))
}

/// `GET /api/multi-agent/agents`
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentConfig>> {
    Json(state.registry.agents().await)
}

/// `PUT /api/multi-agent/agents/{agent_id}`: patch one agent and hot-reload
/// the pools.
pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(patch): Json<AgentConfigPatch>,
) -> Result<Json<AgentConfig>, ApiError> {
    validate_identifier(&agent_id)?;
    let key = AgentKey::new(agent_id);
    if state.registry.agent(&key).await.is_none() {
        return Err(ApiError::NotFound(format!("unknown agent '{key}'")));
    }
    let updated = state.registry.update_agent(&key, &patch).await?;
    info!(agent = %key, tier = %updated.tier, enabled = updated.enabled, "agent updated via API");
    Ok(Json(updated))
}

/// Body of the stop endpoint reply.
#[derive(Debug, Serialize)]
pub struct StopResponse {
    /// Origin that was stopped.
    pub origin: String,
    /// Runs cancelled.
    pub stopped: usize,
}

/// `POST /api/sessions/{origin}/stop`
pub async fn stop_origin(
    State(state): State<Arc<AppState>>,
    Path(origin): Path<String>,
) -> Json<StopResponse> {
    let stopped = state.orchestrator.stop(&origin);
    Json(StopResponse { origin, stopped })
}

/// Chat message posted to the daemon.
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    /// Channel the message came from; `!stop` applies to it.
    pub origin: String,
    /// Agent the message is addressed to.
    pub agent: String,
    /// Message text.
    pub content: String,
}

/// `POST /api/messages`: hand a chat message to the orchestrator.
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<InboundMessage>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let content = match Sanitizer::default().sanitize(&msg.content) {
        SanitizeResult::Rejected(reason) => {
            warn!(origin = %msg.origin, reason = %reason, "rejected message");
            return Err(MaestroError::Validation(format!("message rejected: {reason}")).into());
        }
        other => other.into_string().unwrap_or_default(),
    };
    validate_identifier(&msg.agent)?;
    let agent = AgentKey::new(msg.agent);
    let outcome = state
        .orchestrator
        .handle_message(&msg.origin, &agent, &content, None)
        .await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "reply": outcome.render(),
            "outcome": outcome,
        })),
    ))
}
