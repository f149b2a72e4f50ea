use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    /// No call in flight.
    Idle,
    /// At least one call in flight.
    Working,
    /// Last call failed.
    Error,
}

/// Counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Calls started.
    pub invocations: u64,
    /// Calls that failed.
    pub errors: u64,
    /// Total time spent in calls.
    pub duration_ms: u64,
}

/// Live state of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent or pool key.
    pub agent: String,
    /// Idle, busy or error.
    pub status: AgentActivity,
    /// Scope of the call in flight, if any.
    pub current_task: Option<String>,
    /// Calls currently in flight.
    pub in_flight: u32,
    /// Lifetime counters.
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            status: AgentActivity::Idle,
            current_task: None,
            in_flight: 0,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks state and metrics for every agent that has been invoked.
///
/// Entries are created on first use, so ephemeral workflow agents show up
/// under their pool key alongside configured agents.
#[derive(Clone, Default)]
pub struct AgentMonitor {
    states: Arc<RwLock<BTreeMap<String, AgentState>>>,
}

impl AgentMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an agent as working on `task`.
    pub async fn start(&self, agent: &str, task: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.to_string())
            .or_insert_with(|| AgentState::new(agent));
        state.in_flight += 1;
        state.current_task = Some(task.to_string());
        state.status = AgentActivity::Working;
    }

    /// Record the end of a call.
    pub async fn finish(&self, agent: &str, duration_ms: u64, ok: bool) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.to_string())
            .or_insert_with(|| AgentState::new(agent));
        state.in_flight = state.in_flight.saturating_sub(1);
        state.metrics.invocations += 1;
        state.metrics.duration_ms += duration_ms;
        if !ok {
            state.metrics.errors += 1;
        }
        if state.in_flight == 0 {
            state.current_task = None;
            state.status = if ok {
                AgentActivity::Idle
            } else {
                AgentActivity::Error
            };
        }
    }

    /// Get a snapshot of all agent states, sorted by agent.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        self.states.read().await.values().cloned().collect()
    }

    /// Get the state of a specific agent.
    pub async fn get_state(&self, agent: &str) -> Option<AgentState> {
        self.states.read().await.get(agent).cloned()
    }

    /// Get aggregate metrics across all agents.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.invocations += state.metrics.invocations;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON (for `/health` details).
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_finish() {
        let monitor = AgentMonitor::new();
        monitor.start("coder", "wf-1/a").await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, AgentActivity::Working);
        assert_eq!(state.current_task.as_deref(), Some("wf-1/a"));

        monitor.finish("coder", 120, true).await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, AgentActivity::Idle);
        assert!(state.current_task.is_none());
        assert_eq!(state.metrics.invocations, 1);
        assert_eq!(state.metrics.duration_ms, 120);
    }

    #[tokio::test]
    async fn test_overlapping_calls_stay_working() {
        let monitor = AgentMonitor::new();
        monitor.start("coder", "a").await;
        monitor.start("coder", "b").await;
        monitor.finish("coder", 10, true).await;
        assert_eq!(
            monitor.get_state("coder").await.unwrap().status,
            AgentActivity::Working
        );
        monitor.finish("coder", 10, false).await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, AgentActivity::Error);
        assert_eq!(state.metrics.errors, 1);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = AgentMonitor::new();
        monitor.start("a", "x").await;
        monitor.finish("a", 5, true).await;
        monitor.start("b", "y").await;
        monitor.finish("b", 7, false).await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.invocations, 2);
        assert_eq!(agg.errors, 1);
        assert_eq!(agg.duration_ms, 12);

        let json = monitor.to_json().await;
        assert_eq!(json["agents"].as_array().unwrap().len(), 2);
        assert_eq!(json["aggregate"]["invocations"], 2);
    }
}
