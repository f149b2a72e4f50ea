//! Core types and error definitions for the maestro daemon.
//!
//! This crate provides the foundational types shared across all maestro crates:
//! the error taxonomy every engine reports through, and the agent identity
//! types (keys, backends, permission tiers, per-agent configuration).
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum covering every failure class.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`ErrorKind`] / [`ErrorReport`] — Stable, serializable error object shown to users.
//! - [`AgentKey`] — Logical agent name used to key pools and chains.
//! - [`BackendKind`] — Which backend family a worker subprocess wraps.
//! - [`Tier`] — Coarse permission level bounding what an invocation may do.
//! - [`AgentConfig`] — Per-agent settings editable through the config API.

/// Agent identity and configuration types.
pub mod agent;

pub use agent::{AgentConfig, AgentConfigPatch, AgentKey, AgentSpec, BackendKind, Tier};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for maestro.
///
/// Each variant maps onto one [`ErrorKind`]; callers that need to branch on
/// the failure class should use [`MaestroError::kind`] rather than matching
/// message text.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// Malformed, cyclic, or incomplete plan; rejected before anything runs.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A step, workflow, turn, or session budget was exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A worker subprocess failed to spawn, crashed, or returned garbage.
    #[error("Process error: {0}")]
    Process(String),

    /// A worker stayed busy past the hung timeout and was force-killed.
    #[error("Hung process: worker {worker_id} for agent '{agent}' busy for {busy_secs}s")]
    HungProcess {
        /// Agent key the worker belonged to.
        agent: String,
        /// Pool-assigned worker id.
        worker_id: String,
        /// How long the worker had been busy when it was killed.
        busy_secs: u64,
    },

    /// Delegation depth or cooldown limit violated.
    #[error("Loop prevention: {0}")]
    LoopPrevention(String),

    /// Every worker for the agent is busy and the pool is at capacity.
    #[error("Pool exhausted for agent '{agent}': all {size} worker(s) busy")]
    PoolExhausted {
        /// Agent key whose pool is full.
        agent: String,
        /// Configured pool size.
        size: usize,
    },

    /// A concurrent writer was detected on durable session state.
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// The permission gateway refused the action for the caller's tier.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The run was stopped by the user (e.g. `!stop`) or by shutdown.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The pool is shutting down or reloading and refuses new work.
    #[error("Pool closed: {0}")]
    PoolClosed(String),

    /// Configuration parsing or validation failure.
    #[error("Config error: {0}")]
    Config(String),

    /// Session lookup or persistence failure.
    #[error("Session error: {0}")]
    Session(String),

    /// The backend answered but reported an error for the request.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An outbound HTTP request failed (health probes, status calls).
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Stable classification of a [`MaestroError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before execution; never retried.
    Validation,
    /// Budget exceeded; partial results are preserved.
    Timeout,
    /// Worker-level failure; the worker is discarded.
    Process,
    /// Delegation limit hit; no side effects happened.
    LoopPrevention,
    /// Pool at capacity; caller decides whether to queue.
    PoolExhausted,
    /// Durable state overlap; flagged for manual inspection.
    StateCorruption,
    /// Tier gate refused the action.
    PermissionDenied,
    /// Stopped on request.
    Cancelled,
    /// Component not accepting work right now.
    Unavailable,
    /// Bad configuration.
    Config,
    /// Anything else (I/O, serialization, HTTP).
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Process => "process",
            ErrorKind::LoopPrevention => "loop_prevention",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::StateCorruption => "state_corruption",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl MaestroError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MaestroError::Validation(_) => ErrorKind::Validation,
            MaestroError::Timeout(_) => ErrorKind::Timeout,
            MaestroError::Process(_)
            | MaestroError::HungProcess { .. }
            | MaestroError::Agent(_) => ErrorKind::Process,
            MaestroError::LoopPrevention(_) => ErrorKind::LoopPrevention,
            MaestroError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            MaestroError::StateCorruption(_) => ErrorKind::StateCorruption,
            MaestroError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MaestroError::Cancelled(_) => ErrorKind::Cancelled,
            MaestroError::PoolClosed(_) => ErrorKind::Unavailable,
            MaestroError::Config(_) => ErrorKind::Config,
            MaestroError::Session(_)
            | MaestroError::Http(_)
            | MaestroError::Json(_)
            | MaestroError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether a higher-level planner may reasonably adapt and try again.
    ///
    /// Validation and loop-prevention failures are local and final; timeouts
    /// and process failures are surfaced to the conductor as feedback.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Process)
    }

    /// Build the user-visible error object for this error.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// The explicit error object surfaced to chat channels and conductors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl From<&MaestroError> for ErrorReport {
    fn from(err: &MaestroError) -> Self {
        err.report()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            MaestroError::Validation("cycle".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MaestroError::HungProcess {
                agent: "coder".into(),
                worker_id: "w1".into(),
                busy_secs: 900,
            }
            .kind(),
            ErrorKind::Process
        );
        assert_eq!(
            MaestroError::PoolClosed("reload".into()).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_retryable_only_for_timeout_and_process() {
        assert!(MaestroError::Timeout("step".into()).is_retryable());
        assert!(MaestroError::Process("spawn".into()).is_retryable());
        assert!(!MaestroError::LoopPrevention("depth".into()).is_retryable());
        assert!(!MaestroError::Validation("x".into()).is_retryable());
        assert!(!MaestroError::PoolExhausted {
            agent: "a".into(),
            size: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_report_serialization() {
        let err = MaestroError::LoopPrevention("chain depth 3 reached".into());
        let json = serde_json::to_value(err.report()).unwrap();
        assert_eq!(json["kind"], "loop_prevention");
        assert!(json["message"].as_str().unwrap().contains("depth 3"));
    }
}
