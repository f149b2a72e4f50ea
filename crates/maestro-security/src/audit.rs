use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Session, chain, or workflow the action belongs to.
    pub scope: String,
    /// Short action name (`authorize`, `delegate`, `hung_kill`, ...).
    pub action: String,
    /// Agent that performed or requested the action.
    pub agent: Option<String>,
    /// Free-form structured details.
    pub details: serde_json::Value,
    /// Result of the action.
    pub outcome: AuditOutcome,
}

/// Result recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Action proceeded.
    Success,
    /// Action was refused by a policy.
    Denied,
    /// Action was attempted and failed.
    Error,
}

/// Append-only audit log that records permission decisions and safety events.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that writes entries to
    /// `<log_dir>/audit.jsonl` in arrival order.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "audit dir unavailable");
                return;
            }
            let log_file = log_dir.join("audit.jsonl");

            while let Some(entry) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&entry) else {
                    continue;
                };
                line.push('\n');
                let written = async {
                    let mut f = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&log_file)
                        .await?;
                    f.write_all(line.as_bytes()).await?;
                    f.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(error = %e, "failed to append audit entry");
                }
            }
        });

        Self { tx }
    }

    /// A log that only emits tracing events and keeps nothing on disk.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel::<AuditEntry>();
        Self { tx }
    }

    /// Record an entry.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            scope = %entry.scope,
            action = %entry.action,
            agent = entry.agent.as_deref().unwrap_or("-"),
            outcome = ?entry.outcome,
            "audit"
        );
        let _ = self.tx.send(entry);
    }

    /// Convenience wrapper around [`AuditLog::log`].
    pub fn log_action(
        &self,
        scope: impl Into<String>,
        action: impl Into<String>,
        agent: Option<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            scope: scope.into(),
            action: action.into(),
            agent,
            details,
            outcome,
        });
    }
}
