use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Kind of a registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Plain reply to a chat message.
    Direct,
    /// `DELEGATE::` directives.
    Delegation,
    /// Workflow plan.
    Workflow,
    /// Council plan.
    Council,
    /// `!ultrawork` session.
    UltraWork,
}

/// Public view of a registered run.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    /// Registry-assigned id.
    pub id: u64,
    /// Channel that started the run.
    pub origin: String,
    /// Engine running it.
    pub kind: RunKind,
    /// Registration time.
    pub started_at: DateTime<Utc>,
}

struct RunEntry {
    info: ActiveRun,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    runs: Mutex<HashMap<u64, RunEntry>>,
    next_id: AtomicU64,
}

/// Registry of in-flight runs keyed by origin, used to honour `!stop`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

/// Registration of one run. Dropping it removes the run from the registry.
pub struct RunGuard {
    inner: Arc<Inner>,
    id: u64,
    cancel: CancellationToken,
}

impl RunGuard {
    /// Token that fires when the run's origin is stopped.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registry id of this run.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.runs.lock().remove(&self.id);
    }
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run under `origin`. The returned token is a child of
    /// `parent`, so stopping either cancels the run.
    pub fn register(&self, origin: &str, kind: RunKind, parent: &CancellationToken) -> RunGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = parent.child_token();
        self.inner.runs.lock().insert(
            id,
            RunEntry {
                info: ActiveRun {
                    id,
                    origin: origin.to_string(),
                    kind,
                    started_at: Utc::now(),
                },
                cancel: cancel.clone(),
            },
        );
        RunGuard {
            inner: self.inner.clone(),
            id,
            cancel,
        }
    }

    /// Cancel every run started from `origin`. Returns how many were stopped.
    pub fn stop_origin(&self, origin: &str) -> usize {
        let runs = self.inner.runs.lock();
        let mut stopped = 0;
        for entry in runs.values().filter(|e| e.info.origin == origin) {
            if !entry.cancel.is_cancelled() {
                entry.cancel.cancel();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(origin, stopped, "runs stopped");
        }
        stopped
    }

    /// Runs currently registered, oldest first.
    pub fn active(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self
            .inner
            .runs
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        runs.sort_by_key(|r| r.id);
        runs
    }
}

/// Whether a chat message is the stop command.
pub fn is_stop_command(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("!stop")
}
