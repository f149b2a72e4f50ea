use crate::protocol::AgentCall;
use crate::worker::{WorkerProcess, WorkerSpawner};
use futures_util::future::join_all;
use maestro_core::{AgentKey, AgentSpec, BackendKind, MaestroError, MaestroResult};
use maestro_security::{AuditLog, AuditOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of a pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for a lease.
    Idle,
    /// Leased to a caller.
    Busy,
    /// Busy past the hung timeout, being killed.
    Hung,
    /// Gone.
    Terminated,
}

/// Timing and sizing knobs for an [`AgentPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers per agent key when the agent does not set its own.
    pub default_pool_size: usize,
    /// Idle workers older than this are evicted.
    pub idle_timeout: Duration,
    /// Busy workers older than this are force-killed.
    pub hung_timeout: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_pool_size: 1,
            idle_timeout: Duration::from_secs(5 * 60),
            hung_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    /// Pool-unique worker id.
    pub id: String,
    /// Agent the worker serves.
    pub agent: AgentKey,
    /// Backend the worker runs.
    pub backend: BackendKind,
    /// OS pid.
    pub pid: Option<u32>,
    /// Current status.
    pub status: WorkerStatus,
    /// Seconds since spawn.
    pub age_secs: u64,
    /// Seconds since last release (or spawn).
    pub idle_secs: u64,
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Idle workers evicted.
    pub idle_evicted: usize,
    /// Busy workers killed as hung.
    pub hung_killed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Hung { busy_secs: u64 },
    Shutdown,
    Discarded,
}

struct WorkerHandle {
    id: String,
    key: AgentKey,
    process: Arc<dyn WorkerProcess>,
    killed: CancellationToken,
    kill_reason: Mutex<Option<KillReason>>,
}

impl WorkerHandle {
    fn kill(&self, reason: KillReason) {
        {
            let mut current = self.kill_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.killed.cancel();
    }

    fn kill_error(&self) -> MaestroError {
        match *self.kill_reason.lock() {
            Some(KillReason::Hung { busy_secs }) => MaestroError::HungProcess {
                agent: self.key.to_string(),
                worker_id: self.id.clone(),
                busy_secs,
            },
            Some(KillReason::Shutdown) => {
                MaestroError::PoolClosed(format!("worker {} was shut down mid-call", self.id))
            }
            Some(KillReason::Discarded) | None => {
                MaestroError::Process(format!("worker {} was killed", self.id))
            }
        }
    }
}

struct Slot {
    handle: Arc<WorkerHandle>,
    status: WorkerStatus,
    created_at: Instant,
    last_activity_at: Instant,
    busy_since: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<AgentKey, Vec<Slot>>,
    spawning: HashMap<AgentKey, usize>,
    closed: bool,
}

enum Pick {
    Reuse(Arc<WorkerHandle>),
    Spawn,
    Exhausted,
    Closed,
}

struct PoolInner {
    backend: BackendKind,
    spawner: Arc<dyn WorkerSpawner>,
    config: PoolConfig,
    audit: Arc<AuditLog>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn release(&self, handle: &WorkerHandle) {
        let mut state = self.state.lock();
        let Some(slot) = state
            .workers
            .get_mut(&handle.key)
            .and_then(|slots| slots.iter_mut().find(|s| s.handle.id == handle.id))
        else {
            return;
        };
        slot.status = WorkerStatus::Idle;
        slot.busy_since = None;
        slot.last_activity_at = Instant::now();
    }

    fn discard(&self, handle: &Arc<WorkerHandle>) {
        {
            let mut state = self.state.lock();
            if let Some(slots) = state.workers.get_mut(&handle.key) {
                slots.retain(|s| s.handle.id != handle.id);
            }
        }
        handle.kill(KillReason::Discarded);
        debug!(worker_id = %handle.id, agent = %handle.key, "worker discarded");
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let process = handle.process.clone();
            rt.spawn(async move { process.terminate().await });
        }
    }
}

async fn terminate_all(handles: &[Arc<WorkerHandle>]) {
    join_all(handles.iter().map(|h| h.process.terminate())).await;
}

/// Pool of workers for one backend, keyed by agent.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl AgentPool {
    /// Create an empty pool.
    pub fn new(
        backend: BackendKind,
        spawner: Arc<dyn WorkerSpawner>,
        config: PoolConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                spawner,
                config,
                audit,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Backend this pool spawns.
    pub fn backend(&self) -> BackendKind {
        self.inner.backend
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether [`AgentPool::shutdown_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Lease a worker for `key`: an idle one if available, otherwise a new
    /// one while fewer than `limit` exist.
    pub async fn acquire(
        &self,
        key: &AgentKey,
        spec: &AgentSpec,
        limit: usize,
    ) -> MaestroResult<WorkerLease> {
        let limit = limit.max(1);
        let now = Instant::now();
        let idle_timeout = self.inner.config.idle_timeout;
        let mut evicted = Vec::new();

        let pick = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.closed {
                Pick::Closed
            } else {
                let pending = state.spawning.get(key).copied().unwrap_or(0);
                let slots = state.workers.entry(key.clone()).or_default();
                slots.retain(|slot| {
                    let stale = slot.status == WorkerStatus::Idle
                        && (now.duration_since(slot.last_activity_at) > idle_timeout
                            || !slot.handle.process.is_alive());
                    if stale {
                        evicted.push(slot.handle.clone());
                    }
                    !stale
                });
                if let Some(slot) = slots.iter_mut().find(|s| s.status == WorkerStatus::Idle) {
                    slot.status = WorkerStatus::Busy;
                    slot.busy_since = Some(now);
                    Pick::Reuse(slot.handle.clone())
                } else if slots.len() + pending < limit {
                    *state.spawning.entry(key.clone()).or_default() += 1;
                    Pick::Spawn
                } else {
                    Pick::Exhausted
                }
            }
        };

        if !evicted.is_empty() {
            debug!(agent = %key, count = evicted.len(), "evicting stale idle workers");
            terminate_all(&evicted).await;
        }

        match pick {
            Pick::Closed => Err(MaestroError::PoolClosed(format!(
                "{} pool is shut down",
                self.inner.backend
            ))),
            Pick::Exhausted => Err(MaestroError::PoolExhausted {
                agent: key.to_string(),
                size: limit,
            }),
            Pick::Reuse(handle) => {
                debug!(agent = %key, worker_id = %handle.id, "reusing idle worker");
                Ok(self.lease(handle))
            }
            Pick::Spawn => self.spawn_worker(key, spec).await,
        }
    }

    async fn spawn_worker(&self, key: &AgentKey, spec: &AgentSpec) -> MaestroResult<WorkerLease> {
        let spawned = self.inner.spawner.spawn(key, spec).await;

        let admitted = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(n) = state.spawning.get_mut(key) {
                *n = n.saturating_sub(1);
            }
            match spawned {
                Err(e) => Err((e, None)),
                Ok(process) if state.closed => Err((
                    MaestroError::PoolClosed(format!("{} pool is shut down", self.inner.backend)),
                    Some(process),
                )),
                Ok(process) => {
                    let id = format!(
                        "{}-{}",
                        self.inner.backend,
                        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
                    );
                    let handle = Arc::new(WorkerHandle {
                        id,
                        key: key.clone(),
                        process,
                        killed: CancellationToken::new(),
                        kill_reason: Mutex::new(None),
                    });
                    let now = Instant::now();
                    state.workers.entry(key.clone()).or_default().push(Slot {
                        handle: handle.clone(),
                        status: WorkerStatus::Busy,
                        created_at: now,
                        last_activity_at: now,
                        busy_since: Some(now),
                    });
                    Ok(handle)
                }
            }
        };

        match admitted {
            Ok(handle) => {
                info!(
                    agent = %key,
                    worker_id = %handle.id,
                    pid = ?handle.process.pid(),
                    "worker added to pool"
                );
                Ok(self.lease(handle))
            }
            Err((e, orphan)) => {
                if let Some(process) = orphan {
                    process.terminate().await;
                }
                warn!(agent = %key, error = %e, "worker spawn failed");
                Err(e)
            }
        }
    }

    fn lease(&self, handle: Arc<WorkerHandle>) -> WorkerLease {
        WorkerLease {
            pool: self.inner.clone(),
            handle,
            poisoned: false,
            in_flight: false,
        }
    }

    /// Evict idle-expired workers and force-kill hung ones.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let idle_timeout = self.inner.config.idle_timeout;
        let hung_timeout = self.inner.config.hung_timeout;
        let mut idle = Vec::new();
        let mut hung = Vec::new();

        {
            let mut state = self.inner.state.lock();
            for slots in state.workers.values_mut() {
                slots.retain(|slot| match slot.status {
                    WorkerStatus::Idle
                        if now.duration_since(slot.last_activity_at) > idle_timeout
                            || !slot.handle.process.is_alive() =>
                    {
                        idle.push(slot.handle.clone());
                        false
                    }
                    WorkerStatus::Busy => match slot.busy_since {
                        Some(since) if now.duration_since(since) > hung_timeout => {
                            hung.push((slot.handle.clone(), now.duration_since(since).as_secs()));
                            false
                        }
                        _ => true,
                    },
                    _ => true,
                });
            }
            state.workers.retain(|_, slots| !slots.is_empty());
        }

        for (handle, busy_secs) in &hung {
            handle.kill(KillReason::Hung {
                busy_secs: *busy_secs,
            });
            warn!(
                agent = %handle.key,
                worker_id = %handle.id,
                pid = ?handle.process.pid(),
                busy_secs,
                "killing hung worker"
            );
            self.inner.audit.log_action(
                handle.key.to_string(),
                "hung_kill",
                Some(handle.key.to_string()),
                serde_json::json!({
                    "worker_id": handle.id,
                    "backend": self.inner.backend,
                    "busy_secs": busy_secs,
                }),
                AuditOutcome::Error,
            );
        }

        let hung_handles: Vec<_> = hung.into_iter().map(|(h, _)| h).collect();
        terminate_all(&idle).await;
        terminate_all(&hung_handles).await;

        for handle in &idle {
            debug!(agent = %handle.key, worker_id = %handle.id, "idle worker evicted");
        }

        SweepReport {
            idle_evicted: idle.len(),
            hung_killed: hung_handles.len(),
        }
    }

    /// Tear down idle workers of `key` until at most `keep` workers remain.
    pub async fn trim(&self, key: &AgentKey, keep: usize) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let Some(slots) = state.workers.get_mut(key) else {
                return 0;
            };
            let mut removed = Vec::new();
            while slots.len() > keep {
                let Some(pos) = slots.iter().position(|s| s.status == WorkerStatus::Idle) else {
                    break;
                };
                removed.push(slots.remove(pos).handle);
            }
            removed
        };
        terminate_all(&removed).await;
        removed.len()
    }

    /// Terminate every worker and refuse further acquisitions. Idempotent.
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<Arc<WorkerHandle>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state
                .workers
                .drain()
                .flat_map(|(_, slots)| slots)
                .map(|slot| slot.handle)
                .collect()
        };
        for handle in &drained {
            handle.kill(KillReason::Shutdown);
        }
        terminate_all(&drained).await;
        if !drained.is_empty() {
            info!(
                backend = %self.inner.backend,
                terminated = drained.len(),
                "pool shut down"
            );
        }
        drained.len()
    }

    /// Current workers.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let mut out: Vec<WorkerInfo> = state
            .workers
            .values()
            .flatten()
            .map(|slot| WorkerInfo {
                id: slot.handle.id.clone(),
                agent: slot.handle.key.clone(),
                backend: self.inner.backend,
                pid: slot.handle.process.pid(),
                status: if slot.handle.killed.is_cancelled() {
                    WorkerStatus::Hung
                } else {
                    slot.status
                },
                age_secs: now.duration_since(slot.created_at).as_secs(),
                idle_secs: now.duration_since(slot.last_activity_at).as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Number of live workers for `key`.
    pub fn worker_count(&self, key: &AgentKey) -> usize {
        self.inner
            .state
            .lock()
            .workers
            .get(key)
            .map_or(0, |slots| slots.len())
    }
}

/// Exclusive use of one worker. Dropping the lease returns the worker to the
/// pool, or discards it if the last call was cut short.
pub struct WorkerLease {
    pool: Arc<PoolInner>,
    handle: Arc<WorkerHandle>,
    poisoned: bool,
    in_flight: bool,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.handle.id)
            .field("agent", &self.handle.key)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl WorkerLease {
    /// Worker id.
    pub fn worker_id(&self) -> &str {
        &self.handle.id
    }

    /// Agent key the worker serves.
    pub fn agent(&self) -> &AgentKey {
        &self.handle.key
    }

    /// OS pid.
    pub fn pid(&self) -> Option<u32> {
        self.handle.process.pid()
    }

    /// Run one call on the worker.
    ///
    /// A timeout, a cancellation, a hung kill or a process failure poisons the
    /// lease so the worker is never handed out again.
    pub async fn invoke(
        &mut self,
        call: &AgentCall,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> MaestroResult<String> {
        self.in_flight = true;
        let handle = self.handle.clone();
        let outcome = tokio::select! {
            biased;
            _ = handle.killed.cancelled() => Err(handle.kill_error()),
            _ = cancel.cancelled() => Err(MaestroError::Cancelled(format!(
                "call to '{}' was cancelled",
                handle.key
            ))),
            result = tokio::time::timeout(timeout, handle.process.invoke(call)) => match result {
                Ok(result) => result,
                Err(_) => Err(MaestroError::Timeout(format!(
                    "agent '{}' did not answer within {}s",
                    handle.key,
                    timeout.as_secs()
                ))),
            },
        };
        self.in_flight = false;
        if let Err(e) = &outcome {
            if !matches!(e, MaestroError::Agent(_)) || !handle.process.is_alive() {
                self.poisoned = true;
            }
        }
        outcome
    }

    /// Return the worker to the pool.
    pub fn release(self) {}

    /// Remove the worker from the pool and kill it.
    pub fn discard(mut self) {
        self.poisoned = true;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.poisoned || self.in_flight {
            self.pool.discard(&self.handle);
        } else {
            self.pool.release(&self.handle);
        }
    }
}
