//! In-memory workers driven by a script, for tests that must not spawn
//! subprocesses.

use crate::protocol::AgentCall;
use crate::worker::{WorkerProcess, WorkerSpawner};
use async_trait::async_trait;
use maestro_core::{AgentKey, AgentSpec, MaestroError, MaestroResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted worker does with one call.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Answer immediately.
    Text(String),
    /// Answer after a delay.
    Delayed(Duration, String),
    /// Report a backend-level error.
    AgentError(String),
    /// Never answer.
    Hang,
    /// Die mid-call.
    Exit,
}

type Script = dyn Fn(&AgentKey, &AgentCall) -> ScriptedReply + Send + Sync;

#[derive(Default)]
struct Counters {
    spawned: AtomicUsize,
    terminated: AtomicUsize,
    calls: Mutex<Vec<(AgentKey, AgentCall)>>,
}

/// [`WorkerSpawner`] producing [`ScriptedWorker`]s.
pub struct ScriptedSpawner {
    script: Arc<Script>,
    counters: Arc<Counters>,
    fail_spawn: AtomicBool,
    next_pid: AtomicU32,
}

impl ScriptedSpawner {
    /// Workers answer according to `script`.
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&AgentKey, &AgentCall) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            counters: Arc::new(Counters::default()),
            fail_spawn: AtomicBool::new(false),
            next_pid: AtomicU32::new(40_000),
        }
    }

    /// Workers answer `"<agent>: <prompt>"`.
    pub fn echo() -> Self {
        Self::new(|key, call| ScriptedReply::Text(format!("{key}: {}", call.prompt)))
    }

    /// Make the next spawns fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Workers spawned so far.
    pub fn spawned(&self) -> usize {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    /// Workers terminated so far.
    pub fn terminated(&self) -> usize {
        self.counters.terminated.load(Ordering::SeqCst)
    }

    /// Every call received, in arrival order.
    pub fn calls(&self) -> Vec<(AgentKey, AgentCall)> {
        self.counters.calls.lock().clone()
    }
}

#[async_trait]
impl WorkerSpawner for ScriptedSpawner {
    async fn spawn(&self, key: &AgentKey, _spec: &AgentSpec) -> MaestroResult<Arc<dyn WorkerProcess>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(MaestroError::Process(format!("scripted spawn failure for '{key}'")));
        }
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedWorker {
            key: key.clone(),
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            script: self.script.clone(),
            counters: self.counters.clone(),
            alive: AtomicBool::new(true),
        }))
    }
}

/// Worker whose replies come from a script.
pub struct ScriptedWorker {
    key: AgentKey,
    pid: u32,
    script: Arc<Script>,
    counters: Arc<Counters>,
    alive: AtomicBool,
}

#[async_trait]
impl WorkerProcess for ScriptedWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn invoke(&self, call: &AgentCall) -> MaestroResult<String> {
        if !self.is_alive() {
            return Err(MaestroError::Process(format!("worker {} is dead", self.pid)));
        }
        self.counters
            .calls
            .lock()
            .push((self.key.clone(), call.clone()));
        match (self.script)(&self.key, call) {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            ScriptedReply::AgentError(msg) => Err(MaestroError::Agent(msg)),
            ScriptedReply::Hang => std::future::pending::<MaestroResult<String>>().await,
            ScriptedReply::Exit => {
                self.alive.store(false, Ordering::SeqCst);
                Err(MaestroError::Process(format!("worker {} exited", self.pid)))
            }
        }
    }

    async fn terminate(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.counters.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}
