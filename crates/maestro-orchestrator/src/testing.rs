//! Closure-driven [`AgentInvoker`] and an in-memory [`MemoryStore`], for tests
//! that exercise the engines without worker pools.

use crate::invoker::{AgentInvoker, InvokeTarget, Invocation};
use crate::memory::MemoryStore;
use async_trait::async_trait;
use maestro_core::{AgentConfig, AgentKey, BackendKind, MaestroError, MaestroResult};
use maestro_security::PermissionGateway;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a scripted agent does with one invocation.
#[derive(Debug)]
pub enum ScriptedAnswer {
    /// Answer immediately.
    Text(String),
    /// Answer after a delay.
    Delayed(Duration, String),
    /// Fail with this error.
    Error(MaestroError),
    /// Never answer; ends only by timeout or cancellation.
    Hang,
}

impl ScriptedAnswer {
    /// Shorthand for [`ScriptedAnswer::Text`].
    pub fn text(s: impl Into<String>) -> Self {
        ScriptedAnswer::Text(s.into())
    }
}

type Script = dyn Fn(&Invocation) -> ScriptedAnswer + Send + Sync;

/// [`AgentInvoker`] whose answers come from a closure.
///
/// Tier clamping and gateway checks behave like the pooled invoker, so
/// permission denials can be tested without subprocesses.
pub struct ScriptedInvoker {
    agents: Mutex<BTreeMap<AgentKey, AgentConfig>>,
    backends: Vec<BackendKind>,
    script: Box<Script>,
    gateway: PermissionGateway,
    calls: Mutex<Vec<Invocation>>,
    reclaimed: Mutex<Vec<(BackendKind, Option<String>)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a ScriptedInvoker);

impl<'a> ActiveGuard<'a> {
    fn enter(inv: &'a ScriptedInvoker) -> Self {
        let now = inv.active.fetch_add(1, Ordering::SeqCst) + 1;
        inv.max_active.fetch_max(now, Ordering::SeqCst);
        Self(inv)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedInvoker {
    /// Agents answer according to `script`.
    pub fn new<F>(agents: Vec<AgentConfig>, script: F) -> Self
    where
        F: Fn(&Invocation) -> ScriptedAnswer + Send + Sync + 'static,
    {
        Self {
            agents: Mutex::new(agents.into_iter().map(|a| (a.key.clone(), a)).collect()),
            backends: BackendKind::ALL.to_vec(),
            script: Box::new(script),
            gateway: PermissionGateway::new(),
            calls: Mutex::new(Vec::new()),
            reclaimed: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Every agent answers `"<label>: <prompt>"`.
    pub fn echo(agents: Vec<AgentConfig>) -> Self {
        Self::new(agents, |inv| {
            ScriptedAnswer::Text(format!("{}: {}", inv.label(), inv.prompt))
        })
    }

    /// Invocations that reached the script, in arrival order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Prompts sent to `agent`, in arrival order.
    pub fn prompts_for(&self, agent: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.label().as_str() == agent)
            .map(|c| c.prompt.clone())
            .collect()
    }

    /// Most invocations ever in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Ephemeral keys handed back through `reclaim_ephemeral`.
    pub fn reclaimed(&self) -> Vec<(BackendKind, Option<String>)> {
        self.reclaimed.lock().clone()
    }

    async fn answer(&self, invocation: &Invocation) -> MaestroResult<String> {
        let _active = ActiveGuard::enter(self);
        match (self.script)(invocation) {
            ScriptedAnswer::Text(text) => Ok(text),
            ScriptedAnswer::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            ScriptedAnswer::Error(e) => Err(e),
            ScriptedAnswer::Hang => std::future::pending::<MaestroResult<String>>().await,
        }
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        invocation: Invocation,
        cancel: &CancellationToken,
    ) -> MaestroResult<String> {
        let label = invocation.label();
        let tier = match &invocation.target {
            InvokeTarget::Agent(key) => {
                let config = self
                    .agents
                    .lock()
                    .get(key)
                    .cloned()
                    .ok_or_else(|| MaestroError::Agent(format!("unknown agent '{key}'")))?;
                if !config.enabled {
                    return Err(MaestroError::Agent(format!("agent '{key}' is disabled")));
                }
                config.tier.most_restrictive(invocation.tier)
            }
            InvokeTarget::Ephemeral { .. } => invocation.tier,
        };
        self.gateway.enforce(&label, tier, invocation.action)?;
        self.calls.lock().push(invocation.clone());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MaestroError::Cancelled(format!("call to '{label}' was cancelled"))),
            result = tokio::time::timeout(invocation.timeout, self.answer(&invocation)) => match result {
                Ok(result) => result,
                Err(_) => Err(MaestroError::Timeout(format!(
                    "agent '{label}' did not answer within {}s",
                    invocation.timeout.as_secs()
                ))),
            },
        }
    }

    async fn agent(&self, key: &AgentKey) -> Option<AgentConfig> {
        self.agents.lock().get(key).cloned()
    }

    fn backends(&self) -> Vec<BackendKind> {
        self.backends.clone()
    }

    async fn reclaim_ephemeral(&self, backend: BackendKind, model: Option<&str>) {
        self.reclaimed
            .lock()
            .push((backend, model.map(str::to_string)));
    }
}

/// [`MemoryStore`] that keeps records in a vector.
#[derive(Default)]
pub struct RecordingMemory {
    records: Mutex<Vec<Value>>,
    checkpoint: Mutex<Option<Value>>,
}

impl RecordingMemory {
    /// No records and no checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: the checkpoint `load_checkpoint` returns.
    pub fn with_checkpoint(self, checkpoint: Value) -> Self {
        *self.checkpoint.lock() = Some(checkpoint);
        self
    }

    /// Everything saved so far.
    pub fn records(&self) -> Vec<Value> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MemoryStore for RecordingMemory {
    async fn save(&self, record: Value) -> MaestroResult<()> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> MaestroResult<Vec<Value>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.to_string().contains(query))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_checkpoint(&self) -> MaestroResult<Option<Value>> {
        Ok(self.checkpoint.lock().clone())
    }
}
