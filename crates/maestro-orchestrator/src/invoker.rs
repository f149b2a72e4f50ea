use crate::monitor::AgentMonitor;
use async_trait::async_trait;
use maestro_core::{AgentConfig, AgentKey, AgentSpec, BackendKind, MaestroError, MaestroResult, Tier};
use maestro_pool::registry::ephemeral_key;
use maestro_pool::{AgentCall, PoolRegistry, WorkerLease};
use maestro_security::{ActionClass, AuditLog, AuditOutcome, Decision, PermissionGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay between attempts when an ephemeral pool is momentarily full.
const EPHEMERAL_RETRY: Duration = Duration::from_millis(250);

/// Who answers an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeTarget {
    /// A configured agent.
    Agent(AgentKey),
    /// An anonymous worker for one workflow step.
    Ephemeral {
        /// Backend the worker runs on.
        backend: BackendKind,
        /// Model and system prompt from the step.
        spec: AgentSpec,
        /// Pool size the ephemeral key may grow to for this run.
        burst: usize,
    },
}

/// One request to an agent.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Configured agent or ephemeral worker.
    pub target: InvokeTarget,
    /// Ceiling tier. A configured agent never runs above its own tier.
    pub tier: Tier,
    /// Action class checked against the gateway before dispatch.
    pub action: ActionClass,
    /// Prompt text.
    pub prompt: String,
    /// Hard limit for the call; the worker is discarded when it fires.
    pub timeout: Duration,
    /// Audit scope (workflow id, chain id, session id).
    pub scope: String,
}

impl Invocation {
    /// A plain `Respond` call to a configured agent.
    pub fn agent(key: AgentKey, tier: Tier, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: InvokeTarget::Agent(key),
            tier,
            action: ActionClass::Respond,
            prompt: prompt.into(),
            timeout,
            scope: String::from("direct"),
        }
    }

    /// Builder: set the audit scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Label used for monitoring and audit entries.
    pub fn label(&self) -> AgentKey {
        match &self.target {
            InvokeTarget::Agent(key) => key.clone(),
            InvokeTarget::Ephemeral { backend, spec, .. } => {
                ephemeral_key(*backend, spec.model.as_deref())
            }
        }
    }
}

/// Seam between the engines and the worker pools.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run one invocation to completion.
    async fn invoke(&self, invocation: Invocation, cancel: &CancellationToken)
        -> MaestroResult<String>;

    /// Configuration of a configured agent.
    async fn agent(&self, key: &AgentKey) -> Option<AgentConfig>;

    /// Backends available for round-robin balancing.
    fn backends(&self) -> Vec<BackendKind>;

    /// Tear down ephemeral workers beyond the steady-state pool size.
    async fn reclaim_ephemeral(&self, _backend: BackendKind, _model: Option<&str>) {}
}

/// Header prepended to every system prompt so the backend can restrict its
/// own tool surface.
pub fn tier_preamble(gateway: &PermissionGateway, tier: Tier) -> String {
    let allowed: Vec<String> = gateway
        .allowed_actions(tier)
        .iter()
        .map(ToString::to_string)
        .collect();
    format!("[PERMISSIONS] {tier}: allowed actions: {}", allowed.join(", "))
}

fn compose_system_prompt(preamble: &str, persona: Option<&str>) -> String {
    match persona {
        Some(p) if !p.trim().is_empty() => format!("{preamble}\n\n{p}"),
        _ => preamble.to_string(),
    }
}

/// [`AgentInvoker`] backed by a [`PoolRegistry`].
pub struct PooledInvoker {
    registry: Arc<PoolRegistry>,
    gateway: PermissionGateway,
    audit: Arc<AuditLog>,
    monitor: AgentMonitor,
}

impl PooledInvoker {
    /// Invoker over `registry`, reporting to `monitor`.
    pub fn new(registry: Arc<PoolRegistry>, audit: Arc<AuditLog>, monitor: AgentMonitor) -> Self {
        Self {
            registry,
            gateway: PermissionGateway::new(),
            audit,
            monitor,
        }
    }

    /// Underlying pools.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Shared monitor.
    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }

    /// Lease an ephemeral worker, waiting while the pool is at capacity.
    async fn lease_ephemeral(
        &self,
        backend: BackendKind,
        spec: &AgentSpec,
        burst: usize,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> MaestroResult<WorkerLease> {
        loop {
            match self.registry.acquire_ephemeral(backend, spec, burst).await {
                Err(MaestroError::PoolExhausted { agent, size }) => {
                    if Instant::now() + EPHEMERAL_RETRY >= deadline {
                        return Err(MaestroError::PoolExhausted { agent, size });
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(MaestroError::Cancelled(format!(
                                "waiting for a '{agent}' worker was cancelled"
                            )));
                        }
                        _ = tokio::time::sleep(EPHEMERAL_RETRY) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn dispatch(
        &self,
        invocation: &Invocation,
        tier: Tier,
        cancel: &CancellationToken,
    ) -> MaestroResult<String> {
        let preamble = tier_preamble(&self.gateway, tier);
        match &invocation.target {
            InvokeTarget::Agent(key) => {
                let (config, mut lease) = self.registry.acquire_agent(key).await?;
                let spec = config.spec();
                let call = AgentCall::for_spec(invocation.prompt.clone(), &spec).with_system_prompt(
                    compose_system_prompt(&preamble, spec.system_prompt.as_deref()),
                );
                lease.invoke(&call, cancel, invocation.timeout).await
            }
            InvokeTarget::Ephemeral {
                backend,
                spec,
                burst,
            } => {
                let started = Instant::now();
                let mut lease = self
                    .lease_ephemeral(*backend, spec, *burst, cancel, started + invocation.timeout)
                    .await?;
                let remaining = invocation.timeout.saturating_sub(started.elapsed());
                let call = AgentCall::for_spec(invocation.prompt.clone(), spec).with_system_prompt(
                    compose_system_prompt(&preamble, spec.system_prompt.as_deref()),
                );
                lease.invoke(&call, cancel, remaining).await
            }
        }
    }
}

#[async_trait]
impl AgentInvoker for PooledInvoker {
    async fn invoke(
        &self,
        invocation: Invocation,
        cancel: &CancellationToken,
    ) -> MaestroResult<String> {
        let label = invocation.label();
        let tier = match &invocation.target {
            InvokeTarget::Agent(key) => {
                let config = self
                    .registry
                    .agent(key)
                    .await
                    .ok_or_else(|| MaestroError::Agent(format!("unknown agent '{key}'")))?;
                config.tier.most_restrictive(invocation.tier)
            }
            InvokeTarget::Ephemeral { .. } => invocation.tier,
        };

        if let Decision::Deny { reason } = self.gateway.authorize(&label, tier, invocation.action) {
            warn!(agent = %label, %tier, action = %invocation.action, "invocation denied");
            self.audit.log_action(
                invocation.scope.clone(),
                "authorize",
                Some(label.to_string()),
                serde_json::json!({ "action": invocation.action, "tier": tier.level() }),
                AuditOutcome::Denied,
            );
            return Err(MaestroError::PermissionDenied(reason));
        }

        debug!(agent = %label, %tier, scope = %invocation.scope, "invoking agent");
        self.monitor.start(label.as_str(), &invocation.scope).await;
        let started = Instant::now();
        let result = self.dispatch(&invocation, tier, cancel).await;
        let elapsed = started.elapsed().as_millis() as u64;
        self.monitor
            .finish(label.as_str(), elapsed, result.is_ok())
            .await;
        if let Err(e) = &result {
            debug!(agent = %label, error = %e, "invocation failed");
        }
        result
    }

    async fn agent(&self, key: &AgentKey) -> Option<AgentConfig> {
        self.registry.agent(key).await
    }

    fn backends(&self) -> Vec<BackendKind> {
        self.registry.backends()
    }

    async fn reclaim_ephemeral(&self, backend: BackendKind, model: Option<&str>) {
        self.registry.trim_ephemeral(backend, model).await;
    }
}
