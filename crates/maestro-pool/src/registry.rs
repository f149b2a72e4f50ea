use crate::pool::{AgentPool, PoolConfig, SweepReport, WorkerInfo, WorkerLease};
use crate::worker::WorkerSpawner;
use maestro_core::{
    AgentConfig, AgentConfigPatch, AgentKey, AgentSpec, BackendKind, MaestroError, MaestroResult,
};
use maestro_security::{validate_identifier, AuditLog};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct RegistryContext {
    pools: HashMap<BackendKind, AgentPool>,
    agents: BTreeMap<AgentKey, AgentConfig>,
    generation: u64,
}

/// One pool per backend plus the agent table they serve.
///
/// Acquisitions hold the read side of the lock; [`PoolRegistry::reload`] takes
/// the write side, shuts every pool down and swaps in a fresh context, so no
/// worker is ever spawned under a configuration that is being replaced.
pub struct PoolRegistry {
    context: RwLock<RegistryContext>,
    spawners: HashMap<BackendKind, Arc<dyn WorkerSpawner>>,
    config: PoolConfig,
    audit: Arc<AuditLog>,
}

fn index_agents(agents: Vec<AgentConfig>) -> MaestroResult<BTreeMap<AgentKey, AgentConfig>> {
    let mut table = BTreeMap::new();
    for agent in agents {
        validate_identifier(agent.key.as_str())
            .map_err(|e| MaestroError::Config(format!("agent key '{}': {e}", agent.key)))?;
        if table.insert(agent.key.clone(), agent).is_some() {
            return Err(MaestroError::Config("duplicate agent key".into()));
        }
    }
    Ok(table)
}

fn build_pools(
    spawners: &HashMap<BackendKind, Arc<dyn WorkerSpawner>>,
    config: &PoolConfig,
    audit: &Arc<AuditLog>,
) -> HashMap<BackendKind, AgentPool> {
    spawners
        .iter()
        .map(|(backend, spawner)| {
            (
                *backend,
                AgentPool::new(*backend, spawner.clone(), config.clone(), audit.clone()),
            )
        })
        .collect()
}

impl PoolRegistry {
    /// Build a registry. Every backend with a spawner gets a pool.
    pub fn new(
        spawners: HashMap<BackendKind, Arc<dyn WorkerSpawner>>,
        config: PoolConfig,
        agents: Vec<AgentConfig>,
        audit: Arc<AuditLog>,
    ) -> MaestroResult<Self> {
        let agents = index_agents(agents)?;
        let pools = build_pools(&spawners, &config, &audit);
        Ok(Self {
            context: RwLock::new(RegistryContext {
                pools,
                agents,
                generation: 0,
            }),
            spawners,
            config,
            audit,
        })
    }

    /// Pool settings shared by every backend.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.config
    }

    /// Backends that have a pool, in declaration order.
    pub fn backends(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|b| self.spawners.contains_key(b))
            .collect()
    }

    /// Configuration of one agent.
    pub async fn agent(&self, key: &AgentKey) -> Option<AgentConfig> {
        self.context.read().await.agents.get(key).cloned()
    }

    /// All configured agents, sorted by key.
    pub async fn agents(&self) -> Vec<AgentConfig> {
        self.context.read().await.agents.values().cloned().collect()
    }

    /// Number of completed reloads.
    pub async fn generation(&self) -> u64 {
        self.context.read().await.generation
    }

    /// Lease a worker for a configured, enabled agent.
    pub async fn acquire_agent(&self, key: &AgentKey) -> MaestroResult<(AgentConfig, WorkerLease)> {
        let ctx = self.context.read().await;
        let config = ctx
            .agents
            .get(key)
            .cloned()
            .ok_or_else(|| MaestroError::Agent(format!("unknown agent '{key}'")))?;
        if !config.enabled {
            return Err(MaestroError::Agent(format!("agent '{key}' is disabled")));
        }
        let pool = ctx.pools.get(&config.backend).ok_or_else(|| {
            MaestroError::Config(format!("no backend '{}' configured", config.backend))
        })?;
        let limit = config.pool_size.unwrap_or(self.config.default_pool_size);
        let lease = pool.acquire(key, &config.spec(), limit).await?;
        Ok((config, lease))
    }

    /// Lease an ephemeral worker for a workflow step that names no agent.
    pub async fn acquire_ephemeral(
        &self,
        backend: BackendKind,
        spec: &AgentSpec,
        limit: usize,
    ) -> MaestroResult<WorkerLease> {
        let ctx = self.context.read().await;
        let pool = ctx
            .pools
            .get(&backend)
            .ok_or_else(|| MaestroError::Config(format!("no backend '{backend}' configured")))?;
        let key = ephemeral_key(backend, spec.model.as_deref());
        pool.acquire(&key, spec, limit).await
    }

    /// Shrink an ephemeral key back to the configured pool size.
    pub async fn trim_ephemeral(&self, backend: BackendKind, model: Option<&str>) -> usize {
        let ctx = self.context.read().await;
        let Some(pool) = ctx.pools.get(&backend) else {
            return 0;
        };
        let key = ephemeral_key(backend, model);
        let removed = pool.trim(&key, self.config.default_pool_size).await;
        if removed > 0 {
            debug!(agent = %key, removed, "ephemeral workers torn down");
        }
        removed
    }

    /// Replace the agent table, draining every pool first.
    pub async fn reload(&self, agents: Vec<AgentConfig>) -> MaestroResult<u64> {
        let agents = index_agents(agents)?;
        self.swap(|_| Ok(agents)).await
    }

    /// Apply a partial update to one agent and reload.
    pub async fn update_agent(
        &self,
        key: &AgentKey,
        patch: &AgentConfigPatch,
    ) -> MaestroResult<AgentConfig> {
        let mut updated = None;
        self.swap(|current| {
            let mut agents = current.clone();
            let agent = agents
                .get_mut(key)
                .ok_or_else(|| MaestroError::Agent(format!("unknown agent '{key}'")))?;
            agent.apply(patch);
            updated = Some(agent.clone());
            Ok(agents)
        })
        .await?;
        updated.ok_or_else(|| MaestroError::Agent(format!("unknown agent '{key}'")))
    }

    async fn swap<F>(&self, next: F) -> MaestroResult<u64>
    where
        F: FnOnce(&BTreeMap<AgentKey, AgentConfig>) -> MaestroResult<BTreeMap<AgentKey, AgentConfig>>,
    {
        let mut ctx = self.context.write().await;
        let agents = next(&ctx.agents)?;
        let mut drained = 0;
        for pool in ctx.pools.values() {
            drained += pool.shutdown_all().await;
        }
        ctx.pools = build_pools(&self.spawners, &self.config, &self.audit);
        ctx.agents = agents;
        ctx.generation += 1;
        info!(
            generation = ctx.generation,
            agents = ctx.agents.len(),
            workers_drained = drained,
            "agent configuration reloaded"
        );
        Ok(ctx.generation)
    }

    /// Terminate every worker in every pool. Later acquisitions fail with
    /// `PoolClosed`.
    pub async fn shutdown_all(&self) -> usize {
        let ctx = self.context.write().await;
        let mut total = 0;
        for pool in ctx.pools.values() {
            total += pool.shutdown_all().await;
        }
        total
    }

    /// Run one sweep over every pool.
    pub async fn sweep(&self) -> SweepReport {
        let ctx = self.context.read().await;
        let mut report = SweepReport::default();
        for pool in ctx.pools.values() {
            let r = pool.sweep().await;
            report.idle_evicted += r.idle_evicted;
            report.hung_killed += r.hung_killed;
        }
        report
    }

    /// Background task sweeping every `sweep_interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = registry.sweep().await;
                        if report != SweepReport::default() {
                            debug!(
                                idle_evicted = report.idle_evicted,
                                hung_killed = report.hung_killed,
                                "pool sweep"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Every live worker across all pools.
    pub async fn snapshot(&self) -> Vec<WorkerInfo> {
        let ctx = self.context.read().await;
        let mut all: Vec<WorkerInfo> = ctx.pools.values().flat_map(|p| p.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Pool key used for steps that run on an anonymous worker.
pub fn ephemeral_key(backend: BackendKind, model: Option<&str>) -> AgentKey {
    AgentKey::new(format!("ephemeral/{backend}/{}", model.unwrap_or("default")))
}
