use crate::invoker::{AgentInvoker, Invocation};
use crate::types::short_id;
use maestro_core::{AgentConfig, AgentKey, MaestroError, MaestroResult};
use maestro_security::{ActionClass, AuditLog, AuditOutcome, PermissionGateway, RateLimiter};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Limits applied to every delegation.
#[derive(Debug, Clone)]
pub struct DelegationConfig {
    /// Most hops a single chain may take.
    pub max_chain_length: usize,
    /// Minimum gap between two delegations over the same ordered pair.
    pub cooldown: Duration,
    /// Burst size of the per-agent limiter.
    pub burst_capacity: f64,
    /// Tokens regained per second by the per-agent limiter.
    pub burst_refill_per_sec: f64,
    /// Timeout for the delegated task.
    pub task_timeout: Duration,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_chain_length: 3,
            cooldown: Duration::from_secs(300),
            burst_capacity: 5.0,
            burst_refill_per_sec: 5.0 / 60.0,
            task_timeout: Duration::from_secs(600),
        }
    }
}

/// Handoffs made on behalf of one originating request.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationChain {
    /// Id used in logs and audit records.
    pub chain_id: String,
    /// Chat channel the request came from.
    pub origin: Option<String>,
    /// Agents in the order they joined; the first is the requester.
    pub participants: Vec<AgentKey>,
    /// Handoffs made so far.
    pub depth: usize,
    last_delegation_at: HashMap<(AgentKey, AgentKey), Instant>,
}

impl DelegationChain {
    /// A chain rooted at `root`.
    pub fn new(root: AgentKey) -> Self {
        Self {
            chain_id: format!("chain-{}", short_id()),
            origin: None,
            participants: vec![root],
            depth: 0,
            last_delegation_at: HashMap::new(),
        }
    }

    /// Builder: set the origin channel.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// When `from` last delegated to `to` on this chain.
    pub fn last_delegation(&self, from: &AgentKey, to: &AgentKey) -> Option<Instant> {
        self.last_delegation_at
            .get(&(from.clone(), to.clone()))
            .copied()
    }
}

/// A `DELEGATE::agent::task` directive found in agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationDirective {
    /// Target agent.
    pub agent: AgentKey,
    /// Task text handed to the target.
    pub task: String,
}

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"DELEGATE::([A-Za-z0-9_\-]+)::([^\r\n]+)").unwrap_or_else(|_| unreachable!())
    })
}

/// Every delegation directive in `text`, in order.
pub fn parse_delegations(text: &str) -> Vec<DelegationDirective> {
    directive_re()
        .captures_iter(text)
        .filter_map(|c| {
            let task = c[2].trim();
            (!task.is_empty()).then(|| DelegationDirective {
                agent: AgentKey::new(&c[1]),
                task: task.to_string(),
            })
        })
        .collect()
}

/// Single-hop handoffs between configured agents with loop prevention.
pub struct DelegationManager {
    invoker: Arc<dyn AgentInvoker>,
    config: DelegationConfig,
    gateway: PermissionGateway,
    limiter: RateLimiter<AgentKey>,
    audit: Arc<AuditLog>,
}

impl DelegationManager {
    /// Manager with a fresh burst limiter.
    pub fn new(invoker: Arc<dyn AgentInvoker>, config: DelegationConfig, audit: Arc<AuditLog>) -> Self {
        let limiter = RateLimiter::new(config.burst_capacity, config.burst_refill_per_sec);
        Self {
            invoker,
            config,
            gateway: PermissionGateway::new(),
            limiter,
            audit,
        }
    }

    /// Active limits.
    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    /// Hand `task` from `from` to `to`.
    ///
    /// Every check runs before the chain is touched, so a rejected delegation
    /// leaves `chain` exactly as it was and never reaches a worker.
    pub async fn delegate(
        &self,
        chain: &mut DelegationChain,
        from: &AgentKey,
        to: &AgentKey,
        task: &str,
        cancel: &CancellationToken,
    ) -> MaestroResult<String> {
        let target = match self.check(chain, from, to).await {
            Ok(target) => target,
            Err(e) => {
                let outcome = match &e {
                    MaestroError::LoopPrevention(_) | MaestroError::PermissionDenied(_) => {
                        AuditOutcome::Denied
                    }
                    _ => AuditOutcome::Error,
                };
                warn!(chain_id = %chain.chain_id, %from, %to, error = %e, "delegation rejected");
                self.audit.log_action(
                    chain.chain_id.clone(),
                    "delegate",
                    Some(from.to_string()),
                    serde_json::json!({ "to": to, "depth": chain.depth, "error": e.to_string() }),
                    outcome,
                );
                return Err(e);
            }
        };

        chain.depth += 1;
        chain.participants.push(to.clone());
        chain
            .last_delegation_at
            .insert((from.clone(), to.clone()), Instant::now());
        info!(chain_id = %chain.chain_id, %from, %to, depth = chain.depth, "delegating");
        self.audit.log_action(
            chain.chain_id.clone(),
            "delegate",
            Some(from.to_string()),
            serde_json::json!({ "to": to, "depth": chain.depth }),
            AuditOutcome::Success,
        );

        let prompt = format!("[Delegated by {from}]\n{task}");
        let invocation = Invocation::agent(to.clone(), target.tier, prompt, self.config.task_timeout)
            .with_scope(chain.chain_id.clone());
        self.invoker.invoke(invocation, cancel).await
    }

    /// Run every guard in order and return the target's configuration.
    async fn check(
        &self,
        chain: &DelegationChain,
        from: &AgentKey,
        to: &AgentKey,
    ) -> MaestroResult<AgentConfig> {
        if chain.depth >= self.config.max_chain_length {
            return Err(MaestroError::LoopPrevention(format!(
                "chain {} reached its limit of {} delegation(s)",
                chain.chain_id, self.config.max_chain_length
            )));
        }
        if from == to {
            return Err(MaestroError::LoopPrevention(format!(
                "agent '{from}' cannot delegate to itself"
            )));
        }
        if let Some(at) = chain.last_delegation(from, to) {
            let since = at.elapsed();
            if since < self.config.cooldown {
                return Err(MaestroError::LoopPrevention(format!(
                    "'{from}' -> '{to}' is cooling down for another {}s",
                    (self.config.cooldown - since).as_secs()
                )));
            }
        }

        let target = self
            .invoker
            .agent(to)
            .await
            .ok_or_else(|| MaestroError::Agent(format!("unknown agent '{to}'")))?;
        if !target.enabled {
            return Err(MaestroError::Agent(format!("agent '{to}' is disabled")));
        }

        let source = self
            .invoker
            .agent(from)
            .await
            .ok_or_else(|| MaestroError::Agent(format!("unknown agent '{from}'")))?;
        if !source.can_delegate {
            return Err(MaestroError::PermissionDenied(format!(
                "agent '{from}' is not allowed to delegate"
            )));
        }
        self.gateway
            .enforce(from, source.tier, ActionClass::Delegate)?;

        if !self.limiter.check(from).await {
            return Err(MaestroError::LoopPrevention(format!(
                "agent '{from}' is delegating too fast"
            )));
        }
        Ok(target)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::ScriptedInvoker;
    use maestro_core::Tier;

    fn agents() -> Vec<AgentConfig> {
        vec![
            AgentConfig::new("lead").with_tier(Tier::Full).delegating(),
            AgentConfig::new("helper"),
            AgentConfig::new("mid").with_tier(Tier::MemoryWrite).delegating(),
        ]
    }

    fn manager(invoker: Arc<ScriptedInvoker>) -> DelegationManager {
        DelegationManager::new(invoker, DelegationConfig::default(), Arc::new(AuditLog::disabled()))
    }

    #[test]
    fn test_parse_delegations() {
        let text = "Sure.\r\nDELEGATE::helper::write the tests\r\nDELEGATE::bad agent::x\nDELEGATE::empty::   \nDELEGATE::lead-2::ship it";
        let found = parse_delegations(text);
        assert_eq!(
            found,
            vec![
                DelegationDirective {
                    agent: "helper".into(),
                    task: "write the tests".into()
                },
                DelegationDirective {
                    agent: "lead-2".into(),
                    task: "ship it".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_successful_delegation_runs_under_target_tier() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let mgr = manager(invoker.clone());
        let mut chain = DelegationChain::new("lead".into());

        let out = mgr
            .delegate(&mut chain, &"lead".into(), &"helper".into(), "summarize", &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.starts_with("helper: [Delegated by lead]"));
        assert_eq!(chain.depth, 1);
        assert_eq!(chain.participants, vec![AgentKey::new("lead"), AgentKey::new("helper")]);
        assert_eq!(invoker.calls()[0].tier, Tier::MemoryWrite);
    }

    #[tokio::test]
    async fn test_non_delegating_agent_denied() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let mgr = manager(invoker.clone());
        let mut chain = DelegationChain::new("helper".into());
        let before = chain.clone();
        let err = mgr
            .delegate(&mut chain, &"helper".into(), &"lead".into(), "x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::PermissionDenied(_)));
        assert_eq!(chain, before);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tier_two_cannot_delegate() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let mgr = manager(invoker);
        let mut chain = DelegationChain::new("mid".into());
        let err = mgr
            .delegate(&mut chain, &"mid".into(), &"helper".into(), "x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_self_delegation_and_unknown_target() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let mgr = manager(invoker);
        let mut chain = DelegationChain::new("lead".into());
        assert!(matches!(
            mgr.delegate(&mut chain, &"lead".into(), &"lead".into(), "x", &CancellationToken::new())
                .await
                .unwrap_err(),
            MaestroError::LoopPrevention(_)
        ));
        assert!(matches!(
            mgr.delegate(&mut chain, &"lead".into(), &"ghost".into(), "x", &CancellationToken::new())
                .await
                .unwrap_err(),
            MaestroError::Agent(_)
        ));
        assert_eq!(chain.depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_cooldown_expires() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let mgr = manager(invoker);
        let mut chain = DelegationChain::new("lead".into());
        let cancel = CancellationToken::new();

        mgr.delegate(&mut chain, &"lead".into(), &"helper".into(), "one", &cancel)
            .await
            .unwrap();
        let err = mgr
            .delegate(&mut chain, &"lead".into(), &"helper".into(), "two", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::LoopPrevention(_)));
        assert_eq!(chain.depth, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        mgr.delegate(&mut chain, &"lead".into(), &"helper".into(), "three", &cancel)
            .await
            .unwrap();
        assert_eq!(chain.depth, 2);
    }

    #[tokio::test]
    async fn test_burst_limiter_is_chain_independent() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let config = DelegationConfig {
            burst_capacity: 2.0,
            burst_refill_per_sec: 0.0,
            ..Default::default()
        };
        let mgr = DelegationManager::new(invoker, config, Arc::new(AuditLog::disabled()));
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let mut chain = DelegationChain::new("lead".into());
            mgr.delegate(&mut chain, &"lead".into(), &"helper".into(), "t", &cancel)
                .await
                .unwrap();
        }
        let mut fresh = DelegationChain::new("lead".into());
        let err = mgr
            .delegate(&mut fresh, &"lead".into(), &"helper".into(), "t", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::LoopPrevention(_)));
        assert_eq!(fresh.depth, 0);
    }
}
