//! Routes chat messages and agent output to the engines.
//!
//! An agent's reply is scanned for `DELEGATE::` directives, a workflow plan
//! or a council plan, in that order; anything else goes back to the user as
//! plain text. Only Tier 1 agents with `can_delegate` may start engines.

use crate::council::{CouncilConfig, CouncilEngine, CouncilOutcome};
use crate::delegation::{parse_delegations, DelegationChain, DelegationConfig, DelegationManager};
use crate::invoker::{AgentInvoker, Invocation};
use crate::plan::{parse_plan, ParsedPlan, WorkflowPlan};
use crate::sessions::{is_stop_command, RunKind, SessionRegistry};
use crate::types::{EventSink, RunContext, WorkflowReport, WorkflowStatus};
use crate::ultrawork::UltraWorkManager;
use crate::workflow::{WorkflowConfig, WorkflowEngine};
use maestro_core::{AgentConfig, AgentKey, ErrorReport, MaestroError, MaestroResult, Tier};
use maestro_security::{ActionClass, AuditLog, AuditOutcome, Decision, PermissionGateway};
use maestro_session::UltraWorkSession;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Chat prefix that starts an UltraWork session.
pub const ULTRAWORK_COMMAND: &str = "!ultrawork";

/// Settings for every engine the orchestrator owns.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workflow engine settings.
    pub workflow: WorkflowConfig,
    /// Council engine settings.
    pub council: CouncilConfig,
    /// Delegation limits.
    pub delegation: DelegationConfig,
    /// Revised plans accepted from a conductor after a failed workflow.
    pub max_replans: u32,
    /// Timeout for direct replies and replan requests.
    pub reply_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            council: CouncilConfig::default(),
            delegation: DelegationConfig::default(),
            max_replans: 2,
            reply_timeout: Duration::from_secs(600),
        }
    }
}

/// Result of one delegation directive.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationResult {
    /// Target agent.
    pub agent: AgentKey,
    /// Reply, or why the delegation failed.
    pub output: Result<String, ErrorReport>,
}

/// What handling a message produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Plain agent reply.
    Reply { text: String },
    /// `!stop` was honoured.
    Stopped { runs: usize },
    /// The reply carried delegation directives.
    Delegated {
        /// The reply that carried the directives.
        reply: String,
        /// One entry per directive, in order.
        results: Vec<DelegationResult>,
    },
    /// A workflow plan ran; `replans` revised plans were accepted.
    Workflow {
        /// Report of the last attempt.
        report: WorkflowReport,
        /// Revised plans run after the first failed.
        replans: u32,
    },
    /// A council plan ran.
    Council {
        /// Transcript and synthesis.
        outcome: CouncilOutcome,
    },
    /// An UltraWork session ran to its end.
    UltraWork {
        /// Final persisted state.
        session: UltraWorkSession,
    },
}

impl DispatchOutcome {
    /// Text to send back to the originating channel.
    pub fn render(&self) -> String {
        match self {
            DispatchOutcome::Reply { text } => text.clone(),
            DispatchOutcome::Stopped { runs } => format!("Stopped {runs} run(s)."),
            DispatchOutcome::Delegated { reply, results } => {
                let mut out = reply.clone();
                for r in results {
                    match &r.output {
                        Ok(text) => out.push_str(&format!("\n\n[{}] {text}", r.agent)),
                        Err(e) => out.push_str(&format!("\n\n[{}] error ({}): {}", r.agent, e.kind, e.message)),
                    }
                }
                out
            }
            DispatchOutcome::Workflow { report, .. } => match &report.failure_notice {
                Some(notice) if report.status != WorkflowStatus::Succeeded => notice.clone(),
                _ => report.summary(),
            },
            DispatchOutcome::Council { outcome } => match &outcome.error {
                Some(e) => format!("Council ended early ({}): {}\n\n{}", e.kind, e.message, outcome.result_text()),
                None => outcome.result_text(),
            },
            DispatchOutcome::UltraWork { session } => format!(
                "UltraWork session {} finished after {} step(s): {}",
                session.session_id,
                session.steps_done(),
                session.end_reason.as_deref().unwrap_or("done")
            ),
        }
    }
}

/// Entry point for chat traffic.
pub struct Orchestrator {
    invoker: Arc<dyn AgentInvoker>,
    workflows: WorkflowEngine,
    councils: CouncilEngine,
    delegation: Arc<DelegationManager>,
    ultrawork: Option<Arc<UltraWorkManager>>,
    sessions: SessionRegistry,
    audit: Arc<AuditLog>,
    gateway: PermissionGateway,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// An orchestrator with its engines built from `config`.
    pub fn new(invoker: Arc<dyn AgentInvoker>, audit: Arc<AuditLog>, config: OrchestratorConfig) -> Self {
        Self {
            workflows: WorkflowEngine::new(invoker.clone(), config.workflow.clone()),
            councils: CouncilEngine::new(invoker.clone(), config.council.clone()),
            delegation: Arc::new(DelegationManager::new(
                invoker.clone(),
                config.delegation.clone(),
                audit.clone(),
            )),
            ultrawork: None,
            sessions: SessionRegistry::new(),
            gateway: PermissionGateway::new(),
            shutdown: CancellationToken::new(),
            invoker,
            audit,
            config,
        }
    }

    /// Builder: enable `!ultrawork`.
    pub fn with_ultrawork(mut self, manager: Arc<UltraWorkManager>) -> Self {
        self.ultrawork = Some(manager);
        self
    }

    /// The shared delegation manager, for wiring into UltraWork.
    pub fn delegation(&self) -> Arc<DelegationManager> {
        self.delegation.clone()
    }

    /// In-flight runs.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Cancel every run, from every origin.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop every run started from `origin`.
    pub fn stop(&self, origin: &str) -> usize {
        self.sessions.stop_origin(origin)
    }

    /// Handle one chat message addressed to `agent` from `origin`.
    pub async fn handle_message(
        &self,
        origin: &str,
        agent: &AgentKey,
        message: &str,
        events: Option<EventSink>,
    ) -> MaestroResult<DispatchOutcome> {
        if is_stop_command(message) {
            return Ok(DispatchOutcome::Stopped {
                runs: self.stop(origin),
            });
        }
        let config = self.agent_config(agent).await?;

        if let Some(goal) = ultrawork_goal(message) {
            let Some(manager) = &self.ultrawork else {
                return Err(MaestroError::Config("ultrawork is not configured".into()));
            };
            self.gate(&config, ActionClass::SpawnUltraWork, origin)?;
            let guard = self.sessions.register(origin, RunKind::UltraWork, &self.shutdown);
            let ctx = self.context(origin, &config, guard.token(), events);
            let session = manager.start(goal, config.key.clone(), &ctx).await?;
            return Ok(DispatchOutcome::UltraWork { session });
        }

        let guard = self.sessions.register(origin, RunKind::Direct, &self.shutdown);
        let ctx = self.context(origin, &config, guard.token(), events);
        let invocation = Invocation::agent(
            config.key.clone(),
            config.tier,
            message,
            self.config.reply_timeout,
        )
        .with_scope(ctx.scope("direct"));
        let output = self.invoker.invoke(invocation, &ctx.cancel).await?;
        self.dispatch_output(&config, output, &ctx).await
    }

    /// Route one agent reply to the engine it asks for.
    pub async fn dispatch_output(
        &self,
        conductor: &AgentConfig,
        output: String,
        ctx: &RunContext,
    ) -> MaestroResult<DispatchOutcome> {
        let origin = ctx.origin.clone().unwrap_or_else(|| "local".to_string());

        let directives = parse_delegations(&output);
        if !directives.is_empty() {
            self.gate(conductor, ActionClass::Delegate, &origin)?;
            let guard = self.sessions.register(&origin, RunKind::Delegation, &ctx.cancel);
            let mut chain = DelegationChain::new(conductor.key.clone()).with_origin(origin.clone());
            let mut results = Vec::with_capacity(directives.len());
            for d in directives {
                let outcome = self
                    .delegation
                    .delegate(&mut chain, &conductor.key, &d.agent, &d.task, &guard.token())
                    .await;
                if let Err(e @ MaestroError::Cancelled(_)) = outcome {
                    return Err(e);
                }
                results.push(DelegationResult {
                    agent: d.agent,
                    output: outcome.map_err(|e| e.report()),
                });
            }
            return Ok(DispatchOutcome::Delegated {
                reply: output,
                results,
            });
        }

        match parse_plan(&output) {
            ParsedPlan::Workflow(plan) => self.run_workflow(conductor, plan, ctx, &origin).await,
            ParsedPlan::Council(plan) => {
                self.gate(conductor, ActionClass::SpawnCouncil, &origin)?;
                let guard = self.sessions.register(&origin, RunKind::Council, &ctx.cancel);
                let council_ctx = ctx.clone().with_cancel(guard.token());
                let outcome = self.councils.run(&plan, &council_ctx).await?;
                Ok(DispatchOutcome::Council { outcome })
            }
            ParsedPlan::Malformed { reason } => Err(MaestroError::Validation(reason)),
            ParsedPlan::Absent => Ok(DispatchOutcome::Reply { text: output }),
        }
    }

    async fn run_workflow(
        &self,
        conductor: &AgentConfig,
        mut plan: WorkflowPlan,
        ctx: &RunContext,
        origin: &str,
    ) -> MaestroResult<DispatchOutcome> {
        let mut replans = 0;
        loop {
            self.gate(conductor, ActionClass::SpawnWorkflow, origin)?;
            let report = {
                let guard = self.sessions.register(origin, RunKind::Workflow, &ctx.cancel);
                let wf_ctx = ctx.clone().with_cancel(guard.token());
                self.workflows.run(&plan, &wf_ctx).await?
            };
            let Some(notice) = report.failure_notice.clone() else {
                return Ok(DispatchOutcome::Workflow { report, replans });
            };
            if report.status != WorkflowStatus::Failed || replans >= self.config.max_replans {
                return Ok(DispatchOutcome::Workflow { report, replans });
            }

            let invocation = Invocation::agent(
                conductor.key.clone(),
                ctx.tier,
                notice,
                self.config.reply_timeout,
            )
            .with_scope(ctx.scope(&report.workflow_id));
            let reply = self.invoker.invoke(invocation, &ctx.cancel).await?;
            match parse_plan(&reply) {
                ParsedPlan::Workflow(revised) => {
                    replans += 1;
                    info!(
                        conductor = %conductor.key,
                        workflow_id = %report.workflow_id,
                        attempt = replans,
                        "conductor resubmitted a revised plan"
                    );
                    plan = revised;
                }
                _ => return Ok(DispatchOutcome::Workflow { report, replans }),
            }
        }
    }

    async fn agent_config(&self, key: &AgentKey) -> MaestroResult<AgentConfig> {
        match self.invoker.agent(key).await {
            Some(c) if c.enabled => Ok(c),
            Some(_) => Err(MaestroError::Agent(format!("agent '{key}' is disabled"))),
            None => Err(MaestroError::Agent(format!("unknown agent '{key}'"))),
        }
    }

    fn context(
        &self,
        origin: &str,
        config: &AgentConfig,
        cancel: CancellationToken,
        events: Option<EventSink>,
    ) -> RunContext {
        let ctx = RunContext::new(config.tier)
            .with_origin(origin)
            .with_conductor(config.key.clone())
            .with_cancel(cancel);
        match events {
            Some(tx) => ctx.with_events(tx),
            None => ctx,
        }
    }

    /// Engine access: Tier 1, `can_delegate`, and a gateway allow.
    fn gate(&self, agent: &AgentConfig, action: ActionClass, origin: &str) -> MaestroResult<()> {
        let decision = if agent.tier != Tier::Full {
            Decision::Deny {
                reason: format!("{action} requires tier-1, agent is {}", agent.tier),
            }
        } else if !agent.can_delegate {
            Decision::Deny {
                reason: format!("{action} requires can_delegate"),
            }
        } else {
            self.gateway.authorize(&agent.key, agent.tier, action)
        };
        match decision {
            Decision::Allow => Ok(()),
            Decision::Deny { reason } => {
                warn!(agent = %agent.key, %action, origin, reason = %reason, "dispatch denied");
                self.audit.log_action(
                    origin,
                    "dispatch",
                    Some(agent.key.to_string()),
                    json!({ "action": action, "reason": reason }),
                    AuditOutcome::Denied,
                );
                Err(MaestroError::PermissionDenied(format!(
                    "agent '{}' may not {action}: {reason}",
                    agent.key
                )))
            }
        }
    }
}

/// Goal text of an `!ultrawork <goal>` message.
fn ultrawork_goal(message: &str) -> Option<&str> {
    let trimmed = message.trim_start();
    let head = trimmed.get(..ULTRAWORK_COMMAND.len())?;
    if !head.eq_ignore_ascii_case(ULTRAWORK_COMMAND) {
        return None;
    }
    let rest = &trimmed[ULTRAWORK_COMMAND.len()..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAnswer, ScriptedInvoker};
    use maestro_core::ErrorKind;

    fn conductor() -> AgentConfig {
        AgentConfig::new("lead").with_tier(Tier::Full).delegating()
    }

    fn orchestrator(invoker: Arc<ScriptedInvoker>) -> Orchestrator {
        Orchestrator::new(invoker, Arc::new(AuditLog::disabled()), OrchestratorConfig::default())
    }

    #[test]
    fn test_ultrawork_goal() {
        assert_eq!(ultrawork_goal("!ultrawork build a parser"), Some("build a parser"));
        assert_eq!(ultrawork_goal("  !UltraWork   x "), Some("x"));
        assert_eq!(ultrawork_goal("!ultraworking"), None);
        assert_eq!(ultrawork_goal("hello"), None);
    }

    #[tokio::test]
    async fn test_plain_reply() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![conductor()], |_| ScriptedAnswer::text("hi there")));
        let orch = orchestrator(invoker);
        let out = orch
            .handle_message("chan", &"lead".into(), "hello", None)
            .await
            .unwrap();
        assert_eq!(out.render(), "hi there");
        assert!(orch.sessions().active().is_empty());
    }

    #[tokio::test]
    async fn test_delegation_directives_routed() {
        let invoker = Arc::new(ScriptedInvoker::new(
            vec![conductor(), AgentConfig::new("helper")],
            |inv| match inv.label().as_str() {
                "lead" => ScriptedAnswer::text("On it.\nDELEGATE::helper::write docs"),
                _ => ScriptedAnswer::text("docs written"),
            },
        ));
        let orch = orchestrator(invoker.clone());
        let out = orch
            .handle_message("chan", &"lead".into(), "please", None)
            .await
            .unwrap();
        let DispatchOutcome::Delegated { results, .. } = &out else {
            panic!("expected delegation, got {out:?}");
        };
        assert_eq!(results[0].output, Ok("docs written".to_string()));
        assert!(invoker.prompts_for("helper")[0].contains("write docs"));
    }

    #[tokio::test]
    async fn test_non_delegating_agent_cannot_spawn_workflow() {
        let plan = r#"{"steps":[{"id":"a","agent":{},"prompt_template":"go"}]}"#;
        let invoker = Arc::new(ScriptedInvoker::new(
            vec![AgentConfig::new("lead").with_tier(Tier::Full)],
            move |_| ScriptedAnswer::text(plan),
        ));
        let orch = orchestrator(invoker.clone());
        let err = orch
            .handle_message("chan", &"lead".into(), "plan it", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        // only the conductor's own reply ran
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_plan_is_validation_error() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![conductor()], |_| {
            ScriptedAnswer::text(r#"{"workflow_plan": {"steps": 7}}"#)
        }));
        let err = orchestrator(invoker)
            .handle_message("chan", &"lead".into(), "plan it", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Validation(_)));
    }

    #[tokio::test]
    async fn test_replan_after_failure() {
        let bad = r#"{"steps":[{"id":"a","agent":{"model":"broken"},"prompt_template":"go"}]}"#;
        let good = r#"{"steps":[{"id":"a","agent":{"model":"fine"},"prompt_template":"go"}]}"#;
        let invoker = Arc::new(ScriptedInvoker::new(vec![conductor()], move |inv| {
            if inv.prompt.starts_with("[SYSTEM]") {
                ScriptedAnswer::text(good)
            } else if inv.label().as_str() == "lead" {
                ScriptedAnswer::text(bad)
            } else if inv.label().as_str().contains("broken") {
                ScriptedAnswer::Error(MaestroError::Process("crashed".into()))
            } else {
                ScriptedAnswer::text("done")
            }
        }));
        let out = orchestrator(invoker)
            .handle_message("chan", &"lead".into(), "plan it", None)
            .await
            .unwrap();
        let DispatchOutcome::Workflow { report, replans } = out else {
            panic!("expected workflow");
        };
        assert_eq!(replans, 1);
        assert_eq!(report.status, WorkflowStatus::Succeeded);
        assert_eq!(report.outputs["a"], "done");
    }

    #[tokio::test]
    async fn test_replans_are_bounded() {
        let bad = r#"{"steps":[{"id":"a","agent":{"model":"broken"},"prompt_template":"go"}]}"#;
        let invoker = Arc::new(ScriptedInvoker::new(vec![conductor()], move |inv| {
            if inv.label().as_str() == "lead" {
                ScriptedAnswer::text(bad)
            } else {
                ScriptedAnswer::Error(MaestroError::Process("crashed".into()))
            }
        }));
        let out = orchestrator(invoker.clone())
            .handle_message("chan", &"lead".into(), "plan it", None)
            .await
            .unwrap();
        let DispatchOutcome::Workflow { report, replans } = out else {
            panic!("expected workflow");
        };
        assert_eq!(replans, 2);
        assert_eq!(report.status, WorkflowStatus::Failed);
        // initial reply plus two failure notices answered
        assert_eq!(invoker.prompts_for("lead").len(), 3);
    }

    #[tokio::test]
    async fn test_ultrawork_requires_manager() {
        let invoker = Arc::new(ScriptedInvoker::echo(vec![conductor()]));
        let err = orchestrator(invoker)
            .handle_message("chan", &"lead".into(), "!ultrawork ship", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
    }
}
