//! Autonomous Plan → Build → Retrospective sessions.
//!
//! Every phase transition is committed to the [`PhaseStore`] before the next
//! phase starts, so a restarted daemon can pick a session up from its last
//! persisted phase with [`UltraWorkManager::resume`].

use crate::council::{CouncilConfig, CouncilEngine, CouncilStatus};
use crate::delegation::{parse_delegations, DelegationChain, DelegationManager};
use crate::invoker::{AgentInvoker, Invocation};
use crate::memory::MemoryStore;
use crate::plan::CouncilPlan;
use crate::types::{short_id, ProgressEvent, RunContext};
use chrono::Utc;
use maestro_core::{AgentKey, MaestroError, MaestroResult};
use maestro_session::session::{RETRO_COMPLETE, RETRO_INCOMPLETE};
use maestro_session::{Phase, PhaseStore, ProgressEntry, Retrospective, UltraWorkSession, Verdict};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Marker a build step emits once the plan is finished.
pub const PLAN_COMPLETE: &str = "PLAN_COMPLETE";

/// Progress entries quoted back to the lead on each build step.
const RECENT_PROGRESS: usize = 5;

/// Limits and pacing for UltraWork sessions.
#[derive(Debug, Clone)]
pub struct UltraWorkConfig {
    /// Wall-clock budget per session.
    pub session_budget: Duration,
    /// Most build steps per session, across retries.
    pub max_steps: u32,
    /// Pause between steps and phase transitions.
    pub phase_delay: Duration,
    /// Run a council over the plan and the retrospective.
    pub council_review: bool,
    /// Council members for reviews.
    pub review_agents: Vec<AgentKey>,
    /// Longest single lead call; the session deadline may cut it shorter.
    pub step_timeout: Duration,
}

impl Default for UltraWorkConfig {
    fn default() -> Self {
        Self {
            session_budget: Duration::from_secs(60 * 60),
            max_steps: 50,
            phase_delay: Duration::from_secs(2),
            council_review: false,
            review_agents: Vec::new(),
            step_timeout: Duration::from_secs(600),
        }
    }
}

/// Drives UltraWork sessions.
pub struct UltraWorkManager {
    invoker: Arc<dyn AgentInvoker>,
    store: Arc<dyn PhaseStore>,
    memory: Arc<dyn MemoryStore>,
    council: CouncilEngine,
    delegation: Option<Arc<DelegationManager>>,
    config: UltraWorkConfig,
}

impl UltraWorkManager {
    /// A manager without delegation; see [`Self::with_delegation`].
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        store: Arc<dyn PhaseStore>,
        memory: Arc<dyn MemoryStore>,
        config: UltraWorkConfig,
    ) -> Self {
        let council = CouncilEngine::new(invoker.clone(), CouncilConfig::default());
        Self {
            invoker,
            store,
            memory,
            council,
            delegation: None,
            config,
        }
    }

    /// Builder: settings for review councils.
    pub fn with_council_config(mut self, config: CouncilConfig) -> Self {
        self.council = CouncilEngine::new(self.invoker.clone(), config);
        self
    }

    /// Builder: let build steps hand work to other agents.
    pub fn with_delegation(mut self, delegation: Arc<DelegationManager>) -> Self {
        self.delegation = Some(delegation);
        self
    }

    /// Where sessions are persisted.
    pub fn store(&self) -> &Arc<dyn PhaseStore> {
        &self.store
    }

    /// Start a new session for `goal` led by `lead` and run it to completion.
    pub async fn start(
        &self,
        goal: &str,
        lead: AgentKey,
        ctx: &RunContext,
    ) -> MaestroResult<UltraWorkSession> {
        match self.invoker.agent(&lead).await {
            Some(a) if a.enabled => {}
            Some(_) => return Err(MaestroError::Agent(format!("agent '{lead}' is disabled"))),
            None => return Err(MaestroError::Agent(format!("unknown agent '{lead}'"))),
        }
        if goal.trim().is_empty() {
            return Err(MaestroError::Validation("ultrawork goal is empty".into()));
        }

        let session_id = format!("uw-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), short_id());
        let budget = chrono::Duration::from_std(self.config.session_budget)
            .unwrap_or_else(|_| chrono::Duration::minutes(60));
        let mut session = UltraWorkSession::new(session_id, goal, lead, budget);
        if let Some(origin) = &ctx.origin {
            session = session.with_origin(origin.clone());
        }
        let session = self.store.create(&session).await?;
        info!(session_id = %session.session_id, lead = %session.lead, "ultrawork session started");
        self.drive(session, ctx).await
    }

    /// Continue a persisted session from its last phase.
    pub async fn resume(&self, session_id: &str, ctx: &RunContext) -> MaestroResult<UltraWorkSession> {
        if let Some(reason) = self.store.inspection_reason(session_id).await? {
            return Err(MaestroError::StateCorruption(format!(
                "session '{session_id}' is flagged for inspection: {reason}"
            )));
        }
        let session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| MaestroError::Session(format!("session '{session_id}' not found")))?;
        if session.phase == Phase::Done {
            return Ok(session);
        }
        info!(session_id, phase = %session.phase, "ultrawork session resumed");
        self.drive(session, ctx).await
    }

    async fn drive(
        &self,
        mut session: UltraWorkSession,
        ctx: &RunContext,
    ) -> MaestroResult<UltraWorkSession> {
        match self.run_phases(&mut session, ctx).await {
            Ok(()) => Ok(session),
            Err(e) => {
                // A flagged session is left exactly as the store has it.
                if !matches!(e, MaestroError::StateCorruption(_)) {
                    let mut ended = session.clone();
                    ended.phase = Phase::Done;
                    ended.end_reason = Some(match &e {
                        MaestroError::Cancelled(_) => "cancelled".to_string(),
                        other => format!("failed: {other}"),
                    });
                    if let Err(persist) = self.store.commit(&ended).await {
                        warn!(session_id = %session.session_id, error = %persist, "could not persist session end");
                    }
                }
                warn!(session_id = %session.session_id, error = %e, "ultrawork session ended early");
                Err(e)
            }
        }
    }

    async fn run_phases(&self, session: &mut UltraWorkSession, ctx: &RunContext) -> MaestroResult<()> {
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(self.cancelled(session));
            }
            ctx.emit(ProgressEvent::UltraWorkPhase {
                session_id: session.session_id.clone(),
                phase: session.phase.to_string(),
            });
            match session.phase {
                Phase::Planning => self.plan(session, ctx).await?,
                Phase::Building => self.build(session, ctx).await?,
                Phase::Retrospective => self.review(session, ctx).await?,
                Phase::Done => {
                    info!(
                        session_id = %session.session_id,
                        steps = session.steps_done(),
                        retries = session.retry_count,
                        reason = session.end_reason.as_deref().unwrap_or("-"),
                        "ultrawork session done"
                    );
                    return Ok(());
                }
            }
            if session.phase != Phase::Done {
                self.pause(session, ctx).await?;
            }
        }
    }

    fn cancelled(&self, session: &UltraWorkSession) -> MaestroError {
        MaestroError::Cancelled(format!("ultrawork session {} stopped", session.session_id))
    }

    async fn pause(&self, session: &UltraWorkSession, ctx: &RunContext) -> MaestroResult<()> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(self.cancelled(session)),
            _ = tokio::time::sleep(self.config.phase_delay) => Ok(()),
        }
    }

    /// Timeout for the next lead call: the step timeout, cut short by the
    /// session deadline. The flag is set when the deadline did the cutting.
    fn call_budget(&self, session: &UltraWorkSession) -> (Duration, bool) {
        let left = time_left(session);
        if left < self.config.step_timeout {
            (left, true)
        } else {
            (self.config.step_timeout, false)
        }
    }

    async fn ask_lead(
        &self,
        session: &UltraWorkSession,
        prompt: String,
        timeout: Duration,
        ctx: &RunContext,
    ) -> MaestroResult<String> {
        let invocation = Invocation::agent(session.lead.clone(), ctx.tier, prompt, timeout)
        .with_scope(ctx.scope(&session.session_id));
        self.invoker.invoke(invocation, &ctx.cancel).await
    }

    /// Run a review council, if configured. Failed councils are logged and
    /// skipped; a stop request is propagated.
    async fn council_review(
        &self,
        topic: String,
        lead: &AgentKey,
        ctx: &RunContext,
    ) -> MaestroResult<Option<String>> {
        if !self.config.council_review || self.config.review_agents.is_empty() {
            return Ok(None);
        }
        let plan = CouncilPlan {
            topic,
            agents: self.config.review_agents.clone(),
            rounds: 1,
            synthesize: true,
            synthesizer: Some(lead.clone()),
        };
        match self.council.run(&plan, ctx).await {
            Ok(outcome) => match outcome.status {
                CouncilStatus::Completed => Ok(Some(outcome.result_text())),
                CouncilStatus::Cancelled => Err(MaestroError::Cancelled("review council stopped".into())),
                CouncilStatus::Failed => {
                    warn!(session_id = %outcome.session_id, "review council failed; continuing without it");
                    Ok(None)
                }
            },
            Err(e) => {
                warn!(error = %e, "review council rejected; continuing without it");
                Ok(None)
            }
        }
    }

    async fn plan(&self, session: &mut UltraWorkSession, ctx: &RunContext) -> MaestroResult<()> {
        let checkpoint = match self.memory.load_checkpoint().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "checkpoint unavailable");
                None
            }
        };
        let review = self
            .council_review(format!("Approach for: {}", session.goal), &session.lead, ctx)
            .await?;

        let mut prompt = format!("[ULTRAWORK PLANNING] Goal: {}\n", session.goal);
        if let Some(cp) = checkpoint {
            prompt.push_str(&format!("\nLast checkpoint:\n{cp}\n"));
        }
        if let Some(r) = review {
            prompt.push_str(&format!("\nCouncil review:\n{r}\n"));
        }
        prompt.push_str("\nWrite a numbered, step-by-step plan to reach the goal.");

        let (timeout, bounded) = self.call_budget(session);
        let mut next = session.clone();
        match self.ask_lead(session, prompt, timeout, ctx).await {
            Ok(plan) => {
                next.plan = Some(plan);
                next.phase = Phase::Building;
            }
            Err(MaestroError::Timeout(_)) if bounded => {
                info!(session_id = %session.session_id, "session deadline reached while planning");
                next.phase = Phase::Retrospective;
            }
            Err(e) => return Err(e),
        }
        *session = self.store.commit(&next).await?;
        info!(session_id = %session.session_id, phase = %session.phase, "ultrawork plan committed");
        Ok(())
    }

    async fn build(&self, session: &mut UltraWorkSession, ctx: &RunContext) -> MaestroResult<()> {
        loop {
            if session.steps_done() >= self.config.max_steps {
                info!(session_id = %session.session_id, max_steps = self.config.max_steps, "step limit reached");
                break;
            }
            if session.is_expired(Utc::now()) {
                info!(session_id = %session.session_id, "session deadline reached");
                break;
            }
            if ctx.cancel.is_cancelled() {
                return Err(self.cancelled(session));
            }

            let step = session.steps_done() + 1;
            let recalled = match self.memory.search(&session.goal, 3).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "memory search failed");
                    Vec::new()
                }
            };
            let prompt = build_prompt(session, step, &recalled);
            let (timeout, bounded) = self.call_budget(session);
            let output = match self.ask_lead(session, prompt, timeout, ctx).await {
                Ok(out) => out,
                Err(MaestroError::Timeout(_)) if bounded => {
                    info!(session_id = %session.session_id, step, "session deadline reached mid-step");
                    break;
                }
                Err(e) => return Err(e),
            };

            let summary = self.run_delegations(session, &output, ctx).await?;
            let plan_complete = output.contains(PLAN_COMPLETE);
            let entry = ProgressEntry {
                step,
                agent: session.lead.clone(),
                summary,
                plan_complete,
                completed_at: Utc::now(),
            };
            *session = self
                .store
                .append_progress(&session.session_id, session.revision, entry.clone())
                .await?;
            if let Err(e) = self
                .memory
                .save(json!({
                    "kind": "ultrawork_progress",
                    "session_id": session.session_id,
                    "step": entry.step,
                    "summary": entry.summary,
                }))
                .await
            {
                warn!(error = %e, "could not save progress to memory");
            }
            info!(session_id = %session.session_id, step, plan_complete, "build step recorded");

            if plan_complete {
                break;
            }
            self.pause(session, ctx).await?;
        }

        let mut next = session.clone();
        next.phase = Phase::Retrospective;
        *session = self.store.commit(&next).await?;
        Ok(())
    }

    /// Execute `DELEGATE::` directives in a step's output and fold the results
    /// into the step summary.
    async fn run_delegations(
        &self,
        session: &UltraWorkSession,
        output: &str,
        ctx: &RunContext,
    ) -> MaestroResult<String> {
        let mut summary = output.to_string();
        let Some(manager) = &self.delegation else {
            return Ok(summary);
        };
        let directives = parse_delegations(output);
        if directives.is_empty() {
            return Ok(summary);
        }
        let mut chain = DelegationChain::new(session.lead.clone());
        if let Some(origin) = &session.origin {
            chain = chain.with_origin(origin.clone());
        }
        for d in directives {
            if session.is_expired(Utc::now()) {
                summary.push_str(&format!(
                    "\n\n[delegation to {} skipped: session deadline reached]",
                    d.agent
                ));
                continue;
            }
            // Cancelled at the deadline; a stop request still arrives through the parent.
            let bounded = ctx.cancel.child_token();
            let call = manager.delegate(&mut chain, &session.lead, &d.agent, &d.task, &bounded);
            tokio::pin!(call);
            let result = tokio::select! {
                r = &mut call => r,
                _ = tokio::time::sleep(time_left(session)) => {
                    bounded.cancel();
                    call.await
                }
            };
            match result {
                Ok(result) => summary.push_str(&format!("\n\n[{}] {result}", d.agent)),
                Err(MaestroError::Cancelled(_)) if !ctx.cancel.is_cancelled() => summary.push_str(
                    &format!("\n\n[delegation to {} stopped: session deadline reached]", d.agent),
                ),
                Err(e @ MaestroError::Cancelled(_)) => return Err(e),
                Err(e) => summary.push_str(&format!("\n\n[delegation to {} failed: {e}]", d.agent)),
            }
        }
        Ok(summary)
    }

    async fn review(&self, session: &mut UltraWorkSession, ctx: &RunContext) -> MaestroResult<()> {
        let log = render_progress(session, session.progress_log.len());
        let council = self
            .council_review(format!("Retrospective for: {}", session.goal), &session.lead, ctx)
            .await?;

        let mut prompt = format!(
            "[ULTRAWORK RETROSPECTIVE] Goal: {}\n\nProgress log:\n{log}\n",
            session.goal
        );
        if let Some(c) = council {
            prompt.push_str(&format!("\nCouncil review:\n{c}\n"));
        }
        prompt.push_str(&format!(
            "\nJudge whether the goal is met. End with {RETRO_COMPLETE} if it is, or {RETRO_INCOMPLETE} if more building is needed."
        ));

        // A deadline-forced retrospective still gets one full call for its verdict.
        let timeout = if session.is_expired(Utc::now()) {
            self.config.step_timeout
        } else {
            self.call_budget(session).0
        };
        let text = self.ask_lead(session, prompt, timeout, ctx).await?;
        let verdict = Verdict::parse(&text);
        let mut next = session.clone();
        next.retrospective = Some(Retrospective {
            verdict,
            review: text,
            reviewed_at: Utc::now(),
        });
        if verdict == Verdict::Incomplete && next.can_retry() {
            next.retry_count += 1;
            next.phase = Phase::Building;
            info!(session_id = %next.session_id, retry = next.retry_count, "retrospective incomplete; building again");
        } else {
            next.phase = Phase::Done;
            next.end_reason = Some(
                match verdict {
                    Verdict::Complete => "complete",
                    Verdict::Incomplete => "incomplete after retry",
                    Verdict::Unspecified => "no verdict",
                }
                .to_string(),
            );
        }
        *session = self.store.commit(&next).await?;

        if let Err(e) = self
            .memory
            .save(json!({
                "kind": "ultrawork_retrospective",
                "session_id": session.session_id,
                "verdict": verdict,
                "retry_count": session.retry_count,
            }))
            .await
        {
            warn!(error = %e, "could not save retrospective to memory");
        }
        Ok(())
    }
}

fn time_left(session: &UltraWorkSession) -> Duration {
    (session.deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn render_progress(session: &UltraWorkSession, last: usize) -> String {
    let skip = session.progress_log.len().saturating_sub(last);
    let lines: Vec<String> = session
        .progress_log
        .iter()
        .skip(skip)
        .map(|e| format!("{}. {}", e.step, e.summary))
        .collect();
    if lines.is_empty() {
        "(no steps completed)".to_string()
    } else {
        lines.join("\n")
    }
}

fn build_prompt(session: &UltraWorkSession, step: u32, recalled: &[serde_json::Value]) -> String {
    let mut prompt = format!(
        "[ULTRAWORK BUILD] Goal: {}\n\nPlan:\n{}\n\nRecent progress:\n{}\n",
        session.goal,
        session.plan.as_deref().unwrap_or("(no plan)"),
        render_progress(session, RECENT_PROGRESS)
    );
    if session.retry_count > 0 {
        if let Some(r) = &session.retrospective {
            prompt.push_str(&format!("\nPrevious retrospective:\n{}\n", r.review));
        }
    }
    if !recalled.is_empty() {
        prompt.push_str("\nRelevant decisions:\n");
        for r in recalled {
            prompt.push_str(&format!("- {r}\n"));
        }
    }
    prompt.push_str(&format!(
        "\nCarry out step {step}. Hand sub-tasks to other agents with DELEGATE::agent::task. Say {PLAN_COMPLETE} once every step of the plan is done."
    ));
    prompt
}
