use crate::invoker::{AgentInvoker, Invocation};
use crate::plan::CouncilPlan;
use crate::types::{short_id, ProgressEvent, RunContext};
use maestro_core::{AgentKey, ErrorReport, MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Most rounds a council may run.
pub const MAX_ROUNDS: u8 = 5;

/// Council engine settings.
#[derive(Debug, Clone)]
pub struct CouncilConfig {
    /// Synthesizer used when the plan names none.
    pub default_synthesizer: Option<AgentKey>,
    /// Timeout for each turn, synthesis included.
    pub turn_timeout: Duration,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            default_synthesizer: None,
            turn_timeout: Duration::from_secs(300),
        }
    }
}

/// One statement in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouncilTurn {
    /// 1-based round.
    pub round: u8,
    /// Speaker.
    pub agent: AgentKey,
    /// What the speaker said.
    pub statement: String,
}

/// How a council run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilStatus {
    /// Every round ran (and the synthesis, if requested).
    Completed,
    /// A turn failed; the transcript is partial.
    Failed,
    /// Stopped by `!stop` or shutdown.
    Cancelled,
}

/// Result of a council run. A failed turn leaves the transcript up to that
/// point plus the error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilOutcome {
    /// Council session id.
    pub session_id: String,
    /// Debated topic.
    pub topic: String,
    /// How the run ended.
    pub status: CouncilStatus,
    /// Turns in speaking order.
    pub transcript: Vec<CouncilTurn>,
    /// Synthesizer output, when requested and reached.
    pub synthesis: Option<String>,
    /// Error that ended the run early.
    pub error: Option<ErrorReport>,
}

impl CouncilOutcome {
    /// The synthesis if there is one, else the rendered transcript.
    pub fn result_text(&self) -> String {
        match &self.synthesis {
            Some(s) => s.clone(),
            None => render_transcript(&self.transcript),
        }
    }
}

fn render_transcript(transcript: &[CouncilTurn]) -> String {
    transcript
        .iter()
        .map(|t| format!("[round {}] {}: {}", t.round, t.agent, t.statement))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Runs structured multi-round debates. Turns are strictly sequential.
pub struct CouncilEngine {
    invoker: Arc<dyn AgentInvoker>,
    config: CouncilConfig,
}

impl CouncilEngine {
    /// Engine calling agents through `invoker`.
    pub fn new(invoker: Arc<dyn AgentInvoker>, config: CouncilConfig) -> Self {
        Self { invoker, config }
    }

    /// Reject plans that cannot run.
    pub async fn validate(&self, plan: &CouncilPlan) -> MaestroResult<()> {
        if plan.topic.trim().is_empty() {
            return Err(MaestroError::Validation("council topic is empty".into()));
        }
        if plan.agents.is_empty() {
            return Err(MaestroError::Validation("council has no agents".into()));
        }
        if !(1..=MAX_ROUNDS).contains(&plan.rounds) {
            return Err(MaestroError::Validation(format!(
                "council rounds must be 1-{MAX_ROUNDS} (got {})",
                plan.rounds
            )));
        }
        let mut seen = HashSet::new();
        for agent in &plan.agents {
            if !seen.insert(agent) {
                return Err(MaestroError::Validation(format!(
                    "agent '{agent}' listed twice"
                )));
            }
            self.require_agent(agent).await?;
        }
        if let Some(s) = &plan.synthesizer {
            self.require_agent(s).await?;
        }
        Ok(())
    }

    async fn require_agent(&self, key: &AgentKey) -> MaestroResult<()> {
        match self.invoker.agent(key).await {
            Some(a) if a.enabled => Ok(()),
            Some(_) => Err(MaestroError::Validation(format!("agent '{key}' is disabled"))),
            None => Err(MaestroError::Validation(format!("unknown agent '{key}'"))),
        }
    }

    /// Run the council.
    ///
    /// Returns `Err` only for an invalid plan. A failing turn ends the run
    /// with the partial transcript in the outcome.
    pub async fn run(&self, plan: &CouncilPlan, ctx: &RunContext) -> MaestroResult<CouncilOutcome> {
        self.validate(plan).await?;
        let session_id = format!("council-{}", short_id());
        let scope = ctx.scope(&session_id);
        info!(
            session_id = %session_id,
            agents = plan.agents.len(),
            rounds = plan.rounds,
            "council started"
        );

        let mut outcome = CouncilOutcome {
            session_id: session_id.clone(),
            topic: plan.topic.clone(),
            status: CouncilStatus::Completed,
            transcript: Vec::new(),
            synthesis: None,
            error: None,
        };

        for round in 1..=plan.rounds {
            for agent in &plan.agents {
                let prompt = turn_prompt(plan, round, agent, &outcome.transcript);
                match self.turn(agent, prompt, &scope, ctx).await {
                    Ok(statement) => {
                        outcome.transcript.push(CouncilTurn {
                            round,
                            agent: agent.clone(),
                            statement,
                        });
                        ctx.emit(ProgressEvent::CouncilTurn {
                            session_id: session_id.clone(),
                            round,
                            agent: agent.clone(),
                        });
                    }
                    Err(e) => return Ok(self.abort(outcome, e)),
                }
            }
        }

        if plan.synthesize {
            let synthesizer = plan
                .synthesizer
                .clone()
                .or_else(|| self.config.default_synthesizer.clone())
                .unwrap_or_else(|| plan.agents[0].clone());
            let prompt = format!(
                "[COUNCIL SYNTHESIS] Topic: {}\n\nFull transcript:\n{}\n\nWrite a single synthesis of the discussion: points of agreement, open disagreements, and the recommended decision.",
                plan.topic,
                render_transcript(&outcome.transcript)
            );
            match self.turn(&synthesizer, prompt, &scope, ctx).await {
                Ok(text) => outcome.synthesis = Some(text),
                Err(e) => return Ok(self.abort(outcome, e)),
            }
        }

        info!(session_id = %session_id, turns = outcome.transcript.len(), "council finished");
        Ok(outcome)
    }

    async fn turn(
        &self,
        agent: &AgentKey,
        prompt: String,
        scope: &str,
        ctx: &RunContext,
    ) -> MaestroResult<String> {
        let invocation = Invocation::agent(agent.clone(), ctx.tier, prompt, self.config.turn_timeout)
            .with_scope(scope);
        self.invoker.invoke(invocation, &ctx.cancel).await
    }

    fn abort(&self, mut outcome: CouncilOutcome, error: MaestroError) -> CouncilOutcome {
        outcome.status = match error {
            MaestroError::Cancelled(_) => CouncilStatus::Cancelled,
            _ => CouncilStatus::Failed,
        };
        warn!(
            session_id = %outcome.session_id,
            turns = outcome.transcript.len(),
            error = %error,
            "council aborted"
        );
        outcome.error = Some(error.report());
        outcome
    }
}

fn turn_prompt(plan: &CouncilPlan, round: u8, agent: &AgentKey, transcript: &[CouncilTurn]) -> String {
    let mut prompt = format!(
        "[COUNCIL] Topic: {}\nRound {round} of {}. You are {agent}. Participants: {}.\n",
        plan.topic,
        plan.rounds,
        plan.agents
            .iter()
            .map(AgentKey::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
    if transcript.is_empty() {
        prompt.push_str("\nYou speak first. Give your position.");
    } else {
        prompt.push_str("\nTranscript so far:\n");
        prompt.push_str(&render_transcript(transcript));
        prompt.push_str("\n\nRespond to the points above and refine your position.");
    }
    prompt
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAnswer, ScriptedInvoker};
    use maestro_core::{AgentConfig, Tier};

    fn agents() -> Vec<AgentConfig> {
        vec![
            AgentConfig::new("alpha"),
            AgentConfig::new("beta"),
            AgentConfig::new("judge"),
        ]
    }

    fn plan(rounds: u8, synthesize: bool) -> CouncilPlan {
        CouncilPlan {
            topic: "naming".into(),
            agents: vec!["alpha".into(), "beta".into()],
            rounds,
            synthesize,
            synthesizer: None,
        }
    }

    #[tokio::test]
    async fn test_turn_order_and_transcript_context() {
        let invoker = Arc::new(ScriptedInvoker::new(agents(), |inv| {
            ScriptedAnswer::Text(format!("{} spoke", inv.label()))
        }));
        let engine = CouncilEngine::new(invoker.clone(), CouncilConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RunContext::new(Tier::Full).with_events(tx);

        let outcome = engine.run(&plan(2, false), &ctx).await.unwrap();
        assert_eq!(outcome.status, CouncilStatus::Completed);
        let order: Vec<(u8, &str)> = outcome
            .transcript
            .iter()
            .map(|t| (t.round, t.agent.as_str()))
            .collect();
        assert_eq!(order, vec![(1, "alpha"), (1, "beta"), (2, "alpha"), (2, "beta")]);
        assert!(outcome.synthesis.is_none());
        assert!(outcome.result_text().contains("[round 2] beta: beta spoke"));

        // beta's first turn sees alpha's statement
        let beta_prompts = invoker.prompts_for("beta");
        assert!(beta_prompts[0].contains("alpha: alpha spoke"));

        let mut turns = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ProgressEvent::CouncilTurn { .. }) {
                turns += 1;
            }
        }
        assert_eq!(turns, 4);
    }

    #[tokio::test]
    async fn test_synthesis_uses_configured_default() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let engine = CouncilEngine::new(
            invoker.clone(),
            CouncilConfig {
                default_synthesizer: Some("judge".into()),
                ..Default::default()
            },
        );
        let outcome = engine
            .run(&plan(1, true), &RunContext::new(Tier::Full))
            .await
            .unwrap();
        let synthesis = outcome.synthesis.unwrap();
        assert!(synthesis.starts_with("judge: [COUNCIL SYNTHESIS]"));
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_partial_transcript() {
        let invoker = Arc::new(ScriptedInvoker::new(agents(), |inv| {
            if inv.label().as_str() == "beta" && inv.prompt.contains("Round 2") {
                ScriptedAnswer::Error(MaestroError::Process("beta crashed".into()))
            } else {
                ScriptedAnswer::text("fine")
            }
        }));
        let engine = CouncilEngine::new(invoker.clone(), CouncilConfig::default());
        let outcome = engine
            .run(&plan(3, true), &RunContext::new(Tier::Full))
            .await
            .unwrap();
        assert_eq!(outcome.status, CouncilStatus::Failed);
        assert_eq!(outcome.transcript.len(), 3);
        assert!(outcome.synthesis.is_none());
        assert!(outcome.error.unwrap().message.contains("beta crashed"));
        // no round 3, no synthesis
        assert_eq!(invoker.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_validation() {
        let invoker = Arc::new(ScriptedInvoker::echo(agents()));
        let engine = CouncilEngine::new(invoker.clone(), CouncilConfig::default());
        let ctx = RunContext::new(Tier::Full);

        for bad in [
            plan(0, false),
            plan(6, false),
            CouncilPlan {
                agents: vec!["alpha".into(), "ghost".into()],
                ..plan(1, false)
            },
            CouncilPlan {
                topic: " ".into(),
                ..plan(1, false)
            },
            CouncilPlan {
                agents: vec!["alpha".into(), "alpha".into()],
                ..plan(1, false)
            },
        ] {
            assert!(matches!(
                engine.run(&bad, &ctx).await.unwrap_err(),
                MaestroError::Validation(_)
            ));
        }
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_council() {
        let invoker = Arc::new(ScriptedInvoker::new(agents(), |_| ScriptedAnswer::Hang));
        let engine = CouncilEngine::new(invoker, CouncilConfig::default());
        let ctx = RunContext::new(Tier::Full);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let outcome = engine.run(&plan(1, false), &ctx).await.unwrap();
        assert_eq!(outcome.status, CouncilStatus::Cancelled);
        assert!(outcome.transcript.is_empty());
    }
}
