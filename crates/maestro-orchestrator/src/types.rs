use chrono::{DateTime, Utc};
use maestro_core::{AgentKey, BackendKind, ErrorReport, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Status of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies met; waiting for a permit.
    Ready,
    /// Holding a permit and a worker.
    Running,
    /// Produced a result.
    Succeeded,
    /// The agent call failed.
    Failed,
    /// Exceeded its own timeout or the workflow deadline.
    TimedOut,
    /// Not run because a dependency did not succeed.
    Skipped,
}

impl StepStatus {
    /// Whether the step will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::TimedOut | StepStatus::Skipped
        )
    }
}

/// Runtime record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step id from the plan.
    pub id: String,
    /// Current state.
    pub status: StepStatus,
    /// Backend the step ran on.
    pub backend: Option<BackendKind>,
    /// Output of a succeeded step.
    pub result: Option<String>,
    /// Why the step failed, timed out or was skipped.
    pub error: Option<ErrorReport>,
    /// When the step got a permit.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached its final state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub(crate) fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: StepStatus::Pending,
            backend: None,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Final state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Every step succeeded.
    Succeeded,
    /// A step failed or timed out, or the workflow deadline passed.
    Failed,
    /// Stopped by `!stop` or shutdown.
    Cancelled,
}

/// Everything a caller learns from a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Generated run id.
    pub workflow_id: String,
    /// Name given in the plan, if any.
    pub name: Option<String>,
    /// Final state.
    pub status: WorkflowStatus,
    /// Per-step records in declaration order. Results of completed steps are
    /// kept even when the run fails.
    pub steps: Vec<StepRecord>,
    /// Results of terminal steps, present only when every step succeeded.
    pub outputs: BTreeMap<String, String>,
    /// Highest number of steps that were running at once.
    pub peak_concurrency: usize,
    /// `[SYSTEM]` notice for the conductor when a step failed.
    pub failure_notice: Option<String>,
}

impl WorkflowReport {
    /// Record of one step.
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Terminal outputs joined for display.
    pub fn summary(&self) -> String {
        self.outputs
            .iter()
            .map(|(id, out)| format!("## {id}\n{out}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Progress notifications surfaced to the originating chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A step got a permit and a worker.
    StepStarted {
        /// Owning workflow.
        workflow_id: String,
        /// Step id from the plan.
        step_id: String,
        /// Backend the step runs on.
        backend: BackendKind,
    },
    /// A step reached a final state.
    StepFinished {
        /// Owning workflow.
        workflow_id: String,
        /// Step id from the plan.
        step_id: String,
        /// Final state.
        status: StepStatus,
    },
    /// The whole workflow ended.
    WorkflowFinished {
        /// Workflow id.
        workflow_id: String,
        /// Final state.
        status: WorkflowStatus,
    },
    /// A council member finished speaking.
    CouncilTurn {
        /// Council session id.
        session_id: String,
        /// 1-based round.
        round: u8,
        /// Speaker.
        agent: AgentKey,
    },
    /// An UltraWork session entered a phase.
    UltraWorkPhase {
        /// Session id.
        session_id: String,
        /// Phase name.
        phase: String,
    },
    /// Free-form notice, such as a failure report.
    Notice {
        /// Notice text.
        text: String,
    },
}

/// Receiving end for [`ProgressEvent`]s.
pub type EventSink = mpsc::UnboundedSender<ProgressEvent>;

/// Where a run came from and what it may do.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Chat channel (or other origin) that started the run.
    pub origin: Option<String>,
    /// Agent that authored the plan.
    pub conductor: Option<AgentKey>,
    /// Ceiling for every invocation the run makes.
    pub tier: Tier,
    /// Fires when the run must stop.
    pub cancel: CancellationToken,
    events: Option<EventSink>,
}

impl RunContext {
    /// A context with the given ceiling tier and a fresh cancellation token.
    pub fn new(tier: Tier) -> Self {
        Self {
            origin: None,
            conductor: None,
            tier,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Builder: set the origin channel.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Builder: the agent whose plan is running.
    pub fn with_conductor(mut self, conductor: AgentKey) -> Self {
        self.conductor = Some(conductor);
        self
    }

    /// Builder: use an existing cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builder: where progress events go.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Send a progress event. Dropped silently if nobody listens.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Audit scope label for this run.
    pub fn scope(&self, run_id: &str) -> String {
        match &self.origin {
            Some(origin) => format!("{origin}/{run_id}"),
            None => run_id.to_string(),
        }
    }
}

/// Short random suffix for run ids.
pub(crate) fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
