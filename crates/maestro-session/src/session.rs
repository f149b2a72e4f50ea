use chrono::{DateTime, Duration, Utc};
use maestro_core::AgentKey;
use serde::{Deserialize, Serialize};

/// Marker a retrospective emits to ask for another build pass.
pub const RETRO_INCOMPLETE: &str = "RETRO_INCOMPLETE";
/// Marker a retrospective emits when the goal is met.
pub const RETRO_COMPLETE: &str = "RETRO_COMPLETE";

/// Phase of an UltraWork session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Lead agent is producing the plan.
    Planning,
    /// Plan steps are being executed.
    Building,
    /// Progress is being reviewed.
    Retrospective,
    /// Terminal.
    Done,
}

impl Phase {
    /// File name this phase is persisted under.
    pub fn file_name(self) -> &'static str {
        match self {
            Phase::Planning => "planning.json",
            Phase::Building => "building.json",
            Phase::Retrospective => "retrospective.json",
            Phase::Done => "done.json",
        }
    }

    /// All phases in protocol order.
    pub const ALL: [Phase; 4] = [
        Phase::Planning,
        Phase::Building,
        Phase::Retrospective,
        Phase::Done,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::Building => write!(f, "building"),
            Phase::Retrospective => write!(f, "retrospective"),
            Phase::Done => write!(f, "done"),
        }
    }
}

/// One completed build unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// 1-based step number across the whole session.
    pub step: u32,
    /// Agent that did the work.
    pub agent: AgentKey,
    /// What was done (agent output, possibly truncated).
    pub summary: String,
    /// Whether the step reported the plan as finished.
    #[serde(default)]
    pub plan_complete: bool,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Verdict of a retrospective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Goal met.
    Complete,
    /// More building needed (`RETRO_INCOMPLETE`).
    Incomplete,
    /// Reviewer gave no recognised marker.
    Unspecified,
}

impl Verdict {
    /// Extract the verdict from reviewer output.
    ///
    /// The last marker in the text decides, so a reviewer that quotes the
    /// instructions before answering is read by its answer.
    pub fn parse(text: &str) -> Verdict {
        match (text.rfind(RETRO_COMPLETE), text.rfind(RETRO_INCOMPLETE)) {
            (Some(c), Some(i)) if c > i => Verdict::Complete,
            (_, Some(_)) => Verdict::Incomplete,
            (Some(_), None) => Verdict::Complete,
            (None, None) => Verdict::Unspecified,
        }
    }
}

/// Result of the retrospective phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retrospective {
    /// Parsed verdict.
    pub verdict: Verdict,
    /// Reviewer text.
    pub review: String,
    /// When it was produced.
    pub reviewed_at: DateTime<Utc>,
}

/// Full persisted state of one UltraWork session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UltraWorkSession {
    /// Validated, path-safe id.
    pub session_id: String,
    /// User goal.
    pub goal: String,
    /// Chat channel or caller the session reports to.
    #[serde(default)]
    pub origin: Option<String>,
    /// Lead agent that plans and builds.
    pub lead: AgentKey,
    /// Current phase.
    pub phase: Phase,
    /// Plan text produced during Planning.
    #[serde(default)]
    pub plan: Option<String>,
    /// Append-only build log.
    #[serde(default)]
    pub progress_log: Vec<ProgressEntry>,
    /// Most recent retrospective.
    #[serde(default)]
    pub retrospective: Option<Retrospective>,
    /// Times Building was re-entered from Retrospective (0 or 1).
    #[serde(default)]
    pub retry_count: u8,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Hard deadline for the whole session.
    pub deadline: DateTime<Utc>,
    /// Why the session ended, once Done.
    #[serde(default)]
    pub end_reason: Option<String>,
    /// Monotonic write counter used to detect overlapping writers.
    #[serde(default)]
    pub revision: u64,
}

impl UltraWorkSession {
    /// Most retries a session may take.
    pub const MAX_RETRIES: u8 = 1;

    /// A fresh session in the Planning phase.
    pub fn new(
        session_id: impl Into<String>,
        goal: impl Into<String>,
        lead: AgentKey,
        budget: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            goal: goal.into(),
            origin: None,
            lead,
            phase: Phase::Planning,
            plan: None,
            progress_log: Vec::new(),
            retrospective: None,
            retry_count: 0,
            started_at: now,
            deadline: now + budget,
            end_reason: None,
            revision: 0,
        }
    }

    /// Builder: set the origin channel.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Whether a `RETRO_INCOMPLETE` verdict may still re-enter Building.
    pub fn can_retry(&self) -> bool {
        self.retry_count < Self::MAX_RETRIES
    }

    /// Number of build steps completed so far.
    pub fn steps_done(&self) -> u32 {
        self.progress_log.len() as u32
    }
}
