//! Tolerant extraction of `workflow_plan` and `council_plan` payloads from
//! free-form conductor output.
//!
//! Conductors wrap plans in prose, fenced code blocks and CRLF line endings.
//! [`parse_plan`] digs out candidate JSON objects, classifies them and returns
//! a typed [`ParsedPlan`]. Nothing downstream ever sees an untyped map.

use maestro_core::{AgentKey, AgentSpec};
use serde::{Deserialize, Serialize};

/// One step as written by a conductor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    /// Unique step id.
    #[serde(default)]
    pub id: String,
    /// Backend, model and system prompt for the step's worker.
    #[serde(default, alias = "agent_spec", alias = "agentSpec")]
    pub agent: Option<AgentSpec>,
    /// Steps that must succeed first.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Prompt with `{{step_id.output}}` placeholders.
    #[serde(
        default,
        alias = "prompt",
        alias = "input_template",
        alias = "inputTemplate"
    )]
    pub prompt_template: String,
    /// Requested permission tier (1-3). Clamped to the conductor's tier.
    #[serde(default)]
    pub tier: Option<u8>,
    /// Per-step timeout override.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A DAG of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<StepPlan>,
    /// Parallelism cap override.
    #[serde(default, alias = "maxConcurrentSteps")]
    pub max_concurrent_steps: Option<usize>,
    /// Round-robin unpinned steps across backends.
    #[serde(default, alias = "backendBalancing")]
    pub backend_balancing: Option<bool>,
}

/// A multi-round discussion between agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CouncilPlan {
    /// What the council discusses.
    #[serde(default)]
    pub topic: String,
    /// Participants, in speaking order.
    #[serde(default)]
    pub agents: Vec<AgentKey>,
    /// Number of rounds (1-5).
    #[serde(default = "default_rounds")]
    pub rounds: u8,
    /// Whether to produce a synthesis after the last round.
    #[serde(default)]
    pub synthesize: bool,
    /// Agent that writes the synthesis.
    #[serde(default)]
    pub synthesizer: Option<AgentKey>,
}

fn default_rounds() -> u8 {
    1
}

/// Result of [`parse_plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPlan {
    /// A workflow plan (not yet validated).
    Workflow(WorkflowPlan),
    /// A council plan (not yet validated).
    Council(CouncilPlan),
    /// Something plan-shaped that could not be decoded.
    Malformed {
        /// What went wrong.
        reason: String,
    },
    /// The text carries no plan.
    Absent,
}

const WORKFLOW_TAG: &str = "workflow_plan";
const COUNCIL_TAG: &str = "council_plan";

/// Extract a plan from conductor output.
pub fn parse_plan(text: &str) -> ParsedPlan {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mentions_plan = normalized.contains(WORKFLOW_TAG) || normalized.contains(COUNCIL_TAG);

    let mut candidates: Vec<&str> = fenced_blocks(&normalized);
    candidates.push(normalized.trim());
    candidates.extend(json_objects(&normalized));

    let mut first_error = None;
    for candidate in candidates {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
            continue;
        };
        match classify(value) {
            Some(Ok(plan)) => return plan,
            Some(Err(reason)) => {
                first_error.get_or_insert(reason);
            }
            None => {}
        }
    }

    match first_error {
        Some(reason) => ParsedPlan::Malformed { reason },
        None if mentions_plan => ParsedPlan::Malformed {
            reason: "plan marker found but no decodable JSON object".into(),
        },
        None => ParsedPlan::Absent,
    }
}

enum Kind {
    Workflow,
    Council,
}

fn classify(value: serde_json::Value) -> Option<Result<ParsedPlan, String>> {
    let serde_json::Value::Object(mut map) = value else {
        return None;
    };

    let (kind, body) = if let Some(inner) = map.remove(WORKFLOW_TAG) {
        (Kind::Workflow, inner)
    } else if let Some(inner) = map.remove(COUNCIL_TAG) {
        (Kind::Council, inner)
    } else {
        let tag = map
            .get("type")
            .or_else(|| map.get("kind"))
            .and_then(|t| t.as_str())
            .map(str::to_string);
        let body = serde_json::Value::Object(map);
        match tag.as_deref() {
            Some(WORKFLOW_TAG) => (Kind::Workflow, body),
            Some(COUNCIL_TAG) => (Kind::Council, body),
            _ if body.get("steps").is_some_and(|s| s.is_array()) => (Kind::Workflow, body),
            _ if body.get("topic").is_some() && body.get("agents").is_some() => {
                (Kind::Council, body)
            }
            _ => return None,
        }
    };

    Some(match kind {
        Kind::Workflow => serde_json::from_value::<WorkflowPlan>(body)
            .map(ParsedPlan::Workflow)
            .map_err(|e| format!("invalid workflow_plan: {e}")),
        Kind::Council => serde_json::from_value::<CouncilPlan>(body)
            .map(ParsedPlan::Council)
            .map_err(|e| format!("invalid council_plan: {e}")),
    })
}

/// Bodies of ``` fenced blocks, in order.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // skip the info string (e.g. `json`)
        let body_start = after.find('\n').map_or(after.len(), |i| i + 1);
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(body[..close].trim());
        rest = &body[close + 3..];
    }
    blocks
}

/// Balanced top-level `{...}` spans, string- and escape-aware.
fn json_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (j, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(j);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(j) => {
                spans.push(&text[start..=j]);
                i = j + 1;
            }
            None => i += 1,
        }
    }
    spans
}
