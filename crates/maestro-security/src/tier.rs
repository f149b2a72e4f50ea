use maestro_core::{AgentKey, MaestroError, MaestroResult, Tier};
use serde::{Deserialize, Serialize};

/// Coarse class of something an agent invocation wants to do.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// Produce a text answer with no tool side effects.
    Respond,
    /// Tool that only reads (files, search, listings).
    ReadTool,
    /// Recall from the decision memory.
    MemoryRead,
    /// Persist into the decision memory.
    MemoryWrite,
    /// Tool that mutates files or external state.
    WriteTool,
    /// Arbitrary shell execution.
    ShellExec,
    /// Hand a task to another agent.
    Delegate,
    /// Start a workflow DAG.
    SpawnWorkflow,
    /// Start a council debate.
    SpawnCouncil,
    /// Start an autonomous UltraWork session.
    SpawnUltraWork,
}

impl ActionClass {
    /// Every class, in a stable order.
    pub const ALL: [ActionClass; 10] = [
        ActionClass::Respond,
        ActionClass::ReadTool,
        ActionClass::MemoryRead,
        ActionClass::MemoryWrite,
        ActionClass::WriteTool,
        ActionClass::ShellExec,
        ActionClass::Delegate,
        ActionClass::SpawnWorkflow,
        ActionClass::SpawnCouncil,
        ActionClass::SpawnUltraWork,
    ];

    /// Classify a backend tool name.
    ///
    /// Unknown tools are treated as mutating so that a read-only tier never
    /// gets access to them by accident.
    pub fn classify_tool(name: &str) -> ActionClass {
        let lower = name.to_ascii_lowercase();
        let bare = lower.rsplit(['.', '/', ':']).next().unwrap_or(&lower);

        if lower.starts_with("memory") {
            return if bare.contains("save") || bare.contains("write") || bare.contains("store") {
                ActionClass::MemoryWrite
            } else {
                ActionClass::MemoryRead
            };
        }
        if ["bash", "shell", "exec", "run_command"]
            .iter()
            .any(|p| bare.starts_with(p))
        {
            return ActionClass::ShellExec;
        }
        if ["read", "list", "search", "get", "grep", "glob", "view", "fetch"]
            .iter()
            .any(|p| bare.starts_with(p))
        {
            return ActionClass::ReadTool;
        }
        ActionClass::WriteTool
    }
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionClass::Respond => "respond",
            ActionClass::ReadTool => "read_tool",
            ActionClass::MemoryRead => "memory_read",
            ActionClass::MemoryWrite => "memory_write",
            ActionClass::WriteTool => "write_tool",
            ActionClass::ShellExec => "shell_exec",
            ActionClass::Delegate => "delegate",
            ActionClass::SpawnWorkflow => "spawn_workflow",
            ActionClass::SpawnCouncil => "spawn_council",
            ActionClass::SpawnUltraWork => "spawn_ultrawork",
        };
        f.write_str(s)
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    /// The action may proceed.
    Allow,
    /// The action is refused.
    Deny {
        /// Why it was refused.
        reason: String,
    },
}

impl Decision {
    /// Whether this is an `Allow`.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Convert a denial into [`MaestroError::PermissionDenied`].
    pub fn into_result(self) -> MaestroResult<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny { reason } => Err(MaestroError::PermissionDenied(reason)),
        }
    }
}

/// Tier × action authorization.
///
/// Stateless: the same inputs always produce the same decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionGateway;

impl PermissionGateway {
    /// Create a gateway.
    pub fn new() -> Self {
        Self
    }

    /// Decide whether `agent` running at `tier` may perform `action`.
    pub fn authorize(&self, agent: &AgentKey, tier: Tier, action: ActionClass) -> Decision {
        if Self::permits(tier, action) {
            Decision::Allow
        } else {
            Decision::Deny {
                reason: format!("agent '{agent}' at {tier} may not perform {action}"),
            }
        }
    }

    /// Authorize and convert a denial into an error.
    pub fn enforce(&self, agent: &AgentKey, tier: Tier, action: ActionClass) -> MaestroResult<()> {
        self.authorize(agent, tier, action).into_result()
    }

    /// The full set of classes a tier may perform, in [`ActionClass::ALL`] order.
    ///
    /// Passed to workers so the backend can restrict its own tool surface.
    pub fn allowed_actions(&self, tier: Tier) -> Vec<ActionClass> {
        ActionClass::ALL
            .iter()
            .copied()
            .filter(|a| Self::permits(tier, *a))
            .collect()
    }

    fn permits(tier: Tier, action: ActionClass) -> bool {
        match tier {
            Tier::Full => true,
            Tier::MemoryWrite => matches!(
                action,
                ActionClass::Respond
                    | ActionClass::ReadTool
                    | ActionClass::MemoryRead
                    | ActionClass::MemoryWrite
            ),
            Tier::ReadOnly => matches!(
                action,
                ActionClass::Respond | ActionClass::ReadTool | ActionClass::MemoryRead
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key() -> AgentKey {
        AgentKey::new("analyst")
    }

    #[test]
    fn test_tier_one_allows_everything() {
        let gw = PermissionGateway::new();
        for action in ActionClass::ALL {
            assert!(gw.authorize(&key(), Tier::Full, action).is_allowed());
        }
    }

    #[test]
    fn test_tier_two_memory_write_only() {
        let gw = PermissionGateway::new();
        assert!(gw
            .authorize(&key(), Tier::MemoryWrite, ActionClass::MemoryWrite)
            .is_allowed());
        assert!(!gw
            .authorize(&key(), Tier::MemoryWrite, ActionClass::WriteTool)
            .is_allowed());
        assert!(!gw
            .authorize(&key(), Tier::MemoryWrite, ActionClass::Delegate)
            .is_allowed());
    }

    #[test]
    fn test_tier_three_strictly_read_only() {
        let gw = PermissionGateway::new();
        assert!(gw
            .authorize(&key(), Tier::ReadOnly, ActionClass::ReadTool)
            .is_allowed());
        let denied = gw.authorize(&key(), Tier::ReadOnly, ActionClass::MemoryWrite);
        match denied {
            Decision::Deny { reason } => {
                assert!(reason.contains("analyst"));
                assert!(reason.contains("tier-3"));
                assert!(reason.contains("memory_write"));
            }
            Decision::Allow => panic!("tier 3 must not write memory"),
        }
    }

    #[test]
    fn test_enforce_returns_permission_denied() {
        let gw = PermissionGateway::new();
        let err = gw
            .enforce(&key(), Tier::ReadOnly, ActionClass::SpawnWorkflow)
            .unwrap_err();
        assert!(matches!(err, MaestroError::PermissionDenied(_)));
    }

    #[test]
    fn test_allowed_actions_per_tier() {
        let gw = PermissionGateway::new();
        assert_eq!(gw.allowed_actions(Tier::Full).len(), ActionClass::ALL.len());
        assert_eq!(
            gw.allowed_actions(Tier::ReadOnly),
            vec![
                ActionClass::Respond,
                ActionClass::ReadTool,
                ActionClass::MemoryRead
            ]
        );
    }

    #[test]
    fn test_classify_tool_names() {
        assert_eq!(ActionClass::classify_tool("read_file"), ActionClass::ReadTool);
        assert_eq!(
            ActionClass::classify_tool("memory.save"),
            ActionClass::MemoryWrite
        );
        assert_eq!(
            ActionClass::classify_tool("memory.search"),
            ActionClass::MemoryRead
        );
        assert_eq!(ActionClass::classify_tool("Bash"), ActionClass::ShellExec);
        assert_eq!(
            ActionClass::classify_tool("mcp/fs:write_file"),
            ActionClass::WriteTool
        );
        assert_eq!(
            ActionClass::classify_tool("totally_unknown"),
            ActionClass::WriteTool
        );
    }
}
