use crate::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Logical name of an agent (`"conductor"`, `"researcher"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentKey(String);

impl AgentKey {
    /// Wrap a name as an agent key.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the underlying name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend family a worker subprocess wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The primary model CLI in headless mode.
    PrimaryCli,
    /// A backend reached through an MCP stdio server.
    McpBackend,
}

impl BackendKind {
    /// Every backend, in round-robin order.
    pub const ALL: [BackendKind; 2] = [BackendKind::PrimaryCli, BackendKind::McpBackend];
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::PrimaryCli => write!(f, "primary-cli"),
            BackendKind::McpBackend => write!(f, "mcp-backend"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = MaestroError;

    fn from_str(s: &str) -> MaestroResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary-cli" | "primary_cli" | "cli" => Ok(BackendKind::PrimaryCli),
            "mcp-backend" | "mcp_backend" | "mcp" => Ok(BackendKind::McpBackend),
            other => Err(MaestroError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Coarse permission level. Lower number = more privilege.
///
/// Serialized as the bare integer `1`, `2` or `3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    /// Tier 1: full tool access; may delegate and spawn sessions.
    Full,
    /// Tier 2: read-only tools plus memory writes.
    MemoryWrite,
    /// Tier 3: strictly read-only.
    ReadOnly,
}

impl Tier {
    /// Numeric tier (1–3).
    pub fn level(self) -> u8 {
        match self {
            Tier::Full => 1,
            Tier::MemoryWrite => 2,
            Tier::ReadOnly => 3,
        }
    }

    /// The more restrictive of two tiers.
    pub fn most_restrictive(self, other: Tier) -> Tier {
        if self.level() >= other.level() {
            self
        } else {
            other
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::Full),
            2 => Ok(Tier::MemoryWrite),
            3 => Ok(Tier::ReadOnly),
            other => Err(format!("tier must be 1, 2 or 3 (got {other})")),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier.level()
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier-{}", self.level())
    }
}

/// How a worker should be launched for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Pinned backend; `None` lets the scheduler choose.
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// Model identifier passed to the backend.
    #[serde(default)]
    pub model: Option<String>,
    /// System prompt (may itself contain interpolation tokens).
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Settings for one configured agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Logical name.
    pub key: AgentKey,
    /// Backend the agent runs on.
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Permission tier.
    #[serde(default = "default_tier")]
    pub tier: Tier,
    /// Disabled agents cannot be invoked.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the agent may hand work to other agents.
    #[serde(default)]
    pub can_delegate: bool,
    /// Persona / role prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Worker count override for this agent's pool.
    #[serde(default)]
    pub pool_size: Option<usize>,
}

fn default_backend() -> BackendKind {
    BackendKind::PrimaryCli
}

fn default_tier() -> Tier {
    Tier::MemoryWrite
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// A new enabled agent with default backend and tier 2.
    pub fn new(key: impl Into<AgentKey>) -> Self {
        Self {
            key: key.into(),
            backend: default_backend(),
            model: None,
            tier: default_tier(),
            enabled: true,
            can_delegate: false,
            system_prompt: None,
            pool_size: None,
        }
    }

    /// Builder: set the tier.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Builder: set the backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Builder: allow delegation.
    pub fn delegating(mut self) -> Self {
        self.can_delegate = true;
        self
    }

    /// The launch spec implied by this configuration.
    pub fn spec(&self) -> AgentSpec {
        AgentSpec {
            backend: Some(self.backend),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
        }
    }

    /// Apply a partial update from the config API.
    pub fn apply(&mut self, patch: &AgentConfigPatch) {
        if let Some(backend) = patch.backend {
            self.backend = backend;
        }
        if let Some(model) = &patch.model {
            self.model = Some(model.clone());
        }
        if let Some(tier) = patch.tier {
            self.tier = tier;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(can_delegate) = patch.can_delegate {
            self.can_delegate = can_delegate;
        }
    }
}

/// Body of `PUT /api/multi-agent/agents/{agent_id}`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigPatch {
    /// New backend.
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// New model.
    #[serde(default)]
    pub model: Option<String>,
    /// New tier.
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Allow or forbid delegation.
    #[serde(default)]
    pub can_delegate: Option<bool>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Tier::Full).unwrap(), "1");
        let t: Tier = serde_json::from_str("3").unwrap();
        assert_eq!(t, Tier::ReadOnly);
        assert!(serde_json::from_str::<Tier>("4").is_err());
    }

    #[test]
    fn test_most_restrictive() {
        assert_eq!(Tier::Full.most_restrictive(Tier::ReadOnly), Tier::ReadOnly);
        assert_eq!(
            Tier::MemoryWrite.most_restrictive(Tier::Full),
            Tier::MemoryWrite
        );
    }

    #[test]
    fn test_backend_parse_and_display() {
        assert_eq!(
            "mcp-backend".parse::<BackendKind>().unwrap(),
            BackendKind::McpBackend
        );
        assert_eq!(BackendKind::PrimaryCli.to_string(), "primary-cli");
        assert!("gpt".parse::<BackendKind>().is_err());
        let json = serde_json::to_string(&BackendKind::McpBackend).unwrap();
        assert_eq!(json, "\"mcp-backend\"");
    }

    #[test]
    fn test_apply_patch_only_touches_given_fields() {
        let mut cfg = AgentConfig::new("researcher").with_tier(Tier::ReadOnly);
        cfg.model = Some("old".into());
        let patch: AgentConfigPatch =
            serde_json::from_str(r#"{"tier": 1, "can_delegate": true}"#).unwrap();
        cfg.apply(&patch);
        assert_eq!(cfg.tier, Tier::Full);
        assert!(cfg.can_delegate);
        assert_eq!(cfg.model.as_deref(), Some("old"));
        assert!(cfg.enabled);
    }

    #[test]
    fn test_agent_config_defaults_from_toml_like_json() {
        let cfg: AgentConfig = serde_json::from_str(r#"{"key": "writer"}"#).unwrap();
        assert_eq!(cfg.backend, BackendKind::PrimaryCli);
        assert_eq!(cfg.tier, Tier::MemoryWrite);
        assert!(cfg.enabled);
        assert!(!cfg.can_delegate);
    }
}
