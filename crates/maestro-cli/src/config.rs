//! `maestro.toml` loading and conversion into engine settings.

use maestro_core::{AgentConfig, AgentKey, BackendKind, MaestroError, MaestroResult};
use maestro_orchestrator::{
    CouncilConfig, DelegationConfig, OrchestratorConfig, UltraWorkConfig, WorkflowConfig,
};
use maestro_pool::{BackendCommand, PoolConfig};
use maestro_watchdog::{BackoffPolicy, RunFiles, WatchdogConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything the `maestro` binary reads from its config file.
#[derive(Debug, Clone, Deserialize)]
pub struct MaestroConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSection,
    /// Worker launch commands, keyed by backend (`primary-cli`, `mcp-backend`).
    #[serde(default)]
    pub backends: BTreeMap<BackendKind, BackendCommand>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub delegation: DelegationSection,
    #[serde(default)]
    pub council: CouncilSection,
    #[serde(default)]
    pub ultrawork: UltraWorkSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_rps")]
    pub max_requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub max_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
            max_requests_per_second: default_rps(),
            max_burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_hung_timeout_secs")]
    pub hung_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            hung_timeout_secs: default_hung_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub backend_balancing: bool,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            step_timeout_secs: default_step_timeout_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            backend_balancing: true,
            max_replans: default_max_replans(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationSection {
    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: f64,
    #[serde(default = "default_burst_refill_per_sec")]
    pub burst_refill_per_sec: f64,
}

impl Default for DelegationSection {
    fn default() -> Self {
        Self {
            max_chain_length: default_max_chain_length(),
            cooldown_secs: default_cooldown_secs(),
            burst_capacity: default_burst_capacity(),
            burst_refill_per_sec: default_burst_refill_per_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CouncilSection {
    #[serde(default)]
    pub default_synthesizer: Option<AgentKey>,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for CouncilSection {
    fn default() -> Self {
        Self {
            default_synthesizer: None,
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UltraWorkSection {
    #[serde(default = "default_session_minutes")]
    pub session_minutes: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_phase_delay_ms")]
    pub phase_delay_ms: u64,
    #[serde(default)]
    pub council_review: bool,
    #[serde(default)]
    pub review_agents: Vec<AgentKey>,
}

impl Default for UltraWorkSection {
    fn default() -> Self {
        Self {
            session_minutes: default_session_minutes(),
            max_steps: default_max_steps(),
            phase_delay_ms: default_phase_delay_ms(),
            council_review: false,
            review_agents: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    /// Defaults to `http://<server.host>:<server.port>/health`.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Program and arguments that start the daemon. Defaults to this
    /// binary's own `serve` subcommand.
    #[serde(default)]
    pub daemon_command: Vec<String>,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            health_url: None,
            interval_secs: default_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            max_restarts: default_max_restarts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max_ms(),
            daemon_command: vec![],
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_rps() -> f64 {
    10.0
}
fn default_burst() -> f64 {
    50.0
}
fn default_pool_size() -> usize {
    1
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_hung_timeout_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_max_concurrent_steps() -> usize {
    3
}
fn default_step_timeout_secs() -> u64 {
    600
}
fn default_workflow_timeout_secs() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}
fn default_max_replans() -> u32 {
    2
}
fn default_max_chain_length() -> usize {
    3
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_burst_capacity() -> f64 {
    5.0
}
fn default_burst_refill_per_sec() -> f64 {
    5.0 / 60.0
}
fn default_turn_timeout_secs() -> u64 {
    300
}
fn default_session_minutes() -> u64 {
    60
}
fn default_max_steps() -> u32 {
    50
}
fn default_phase_delay_ms() -> u64 {
    2000
}
fn default_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_max_restarts() -> u32 {
    10
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    60_000
}

impl MaestroConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> MaestroResult<Self> {
        let config: MaestroConfig =
            toml::from_str(text).map_err(|e| MaestroError::Config(format!("Failed to parse config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> MaestroResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MaestroError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    fn check(&self) -> MaestroResult<()> {
        if self.workflow.max_concurrent_steps == 0 {
            return Err(MaestroError::Config(
                "workflow.max_concurrent_steps must be at least 1".into(),
            ));
        }
        if self.pool.pool_size == 0 {
            return Err(MaestroError::Config("pool.pool_size must be at least 1".into()));
        }
        for agent in &self.agents {
            if !self.backends.contains_key(&agent.backend) {
                return Err(MaestroError::Config(format!(
                    "agent '{}' uses backend '{}' which has no [backends] entry",
                    agent.key, agent.backend
                )));
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            default_pool_size: self.pool.pool_size,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            hung_timeout: Duration::from_secs(self.pool.hung_timeout_secs),
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let workflow = WorkflowConfig {
            max_concurrent_steps: self.workflow.max_concurrent_steps,
            step_timeout: Duration::from_secs(self.workflow.step_timeout_secs),
            workflow_timeout: Duration::from_secs(self.workflow.workflow_timeout_secs),
            backend_balancing: self.workflow.backend_balancing,
            ..WorkflowConfig::default()
        };
        let delegation = DelegationConfig {
            max_chain_length: self.delegation.max_chain_length,
            cooldown: Duration::from_secs(self.delegation.cooldown_secs),
            burst_capacity: self.delegation.burst_capacity,
            burst_refill_per_sec: self.delegation.burst_refill_per_sec,
            ..DelegationConfig::default()
        };
        OrchestratorConfig {
            workflow,
            council: self.council_config(),
            delegation,
            max_replans: self.workflow.max_replans,
            ..OrchestratorConfig::default()
        }
    }

    pub fn council_config(&self) -> CouncilConfig {
        CouncilConfig {
            default_synthesizer: self.council.default_synthesizer.clone(),
            turn_timeout: Duration::from_secs(self.council.turn_timeout_secs),
        }
    }

    pub fn ultrawork_config(&self) -> UltraWorkConfig {
        UltraWorkConfig {
            session_budget: Duration::from_secs(self.ultrawork.session_minutes * 60),
            max_steps: self.ultrawork.max_steps,
            phase_delay: Duration::from_millis(self.ultrawork.phase_delay_ms),
            council_review: self.ultrawork.council_review,
            review_agents: self.ultrawork.review_agents.clone(),
            ..UltraWorkConfig::default()
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_secs(self.watchdog.interval_secs),
            max_restarts: self.watchdog.max_restarts,
            backoff: BackoffPolicy {
                base_ms: self.watchdog.backoff_base_ms,
                factor: self.watchdog.backoff_factor,
                max_ms: self.watchdog.backoff_max_ms,
            },
        }
    }

    pub fn health_url(&self) -> String {
        self.watchdog.health_url.clone().unwrap_or_else(|| {
            format!("http://{}:{}/health", self.server.host, self.server.port)
        })
    }

    /// Pid files, stop marker and watchdog state live here.
    pub fn run_files(&self) -> RunFiles {
        RunFiles::new(self.data_dir.join("run"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::Tier;
    use maestro_pool::WireFormat;

    const FULL: &str = r#"
data_dir = "/var/lib/maestro"

[server]
port = 4100
api_keys = ["k1"]

[pool]
pool_size = 2
hung_timeout_secs = 60

[backends.primary-cli]
command = "model-cli"
args = ["--headless"]

[backends.mcp-backend]
command = "mcp-server"
wire = "json_rpc"
env = { TOKEN = "x" }

[[agents]]
key = "conductor"
tier = 1
can_delegate = true

[[agents]]
key = "scout"
backend = "mcp-backend"
model = "small"
tier = 3

[workflow]
max_concurrent_steps = 5
max_replans = 1

[delegation]
cooldown_secs = 60

[council]
default_synthesizer = "conductor"

[ultrawork]
session_minutes = 15
council_review = true
review_agents = ["conductor", "scout"]

[watchdog]
max_restarts = 4
backoff_base_ms = 250
daemon_command = ["maestro", "serve"]
"#;

    #[test]
    fn test_full_config() {
        let config = MaestroConfig::parse(FULL).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/maestro"));
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.server.host, "127.0.0.1");

        let mcp = &config.backends[&BackendKind::McpBackend];
        assert_eq!(mcp.wire, WireFormat::JsonRpc);
        assert_eq!(mcp.env["TOKEN"], "x");
        assert_eq!(config.backends[&BackendKind::PrimaryCli].wire, WireFormat::JsonLines);

        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].tier, Tier::Full);
        assert!(config.agents[0].can_delegate);
        assert_eq!(config.agents[1].backend, BackendKind::McpBackend);
        assert_eq!(config.agents[1].tier, Tier::ReadOnly);

        let orch = config.orchestrator_config();
        assert_eq!(orch.workflow.max_concurrent_steps, 5);
        assert_eq!(orch.max_replans, 1);
        assert_eq!(orch.delegation.cooldown, Duration::from_secs(60));
        assert_eq!(orch.delegation.max_chain_length, 3);
        assert_eq!(orch.council.default_synthesizer, Some("conductor".into()));

        let uw = config.ultrawork_config();
        assert_eq!(uw.session_budget, Duration::from_secs(15 * 60));
        assert!(uw.council_review);
        assert_eq!(uw.review_agents.len(), 2);

        let wd = config.watchdog_config();
        assert_eq!(wd.max_restarts, 4);
        assert_eq!(wd.backoff.base_ms, 250);
        assert_eq!(wd.backoff.max_ms, 60_000);
        assert_eq!(config.health_url(), "http://127.0.0.1:4100/health");
        assert_eq!(config.pool_config().hung_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MaestroConfig::parse("").unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.workflow.max_concurrent_steps, 3);
        assert_eq!(config.delegation.cooldown_secs, 300);
        assert_eq!(config.ultrawork.session_minutes, 60);
        assert_eq!(config.ultrawork.max_steps, 50);
        assert_eq!(config.watchdog.interval_secs, 30);
        assert_eq!(config.watchdog.max_restarts, 10);
        assert_eq!(config.run_files().dir(), Path::new("./data/run"));
    }

    #[test]
    fn test_agent_without_backend_entry_rejected() {
        let err = MaestroConfig::parse("[[agents]]\nkey = \"a\"\n").unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
        assert!(err.to_string().contains("primary-cli"));
    }

    #[test]
    fn test_invalid_tier_rejected() {
        let text = "[backends.primary-cli]\ncommand = \"x\"\n[[agents]]\nkey = \"a\"\ntier = 7\n";
        assert!(MaestroConfig::parse(text).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(MaestroConfig::parse("[workflow]\nmax_concurrent_steps = 0\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = MaestroConfig::load(Path::new("/nonexistent/maestro.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
