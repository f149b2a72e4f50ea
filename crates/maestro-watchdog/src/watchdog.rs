use crate::backoff::BackoffPolicy;
use crate::control::{remove_if_exists, write_pid, DaemonControl, RunFiles};
use crate::probe::HealthProbe;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Watchdog settings.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Time between health checks.
    pub interval: Duration,
    /// Restarts allowed for a continuously failing daemon.
    pub max_restarts: u32,
    /// Delay before each restart.
    pub backoff: BackoffPolicy,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_restarts: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Overall verdict of the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogStatus {
    /// No check has run yet.
    Starting,
    /// Last check passed.
    Healthy,
    /// Failing checks; restarts are being attempted.
    Recovering,
    /// Restart budget spent; the daemon is considered permanently down.
    Fatal,
    /// A deliberate stop was requested.
    Stopped,
}

/// Supervision counters, persisted after every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogState {
    /// Overall verdict.
    pub status: WatchdogStatus,
    /// Pid of the supervised daemon, when known.
    pub daemon_pid: Option<u32>,
    /// Failed checks since the last healthy one.
    pub consecutive_failures: u32,
    /// Restarts since the last healthy check.
    pub restart_count: u32,
    /// Delay used before the last restart.
    pub backoff_ms: u64,
    /// When the next probe is due.
    pub next_check_at: Option<DateTime<Utc>>,
    /// Last probe or restart failure.
    pub last_error: Option<String>,
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self {
            status: WatchdogStatus::Starting,
            daemon_pid: None,
            consecutive_failures: 0,
            restart_count: 0,
            backoff_ms: 0,
            next_check_at: None,
            last_error: None,
        }
    }
}

impl WatchdogState {
    /// Read the last persisted state.
    pub async fn load(files: &RunFiles) -> Option<WatchdogState> {
        let text = tokio::fs::read_to_string(files.watchdog_state()).await.ok()?;
        serde_json::from_str(&text).ok()
    }
}

/// Result of one supervision tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The probe passed.
    Healthy,
    /// The probe failed and the daemon was restarted.
    Restarted,
    /// The restart budget is spent.
    Exhausted,
    /// The stop marker was seen.
    StopRequested,
}

/// Polls the daemon and restarts it on failure.
pub struct Watchdog {
    probe: Arc<dyn HealthProbe>,
    control: Arc<dyn DaemonControl>,
    files: RunFiles,
    config: WatchdogConfig,
    state: WatchdogState,
}

impl Watchdog {
    /// A watchdog in the `Starting` state.
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        control: Arc<dyn DaemonControl>,
        files: RunFiles,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            probe,
            control,
            files,
            config,
            state: WatchdogState::default(),
        }
    }

    /// Current counters.
    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    /// Supervise until stopped, cancelled, or out of restarts.
    ///
    /// Writes `watchdog.pid` for the duration and clears any stale stop
    /// marker first. Exhausting the restart budget is returned as an error.
    pub async fn run(&mut self, shutdown: CancellationToken) -> MaestroResult<WatchdogState> {
        self.files.clear_stop().await?;
        write_pid(&self.files.watchdog_pid(), std::process::id()).await?;
        self.state.daemon_pid = self.control.current_pid().await;
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_restarts = self.config.max_restarts,
            daemon_pid = ?self.state.daemon_pid,
            "watchdog started"
        );

        let result = self.supervise(&shutdown).await;
        if let Err(e) = remove_if_exists(&self.files.watchdog_pid()).await {
            warn!(error = %e, "could not remove watchdog pid file");
        }
        result
    }

    async fn supervise(&mut self, shutdown: &CancellationToken) -> MaestroResult<WatchdogState> {
        loop {
            match self.tick(shutdown).await? {
                Tick::StopRequested => {
                    info!("stop requested; watchdog exiting");
                    return Ok(self.state.clone());
                }
                Tick::Exhausted => {
                    return Err(MaestroError::Process(format!(
                        "daemon is permanently down after {} restart(s)",
                        self.state.restart_count
                    )));
                }
                Tick::Healthy | Tick::Restarted => {}
            }

            self.state.next_check_at = chrono::Duration::from_std(self.config.interval)
                .ok()
                .map(|d| Utc::now() + d);
            self.persist().await;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.state.status = WatchdogStatus::Stopped;
                    self.persist().await;
                    return Ok(self.state.clone());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// One check. On failure waits out the backoff, then restarts the daemon
    /// unless a stop was requested meanwhile or the budget is spent.
    pub async fn tick(&mut self, shutdown: &CancellationToken) -> MaestroResult<Tick> {
        if self.stop_requested(shutdown).await {
            return Ok(Tick::StopRequested);
        }

        match self.probe.check().await {
            Ok(()) => {
                if self.state.consecutive_failures > 0 {
                    info!(
                        failures = self.state.consecutive_failures,
                        restarts = self.state.restart_count,
                        "daemon recovered"
                    );
                }
                self.state.status = WatchdogStatus::Healthy;
                self.state.consecutive_failures = 0;
                self.state.restart_count = 0;
                self.state.backoff_ms = 0;
                self.state.last_error = None;
                Ok(Tick::Healthy)
            }
            Err(e) => {
                self.state.consecutive_failures += 1;
                self.state.last_error = Some(e.to_string());

                if self.state.restart_count >= self.config.max_restarts {
                    self.state.status = WatchdogStatus::Fatal;
                    self.persist().await;
                    error!(
                        restarts = self.state.restart_count,
                        failures = self.state.consecutive_failures,
                        error = %e,
                        "restart budget exhausted; daemon is permanently down"
                    );
                    return Ok(Tick::Exhausted);
                }

                self.state.status = WatchdogStatus::Recovering;
                self.state.backoff_ms = self.config.backoff.delay_ms(self.state.consecutive_failures);
                warn!(
                    failures = self.state.consecutive_failures,
                    backoff_ms = self.state.backoff_ms,
                    error = %e,
                    "daemon health check failed"
                );
                self.persist().await;

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(Tick::StopRequested),
                    _ = tokio::time::sleep(Duration::from_millis(self.state.backoff_ms)) => {}
                }
                if self.stop_requested(shutdown).await {
                    return Ok(Tick::StopRequested);
                }

                self.state.restart_count += 1;
                match self.control.restart().await {
                    Ok(pid) => {
                        self.state.daemon_pid = pid;
                        info!(
                            attempt = self.state.restart_count,
                            pid = ?pid,
                            "daemon restarted"
                        );
                    }
                    Err(e) => {
                        warn!(attempt = self.state.restart_count, error = %e, "daemon restart failed");
                        self.state.last_error = Some(e.to_string());
                    }
                }
                Ok(Tick::Restarted)
            }
        }
    }

    async fn stop_requested(&mut self, shutdown: &CancellationToken) -> bool {
        if shutdown.is_cancelled() || self.files.stop_requested().await {
            self.state.status = WatchdogStatus::Stopped;
            self.persist().await;
            true
        } else {
            false
        }
    }

    async fn persist(&self) {
        let Ok(json) = serde_json::to_string_pretty(&self.state) else {
            return;
        };
        if let Err(e) = tokio::fs::write(self.files.watchdog_state(), json).await {
            warn!(error = %e, "could not persist watchdog state");
        }
    }
}
