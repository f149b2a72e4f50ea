//! Pid files, the stop marker and daemon (re)start.

use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Well-known files under the run directory.
#[derive(Debug, Clone)]
pub struct RunFiles {
    dir: PathBuf,
}

impl RunFiles {
    /// Files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Written by `maestro serve`.
    pub fn daemon_pid(&self) -> PathBuf {
        self.dir.join("daemon.pid")
    }

    /// Written by `maestro watchdog`.
    pub fn watchdog_pid(&self) -> PathBuf {
        self.dir.join("watchdog.pid")
    }

    /// Present while a deliberate stop is in progress.
    pub fn stop_marker(&self) -> PathBuf {
        self.dir.join("stop.requested")
    }

    /// Last recorded watchdog state, as JSON.
    pub fn watchdog_state(&self) -> PathBuf {
        self.dir.join("watchdog.state.json")
    }

    /// Stdout and stderr of respawned daemons.
    pub fn daemon_log(&self) -> PathBuf {
        self.dir.join("daemon.log")
    }

    /// Whether the stop marker is present.
    pub async fn stop_requested(&self) -> bool {
        tokio::fs::try_exists(self.stop_marker())
            .await
            .unwrap_or(false)
    }

    /// Raise the stop marker.
    pub async fn request_stop(&self) -> MaestroResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.stop_marker(), chrono::Utc::now().to_rfc3339()).await?;
        Ok(())
    }

    /// Drop the stop marker.
    pub async fn clear_stop(&self) -> MaestroResult<()> {
        remove_if_exists(&self.stop_marker()).await
    }
}

/// Write `pid` to `path`, creating parent directories.
pub async fn write_pid(path: &Path, pid: u32) -> MaestroResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, pid.to_string()).await?;
    Ok(())
}

/// Pid stored at `path`, if the file exists and holds a number.
pub async fn read_pid(path: &Path) -> Option<u32> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    text.trim().parse().ok()
}

/// Delete `path`; a missing file is fine.
pub async fn remove_if_exists(path: &Path) -> MaestroResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a process with `pid` exists (`kill -0`).
pub async fn is_running(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Send SIGTERM to `pid` (`kill -15`).
pub async fn terminate(pid: u32) -> MaestroResult<()> {
    let status = Command::new("kill")
        .arg("-15")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(MaestroError::Process(format!("kill -15 {pid} failed: {status}")))
    }
}

/// Poll until `pid` is gone or `timeout` passes. Returns whether it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_running(pid).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Restarts the supervised daemon.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Stop whatever is left of the daemon and start a fresh one.
    /// Returns the new pid when known.
    async fn restart(&self) -> MaestroResult<Option<u32>>;

    /// Pid of the running daemon, if known.
    async fn current_pid(&self) -> Option<u32>;
}

/// Runs the daemon from a command line, detached, logging to `daemon.log`.
pub struct CommandDaemon {
    program: String,
    args: Vec<String>,
    files: RunFiles,
    grace: Duration,
}

impl CommandDaemon {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], files: RunFiles) -> MaestroResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| MaestroError::Config("daemon command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            files,
            grace: Duration::from_secs(10),
        })
    }

    /// Builder: how long an old daemon gets to exit after SIGTERM.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl DaemonControl for CommandDaemon {
    async fn restart(&self) -> MaestroResult<Option<u32>> {
        if let Some(old) = read_pid(&self.files.daemon_pid()).await {
            if is_running(old).await {
                info!(pid = old, "terminating unresponsive daemon");
                if let Err(e) = terminate(old).await {
                    warn!(pid = old, error = %e, "could not signal old daemon");
                }
                if !wait_for_exit(old, self.grace).await {
                    warn!(pid = old, "old daemon still running after grace period");
                }
            }
        }

        tokio::fs::create_dir_all(self.files.dir()).await?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.files.daemon_log())?;
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| MaestroError::Process(format!("failed to start '{}': {e}", self.program)))?;
        let pid = child.id();
        if let Some(pid) = pid {
            write_pid(&self.files.daemon_pid(), pid).await?;
        }
        debug!(program = %self.program, ?pid, "daemon spawned");
        Ok(pid)
    }

    async fn current_pid(&self) -> Option<u32> {
        read_pid(&self.files.daemon_pid()).await
    }
}

/// What `stop_all` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Watchdog that was terminated.
    pub watchdog_pid: Option<u32>,
    /// Daemon that was terminated.
    pub daemon_pid: Option<u32>,
}

/// Deliberate shutdown: raise the stop marker, terminate the watchdog and
/// wait for it, then terminate the daemon. The watchdog goes first so the
/// daemon's exit is never taken for a crash.
pub async fn stop_all(files: &RunFiles, wait: Duration) -> MaestroResult<StopReport> {
    files.request_stop().await?;
    let mut report = StopReport::default();

    if let Some(pid) = read_pid(&files.watchdog_pid()).await {
        if is_running(pid).await {
            terminate(pid).await?;
            if !wait_for_exit(pid, wait).await {
                return Err(MaestroError::Timeout(format!(
                    "watchdog {pid} did not exit within {}s",
                    wait.as_secs()
                )));
            }
            report.watchdog_pid = Some(pid);
            info!(pid, "watchdog stopped");
        }
        remove_if_exists(&files.watchdog_pid()).await?;
    }

    if let Some(pid) = read_pid(&files.daemon_pid()).await {
        if is_running(pid).await {
            terminate(pid).await?;
            if !wait_for_exit(pid, wait).await {
                warn!(pid, "daemon still running after stop");
            }
            report.daemon_pid = Some(pid);
            info!(pid, "daemon stopped");
        }
        remove_if_exists(&files.daemon_pid()).await?;
    }

    files.clear_stop().await?;
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pid_roundtrip_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let files = RunFiles::new(dir.path().join("run"));
        write_pid(&files.daemon_pid(), 4242).await.unwrap();
        assert_eq!(read_pid(&files.daemon_pid()).await, Some(4242));

        tokio::fs::write(files.watchdog_pid(), "not a pid").await.unwrap();
        assert_eq!(read_pid(&files.watchdog_pid()).await, None);
        assert_eq!(read_pid(&files.dir().join("missing.pid")).await, None);
    }

    #[tokio::test]
    async fn test_stop_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let files = RunFiles::new(dir.path());
        assert!(!files.stop_requested().await);
        files.request_stop().await.unwrap();
        assert!(files.stop_requested().await);
        files.clear_stop().await.unwrap();
        files.clear_stop().await.unwrap();
        assert!(!files.stop_requested().await);
    }

    #[tokio::test]
    async fn test_own_process_is_running() {
        assert!(is_running(std::process::id()).await);
    }

    #[tokio::test]
    async fn test_stop_all_with_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let files = RunFiles::new(dir.path());
        let report = stop_all(&files, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report, StopReport::default());
        assert!(!files.stop_requested().await);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandDaemon::new(&[], RunFiles::new("/tmp")).is_err());
    }
}
