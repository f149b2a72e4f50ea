//! Worker subprocesses: spawn, request/reply exchange and termination.
//!
//! A [`StdioWorker`] owns two background tasks. The writer drains a bounded
//! request queue into the child's stdin and awaits every flush, so a slow
//! child pushes back on callers instead of growing an unbounded buffer. The
//! reader turns stdout lines into [`WorkerReply`] values on an mpsc channel and
//! publishes lifecycle changes on a `watch` channel.

use crate::protocol::{decode_reply, encode_request, AgentCall, JsonRpcRequest, WireFormat, WorkerReply};
use async_trait::async_trait;
use maestro_core::{AgentKey, AgentSpec, BackendKind, MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

const WRITE_QUEUE_DEPTH: usize = 8;
const REPLY_QUEUE_DEPTH: usize = 64;
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a worker subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Child is running and its pipes are open.
    Running,
    /// Child exited or a pipe failed.
    Exited(String),
}

/// A live agent worker.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// OS process id, if the worker is backed by one.
    fn pid(&self) -> Option<u32>;
    /// Whether the worker can still accept calls.
    fn is_alive(&self) -> bool;
    /// Send one call and wait for its reply.
    async fn invoke(&self, call: &AgentCall) -> MaestroResult<String>;
    /// Kill the worker. Idempotent.
    async fn terminate(&self);
}

/// Creates workers for a backend.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Spawn a worker serving `key`.
    async fn spawn(&self, key: &AgentKey, spec: &AgentSpec) -> MaestroResult<Arc<dyn WorkerProcess>>;
}

/// How to launch a backend's worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCommand {
    /// Executable.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Framing spoken on stdio.
    #[serde(default)]
    pub wire: WireFormat,
    /// How long a JSON-RPC worker may take to answer `initialize`.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

impl BackendCommand {
    /// A command with no arguments speaking `wire`.
    pub fn new(command: impl Into<String>, wire: WireFormat) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            wire,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

/// Worker backed by a child process speaking NDJSON on stdio.
pub struct StdioWorker {
    pid: Option<u32>,
    wire: WireFormat,
    outbound: mpsc::Sender<String>,
    replies: Mutex<mpsc::Receiver<WorkerReply>>,
    state: watch::Receiver<ProcessState>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
}

impl StdioWorker {
    /// Start the child process and its I/O tasks. Must run inside a tokio runtime.
    pub fn launch(command: &BackendCommand) -> MaestroResult<Self> {
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            MaestroError::Process(format!("Failed to spawn worker '{}': {e}", command.command))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MaestroError::Process("worker stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MaestroError::Process("worker stdout not available".into()))?;
        let pid = child.id();

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let state_tx = Arc::new(state_tx);
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);

        tokio::spawn(write_loop(stdin, out_rx, state_tx.clone()));
        tokio::spawn(read_loop(stdout, command.wire, reply_tx, state_tx));

        Ok(Self {
            pid,
            wire: command.wire,
            outbound: out_tx,
            replies: Mutex::new(reply_rx),
            state: state_rx,
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribe to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    fn exit_reason(&self) -> Option<String> {
        match &*self.state.borrow() {
            ProcessState::Exited(reason) => Some(reason.clone()),
            ProcessState::Running => None,
        }
    }

    /// Send a raw line and wait for the reply carrying `id`.
    async fn exchange(&self, id: u64, line: String) -> MaestroResult<WorkerReply> {
        let mut replies = self.replies.lock().await;
        let mut state = self.state.clone();
        if let Some(reason) = self.exit_reason() {
            return Err(MaestroError::Process(format!("worker exited: {reason}")));
        }

        self.outbound
            .send(line)
            .await
            .map_err(|_| MaestroError::Process("worker stdin closed".into()))?;

        loop {
            tokio::select! {
                biased;
                reply = replies.recv() => match reply {
                    Some(reply) if reply.id == id => return Ok(reply),
                    Some(stale) => {
                        debug!(pid = ?self.pid, id = stale.id, "discarding stale worker reply");
                    }
                    None => {
                        return Err(MaestroError::Process("worker output closed".into()));
                    }
                },
                changed = state.changed() => {
                    let reason = match &*state.borrow() {
                        ProcessState::Exited(reason) => Some(reason.clone()),
                        ProcessState::Running => None,
                    };
                    if let Some(reason) = reason {
                        return Err(MaestroError::Process(format!("worker exited: {reason}")));
                    }
                    if changed.is_err() {
                        return Err(MaestroError::Process("worker state channel closed".into()));
                    }
                }
            }
        }
    }

    /// MCP-style `initialize` handshake followed by the `initialized` notification.
    pub async fn handshake(&self) -> MaestroResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "maestro",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let line = serde_json::to_string(&JsonRpcRequest::new(id, "initialize", Some(params)))?;
        let reply = self.exchange(id, line).await?;
        if reply.is_error {
            return Err(MaestroError::Process(format!(
                "worker rejected initialize: {}",
                reply.result
            )));
        }
        let notify = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {},
        });
        self.outbound
            .send(notify.to_string())
            .await
            .map_err(|_| MaestroError::Process("worker stdin closed".into()))?;
        Ok(())
    }
}

#[async_trait]
impl WorkerProcess for StdioWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        matches!(*self.state.borrow(), ProcessState::Running)
    }

    async fn invoke(&self, call: &AgentCall) -> MaestroResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_request(self.wire, id, call)?;
        let reply = self.exchange(id, line).await?;
        if reply.is_error {
            return Err(MaestroError::Agent(reply.result));
        }
        Ok(reply.result)
    }

    async fn terminate(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "worker already gone");
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "worker terminated"),
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "failed to reap worker"),
            Err(_) => warn!(pid = ?self.pid, "worker did not exit after kill"),
        }
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<String>,
    state: Arc<watch::Sender<ProcessState>>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "worker stdin write failed");
            state.send_replace(ProcessState::Exited(format!("stdin write failed: {e}")));
            break;
        }
    }
}

async fn read_loop(
    stdout: ChildStdout,
    wire: WireFormat,
    replies: mpsc::Sender<WorkerReply>,
    state: Arc<watch::Sender<ProcessState>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match decode_reply(wire, trimmed) {
                    Some(reply) => {
                        if replies.send(reply).await.is_err() {
                            break;
                        }
                    }
                    None => debug!(line = %trimmed, "non-protocol line from worker"),
                }
            }
            Ok(None) => {
                state.send_replace(ProcessState::Exited("stdout closed".into()));
                break;
            }
            Err(e) => {
                state.send_replace(ProcessState::Exited(format!("stdout read failed: {e}")));
                break;
            }
        }
    }
}

/// Spawns [`StdioWorker`]s from a configured command.
pub struct StdioSpawner {
    backend: BackendKind,
    command: BackendCommand,
}

impl StdioSpawner {
    /// Spawner for `backend` launching `command`.
    pub fn new(backend: BackendKind, command: BackendCommand) -> Self {
        Self { backend, command }
    }
}

#[async_trait]
impl WorkerSpawner for StdioSpawner {
    async fn spawn(&self, key: &AgentKey, _spec: &AgentSpec) -> MaestroResult<Arc<dyn WorkerProcess>> {
        let worker = StdioWorker::launch(&self.command)?;
        if self.command.wire == WireFormat::JsonRpc {
            let timeout = Duration::from_secs(self.command.handshake_timeout_secs);
            match tokio::time::timeout(timeout, worker.handshake()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    worker.terminate().await;
                    return Err(e);
                }
                Err(_) => {
                    worker.terminate().await;
                    return Err(MaestroError::Timeout(format!(
                        "worker for '{key}' did not complete the handshake"
                    )));
                }
            }
        }
        info!(
            agent = %key,
            backend = %self.backend,
            pid = ?worker.pid(),
            "worker spawned"
        );
        Ok(Arc::new(worker))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_process_error() {
        let spawner = StdioSpawner::new(
            BackendKind::PrimaryCli,
            BackendCommand::new("/nonexistent/maestro-worker-binary", WireFormat::JsonLines),
        );
        let err = spawner
            .spawn(&AgentKey::new("x"), &AgentSpec::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MaestroError::Process(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_worker_reports_process_error() {
        // `true` exits immediately without reading stdin.
        let worker =
            StdioWorker::launch(&BackendCommand::new("true", WireFormat::JsonLines)).unwrap();
        let mut state = worker.state();
        let exited = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s != ProcessState::Running),
        )
        .await
        .is_ok();
        assert!(exited);
        assert!(!worker.is_alive());
        let err = worker.invoke(&AgentCall::new("hi")).await.unwrap_err();
        assert!(matches!(err, MaestroError::Process(_)));
        worker.terminate().await;
        worker.terminate().await;
    }

    #[test]
    fn test_backend_command_defaults() {
        let cmd: BackendCommand = serde_json::from_str(r#"{"command": "claude"}"#).unwrap();
        assert_eq!(cmd.wire, WireFormat::JsonLines);
        assert_eq!(cmd.handshake_timeout_secs, 30);
        assert!(cmd.args.is_empty());
    }
}
