//! Config hot-reload watcher.
//!
//! Watches `maestro.toml` for modifications and hands every freshly parsed
//! [`MaestroConfig`] to a callback after a debounce window. [`apply_agent_reloads`]
//! turns those configs into pool registry reloads when the agent set changed.

use crate::config::MaestroConfig;
use maestro_core::{AgentConfig, MaestroError, MaestroResult};
use maestro_pool::PoolRegistry;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping it stops the watch and lets the debounce thread exit.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread each time the file changes and
    /// parses cleanly. Parse errors are logged and skipped, so a half-saved
    /// file never reaches the callback.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> MaestroResult<Self>
    where
        F: Fn(MaestroConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| MaestroError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| MaestroError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);
            while rx.recv().is_ok() {
                // Let the burst of writes settle, then reload once.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match MaestroConfig::load(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => warn!(error = %e, "Failed to reload config"),
                }
            }
            tracing::debug!("Config watcher thread exiting");
        });

        info!(path = %config_path.display(), "Config hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Reload `registry` whenever a received config carries a different agent
/// set than the one currently applied. Runs until `rx` closes or `shutdown`
/// fires. Returns how many reloads were applied.
pub async fn apply_agent_reloads(
    registry: Arc<PoolRegistry>,
    mut current: Vec<AgentConfig>,
    mut rx: mpsc::UnboundedReceiver<MaestroConfig>,
    shutdown: CancellationToken,
) -> usize {
    let mut applied = 0;
    loop {
        let config = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(config) => config,
                None => break,
            },
        };
        if config.agents == current {
            continue;
        }
        match registry.reload(config.agents.clone()).await {
            Ok(generation) => {
                info!(generation, agents = config.agents.len(), "agents reloaded from config file");
                current = config.agents;
                applied += 1;
            }
            Err(e) => warn!(error = %e, "rejected agent configuration"),
        }
    }
    applied
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::BackendKind;
    use maestro_pool::testing::ScriptedSpawner;
    use maestro_pool::{PoolConfig, WorkerSpawner};
    use maestro_security::AuditLog;
    use std::collections::HashMap;

    const BASE: &str = "[backends.primary-cli]\ncommand = \"cli\"\n";

    fn config_with(agents: &[&str]) -> MaestroConfig {
        let mut text = BASE.to_string();
        for key in agents {
            text.push_str(&format!("[[agents]]\nkey = \"{key}\"\n"));
        }
        MaestroConfig::parse(&text).unwrap()
    }

    fn registry(agents: Vec<AgentConfig>) -> Arc<PoolRegistry> {
        let mut spawners: HashMap<BackendKind, Arc<dyn WorkerSpawner>> = HashMap::new();
        spawners.insert(BackendKind::PrimaryCli, Arc::new(ScriptedSpawner::echo()));
        Arc::new(
            PoolRegistry::new(spawners, PoolConfig::default(), agents, Arc::new(AuditLog::disabled()))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_only_changed_agent_sets_reload() {
        let initial = config_with(&["a"]).agents;
        let registry = registry(initial.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(config_with(&["a"])).unwrap();
        tx.send(config_with(&["a", "b"])).unwrap();
        tx.send(config_with(&["a", "b"])).unwrap();
        drop(tx);

        let applied = apply_agent_reloads(registry.clone(), initial, rx, CancellationToken::new()).await;
        assert_eq!(applied, 1);
        assert_eq!(registry.generation().await, 1);
        assert_eq!(registry.agents().await.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_rejected_without_reload() {
        let initial = config_with(&["a"]).agents;
        let registry = registry(initial.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(config_with(&["x", "x"])).unwrap();
        drop(tx);

        let applied = apply_agent_reloads(registry.clone(), initial, rx, CancellationToken::new()).await;
        assert_eq!(applied, 0);
        assert_eq!(registry.generation().await, 0);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let registry = registry(vec![]);
        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(apply_agent_reloads(registry, vec![], rx, shutdown).await, 0);
    }

    #[test]
    fn test_watch_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigWatcher::start(dir.path().join("absent.toml"), 50, |_| {});
        assert!(result.is_err());
    }
}
