use crate::session::{Phase, ProgressEntry, UltraWorkSession};
use async_trait::async_trait;
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult};
use maestro_security::validate_identifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

const INSPECTION_FILE: &str = "needs_inspection.json";

/// Persistence for UltraWork sessions.
///
/// Every mutating call is a read-modify-write guarded by the session's
/// `revision`: the caller passes the revision it last saw and the store
/// refuses the write if disk has moved on.
#[async_trait]
pub trait PhaseStore: Send + Sync {
    /// Persist a brand-new session. Fails if the id is already taken.
    async fn create(&self, session: &UltraWorkSession) -> MaestroResult<UltraWorkSession>;
    /// Latest persisted state, or `None` if the session does not exist.
    async fn load(&self, session_id: &str) -> MaestroResult<Option<UltraWorkSession>>;
    /// Write `next` under its phase. `next.revision` must equal the stored one.
    async fn commit(&self, next: &UltraWorkSession) -> MaestroResult<UltraWorkSession>;
    /// Append one progress entry.
    async fn append_progress(
        &self,
        session_id: &str,
        expected_revision: u64,
        entry: ProgressEntry,
    ) -> MaestroResult<UltraWorkSession>;
    /// Reason the session was flagged for manual inspection, if it was.
    async fn inspection_reason(&self, session_id: &str) -> MaestroResult<Option<String>>;
    /// Ids of all stored sessions.
    async fn list(&self) -> MaestroResult<Vec<String>>;
}

/// File-backed [`PhaseStore`]: `<root>/<session_id>/<phase>.json`.
pub struct FilePhaseStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilePhaseStore {
    /// Open (and create) a store rooted at `root`.
    pub async fn new(root: PathBuf) -> MaestroResult<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> MaestroResult<PathBuf> {
        let id = validate_identifier(session_id)?;
        Ok(self.root.join(id))
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn read_latest(&self, dir: &Path) -> MaestroResult<Option<UltraWorkSession>> {
        let mut latest: Option<UltraWorkSession> = None;
        for phase in Phase::ALL {
            let path = dir.join(phase.file_name());
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            let snapshot: UltraWorkSession = serde_json::from_str(&data).map_err(|e| {
                MaestroError::Session(format!("Failed to parse {}: {e}", path.display()))
            })?;
            if latest
                .as_ref()
                .map_or(true, |l| snapshot.revision > l.revision)
            {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }

    async fn write_snapshot(&self, dir: &Path, session: &UltraWorkSession) -> MaestroResult<()> {
        let target = dir.join(session.phase.file_name());
        let tmp = dir.join(format!(".{}.tmp", session.phase.file_name()));
        let json = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        debug!(
            session_id = %session.session_id,
            phase = %session.phase,
            revision = session.revision,
            "session state persisted"
        );
        Ok(())
    }

    async fn flag(&self, dir: &Path, session_id: &str, reason: &str) -> MaestroError {
        error!(session_id, reason, "session state diverged, flagged for inspection");
        let body = serde_json::json!({
            "reason": reason,
            "flagged_at": Utc::now(),
        });
        let written = match serde_json::to_string_pretty(&body) {
            Ok(json) => tokio::fs::write(dir.join(INSPECTION_FILE), json)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => MaestroError::StateCorruption(format!("session '{session_id}': {reason}")),
            Err(e) => {
                error!(session_id, error = %e, "could not write inspection flag");
                MaestroError::StateCorruption(format!(
                    "session '{session_id}': {reason} (inspection flag not written: {e})"
                ))
            }
        }
    }

    /// Shared read-check-write path. `mutate` receives the current on-disk
    /// state and returns the next one.
    async fn guarded_write<F>(
        &self,
        session_id: &str,
        expected_revision: u64,
        mutate: F,
    ) -> MaestroResult<UltraWorkSession>
    where
        F: FnOnce(UltraWorkSession) -> UltraWorkSession + Send,
    {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if dir.join(INSPECTION_FILE).exists() {
            return Err(MaestroError::StateCorruption(format!(
                "session '{session_id}' is flagged for inspection"
            )));
        }
        let Some(current) = self.read_latest(&dir).await? else {
            return Err(MaestroError::Session(format!(
                "session '{session_id}' not found"
            )));
        };
        if current.revision != expected_revision {
            let reason = format!(
                "expected revision {expected_revision}, found {}",
                current.revision
            );
            return Err(self.flag(&dir, session_id, &reason).await);
        }

        let mut next = mutate(current);
        next.revision = expected_revision + 1;
        self.write_snapshot(&dir, &next).await?;
        Ok(next)
    }
}

#[async_trait]
impl PhaseStore for FilePhaseStore {
    async fn create(&self, session: &UltraWorkSession) -> MaestroResult<UltraWorkSession> {
        let dir = self.session_dir(&session.session_id)?;
        let lock = self.lock_for(&session.session_id);
        let _guard = lock.lock().await;

        if self.read_latest(&dir).await?.is_some() {
            return Err(MaestroError::Session(format!(
                "session '{}' already exists",
                session.session_id
            )));
        }
        tokio::fs::create_dir_all(&dir).await?;
        let mut stored = session.clone();
        stored.revision = 1;
        self.write_snapshot(&dir, &stored).await?;
        Ok(stored)
    }

    async fn load(&self, session_id: &str) -> MaestroResult<Option<UltraWorkSession>> {
        let dir = self.session_dir(session_id)?;
        if !dir.exists() {
            return Ok(None);
        }
        self.read_latest(&dir).await
    }

    async fn commit(&self, next: &UltraWorkSession) -> MaestroResult<UltraWorkSession> {
        let replacement = next.clone();
        self.guarded_write(&next.session_id, next.revision, move |_| replacement)
            .await
    }

    async fn append_progress(
        &self,
        session_id: &str,
        expected_revision: u64,
        entry: ProgressEntry,
    ) -> MaestroResult<UltraWorkSession> {
        self.guarded_write(session_id, expected_revision, move |mut current| {
            current.phase = Phase::Building;
            current.progress_log.push(entry);
            current
        })
        .await
    }

    async fn inspection_reason(&self, session_id: &str) -> MaestroResult<Option<String>> {
        let path = self.session_dir(session_id)?.join(INSPECTION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let body: serde_json::Value = serde_json::from_str(&data)?;
        Ok(Some(
            body.get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("unknown")
                .to_string(),
        ))
    }

    async fn list(&self) -> MaestroResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_identifier(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(id: &str) -> UltraWorkSession {
        UltraWorkSession::new(id, "refactor the parser", "lead".into(), Duration::minutes(60))
    }

    #[tokio::test]
    async fn test_create_assigns_first_revision() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(tmp.path().to_path_buf()).await.unwrap();
        let stored = store.create(&session("uw-1")).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert!(tmp.path().join("uw-1").join("planning.json").exists());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(tmp.path().to_path_buf()).await.unwrap();
        store.create(&session("uw-1")).await.unwrap();
        assert!(store.create(&session("uw-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_traversal_id_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(tmp.path().to_path_buf()).await.unwrap();
        let err = store.create(&session("../escape")).await.unwrap_err();
        assert!(matches!(err, MaestroError::Validation(_)));
        assert!(store.load("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_unwritable_flag_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(tmp.path().to_path_buf()).await.unwrap();
        let gone = tmp.path().join("uw-gone");
        let err = store.flag(&gone, "uw-gone", "expected revision 2, found 3").await;
        match err {
            MaestroError::StateCorruption(msg) => {
                assert!(msg.contains("expected revision 2"));
                assert!(msg.contains("inspection flag not written"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_revision_flags_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(tmp.path().to_path_buf()).await.unwrap();
        let stored = store.create(&session("uw-1")).await.unwrap();
        let err = store.commit(&UltraWorkSession { revision: 7, ..stored }).await.unwrap_err();
        assert!(matches!(err, MaestroError::StateCorruption(ref m) if !m.contains("not written")));
        assert!(store.inspection_reason("uw-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(tmp.path().to_path_buf()).await.unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }
}
