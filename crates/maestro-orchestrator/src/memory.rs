//! Narrow interface to the decision-memory collaborator.
//!
//! The store itself (embeddings, search index) lives outside this crate; the
//! engines only hand it opaque JSON records.

use async_trait::async_trait;
use maestro_core::MaestroResult;
use serde_json::Value;

/// Persistent decision memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist one record.
    async fn save(&self, record: Value) -> MaestroResult<()>;

    /// Records relevant to `query`, best first.
    async fn search(&self, query: &str, limit: usize) -> MaestroResult<Vec<Value>>;

    /// The most recent checkpoint, if one was saved.
    async fn load_checkpoint(&self) -> MaestroResult<Option<Value>>;
}

/// Memory that remembers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    async fn save(&self, _record: Value) -> MaestroResult<()> {
        Ok(())
    }

    async fn search(&self, _query: &str, _limit: usize) -> MaestroResult<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn load_checkpoint(&self) -> MaestroResult<Option<Value>> {
        Ok(None)
    }
}
