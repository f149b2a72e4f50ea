//! Agent process pool for Maestro.
//!
//! Each logical agent is backed by one or more long-lived subprocess workers.
//! The pool hands out exclusive [`WorkerLease`]s, reuses idle workers, evicts
//! workers that stay idle too long and force-kills workers that stay busy past
//! the hung timeout. [`PoolRegistry`] keeps one pool per backend and owns the
//! hot-reload sequence.

/// Per-agent worker pool.
pub mod pool;
/// Worker wire formats.
pub mod protocol;
/// One pool per backend, plus hot reload.
pub mod registry;
/// Scripted workers for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
/// Worker subprocesses.
pub mod worker;

pub use pool::{AgentPool, PoolConfig, SweepReport, WorkerInfo, WorkerLease, WorkerStatus};
pub use protocol::{AgentCall, WireFormat, WorkerReply};
pub use registry::PoolRegistry;
pub use worker::{BackendCommand, ProcessState, StdioSpawner, StdioWorker, WorkerProcess, WorkerSpawner};
