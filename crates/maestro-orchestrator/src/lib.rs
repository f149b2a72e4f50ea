//! Multi-agent orchestration engines for Maestro.
//!
//! Turns conductor output into work: dependency-ordered workflow DAGs,
//! depth- and cooldown-bounded delegation chains, sequential council debates
//! and long-running UltraWork sessions. Every invocation flows through an
//! [`AgentInvoker`], which applies the tier gate and leases pool workers.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Routes chat messages and agent output to the engines.
//! - [`WorkflowEngine`] — Validates and runs workflow plans under a concurrency cap.
//! - [`DelegationManager`] — Enforces chain depth, cooldown and burst limits.
//! - [`CouncilEngine`] — Runs multi-round debates with an optional synthesis.
//! - [`UltraWorkManager`] — Plan → Build → Retrospective sessions with durable phases.
//! - [`PooledInvoker`] — [`AgentInvoker`] backed by the worker pools.
//! - [`AgentMonitor`] — Per-agent activity and metrics.

/// Council debates.
pub mod council;
/// Delegation chains and loop prevention.
pub mod delegation;
/// Message routing and the engine tier gate.
pub mod dispatcher;
/// Workflow dependency graph and template interpolation.
pub mod graph;
/// Agent invocation seam and the pool-backed invoker.
pub mod invoker;
/// Decision-memory collaborator.
pub mod memory;
/// Agent health and metrics monitoring.
pub mod monitor;
/// Conductor plan payloads and their parser.
pub mod plan;
/// In-flight run registry and `!stop` handling.
pub mod sessions;
/// Scripted invokers and memory for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
/// Shared run, step and event types.
pub mod types;
/// UltraWork session manager.
pub mod ultrawork;
/// Workflow scheduler.
pub mod workflow;

pub use council::{CouncilConfig, CouncilEngine, CouncilOutcome, CouncilStatus, CouncilTurn};
pub use delegation::{DelegationChain, DelegationConfig, DelegationDirective, DelegationManager};
pub use dispatcher::{DispatchOutcome, Orchestrator, OrchestratorConfig};
pub use graph::StepGraph;
pub use invoker::{AgentInvoker, Invocation, InvokeTarget, PooledInvoker};
pub use memory::{MemoryStore, NoopMemory};
pub use monitor::{AgentActivity, AgentMetrics, AgentMonitor, AgentState};
pub use plan::{parse_plan, CouncilPlan, ParsedPlan, StepPlan, WorkflowPlan};
pub use sessions::{is_stop_command, ActiveRun, RunKind, SessionRegistry};
pub use types::{
    EventSink, ProgressEvent, RunContext, StepRecord, StepStatus, WorkflowReport, WorkflowStatus,
};
pub use ultrawork::{UltraWorkConfig, UltraWorkManager};
pub use workflow::{WorkflowConfig, WorkflowEngine};
