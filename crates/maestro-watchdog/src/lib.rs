//! Daemon watchdog for Maestro.
//!
//! Runs as its own process. Every interval it polls the daemon's `/health`
//! endpoint; on failure it waits a capped exponential backoff and restarts
//! the daemon, up to a restart budget after which it gives up loudly.
//!
//! # Main types
//!
//! - [`Watchdog`] — The supervision loop.
//! - [`HttpHealthProbe`] — [`HealthProbe`] over HTTP.
//! - [`CommandDaemon`] — [`DaemonControl`] that respawns the daemon command.
//! - [`BackoffPolicy`] — Restart delay schedule.
//! - [`RunFiles`] — Pid files and the stop marker shared with `maestro stop`.

/// Restart delay schedule.
pub mod backoff;
/// Pid files, the stop marker and process control.
pub mod control;
/// Health probes.
pub mod probe;
/// Supervision loop and state.
pub mod watchdog;

pub use backoff::BackoffPolicy;
pub use control::{stop_all, CommandDaemon, DaemonControl, RunFiles, StopReport};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use watchdog::{Tick, Watchdog, WatchdogConfig, WatchdogState, WatchdogStatus};
