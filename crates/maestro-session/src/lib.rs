//! Durable state for autonomous UltraWork sessions.
//!
//! A session lives in its own directory with one JSON file per phase. Every
//! write is a revision-checked read-modify-write so that two writers touching
//! the same session are detected instead of silently losing an update.

/// UltraWork session record.
pub mod session;
/// Guarded per-phase persistence.
pub mod store;

pub use session::{Phase, ProgressEntry, Retrospective, UltraWorkSession, Verdict};
pub use store::{FilePhaseStore, PhaseStore};
