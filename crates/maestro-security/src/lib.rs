//! Security primitives for maestro.
//!
//! Provides the tiered permission gateway consulted before any action is
//! dispatched to a worker, the delegation burst limiter, the audit trail, and
//! input validation used throughout the system.
//!
//! # Main types
//!
//! - [`PermissionGateway`] — Pure tier × action authorization.
//! - [`ActionClass`] — Coarse class of an action an agent wants to perform.
//! - [`Decision`] — `Allow` or `Deny(reason)`.
//! - [`RateLimiter`] — Token-bucket limiter keyed by any hashable id.
//! - [`AuditLog`] — Append-only audit trail persisted to disk.
//! - [`Sanitizer`] — Text cleaning and identifier validation.

/// Audit logging module.
pub mod audit;
/// Token-bucket rate limiting.
pub mod rate_limit;
/// Input sanitization and identifier validation.
pub mod sanitizer;
/// Tier-based authorization.
pub mod tier;

pub use audit::{AuditLog, AuditOutcome};
pub use rate_limit::RateLimiter;
pub use sanitizer::{validate_identifier, SanitizeResult, Sanitizer};
pub use tier::{ActionClass, Decision, PermissionGateway};
