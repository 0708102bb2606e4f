//! Security primitives for the dashgate dashboard gate.
//!
//! Provides the dashboard token lifecycle, per-client rate limiting and the
//! audit trail of security events.
//!
//! # Main types
//!
//! - [`TokenStore`] — Persisted current/previous token with rotation and expiry.
//! - [`RateLimiter`] — Sliding-window request and failed-auth limiter with blocking.
//! - [`AuditLog`] — Append-only JSON-lines audit trail with size-based archiving.

/// Audit logging module.
pub mod audit;
/// Sliding-window rate limiting.
pub mod rate_limit;
/// Dashboard token storage, rotation and validation.
pub mod token;

pub use audit::{AuditAction, AuditEntry, AuditLog, AuditLogConfig};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use token::{LoadOutcome, TokenInfo, TokenState, TokenStore, TokenStoreConfig, TokenValidation};
