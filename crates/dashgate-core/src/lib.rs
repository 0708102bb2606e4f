//! Core types shared across the dashgate crates.
//!
//! # Main types
//!
//! - [`DashgateError`] — Unified error enum for all dashgate subsystems.
//! - [`DashgateResult`] — Convenience alias for `Result<T, DashgateError>`.

// --- Error types ---

/// Top-level error type for dashgate.
///
/// Only operations that may legitimately fail return it (persisting token
/// state, generating tokens, loading configuration). Request-path outcomes
/// are expressed as decisions, not errors.
#[derive(Debug, thiserror::Error)]
pub enum DashgateError {
    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A security-related failure (e.g. the OS random source is unavailable).
    #[error("Security error: {0}")]
    Security(String),

    /// Persisting state to disk failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`DashgateError`].
pub type DashgateResult<T> = Result<T, DashgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        fn fails() -> DashgateResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, DashgateError::Io(_)));
        assert!(err.to_string().starts_with("IO error:"));
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            DashgateError::Storage("disk full".into()).to_string(),
            "Storage error: disk full"
        );
        assert_eq!(
            DashgateError::Config("bad port".into()).to_string(),
            "Config error: bad port"
        );
    }
}
