//! `dashgate.toml` loading.
//!
//! Every field has a default, so an absent file or a file holding only the
//! sections an operator wants to change is accepted.

use dashgate_core::{DashgateError, DashgateResult};
use dashgate_security::{AuditLogConfig, RateLimitConfig, TokenStoreConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct DashgateConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub audit: AuditSection,
}

impl Default for DashgateConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            token: TokenConfig::default(),
            rate_limit: RateLimitSection::default(),
            audit: AuditSection::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenConfig {
    /// Defaults to `<data_dir>/secrets`.
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secrets_dir: None,
            max_age_days: default_max_age_days(),
            grace_period_secs: default_grace_period_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_max_failed_auth")]
    pub max_failed_auth: usize,
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
    /// How often idle clients are swept from memory.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            max_failed_auth: default_max_failed_auth(),
            block_secs: default_block_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditSection {
    /// Defaults to `<data_dir>/audit/audit.log`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            path: None,
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

const MAX_WINDOW_SECS: u64 = 24 * 60 * 60;
const MAX_BLOCK_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_TOKEN_AGE_DAYS: u64 = 3650;

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8777
}
fn default_max_age_days() -> u64 {
    7
}
fn default_grace_period_secs() -> u64 {
    3600
}
fn default_cache_ttl_secs() -> u64 {
    5
}
fn default_window_secs() -> u64 {
    60
}
fn default_max_requests() -> usize {
    30
}
fn default_max_failed_auth() -> usize {
    5
}
fn default_block_secs() -> u64 {
    300
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_max_size_bytes() -> u64 {
    dashgate_security::audit::MAX_LOG_SIZE
}

impl DashgateConfig {
    /// Read and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> DashgateResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            DashgateError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate TOML content.
    pub fn parse(content: &str) -> DashgateResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DashgateError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> DashgateResult<()> {
        let rl = &self.rate_limit;
        if rl.window_secs == 0 || rl.window_secs > MAX_WINDOW_SECS {
            return Err(DashgateError::Config(format!(
                "rate_limit.window_secs must be between 1 and {MAX_WINDOW_SECS}"
            )));
        }
        // Zero would silently disable blocking on repeated auth failures.
        if rl.block_secs == 0 || rl.block_secs > MAX_BLOCK_SECS {
            return Err(DashgateError::Config(format!(
                "rate_limit.block_secs must be between 1 and {MAX_BLOCK_SECS}"
            )));
        }
        if rl.max_requests == 0 || rl.max_failed_auth == 0 {
            return Err(DashgateError::Config(
                "rate_limit.max_requests and rate_limit.max_failed_auth must be > 0".into(),
            ));
        }
        if rl.cleanup_interval_secs == 0 {
            return Err(DashgateError::Config(
                "rate_limit.cleanup_interval_secs must be > 0".into(),
            ));
        }
        let token = &self.token;
        if token.max_age_days == 0 || token.max_age_days > MAX_TOKEN_AGE_DAYS {
            return Err(DashgateError::Config(format!(
                "token.max_age_days must be between 1 and {MAX_TOKEN_AGE_DAYS}"
            )));
        }
        if token.grace_period_secs > token.max_age_days * 86_400 {
            return Err(DashgateError::Config(
                "token.grace_period_secs must not exceed token.max_age_days".into(),
            ));
        }
        Ok(())
    }

    pub fn token_store_config(&self) -> TokenStoreConfig {
        let secrets_dir = self
            .token
            .secrets_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("secrets"));
        TokenStoreConfig {
            secrets_dir,
            max_age: Duration::from_secs(self.token.max_age_days * 86_400),
            grace_period: Duration::from_secs(self.token.grace_period_secs),
            cache_ttl: Duration::from_secs(self.token.cache_ttl_secs),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.rate_limit.window_secs),
            max_requests: self.rate_limit.max_requests,
            max_failed_auth: self.rate_limit.max_failed_auth,
            block_duration: Duration::from_secs(self.rate_limit.block_secs),
        }
    }

    pub fn audit_log_config(&self) -> AuditLogConfig {
        let path = self
            .audit
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("audit").join("audit.log"));
        AuditLogConfig {
            path,
            max_size: self.audit.max_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DashgateConfig::parse("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8777);

        let rl = config.rate_limit_config();
        assert_eq!(rl.window, Duration::from_secs(60));
        assert_eq!(rl.max_requests, 30);
        assert_eq!(rl.max_failed_auth, 5);
        assert_eq!(rl.block_duration, Duration::from_secs(300));

        let token = config.token_store_config();
        assert_eq!(token.secrets_dir, PathBuf::from("./data/secrets"));
        assert_eq!(token.max_age, Duration::from_secs(7 * 86_400));
        assert_eq!(token.grace_period, Duration::from_secs(3600));

        let audit = config.audit_log_config();
        assert_eq!(audit.path, PathBuf::from("./data/audit/audit.log"));
        assert_eq!(audit.max_size, 5 * 1024 * 1024);
    }

    #[test]
    fn test_partial_sections_override() {
        let config = DashgateConfig::parse(
            r#"
            data_dir = "/var/lib/dashgate"

            [server]
            port = 9000

            [rate_limit]
            max_requests = 100

            [audit]
            path = "/var/log/dashgate/audit.log"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.rate_limit_config().max_requests, 100);
        assert_eq!(config.rate_limit_config().max_failed_auth, 5);
        assert_eq!(
            config.token_store_config().secrets_dir,
            PathBuf::from("/var/lib/dashgate/secrets")
        );
        assert_eq!(
            config.audit_log_config().path,
            PathBuf::from("/var/log/dashgate/audit.log")
        );
    }

    #[test]
    fn test_zero_thresholds_are_rejected() {
        let err = DashgateConfig::parse("[rate_limit]\nmax_failed_auth = 0\n").unwrap_err();
        assert!(matches!(err, DashgateError::Config(_)));
    }

    #[test]
    fn test_block_secs_bounds() {
        assert!(DashgateConfig::parse("[rate_limit]\nblock_secs = 0\n").is_err());
        assert!(
            DashgateConfig::parse("[rate_limit]\nblock_secs = 18446744073709551615\n").is_err()
        );
        let config = DashgateConfig::parse("[rate_limit]\nblock_secs = 900\n").unwrap();
        assert_eq!(
            config.rate_limit_config().block_duration,
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_token_lifetimes_are_capped() {
        assert!(DashgateConfig::parse("[token]\nmax_age_days = 9223372036854775807\n").is_err());
        assert!(DashgateConfig::parse("[token]\nmax_age_days = 1\ngrace_period_secs = 90000\n").is_err());
        assert!(DashgateConfig::parse("[rate_limit]\nwindow_secs = 100000\n").is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = DashgateConfig::parse("[server\nport = 1").unwrap_err();
        assert!(err.to_string().starts_with("Config error:"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DashgateConfig::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.port, 8777);
    }

    #[test]
    fn test_load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dashgate.toml");
        std::fs::write(&path, "[token]\nmax_age_days = 3\n").unwrap();
        let config = DashgateConfig::load(&path).unwrap();
        assert_eq!(
            config.token_store_config().max_age,
            Duration::from_secs(3 * 86_400)
        );
    }
}
