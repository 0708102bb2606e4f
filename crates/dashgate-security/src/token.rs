//! Dashboard token lifecycle: issue, rotate with a grace period, expire.
//!
//! State is persisted to `<secrets_dir>/dashboard.env` as `KEY=VALUE` lines:
//!
//! ```text
//! # Security Dashboard Token (auto-managed)
//! DASHBOARD_TOKEN=<64 hex chars>
//! TOKEN_CREATED=<epoch millis>
//! PREVIOUS_TOKEN=<64 hex chars>
//! PREVIOUS_EXPIRES=<epoch millis>
//! ```
//!
//! A missing file (or a file without `DASHBOARD_TOKEN`) means no token is
//! configured and the dashboard runs in open mode.

use crate::audit::{AuditAction, AuditLog};
use chrono::{DateTime, TimeDelta, Utc};
use dashgate_core::{DashgateError, DashgateResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Tokens older than this are rejected even if they match.
pub const TOKEN_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// How long the previous token stays valid after a rotation.
pub const TOKEN_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);
/// File name of the persisted token state inside the secrets directory.
pub const TOKEN_FILE_NAME: &str = "dashboard.env";

const TOKEN_BYTES: usize = 32;
const EXPIRED_HINT: &str =
    "Token has expired. Issue a new one on the dashboard host with: dashgate token rotate";

/// An opaque token value. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented credential.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// The active token and when it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentToken {
    pub value: Secret,
    pub created_at: DateTime<Utc>,
}

/// The token replaced by the last rotation and the end of its grace period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousToken {
    pub value: Secret,
    pub expires_at: DateTime<Utc>,
}

/// Persisted credential state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    pub current: Option<CurrentToken>,
    pub previous: Option<PreviousToken>,
}

impl TokenState {
    /// Returns true if a current token exists.
    pub fn is_configured(&self) -> bool {
        self.current.is_some()
    }
}

/// Result of reading the token file, keeping "no file" apart from "bad file".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The file parsed.
    Loaded(TokenState),
    /// No token file exists.
    Absent,
    /// The file exists but could not be read or parsed.
    Corrupt(String),
}

/// Outcome of checking a presented credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidation {
    /// No token is configured; access is open.
    NoTokenConfigured,
    /// Matches the current token, which is within its max age.
    Valid,
    /// Matches the previous token inside its grace period.
    ValidGrace,
    /// Matches the current token, but it is older than the max age.
    TokenExpired { hint: String },
    /// Matches the previous token after its grace period ended.
    PreviousTokenExpired,
    /// Matches neither token.
    InvalidToken,
}

impl TokenValidation {
    /// Returns true if the request should be admitted.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::NoTokenConfigured | Self::Valid | Self::ValidGrace)
    }

    /// Machine-readable rejection reason, `None` for admitting outcomes.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::TokenExpired { .. } => Some("token_expired"),
            Self::PreviousTokenExpired => Some("previous_token_expired"),
            Self::InvalidToken => Some("invalid_token"),
            Self::NoTokenConfigured | Self::Valid | Self::ValidGrace => None,
        }
    }

    /// Remediation hint for the caller, if there is a specific one.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::TokenExpired { hint } => Some(hint),
            _ => None,
        }
    }
}

/// Diagnostic view of the current token's age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub age_hours: i64,
    pub remaining_hours: i64,
    pub expired: bool,
    pub max_age_days: u64,
}

/// Token store settings.
#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    /// Directory holding `dashboard.env`.
    pub secrets_dir: PathBuf,
    pub max_age: Duration,
    pub grace_period: Duration,
    /// How long validation trusts the in-memory copy before re-reading the file.
    pub cache_ttl: Duration,
}

impl TokenStoreConfig {
    pub fn new(secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
            max_age: TOKEN_MAX_AGE,
            grace_period: TOKEN_GRACE_PERIOD,
            cache_ttl: Duration::from_secs(5),
        }
    }
}

struct Cached {
    state: Arc<TokenState>,
    loaded_at: Instant,
}

/// Owner of the persisted [`TokenState`].
///
/// Validation reads an `Arc` snapshot, so a rotation is observed either
/// entirely or not at all. The snapshot is refreshed from disk once it is
/// older than `cache_ttl`, which picks up rotations done by another process.
pub struct TokenStore {
    config: TokenStoreConfig,
    path: PathBuf,
    cache: RwLock<Cached>,
    // Serializes rotate/save/reload so a stale read cannot overwrite a fresh rotation.
    write_lock: Mutex<()>,
    audit: Option<Arc<AuditLog>>,
}

impl TokenStore {
    pub fn new(config: TokenStoreConfig) -> Self {
        let path = config.secrets_dir.join(TOKEN_FILE_NAME);
        let initial = resolve(&path, read_state(&path));
        Self {
            config,
            path,
            cache: RwLock::new(Cached {
                state: Arc::new(initial),
                loaded_at: Instant::now(),
            }),
            write_lock: Mutex::new(()),
            audit: None,
        }
    }

    /// Record `token_rotated` events to `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Location of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &TokenStoreConfig {
        &self.config
    }

    /// Read the token file without touching the cache.
    pub fn read_state(&self) -> LoadOutcome {
        read_state(&self.path)
    }

    /// Read the token file, falling back to an empty state when it is
    /// missing or corrupt. Never fails.
    pub fn load(&self) -> TokenState {
        let _guard = self.write_lock.lock();
        self.reload()
    }

    // Caller holds `write_lock`.
    fn reload(&self) -> TokenState {
        let state = resolve(&self.path, self.read_state());
        self.swap(state.clone());
        state
    }

    /// Persist `state` atomically with owner-only permissions.
    pub fn save(&self, state: &TokenState) -> DashgateResult<()> {
        let _guard = self.write_lock.lock();
        self.write_file(state)?;
        self.swap(state.clone());
        Ok(())
    }

    /// Current snapshot, re-read from disk if the cached copy is stale.
    ///
    /// Never waits on a writer: while a rotation or save is in progress the
    /// stale snapshot is returned and the next call refreshes it.
    pub fn state(&self) -> Arc<TokenState> {
        let stale = {
            let cache = self.cache.read();
            if cache.loaded_at.elapsed() < self.config.cache_ttl {
                return cache.state.clone();
            }
            cache.state.clone()
        };
        match self.write_lock.try_lock() {
            Some(_guard) => Arc::new(self.reload()),
            None => stale,
        }
    }

    /// Issue a new token, demoting the current one to the grace slot.
    pub fn rotate(&self) -> DashgateResult<String> {
        self.rotate_at(Utc::now())
    }

    /// [`rotate`](Self::rotate) with an explicit issue time.
    pub fn rotate_at(&self, now: DateTime<Utc>) -> DashgateResult<String> {
        let _guard = self.write_lock.lock();

        let old = resolve(&self.path, self.read_state());
        let token = generate_token()?;

        // Any earlier previous token is dropped, never chained.
        let previous = match old.current {
            Some(c) => {
                let expires_at = now
                    .checked_add_signed(to_delta(self.config.grace_period))
                    .ok_or_else(|| {
                        DashgateError::Config(format!(
                            "grace period of {}s is out of range",
                            self.config.grace_period.as_secs()
                        ))
                    })?;
                Some(PreviousToken {
                    value: c.value,
                    expires_at,
                })
            }
            None => None,
        };
        let new_state = TokenState {
            current: Some(CurrentToken {
                value: Secret::new(token.clone()),
                created_at: now,
            }),
            previous,
        };

        self.write_file(&new_state)?;
        let had_previous = new_state.previous.is_some();
        self.swap(new_state);

        let grace_secs = self.config.grace_period.as_secs();
        info!(path = %self.path.display(), had_previous, grace_secs, "Dashboard token rotated");
        if let Some(audit) = &self.audit {
            audit.record(
                "SYSTEM",
                "/internal",
                AuditAction::TokenRotated,
                format!("New token created, old token valid for {grace_secs}s grace period"),
            );
        }
        Ok(token)
    }

    /// Check a presented credential against the current and previous token.
    pub fn validate(&self, candidate: &str) -> TokenValidation {
        self.validate_at(candidate, Utc::now())
    }

    /// [`validate`](Self::validate) at an explicit time.
    pub fn validate_at(&self, candidate: &str, now: DateTime<Utc>) -> TokenValidation {
        let state = self.state();
        let Some(current) = &state.current else {
            return TokenValidation::NoTokenConfigured;
        };

        // Current wins over previous.
        if current.value.matches(candidate) {
            if now - current.created_at > to_delta(self.config.max_age) {
                return TokenValidation::TokenExpired {
                    hint: EXPIRED_HINT.to_string(),
                };
            }
            return TokenValidation::Valid;
        }

        if let Some(previous) = &state.previous {
            if previous.value.matches(candidate) {
                if now < previous.expires_at {
                    return TokenValidation::ValidGrace;
                }
                return TokenValidation::PreviousTokenExpired;
            }
        }

        TokenValidation::InvalidToken
    }

    /// Age and remaining lifetime of the current token.
    pub fn info(&self) -> Option<TokenInfo> {
        self.info_at(Utc::now())
    }

    /// [`info`](Self::info) at an explicit time.
    pub fn info_at(&self, now: DateTime<Utc>) -> Option<TokenInfo> {
        let state = self.state();
        let current = state.current.as_ref()?;

        let age_ms = (now - current.created_at).num_milliseconds();
        let max_age_ms = i64::try_from(self.config.max_age.as_millis()).unwrap_or(i64::MAX);
        let remaining_ms = max_age_ms.saturating_sub(age_ms);

        Some(TokenInfo {
            age_hours: round_hours(age_ms),
            remaining_hours: round_hours(remaining_ms).max(0),
            expired: remaining_ms <= 0,
            max_age_days: self.config.max_age.as_secs() / 86_400,
        })
    }

    fn swap(&self, state: TokenState) {
        let mut cache = self.cache.write();
        cache.state = Arc::new(state);
        cache.loaded_at = Instant::now();
    }

    fn write_file(&self, state: &TokenState) -> DashgateResult<()> {
        let dir = &self.config.secrets_dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            DashgateError::Storage(format!("Failed to create '{}': {e}", dir.display()))
        })?;

        // Temp file in the same directory so the rename stays on one filesystem.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        restrict_permissions(tmp.as_file())?;
        tmp.write_all(render_state(state).as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            DashgateError::Storage(format!(
                "Failed to persist '{}': {}",
                self.path.display(),
                e.error
            ))
        })?;
        debug!(path = %self.path.display(), "Token state saved");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> io::Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> io::Result<()> {
    Ok(())
}

fn read_state(path: &Path) -> LoadOutcome {
    match std::fs::read_to_string(path) {
        Ok(content) => match parse_state(&content) {
            Ok(state) => LoadOutcome::Loaded(state),
            Err(reason) => LoadOutcome::Corrupt(reason),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => LoadOutcome::Absent,
        Err(e) => LoadOutcome::Corrupt(format!("unreadable: {e}")),
    }
}

fn resolve(path: &Path, outcome: LoadOutcome) -> TokenState {
    match outcome {
        LoadOutcome::Loaded(state) => state,
        LoadOutcome::Absent => TokenState::default(),
        LoadOutcome::Corrupt(reason) => {
            warn!(
                path = %path.display(),
                reason = %reason,
                "Token file is corrupt, running without a dashboard token"
            );
            TokenState::default()
        }
    }
}

fn parse_state(content: &str) -> Result<TokenState, String> {
    let mut token = None;
    let mut created = None;
    let mut previous = None;
    let mut previous_expires = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "DASHBOARD_TOKEN" => token = non_empty(value),
            "TOKEN_CREATED" => created = Some(parse_millis("TOKEN_CREATED", value)?),
            "PREVIOUS_TOKEN" => previous = non_empty(value),
            "PREVIOUS_EXPIRES" => {
                previous_expires = Some(parse_millis("PREVIOUS_EXPIRES", value)?);
            }
            _ => {}
        }
    }

    let current = match (token, created) {
        (Some(value), Some(created_at)) => Some(CurrentToken {
            value: Secret::new(value),
            created_at,
        }),
        (Some(_), None) => return Err("DASHBOARD_TOKEN without TOKEN_CREATED".to_string()),
        (None, _) => None,
    };
    let previous = match (previous, previous_expires) {
        (Some(value), Some(expires_at)) => Some(PreviousToken {
            value: Secret::new(value),
            expires_at,
        }),
        (Some(_), None) => return Err("PREVIOUS_TOKEN without PREVIOUS_EXPIRES".to_string()),
        (None, _) => None,
    };

    Ok(TokenState { current, previous })
}

fn render_state(state: &TokenState) -> String {
    let mut content = String::from("# Security Dashboard Token (auto-managed)\n");
    if let Some(current) = &state.current {
        content.push_str(&format!("DASHBOARD_TOKEN={}\n", current.value.expose()));
        content.push_str(&format!(
            "TOKEN_CREATED={}\n",
            current.created_at.timestamp_millis()
        ));
    }
    if let Some(previous) = &state.previous {
        content.push_str(&format!("PREVIOUS_TOKEN={}\n", previous.value.expose()));
        content.push_str(&format!(
            "PREVIOUS_EXPIRES={}\n",
            previous.expires_at.timestamp_millis()
        ));
    }
    content
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_millis(key: &str, value: &str) -> Result<DateTime<Utc>, String> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| format!("{key} is not an epoch-millisecond timestamp: {value:?}"))
}

/// 32 bytes from the OS random source, hex encoded.
fn generate_token() -> DashgateResult<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| DashgateError::Security(format!("OS random source unavailable: {e}")))?;
    Ok(hex::encode(bytes))
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn round_hours(ms: i64) -> i64 {
    (ms as f64 / 3_600_000.0).round() as i64
}
