use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Default size ceiling of the active audit log before it is archived (5 MiB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Fixed vocabulary of security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Request carried no `Authorization` header.
    AuthMissing,
    /// Request carried a credential that was rejected.
    AuthFailed,
    /// Request authenticated with the previous token during its grace period.
    AuthGrace,
    /// Client exceeded the request-volume window.
    RateExceeded,
    /// Client is still inside an active failure block.
    RateBlocked,
    /// Client crossed the failed-auth threshold and was blocked.
    ClientBlocked,
    /// A new dashboard token was issued.
    TokenRotated,
}

impl AuditAction {
    /// The tag written to the log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthFailed => "auth_failed",
            Self::AuthGrace => "auth_grace",
            Self::RateExceeded => "rate_exceeded",
            Self::RateBlocked => "rate_blocked",
            Self::ClientBlocked => "client_blocked",
            Self::TokenRotated => "token_rotated",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    pub endpoint: String,
    pub action: AuditAction,
    pub detail: String,
}

/// Where the audit log lives and when it is archived.
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    /// Path of the active log file.
    pub path: PathBuf,
    /// Size in bytes above which the active log is archived before the next append.
    pub max_size: u64,
}

impl AuditLogConfig {
    /// Config for `path` with the default 5 MiB ceiling.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: MAX_LOG_SIZE,
        }
    }
}

enum Command {
    Append(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log of security events.
///
/// Entries are handed to a single background writer task, so appends never
/// interleave and the archive-then-append step cannot be split by a concurrent
/// record. Write failures are reported through `tracing` and never reach the
/// caller.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<Command>,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that writes entries to disk.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AuditLogConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let path = config.path.clone();
        let mut writer = Writer {
            path: config.path,
            max_size: config.max_size,
            file: None,
            size: 0,
        };

        tokio::spawn(async move {
            if let Some(parent) = writer.path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    error!(path = %parent.display(), error = %e, "[audit] Failed to create log directory");
                }
            }

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Append(entry) => {
                        if let Err(e) = writer.append(&entry).await {
                            error!(
                                path = %writer.path.display(),
                                action = %entry.action,
                                error = %e,
                                "[audit] Failed to write log"
                            );
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("audit writer exiting");
        });

        Self { tx, path }
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, entry: AuditEntry) {
        info!(
            client = %entry.client,
            endpoint = %entry.endpoint,
            action = %entry.action,
            detail = %entry.detail,
            "audit"
        );
        if self.tx.send(Command::Append(entry)).is_err() {
            error!("[audit] Writer task is gone, entry dropped");
        }
    }

    /// Record one security event stamped with the current time.
    pub fn record(
        &self,
        client: impl Into<String>,
        endpoint: impl Into<String>,
        action: AuditAction,
        detail: impl Into<String>,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            client: client.into(),
            endpoint: endpoint.into(),
            action,
            detail: detail.into(),
        });
    }

    /// Wait until every entry recorded before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Writer {
    path: PathBuf,
    max_size: u64,
    // Kept open across appends; dropped on any error so the next entry reopens.
    file: Option<tokio::fs::File>,
    size: u64,
}

impl Writer {
    async fn append(&mut self, entry: &AuditEntry) -> io::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let result = self.write_line(line.as_bytes()).await;
        if result.is_err() {
            self.file = None;
        }
        result
    }

    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            self.open().await?;
        }
        if self.size > self.max_size {
            self.file = None;
            self.archive().await?;
            self.open().await?;
        }

        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("audit log is not open"));
        };
        file.write_all(line).await?;
        file.flush().await?;
        self.size += line.len() as u64;
        Ok(())
    }

    async fn open(&mut self) -> io::Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.size = file.metadata().await?.len();
        self.file = Some(file);
        Ok(())
    }

    async fn archive(&self) -> io::Result<()> {
        let millis = Utc::now().timestamp_millis();
        let mut archive = archive_path(&self.path, millis, 0);
        let mut attempt = 0;
        while tokio::fs::try_exists(&archive).await? {
            attempt += 1;
            archive = archive_path(&self.path, millis, attempt);
        }

        tokio::fs::rename(&self.path, &archive).await?;
        info!(
            archive = %archive.display(),
            size = self.size,
            "[audit] Log exceeded size ceiling, archived"
        );
        Ok(())
    }
}

/// `audit.log` -> `audit.<millis>.log`, or `audit.<millis>-<n>.log` when that is taken.
pub(crate) fn archive_path(path: &Path, millis: i64, attempt: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audit".to_string());
    let stamp = if attempt == 0 {
        millis.to_string()
    } else {
        format!("{millis}-{attempt}")
    };
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{stamp}"),
    };
    path.with_file_name(name)
}
