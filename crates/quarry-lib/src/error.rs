use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the content engine.
///
/// Variants map onto how callers recover: transport faults are retried by the
/// retry harness, `PatchApplyFailed` triggers the orchestrator's rescue path,
/// `HashMismatch` is surfaced immediately and never retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("hash mismatch for {path}: expected sha256 {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("incomplete download: received {received} of {expected} bytes")]
    IncompleteDownload { received: u64, expected: u64 },

    #[error("download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("cache entry corrupt: {0}")]
    CacheCorrupt(String),

    #[error("patch tool exited with code {code}: {stderr}")]
    PatchApplyFailed { code: i32, stderr: String },

    #[error("no build available on the CDN for channel {0}")]
    NoBuildAvailable(String),

    #[error("invalid configuration: {0}")]
    ConfigCorrupt(String),

    #[error("migration from schema version {from} failed: {reason}")]
    MigrationFailed { from: u64, reason: String },

    #[error("invalid replacement rule: {0}")]
    InvalidReplacement(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(String),

    /// A result observed through the in-flight dedup map. Followers of a
    /// deduplicated download see the winner's error through this variant so
    /// kind-based handling still works.
    #[error(transparent)]
    Shared(Arc<Error>),
}

/// Substrings that identify a transport-level failure when all we have is a
/// stringly-typed error from the HTTP stack or the OS.
const TRANSPORT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "timed out",
    "timeout",
    "dns",
    "no such host",
    "name or service not known",
    "broken pipe",
    "network",
    "tls",
];

impl Error {
    /// Whether the retry harness should consider another attempt.
    ///
    /// 5xx statuses and incomplete bodies are transient per §7; 4xx, hash
    /// mismatches and everything structural are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(msg) => {
                let msg = msg.to_ascii_lowercase();
                TRANSPORT_MARKERS.iter().any(|m| msg.contains(m))
            }
            Error::HttpStatus { status, .. } => *status >= 500,
            Error::IncompleteDownload { .. } => true,
            Error::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::Interrupted
                )
            }
            Error::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Permission failures on state writes are logged and swallowed so the
    /// launcher keeps running from memory on a read-only disk.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            Error::Shared(inner) => inner.is_permission_denied(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Stable machine-readable code for structured reporting.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Network(_) => "network_transport",
            Error::HttpStatus { .. } => "http_status",
            Error::HashMismatch { .. } => "hash_mismatch",
            Error::IncompleteDownload { .. } => "incomplete_download",
            Error::DownloadFailed { .. } => "download_failed",
            Error::CacheCorrupt(_) => "cache_corrupt",
            Error::PatchApplyFailed { .. } => "patch_apply_failed",
            Error::NoBuildAvailable(_) => "no_build_available",
            Error::ConfigCorrupt(_) => "config_corrupt",
            Error::MigrationFailed { .. } => "migration_failed",
            Error::InvalidReplacement(_) => "invalid_replacement",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Archive(_) => "archive",
            Error::Shared(inner) => inner.code(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Network(format!("timeout: {e}"))
        } else if e.is_connect() {
            Error::Network(format!("connection failed: {e}"))
        } else if let Some(status) = e.status() {
            Error::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            Error::Network(e.to_string())
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Archive(e.to_string())
    }
}

impl From<Arc<Error>> for Error {
    fn from(e: Arc<Error>) -> Self {
        Error::Shared(e)
    }
}
