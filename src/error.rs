//! Error kinds shared across the engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network, TLS, or 5xx trouble. Retried until the run is cancelled.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// 401/403 from the store; the device credential is likely invalid.
    /// Halts the current run.
    #[error("permission denied (HTTP {0})")]
    Permission(u16),

    /// 404 on a GET or history lookup. Never retried.
    #[error("object not found")]
    NotFound,

    /// A body that fails to parse, or a reply we can't make sense of.
    #[error("malformed object: {0}")]
    Malformed(String),

    /// stat/open/read/readdir failure. Callers log and skip the entry.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// A single directory entry too large to fit in one object.
    #[error("oversized directory entry - giving up")]
    OversizedEntry,

    /// The surrounding backup run was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
