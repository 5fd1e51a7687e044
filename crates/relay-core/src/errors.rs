use thiserror::Error;

/// Narrow error enum for the registry/DLQ/server-registry crate, mirroring
/// the teacher's `NanobotError` in spirit: a handful of named variants for
/// the failures callers actually need to branch on, plus a catch-all for
/// everything else.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("session not found for '{0}'")]
    SessionNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
