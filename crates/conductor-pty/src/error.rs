use std::path::PathBuf;

use crate::pty::PtyError;
use crate::session::SessionId;

/// Errors returned by the session manager's synchronous operations.
///
/// Failures that happen after a session is running (the process dying,
/// reaping failing) are never returned here; they arrive as events.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("working directory does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("failed to spawn session process: {0}")]
    SpawnFailure(String),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session limit reached ({max} live sessions)")]
    CapacityExceeded { max: usize },

    #[error("session manager is shutting down")]
    ShuttingDown,

    #[error("session id {0} is already registered")]
    DuplicateId(SessionId),

    #[error("session {0} already has an output subscription")]
    AlreadySubscribed(SessionId),

    #[error("invalid terminal geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error(transparent)]
    Pty(#[from] PtyError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
