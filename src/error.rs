//! Error taxonomy for the synchronization engine.

use thiserror::Error;

/// How a failed Folder Session should be treated by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection lost or timed out. The session is recreated on the next refresh.
    Transport,
    /// Credentials rejected. The mailbox is stamped so storage backs off.
    Authentication,
}

/// Errors raised by a protocol connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered NO/BAD to a single command. Not fatal.
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("folder not found: {0}")]
    FolderNotFound(String),
}

impl SessionError {
    /// Classification used when this error ends a session, `None` when the
    /// error only affects the command that raised it.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SessionError::Authentication(_) => Some(FailureKind::Authentication),
            SessionError::Transport(_) => Some(FailureKind::Transport),
            SessionError::Rejected(_) | SessionError::FolderNotFound(_) => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.failure_kind().is_some()
    }
}

impl From<async_imap::error::Error> for SessionError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;

        match err {
            Error::Io(e) => SessionError::Transport(e.to_string()),
            Error::ConnectionLost => SessionError::Transport("connection lost".to_string()),
            Error::No(msg) | Error::Bad(msg) => SessionError::Rejected(msg),
            other => SessionError::Rejected(other.to_string()),
        }
    }
}

/// Errors raised by the orchestrator and the supervisor.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Nothing to synchronize for this user (e.g. no enabled mailboxes).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage was in a state reconciliation cannot handle. The affected
    /// message or action is skipped.
    #[error("reconciliation error: {0}")]
    Reconciliation(String),

    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
