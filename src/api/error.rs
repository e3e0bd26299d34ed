use crate::backend::{BackendError, SessionId};

/// Errors surfaced by leader election. Transient backend trouble is retried internally and shows
/// up as `ElectionStatus::Disconnected` rather than as one of these. These are what the
/// internals hand each other, plus what the `LeaderElection` handle can return.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Coordination backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Session {0} was invalidated by the backend")]
    SessionInvalidated(SessionId),

    // Expected in normal operation: somebody else is leader.
    #[error("Lock is held by another session ({holder:?})")]
    LockConflict { holder: Option<SessionId> },

    #[error("Illegal election configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Backend refused the request: {0}")]
    NonRecoverable(String),

    // Election logic runs on a background task. This error is returned if the task has exited.
    #[error("Election task has exited")]
    ElectionExited,
}

impl ElectionError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ElectionError::BackendUnavailable(_) | ElectionError::LockConflict { .. }
        )
    }
}

impl From<BackendError> for ElectionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(msg) => ElectionError::BackendUnavailable(msg),
            BackendError::InvalidSession(session_id) => ElectionError::SessionInvalidated(session_id),
            BackendError::Rejected(msg) => ElectionError::NonRecoverable(msg),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ConfigurationError(pub(crate) String);

impl ConfigurationError {
    pub(crate) fn new<S: Into<String>>(msg: S) -> Self {
        ConfigurationError(msg.into())
    }
}
