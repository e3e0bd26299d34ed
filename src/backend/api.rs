use bytes::Bytes;
use std::fmt;
use tokio::time::Duration;

/// Opaque session token issued by the coordination backend.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionId(String);

impl SessionId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of the leadership slot in the backend's KV store.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct LockKey(String);

impl LockKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        LockKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the backend does to locks held by a session once that session is invalidated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionBehavior {
    /// Clear the holder, keep the key and its value.
    Release,
    /// Delete the key entirely.
    Delete,
}

#[derive(Clone, Debug)]
pub struct SessionSpec {
    pub name: String,
    pub ttl: Duration,
    pub lock_delay: Duration,
    pub behavior: SessionBehavior,
}

/// Backend view of the lock key. Observed, never owned, by this crate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockRecord {
    pub holder: Option<SessionId>,
    /// Monotonically increasing. Zero means the key has never been written.
    pub modify_index: u64,
    pub value: Option<Bytes>,
}

impl LockRecord {
    pub fn absent() -> Self {
        LockRecord {
            holder: None,
            modify_index: 0,
            value: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RenewOutcome {
    Renewed,
    /// The backend no longer knows the session. Terminal for that session.
    Invalid,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CasOutcome {
    Applied,
    Conflict { holder: Option<SessionId> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchOutcome {
    /// The record's `modify_index` is strictly greater than the index the watch was issued with.
    Changed(LockRecord),
    /// The blocking query ran out its timeout without any change.
    TimedOut,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Coordination backend unavailable: {0}")]
    Unavailable(String),

    #[error("Session {0} is not known to the backend")]
    InvalidSession(SessionId),

    // e.g. ACL denied or malformed request. Retrying won't help.
    #[error("Backend rejected the request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Backend is the slice of a Consul-like KV + session API that leader election needs. Calls are
/// stateless, so one instance is shared by every component of an election.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn create_session(&self, spec: SessionSpec) -> Result<SessionId, BackendError>;

    async fn renew_session(&self, session_id: &SessionId) -> Result<RenewOutcome, BackendError>;

    /// Destroys the session, which releases every lock it holds per its `SessionBehavior`.
    /// Releasing an unknown session is not an error.
    async fn release_session(&self, session_id: &SessionId) -> Result<(), BackendError>;

    /// Bind `session_id` to `key`. With `expect_empty`, the write applies only when the lock has
    /// no holder. Otherwise it also applies when `session_id` already holds it.
    async fn cas_put_lock(
        &self,
        key: &LockKey,
        session_id: &SessionId,
        value: Bytes,
        expect_empty: bool,
    ) -> Result<CasOutcome, BackendError>;

    /// Clear the holder of `key` iff it is currently `session_id`, storing `value`.
    async fn cas_delete_lock(
        &self,
        key: &LockKey,
        session_id: &SessionId,
        value: Bytes,
    ) -> Result<CasOutcome, BackendError>;

    async fn read_lock(&self, key: &LockKey) -> Result<LockRecord, BackendError>;

    /// Blocking query: returns once `key`'s modify index exceeds `since_index`, or after
    /// `timeout`.
    async fn watch_lock(
        &self,
        key: &LockKey,
        since_index: u64,
        timeout: Duration,
    ) -> Result<WatchOutcome, BackendError>;
}
