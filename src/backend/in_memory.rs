use crate::backend::api::{
    Backend, BackendError, CasOutcome, LockKey, LockRecord, RenewOutcome, SessionBehavior, SessionId, SessionSpec,
    WatchOutcome,
};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

// This models the parts of Consul's session + KV semantics that leader election relies on, so
// elections can run against something real-ish in tests and demos. It is not durable and there
// is no lock-delay enforcement.

/// InMemoryBackend is a process-local coordination backend. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

/// InMemoryConnection is one client's view of an `InMemoryBackend`. Each connection can be cut
/// off and healed independently to simulate a network partition of that client.
#[derive(Clone)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    reachable: Arc<watch::Sender<bool>>,
}

struct Shared {
    state: Mutex<State>,
    // Bumped on every mutation so blocked watches re-check their key.
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, SessionEntry>,
    locks: HashMap<LockKey, LockEntry>,
    last_index: u64,
}

struct SessionEntry {
    ttl: Duration,
    expires_at: Instant,
    behavior: SessionBehavior,
}

struct LockEntry {
    holder: Option<SessionId>,
    value: Option<Bytes>,
    modify_index: u64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        InMemoryBackend {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                version,
            }),
        }
    }

    pub fn connect(&self) -> InMemoryConnection {
        let (reachable, _) = watch::channel(true);
        InMemoryConnection {
            shared: self.shared.clone(),
            reachable: Arc::new(reachable),
        }
    }

    /// Simulates the backend dropping a session (e.g. a failed health check).
    pub fn invalidate_session(&self, session_id: &SessionId) {
        let mut state = self.shared.lock_state();
        if self.shared.destroy_session(&mut state, session_id) {
            self.shared.bump_version();
        }
    }

    pub fn holder(&self, key: &LockKey) -> Option<SessionId> {
        let mut state = self.shared.lock_state();
        self.shared.expire_sessions(&mut state, Instant::now());
        state.record(key).holder
    }

    pub fn record(&self, key: &LockKey) -> LockRecord {
        let mut state = self.shared.lock_state();
        self.shared.expire_sessions(&mut state, Instant::now());
        state.record(key)
    }

    pub fn live_sessions(&self) -> usize {
        let mut state = self.shared.lock_state();
        self.shared.expire_sessions(&mut state, Instant::now());
        state.sessions.len()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnection {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_replace(reachable);
    }

    pub fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    fn ensure_reachable(&self) -> Result<(), BackendError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection refused".into()))
        }
    }

    /// Common prologue of every call: fail if partitioned, then sweep expired sessions.
    fn begin(&self) -> Result<MutexGuard<'_, State>, BackendError> {
        self.ensure_reachable()?;
        let mut state = self.shared.lock_state();
        self.shared.expire_sessions(&mut state, Instant::now());
        Ok(state)
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("InMemoryBackend state mutex poisoned")
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn expire_sessions(&self, state: &mut State, now: Instant) {
        let expired: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        for session_id in expired {
            changed |= self.destroy_session(state, &session_id);
        }
        if changed {
            self.bump_version();
        }
    }

    /// Returns true if the session existed.
    fn destroy_session(&self, state: &mut State, session_id: &SessionId) -> bool {
        let entry = match state.sessions.remove(session_id) {
            Some(entry) => entry,
            None => return false,
        };

        let held: Vec<LockKey> = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.holder.as_ref() == Some(session_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in held {
            let index = state.next_index();
            if let Some(lock) = state.locks.get_mut(&key) {
                lock.holder = None;
                lock.modify_index = index;
                if entry.behavior == SessionBehavior::Delete {
                    lock.value = None;
                }
            }
        }

        true
    }
}

impl State {
    fn next_index(&mut self) -> u64 {
        self.last_index += 1;
        self.last_index
    }

    fn record(&self, key: &LockKey) -> LockRecord {
        match self.locks.get(key) {
            Some(lock) => LockRecord {
                holder: lock.holder.clone(),
                modify_index: lock.modify_index,
                value: lock.value.clone(),
            },
            None => LockRecord::absent(),
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.sessions.values().map(|entry| entry.expires_at).min()
    }
}

fn random_session_id() -> SessionId {
    let mut rng = rand::thread_rng();
    SessionId::new(format!(
        "{:08x}-{:04x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>(),
        rng.gen::<u64>() & 0xffff_ffff_ffff
    ))
}

#[async_trait::async_trait]
impl Backend for InMemoryConnection {
    async fn create_session(&self, spec: SessionSpec) -> Result<SessionId, BackendError> {
        let mut state = self.begin()?;
        let session_id = random_session_id();
        state.sessions.insert(
            session_id.clone(),
            SessionEntry {
                ttl: spec.ttl,
                expires_at: Instant::now() + spec.ttl,
                behavior: spec.behavior,
            },
        );

        Ok(session_id)
    }

    async fn renew_session(&self, session_id: &SessionId) -> Result<RenewOutcome, BackendError> {
        let mut state = self.begin()?;
        match state.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.expires_at = Instant::now() + entry.ttl;
                Ok(RenewOutcome::Renewed)
            }
            None => Ok(RenewOutcome::Invalid),
        }
    }

    async fn release_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        let mut state = self.begin()?;
        if self.shared.destroy_session(&mut state, session_id) {
            self.shared.bump_version();
        }

        Ok(())
    }

    async fn cas_put_lock(
        &self,
        key: &LockKey,
        session_id: &SessionId,
        value: Bytes,
        expect_empty: bool,
    ) -> Result<CasOutcome, BackendError> {
        let mut state = self.begin()?;
        if !state.sessions.contains_key(session_id) {
            return Err(BackendError::InvalidSession(session_id.clone()));
        }

        if let Some(holder) = state.locks.get(key).and_then(|lock| lock.holder.clone()) {
            if expect_empty || &holder != session_id {
                return Ok(CasOutcome::Conflict { holder: Some(holder) });
            }
        }

        let index = state.next_index();
        state.locks.insert(
            key.clone(),
            LockEntry {
                holder: Some(session_id.clone()),
                value: Some(value),
                modify_index: index,
            },
        );
        self.shared.bump_version();

        Ok(CasOutcome::Applied)
    }

    async fn cas_delete_lock(
        &self,
        key: &LockKey,
        session_id: &SessionId,
        value: Bytes,
    ) -> Result<CasOutcome, BackendError> {
        let mut state = self.begin()?;
        let holder = state.locks.get(key).and_then(|lock| lock.holder.clone());
        if holder.as_ref() != Some(session_id) {
            return Ok(CasOutcome::Conflict { holder });
        }

        let index = state.next_index();
        if let Some(lock) = state.locks.get_mut(key) {
            lock.holder = None;
            lock.value = Some(value);
            lock.modify_index = index;
        }
        self.shared.bump_version();

        Ok(CasOutcome::Applied)
    }

    async fn read_lock(&self, key: &LockKey) -> Result<LockRecord, BackendError> {
        let state = self.begin()?;
        Ok(state.record(key))
    }

    async fn watch_lock(
        &self,
        key: &LockKey,
        since_index: u64,
        timeout: Duration,
    ) -> Result<WatchOutcome, BackendError> {
        let deadline = Instant::now() + timeout;
        // Subscribe before the first check so no mutation can slip between check and wait.
        let mut version_rx = self.shared.version.subscribe();
        let mut reachable_rx = self.reachable.subscribe();

        loop {
            let wake_at = {
                let state = self.begin()?;
                let record = state.record(key);
                if record.modify_index > since_index {
                    return Ok(WatchOutcome::Changed(record));
                }
                // Sessions only expire when somebody looks, so wake up to look.
                match state.next_expiry() {
                    Some(expiry) if expiry < deadline => expiry,
                    _ => deadline,
                }
            };

            tokio::select! {
                _ = version_rx.changed() => {}
                _ = reachable_rx.changed() => {}
                _ = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        self.ensure_reachable()?;
                        return Ok(WatchOutcome::TimedOut);
                    }
                }
            }
        }
    }
}
