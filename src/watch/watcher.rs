use crate::actor::WeakActorClient;
use crate::backend::{Backend, BackendError, LockKey, LockRecord, SessionId, WatchOutcome};
use crate::retry::{RetryError, RetryScheduler};
use crate::timers::{Clock, RealClock};
use crate::watch::WatchEvent;
use crate::ElectionError;
use backoff::backoff::Backoff;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// LeadershipWatcher long-polls the lock key and tells the actor who holds it.
#[derive(Clone)]
pub(crate) struct LeadershipWatcher<C: Clock = RealClock> {
    logger: slog::Logger,
    backend: Arc<dyn Backend>,
    key: LockKey,
    watch_timeout: Duration,
    operation_timeout: Duration,
    retry: RetryScheduler<C>,
    actor_client: WeakActorClient,
    clock: C,
}

/// Dropping the handle cancels the watch. `stop()` also waits for the task to finish.
pub(crate) struct WatcherHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WatcherHandle {
    /// Returns false if the task didn't finish within `timeout`.
    pub(crate) async fn stop(mut self, timeout: Duration) -> bool {
        self.cancel.cancel();
        tokio::time::timeout(timeout, &mut self.join).await.is_ok()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl LeadershipWatcher {
    pub(crate) fn new(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        key: LockKey,
        watch_timeout: Duration,
        operation_timeout: Duration,
        retry: RetryScheduler,
        actor_client: WeakActorClient,
    ) -> Self {
        Self::with_clock(
            logger,
            backend,
            key,
            watch_timeout,
            operation_timeout,
            retry,
            actor_client,
            RealClock,
        )
    }
}

impl<C: Clock> LeadershipWatcher<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_clock(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        key: LockKey,
        watch_timeout: Duration,
        operation_timeout: Duration,
        retry: RetryScheduler<C>,
        actor_client: WeakActorClient,
        clock: C,
    ) -> Self {
        LeadershipWatcher {
            logger,
            backend,
            key,
            watch_timeout,
            operation_timeout,
            retry,
            actor_client,
            clock,
        }
    }

    pub(crate) fn spawn(&self) -> WatcherHandle {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.clone().run(cancel.clone()));

        WatcherHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut clock = self.clock.clone();
        // Spans consecutive broken watches, so a backend that answers reads but fails every
        // blocking query is polled less and less often. Reset once a blocking query completes.
        let mut failures = self.retry.policy().new_backoff();
        let mut reestablishing = false;

        loop {
            if reestablishing {
                let delay = failures.next_backoff().unwrap_or(self.retry.policy().max_interval);
                slog::debug!(self.logger, "Re-establishing watch on {} in {:?}", self.key, delay);
                if !clock.sleep_or_cancel(delay, &cancel).await {
                    return;
                }
            }
            reestablishing = true;

            let record = match self.establish(&cancel).await {
                Some(record) => record,
                None => return,
            };
            let mut index = record.modify_index;
            let mut last_holder = record.holder.clone();
            slog::debug!(self.logger, "Watching {} from index {}", self.key, index);
            if !self.emit(WatchEvent::LockStateChanged(record.into())).await {
                return;
            }

            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.watch_once(index) => result,
                };

                match result {
                    Ok(WatchOutcome::TimedOut) => {
                        failures.reset();
                        slog::trace!(self.logger, "Watch on {} timed out, re-issuing", self.key);
                    }
                    Ok(WatchOutcome::Changed(record)) => {
                        failures.reset();
                        index = record.modify_index;
                        if record.holder == last_holder {
                            slog::trace!(self.logger, "Index advanced to {} with the same holder", index);
                            continue;
                        }
                        slog::debug!(
                            self.logger,
                            "Holder of {} changed from {} to {}",
                            self.key,
                            display_holder(&last_holder),
                            display_holder(&record.holder)
                        );
                        last_holder = record.holder.clone();
                        if !self.emit(WatchEvent::LockStateChanged(record.into())).await {
                            return;
                        }
                    }
                    Err(e) => {
                        slog::warn!(self.logger, "Watch on {} interrupted: {}", self.key, e);
                        if !self.emit(WatchEvent::Interrupted(ElectionError::from(e))).await {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Read the current state, retrying in bounded cycles for as long as it takes. Each exhausted
    /// cycle is reported. Returns None once cancelled.
    async fn establish(&self, cancel: &CancellationToken) -> Option<LockRecord> {
        let mut clock = self.clock.clone();

        loop {
            match self.retry.run("read lock", cancel, || self.read_once()).await {
                Ok(record) => return Some(record),
                Err(RetryError::Cancelled) => return None,
                Err(e) => {
                    if let RetryError::Permanent(rejected) = &e {
                        slog::error!(self.logger, "Reading {} was rejected: {}", self.key, rejected);
                    }
                    if let Some(last) = e.into_last_error() {
                        if !self.emit(WatchEvent::Interrupted(ElectionError::from(last))).await {
                            return None;
                        }
                    }
                    if !clock.sleep_or_cancel(self.retry.policy().max_interval, cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn read_once(&self) -> Result<LockRecord, BackendError> {
        tokio::time::timeout(self.operation_timeout, self.backend.read_lock(&self.key))
            .await
            .map_err(|_| BackendError::Unavailable("read lock timed out".into()))?
    }

    async fn watch_once(&self, index: u64) -> Result<WatchOutcome, BackendError> {
        // The backend bounds the blocking query itself. This only guards against a hung connection.
        let guard = self.watch_timeout + self.operation_timeout;
        tokio::time::timeout(guard, self.backend.watch_lock(&self.key, index, self.watch_timeout))
            .await
            .map_err(|_| BackendError::Unavailable("watch lock timed out".into()))?
    }

    async fn emit(&self, event: WatchEvent) -> bool {
        self.actor_client.watch_event(event).await.is_ok()
    }
}

fn display_holder(holder: &Option<SessionId>) -> String {
    holder
        .as_ref()
        .map(|h| h.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::backend::{InMemoryBackend, InMemoryConnection, SessionBehavior, SessionSpec};
    use crate::retry::RetryPolicy;
    use crate::actor::Event;
    use crate::backend::{CasOutcome, RenewOutcome};
    use crate::timers::TestUtilActor;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> LockKey {
        LockKey::new("leadership/test")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(50),
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_attempts: 10,
            max_elapsed: None,
        }
    }

    struct Fixture {
        backend: InMemoryBackend,
        connection: InMemoryConnection,
        actor: TestUtilActor,
        _client: ActorClient,
        handle: WatcherHandle,
    }

    fn spawn_watcher(watch_timeout: Duration) -> Fixture {
        let backend = InMemoryBackend::new();
        let connection = backend.connect();
        let (client, rx) = ActorClient::new(10);
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let watcher = LeadershipWatcher::new(
            logger.clone(),
            Arc::new(connection.clone()),
            key(),
            watch_timeout,
            Duration::from_secs(1),
            RetryScheduler::new(logger, policy()),
            client.weak(),
        );
        let handle = watcher.spawn();

        Fixture {
            backend,
            connection,
            actor: TestUtilActor::new(rx).with_quiet_period(Duration::from_millis(150)),
            _client: client,
            handle,
        }
    }

    async fn new_session(connection: &InMemoryConnection) -> SessionId {
        connection
            .create_session(SessionSpec {
                name: "test".into(),
                ttl: Duration::from_secs(60),
                lock_delay: Duration::from_secs(0),
                behavior: SessionBehavior::Release,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reports_initial_state_then_holder_changes() {
        // -- setup --
        let mut f = spawn_watcher(Duration::from_secs(5));
        let session = new_session(&f.connection).await;

        // -- execute & verify --
        f.actor.assert_lock_state_changed(None).await;

        f.connection
            .cas_put_lock(&key(), &session, Bytes::from_static(b"{}"), true)
            .await
            .unwrap();
        let observation = f.actor.assert_lock_state_changed(Some(&session)).await;
        assert!(observation.modify_index > 0);

        f.connection
            .cas_delete_lock(&key(), &session, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        f.actor.assert_lock_state_changed(None).await;
    }

    #[tokio::test]
    async fn watch_timeouts_are_silent() {
        let mut f = spawn_watcher(Duration::from_millis(20));

        f.actor.assert_lock_state_changed(None).await;

        // Several timeouts pass within the quiet period.
        f.actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn index_advance_with_same_holder_is_silent() {
        // -- setup --
        let mut f = spawn_watcher(Duration::from_secs(5));
        let session = new_session(&f.connection).await;
        f.connection
            .cas_put_lock(&key(), &session, Bytes::from_static(b"{}"), true)
            .await
            .unwrap();
        f.actor.assert_lock_state_changed(Some(&session)).await;

        // -- execute --
        // Rewriting our own lock bumps the index but keeps the holder.
        f.connection
            .cas_put_lock(&key(), &session, Bytes::from_static(b"{\"hostname\":\"b\"}"), false)
            .await
            .unwrap();

        // -- verify --
        f.actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn session_expiry_is_observed_as_release() {
        let mut f = spawn_watcher(Duration::from_secs(5));
        let session = f
            .connection
            .create_session(SessionSpec {
                name: "short".into(),
                ttl: Duration::from_millis(100),
                lock_delay: Duration::from_secs(0),
                behavior: SessionBehavior::Release,
            })
            .await
            .unwrap();
        f.connection
            .cas_put_lock(&key(), &session, Bytes::from_static(b"{}"), true)
            .await
            .unwrap();

        f.actor.assert_lock_state_changed(Some(&session)).await;
        f.actor.assert_lock_state_changed(None).await;
        assert_eq!(f.backend.holder(&key()), None);
    }

    #[tokio::test]
    async fn partition_interrupts_and_heal_re_establishes() {
        // -- setup --
        let mut f = spawn_watcher(Duration::from_secs(5));
        let session = new_session(&f.connection).await;
        f.connection
            .cas_put_lock(&key(), &session, Bytes::from_static(b"{}"), true)
            .await
            .unwrap();
        f.actor.assert_lock_state_changed(Some(&session)).await;

        // -- execute & verify --
        f.connection.set_reachable(false);
        let error = f.actor.assert_watch_interrupted().await;
        assert!(matches!(error, ElectionError::BackendUnavailable(_)));

        f.connection.set_reachable(true);
        // Re-establishment reports the state even though the holder never changed.
        f.actor.assert_lock_state_changed(Some(&session)).await;
    }

    #[tokio::test]
    async fn stop_ends_the_task() {
        let mut f = spawn_watcher(Duration::from_secs(5));
        f.actor.assert_lock_state_changed(None).await;

        assert!(f.handle.stop(Duration::from_secs(1)).await);

        let session = new_session(&f.connection).await;
        f.connection
            .cas_put_lock(&key(), &session, Bytes::from_static(b"{}"), true)
            .await
            .unwrap();
        f.actor.assert_no_event().await;
    }

    /// Answers reads, fails every blocking query.
    struct BrokenWatch {
        inner: InMemoryConnection,
        reads: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Backend for BrokenWatch {
        async fn create_session(&self, spec: SessionSpec) -> Result<SessionId, BackendError> {
            self.inner.create_session(spec).await
        }

        async fn renew_session(&self, session_id: &SessionId) -> Result<RenewOutcome, BackendError> {
            self.inner.renew_session(session_id).await
        }

        async fn release_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
            self.inner.release_session(session_id).await
        }

        async fn cas_put_lock(
            &self,
            key: &LockKey,
            session_id: &SessionId,
            value: Bytes,
            expect_empty: bool,
        ) -> Result<CasOutcome, BackendError> {
            self.inner.cas_put_lock(key, session_id, value, expect_empty).await
        }

        async fn cas_delete_lock(
            &self,
            key: &LockKey,
            session_id: &SessionId,
            value: Bytes,
        ) -> Result<CasOutcome, BackendError> {
            self.inner.cas_delete_lock(key, session_id, value).await
        }

        async fn read_lock(&self, key: &LockKey) -> Result<LockRecord, BackendError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_lock(key).await
        }

        async fn watch_lock(
            &self,
            _key: &LockKey,
            _since_index: u64,
            _timeout: Duration,
        ) -> Result<WatchOutcome, BackendError> {
            Err(BackendError::Unavailable("blocking queries disabled".into()))
        }
    }

    #[tokio::test]
    async fn failing_watches_back_off_exponentially() {
        // -- setup --
        let backend = Arc::new(BrokenWatch {
            inner: InMemoryBackend::new().connect(),
            reads: AtomicU32::new(0),
        });
        let (client, mut rx) = ActorClient::new(64);
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(500),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_attempts: 3,
            max_elapsed: None,
        };
        let watcher = LeadershipWatcher::new(
            logger.clone(),
            backend.clone(),
            key(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            RetryScheduler::new(logger, policy),
            client.weak(),
        );

        // -- execute --
        let handle = watcher.spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.stop(Duration::from_secs(1)).await);

        // -- verify --
        // Re-reads at 0, 10, 30, 70, 150, 310 and 630ms. A fixed 10ms pause would be ~100.
        let reads = backend.reads.load(Ordering::SeqCst);
        assert!(reads >= 3, "only {} reads", reads);
        assert!(reads <= 8, "{} reads in one second", reads);

        let mut interruptions = 0;
        while let Ok(event) = rx.try_recv() {
            if let Event::Watch(WatchEvent::Interrupted(_)) = event {
                interruptions += 1;
            }
        }
        // One per broken watch; stop may land between a read and its report.
        assert!(interruptions <= reads && interruptions + 1 >= reads);
    }
}
