use bytes::Bytes;
use leadership::{
    Backend, BackendError, CasOutcome, ElectionConfig, ElectionOptions, ElectionStatus, InMemoryBackend,
    InMemoryConnection, LeaderElection, LeadershipListener, ListenerError, LockKey, LockRecord, RenewOutcome,
    SessionId, SessionSpec, WatchOutcome,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

const SERVICE: &str = "integration";

/// Tracks how many instances believe they're leader right now, across the whole test.
#[derive(Default)]
struct LeaderGauge {
    current: AtomicI64,
    max: AtomicI64,
}

impl LeaderGauge {
    fn max(&self) -> i64 {
        self.max.load(Ordering::SeqCst)
    }
}

struct InstanceListener {
    gauge: Arc<LeaderGauge>,
    elected: AtomicU32,
    revoked: AtomicU32,
}

impl LeadershipListener for InstanceListener {
    fn on_elected(&self) -> Result<(), ListenerError> {
        self.elected.fetch_add(1, Ordering::SeqCst);
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.max.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    fn on_revoked(&self) -> Result<(), ListenerError> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Instance {
    election: LeaderElection,
    connection: InMemoryConnection,
    listener: Arc<InstanceListener>,
}

impl Instance {
    fn status(&self) -> ElectionStatus {
        self.election.status().status
    }

    fn elected(&self) -> u32 {
        self.listener.elected.load(Ordering::SeqCst)
    }

    fn revoked(&self) -> u32 {
        self.listener.revoked.load(Ordering::SeqCst)
    }
}

fn options(hostname: &str) -> ElectionOptions {
    ElectionOptions {
        service_name: Some(SERVICE.into()),
        session_ttl: Some(Duration::from_millis(300)),
        session_renewal_interval: Some(Duration::from_millis(100)),
        session_renewal_failure_threshold: Some(3),
        session_lock_delay: Some(Duration::from_millis(0)),
        watch_timeout: Some(Duration::from_millis(200)),
        operation_timeout: Some(Duration::from_millis(50)),
        retry_initial_interval: Some(Duration::from_millis(10)),
        retry_max_interval: Some(Duration::from_millis(50)),
        retry_max_attempts: Some(3),
        retry_max_elapsed: Some(Duration::from_millis(500)),
        hostname: Some(hostname.into()),
        cluster_name: Some("test".into()),
        ..ElectionOptions::default()
    }
}

async fn instance(backend: &InMemoryBackend, gauge: &Arc<LeaderGauge>, hostname: &str) -> Instance {
    instance_with(backend, gauge, options(hostname)).await
}

async fn instance_with(
    backend: &InMemoryBackend,
    gauge: &Arc<LeaderGauge>,
    options: ElectionOptions,
) -> Instance {
    let connection = backend.connect();
    let listener = Arc::new(InstanceListener {
        gauge: gauge.clone(),
        elected: AtomicU32::new(0),
        revoked: AtomicU32::new(0),
    });
    let election = leadership::try_create_election(ElectionConfig {
        backend: Arc::new(connection.clone()),
        info_logger: test_logger(),
        options,
        listeners: vec![listener.clone()],
        info_provider: None,
    })
    .await
    .unwrap_or_else(|e| panic!("failed to create election: {}", e));

    Instance {
        election,
        connection,
        listener,
    }
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    condition()
}

/// Passes calls through to an in-memory connection until wedged. After that, no call returns.
struct WedgeableBackend {
    inner: InMemoryConnection,
    wedged: AtomicBool,
}

impl WedgeableBackend {
    async fn gate(&self) {
        if self.wedged.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait::async_trait]
impl Backend for WedgeableBackend {
    async fn create_session(&self, spec: SessionSpec) -> Result<SessionId, BackendError> {
        self.gate().await;
        self.inner.create_session(spec).await
    }

    async fn renew_session(&self, session_id: &SessionId) -> Result<RenewOutcome, BackendError> {
        self.gate().await;
        self.inner.renew_session(session_id).await
    }

    async fn release_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.gate().await;
        self.inner.release_session(session_id).await
    }

    async fn cas_put_lock(
        &self,
        key: &LockKey,
        session_id: &SessionId,
        value: Bytes,
        expect_empty: bool,
    ) -> Result<CasOutcome, BackendError> {
        self.gate().await;
        self.inner.cas_put_lock(key, session_id, value, expect_empty).await
    }

    async fn cas_delete_lock(
        &self,
        key: &LockKey,
        session_id: &SessionId,
        value: Bytes,
    ) -> Result<CasOutcome, BackendError> {
        self.gate().await;
        self.inner.cas_delete_lock(key, session_id, value).await
    }

    async fn read_lock(&self, key: &LockKey) -> Result<LockRecord, BackendError> {
        self.gate().await;
        self.inner.read_lock(key).await
    }

    async fn watch_lock(
        &self,
        key: &LockKey,
        since_index: u64,
        timeout: Duration,
    ) -> Result<WatchOutcome, BackendError> {
        self.gate().await;
        self.inner.watch_lock(key, since_index, timeout).await
    }
}

fn leaders(instances: &[Instance]) -> Vec<usize> {
    instances
        .iter()
        .enumerate()
        .filter(|(_, instance)| instance.status() == ElectionStatus::Leader)
        .map(|(i, _)| i)
        .collect()
}

fn lock_key() -> LockKey {
    LockKey::new(format!("leadership/{}", SERVICE))
}

#[tokio::test]
async fn single_candidate_is_elected_exactly_once() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let a = instance(&backend, &gauge, "host-a").await;

    a.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.election.is_leader()).await);

    // Several renewal cycles later, still exactly one election.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(a.election.is_leader());
    assert_eq!(a.elected(), 1);
    assert_eq!(a.revoked(), 0);

    let snapshot = a.election.status();
    let leader = snapshot.leader.unwrap();
    assert_eq!(Some(&leader.session_id), snapshot.session_id.as_ref());
    assert_eq!(backend.holder(&lock_key()), Some(leader.session_id));
    assert_eq!(leader.info.unwrap().hostname.as_deref(), Some("host-a"));

    a.election.stop().await.unwrap();
}

#[tokio::test]
async fn second_candidate_follows_until_lock_is_released() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let a = instance(&backend, &gauge, "host-a").await;
    let b = instance(&backend, &gauge, "host-b").await;

    a.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.election.is_leader()).await);
    let a_session = a.election.status().session_id.unwrap();

    b.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.status() == ElectionStatus::Follower).await);
    let seen_by_b = b.election.status().leader.unwrap();
    assert_eq!(seen_by_b.session_id, a_session);
    assert_eq!(seen_by_b.info.unwrap().hostname.as_deref(), Some("host-a"));

    a.election.stop().await.unwrap();
    assert_eq!(a.revoked(), 1);
    assert!(wait_until(Duration::from_secs(2), || b.election.is_leader()).await);
    assert_eq!(gauge.max(), 1);

    b.election.stop().await.unwrap();
}

#[tokio::test]
async fn partitioned_leader_is_revoked_and_another_takes_over() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let instances = vec![
        instance(&backend, &gauge, "host-a").await,
        instance(&backend, &gauge, "host-b").await,
    ];
    for instance in &instances {
        instance.election.start().await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || leaders(&instances).len() == 1).await);
    let old = leaders(&instances)[0];
    let other = 1 - old;

    instances[old].connection.set_reachable(false);

    assert!(wait_until(Duration::from_secs(2), || instances[old].revoked() == 1).await);
    assert_ne!(instances[old].status(), ElectionStatus::Leader);
    assert!(wait_until(Duration::from_secs(3), || instances[other].election.is_leader()).await);
    assert_eq!(instances[old].elected(), 1);
    assert_eq!(gauge.max(), 1);

    // Healing puts the old leader back in line as a follower.
    instances[old].connection.set_reachable(true);
    assert!(wait_until(Duration::from_secs(3), || instances[old].status() == ElectionStatus::Follower).await);
    assert!(instances[other].election.is_leader());

    for instance in &instances {
        instance.election.stop().await.unwrap();
    }
}

#[tokio::test]
async fn watch_timeouts_do_not_produce_events() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let a = instance(&backend, &gauge, "host-a").await;
    let b = instance_with(
        &backend,
        &gauge,
        ElectionOptions {
            watch_timeout: Some(Duration::from_millis(30)),
            ..options("host-b")
        },
    )
    .await;

    a.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.election.is_leader()).await);
    b.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.status() == ElectionStatus::Follower).await);

    let mut events = b.election.event_listener();
    let next = tokio::time::timeout(Duration::from_millis(300), events.next()).await;
    assert!(next.is_err(), "unexpected event: {:?}", next);
    assert_eq!(b.status(), ElectionStatus::Follower);

    a.election.stop().await.unwrap();
    b.election.stop().await.unwrap();
}

#[tokio::test]
async fn invalidated_leader_is_replaced() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let instances = vec![
        instance(&backend, &gauge, "host-a").await,
        instance(&backend, &gauge, "host-b").await,
        instance(&backend, &gauge, "host-c").await,
    ];
    for instance in &instances {
        instance.election.start().await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || leaders(&instances).len() == 1).await);
    let old = leaders(&instances)[0];
    let old_session = instances[old].election.status().session_id.unwrap();

    backend.invalidate_session(&old_session);

    assert!(wait_until(Duration::from_secs(3), || {
        backend
            .holder(&lock_key())
            .map_or(false, |holder| holder != old_session)
            && leaders(&instances).len() == 1
    })
    .await);
    assert_eq!(instances[old].revoked(), 1);
    assert_eq!(gauge.max(), 1);

    for instance in &instances {
        instance.election.stop().await.unwrap();
    }
}

#[tokio::test]
async fn stop_is_idempotent_and_election_can_restart() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let a = instance(&backend, &gauge, "host-a").await;

    a.election.start().await.unwrap();
    a.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.election.is_leader()).await);

    a.election.stop().await.unwrap();
    a.election.stop().await.unwrap();
    assert_eq!(a.status(), ElectionStatus::Candidate);
    assert_eq!(backend.holder(&lock_key()), None);
    assert!(wait_until(Duration::from_secs(1), || backend.live_sessions() == 0).await);

    a.election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.election.is_leader()).await);
    assert_eq!(a.elected(), 2);
    assert_eq!(a.revoked(), 1);

    a.election.stop().await.unwrap();
}

#[tokio::test]
async fn stop_returns_promptly_when_backend_hangs() {
    // -- setup --
    let backend = InMemoryBackend::new();
    let wedgeable = Arc::new(WedgeableBackend {
        inner: backend.connect(),
        wedged: AtomicBool::new(false),
    });
    let gauge = Arc::new(LeaderGauge::default());
    let listener = Arc::new(InstanceListener {
        gauge: gauge.clone(),
        elected: AtomicU32::new(0),
        revoked: AtomicU32::new(0),
    });
    let options = options("host-a");
    let operation_timeout = options.operation_timeout.unwrap();
    let election = leadership::try_create_election(ElectionConfig {
        backend: wedgeable.clone(),
        info_logger: test_logger(),
        options,
        listeners: vec![listener.clone()],
        info_provider: None,
    })
    .await
    .unwrap_or_else(|e| panic!("failed to create election: {}", e));

    election.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || election.is_leader()).await);

    // -- execute --
    wedgeable.wedged.store(true, Ordering::SeqCst);
    let stopped = tokio::time::timeout(operation_timeout * 10, election.stop()).await;

    // -- verify --
    // Watcher, lock release and session release each get at most one operation timeout.
    assert!(stopped.is_ok(), "stop() still running after {:?}", operation_timeout * 10);
    assert!(!election.is_leader());
    assert_eq!(listener.revoked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn never_more_than_one_leader_under_random_partitions() {
    let backend = InMemoryBackend::new();
    let gauge = Arc::new(LeaderGauge::default());
    let mut instances = Vec::new();
    for i in 0..5 {
        instances.push(instance(&backend, &gauge, &format!("host-{}", i)).await);
    }
    for instance in &instances {
        instance.election.start().await.unwrap();
    }

    let mut rng = rand::thread_rng();
    let deadline = Instant::now() + Duration::from_secs(4);
    while Instant::now() < deadline {
        for instance in &instances {
            // Mostly reachable, so leadership actually changes hands now and then.
            instance.connection.set_reachable(rng.gen_bool(0.8));
        }
        for _ in 0..10 {
            assert!(leaders(&instances).len() <= 1);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    }
    assert!(gauge.max() <= 1);

    for instance in &instances {
        instance.connection.set_reachable(true);
    }
    assert!(wait_until(Duration::from_secs(3), || leaders(&instances).len() == 1).await);
    assert!(gauge.max() <= 1);

    for instance in &instances {
        instance.election.stop().await.unwrap();
    }
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
