use crate::actor::Event;
use crate::backend::SessionId;
use crate::lock::AcquireReport;
use crate::session::{Session, SessionEvent, SessionLossReason, SessionStatus};
use crate::watch::{LockObservation, WatchEvent};
use crate::ElectionError;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;

struct TestUtilReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Debug> TestUtilReceiver<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        TestUtilReceiver { rx }
    }

    async fn recv(&mut self) -> T {
        self.recv_with_sanity_timeout().await.expect("Expected value")
    }

    async fn recv_with_sanity_timeout(&mut self) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
    }

    async fn recv_assert_timeout(&mut self, timeout: Duration) {
        if let Ok(value) = tokio::time::timeout(timeout, self.rx.recv()).await {
            panic!("Expected timeout, got {:?}", value);
        }
    }
}

/// Stands in for the election actor in component tests: receives whatever the component under
/// test reports and asserts on it.
pub(crate) struct TestUtilActor {
    receiver: TestUtilReceiver<Event>,
    timeout: Duration,
}

impl TestUtilActor {
    pub(crate) fn new(actor_queue_rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            receiver: TestUtilReceiver::new(actor_queue_rx),
            timeout: Duration::from_millis(10),
        }
    }

    pub(crate) fn with_quiet_period(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) async fn assert_session_created(&mut self) -> Session {
        match self.receiver.recv().await {
            Event::Session(SessionEvent::Created(session)) => session,
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_session_create_failed(&mut self) -> ElectionError {
        match self.receiver.recv().await {
            Event::Session(SessionEvent::CreateFailed(error)) => error,
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_session_health(&mut self, expected_id: &SessionId, expected_status: SessionStatus) {
        match self.receiver.recv().await {
            Event::Session(SessionEvent::Health { session_id, status }) => {
                assert_eq!(&session_id, expected_id);
                assert_eq!(status, expected_status);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_session_lost(&mut self, expected_id: &SessionId) -> SessionLossReason {
        match self.receiver.recv().await {
            Event::Session(SessionEvent::Lost { session_id, reason }) => {
                assert_eq!(&session_id, expected_id);
                reason
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_acquire_report(&mut self) -> AcquireReport {
        match self.receiver.recv().await {
            Event::Acquire(report) => report,
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_lock_state_changed(&mut self, expected_holder: Option<&SessionId>) -> LockObservation {
        match self.receiver.recv().await {
            Event::Watch(WatchEvent::LockStateChanged(observation)) => {
                assert_eq!(observation.holder.as_ref(), expected_holder);
                observation
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_watch_interrupted(&mut self) -> ElectionError {
        match self.receiver.recv().await {
            Event::Watch(WatchEvent::Interrupted(error)) => error,
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    pub(crate) async fn assert_no_event(&mut self) {
        self.receiver.recv_assert_timeout(self.timeout).await;
    }
}
