use crate::actor::WeakActorClient;
use crate::backend::{Backend, BackendError, SessionId, SessionSpec};
use crate::retry::{RetryError, RetryScheduler};
use crate::session::renewal_timer::RenewalTimerHandle;
use crate::session::{Session, SessionEvent};
use crate::timers::{Clock, RealClock};
use crate::ElectionError;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug)]
pub(crate) struct RenewalConfig {
    pub ttl: Duration,
    pub interval: Duration,
    pub failure_threshold: u32,
    pub operation_timeout: Duration,
}

/// SessionManager owns the lifecycle of this process's backend session: create it, keep it
/// renewed, and release it on the way out.
#[derive(Clone)]
pub(crate) struct SessionManager<C: Clock = RealClock> {
    logger: slog::Logger,
    backend: Arc<dyn Backend>,
    spec: SessionSpec,
    renewal: RenewalConfig,
    retry: RetryScheduler<C>,
    actor_client: WeakActorClient,
    clock: C,
}

impl SessionManager {
    pub(crate) fn new(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        spec: SessionSpec,
        renewal: RenewalConfig,
        retry: RetryScheduler,
        actor_client: WeakActorClient,
    ) -> Self {
        Self::with_clock(logger, backend, spec, renewal, retry, actor_client, RealClock)
    }

    /// Keep the session alive until the returned handle is dropped.
    pub(crate) fn start_renewal(&self, session: &Session) -> RenewalTimerHandle {
        RenewalTimerHandle::spawn_timer_task(
            self.logger.clone(),
            self.backend.clone(),
            session,
            self.renewal,
            self.actor_client.clone(),
        )
    }
}

impl<C: Clock> SessionManager<C> {
    pub(crate) fn with_clock(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        spec: SessionSpec,
        renewal: RenewalConfig,
        retry: RetryScheduler<C>,
        actor_client: WeakActorClient,
        clock: C,
    ) -> Self {
        SessionManager {
            logger,
            backend,
            spec,
            renewal,
            retry,
            actor_client,
            clock,
        }
    }

    /// Create a session, retrying transient failures. An exhausted cycle returns the last
    /// backend error.
    pub(crate) async fn start(&self, cancel: &CancellationToken) -> Result<Session, RetryError<BackendError>> {
        let session = self.retry.run("create session", cancel, || self.create_once()).await?;
        slog::info!(self.logger, "Created session {}", session.id);

        Ok(session)
    }

    async fn create_once(&self) -> Result<Session, BackendError> {
        let issued_at = self.clock.now();
        let id = tokio::time::timeout(self.renewal.operation_timeout, self.backend.create_session(self.spec.clone()))
            .await
            .map_err(|_| BackendError::Unavailable("create session timed out".into()))??;

        Ok(Session { id, issued_at })
    }

    /// Run `start()` in the background and report the result to the actor. A cancelled attempt
    /// reports nothing. `delay` postpones the first attempt.
    pub(crate) fn spawn_start(&self, cancel: CancellationToken, delay: Option<Duration>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                let mut clock = manager.clock.clone();
                if !clock.sleep_or_cancel(delay, &cancel).await {
                    return;
                }
            }

            let event = match manager.start(&cancel).await {
                Ok(session) => SessionEvent::Created(session),
                Err(e) => match e.into_last_error() {
                    Some(e) => SessionEvent::CreateFailed(ElectionError::from(e)),
                    None => return,
                },
            };
            let _ = manager.actor_client.session_event(event).await;
        });
    }

    /// Destroy the session. A single attempt bounded by the operation timeout: once we're
    /// giving a session up, the backend's TTL is the fallback.
    pub(crate) async fn stop(&self, session_id: &SessionId) -> Result<(), ElectionError> {
        let result = tokio::time::timeout(self.renewal.operation_timeout, self.backend.release_session(session_id))
            .await
            .map_err(|_| ElectionError::BackendUnavailable("release session timed out".into()))
            .and_then(|r| r.map_err(ElectionError::from));

        match &result {
            Ok(()) => slog::info!(self.logger, "Released session {}", session_id),
            Err(e) => slog::warn!(
                self.logger,
                "Failed to release session {}, it will expire after its TTL: {}",
                session_id,
                e
            ),
        }

        result
    }

    pub(crate) fn spawn_stop(&self, session_id: SessionId) {
        let manager = self.clone();
        tokio::spawn(async move {
            let _ = manager.stop(&session_id).await;
        });
    }
}
