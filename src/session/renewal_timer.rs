use crate::actor::WeakActorClient;
use crate::backend::{Backend, BackendError, RenewOutcome, SessionId};
use crate::session::manager::RenewalConfig;
use crate::session::{Session, SessionEvent, SessionLossReason, SessionStatus};
use crate::timers::{Clock, RealClock};
use std::cmp;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

/// The local deadline lapses this share of the TTL ahead of the backend's expiry.
const LOCAL_DEADLINE_MARGIN_DIVISOR: u32 = 10;

/// Renews a session every `interval` until the handle is dropped. Once dropped, the task exits
/// without touching the backend or reporting again.
pub(crate) struct RenewalTimerHandle {
    _cancel: DropGuard,
}

struct RenewalTimerTask<C: Clock> {
    logger: slog::Logger,
    backend: Arc<dyn Backend>,
    session_id: SessionId,
    config: RenewalConfig,
    // Send time of the last renewal the backend acknowledged. The backend's TTL restarted no
    // earlier than this, so `last_renewed_at + local_ttl()` ends before the backend's expiry.
    last_renewed_at: Instant,
    // Fixed cadence from the task's creation, so slow renewals don't stretch the schedule.
    next_tick: Instant,
    cancel: CancellationToken,
    actor_client: WeakActorClient,
    clock: C,
}

impl RenewalTimerHandle {
    pub(crate) fn spawn_timer_task(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        session: &Session,
        config: RenewalConfig,
        actor_client: WeakActorClient,
    ) -> Self {
        // Add minimal logic in this constructor, as it is untested.
        let (task, handle) = RenewalTimerTask::new(logger, backend, session, config, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

enum Tick {
    Renewed,
    Failed(BackendError),
    Invalid,
}

impl<C: Clock> RenewalTimerTask<C> {
    fn new(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        session: &Session,
        config: RenewalConfig,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, RenewalTimerHandle) {
        let cancel = CancellationToken::new();
        let task = RenewalTimerTask {
            logger: logger.new(slog::o!("session" => session.id.to_string())),
            backend,
            session_id: session.id.clone(),
            config,
            last_renewed_at: session.issued_at,
            next_tick: clock.now() + config.interval,
            cancel: cancel.clone(),
            actor_client,
            clock,
        };

        (
            task,
            RenewalTimerHandle {
                _cancel: cancel.drop_guard(),
            },
        )
    }

    fn local_ttl(&self) -> Duration {
        self.config.ttl - self.config.ttl / LOCAL_DEADLINE_MARGIN_DIVISOR
    }

    async fn run(mut self) {
        let mut consecutive_failures: u32 = 0;
        let mut reported = SessionStatus::Active;

        loop {
            let deadline = self.last_renewed_at + self.local_ttl();
            let wake_time = cmp::min(self.next_tick, deadline);
            let mut clock = self.clock.clone();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = clock.sleep_until(wake_time) => {}
            }
            if self.clock.now() >= deadline {
                slog::warn!(
                    self.logger,
                    "No acknowledged renewal within {:?} of TTL {:?}",
                    self.local_ttl(),
                    self.config.ttl
                );
                self.report_lost(SessionLossReason::Expired).await;
                return;
            }

            let sent_at = self.clock.now();
            self.next_tick = cmp::max(self.next_tick + self.config.interval, sent_at);
            let tick = self.renew_once(deadline).await;
            if self.cancel.is_cancelled() {
                return;
            }

            match tick {
                Tick::Renewed => {
                    consecutive_failures = 0;
                    self.last_renewed_at = sent_at;
                    if reported != SessionStatus::Active {
                        slog::info!(self.logger, "Session renewal recovered");
                        reported = SessionStatus::Active;
                        if self.report_health(reported).await.is_err() {
                            return;
                        }
                    }
                }
                Tick::Invalid => {
                    slog::warn!(self.logger, "Backend no longer knows the session");
                    self.report_lost(SessionLossReason::Invalidated).await;
                    return;
                }
                Tick::Failed(e) => {
                    consecutive_failures += 1;
                    slog::warn!(
                        self.logger,
                        "Session renewal failed ({}/{}): {}",
                        consecutive_failures,
                        self.config.failure_threshold,
                        e
                    );
                    if consecutive_failures >= self.config.failure_threshold {
                        self.report_lost(SessionLossReason::RenewalFailures(consecutive_failures))
                            .await;
                        return;
                    }
                    if reported == SessionStatus::Active {
                        reported = SessionStatus::Expiring;
                        if self.report_health(reported).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One renewal, bounded by the operation timeout and by the local deadline. A renewal still in
    /// flight at the deadline can't be trusted to have landed in time.
    async fn renew_once(&self, deadline: Instant) -> Tick {
        let mut clock = self.clock.clone();
        let renew = tokio::time::timeout(self.config.operation_timeout, self.backend.renew_session(&self.session_id));
        tokio::select! {
            result = renew => match result {
                Ok(Ok(RenewOutcome::Renewed)) => Tick::Renewed,
                Ok(Ok(RenewOutcome::Invalid)) | Ok(Err(BackendError::InvalidSession(_))) => Tick::Invalid,
                Ok(Err(e)) => Tick::Failed(e),
                Err(_) => Tick::Failed(BackendError::Unavailable("renew session timed out".into())),
            },
            _ = clock.sleep_until(deadline) => {
                Tick::Failed(BackendError::Unavailable("renew session still pending at local deadline".into()))
            }
        }
    }

    async fn report_health(&self, status: SessionStatus) -> Result<(), crate::actor::ActorExited> {
        self.actor_client
            .session_event(SessionEvent::Health {
                session_id: self.session_id.clone(),
                status,
            })
            .await
    }

    async fn report_lost(&self, reason: SessionLossReason) {
        let _ = self
            .actor_client
            .session_event(SessionEvent::Lost {
                session_id: self.session_id.clone(),
                reason,
            })
            .await;
    }
}
