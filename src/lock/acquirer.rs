use crate::api::{LeadershipChange, LeadershipInfoProvider};
use crate::backend::{Backend, BackendError, CasOutcome, LockKey, SessionId};
use crate::ElectionError;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AcquireOutcome {
    Acquired,
    /// The lock already has a holder, possibly our own session.
    AlreadyHeld(SessionId),
}

/// Result of one acquisition cycle, tagged so the actor can drop reports that are no longer
/// relevant (the session was replaced, or a newer attempt superseded this one).
#[derive(Debug)]
pub(crate) struct AcquireReport {
    pub session_id: SessionId,
    pub attempt: u64,
    pub result: Result<AcquireOutcome, ElectionError>,
}

/// LockAcquirer does the compare-and-set writes on the lock key. It keeps no state of its own:
/// whether we hold the lock is only ever decided by what the watcher observes.
#[derive(Clone)]
pub(crate) struct LockAcquirer {
    logger: slog::Logger,
    backend: Arc<dyn Backend>,
    key: LockKey,
    info_provider: Arc<dyn LeadershipInfoProvider>,
    operation_timeout: Duration,
}

impl LockAcquirer {
    pub(crate) fn new(
        logger: slog::Logger,
        backend: Arc<dyn Backend>,
        key: LockKey,
        info_provider: Arc<dyn LeadershipInfoProvider>,
        operation_timeout: Duration,
    ) -> Self {
        LockAcquirer {
            logger,
            backend,
            key,
            info_provider,
            operation_timeout,
        }
    }

    /// Bind the lock to `session_id` iff nobody holds it.
    pub(crate) async fn try_acquire(&self, session_id: &SessionId) -> Result<AcquireOutcome, ElectionError> {
        let value = self.lock_value(LeadershipChange::Acquire)?;
        let outcome = self
            .with_timeout("acquire lock", self.backend.cas_put_lock(&self.key, session_id, value, true))
            .await?;

        match outcome {
            CasOutcome::Applied => {
                slog::info!(self.logger, "Acquired lock {} with session {}", self.key, session_id);
                Ok(AcquireOutcome::Acquired)
            }
            CasOutcome::Conflict { holder: Some(holder) } => {
                slog::debug!(self.logger, "Lock {} is held by {}", self.key, holder);
                Ok(AcquireOutcome::AlreadyHeld(holder))
            }
            // Unheld but still refused, e.g. the backend's lock-delay after a holder was lost.
            CasOutcome::Conflict { holder: None } => Err(ElectionError::LockConflict { holder: None }),
        }
    }

    /// Clear the lock iff `session_id` holds it.
    pub(crate) async fn release(&self, session_id: &SessionId) -> Result<(), ElectionError> {
        let value = self.lock_value(LeadershipChange::Release)?;
        let outcome = self
            .with_timeout("release lock", self.backend.cas_delete_lock(&self.key, session_id, value))
            .await?;

        match outcome {
            CasOutcome::Applied => {
                slog::info!(self.logger, "Released lock {}", self.key);
                Ok(())
            }
            CasOutcome::Conflict { holder } => Err(ElectionError::LockConflict { holder }),
        }
    }

    fn lock_value(&self, change: LeadershipChange) -> Result<Bytes, ElectionError> {
        self.info_provider
            .leadership_info(change)
            .encode()
            .map_err(|e| ElectionError::NonRecoverable(format!("Failed to encode leadership info: {}", e)))
    }

    async fn with_timeout<T, F>(&self, op_name: &'static str, fut: F) -> Result<T, ElectionError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(ElectionError::from),
            Err(_) => Err(ElectionError::BackendUnavailable(format!("{} timed out", op_name))),
        }
    }
}
