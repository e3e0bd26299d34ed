use crate::backend::BackendError;
use crate::timers::{Clock, RealClock};
use crate::ElectionError;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Debug;
use std::future::Future;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounds for one retry cycle. A cycle ends at the first success, the first permanent error,
/// `max_attempts` attempts, or `max_elapsed` wall time, whichever comes first.
#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Jitter, as a fraction of the current interval. 0.5 means +/-50%.
    pub randomization_factor: f64,
    pub max_attempts: u32,
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub(crate) fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(self.max_elapsed)
            .build()
    }
}

pub(crate) trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        BackendError::is_transient(self)
    }
}

impl Transient for ElectionError {
    fn is_transient(&self) -> bool {
        ElectionError::is_transient(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RetryError<E: std::error::Error + 'static> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("Permanent failure: {0}")]
    Permanent(E),

    #[error("Retry cancelled")]
    Cancelled,
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The error that ended the cycle, if it didn't end by cancellation.
    pub(crate) fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// RetryScheduler wraps a fallible backend operation with bounded exponential backoff plus
/// jitter. It never retries forever: on exhaustion the last error goes back to the caller, who
/// decides what that means for the election.
#[derive(Clone)]
pub(crate) struct RetryScheduler<C: Clock = RealClock> {
    logger: slog::Logger,
    policy: RetryPolicy,
    clock: C,
}

impl RetryScheduler {
    pub(crate) fn new(logger: slog::Logger, policy: RetryPolicy) -> Self {
        Self::with_clock(logger, policy, RealClock)
    }
}

impl<C: Clock> RetryScheduler<C> {
    pub(crate) fn with_clock(logger: slog::Logger, policy: RetryPolicy, clock: C) -> Self {
        RetryScheduler { logger, policy, clock }
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds or the cycle ends. Cancelling `cancel` aborts both an in-flight
    /// attempt and a pending backoff sleep.
    pub(crate) async fn run<T, E, F, Fut>(
        &self,
        op_name: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Transient + 'static,
    {
        let mut backoff = self.policy.new_backoff();
        let mut clock = self.clock.clone();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempts += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempts > 1 {
                        slog::info!(self.logger, "{} succeeded after {} attempts", op_name, attempts);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                slog::warn!(self.logger, "{} failed permanently: {}", op_name, err);
                return Err(RetryError::Permanent(err));
            }

            let next_delay = if attempts >= self.policy.max_attempts {
                None
            } else {
                backoff.next_backoff()
            };

            match next_delay {
                Some(delay) => {
                    slog::warn!(
                        self.logger,
                        "{} failed ({}/{}), retrying in {:?}: {}",
                        op_name,
                        attempts,
                        self.policy.max_attempts,
                        delay,
                        err
                    );
                    if !clock.sleep_or_cancel(delay, cancel).await {
                        return Err(RetryError::Cancelled);
                    }
                }
                None => {
                    slog::warn!(self.logger, "{} gave up after {} attempts: {}", op_name, attempts, err);
                    return Err(RetryError::Exhausted { attempts, last: err });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_millis(400),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_attempts: 4,
        max_elapsed: None,
    }
}
