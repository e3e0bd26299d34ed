use crate::api::error::ConfigurationError;
use crate::backend::{LockKey, SessionBehavior};
use crate::retry::RetryPolicy;
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunables for one election. Every field is optional; see `ElectionOptionsValidated` for the
/// defaults and the rules they're checked against.
#[derive(Clone, Debug, Default)]
pub struct ElectionOptions {
    /// Used to derive the default lock key, `leadership/<service_name>`.
    pub service_name: Option<String>,
    pub lock_key: Option<String>,

    pub session_ttl: Option<Duration>,
    pub session_renewal_interval: Option<Duration>,
    /// Consecutive failed renewals after which the session is considered lost.
    pub session_renewal_failure_threshold: Option<u32>,
    pub session_lock_delay: Option<Duration>,
    pub session_behavior: Option<SessionBehavior>,

    /// Upper bound of one blocking watch query.
    pub watch_timeout: Option<Duration>,
    /// Upper bound of any other single backend call, and of each shutdown step.
    pub operation_timeout: Option<Duration>,

    pub retry_initial_interval: Option<Duration>,
    pub retry_max_interval: Option<Duration>,
    pub retry_max_attempts: Option<u32>,
    pub retry_max_elapsed: Option<Duration>,
    pub retry_jitter: Option<f64>,

    pub hostname: Option<String>,
    pub cluster_name: Option<String>,
}

pub(crate) struct ElectionOptionsValidated {
    pub lock_key: LockKey,
    pub session_ttl: Duration,
    pub session_renewal_interval: Duration,
    pub session_renewal_failure_threshold: u32,
    pub session_lock_delay: Duration,
    pub session_behavior: SessionBehavior,
    pub watch_timeout: Duration,
    pub operation_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub hostname: String,
    pub cluster_name: String,
}

impl ElectionOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.lock_key.as_str().trim().is_empty() {
            return Err("Lock key must not be blank");
        }
        if self.session_ttl == Duration::from_secs(0) {
            return Err("Session TTL must be positive");
        }
        if self.session_renewal_interval == Duration::from_secs(0) {
            return Err("Session renewal interval must be positive");
        }
        if self.session_renewal_interval >= self.session_ttl {
            return Err("Session renewal interval must be shorter than the session TTL");
        }
        if self.session_renewal_failure_threshold == 0 {
            return Err("Session renewal failure threshold must be at least 1");
        }
        if self.operation_timeout == Duration::from_secs(0) {
            return Err("Operation timeout must be positive");
        }
        if self.operation_timeout > self.session_renewal_interval {
            return Err("Operation timeout must not exceed the session renewal interval");
        }
        if self.watch_timeout == Duration::from_secs(0) {
            return Err("Watch timeout must be positive");
        }
        if self.retry_policy.initial_interval == Duration::from_secs(0) {
            return Err("Retry initial interval must be positive");
        }
        if self.retry_policy.initial_interval > self.retry_policy.max_interval {
            return Err("Retry initial interval must not exceed the retry max interval");
        }
        if self.retry_policy.max_attempts == 0 {
            return Err("Retry max attempts must be at least 1");
        }
        if !(0.0..1.0).contains(&self.retry_policy.randomization_factor) {
            return Err("Retry jitter must be in [0, 1)");
        }

        Ok(())
    }
}

impl TryFrom<ElectionOptions> for ElectionOptionsValidated {
    type Error = ConfigurationError;

    fn try_from(options: ElectionOptions) -> Result<Self, Self::Error> {
        let lock_key = match (options.lock_key, options.service_name) {
            (Some(key), _) => LockKey::new(key),
            (None, Some(service_name)) => LockKey::new(format!("leadership/{}", service_name)),
            (None, None) => {
                return Err(ConfigurationError::new(
                    "Either a lock key or a service name is required",
                ))
            }
        };

        let values = ElectionOptionsValidated {
            lock_key,
            session_ttl: options.session_ttl.unwrap_or(Duration::from_secs(15)),
            session_renewal_interval: options.session_renewal_interval.unwrap_or(Duration::from_secs(5)),
            session_renewal_failure_threshold: options.session_renewal_failure_threshold.unwrap_or(3),
            session_lock_delay: options.session_lock_delay.unwrap_or(Duration::from_secs(5)),
            session_behavior: options.session_behavior.unwrap_or(SessionBehavior::Release),
            watch_timeout: options.watch_timeout.unwrap_or(Duration::from_secs(30)),
            operation_timeout: options.operation_timeout.unwrap_or(Duration::from_millis(3000)),
            retry_policy: RetryPolicy {
                initial_interval: options.retry_initial_interval.unwrap_or(Duration::from_millis(500)),
                max_interval: options.retry_max_interval.unwrap_or(Duration::from_secs(10)),
                multiplier: 2.0,
                randomization_factor: options.retry_jitter.unwrap_or(0.5),
                max_attempts: options.retry_max_attempts.unwrap_or(5),
                max_elapsed: Some(options.retry_max_elapsed.unwrap_or(Duration::from_secs(30))),
            },
            hostname: options
                .hostname
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "n/a".to_string()),
            cluster_name: options.cluster_name.unwrap_or_default(),
        };

        values.validate().map_err(ConfigurationError::new)?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> ElectionOptions {
        ElectionOptions {
            service_name: Some(name.into()),
            ..ElectionOptions::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        let validated = ElectionOptionsValidated::try_from(service("scheduler")).unwrap();

        assert_eq!(validated.lock_key, LockKey::new("leadership/scheduler"));
        assert_eq!(validated.session_ttl, Duration::from_secs(15));
        assert_eq!(validated.session_renewal_interval, Duration::from_secs(5));
        assert_eq!(validated.session_renewal_failure_threshold, 3);
        assert_eq!(validated.session_behavior, SessionBehavior::Release);
        assert_eq!(validated.retry_policy.max_attempts, 5);
    }

    #[test]
    fn explicit_lock_key_wins_over_service_name() {
        let options = ElectionOptions {
            lock_key: Some("locks/cache-warmer".into()),
            ..service("ignored")
        };

        let validated = ElectionOptionsValidated::try_from(options).unwrap();

        assert_eq!(validated.lock_key, LockKey::new("locks/cache-warmer"));
    }

    #[test]
    fn missing_key_and_service_is_rejected() {
        assert!(ElectionOptionsValidated::try_from(ElectionOptions::default()).is_err());
    }

    #[test]
    fn renewal_interval_must_be_shorter_than_ttl() {
        let options = ElectionOptions {
            session_ttl: Some(Duration::from_secs(10)),
            session_renewal_interval: Some(Duration::from_secs(10)),
            ..service("scheduler")
        };

        let err = ElectionOptionsValidated::try_from(options).err().unwrap();

        assert!(err.to_string().contains("renewal interval"));
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let options = ElectionOptions {
            session_renewal_failure_threshold: Some(0),
            ..service("scheduler")
        };

        assert!(ElectionOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn operation_timeout_must_fit_renewal_interval() {
        let options = ElectionOptions {
            session_renewal_interval: Some(Duration::from_secs(2)),
            operation_timeout: Some(Duration::from_secs(3)),
            ..service("scheduler")
        };

        assert!(ElectionOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn retry_bounds_are_checked() {
        let inverted = ElectionOptions {
            retry_initial_interval: Some(Duration::from_secs(20)),
            retry_max_interval: Some(Duration::from_secs(1)),
            ..service("scheduler")
        };
        let bad_jitter = ElectionOptions {
            retry_jitter: Some(1.5),
            ..service("scheduler")
        };

        assert!(ElectionOptionsValidated::try_from(inverted).is_err());
        assert!(ElectionOptionsValidated::try_from(bad_jitter).is_err());
    }
}
