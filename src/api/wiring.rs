use crate::actor::{ActorClient, CandidacyActor};
use crate::api::election::LeaderElection;
use crate::api::error::ConfigurationError;
use crate::api::info::{DefaultLeadershipInfoProvider, LeadershipInfoProvider};
use crate::api::listener::LeadershipListener;
use crate::api::options::{ElectionOptions, ElectionOptionsValidated};
use crate::backend::{Backend, SessionSpec};
use crate::election::{self, Candidacy, CandidacyConfig, ElectionStateMachine, ListenerNotifier};
use crate::lock::LockAcquirer;
use crate::retry::RetryScheduler;
use crate::session::{RenewalConfig, SessionManager};
use crate::watch::LeadershipWatcher;
use std::convert::TryFrom;
use std::sync::Arc;

pub struct ElectionConfig {
    pub backend: Arc<dyn Backend>,
    pub info_logger: slog::Logger,
    pub options: ElectionOptions,
    /// Notified in registration order on every leadership transition.
    pub listeners: Vec<Arc<dyn LeadershipListener>>,
    /// Defaults to host name, cluster name and a timestamp.
    pub info_provider: Option<Arc<dyn LeadershipInfoProvider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionCreationError {
    #[error("Illegal options for configuring election: {0}")]
    IllegalOptions(#[from] ConfigurationError),
}

/// Validate the options and spawn the election task. The election stays idle until
/// `LeaderElection::start()`.
pub async fn try_create_election(config: ElectionConfig) -> Result<LeaderElection, ElectionCreationError> {
    let options = ElectionOptionsValidated::try_from(config.options)?;
    let root_logger = config.info_logger.new(slog::o!("LockKey" => options.lock_key.to_string()));
    let backend = config.backend;

    let (actor_client, actor_queue_rx) = ActorClient::new(32);

    let info_provider: Arc<dyn LeadershipInfoProvider> = match config.info_provider {
        Some(info_provider) => info_provider,
        None => Arc::new(DefaultLeadershipInfoProvider::new(
            options.hostname.clone(),
            options.cluster_name.clone(),
        )),
    };

    let retry = RetryScheduler::new(root_logger.new(slog::o!("Component" => "Retry")), options.retry_policy.clone());

    let session_manager = SessionManager::new(
        root_logger.new(slog::o!("Component" => "Session")),
        backend.clone(),
        SessionSpec {
            name: options.hostname.clone(),
            ttl: options.session_ttl,
            lock_delay: options.session_lock_delay,
            behavior: options.session_behavior,
        },
        RenewalConfig {
            ttl: options.session_ttl,
            interval: options.session_renewal_interval,
            failure_threshold: options.session_renewal_failure_threshold,
            operation_timeout: options.operation_timeout,
        },
        retry.clone(),
        actor_client.weak(),
    );

    let acquirer = LockAcquirer::new(
        root_logger.new(slog::o!("Component" => "Acquirer")),
        backend.clone(),
        options.lock_key.clone(),
        info_provider,
        options.operation_timeout,
    );

    let watcher = LeadershipWatcher::new(
        root_logger.new(slog::o!("Component" => "Watcher")),
        backend,
        options.lock_key.clone(),
        options.watch_timeout,
        options.operation_timeout,
        retry.clone(),
        actor_client.weak(),
    );

    let (state_change_notifier, state_change_listener) = election::state_change_listener();
    let state_machine = ElectionStateMachine::new(
        root_logger.new(slog::o!("Component" => "StateMachine")),
        state_change_notifier,
        ListenerNotifier::new(root_logger.clone(), config.listeners),
    );

    let candidacy = Candidacy::new(CandidacyConfig {
        logger: root_logger.clone(),
        state_machine,
        session_manager,
        acquirer,
        watcher,
        retry,
        actor_client: actor_client.weak(),
        operation_timeout: options.operation_timeout,
    });

    let candidacy_actor = CandidacyActor::new(root_logger, actor_queue_rx, candidacy);
    tokio::spawn(candidacy_actor.run_event_loop());

    Ok(LeaderElection::new(actor_client, state_change_listener))
}
