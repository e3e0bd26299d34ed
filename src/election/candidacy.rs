use crate::actor::{Callback, WeakActorClient};
use crate::backend::SessionId;
use crate::election::state_machine::{Command, Delay, ElectionStateMachine};
use crate::lock::{AcquireReport, LockAcquirer};
use crate::retry::RetryScheduler;
use crate::session::{RenewalTimerHandle, SessionEvent, SessionManager};
use crate::timers::{Clock, RealClock};
use crate::watch::{LeadershipWatcher, WatchEvent, WatcherHandle};
use crate::ElectionError;
use tokio::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

pub(crate) struct CandidacyConfig {
    pub logger: slog::Logger,
    pub state_machine: ElectionStateMachine,
    pub session_manager: SessionManager,
    pub acquirer: LockAcquirer,
    pub watcher: LeadershipWatcher,
    pub retry: RetryScheduler,
    pub actor_client: WeakActorClient,
    pub operation_timeout: Duration,
}

/// Candidacy is this process's participation in one election. It feeds events to the state
/// machine and carries out the commands it gets back, which means owning every background task
/// the election runs.
pub(crate) struct Candidacy {
    logger: slog::Logger,
    state_machine: ElectionStateMachine,
    session_manager: SessionManager,
    acquirer: LockAcquirer,
    watcher: LeadershipWatcher,
    retry: RetryScheduler,
    actor_client: WeakActorClient,
    operation_timeout: Duration,

    watcher_handle: Option<WatcherHandle>,
    renewal_handle: Option<RenewalTimerHandle>,
    // Dropping a guard cancels its task, so nothing pending outlives the candidacy.
    acquire_cancel: Option<DropGuard>,
    session_create_cancel: Option<DropGuard>,
}

impl Candidacy {
    pub(crate) fn new(config: CandidacyConfig) -> Self {
        Candidacy {
            logger: config.logger,
            state_machine: config.state_machine,
            session_manager: config.session_manager,
            acquirer: config.acquirer,
            watcher: config.watcher,
            retry: config.retry,
            actor_client: config.actor_client,
            operation_timeout: config.operation_timeout,
            watcher_handle: None,
            renewal_handle: None,
            acquire_cancel: None,
            session_create_cancel: None,
        }
    }

    pub(crate) fn handle_start(&mut self) {
        let commands = self.state_machine.start();
        self.execute(commands);
    }

    /// Shutdown order: watcher, pending retries, renewal, lock, session. Each backend step is
    /// bounded by the operation timeout, so a wedged backend delays `stop()` but can't hang it.
    pub(crate) fn handle_stop(&mut self, callback: Callback<(), ElectionError>) {
        slog::debug!(self.logger, "Stop requested while {:?}", self.state_machine.status());
        let session_id = self.state_machine.stop();

        let watcher_handle = self.watcher_handle.take();
        let pending: Vec<DropGuard> = self
            .acquire_cancel
            .take()
            .into_iter()
            .chain(self.session_create_cancel.take())
            .collect();
        let renewal_handle = self.renewal_handle.take();
        let acquirer = self.acquirer.clone();
        let session_manager = self.session_manager.clone();
        let timeout = self.operation_timeout;
        let logger = self.logger.clone();

        tokio::spawn(async move {
            if let Some(watcher_handle) = watcher_handle {
                if !watcher_handle.stop(timeout).await {
                    slog::warn!(logger, "Watcher did not stop within {:?}", timeout);
                }
            }
            drop(pending);
            drop(renewal_handle);

            if let Some(session_id) = session_id {
                release_lock(&logger, &acquirer, &session_id).await;
                let _ = session_manager.stop(&session_id).await;
            }

            slog::info!(logger, "Election stopped");
            callback.send(Ok(()));
        });
    }

    pub(crate) fn handle_session_event(&mut self, event: SessionEvent) {
        let commands = match event {
            SessionEvent::Created(session) => self.state_machine.session_created(session),
            SessionEvent::CreateFailed(error) => self.state_machine.session_create_failed(error),
            SessionEvent::Health { session_id, status } => self.state_machine.session_health(&session_id, status),
            SessionEvent::Lost { session_id, reason } => self.state_machine.session_lost(&session_id, reason),
        };
        self.execute(commands);
    }

    pub(crate) fn handle_acquire_report(&mut self, report: AcquireReport) {
        let commands = self.state_machine.acquire_result(report);
        self.execute(commands);
    }

    pub(crate) fn handle_watch_event(&mut self, event: WatchEvent) {
        let commands = match event {
            WatchEvent::LockStateChanged(observation) => self.state_machine.lock_state_changed(observation),
            WatchEvent::Interrupted(error) => self.state_machine.watch_interrupted(error),
        };
        self.execute(commands);
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            slog::trace!(self.logger, "Executing {:?}", command);
            match command {
                Command::StartWatch => {
                    if self.watcher_handle.is_none() {
                        self.watcher_handle = Some(self.watcher.spawn());
                    }
                }
                Command::CreateSession { delay } => {
                    let cancel = replace_token(&mut self.session_create_cancel);
                    let delay = self.pause(delay);
                    self.session_manager.spawn_start(cancel, delay);
                }
                Command::StartRenewal(session) => {
                    self.renewal_handle = Some(self.session_manager.start_renewal(&session));
                }
                Command::StopRenewal => {
                    self.renewal_handle = None;
                }
                Command::ReleaseSession(session_id) => {
                    self.session_manager.spawn_stop(session_id);
                }
                Command::Acquire {
                    session_id,
                    attempt,
                    delay,
                } => {
                    let delay = self.pause(delay);
                    self.spawn_acquire(session_id, attempt, delay);
                }
                Command::CancelAcquire => {
                    self.acquire_cancel = None;
                }
            }
        }
    }

    fn pause(&self, delay: Delay) -> Option<Duration> {
        match delay {
            Delay::None => None,
            Delay::Short => Some(self.retry.policy().initial_interval),
            Delay::Long => Some(self.retry.policy().max_interval),
        }
    }

    fn spawn_acquire(&mut self, session_id: SessionId, attempt: u64, delay: Option<Duration>) {
        let cancel = replace_token(&mut self.acquire_cancel);
        let acquirer = self.acquirer.clone();
        let retry = self.retry.clone();
        let actor_client = self.actor_client.clone();

        tokio::spawn(async move {
            let mut clock = RealClock;
            if let Some(delay) = delay {
                if !clock.sleep_or_cancel(delay, &cancel).await {
                    return;
                }
            }

            let result = match retry.run("acquire lock", &cancel, || acquirer.try_acquire(&session_id)).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => match e.into_last_error() {
                    Some(e) => Err(e),
                    None => return,
                },
            };
            let _ = actor_client
                .acquire_report(AcquireReport {
                    session_id,
                    attempt,
                    result,
                })
                .await;
        });
    }
}

/// Put a fresh guard in `slot`. Dropping the previous one cancels whatever it guarded.
fn replace_token(slot: &mut Option<DropGuard>) -> CancellationToken {
    let cancel = CancellationToken::new();
    *slot = Some(cancel.clone().drop_guard());
    cancel
}

async fn release_lock(logger: &slog::Logger, acquirer: &LockAcquirer, session_id: &SessionId) {
    match acquirer.release(session_id).await {
        Ok(()) => {}
        // Not ours to release.
        Err(ElectionError::LockConflict { .. }) => {}
        Err(e) => slog::warn!(logger, "Failed to release lock on stop: {}", e),
    }
}
