use crate::api::LeadershipInfo;
use crate::backend::SessionId;
use crate::election::listeners::ListenerNotifier;
use crate::election::state_change_listener::{
    ElectionSnapshot, ElectionStateChangeNotifier, ElectionStatus, LeaderDescriptor,
};
use crate::lock::{AcquireOutcome, AcquireReport};
use crate::session::{Session, SessionLossReason, SessionStatus};
use crate::watch::LockObservation;
use crate::ElectionError;

/// Pause before a command's first backend call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Delay {
    None,
    /// The retry policy's initial interval.
    Short,
    /// The retry policy's max interval. Used after a failed cycle or a rejected request.
    Long,
}

/// Side effects the state machine asks for. It never talks to the backend itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    StartWatch,
    CreateSession { delay: Delay },
    StartRenewal(Session),
    StopRenewal,
    /// Best-effort release of a session we've given up on.
    ReleaseSession(SessionId),
    /// Supersedes any acquisition still in flight.
    Acquire {
        session_id: SessionId,
        attempt: u64,
        delay: Delay,
    },
    CancelAcquire,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Acquisition {
    Idle,
    InFlight { attempt: u64 },
    /// The backend accepted our write, but the watch hasn't shown us as holder yet.
    Confirming,
}

struct OwnedSession {
    session: Session,
    status: SessionStatus,
}

struct Observed {
    holder: Option<SessionId>,
    modify_index: u64,
    info: Option<LeadershipInfo>,
}

/// ElectionStateMachine holds this process's belief about leadership. Every input is an event
/// reported by another component; every output is a `Command` for the caller to carry out.
///
/// Leader is entered only when both an acquisition succeeded and the watch shows our session as
/// holder. It is left immediately when the session is lost, the watch shows anyone else, the
/// backend becomes unreachable, or the election stops.
pub(crate) struct ElectionStateMachine {
    logger: slog::Logger,
    running: bool,
    status: ElectionStatus,
    leader: bool,
    session: Option<OwnedSession>,
    // Our most recently lost session. The backend may still show it as holder for a while,
    // which means "about to be released", not "someone else leads".
    retired_session: Option<SessionId>,
    observed: Option<Observed>,
    acquisition: Acquisition,
    last_attempt: u64,
    watch_healthy: bool,
    ops_healthy: bool,
    notifier: ElectionStateChangeNotifier,
    listeners: ListenerNotifier,
}

impl ElectionStateMachine {
    pub(crate) fn new(
        logger: slog::Logger,
        notifier: ElectionStateChangeNotifier,
        listeners: ListenerNotifier,
    ) -> Self {
        ElectionStateMachine {
            logger,
            running: false,
            status: ElectionStatus::Candidate,
            leader: false,
            session: None,
            retired_session: None,
            observed: None,
            acquisition: Acquisition::Idle,
            last_attempt: 0,
            watch_healthy: true,
            ops_healthy: true,
            notifier,
            listeners,
        }
    }

    pub(crate) fn status(&self) -> ElectionStatus {
        self.status
    }

    pub(crate) fn start(&mut self) -> Vec<Command> {
        if self.running {
            slog::debug!(self.logger, "Election already running");
            return vec![];
        }
        slog::info!(self.logger, "Starting election");

        self.running = true;
        self.observed = None;
        self.acquisition = Acquisition::Idle;
        self.watch_healthy = true;
        self.ops_healthy = true;
        self.refresh();

        vec![Command::StartWatch, Command::CreateSession { delay: Delay::None }]
    }

    /// Leaves the election. Returns the session the caller should clean up.
    pub(crate) fn stop(&mut self) -> Option<SessionId> {
        if !self.running {
            return None;
        }
        slog::info!(self.logger, "Stopping election");

        self.revoke("election stopped");
        self.running = false;
        let session_id = self.session.take().map(|owned| owned.session.id);
        self.retired_session = None;
        self.observed = None;
        self.acquisition = Acquisition::Idle;
        self.watch_healthy = true;
        self.ops_healthy = true;
        self.refresh();

        session_id
    }

    pub(crate) fn session_created(&mut self, session: Session) -> Vec<Command> {
        if !self.running || self.session.is_some() {
            slog::info!(self.logger, "Releasing unneeded session {}", session.id);
            return vec![Command::ReleaseSession(session.id)];
        }

        self.ops_healthy = true;
        self.session = Some(OwnedSession {
            session: session.clone(),
            status: SessionStatus::Active,
        });

        let mut commands = vec![Command::StartRenewal(session)];
        commands.extend(self.maybe_acquire(Delay::None));
        self.refresh();
        commands
    }

    pub(crate) fn session_create_failed(&mut self, error: ElectionError) -> Vec<Command> {
        if !self.running || self.session.is_some() {
            return vec![];
        }
        if error.is_transient() {
            slog::warn!(self.logger, "Could not create a session, will try again: {}", error);
        } else {
            slog::error!(self.logger, "Session creation rejected, backing off: {}", error);
        }

        self.ops_healthy = false;
        self.refresh();
        vec![Command::CreateSession { delay: Delay::Long }]
    }

    pub(crate) fn session_health(&mut self, session_id: &SessionId, status: SessionStatus) -> Vec<Command> {
        match self.session.as_mut() {
            Some(owned) if &owned.session.id == session_id => owned.status = status,
            _ => return vec![],
        }

        self.ops_healthy = status == SessionStatus::Active;
        let commands = self.maybe_acquire(Delay::None).into_iter().collect();
        self.refresh();
        commands
    }

    pub(crate) fn session_lost(&mut self, session_id: &SessionId, reason: SessionLossReason) -> Vec<Command> {
        if self.current_session_id() != Some(session_id) {
            return vec![];
        }
        slog::warn!(self.logger, "Lost session {}: {:?}", session_id, reason);

        // Before anything gets retried.
        self.revoke("session lost");

        self.session = None;
        self.retired_session = Some(session_id.clone());
        self.acquisition = Acquisition::Idle;
        if reason != SessionLossReason::Invalidated {
            // The backend stopped answering renewals.
            self.ops_healthy = false;
        }
        self.refresh();

        vec![
            Command::CancelAcquire,
            Command::StopRenewal,
            Command::ReleaseSession(session_id.clone()),
            Command::CreateSession { delay: Delay::None },
        ]
    }

    pub(crate) fn acquire_result(&mut self, report: AcquireReport) -> Vec<Command> {
        if !self.running
            || self.current_session_id() != Some(&report.session_id)
            || self.acquisition != (Acquisition::InFlight { attempt: report.attempt })
        {
            slog::debug!(self.logger, "Ignoring stale acquire result for attempt {}", report.attempt);
            return vec![];
        }
        self.acquisition = Acquisition::Idle;

        let commands = match report.result {
            Ok(AcquireOutcome::Acquired) => {
                self.acquired();
                vec![]
            }
            Ok(AcquireOutcome::AlreadyHeld(holder)) if holder == report.session_id => {
                self.acquired();
                vec![]
            }
            Ok(AcquireOutcome::AlreadyHeld(holder)) => {
                self.ops_healthy = true;
                match &self.observed {
                    // The watch says free but the write says taken. One of them is stale, so
                    // try again shortly rather than wait on a watch event that may not come.
                    Some(observed) if observed.holder.is_none() => {
                        self.maybe_acquire(Delay::Short).into_iter().collect()
                    }
                    Some(_) => vec![],
                    None => {
                        self.observed = Some(Observed {
                            holder: Some(holder),
                            modify_index: 0,
                            info: None,
                        });
                        vec![]
                    }
                }
            }
            Err(ElectionError::SessionInvalidated(session_id)) => {
                return self.session_lost(&session_id, SessionLossReason::Invalidated);
            }
            Err(e) if e.is_transient() => {
                slog::warn!(self.logger, "Acquisition failed, will try again: {}", e);
                if let ElectionError::BackendUnavailable(_) = e {
                    self.ops_healthy = false;
                }
                self.maybe_acquire(Delay::Short).into_iter().collect()
            }
            // Asking again right away would get the same answer.
            Err(e) => {
                slog::error!(self.logger, "Acquisition rejected, backing off: {}", e);
                self.ops_healthy = false;
                self.maybe_acquire(Delay::Long).into_iter().collect()
            }
        };

        self.refresh();
        commands
    }

    pub(crate) fn lock_state_changed(&mut self, observation: LockObservation) -> Vec<Command> {
        if !self.running {
            return vec![];
        }
        self.watch_healthy = true;

        let info = match (&observation.holder, &observation.value) {
            (Some(_), Some(value)) => LeadershipInfo::decode(value).ok(),
            _ => None,
        };
        self.observed = Some(Observed {
            holder: observation.holder,
            modify_index: observation.modify_index,
            info,
        });

        if self.observed_holder_is_me() {
            if self.acquisition == Acquisition::Confirming {
                self.become_leader();
            }
        } else {
            self.revoke("lock observed with another holder");
            if self.acquisition == Acquisition::Confirming {
                self.acquisition = Acquisition::Idle;
            }
        }

        let commands = self.maybe_acquire(Delay::None).into_iter().collect();
        self.refresh();
        commands
    }

    pub(crate) fn watch_interrupted(&mut self, error: ElectionError) -> Vec<Command> {
        if !self.running {
            return vec![];
        }
        slog::warn!(self.logger, "Lost sight of the lock: {}", error);

        self.watch_healthy = false;
        self.refresh();
        vec![]
    }

    // ------- Internals --------

    fn acquired(&mut self) {
        self.ops_healthy = true;
        self.acquisition = Acquisition::Confirming;
        if self.observed_holder_is_me() {
            self.become_leader();
        }
    }

    fn maybe_acquire(&mut self, delay: Delay) -> Option<Command> {
        if !self.running || self.leader || self.acquisition != Acquisition::Idle {
            return None;
        }
        let session_id = match &self.session {
            Some(owned) if owned.status == SessionStatus::Active => owned.session.id.clone(),
            _ => return None,
        };
        let eligible = match &self.observed {
            None => true,
            Some(observed) => match &observed.holder {
                None => true,
                Some(holder) => holder == &session_id,
            },
        };
        if !eligible {
            return None;
        }

        self.last_attempt += 1;
        self.acquisition = Acquisition::InFlight {
            attempt: self.last_attempt,
        };
        Some(Command::Acquire {
            session_id,
            attempt: self.last_attempt,
            delay,
        })
    }

    fn become_leader(&mut self) {
        self.acquisition = Acquisition::Idle;
        if self.leader {
            return;
        }
        self.leader = true;
        slog::info!(self.logger, "Elected leader");
        self.listeners.elected();
    }

    fn revoke(&mut self, reason: &str) {
        if !self.leader {
            return;
        }
        self.leader = false;
        slog::info!(self.logger, "Leadership revoked: {}", reason);
        self.listeners.revoked();
    }

    /// Recompute the status from what we know and publish it.
    fn refresh(&mut self) {
        let disconnected = self.running && !self.watch_healthy && !self.ops_healthy;
        if disconnected {
            self.revoke("backend unreachable");
        }

        let status = if self.leader {
            ElectionStatus::Leader
        } else if disconnected {
            ElectionStatus::Disconnected
        } else if self.observed_holder_is_other() {
            ElectionStatus::Follower
        } else {
            ElectionStatus::Candidate
        };
        if status != self.status {
            slog::info!(self.logger, "Election status {:?} -> {:?}", self.status, status);
            self.status = status;
        }

        self.notifier.notify_new_state(self.snapshot());
    }

    fn snapshot(&self) -> ElectionSnapshot {
        ElectionSnapshot {
            status: self.status,
            session_id: self.current_session_id().cloned(),
            leader: self.observed.as_ref().and_then(|observed| {
                observed.holder.as_ref().map(|holder| LeaderDescriptor {
                    session_id: holder.clone(),
                    info: observed.info.clone(),
                })
            }),
        }
    }

    fn current_session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|owned| &owned.session.id)
    }

    fn observed_holder(&self) -> Option<&SessionId> {
        self.observed.as_ref().and_then(|observed| observed.holder.as_ref())
    }

    fn observed_holder_is_me(&self) -> bool {
        match (self.observed_holder(), self.current_session_id()) {
            (Some(holder), Some(mine)) => holder == mine,
            _ => false,
        }
    }

    fn observed_holder_is_other(&self) -> bool {
        match self.observed_holder() {
            Some(holder) => {
                Some(holder) != self.current_session_id() && Some(holder) != self.retired_session.as_ref()
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn observed_index(&self) -> Option<u64> {
        self.observed.as_ref().map(|observed| observed.modify_index)
    }
}
