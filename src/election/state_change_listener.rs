use crate::api::LeadershipInfo;
use crate::backend::SessionId;
use tokio::sync::watch;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElectionStatus {
    /// Participating, but the lock is free or its holder isn't known yet.
    Candidate,
    Leader,
    /// Another session holds the lock.
    Follower,
    /// Neither the watch nor any other backend operation is getting through.
    Disconnected,
}

/// Who holds the lock, as last observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaderDescriptor {
    pub session_id: SessionId,
    /// Decoded from the lock value. None if it's missing or unreadable.
    pub info: Option<LeadershipInfo>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ElectionSnapshot {
    pub status: ElectionStatus,
    /// Our current session, if we have one.
    pub session_id: Option<SessionId>,
    pub leader: Option<LeaderDescriptor>,
}

impl ElectionSnapshot {
    pub(crate) fn initial() -> Self {
        ElectionSnapshot {
            status: ElectionStatus::Candidate,
            session_id: None,
            leader: None,
        }
    }
}

pub(crate) fn new(initial_state: ElectionSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(crate) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionSnapshot>,
}

impl ElectionStateChangeNotifier {
    /// Publishes only if something changed, so subscribers don't wake up for nothing.
    pub(crate) fn notify_new_state(&self, new_state: ElectionSnapshot) {
        if *self.snd.borrow() != new_state {
            self.snd.send_replace(new_state);
        }
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) async fn next(&mut self) -> Option<ElectionSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    /// A new listener whose `next()` waits for changes after this point.
    pub(crate) fn subscribe(&self) -> Self {
        let mut rcv = self.rcv.clone();
        rcv.borrow_and_update();
        ElectionStateChangeListener { rcv }
    }

    pub(crate) fn current(&self) -> ElectionSnapshot {
        self.rcv.borrow().clone()
    }
}
