use crate::election::{ElectionSnapshot, ElectionStateChangeListener};

/// Stream of this instance's election state, as seen by the local election task.
///
/// Consuming it is subtle: intermediate states are not queued. If the state changes several times
/// between two calls to `next()`, only the most recent state is returned.
pub struct ElectionEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl ElectionEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        ElectionEventListener {
            election_state_change_listener,
        }
    }

    /// Waits for the state to change, then returns it. Returns None once the election task is gone.
    pub async fn next(&mut self) -> Option<ElectionSnapshot> {
        self.election_state_change_listener.next().await
    }

    pub fn current(&self) -> ElectionSnapshot {
        self.election_state_change_listener.current()
    }
}
