use crate::actor::ActorClient;
use crate::api::event_bus::ElectionEventListener;
use crate::election::{ElectionSnapshot, ElectionStateChangeListener, ElectionStatus};
use crate::ElectionError;

/// Handle to one election. Created by `try_create_election`, idle until `start()`.
///
/// Dropping every handle ends the election task. That doesn't release the session: call `stop()`
/// first so another candidate can take over without waiting for the TTL.
pub struct LeaderElection {
    actor_client: ActorClient,
    state_change_listener: ElectionStateChangeListener,
}

impl LeaderElection {
    pub(crate) fn new(actor_client: ActorClient, state_change_listener: ElectionStateChangeListener) -> Self {
        LeaderElection {
            actor_client,
            state_change_listener,
        }
    }

    /// Join the election. Returns once the campaign is running, not once it's won. Calling it on
    /// a running election does nothing.
    pub async fn start(&self) -> Result<(), ElectionError> {
        self.actor_client.start().await
    }

    /// Leave the election: stop watching, cancel pending retries, stop renewing, then release the
    /// lock and the session. Each backend step is bounded by the operation timeout. `on_revoked`
    /// fires first if this instance was leader.
    pub async fn stop(&self) -> Result<(), ElectionError> {
        self.actor_client.stop().await
    }

    pub fn status(&self) -> ElectionSnapshot {
        self.state_change_listener.current()
    }

    pub fn is_leader(&self) -> bool {
        self.status().status == ElectionStatus::Leader
    }

    pub fn event_listener(&self) -> ElectionEventListener {
        ElectionEventListener::new(self.state_change_listener.subscribe())
    }
}
