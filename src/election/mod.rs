mod candidacy;
mod listeners;
mod state_change_listener;
mod state_machine;

pub(crate) use candidacy::Candidacy;
pub(crate) use candidacy::CandidacyConfig;
pub(crate) use listeners::ListenerNotifier;
pub(crate) use state_change_listener::ElectionStateChangeListener;
pub use state_change_listener::ElectionSnapshot;
pub use state_change_listener::ElectionStatus;
pub use state_change_listener::LeaderDescriptor;
pub(crate) use state_machine::ElectionStateMachine;

pub(crate) fn state_change_listener(
) -> (state_change_listener::ElectionStateChangeNotifier, ElectionStateChangeListener) {
    state_change_listener::new(ElectionSnapshot::initial())
}
