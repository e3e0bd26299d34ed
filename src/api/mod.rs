//! This mod is meant to hold most of the code for the library's client-facing API.
mod election;
mod error;
mod event_bus;
mod info;
mod listener;
mod options;
mod wiring;

pub use election::LeaderElection;
pub use error::ConfigurationError;
pub use error::ElectionError;
pub use event_bus::ElectionEventListener;
pub use info::DefaultLeadershipInfoProvider;
pub use info::LeadershipChange;
pub use info::LeadershipInfo;
pub use info::LeadershipInfoProvider;
pub use listener::LeadershipListener;
pub use listener::ListenerError;
pub use options::ElectionOptions;
pub use wiring::try_create_election;
pub use wiring::ElectionConfig;
pub use wiring::ElectionCreationError;
