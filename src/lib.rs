mod actor;
mod api;
mod backend;
mod election;
mod lock;
mod retry;
mod session;
mod timers;
mod watch;

pub use api::try_create_election;
pub use api::ConfigurationError;
pub use api::DefaultLeadershipInfoProvider;
pub use api::ElectionConfig;
pub use api::ElectionCreationError;
pub use api::ElectionError;
pub use api::ElectionEventListener;
pub use api::ElectionOptions;
pub use api::LeaderElection;
pub use api::LeadershipChange;
pub use api::LeadershipInfo;
pub use api::LeadershipInfoProvider;
pub use api::LeadershipListener;
pub use api::ListenerError;
pub use backend::Backend;
pub use backend::BackendError;
pub use backend::CasOutcome;
pub use backend::InMemoryBackend;
pub use backend::InMemoryConnection;
pub use backend::LockKey;
pub use backend::LockRecord;
pub use backend::RenewOutcome;
pub use backend::SessionBehavior;
pub use backend::SessionId;
pub use backend::SessionSpec;
pub use backend::WatchOutcome;
pub use election::ElectionSnapshot;
pub use election::ElectionStatus;
pub use election::LeaderDescriptor;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
