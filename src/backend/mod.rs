mod api;
mod in_memory;

pub use api::Backend;
pub use api::BackendError;
pub use api::CasOutcome;
pub use api::LockKey;
pub use api::LockRecord;
pub use api::RenewOutcome;
pub use api::SessionBehavior;
pub use api::SessionId;
pub use api::SessionSpec;
pub use api::WatchOutcome;
pub use in_memory::InMemoryBackend;
pub use in_memory::InMemoryConnection;
