use std::error::Error;

pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Callbacks for leadership transitions. For any one leadership interval, `on_elected` fires
/// exactly once and `on_revoked` fires exactly once after it.
///
/// Callbacks run on the election's event loop, so they should return quickly. A callback that
/// errors or panics is logged and otherwise ignored; it never stops the election.
pub trait LeadershipListener: Send + Sync {
    fn on_elected(&self) -> Result<(), ListenerError>;

    fn on_revoked(&self) -> Result<(), ListenerError>;
}
