use crate::api::LeadershipListener;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Fans leadership transitions out to the registered listeners, one at a time. A failing
/// listener can't stop the others or the election.
pub(crate) struct ListenerNotifier {
    logger: slog::Logger,
    listeners: Vec<Arc<dyn LeadershipListener>>,
}

impl ListenerNotifier {
    pub(crate) fn new(logger: slog::Logger, listeners: Vec<Arc<dyn LeadershipListener>>) -> Self {
        ListenerNotifier { logger, listeners }
    }

    pub(crate) fn elected(&self) {
        for listener in &self.listeners {
            self.invoke("on_elected", || listener.on_elected());
        }
    }

    pub(crate) fn revoked(&self) {
        for listener in &self.listeners {
            self.invoke("on_revoked", || listener.on_revoked());
        }
    }

    fn invoke<F>(&self, callback: &'static str, f: F)
    where
        F: FnOnce() -> Result<(), crate::api::ListenerError>,
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => slog::error!(self.logger, "Leadership listener {} failed: {}", callback, e),
            Err(_) => slog::error!(self.logger, "Leadership listener {} panicked", callback),
        }
    }
}
