mod manager;
mod renewal_timer;

pub(crate) use manager::RenewalConfig;
pub(crate) use manager::SessionManager;
pub(crate) use renewal_timer::RenewalTimerHandle;

use crate::backend::SessionId;
use crate::ElectionError;
use tokio::time::Instant;

/// A backend session this process owns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Session {
    pub id: SessionId,
    /// When the create request was sent. The backend's TTL clock can't have started earlier.
    pub issued_at: Instant,
}

/// Health of a live session. An invalid session isn't a status: it's reported as
/// `SessionEvent::Lost` and the session is dropped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SessionStatus {
    Active,
    /// At least one renewal failed, but the local deadline hasn't passed.
    Expiring,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SessionLossReason {
    /// The backend told us the session no longer exists.
    Invalidated,
    /// This many consecutive renewals failed.
    RenewalFailures(u32),
    /// A full TTL passed since the last renewal the backend acknowledged.
    Expired,
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    Created(Session),
    CreateFailed(ElectionError),
    Health {
        session_id: SessionId,
        status: SessionStatus,
    },
    Lost {
        session_id: SessionId,
        reason: SessionLossReason,
    },
}
