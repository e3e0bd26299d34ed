mod watcher;

pub(crate) use watcher::LeadershipWatcher;
pub(crate) use watcher::WatcherHandle;

use crate::backend::{LockRecord, SessionId};
use crate::ElectionError;
use bytes::Bytes;

/// The lock key as last seen by the watcher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LockObservation {
    pub holder: Option<SessionId>,
    pub modify_index: u64,
    pub value: Option<Bytes>,
}

impl From<LockRecord> for LockObservation {
    fn from(record: LockRecord) -> Self {
        LockObservation {
            holder: record.holder,
            modify_index: record.modify_index,
            value: record.value,
        }
    }
}

#[derive(Debug)]
pub(crate) enum WatchEvent {
    /// Emitted when the holder changes, and once after every (re-)establishment of the watch.
    LockStateChanged(LockObservation),
    /// The watch lost its connection to the backend. It keeps trying to re-establish.
    Interrupted(ElectionError),
}
