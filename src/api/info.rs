use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What a leader writes into the lock value, so other candidates (and operators reading the KV
/// store) can tell who holds it. Stored as JSON.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date_time: Option<String>,
}

impl LeadershipInfo {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LeadershipChange {
    Acquire,
    Release,
}

/// Supplies the lock value written on acquire and on release.
pub trait LeadershipInfoProvider: Send + Sync {
    fn leadership_info(&self, change: LeadershipChange) -> LeadershipInfo;
}

/// Host and cluster name plus an RFC 3339 timestamp of the change.
#[derive(Clone, Debug)]
pub struct DefaultLeadershipInfoProvider {
    hostname: String,
    cluster_name: String,
}

impl DefaultLeadershipInfoProvider {
    pub fn new(hostname: String, cluster_name: String) -> Self {
        DefaultLeadershipInfoProvider { hostname, cluster_name }
    }
}

impl LeadershipInfoProvider for DefaultLeadershipInfoProvider {
    fn leadership_info(&self, change: LeadershipChange) -> LeadershipInfo {
        let now = chrono::Utc::now().to_rfc3339();
        let mut info = LeadershipInfo {
            hostname: Some(self.hostname.clone()),
            cluster_name: Some(self.cluster_name.clone()),
            ..LeadershipInfo::default()
        };
        match change {
            LeadershipChange::Acquire => info.acquire_date_time = Some(now),
            LeadershipChange::Release => info.release_date_time = Some(now),
        }

        info
    }
}
