//! Connection State Record: the durable view of a device's connectivity.
//!
//! The core writes a record on every channel status change but does not
//! own where it lands; hosts plug in a [`ConnectionStateStore`]. An
//! in-memory store ships for tests and single-process use.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use dsplink_api::{ChannelState, ChannelStatus, DeviceAddress};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStateRecord {
    pub device: DeviceAddress,
    pub connected: bool,
    pub state: ChannelState,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionStateRecord {
    pub fn from_status(device: &DeviceAddress, status: &ChannelStatus) -> Self {
        Self {
            device: device.clone(),
            connected: status.state == ChannelState::Ready,
            state: status.state,
            last_connected_at: status.connected_at,
            last_disconnected_at: status.disconnected_at,
            consecutive_errors: status.consecutive_failures,
            last_error: status.last_error.clone(),
            updated_at: status.changed_at,
        }
    }
}

/// Sink for connection state records.
///
/// Called from the client's status task; implementations should not block.
pub trait ConnectionStateStore: Send + Sync {
    fn update(&self, record: ConnectionStateRecord);

    fn get(&self, device: &DeviceAddress) -> Option<ConnectionStateRecord>;
}

/// Process-local store keyed by device address.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: DashMap<DeviceAddress, ConnectionStateRecord>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ConnectionStateStore for InMemoryStateStore {
    fn update(&self, record: ConnectionStateRecord) {
        self.records.insert(record.device.clone(), record);
    }

    fn get(&self, device: &DeviceAddress) -> Option<ConnectionStateRecord> {
        self.records.get(device).map(|r| r.value().clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn status(state: ChannelState, failures: u32) -> ChannelStatus {
        ChannelStatus {
            state,
            attempts: u64::from(failures) + 1,
            consecutive_failures: failures,
            last_error: (failures > 0).then(|| "connection refused".to_string()),
            changed_at: Utc::now(),
            connected_at: None,
            disconnected_at: None,
        }
    }

    #[test]
    fn latest_record_wins() {
        let store = InMemoryStateStore::new();
        let device = DeviceAddress::new("192.0.2.10");

        store.update(ConnectionStateRecord::from_status(&device, &status(ChannelState::Connecting, 3)));
        store.update(ConnectionStateRecord::from_status(&device, &status(ChannelState::Ready, 0)));

        let record = store.get(&device).unwrap();
        assert!(record.connected);
        assert_eq!(record.consecutive_errors, 0);
        assert!(record.last_error.is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failures_are_recorded() {
        let store = InMemoryStateStore::new();
        let device = DeviceAddress::new("192.0.2.11");

        store.update(ConnectionStateRecord::from_status(&device, &status(ChannelState::Connecting, 2)));

        let record = store.get(&device).unwrap();
        assert!(!record.connected);
        assert_eq!(record.state, ChannelState::Connecting);
        assert_eq!(record.last_error.as_deref(), Some("connection refused"));
        assert!(store.get(&DeviceAddress::new("192.0.2.12")).is_none());
    }
}
