//! Device presence tracking.
//!
//! A heartbeat marks a device online. The periodic sweep marks devices
//! whose last heartbeat is older than the timeout offline. Both transitions
//! publish [`ServerEvent::DeviceStatusChanged`]; repeated heartbeats from an
//! online device do not.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::events::{EventBus, ServerEvent};

/// Heartbeat silence after which a device is considered offline.
pub fn default_heartbeat_timeout() -> Duration {
    Duration::minutes(5)
}

/// Presence of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Heartbeat within the timeout.
    Online,
    /// No heartbeat yet, or the last one is too old.
    Offline,
}

/// Presence of one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePresence {
    /// Device id.
    pub device_id: String,
    /// Current status.
    pub status: PresenceStatus,
    /// Latest heartbeat, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl DevicePresence {
    fn unseen(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: PresenceStatus::Offline,
            last_heartbeat: None,
        }
    }
}

/// Heartbeat bookkeeping for all devices.
pub struct DeviceMonitor {
    devices: RwLock<BTreeMap<String, DevicePresence>>,
    timeout: Duration,
    events: EventBus,
}

impl DeviceMonitor {
    /// Create a monitor with the given heartbeat timeout.
    pub fn new(timeout: Duration, events: EventBus) -> Self {
        Self { devices: RwLock::new(BTreeMap::new()), timeout, events }
    }

    /// Heartbeat timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat now.
    pub async fn heartbeat(&self, device_id: &str) -> DevicePresence {
        self.heartbeat_at(device_id, Utc::now()).await
    }

    /// Record a heartbeat at `now`.
    pub async fn heartbeat_at(&self, device_id: &str, now: DateTime<Utc>) -> DevicePresence {
        let mut devices = self.devices.write().await;
        let presence = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePresence::unseen(device_id));
        let was = presence.status;
        presence.status = PresenceStatus::Online;
        presence.last_heartbeat = Some(now);
        let presence = presence.clone();
        drop(devices);

        if was != PresenceStatus::Online {
            info!(device_id, "device online");
            self.announce(&presence);
        } else {
            debug!(device_id, "heartbeat");
        }
        presence
    }

    /// Mark silent devices offline. Returns the ids that changed.
    pub async fn check_timeouts(&self) -> Vec<String> {
        self.check_timeouts_at(Utc::now()).await
    }

    /// Mark devices silent since before `now - timeout` offline.
    pub async fn check_timeouts_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut changed = Vec::new();
        {
            let mut devices = self.devices.write().await;
            for presence in devices.values_mut() {
                let overdue = presence
                    .last_heartbeat
                    .map_or(false, |seen| now - seen > self.timeout);
                if presence.status == PresenceStatus::Online && overdue {
                    presence.status = PresenceStatus::Offline;
                    changed.push(presence.clone());
                }
            }
        }

        for presence in &changed {
            info!(device_id = %presence.device_id, "device offline");
            self.announce(presence);
        }
        changed.into_iter().map(|p| p.device_id).collect()
    }

    /// Presence of one device; never-seen devices are offline.
    pub async fn status(&self, device_id: &str) -> DevicePresence {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| DevicePresence::unseen(device_id))
    }

    /// Devices currently online.
    pub async fn online_count(&self) -> usize {
        self.devices
            .read()
            .await
            .values()
            .filter(|p| p.status == PresenceStatus::Online)
            .count()
    }

    fn announce(&self, presence: &DevicePresence) {
        self.events.publish(ServerEvent::DeviceStatusChanged {
            device_id: presence.device_id.clone(),
            status: presence.status,
            last_heartbeat: presence.last_heartbeat,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_and_timeout_transitions() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let monitor = DeviceMonitor::new(Duration::minutes(5), events);
        let t0 = Utc::now();

        assert_eq!(monitor.status("dev-1").await.status, PresenceStatus::Offline);

        let p = monitor.heartbeat_at("dev-1", t0).await;
        assert_eq!(p.status, PresenceStatus::Online);
        assert_eq!(p.last_heartbeat, Some(t0));
        monitor.heartbeat_at("dev-1", t0 + Duration::minutes(1)).await;
        assert_eq!(monitor.online_count().await, 1);

        // Within the timeout of the latest heartbeat
        assert!(monitor.check_timeouts_at(t0 + Duration::minutes(5)).await.is_empty());

        let gone = monitor.check_timeouts_at(t0 + Duration::minutes(7)).await;
        assert_eq!(gone, vec!["dev-1".to_string()]);
        assert_eq!(monitor.status("dev-1").await.status, PresenceStatus::Offline);
        assert!(monitor.check_timeouts_at(t0 + Duration::minutes(8)).await.is_empty());

        let statuses: Vec<_> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|e| match e {
                ServerEvent::DeviceStatusChanged { status, .. } => status,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(statuses, vec![PresenceStatus::Online, PresenceStatus::Offline]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_after_offline_comes_back() {
        let monitor = DeviceMonitor::new(Duration::seconds(30), EventBus::default());
        let t0 = Utc::now();
        monitor.heartbeat_at("dev-1", t0).await;
        monitor.heartbeat_at("dev-2", t0 + Duration::seconds(20)).await;

        let gone = monitor.check_timeouts_at(t0 + Duration::seconds(40)).await;
        assert_eq!(gone, vec!["dev-1".to_string()]);
        assert_eq!(monitor.online_count().await, 1);

        let back = monitor.heartbeat_at("dev-1", t0 + Duration::seconds(41)).await;
        assert_eq!(back.status, PresenceStatus::Online);
        assert_eq!(monitor.online_count().await, 2);
    }
}
