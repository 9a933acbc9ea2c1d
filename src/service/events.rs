//! Server event fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::chain::ChainId;
use crate::store::ProposalStatus;

use super::monitor::PresenceStatus;

/// Default buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notifications pushed to every subscribed client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A device registered.
    DeviceRegistered {
        /// Device id.
        device_id: String,
        /// Device category.
        device_type: String,
        /// On-chain registration transaction.
        registration_tx: Option<String>,
    },
    /// A device attempted authentication.
    DeviceAuthenticated {
        /// Device id.
        device_id: String,
        /// Outcome.
        success: bool,
    },
    /// A record was submitted.
    DataSubmitted {
        /// Submitting device.
        device_id: String,
        /// Hex leaf hash.
        data_hash: String,
    },
    /// A batch root reached one or more chains.
    BatchAnchored {
        /// Batch id.
        batch_id: String,
        /// Hex root.
        root: String,
        /// Records in the batch.
        record_count: usize,
        /// Chains that accepted the root in this round.
        chains: Vec<ChainId>,
    },
    /// A chain refused or could not take a batch root.
    ChainAnchorFailed {
        /// Batch id.
        batch_id: String,
        /// Failing chain.
        chain: ChainId,
        /// Failure description.
        error: String,
    },
    /// A multisig proposal changed state.
    ProposalUpdated {
        /// Proposal id.
        proposal_id: String,
        /// New status.
        status: ProposalStatus,
    },
    /// A device came online or went silent.
    DeviceStatusChanged {
        /// Device id.
        device_id: String,
        /// New presence.
        status: PresenceStatus,
        /// Latest heartbeat.
        last_heartbeat: Option<DateTime<Utc>>,
    },
}

/// Broadcast channel of [`ServerEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers; returns how many received it.
    pub fn publish(&self, event: ServerEvent) -> usize {
        // No subscribers is not an error.
        let delivered = self.sender.send(event).unwrap_or(0);
        debug!(delivered, "event published");
        delivered
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out() {
        let bus = EventBus::default();
        assert_eq!(
            bus.publish(ServerEvent::DeviceAuthenticated { device_id: "d".into(), success: true }),
            0
        );

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let event = ServerEvent::DataSubmitted { device_id: "d".into(), data_hash: "00".into() };
        assert_eq!(bus.publish(event.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_wire_tag() {
        let json = serde_json::to_value(ServerEvent::ProposalUpdated {
            proposal_id: "p1".into(),
            status: ProposalStatus::Approved,
        })
        .unwrap();
        assert_eq!(json["event"], "proposal_updated");
        assert_eq!(json["status"], "approved");

        let json = serde_json::to_value(ServerEvent::DeviceStatusChanged {
            device_id: "d".into(),
            status: PresenceStatus::Offline,
            last_heartbeat: None,
        })
        .unwrap();
        assert_eq!(json["event"], "device_status_changed");
        assert_eq!(json["status"], "offline");
    }
}
