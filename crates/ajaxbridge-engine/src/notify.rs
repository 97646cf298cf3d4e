//! Notification fan-out to host-platform subscribers.
//!
//! After a registry mutation the engine publishes one notification per
//! changed device or hub on a broadcast channel. Publishing always succeeds;
//! with no subscribers the notification is simply dropped, and a subscriber
//! that falls behind loses the oldest entries (the host can re-read
//! snapshots at any time, so notifications are hints, not a log).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ajaxbridge_core::{DeviceId, HubId};

use crate::registry::{DeviceSnapshot, HubSnapshot};

/// Default broadcast capacity; enough for a full device-list reconciliation
/// burst.
const DEFAULT_CAPACITY: usize = 64;

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    /// Hub connection state, armed state or identity changed.
    HubUpdated { hub: HubSnapshot },
    /// A device was enrolled or appeared during reconciliation.
    DeviceAdded {
        hub_id: HubId,
        device: DeviceSnapshot,
    },
    /// A device's telemetry, settings or armed state changed.
    DeviceUpdated {
        hub_id: HubId,
        device: DeviceSnapshot,
    },
    /// A device was removed from the bridge and the registry.
    DeviceRemoved { hub_id: HubId, device_id: DeviceId },
    /// An alarm frame arrived for an enrolled device.
    Alarm {
        hub_id: HubId,
        device_id: DeviceId,
        code: u8,
    },
    /// Telemetry arrived for an id that was never enrolled. Diagnostic.
    UnknownDeviceTelemetry { hub_id: HubId, device_id: DeviceId },
}

/// Broadcast bus for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to notifications published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Publish a notification. A send with zero receivers is not an error.
    pub fn publish(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
