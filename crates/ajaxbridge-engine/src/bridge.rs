//! Process-wide hub registry and host-platform API.
//!
//! One [`Bridge`] per process owns every configured hub, keyed by [`HubId`],
//! with an explicit create-on-configure / destroy-on-remove lifecycle and no
//! ambient global state. Hubs are fully independent: each runs its own owner
//! task, and operations on different hubs proceed in parallel.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use ajaxbridge_core::{DeviceId, Error, HubId, Result, SensitivityLevel};
use ajaxbridge_protocol::ArmTarget;
use ajaxbridge_transport::{Connector, SerialConfig, SerialConnector};

use crate::config::EngineConfig;
use crate::hub::{HubHandle, spawn_hub};
use crate::notify::{Notification, Notifier};
use crate::pairing::Candidate;
use crate::registry::{DeviceSnapshot, HubSnapshot};

struct HubEntry {
    handle: HubHandle,
    join: JoinHandle<()>,
}

/// The engine's front door for the host platform.
pub struct Bridge {
    config: EngineConfig,
    notifier: Notifier,
    hubs: RwLock<HashMap<HubId, HubEntry>>,
}

impl Bridge {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            notifier: Notifier::new(),
            hubs: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to hub/device change notifications across all hubs.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Configure a hub on a serial port and start its session.
    pub async fn add_hub(&self, config: SerialConfig) -> HubId {
        self.add_hub_with(SerialConnector::new(config)).await
    }

    /// Configure a hub over any transport. Tests use this with in-memory
    /// pipes.
    pub async fn add_hub_with<C: Connector>(&self, connector: C) -> HubId {
        let hub_id = HubId::new();
        let (handle, join) = spawn_hub(
            hub_id,
            connector,
            self.config.clone(),
            self.notifier.clone(),
        );
        info!(hub = %hub_id, "hub configured");
        self.hubs
            .write()
            .await
            .insert(hub_id, HubEntry { handle, join });
        hub_id
    }

    /// Tear a hub down and drop its devices.
    ///
    /// # Errors
    /// Returns `Error::UnknownHub` if the id is not configured.
    pub async fn remove_hub(&self, hub_id: HubId) -> Result<()> {
        let entry = self
            .hubs
            .write()
            .await
            .remove(&hub_id)
            .ok_or(Error::UnknownHub)?;
        // Dropping the handle closes the request channel; the session task
        // cancels pending work and exits on its own.
        drop(entry.handle);
        let _ = entry.join.await;
        info!(hub = %hub_id, "hub removed");
        Ok(())
    }

    async fn handle(&self, hub_id: HubId) -> Result<HubHandle> {
        self.hubs
            .read()
            .await
            .get(&hub_id)
            .map(|entry| entry.handle.clone())
            .ok_or(Error::UnknownHub)
    }

    /// Start a pairing search; resolves once a candidate detector announces
    /// itself.
    pub async fn start_pairing(
        &self,
        hub_id: HubId,
        area_hint: Option<String>,
    ) -> Result<Candidate> {
        self.handle(hub_id).await?.start_pairing(area_hint).await
    }

    /// Enroll the pending candidate.
    pub async fn confirm_pairing(&self, hub_id: HubId) -> Result<DeviceSnapshot> {
        self.handle(hub_id).await?.confirm_pairing().await
    }

    /// Abort the active pairing session.
    pub async fn cancel_pairing(&self, hub_id: HubId) -> Result<()> {
        self.handle(hub_id).await?.cancel_pairing().await
    }

    /// Remove a device from its bridge; the registry entry is deleted only
    /// on a positive acknowledgement.
    pub async fn remove_device(&self, hub_id: HubId, device: DeviceId) -> Result<()> {
        self.handle(hub_id).await?.remove_device(device).await
    }

    pub async fn set_sensitivity(
        &self,
        hub_id: HubId,
        device: DeviceId,
        level: SensitivityLevel,
    ) -> Result<DeviceSnapshot> {
        self.handle(hub_id).await?.set_sensitivity(device, level).await
    }

    pub async fn set_24h_zone(
        &self,
        hub_id: HubId,
        device: DeviceId,
        enabled: bool,
    ) -> Result<DeviceSnapshot> {
        self.handle(hub_id).await?.set_24h_zone(device, enabled).await
    }

    /// Arm or disarm the hub (`ArmTarget::Hub`) or one device.
    pub async fn set_armed(&self, hub_id: HubId, target: ArmTarget, armed: bool) -> Result<()> {
        self.handle(hub_id).await?.set_armed(target, armed).await
    }

    /// Reconcile the registry against the bridge's own device list.
    pub async fn refresh_devices(&self, hub_id: HubId) -> Result<Vec<DeviceSnapshot>> {
        self.handle(hub_id).await?.refresh_devices().await
    }

    pub async fn set_debug_logging(&self, hub_id: HubId, enabled: bool) -> Result<HubSnapshot> {
        self.handle(hub_id).await?.set_debug_logging(enabled).await
    }

    pub async fn list_devices(&self, hub_id: HubId) -> Result<Vec<DeviceSnapshot>> {
        self.handle(hub_id).await?.list_devices().await
    }

    pub async fn get_device(&self, hub_id: HubId, device: DeviceId) -> Result<Option<DeviceSnapshot>> {
        self.handle(hub_id).await?.get_device(device).await
    }

    pub async fn hub_snapshot(&self, hub_id: HubId) -> Result<HubSnapshot> {
        self.handle(hub_id).await?.snapshot().await
    }

    /// Ids of every configured hub.
    pub async fn hub_ids(&self) -> Vec<HubId> {
        self.hubs.read().await.keys().copied().collect()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
