//! In-memory source of truth for one hub and its devices.
//!
//! The registry has exactly four mutation paths ([`Registry::upsert_device`],
//! [`Registry::remove_device`], [`Registry::apply_telemetry`] and the hub
//! state setters), and they are only called from the hub's owner task, either
//! while routing decoded frames or after a locally issued command was
//! positively acknowledged. Nothing here guesses state: telemetry for an id
//! that was never enrolled is recorded as a diagnostic and dropped, and
//! removal happens only on a positive ack.
//!
//! Reads hand out clones, so callers always see a coherent snapshot.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use ajaxbridge_core::{
    ArmedState, Capabilities, ConnectionState, DeviceId, DeviceType, Error, FirmwareVersion,
    HubId, Result, SettingsBlob, TelemetrySnapshot,
};
use ajaxbridge_protocol::StatusReport;

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub capabilities: Capabilities,
    pub telemetry: Option<TelemetrySnapshot>,
    pub armed: ArmedState,
    pub settings: Option<SettingsBlob>,
    pub area: Option<String>,
}

/// Point-in-time view of the hub itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSnapshot {
    pub id: HubId,
    /// Serial endpoint description (path @ baud).
    pub endpoint: String,
    /// Hardware code the bridge reported in its first state frame.
    pub bridge_code: Option<DeviceId>,
    pub firmware: Option<FirmwareVersion>,
    pub connection: ConnectionState,
    pub armed: ArmedState,
    pub debug_logging: bool,
    /// Detector counts as reported by the bridge.
    pub registered_devices: Option<u8>,
    pub online_devices: Option<u8>,
    /// Receiver noise floor, dBm.
    pub noise_dbm: Option<i8>,
    /// Telemetry frames dropped because their id was never enrolled.
    pub unknown_telemetry_count: u64,
}

/// What applying a status frame did.
#[derive(Debug, PartialEq)]
pub enum TelemetryOutcome {
    /// Device known; snapshot updated.
    Updated(DeviceSnapshot),
    /// Id not in the registry; nothing mutated, diagnostic recorded.
    UnknownDevice,
    /// Firmware placeholder id for an unsupported detector model.
    Placeholder,
}

pub struct Registry {
    hub: HubSnapshot,
    devices: HashMap<DeviceId, DeviceSnapshot>,
    placeholder_warned: bool,
}

impl Registry {
    #[must_use]
    pub fn new(id: HubId, endpoint: String) -> Self {
        Self {
            hub: HubSnapshot {
                id,
                endpoint,
                bridge_code: None,
                firmware: None,
                connection: ConnectionState::Disconnected,
                armed: ArmedState::Unknown,
                debug_logging: false,
                registered_devices: None,
                online_devices: None,
                noise_dbm: None,
                unknown_telemetry_count: 0,
            },
            devices: HashMap::new(),
            placeholder_warned: false,
        }
    }

    // ------------------------------------------------------------------
    // Mutation points
    // ------------------------------------------------------------------

    /// Insert or update a device. The only path that creates devices:
    /// called after a positively acknowledged enrollment or a device-list
    /// reconciliation, never from telemetry.
    pub fn upsert_device(
        &mut self,
        id: DeviceId,
        device_type: DeviceType,
        area: Option<String>,
    ) -> DeviceSnapshot {
        let snapshot = self
            .devices
            .entry(id)
            .and_modify(|existing| {
                existing.device_type = device_type;
                existing.capabilities = device_type.capabilities();
                if area.is_some() {
                    existing.area.clone_from(&area);
                }
            })
            .or_insert_with(|| DeviceSnapshot {
                id,
                device_type,
                capabilities: device_type.capabilities(),
                telemetry: None,
                armed: ArmedState::Unknown,
                settings: None,
                area,
            });
        snapshot.clone()
    }

    /// Delete a device. Only called on a positive unenroll ack or during
    /// list reconciliation.
    ///
    /// # Errors
    /// Returns `Error::UnknownDevice` if the id is not present.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<()> {
        self.devices
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    /// Apply one status frame. The single path by which battery, link,
    /// tamper and signal fields change. Never creates a device.
    pub fn apply_telemetry(&mut self, report: &StatusReport) -> TelemetryOutcome {
        if report.device.is_placeholder() {
            if !self.placeholder_warned {
                self.placeholder_warned = true;
                warn!(
                    hub = %self.hub.id,
                    "bridge firmware does not recognize a detector model; its telemetry is dropped"
                );
            }
            return TelemetryOutcome::Placeholder;
        }

        let Some(device) = self.devices.get_mut(&report.device) else {
            self.hub.unknown_telemetry_count += 1;
            debug!(hub = %self.hub.id, device = %report.device, "telemetry for unknown device");
            return TelemetryOutcome::UnknownDevice;
        };

        device.telemetry = Some(TelemetrySnapshot {
            battery_percent: report.battery_percent,
            battery_low: report.battery_low,
            tamper: report.tamper,
            link_problem: report.link_problem,
            rssi_dbm: report.rssi_dbm,
            noise_dbm: report.noise_dbm,
            received_at: Utc::now(),
        });
        device.armed = report.armed;

        // Settings ride along on status frames; keep the last observed blob
        // so writes can preserve its undocumented bytes.
        if !report.settings.is_empty() {
            match SettingsBlob::new(device.device_type, report.settings.clone()) {
                Ok(blob) => device.settings = Some(blob),
                Err(e) => {
                    debug!(device = %report.device, error = %e, "undersized settings blob ignored")
                }
            }
        }

        TelemetryOutcome::Updated(device.clone())
    }

    /// Record a frame for an id that was never enrolled (telemetry is
    /// counted inside [`Registry::apply_telemetry`]; this covers alarms).
    pub fn record_unknown_device(&mut self, id: DeviceId) -> u64 {
        self.hub.unknown_telemetry_count += 1;
        debug!(hub = %self.hub.id, device = %id, "frame for unknown device");
        self.hub.unknown_telemetry_count
    }

    /// Record the settings blob confirmed by a settings-write ack.
    ///
    /// # Errors
    /// Returns `Error::UnknownDevice` if the id is not present.
    pub fn apply_settings(&mut self, id: DeviceId, blob: SettingsBlob) -> Result<DeviceSnapshot> {
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
        device.settings = Some(blob);
        Ok(device.clone())
    }

    /// Record the armed state confirmed by an arm/disarm ack.
    ///
    /// # Errors
    /// Returns `Error::UnknownDevice` for an unknown device target.
    pub fn set_device_armed(&mut self, id: DeviceId, armed: ArmedState) -> Result<DeviceSnapshot> {
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
        device.armed = armed;
        Ok(device.clone())
    }

    /// Apply a hub self-report frame.
    pub fn set_hub_state(
        &mut self,
        code: DeviceId,
        firmware: FirmwareVersion,
        registered: u8,
        online: u8,
        noise_dbm: i8,
        armed: ArmedState,
    ) -> HubSnapshot {
        self.hub.bridge_code = Some(code);
        self.hub.firmware = Some(firmware);
        self.hub.registered_devices = Some(registered);
        self.hub.online_devices = Some(online);
        self.hub.noise_dbm = Some(noise_dbm);
        self.hub.armed = armed;
        self.hub.clone()
    }

    pub fn set_connection(&mut self, state: ConnectionState) -> HubSnapshot {
        self.hub.connection = state;
        self.hub.clone()
    }

    pub fn set_hub_armed(&mut self, armed: ArmedState) -> HubSnapshot {
        self.hub.armed = armed;
        self.hub.clone()
    }

    pub fn set_debug_logging(&mut self, enabled: bool) -> HubSnapshot {
        self.hub.debug_logging = enabled;
        self.hub.clone()
    }

    /// Reconcile against the bridge's own paired-device list. Devices absent
    /// from the list are removed, listed devices are upserted. Returns the
    /// (added, removed) snapshots for notification fan-out.
    pub fn reconcile(
        &mut self,
        listed: &[(DeviceId, DeviceType)],
    ) -> (Vec<DeviceSnapshot>, Vec<DeviceId>) {
        let mut added = Vec::new();
        for &(id, device_type) in listed {
            if !self.devices.contains_key(&id) {
                added.push(self.upsert_device(id, device_type, None));
            } else {
                self.upsert_device(id, device_type, None);
            }
        }

        let keep: std::collections::HashSet<DeviceId> =
            listed.iter().map(|&(id, _)| id).collect();
        let removed: Vec<DeviceId> = self
            .devices
            .keys()
            .copied()
            .filter(|id| !keep.contains(id))
            .collect();
        for id in &removed {
            self.devices.remove(id);
        }

        (added, removed)
    }

    // ------------------------------------------------------------------
    // Snapshot reads
    // ------------------------------------------------------------------

    #[must_use]
    pub fn hub_snapshot(&self) -> HubSnapshot {
        self.hub.clone()
    }

    #[must_use]
    pub fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id.as_u32());
        devices
    }

    #[must_use]
    pub fn get_device(&self, id: DeviceId) -> Option<DeviceSnapshot> {
        self.devices.get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    #[must_use]
    pub fn debug_logging(&self) -> bool {
        self.hub.debug_logging
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.hub.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ajaxbridge_core::constants::PLACEHOLDER_DEVICE_ID;

    fn registry() -> Registry {
        Registry::new(HubId::new(), "/dev/ttyUSB0 @ 57600".to_string())
    }

    fn device(id: u32) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn status(id: u32) -> StatusReport {
        StatusReport {
            device: device(id),
            type_code: 1,
            battery_percent: Some(88),
            battery_low: false,
            tamper: false,
            link_problem: false,
            armed: ArmedState::Disarmed,
            rssi_dbm: Some(-60),
            noise_dbm: Some(-99),
            settings: vec![1],
        }
    }

    #[test]
    fn test_upsert_creates_with_capabilities() {
        let mut registry = registry();
        let snapshot = registry.upsert_device(device(0xABCD), DeviceType::MotionProtect, None);

        assert_eq!(snapshot.device_type, DeviceType::MotionProtect);
        assert!(snapshot.capabilities.sensitivity);
        assert!(snapshot.capabilities.armable);
        assert!(!snapshot.capabilities.zone_24h);
        assert_eq!(snapshot.armed, ArmedState::Unknown);
        assert!(snapshot.telemetry.is_none());
    }

    #[test]
    fn test_upsert_preserves_area_when_not_given() {
        let mut registry = registry();
        registry.upsert_device(
            device(0xABCD),
            DeviceType::MotionProtect,
            Some("hallway".to_string()),
        );
        let snapshot = registry.upsert_device(device(0xABCD), DeviceType::MotionProtect, None);
        assert_eq!(snapshot.area.as_deref(), Some("hallway"));
    }

    #[test]
    fn test_telemetry_for_unknown_device_never_creates() {
        let mut registry = registry();
        let outcome = registry.apply_telemetry(&status(0x9999));

        assert_eq!(outcome, TelemetryOutcome::UnknownDevice);
        assert!(registry.list_devices().is_empty());
        assert_eq!(registry.hub_snapshot().unknown_telemetry_count, 1);
    }

    #[test]
    fn test_telemetry_updates_known_device() {
        let mut registry = registry();
        registry.upsert_device(device(0xABCD), DeviceType::MotionProtect, None);

        let outcome = registry.apply_telemetry(&status(0xABCD));
        let TelemetryOutcome::Updated(snapshot) = outcome else {
            panic!("expected update");
        };
        let telemetry = snapshot.telemetry.unwrap();
        assert_eq!(telemetry.battery_percent, Some(88));
        assert_eq!(telemetry.rssi_dbm, Some(-60));
        assert_eq!(snapshot.armed, ArmedState::Disarmed);
        // Settings observed from the wire are retained.
        assert!(snapshot.settings.is_some());
    }

    #[test]
    fn test_placeholder_telemetry_dropped() {
        let mut registry = registry();
        let outcome = registry.apply_telemetry(&status(PLACEHOLDER_DEVICE_ID));
        assert_eq!(outcome, TelemetryOutcome::Placeholder);
        assert!(registry.list_devices().is_empty());
        // The placeholder is a firmware artifact, not an unknown detector.
        assert_eq!(registry.hub_snapshot().unknown_telemetry_count, 0);
    }

    #[test]
    fn test_remove_unknown_device_fails() {
        let mut registry = registry();
        assert!(matches!(
            registry.remove_device(device(0xABCD)),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_remove_device() {
        let mut registry = registry();
        registry.upsert_device(device(0xABCD), DeviceType::MotionProtect, None);
        registry.remove_device(device(0xABCD)).unwrap();
        assert!(registry.get_device(device(0xABCD)).is_none());
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let mut registry = registry();
        registry.upsert_device(device(0x1111), DeviceType::MotionProtect, None);
        registry.upsert_device(device(0x2222), DeviceType::DoorProtect, None);

        let (added, removed) = registry.reconcile(&[
            (device(0x2222), DeviceType::DoorProtect),
            (device(0x3333), DeviceType::FireProtect),
        ]);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, device(0x3333));
        assert_eq!(removed, vec![device(0x1111)]);
        assert_eq!(registry.list_devices().len(), 2);
    }

    #[test]
    fn test_hub_state() {
        let mut registry = registry();
        let snapshot = registry.set_hub_state(
            device(0x00F1A2),
            FirmwareVersion { major: 2, minor: 8 },
            5,
            4,
            -98,
            ArmedState::Armed,
        );

        assert_eq!(snapshot.bridge_code, Some(device(0x00F1A2)));
        assert_eq!(snapshot.firmware.unwrap().to_string(), "2.08");
        assert_eq!(snapshot.registered_devices, Some(5));
        assert_eq!(snapshot.armed, ArmedState::Armed);
    }

    #[test]
    fn test_snapshots_are_clones() {
        let mut registry = registry();
        registry.upsert_device(device(0xABCD), DeviceType::MotionProtect, None);
        let before = registry.get_device(device(0xABCD)).unwrap();

        registry.apply_telemetry(&status(0xABCD));

        // The earlier snapshot is unaffected by later mutation.
        assert!(before.telemetry.is_none());
    }

    #[test]
    fn test_list_devices_sorted() {
        let mut registry = registry();
        registry.upsert_device(device(0x2222), DeviceType::DoorProtect, None);
        registry.upsert_device(device(0x1111), DeviceType::MotionProtect, None);

        let ids: Vec<u32> = registry.list_devices().iter().map(|d| d.id.as_u32()).collect();
        assert_eq!(ids, vec![0x1111, 0x2222]);
    }
}
