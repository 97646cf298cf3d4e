use crate::{
    Result,
    constants::{DEVICE_ID_LEN, MAX_DEVICE_ID, PLACEHOLDER_DEVICE_ID},
    error::Error,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Vendor device identifier (24-bit, printed as six uppercase hex digits).
///
/// Every wireless detector reports a factory-assigned id during pairing.
/// Ids are unique within one hub but not globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a new device id with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidMessage` if the value does not fit in 24 bits.
    pub fn new(id: u32) -> Result<Self> {
        if id > MAX_DEVICE_ID {
            return Err(Error::InvalidMessage(format!(
                "device id must fit in 24 bits, got {id:#x}"
            )));
        }
        Ok(DeviceId(id))
    }

    /// Get the raw id value.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// The id bridge firmware substitutes for unsupported detectors.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0 == PLACEHOLDER_DEVICE_ID
    }

    /// Wire representation: three big-endian bytes.
    #[must_use]
    pub fn to_wire(&self) -> [u8; DEVICE_ID_LEN] {
        let b = self.0.to_be_bytes();
        [b[1], b[2], b[3]]
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn from_wire(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        DeviceId(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:06X}", self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id = u32::from_str_radix(s.trim(), 16)
            .map_err(|_| Error::InvalidMessage(format!("invalid device id: {s}")))?;
        DeviceId::new(id)
    }
}

/// Opaque identifier of a configured hub within this process.
///
/// Generated when the operator adds a serial port; the bridge hardware code
/// reported over the wire is recorded separately on the hub snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HubId(Uuid);

impl HubId {
    #[must_use]
    pub fn new() -> Self {
        HubId(Uuid::new_v4())
    }
}

impl Default for HubId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Detector model catalogue.
///
/// Only types whose protocol semantics are documented are listed; frames
/// naming any other type code are surfaced as diagnostics, never enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    MotionProtect,
    MotionProtectPlus,
    CombiProtect,
    DoorProtect,
    FireProtect,
    FireProtectPlus,
    LeaksProtect,
    SpaceControl,
    GlassProtect,
}

impl DeviceType {
    /// Create a device type from its wire code.
    ///
    /// # Errors
    /// Returns `Error::InvalidMessage` for codes outside the catalogue.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(DeviceType::MotionProtect),
            2 => Ok(DeviceType::MotionProtectPlus),
            3 => Ok(DeviceType::CombiProtect),
            4 => Ok(DeviceType::DoorProtect),
            5 => Ok(DeviceType::FireProtect),
            6 => Ok(DeviceType::FireProtectPlus),
            7 => Ok(DeviceType::LeaksProtect),
            8 => Ok(DeviceType::SpaceControl),
            9 => Ok(DeviceType::GlassProtect),
            _ => Err(Error::InvalidMessage(format!(
                "unknown device type code {code}"
            ))),
        }
    }

    /// Wire code for this type.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            DeviceType::MotionProtect => 1,
            DeviceType::MotionProtectPlus => 2,
            DeviceType::CombiProtect => 3,
            DeviceType::DoorProtect => 4,
            DeviceType::FireProtect => 5,
            DeviceType::FireProtectPlus => 6,
            DeviceType::LeaksProtect => 7,
            DeviceType::SpaceControl => 8,
            DeviceType::GlassProtect => 9,
        }
    }

    /// Human-readable model name as printed on the detector housing.
    #[must_use]
    pub fn model(&self) -> &'static str {
        match self {
            DeviceType::MotionProtect => "MotionProtect",
            DeviceType::MotionProtectPlus => "MotionProtect Plus",
            DeviceType::CombiProtect => "CombiProtect",
            DeviceType::DoorProtect => "DoorProtect",
            DeviceType::FireProtect => "FireProtect",
            DeviceType::FireProtectPlus => "FireProtect Plus",
            DeviceType::LeaksProtect => "LeaksProtect",
            DeviceType::SpaceControl => "SpaceControl",
            DeviceType::GlassProtect => "GlassProtect",
        }
    }

    /// Capability set implied by this type.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        match self {
            DeviceType::MotionProtect | DeviceType::MotionProtectPlus => Capabilities {
                sensitivity: true,
                zone_24h: false,
                armable: true,
            },
            DeviceType::CombiProtect | DeviceType::GlassProtect => Capabilities {
                sensitivity: true,
                zone_24h: true,
                armable: true,
            },
            DeviceType::DoorProtect => Capabilities {
                sensitivity: false,
                zone_24h: true,
                armable: true,
            },
            // Fire and leak detectors are always-on 24h zones.
            DeviceType::FireProtect | DeviceType::FireProtectPlus | DeviceType::LeaksProtect => {
                Capabilities {
                    sensitivity: false,
                    zone_24h: true,
                    armable: false,
                }
            }
            DeviceType::SpaceControl => Capabilities {
                sensitivity: false,
                zone_24h: false,
                armable: false,
            },
        }
    }

    fn settings_template(&self) -> SettingsTemplate {
        let caps = self.capabilities();
        match (caps.sensitivity, caps.zone_24h) {
            (true, true) => SettingsTemplate {
                sensitivity_offset: Some(0),
                zone_24h_offset: Some(1),
                min_len: 2,
            },
            (true, false) => SettingsTemplate {
                sensitivity_offset: Some(0),
                zone_24h_offset: None,
                min_len: 1,
            },
            (false, true) => SettingsTemplate {
                sensitivity_offset: None,
                zone_24h_offset: Some(0),
                min_len: 1,
            },
            (false, false) => SettingsTemplate {
                sensitivity_offset: None,
                zone_24h_offset: None,
                min_len: 0,
            },
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.model())
    }
}

/// What a device type can do, derived from the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Detection sensitivity is adjustable.
    pub sensitivity: bool,
    /// Can be assigned to an always-active 24-hour zone.
    pub zone_24h: bool,
    /// Participates in arm/disarm.
    pub armable: bool,
}

/// Detection sensitivity for capable detector types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityLevel {
    Low,
    Medium,
    High,
}

impl SensitivityLevel {
    /// Create a sensitivity level from its settings-byte value.
    ///
    /// # Errors
    /// Returns `Error::InvalidMessage` for values other than 0, 1 or 2.
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SensitivityLevel::Low),
            1 => Ok(SensitivityLevel::Medium),
            2 => Ok(SensitivityLevel::High),
            _ => Err(Error::InvalidMessage(format!(
                "invalid sensitivity value {value}"
            ))),
        }
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            SensitivityLevel::Low => 0,
            SensitivityLevel::Medium => 1,
            SensitivityLevel::High => 2,
        }
    }
}

/// Arm state of a hub or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmedState {
    Armed,
    Disarmed,
    Unknown,
}

impl ArmedState {
    #[must_use]
    pub fn from_flag(armed: bool) -> Self {
        if armed {
            ArmedState::Armed
        } else {
            ArmedState::Disarmed
        }
    }
}

/// Connection state of a hub's serial session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

/// Bridge firmware version, reported as major/minor bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Last observed telemetry of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Battery charge, percent. `None` until first reported.
    pub battery_percent: Option<u8>,
    pub battery_low: bool,
    pub tamper: bool,
    pub link_problem: bool,
    /// Receiver-side RSSI, dBm.
    pub rssi_dbm: Option<i8>,
    /// Receiver-side noise floor, dBm.
    pub noise_dbm: Option<i8>,
    pub received_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// Signal-to-noise ratio in dB, when both sides were reported.
    #[must_use]
    pub fn snr_db(&self) -> Option<i16> {
        match (self.rssi_dbm, self.noise_dbm) {
            (Some(rssi), Some(noise)) => Some(i16::from(rssi) - i16::from(noise)),
            _ => None,
        }
    }
}

/// Known offsets within a type's settings blob.
#[derive(Debug, Clone, Copy)]
struct SettingsTemplate {
    sensitivity_offset: Option<usize>,
    zone_24h_offset: Option<usize>,
    min_len: usize,
}

/// Per-device configuration bytes, carried opaquely.
///
/// Only the offsets named by the type's template are interpreted; every
/// other byte is vendor-undocumented and preserved verbatim across writes so
/// a settings round-trip cannot corrupt unrelated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsBlob {
    device_type: DeviceType,
    bytes: Vec<u8>,
}

impl SettingsBlob {
    /// Wrap raw settings bytes observed in a status frame.
    ///
    /// # Errors
    /// Returns `Error::InvalidMessage` if the blob is shorter than the
    /// type's template requires.
    pub fn new(device_type: DeviceType, bytes: Vec<u8>) -> Result<Self> {
        let template = device_type.settings_template();
        if bytes.len() < template.min_len {
            return Err(Error::InvalidMessage(format!(
                "settings blob for {} needs at least {} bytes, got {}",
                device_type,
                template.min_len,
                bytes.len()
            )));
        }
        Ok(SettingsBlob { device_type, bytes })
    }

    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoded sensitivity, for capable types with a valid byte.
    #[must_use]
    pub fn sensitivity(&self) -> Option<SensitivityLevel> {
        let offset = self.device_type.settings_template().sensitivity_offset?;
        SensitivityLevel::from_byte(*self.bytes.get(offset)?).ok()
    }

    /// Decoded 24-hour-zone flag, for capable types.
    #[must_use]
    pub fn zone_24h(&self) -> Option<bool> {
        let offset = self.device_type.settings_template().zone_24h_offset?;
        self.bytes.get(offset).map(|&b| b != 0)
    }

    /// Copy of this blob with the sensitivity byte replaced.
    ///
    /// # Errors
    /// Returns `Error::UnsupportedCapability` if the type has no
    /// sensitivity byte.
    pub fn with_sensitivity(&self, level: SensitivityLevel) -> Result<Self> {
        let offset = self
            .device_type
            .settings_template()
            .sensitivity_offset
            .ok_or(Error::UnsupportedCapability {
                capability: "sensitivity",
            })?;
        let mut bytes = self.bytes.clone();
        bytes[offset] = level.to_byte();
        Ok(SettingsBlob {
            device_type: self.device_type,
            bytes,
        })
    }

    /// Copy of this blob with the 24-hour-zone byte replaced.
    ///
    /// # Errors
    /// Returns `Error::UnsupportedCapability` if the type has no 24-hour
    /// zone byte.
    pub fn with_zone_24h(&self, enabled: bool) -> Result<Self> {
        let offset = self
            .device_type
            .settings_template()
            .zone_24h_offset
            .ok_or(Error::UnsupportedCapability {
                capability: "24h zone",
            })?;
        let mut bytes = self.bytes.clone();
        bytes[offset] = u8::from(enabled);
        Ok(SettingsBlob {
            device_type: self.device_type,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ABCD", 0xABCD)]
    #[case("00abcd", 0xABCD)]
    #[case("FFFFFE", 0xFF_FFFE)]
    fn test_device_id_parse(#[case] input: &str, #[case] expected: u32) {
        let id: DeviceId = input.parse().unwrap();
        assert_eq!(id.as_u32(), expected);
    }

    #[rstest]
    #[case("1000000")] // > 24 bits
    #[case("zzzz")] // not hex
    fn test_device_id_parse_invalid(#[case] input: &str) {
        let result: Result<DeviceId> = input.parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_device_id_display_zero_padded() {
        let id = DeviceId::new(0xABCD).unwrap();
        assert_eq!(id.to_string(), "00ABCD");
    }

    #[test]
    fn test_device_id_wire_roundtrip() {
        let id = DeviceId::new(0x12_34_56).unwrap();
        assert_eq!(id.to_wire(), [0x12, 0x34, 0x56]);
        assert_eq!(DeviceId::from_wire([0x12, 0x34, 0x56]), id);
    }

    #[test]
    fn test_placeholder_id() {
        let id = DeviceId::new(PLACEHOLDER_DEVICE_ID).unwrap();
        assert!(id.is_placeholder());
        assert!(!DeviceId::new(0xABCD).unwrap().is_placeholder());
    }

    #[rstest]
    #[case(DeviceType::MotionProtect, true, false, true)]
    #[case(DeviceType::MotionProtectPlus, true, false, true)]
    #[case(DeviceType::CombiProtect, true, true, true)]
    #[case(DeviceType::DoorProtect, false, true, true)]
    #[case(DeviceType::FireProtect, false, true, false)]
    #[case(DeviceType::FireProtectPlus, false, true, false)]
    #[case(DeviceType::LeaksProtect, false, true, false)]
    #[case(DeviceType::SpaceControl, false, false, false)]
    #[case(DeviceType::GlassProtect, true, true, true)]
    fn test_capabilities(
        #[case] device_type: DeviceType,
        #[case] sensitivity: bool,
        #[case] zone_24h: bool,
        #[case] armable: bool,
    ) {
        let caps = device_type.capabilities();
        assert_eq!(caps.sensitivity, sensitivity);
        assert_eq!(caps.zone_24h, zone_24h);
        assert_eq!(caps.armable, armable);
    }

    #[test]
    fn test_device_type_code_roundtrip() {
        for code in 1..=9u8 {
            let device_type = DeviceType::from_code(code).unwrap();
            assert_eq!(device_type.code(), code);
        }
        assert!(DeviceType::from_code(0).is_err());
        assert!(DeviceType::from_code(10).is_err());
    }

    #[test]
    fn test_firmware_version_display() {
        let fw = FirmwareVersion { major: 2, minor: 8 };
        assert_eq!(fw.to_string(), "2.08");
    }

    #[test]
    fn test_sensitivity_roundtrip() {
        for level in [
            SensitivityLevel::Low,
            SensitivityLevel::Medium,
            SensitivityLevel::High,
        ] {
            assert_eq!(SensitivityLevel::from_byte(level.to_byte()).unwrap(), level);
        }
        assert!(SensitivityLevel::from_byte(3).is_err());
    }

    #[test]
    fn test_settings_blob_known_offsets() {
        let blob = SettingsBlob::new(DeviceType::CombiProtect, vec![2, 1, 0x5A]).unwrap();
        assert_eq!(blob.sensitivity(), Some(SensitivityLevel::High));
        assert_eq!(blob.zone_24h(), Some(true));
    }

    #[test]
    fn test_settings_blob_preserves_unknown_bytes() {
        let blob = SettingsBlob::new(DeviceType::MotionProtect, vec![0, 0x5A, 0x7F]).unwrap();
        let updated = blob.with_sensitivity(SensitivityLevel::High).unwrap();
        assert_eq!(updated.as_bytes(), &[2, 0x5A, 0x7F]);
    }

    #[test]
    fn test_settings_blob_rejects_unsupported_writes() {
        let blob = SettingsBlob::new(DeviceType::DoorProtect, vec![0]).unwrap();
        assert!(matches!(
            blob.with_sensitivity(SensitivityLevel::Low),
            Err(Error::UnsupportedCapability { .. })
        ));

        let blob = SettingsBlob::new(DeviceType::MotionProtect, vec![1]).unwrap();
        assert!(matches!(
            blob.with_zone_24h(true),
            Err(Error::UnsupportedCapability { .. })
        ));
    }

    #[test]
    fn test_settings_blob_too_short() {
        assert!(SettingsBlob::new(DeviceType::CombiProtect, vec![1]).is_err());
        assert!(SettingsBlob::new(DeviceType::SpaceControl, vec![]).is_ok());
    }

    #[test]
    fn test_device_type_serde_names() {
        let json = serde_json::to_string(&DeviceType::MotionProtectPlus).unwrap();
        assert_eq!(json, "\"motion_protect_plus\"");
        let parsed: DeviceType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, DeviceType::MotionProtectPlus);
    }

    #[test]
    fn test_snr() {
        let telemetry = TelemetrySnapshot {
            battery_percent: Some(100),
            battery_low: false,
            tamper: false,
            link_problem: false,
            rssi_dbm: Some(-60),
            noise_dbm: Some(-98),
            received_at: Utc::now(),
        };
        assert_eq!(telemetry.snr_db(), Some(38));
    }
}
