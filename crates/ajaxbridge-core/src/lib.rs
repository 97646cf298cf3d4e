//! Core types for the ajaxbridge workspace.
//!
//! This crate defines the vocabulary shared by every other crate: device and
//! hub identifiers, the device type catalogue with its capability sets,
//! telemetry and settings types, the error taxonomy, and the protocol/timing
//! constants.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    ArmedState, Capabilities, ConnectionState, DeviceId, DeviceType, FirmwareVersion, HubId,
    SensitivityLevel, SettingsBlob, TelemetrySnapshot,
};
