//! The uartBridge protocol engine.
//!
//! This crate turns the wire protocol of `ajaxbridge-protocol` into a
//! stateful service: per-hub session tasks that own the serial stream,
//! correlate commands with their acknowledgements, drive the pairing
//! handshake, keep the device registry consistent with the hardware, and
//! fan change notifications out to the host platform.
//!
//! The entry point is [`Bridge`]: configure hubs with
//! [`Bridge::add_hub`], subscribe to [`Notification`]s, and call the
//! operation methods. Every wait is bounded (commands by the command
//! timeout, pairing by the pairing window, dead links by the idle watchdog)
//! and every cancellation resolves to a defined state.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod hub;
pub mod notify;
pub mod pairing;
pub mod registry;

pub use bridge::Bridge;
pub use config::EngineConfig;
pub use hub::HubHandle;
pub use notify::{Notification, Notifier};
pub use pairing::{Candidate, PairingSession, PairingState};
pub use registry::{DeviceSnapshot, HubSnapshot, Registry, TelemetryOutcome};
