//! Classification of decoded frames for routing.
//!
//! The hub session receives one ordered stream of events from the transport
//! and routes each by class: command responses feed the correlator, pairing
//! announcements feed the active pairing session, telemetry and status
//! changes feed the registry, list entries feed the in-progress device-list
//! refresh. The routing itself lives in the hub task (it owns all the
//! state); this module owns the classification so it stays independently
//! testable.

use ajaxbridge_protocol::Event;

/// Routing class of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Ack for the in-flight command → correlator.
    CommandResponse,
    /// Periodic device status → registry.
    Telemetry,
    /// Discovery announcement → active pairing session, if any.
    PairingAnnounce,
    /// Unsolicited state change (alarm, hub self-report) → registry and
    /// subscribers.
    StatusChange,
    /// Row of an in-progress device-list response.
    DeviceList,
}

/// Classify an event by its routing destination.
#[must_use]
pub fn classify(event: &Event) -> EventClass {
    match event {
        Event::Ack { .. } => EventClass::CommandResponse,
        Event::Status(_) => EventClass::Telemetry,
        Event::Announce { .. } => EventClass::PairingAnnounce,
        Event::Alarm { .. } | Event::HubState { .. } => EventClass::StatusChange,
        Event::ListEntry { .. } => EventClass::DeviceList,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ajaxbridge_core::{ArmedState, DeviceId, FirmwareVersion};
    use ajaxbridge_protocol::{AckStatus, Opcode, StatusReport};

    fn device(id: u32) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&Event::Ack {
                status: AckStatus::Ok,
                code: 0,
                command: Opcode::Enroll,
            }),
            EventClass::CommandResponse
        );

        assert_eq!(
            classify(&Event::Status(StatusReport {
                device: device(0xABCD),
                type_code: 1,
                battery_percent: None,
                battery_low: false,
                tamper: false,
                link_problem: false,
                armed: ArmedState::Unknown,
                rssi_dbm: None,
                noise_dbm: None,
                settings: vec![],
            })),
            EventClass::Telemetry
        );

        assert_eq!(
            classify(&Event::Announce {
                device: device(0xABCD),
                type_code: 1,
                firmware: FirmwareVersion { major: 2, minor: 8 },
                new: true,
                awaiting_confirm: true,
            }),
            EventClass::PairingAnnounce
        );

        assert_eq!(
            classify(&Event::Alarm {
                device: device(0xABCD),
                type_code: 1,
                code: 0x10,
            }),
            EventClass::StatusChange
        );

        assert_eq!(
            classify(&Event::HubState {
                code: device(0x00F1A2),
                firmware: FirmwareVersion { major: 2, minor: 8 },
                registered: 0,
                online: 0,
                noise_dbm: -99,
                armed: ArmedState::Unknown,
            }),
            EventClass::StatusChange
        );

        assert_eq!(
            classify(&Event::ListEntry {
                index: 0,
                slot: 0,
                device: device(0xABCD),
                type_code: 1,
            }),
            EventClass::DeviceList
        );
    }
}
