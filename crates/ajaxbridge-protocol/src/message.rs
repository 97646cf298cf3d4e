//! Typed messages carried inside wire frames.
//!
//! Commands travel host → bridge, events travel bridge → host. Both sides
//! round-trip losslessly through [`Frame`] payloads: for every valid message
//! `m`, `from_frame(&m.to_frame()) == m`.
//!
//! # Payload Layouts
//!
//! Multi-byte device ids are three big-endian bytes. Optional readings use
//! in-band sentinels: battery `0xFF` = not reported, RSSI/noise `0x7F` = not
//! measured, armed byte `2` = unknown.
//!
//! | Message       | Payload                                                        |
//! |---------------|----------------------------------------------------------------|
//! | SearchStart   | (empty)                                                        |
//! | SearchStop    | (empty)                                                        |
//! | Enroll        | `id:3`                                                         |
//! | Unenroll      | `id:3`                                                         |
//! | DeviceList    | (empty)                                                        |
//! | HubStatus     | (empty)                                                        |
//! | SetArmed      | `target:3` (`000000` = hub) `armed:1`                          |
//! | WriteSettings | `id:3` `settings:N`                                            |
//! | Ack           | `status:1` `code:1` `echoed command opcode:1`                  |
//! | Status        | `id:3` `type:1` `battery:1` `flags:1` `armed:1` `rssi:1` `noise:1` `settings:N` |
//! | Alarm         | `id:3` `type:1` `code:1`                                       |
//! | Announce      | `id:3` `type:1` `fw_major:1` `fw_minor:1` `flags:1`            |
//! | HubState      | `code:3` `fw_major:1` `fw_minor:1` `registered:1` `online:1` `noise:1` `armed:1` |
//! | ListEntry     | `index:1` `slot:1` `id:3` `type:1`                             |

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use ajaxbridge_core::{ArmedState, DeviceId, Error, FirmwareVersion, Result, constants::*};

use crate::frame::Frame;

/// Battery sentinel: reading not present in this status frame.
const BATTERY_UNKNOWN: u8 = 0xFF;

/// RSSI/noise sentinel: radio figure not measured.
const SIGNAL_UNKNOWN: i8 = 0x7F;

/// Status flag bits.
const FLAG_BATTERY_LOW: u8 = 1 << 0;
const FLAG_TAMPER: u8 = 1 << 1;
const FLAG_LINK_PROBLEM: u8 = 1 << 2;

/// Announce flag bits.
const FLAG_NEW: u8 = 1 << 0;
const FLAG_AWAITING_CONFIRM: u8 = 1 << 1;

/// Frame opcodes, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // Host → bridge
    SearchStart = 0x01,
    SearchStop = 0x02,
    Enroll = 0x03,
    Unenroll = 0x04,
    DeviceList = 0x05,
    HubStatus = 0x06,
    SetArmed = 0x07,
    WriteSettings = 0x08,

    // Bridge → host
    Ack = 0x81,
    Status = 0x82,
    Alarm = 0x83,
    Announce = 0x84,
    HubState = 0x85,
    ListEntry = 0x86,
}

impl Opcode {
    /// Map a raw opcode byte.
    ///
    /// # Errors
    /// Returns `Error::UnknownOpcode` for bytes outside the table.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Opcode::SearchStart),
            0x02 => Ok(Opcode::SearchStop),
            0x03 => Ok(Opcode::Enroll),
            0x04 => Ok(Opcode::Unenroll),
            0x05 => Ok(Opcode::DeviceList),
            0x06 => Ok(Opcode::HubStatus),
            0x07 => Ok(Opcode::SetArmed),
            0x08 => Ok(Opcode::WriteSettings),
            0x81 => Ok(Opcode::Ack),
            0x82 => Ok(Opcode::Status),
            0x83 => Ok(Opcode::Alarm),
            0x84 => Ok(Opcode::Announce),
            0x85 => Ok(Opcode::HubState),
            0x86 => Ok(Opcode::ListEntry),
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for opcodes the bridge originates.
    #[must_use]
    pub fn is_event(self) -> bool {
        self.as_u8() & 0x80 != 0
    }
}

/// Addressee of an arm/disarm command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmTarget {
    /// The whole hub (wire id `000000`, which no detector uses).
    Hub,
    Device(DeviceId),
}

impl ArmTarget {
    fn to_wire(self) -> [u8; DEVICE_ID_LEN] {
        match self {
            ArmTarget::Hub => [0, 0, 0],
            ArmTarget::Device(id) => id.to_wire(),
        }
    }

    fn from_wire(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        if bytes == [0, 0, 0] {
            ArmTarget::Hub
        } else {
            ArmTarget::Device(DeviceId::from_wire(bytes))
        }
    }
}

/// Command issued by the host to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Enter discovery mode and start listening for unenrolled detectors.
    SearchStart,
    /// Leave discovery mode.
    SearchStop,
    /// Enroll the announced candidate with the given id.
    Enroll { device: DeviceId },
    /// Remove a paired detector from the bridge.
    Unenroll { device: DeviceId },
    /// Request the paired-device list (a burst of `ListEntry` events
    /// followed by the ack).
    DeviceList,
    /// Request a `HubState` report.
    HubStatus,
    /// Arm or disarm the hub or one detector.
    SetArmed { target: ArmTarget, armed: bool },
    /// Replace a detector's settings blob wholesale.
    WriteSettings { device: DeviceId, settings: Vec<u8> },
}

impl Command {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::SearchStart => Opcode::SearchStart,
            Command::SearchStop => Opcode::SearchStop,
            Command::Enroll { .. } => Opcode::Enroll,
            Command::Unenroll { .. } => Opcode::Unenroll,
            Command::DeviceList => Opcode::DeviceList,
            Command::HubStatus => Opcode::HubStatus,
            Command::SetArmed { .. } => Opcode::SetArmed,
            Command::WriteSettings { .. } => Opcode::WriteSettings,
        }
    }

    /// Whether the correlator may transparently retry this command after a
    /// timeout. Pure queries are; anything that mutates bridge state is not.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Command::DeviceList | Command::HubStatus)
    }

    /// Serialize into a wire frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::new();
        match self {
            Command::SearchStart
            | Command::SearchStop
            | Command::DeviceList
            | Command::HubStatus => {}
            Command::Enroll { device } | Command::Unenroll { device } => {
                payload.put_slice(&device.to_wire());
            }
            Command::SetArmed { target, armed } => {
                payload.put_slice(&target.to_wire());
                payload.put_u8(u8::from(*armed));
            }
            Command::WriteSettings { device, settings } => {
                payload.put_slice(&device.to_wire());
                payload.put_slice(settings);
            }
        }
        // Payloads are bounded well below the frame limit by construction.
        Frame::new(self.opcode().as_u8(), payload.freeze())
            .unwrap_or_else(|_| unreachable!("command payload within frame limit"))
    }

    /// Parse a wire frame as a command.
    ///
    /// # Errors
    /// Returns `Error::UnknownOpcode` for event opcodes and
    /// `Error::InvalidMessage` for malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = Opcode::from_u8(frame.opcode())?;
        let payload = frame.payload();
        match opcode {
            Opcode::SearchStart => expect_empty(payload, Command::SearchStart),
            Opcode::SearchStop => expect_empty(payload, Command::SearchStop),
            Opcode::DeviceList => expect_empty(payload, Command::DeviceList),
            Opcode::HubStatus => expect_empty(payload, Command::HubStatus),
            Opcode::Enroll => Ok(Command::Enroll {
                device: take_id(payload, 0)?,
            }),
            Opcode::Unenroll => Ok(Command::Unenroll {
                device: take_id(payload, 0)?,
            }),
            Opcode::SetArmed => {
                require_len(payload, DEVICE_ID_LEN + 1, "SetArmed")?;
                Ok(Command::SetArmed {
                    target: ArmTarget::from_wire(id_bytes(payload, 0)),
                    armed: payload[DEVICE_ID_LEN] != 0,
                })
            }
            Opcode::WriteSettings => {
                require_len(payload, DEVICE_ID_LEN, "WriteSettings")?;
                Ok(Command::WriteSettings {
                    device: take_id(payload, 0)?,
                    settings: payload[DEVICE_ID_LEN..].to_vec(),
                })
            }
            other => Err(Error::InvalidMessage(format!(
                "opcode {:#04x} is not a command",
                other.as_u8()
            ))),
        }
    }
}

/// Acknowledgement verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Ok,
    Nak,
}

/// Telemetry carried by one status frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub device: DeviceId,
    /// Raw type code; mapping to the catalogue happens in the engine so an
    /// unknown code stays a diagnostic instead of a decode failure.
    pub type_code: u8,
    pub battery_percent: Option<u8>,
    pub battery_low: bool,
    pub tamper: bool,
    pub link_problem: bool,
    pub armed: ArmedState,
    pub rssi_dbm: Option<i8>,
    pub noise_dbm: Option<i8>,
    /// Raw settings bytes, carried opaquely.
    pub settings: Vec<u8>,
}

/// Message originated by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Response to the in-flight command; `command` echoes its opcode.
    Ack {
        status: AckStatus,
        code: u8,
        command: Opcode,
    },
    /// Periodic or event-driven telemetry for one detector.
    Status(StatusReport),
    /// Alarm condition (motion, smoke, leak, tamper...) with a per-type code.
    Alarm {
        device: DeviceId,
        type_code: u8,
        code: u8,
    },
    /// Discovery announcement from an unenrolled detector.
    Announce {
        device: DeviceId,
        type_code: u8,
        firmware: FirmwareVersion,
        new: bool,
        awaiting_confirm: bool,
    },
    /// Bridge self-report: identity, firmware and radio health.
    HubState {
        code: DeviceId,
        firmware: FirmwareVersion,
        registered: u8,
        online: u8,
        noise_dbm: i8,
        armed: ArmedState,
    },
    /// One row of the paired-device list.
    ListEntry {
        index: u8,
        slot: u8,
        device: DeviceId,
        type_code: u8,
    },
}

impl Event {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Event::Ack { .. } => Opcode::Ack,
            Event::Status(_) => Opcode::Status,
            Event::Alarm { .. } => Opcode::Alarm,
            Event::Announce { .. } => Opcode::Announce,
            Event::HubState { .. } => Opcode::HubState,
            Event::ListEntry { .. } => Opcode::ListEntry,
        }
    }

    /// Serialize into a wire frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::new();
        match self {
            Event::Ack {
                status,
                code,
                command,
            } => {
                payload.put_u8(match status {
                    AckStatus::Ok => 0,
                    AckStatus::Nak => 1,
                });
                payload.put_u8(*code);
                payload.put_u8(command.as_u8());
            }
            Event::Status(report) => {
                payload.put_slice(&report.device.to_wire());
                payload.put_u8(report.type_code);
                payload.put_u8(report.battery_percent.unwrap_or(BATTERY_UNKNOWN));
                let mut flags = 0u8;
                if report.battery_low {
                    flags |= FLAG_BATTERY_LOW;
                }
                if report.tamper {
                    flags |= FLAG_TAMPER;
                }
                if report.link_problem {
                    flags |= FLAG_LINK_PROBLEM;
                }
                payload.put_u8(flags);
                payload.put_u8(armed_to_wire(report.armed));
                payload.put_i8(report.rssi_dbm.unwrap_or(SIGNAL_UNKNOWN));
                payload.put_i8(report.noise_dbm.unwrap_or(SIGNAL_UNKNOWN));
                payload.put_slice(&report.settings);
            }
            Event::Alarm {
                device,
                type_code,
                code,
            } => {
                payload.put_slice(&device.to_wire());
                payload.put_u8(*type_code);
                payload.put_u8(*code);
            }
            Event::Announce {
                device,
                type_code,
                firmware,
                new,
                awaiting_confirm,
            } => {
                payload.put_slice(&device.to_wire());
                payload.put_u8(*type_code);
                payload.put_u8(firmware.major);
                payload.put_u8(firmware.minor);
                let mut flags = 0u8;
                if *new {
                    flags |= FLAG_NEW;
                }
                if *awaiting_confirm {
                    flags |= FLAG_AWAITING_CONFIRM;
                }
                payload.put_u8(flags);
            }
            Event::HubState {
                code,
                firmware,
                registered,
                online,
                noise_dbm,
                armed,
            } => {
                payload.put_slice(&code.to_wire());
                payload.put_u8(firmware.major);
                payload.put_u8(firmware.minor);
                payload.put_u8(*registered);
                payload.put_u8(*online);
                payload.put_i8(*noise_dbm);
                payload.put_u8(armed_to_wire(*armed));
            }
            Event::ListEntry {
                index,
                slot,
                device,
                type_code,
            } => {
                payload.put_u8(*index);
                payload.put_u8(*slot);
                payload.put_slice(&device.to_wire());
                payload.put_u8(*type_code);
            }
        }
        Frame::new(self.opcode().as_u8(), payload.freeze())
            .unwrap_or_else(|_| unreachable!("event payload within frame limit"))
    }

    /// Parse a wire frame as an event.
    ///
    /// # Errors
    /// Returns `Error::UnknownOpcode` for command opcodes and
    /// `Error::InvalidMessage` for malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = Opcode::from_u8(frame.opcode())?;
        let payload = frame.payload();
        match opcode {
            Opcode::Ack => {
                require_len(payload, 3, "Ack")?;
                let status = match payload[0] {
                    0 => AckStatus::Ok,
                    1 => AckStatus::Nak,
                    other => {
                        return Err(Error::InvalidMessage(format!(
                            "invalid ack status {other}"
                        )));
                    }
                };
                Ok(Event::Ack {
                    status,
                    code: payload[1],
                    command: Opcode::from_u8(payload[2])?,
                })
            }
            Opcode::Status => {
                require_len(payload, DEVICE_ID_LEN + 6, "Status")?;
                let flags = payload[5];
                Ok(Event::Status(StatusReport {
                    device: take_id(payload, 0)?,
                    type_code: payload[3],
                    battery_percent: match payload[4] {
                        BATTERY_UNKNOWN => None,
                        value => Some(value),
                    },
                    battery_low: flags & FLAG_BATTERY_LOW != 0,
                    tamper: flags & FLAG_TAMPER != 0,
                    link_problem: flags & FLAG_LINK_PROBLEM != 0,
                    armed: armed_from_wire(payload[6])?,
                    rssi_dbm: signal_from_wire(payload[7] as i8),
                    noise_dbm: signal_from_wire(payload[8] as i8),
                    settings: payload[9..].to_vec(),
                }))
            }
            Opcode::Alarm => {
                require_len(payload, DEVICE_ID_LEN + 2, "Alarm")?;
                Ok(Event::Alarm {
                    device: take_id(payload, 0)?,
                    type_code: payload[3],
                    code: payload[4],
                })
            }
            Opcode::Announce => {
                require_len(payload, DEVICE_ID_LEN + 4, "Announce")?;
                let flags = payload[6];
                Ok(Event::Announce {
                    device: take_id(payload, 0)?,
                    type_code: payload[3],
                    firmware: FirmwareVersion {
                        major: payload[4],
                        minor: payload[5],
                    },
                    new: flags & FLAG_NEW != 0,
                    awaiting_confirm: flags & FLAG_AWAITING_CONFIRM != 0,
                })
            }
            Opcode::HubState => {
                require_len(payload, DEVICE_ID_LEN + 6, "HubState")?;
                Ok(Event::HubState {
                    code: take_id(payload, 0)?,
                    firmware: FirmwareVersion {
                        major: payload[3],
                        minor: payload[4],
                    },
                    registered: payload[5],
                    online: payload[6],
                    noise_dbm: payload[7] as i8,
                    armed: armed_from_wire(payload[8])?,
                })
            }
            Opcode::ListEntry => {
                require_len(payload, DEVICE_ID_LEN + 3, "ListEntry")?;
                Ok(Event::ListEntry {
                    index: payload[0],
                    slot: payload[1],
                    device: take_id(payload, 2)?,
                    type_code: payload[5],
                })
            }
            other => Err(Error::InvalidMessage(format!(
                "opcode {:#04x} is not an event",
                other.as_u8()
            ))),
        }
    }
}

fn armed_to_wire(state: ArmedState) -> u8 {
    match state {
        ArmedState::Disarmed => 0,
        ArmedState::Armed => 1,
        ArmedState::Unknown => 2,
    }
}

fn armed_from_wire(value: u8) -> Result<ArmedState> {
    match value {
        0 => Ok(ArmedState::Disarmed),
        1 => Ok(ArmedState::Armed),
        2 => Ok(ArmedState::Unknown),
        other => Err(Error::InvalidMessage(format!(
            "invalid armed state {other}"
        ))),
    }
}

fn signal_from_wire(value: i8) -> Option<i8> {
    if value == SIGNAL_UNKNOWN {
        None
    } else {
        Some(value)
    }
}

fn require_len(payload: &[u8], min: usize, what: &str) -> Result<()> {
    if payload.len() < min {
        return Err(Error::InvalidMessage(format!(
            "{what} payload needs at least {min} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

fn id_bytes(payload: &[u8], offset: usize) -> [u8; DEVICE_ID_LEN] {
    [payload[offset], payload[offset + 1], payload[offset + 2]]
}

fn take_id(payload: &[u8], offset: usize) -> Result<DeviceId> {
    require_len(payload, offset + DEVICE_ID_LEN, "device id")?;
    Ok(DeviceId::from_wire(id_bytes(payload, offset)))
}

fn expect_empty(payload: &[u8], command: Command) -> Result<Command> {
    if payload.is_empty() {
        Ok(command)
    } else {
        Err(Error::InvalidMessage(format!(
            "{:?} carries no payload, got {} bytes",
            command,
            payload.len()
        )))
    }
}
