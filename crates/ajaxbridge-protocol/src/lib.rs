//! Wire protocol for the uartBridge serial link.
//!
//! This crate owns everything byte-shaped: the framed wire format with its
//! checksum, the typed command and event messages carried inside frames, the
//! stream accumulator that recovers frame boundaries from a raw serial byte
//! stream, and the Tokio codec that ties them together.
//!
//! The byte-level table here stands in for the hardware contract until it is
//! validated against captured traffic; nothing outside this crate depends on
//! the concrete layout.

pub mod codec;
pub mod frame;
pub mod message;
pub mod stream;

pub use codec::{BridgeCodec, BridgeSideCodec};
pub use frame::{DecodeOutcome, Frame};
pub use message::{AckStatus, ArmTarget, Command, Event, Opcode, StatusReport};
pub use stream::FrameAccumulator;
