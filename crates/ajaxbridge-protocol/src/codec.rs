//! Tokio codec integrating the uartBridge protocol with async I/O.
//!
//! `BridgeCodec` wraps the [`FrameAccumulator`] so the serial stream can be
//! driven through `tokio_util::codec::Framed`:
//!
//! ```text
//! serial bytes -> Decoder -> Event (typed)
//! Command (typed) -> Encoder -> serial bytes (framed + checksummed)
//! ```
//!
//! A decode error is per-item, not fatal: `Framed` yields the error and the
//! accumulator keeps its alignment, so the session can log a bad frame and
//! continue with the next one.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use ajaxbridge_core::{Error, Result};

use crate::{
    message::{Command, Event},
    stream::FrameAccumulator,
};

/// Codec turning raw serial bytes into [`Event`]s and [`Command`]s into
/// wire frames.
#[derive(Debug, Default)]
pub struct BridgeCodec {
    accumulator: FrameAccumulator,
}

impl BridgeCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accumulator: FrameAccumulator::new(),
        }
    }

    /// Bytes dropped during resynchronization since creation.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.accumulator.discarded()
    }
}

impl Decoder for BridgeCodec {
    type Item = Event;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !src.is_empty() {
            // The accumulator owns buffering and resynchronization; the
            // Framed read buffer is drained wholesale.
            self.accumulator.feed(src);
            src.clear();
        }

        match self.accumulator.next_frame() {
            Some(frame) => Event::from_frame(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for BridgeCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_frame().encode());
        Ok(())
    }
}

/// Mirror codec for the bridge side of the link: decodes [`Command`]s and
/// encodes [`Event`]s. Used by emulated bridges in tests.
#[derive(Debug, Default)]
pub struct BridgeSideCodec {
    accumulator: FrameAccumulator,
}

impl BridgeSideCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accumulator: FrameAccumulator::new(),
        }
    }
}

impl Decoder for BridgeSideCodec {
    type Item = Command;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !src.is_empty() {
            self.accumulator.feed(src);
            src.clear();
        }

        match self.accumulator.next_frame() {
            Some(frame) => Command::from_frame(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Event> for BridgeSideCodec {
    type Error = Error;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_frame().encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DecodeOutcome, Frame};
    use crate::message::{AckStatus, Opcode};
    use ajaxbridge_core::DeviceId;

    fn ack() -> Event {
        Event::Ack {
            status: AckStatus::Ok,
            code: 0,
            command: Opcode::Enroll,
        }
    }

    #[test]
    fn test_decode_complete_event() {
        let mut codec = BridgeCodec::new();
        let mut buffer = BytesMut::from(&ack().to_frame().encode()[..]);

        let decoded = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded, Some(ack()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = BridgeCodec::new();
        let bytes = ack().to_frame().encode();

        let mut first = BytesMut::from(&bytes[..3]);
        assert_eq!(codec.decode(&mut first).unwrap(), None);

        let mut rest = BytesMut::from(&bytes[3..]);
        assert_eq!(codec.decode(&mut rest).unwrap(), Some(ack()));
    }

    #[test]
    fn test_decode_multiple_events_in_buffer() {
        let mut codec = BridgeCodec::new();
        let alarm = Event::Alarm {
            device: DeviceId::new(0xABCD).unwrap(),
            type_code: 1,
            code: 0x10,
        };
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&ack().to_frame().encode());
        buffer.extend_from_slice(&alarm.to_frame().encode());

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(ack()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(alarm));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = BridgeCodec::new();
        let mut buffer = BytesMut::new();
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_unknown_opcode_is_per_item_error() {
        let mut codec = BridgeCodec::new();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&Frame::new(0x7F, vec![]).unwrap().encode());
        buffer.extend_from_slice(&ack().to_frame().encode());

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(Error::UnknownOpcode(0x7F))
        ));
        // The stream survives: the next frame decodes normally.
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(ack()));
    }

    #[test]
    fn test_encode_command() {
        let mut codec = BridgeCodec::new();
        let mut buffer = BytesMut::new();
        let command = Command::Enroll {
            device: DeviceId::new(0xABCD).unwrap(),
        };
        codec.encode(command.clone(), &mut buffer).unwrap();

        let frame = match Frame::decode(&buffer) {
            DecodeOutcome::Frame { frame, .. } => frame,
            other => panic!("expected frame, got {other:?}"),
        };
        assert_eq!(Command::from_frame(&frame).unwrap(), command);
    }

    #[test]
    fn test_bridge_side_mirror() {
        let mut host = BridgeCodec::new();
        let mut bridge = BridgeSideCodec::new();

        // Host encodes a command, bridge decodes it.
        let command = Command::SearchStart;
        let mut wire = BytesMut::new();
        host.encode(command.clone(), &mut wire).unwrap();
        assert_eq!(bridge.decode(&mut wire).unwrap(), Some(command));

        // Bridge encodes an event, host decodes it.
        let mut wire = BytesMut::new();
        bridge.encode(ack(), &mut wire).unwrap();
        assert_eq!(host.decode(&mut wire).unwrap(), Some(ack()));
    }

    #[test]
    fn test_corruption_recovery_through_codec() {
        let mut codec = BridgeCodec::new();
        let mut bytes = ack().to_frame().encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // corrupt the checksum
        bytes.extend_from_slice(&ack().to_frame().encode());

        let mut buffer = BytesMut::from(&bytes[..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(ack()));
        assert!(codec.discarded() > 0);
    }
}
