//! Byte-level wire frame for the uartBridge protocol.
//!
//! # Wire Format
//!
//! ```text
//! +------+-----+--------+----------------+----------+
//! | 0xAA | LEN | OPCODE | PAYLOAD (LEN)  | CHECKSUM |
//! +------+-----+--------+----------------+----------+
//! ```
//!
//! - `LEN` counts payload bytes only (the opcode is not included).
//! - `CHECKSUM` is the XOR fold of `LEN`, `OPCODE` and every payload byte.
//!
//! [`Frame::decode`] is a pure function over a byte window: it never blocks,
//! never consumes input, and never panics on malformed bytes. Corrupted
//! frames are an expected operating condition on a raw serial link, so every
//! malformed input maps to a representable [`DecodeOutcome::Invalid`] value
//! carrying the offending byte offset, which the stream layer uses to
//! resynchronize.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use ajaxbridge_core::{Error, Result, constants::*};

/// One frame of the uartBridge wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw opcode byte. Interpretation lives in [`crate::message`].
    opcode: u8,

    /// Payload bytes between the opcode and the checksum.
    payload: Bytes,
}

/// Result of attempting to decode one frame from a byte window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete, checksum-valid frame. `consumed` is the total number of
    /// window bytes it occupied, including framing overhead.
    Frame { frame: Frame, consumed: usize },

    /// The window may contain a valid frame prefix but is too short to tell.
    NeedMoreData,

    /// The window cannot start a valid frame. `offset` is the byte that
    /// proved it: 0 for a missing start marker, the checksum position for a
    /// checksum mismatch.
    Invalid { offset: usize },
}

impl Frame {
    /// Create a frame with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidMessage` if the payload exceeds the u8 length
    /// field.
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidMessage(format!(
                "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN}-byte frame limit",
                payload.len()
            )));
        }
        Ok(Frame { opcode, payload })
    }

    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total encoded size of this frame, framing overhead included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len() as u8;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(START_BYTE);
        buf.put_u8(len);
        buf.put_u8(self.opcode);
        buf.put_slice(&self.payload);
        buf.put_u8(checksum(len, self.opcode, &self.payload));
        buf.freeze()
    }

    /// Try to decode one frame from the start of `window`.
    ///
    /// The window is never consumed; on success the caller advances it by
    /// `consumed` bytes, on [`DecodeOutcome::Invalid`] the caller decides the
    /// recovery policy (the transport session drops exactly one byte and
    /// retries).
    #[must_use]
    pub fn decode(window: &[u8]) -> DecodeOutcome {
        if window.is_empty() {
            return DecodeOutcome::NeedMoreData;
        }
        if window[0] != START_BYTE {
            return DecodeOutcome::Invalid { offset: 0 };
        }
        if window.len() < 3 {
            return DecodeOutcome::NeedMoreData;
        }

        let len = window[1];
        let total = usize::from(len) + FRAME_OVERHEAD;
        if window.len() < total {
            return DecodeOutcome::NeedMoreData;
        }

        let opcode = window[2];
        let payload = &window[3..total - 1];
        let expected = checksum(len, opcode, payload);
        let actual = window[total - 1];
        if expected != actual {
            return DecodeOutcome::Invalid { offset: total - 1 };
        }

        DecodeOutcome::Frame {
            frame: Frame {
                opcode,
                payload: Bytes::copy_from_slice(payload),
            },
            consumed: total,
        }
    }
}

/// XOR checksum over the length byte, opcode and payload.
#[must_use]
pub fn checksum(len: u8, opcode: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(len ^ opcode, |acc, &b| acc ^ b)
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex: String = self
            .payload
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        write!(
            f,
            "Frame[opcode={:#04x}, len={}, payload='{}']",
            self.opcode,
            self.payload.len(),
            hex
        )
    }
}
