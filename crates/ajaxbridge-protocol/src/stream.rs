//! Stream accumulator recovering frame boundaries from raw serial bytes.
//!
//! A serial read can deliver anything: part of a frame, several frames, or
//! noise from a power-cycling peripheral. [`FrameAccumulator`] buffers
//! incoming bytes and extracts complete, checksum-valid frames:
//!
//! - decode is attempted at the buffer start;
//! - on success the consumed bytes are dropped and the frame is queued;
//! - on an invalid prefix exactly one byte is dropped and decode retries,
//!   which eventually realigns on the next start marker;
//! - on insufficient data extraction stops until the next feed.
//!
//! Dropped bytes are counted, not silently discarded, so the session can
//! report persistent corruption. Buffering is structurally bounded: after
//! extraction the buffer always holds less than one maximum-length frame,
//! so even a stream of pure noise cannot grow it.

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;

use crate::frame::{DecodeOutcome, Frame};

/// Initial capacity for the byte buffer; a serial read burst fits without
/// reallocation.
const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Initial capacity for the queue of extracted frames.
const INITIAL_FRAME_QUEUE_CAPACITY: usize = 4;

/// Stateful frame-boundary recovery for one serial link.
#[derive(Debug)]
pub struct FrameAccumulator {
    /// Bytes received but not yet consumed by a decode.
    buffer: BytesMut,

    /// Complete frames ready for extraction.
    frames: VecDeque<Frame>,

    /// Bytes dropped during resynchronization since creation.
    discarded: u64,
}

impl FrameAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            frames: VecDeque::with_capacity(INITIAL_FRAME_QUEUE_CAPACITY),
            discarded: 0,
        }
    }

    /// Append newly read bytes and extract every complete frame they enable.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.extract();
    }

    /// Take the next complete frame, if one is ready.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Number of complete frames ready for extraction.
    #[must_use]
    pub fn frames_available(&self) -> usize {
        self.frames.len()
    }

    /// Bytes dropped during resynchronization since creation.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Bytes buffered awaiting a complete frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard all buffered bytes and queued frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.frames.clear();
    }

    fn extract(&mut self) {
        loop {
            match Frame::decode(&self.buffer) {
                DecodeOutcome::Frame { frame, consumed } => {
                    self.buffer.advance(consumed);
                    self.frames.push_back(frame);
                }
                DecodeOutcome::NeedMoreData => return,
                DecodeOutcome::Invalid { .. } => {
                    // Drop exactly one byte and retry; scanning resumes at
                    // the next start marker.
                    self.buffer.advance(1);
                    self.discarded += 1;
                }
            }
        }
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ajaxbridge_core::constants::START_BYTE;

    fn frame(opcode: u8, payload: &[u8]) -> Frame {
        Frame::new(opcode, payload.to_vec()).unwrap()
    }

    #[test]
    fn test_complete_frame_single_feed() {
        let mut acc = FrameAccumulator::new();
        acc.feed(&frame(0x82, &[1, 2, 3]).encode());

        assert_eq!(acc.frames_available(), 1);
        assert_eq!(acc.next_frame().unwrap().payload(), &[1, 2, 3]);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_across_feeds() {
        let mut acc = FrameAccumulator::new();
        let bytes = frame(0x82, &[1, 2, 3]).encode();

        acc.feed(&bytes[..2]);
        assert!(acc.next_frame().is_none());

        acc.feed(&bytes[2..5]);
        assert!(acc.next_frame().is_none());

        acc.feed(&bytes[5..]);
        assert_eq!(acc.frames_available(), 1);
    }

    #[test]
    fn test_byte_by_byte_feeding() {
        let mut acc = FrameAccumulator::new();
        for &byte in frame(0x81, &[0, 0, 0x03]).encode().iter() {
            acc.feed(&[byte]);
        }
        assert_eq!(acc.frames_available(), 1);
        assert_eq!(acc.discarded(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_feed() {
        let mut acc = FrameAccumulator::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&frame(0x82, &[1]).encode());
        bytes.extend_from_slice(&frame(0x83, &[2]).encode());
        acc.feed(&bytes);

        assert_eq!(acc.frames_available(), 2);
        assert_eq!(acc.next_frame().unwrap().opcode(), 0x82);
        assert_eq!(acc.next_frame().unwrap().opcode(), 0x83);
    }

    #[test]
    fn test_garbage_before_frame_discarded() {
        let mut acc = FrameAccumulator::new();
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend_from_slice(&frame(0x82, &[1]).encode());
        acc.feed(&bytes);

        assert_eq!(acc.frames_available(), 1);
        assert_eq!(acc.discarded(), 3);
    }

    #[test]
    fn test_resynchronization_after_corrupted_frame() {
        // A corrupted frame followed by N valid frames yields exactly the N
        // valid frames, in order, and never the corrupted one.
        let mut corrupted = BytesMut::from(&frame(0x82, &[1, 2, 3]).encode()[..]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;

        let valid: Vec<Frame> = (0u8..5)
            .map(|i| frame(0x82, &[i, i + 1]))
            .collect();

        let mut bytes = corrupted.to_vec();
        for valid_frame in &valid {
            bytes.extend_from_slice(&valid_frame.encode());
        }

        let mut acc = FrameAccumulator::new();
        acc.feed(&bytes);

        let extracted: Vec<Frame> = std::iter::from_fn(|| acc.next_frame()).collect();
        assert_eq!(extracted, valid);
        assert!(acc.discarded() > 0);
    }

    #[test]
    fn test_start_byte_inside_payload_is_not_a_boundary() {
        // A payload may legitimately contain the start marker; length-based
        // framing must not split on it.
        let tricky = frame(0x82, &[START_BYTE, 0x01, START_BYTE]);
        let follow = frame(0x83, &[7]);

        let mut acc = FrameAccumulator::new();
        acc.feed(&tricky.encode());
        acc.feed(&follow.encode());

        assert_eq!(acc.next_frame().unwrap(), tricky);
        assert_eq!(acc.next_frame().unwrap(), follow);
        assert_eq!(acc.discarded(), 0);
    }

    #[test]
    fn test_junk_flood_stays_bounded() {
        let mut acc = FrameAccumulator::new();
        // A start marker claiming a long frame, then kilobytes of noise.
        acc.feed(&[START_BYTE, 0xFF]);
        let junk = vec![0x55u8; 4 * 1024];
        for _ in 0..5 {
            acc.feed(&junk);
        }

        assert_eq!(acc.frames_available(), 0);
        // Resynchronization drains noise as it arrives; the buffer never
        // holds more than one maximum-length frame prefix.
        assert!(acc.buffered() < 260);

        // And the accumulator keeps working afterwards.
        acc.feed(&frame(0x82, &[1]).encode());
        assert_eq!(acc.frames_available(), 1);
    }

    #[test]
    fn test_clear_resets() {
        let mut acc = FrameAccumulator::new();
        acc.feed(&frame(0x82, &[1]).encode());
        acc.feed(&[START_BYTE]);
        acc.clear();

        assert_eq!(acc.frames_available(), 0);
        assert_eq!(acc.buffered(), 0);
    }
}
