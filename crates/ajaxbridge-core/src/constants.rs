//! Protocol and timing constants for the uartBridge engine.
//!
//! The byte-level values stand in for the hardware contract until they are
//! confirmed against captured traffic; everything that depends on them lives
//! behind the frame codec so a correction stays local to `ajaxbridge-protocol`.
//!
//! # Frame Layout
//!
//! ```text
//! +------+-----+--------+----------------+----------+
//! | 0xAA | LEN | OPCODE | PAYLOAD (LEN)  | CHECKSUM |
//! +------+-----+--------+----------------+----------+
//! ```
//!
//! `LEN` counts payload bytes only. `CHECKSUM` is the XOR fold of `LEN`,
//! `OPCODE` and every payload byte.

// ============================================================================
// Message Framing
// ============================================================================

/// Frame start marker.
///
/// Every frame on the wire begins with this byte. The transport layer scans
/// for it when resynchronizing after corruption.
pub const START_BYTE: u8 = 0xAA;

/// Fixed framing overhead in bytes: start marker, length, opcode, checksum.
pub const FRAME_OVERHEAD: usize = 4;

/// Smallest possible frame: zero-length payload plus overhead.
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD;

/// Maximum payload length representable by the u8 length field.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Largest possible encoded frame. The stream accumulator never buffers
/// more than one incomplete frame, so this also bounds its memory.
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + FRAME_OVERHEAD;

// ============================================================================
// Device Identification
// ============================================================================

/// Width of a vendor device id on the wire, in bytes (24-bit id).
pub const DEVICE_ID_LEN: usize = 3;

/// Largest valid vendor device id (24 bits).
pub const MAX_DEVICE_ID: u32 = 0x00FF_FFFF;

/// Id reported by bridge firmware for devices it does not recognize.
pub const PLACEHOLDER_DEVICE_ID: u32 = 0x00FF_FFFF;

// ============================================================================
// Serial Configuration
// ============================================================================

/// Default baud rate of the uartBridge serial link.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

// ============================================================================
// Timeout Configuration
// ============================================================================

/// Default window for a command to be acknowledged (milliseconds).
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3_000;

/// Default idle-link threshold while a command is outstanding (milliseconds).
///
/// The bridge emits telemetry continuously under normal operation; total
/// silence for this long with an unacknowledged command on the wire is
/// treated as a dead link.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;

/// Default overall pairing window (seconds).
pub const DEFAULT_PAIRING_WINDOW_SECS: u64 = 60;

/// Retries granted to idempotent commands on timeout.
pub const IDEMPOTENT_RETRY_LIMIT: u32 = 2;

/// Initial delay before a reconnect attempt (milliseconds).
pub const RECONNECT_BACKOFF_INITIAL_MS: u64 = 1_000;

/// Ceiling for the exponential reconnect backoff (milliseconds).
pub const RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;

// ============================================================================
// Acknowledgement Codes
// ============================================================================

/// Ack detail code: no further detail.
pub const ACK_CODE_NONE: u8 = 0;

/// Ack detail code: bridge busy with another engineering operation.
pub const ACK_CODE_BUSY: u8 = 2;
