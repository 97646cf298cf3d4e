use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("invalid frame data at byte offset {offset}")]
    Frame { offset: usize },

    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    // Link errors
    #[error("link lost: {0}")]
    LinkLost(String),

    #[error("no response within {timeout_ms} ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    // Pairing errors
    #[error("pairing window elapsed without resolution")]
    PairingTimeout,

    #[error("pairing rejected: {reason}")]
    PairingRejected { reason: String },

    #[error("a conflicting operation is already in progress")]
    DuplicateOperation,

    #[error("bridge is busy, retry later")]
    Busy,

    // Registry errors
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown hub")]
    UnknownHub,

    #[error("device does not support {capability}")]
    UnsupportedCapability { capability: &'static str },

    #[error("device settings have not been observed yet")]
    SettingsUnknown,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(String),
}

pub type Result<T> = std::result::Result<T, Error>;
