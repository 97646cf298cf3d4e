//! The seam through which the engine obtains its byte stream.
//!
//! A hub session does not own a port, it owns a [`Connector`]: something it
//! can ask for a fresh stream at startup and again after every link loss.
//! Production uses [`SerialConnector`]; tests hand the engine one side of a
//! `tokio::io::duplex` pipe and keep the other for the emulated bridge.

use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use ajaxbridge_core::{Error, Result};

use crate::serial::{SerialConfig, SerialIo};

/// Factory for the byte stream of one hub.
///
/// The returned future is `Send` because hub sessions run on spawned tasks.
pub trait Connector: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish a fresh stream. Called once at session start and after
    /// every link loss before a reconnect attempt.
    fn connect(&mut self) -> impl Future<Output = Result<Self::Io>> + Send;

    /// Human-readable endpoint description for logs and hub identity.
    fn describe(&self) -> String;
}

/// Opens the configured serial port on every connect.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Connector for SerialConnector {
    type Io = SerialIo;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Io>> + Send {
        let config = self.config.clone();
        async move {
            // Port opening is a blocking syscall sequence.
            tokio::task::spawn_blocking(move || SerialIo::open(&config))
                .await
                .map_err(|e| Error::Serial(format!("open task failed: {e}")))?
        }
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.config.path, self.config.baud_rate)
    }
}
