//! Async adapter over a blocking serial port handle.
//!
//! `serialport` exposes blocking reads and writes; the engine needs tokio
//! `AsyncRead + AsyncWrite`. [`SerialIo`] bridges the two with a pair of
//! I/O threads: the reader thread pumps port bytes into a channel, the
//! writer thread drains a channel into the port. Both threads exit when
//! their channel closes or the port errors, which surfaces to the async side
//! as EOF / broken pipe and from there as a link-loss transition.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use ajaxbridge_core::{Error, Result, constants::DEFAULT_BAUD_RATE};

/// How long a blocking read waits before checking for shutdown.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Read chunk size; a full telemetry burst fits comfortably.
const READ_CHUNK: usize = 256;

/// Operator-facing serial configuration for one hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub path: String,
    /// Line rate; the uartBridge ships at 57600.
    pub baud_rate: u32,
}

impl SerialConfig {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// Tokio-compatible handle over an open serial port.
#[derive(Debug)]
pub struct SerialIo {
    incoming: mpsc::Receiver<io::Result<Bytes>>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    /// Bytes received but not yet handed to the reader.
    pending: Bytes,
}

impl SerialIo {
    /// Open the configured port and spawn its I/O threads.
    ///
    /// Blocking call; run it inside `spawn_blocking` from async contexts
    /// (the [`SerialConnector`](crate::connector::SerialConnector) does).
    ///
    /// # Errors
    /// Returns `Error::Serial` if the port cannot be opened or cloned.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(path = %config.path, baud = config.baud_rate, "opening serial port");

        let port = serialport::new(&config.path, config.baud_rate)
            .timeout(READ_POLL_INTERVAL)
            .open()
            .map_err(|e| Error::Serial(format!("{}: {e}", config.path)))?;
        let writer_port = port
            .try_clone()
            .map_err(|e| Error::Serial(format!("{}: {e}", config.path)))?;

        let (incoming_tx, incoming) = mpsc::channel(32);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let read_path = config.path.clone();
        std::thread::Builder::new()
            .name(format!("serial-read {}", config.path))
            .spawn(move || read_loop(port, incoming_tx, &read_path))
            .map_err(Error::Io)?;

        let write_path = config.path.clone();
        std::thread::Builder::new()
            .name(format!("serial-write {}", config.path))
            .spawn(move || write_loop(writer_port, outgoing_rx, &write_path))
            .map_err(Error::Io)?;

        Ok(Self {
            incoming,
            outgoing,
            pending: Bytes::new(),
        })
    }

    /// Build from raw channel halves. Test seam for exercising the poll
    /// logic without hardware.
    #[cfg(test)]
    fn from_channels(
        incoming: mpsc::Receiver<io::Result<Bytes>>,
        outgoing: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            incoming,
            outgoing,
            pending: Bytes::new(),
        }
    }
}

fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    path: &str,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match port.read(&mut buf) {
            Ok(0) => {
                // Port detached; closing the channel reads as EOF.
                warn!(path, "serial port returned EOF");
                return;
            }
            Ok(n) => {
                trace!(path, bytes = n, "serial read");
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return; // consumer gone, session closed
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if tx.is_closed() {
                    return;
                }
            }
            Err(e) => {
                warn!(path, error = %e, "serial read failed");
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

fn write_loop(
    mut port: Box<dyn serialport::SerialPort>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    path: &str,
) {
    while let Some(bytes) = rx.blocking_recv() {
        trace!(path, bytes = bytes.len(), "serial write");
        if let Err(e) = port.write_all(&bytes).and_then(|()| port.flush()) {
            warn!(path, error = %e, "serial write failed");
            return;
        }
    }
}

impl AsyncRead for SerialIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.pending = bytes,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                // Channel closed: reader thread exited, report EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let take = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending.split_to(take));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SerialIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Unbounded is safe here: the correlator keeps at most one command
        // frame in flight, so queued output is bounded by a frame.
        if self.outgoing.send(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "serial writer thread exited",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer thread flushes after every chunk.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_config_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);

        let config = SerialConfig::new("/dev/ttyUSB0").with_baud_rate(115_200);
        assert_eq!(config.baud_rate, 115_200);
    }

    #[tokio::test]
    async fn test_read_delivers_channel_bytes() {
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut io = SerialIo::from_channels(rx, out_tx);

        tx.send(Ok(Bytes::from_static(b"\xAA\x00"))).await.unwrap();

        let mut buf = [0u8; 16];
        let n = io.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\xAA\x00");
    }

    #[tokio::test]
    async fn test_read_smaller_than_chunk_keeps_remainder() {
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut io = SerialIo::from_channels(rx, out_tx);

        tx.send(Ok(Bytes::from_static(b"abcdef"))).await.unwrap();

        let mut buf = [0u8; 4];
        let n = io.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");

        let n = io.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_closed_channel_reads_as_eof() {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut io = SerialIo::from_channels(rx, out_tx);
        drop(tx);

        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut io = SerialIo::from_channels(rx, out_tx);

        tx.send(Err(io::Error::other("line noise"))).await.unwrap();

        let mut buf = [0u8; 4];
        assert!(io.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_write_lands_on_channel() {
        let (_tx, rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut io = SerialIo::from_channels(rx, out_tx);

        io.write_all(b"\xAA\x01\x01\x00").await.unwrap();
        io.flush().await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap(), Bytes::from_static(b"\xAA\x01\x01\x00"));
    }

    #[tokio::test]
    async fn test_write_after_writer_exit_is_broken_pipe() {
        let (_tx, rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let mut io = SerialIo::from_channels(rx, out_tx);
        drop(out_rx);

        let err = io.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
