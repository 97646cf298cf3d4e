//! Serial transport for the uartBridge engine.
//!
//! The engine is written against any `AsyncRead + AsyncWrite` byte stream;
//! this crate supplies the real one. [`serial::SerialIo`] adapts a blocking
//! `serialport` handle to tokio async I/O, and [`connector::Connector`] is
//! the seam through which the engine obtains (and re-obtains, after link
//! loss) its stream: hardware in production, an in-memory duplex pipe in
//! tests.

pub mod connector;
pub mod serial;

pub use connector::{Connector, SerialConnector};
pub use serial::{SerialConfig, SerialIo};
