//! Server error taxonomy
//!
//! Most I/O faults stay local: a connection-level error closes that
//! connection, not the server. [`Error::Shutdown`] is the cooperative
//! shutdown sentinel — returning it from any reactor callback unwinds the
//! polling loop and starts the stop sequence.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Cooperative shutdown sentinel, not a fault.
    #[error("server is shutting down")]
    Shutdown,

    /// The address scheme is not one of tcp/udp/unix (with 4/6 variants).
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Read from an empty ring buffer.
    #[error("ring buffer is empty")]
    RingEmpty,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
