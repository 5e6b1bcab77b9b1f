//! Link layer between port sessions and the operating system
//!
//! Sessions only see [`SerialLink`] and [`LinkOpener`]; the real
//! implementation sits on the `serialport` crate, and a scripted one stands
//! in for instruments during tests and bench work.

pub mod scripted;
mod serial;

pub use serial::{available_ports, PortListing, SerialPortLink, SerialPortOpener};

use super::port::PortConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Category of a session-fatal connection fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Device unplugged or driver error
    LinkLost,
    /// Port already open elsewhere
    PermissionDenied,
    /// No such port on this host
    PortNotFound,
    /// Bytes cannot be read under the configured encoding
    DecodingError,
    /// Sentence rejected under a fault-on-error rule
    MalformedSentence,
    /// Driver rejected the line settings
    InvalidSettings,
}

impl FaultKind {
    /// Operator hint for the fault
    pub fn hint(&self) -> &'static str {
        match self {
            Self::LinkLost => "Port Lost > The instrument was disconnected",
            Self::PermissionDenied => "Port Already Open > The port is open in another program",
            Self::PortNotFound => "Inactive Port > Please select a different port",
            Self::DecodingError => "Decoding Error > Check the instrument's character encoding",
            Self::MalformedSentence => "Parsing Error > Sentence does not match the parsing rule",
            Self::InvalidSettings => "Unsupported Settings > Check baud rate and line settings",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkLost => write!(f, "link lost"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::PortNotFound => write!(f, "port not found"),
            Self::DecodingError => write!(f, "decoding error"),
            Self::MalformedSentence => write!(f, "malformed sentence"),
            Self::InvalidSettings => write!(f, "invalid settings"),
        }
    }
}

/// Fault that ends a port session
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{port}: {kind}: {detail}")]
pub struct ConnectionFault {
    /// Fault category
    pub kind: FaultKind,
    /// Port the fault occurred on
    pub port: String,
    /// Human-readable detail
    pub detail: String,
}

impl ConnectionFault {
    /// Create a fault
    pub fn new(kind: FaultKind, port: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            port: port.to_string(),
            detail: detail.into(),
        }
    }

    /// Classify an I/O error raised while reading an open port
    pub fn from_io(port: &str, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => FaultKind::PortNotFound,
            io::ErrorKind::PermissionDenied => FaultKind::PermissionDenied,
            io::ErrorKind::InvalidInput => FaultKind::InvalidSettings,
            _ => FaultKind::LinkLost,
        };
        Self::new(kind, port, err.to_string())
    }

    /// One operator-facing line: `Error: COM3 > detail > hint`
    pub fn diagnostic_line(&self) -> String {
        format!("Error: {} > {} > {}", self.port, self.detail, self.kind.hint())
    }
}

/// An open, exclusively owned instrument connection
pub trait SerialLink: Send {
    /// Block up to the open timeout for data.
    ///
    /// `Err` with [`io::ErrorKind::TimedOut`] means nothing arrived.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bytes queued by the OS and not yet read
    fn bytes_to_read(&self) -> io::Result<u32>;

    /// Discard the OS input queue
    fn clear_input(&self) -> io::Result<()>;
}

/// Opens links for port sessions
pub trait LinkOpener: Send + Sync {
    /// Open `config`'s port with the given read timeout
    fn open(&self, config: &PortConfig, timeout: Duration)
        -> Result<Box<dyn SerialLink>, ConnectionFault>;
}
