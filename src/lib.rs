//! Blocking sessions to laboratory instruments over serial, GPIB (through a Prologix controller),
//! a Prologix GPIB-USB adapter, or USBTMC, plus a driver for the Yokogawa 7651 programmable DC
//! source.
//!
//! ```no_run
//! use std::time::Duration;
//! use labvisa::{Instrument, ResourceKind, yokogawa7651::{VoltageRange, Yokogawa7651}};
//!
//! let mut source = Yokogawa7651::open("PROLOGIX::/dev/ttyUSB0::1", ResourceKind::GpibUsbAdapter)?;
//! source.initialize()?;
//! source.set_voltage_mode(VoltageRange::V10, 20.0)?;
//! source.sweep(0.0, 3.0, 0.5, Duration::from_millis(200))?;
//! source.close()?;
//! # Ok::<(), labvisa::Error>(())
//! ```

use std::time::Duration;

pub mod config;
pub mod instrument;
pub mod resource;
pub mod session;
pub mod transport;
pub mod yokogawa7651;

pub use config::SessionConfig;
pub use instrument::Instrument;
pub use resource::{Resource, ResourceKind};
pub use session::Session;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not open `{resource}`: {source}")]
    Connection {
        resource: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("{operation} is not allowed: {reason}")]
    State {
        operation: &'static str,
        reason: &'static str,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid resource address `{0}`")]
    InvalidAddress(String),
    #[error("Invalid configuration")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn connection(
        resource: impl ToString,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            resource: resource.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            operation: operation.into(),
            source,
        }
    }

    /// The error returned for any transfer attempted on a released session
    pub(crate) fn closed(operation: impl Into<String>) -> Self {
        Error::io(
            operation,
            std::io::Error::new(std::io::ErrorKind::NotConnected, "session is closed"),
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Attribute a transport error to the caller-level operation that hit it
    pub(crate) fn during(self, operation: &str) -> Self {
        match self {
            Error::Io { source, .. } => Error::io(operation, source),
            Error::Timeout { timeout, .. } => Error::timeout(operation, timeout),
            other => other,
        }
    }

    /// Whether this error came from a transfer that never completed in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
