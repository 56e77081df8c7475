//! Byte transports behind a [`Session`](crate::Session).
//!
//! A [`Backend`] turns a [`Resource`] into an open [`Transport`]. [`SystemBackend`] drives real
//! hardware; [`mock::MockBackend`] records traffic in memory.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::resource::Resource;
use crate::{Error, Result};

pub mod mock;
pub mod prologix;
pub mod serial;
pub mod usbtmc;

/// An open, message-oriented channel to one instrument
pub trait Transport: Send {
    /// Write one complete message, terminator included
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read one complete message with the transport's framing removed
    fn read(&mut self) -> Result<Vec<u8>>;

    /// Release the underlying resource
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens transports for resources
pub trait Backend {
    fn open(&self, resource: &Resource, config: &SessionConfig) -> Result<Box<dyn Transport>>;
}

/// The backend for physically attached instruments
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBackend;

impl Backend for SystemBackend {
    fn open(&self, resource: &Resource, config: &SessionConfig) -> Result<Box<dyn Transport>> {
        match resource {
            Resource::Serial { port } => Ok(Box::new(serial::SerialTransport::open(port, config)?)),
            Resource::Prologix { port, primary } => Ok(Box::new(
                prologix::PrologixTransport::open(port, *primary, config)?,
            )),
            Resource::Gpib { board, primary } => {
                let port = config.gpib.controller(*board).ok_or_else(|| {
                    Error::connection(
                        resource,
                        format!("no controller configured for GPIB board {board}"),
                    )
                })?;
                Ok(Box::new(prologix::PrologixTransport::open(
                    port, *primary, config,
                )?))
            }
            Resource::Usb {
                vendor_id,
                product_id,
                serial,
            } => Ok(Box::new(usbtmc::UsbTmcTransport::open(
                *vendor_id,
                *product_id,
                serial.as_deref(),
                config,
            )?)),
        }
    }
}

/// Read from `reader` until `terminator` arrives, returning everything before it.
///
/// `reader` is expected to give up on its own after `timeout` (as serial ports do); the deadline
/// also bounds a device that keeps sending without ever terminating.
pub(crate) fn read_until<R: Read + ?Sized>(
    reader: &mut R,
    terminator: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let start = Instant::now();
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(Error::io(
                    "read",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "channel closed mid-message"),
                ))
            }
            Ok(_) => {
                buf.push(byte[0]);
                if !terminator.is_empty() && buf.ends_with(terminator) {
                    buf.truncate(buf.len() - terminator.len());
                    return Ok(buf);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::timeout("read", timeout))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::io("read", e)),
        }
        if start.elapsed() > timeout {
            return Err(Error::timeout("read", timeout));
        }
    }
}
