//! Instruments on a serial port.

use std::io::Write;
use std::time::Duration;

use serialport::SerialPort;

use super::{read_until, Transport};
use crate::config::SessionConfig;
use crate::{Error, Result};

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    read_terminator: Vec<u8>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(path: &str, config: &SessionConfig) -> Result<Self> {
        let serial = &config.serial;
        tracing::debug!(path, baud = serial.baud_rate, "Opening serial port");
        let port = serialport::new(path, serial.baud_rate)
            .data_bits(serial.data_bits.into())
            .parity(serial.parity.into())
            .stop_bits(serial.stop_bits.into())
            .timeout(config.timeout)
            .open()
            .map_err(|e| Error::connection(path, e))?;
        Ok(Self {
            port: Some(port),
            name: path.to_string(),
            read_terminator: config.read_terminator.clone().into_bytes(),
            timeout: config.timeout,
        })
    }

    fn port(&mut self, operation: &str) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(|| Error::closed(operation))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port("write")?;
        port.write_all(data).map_err(|e| Error::io("write", e))?;
        port.flush().map_err(|e| Error::io("write", e))
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let (terminator, timeout) = (self.read_terminator.clone(), self.timeout);
        let port = self.port("read")?;
        read_until(port.as_mut(), &terminator, timeout)
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.name, "Closed serial port");
        }
        Ok(())
    }
}
