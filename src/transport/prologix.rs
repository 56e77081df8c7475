//! GPIB instruments behind a Prologix GPIB-USB controller.
//!
//! The controller shows up as a serial port. Lines starting with `++` configure the controller
//! itself, everything else is forwarded to the addressed instrument. Data bytes that the
//! controller would otherwise interpret (CR, LF, ESC and `+`) are escaped with ESC, so a message
//! reaches the instrument byte for byte, terminator included.
//!
//! One controller serves every instrument on its bus. Sessions on the same port share the open
//! port, and each transfer re-addresses its instrument with `++addr` while holding the port.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use serialport::SerialPort;

use super::{read_until, Transport};
use crate::config::SessionConfig;
use crate::{Error, Result};

const ESC: u8 = 0x1B;

type Controller = Mutex<Box<dyn SerialPort>>;

/// Open controllers by port path. Entries die with the last session using them.
fn controllers() -> MutexGuard<'static, HashMap<String, Weak<Controller>>> {
    static CONTROLLERS: OnceLock<Mutex<HashMap<String, Weak<Controller>>>> = OnceLock::new();
    CONTROLLERS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub struct PrologixTransport {
    controller: Option<Arc<Controller>>,
    name: String,
    primary: u8,
    timeout: Duration,
}

/// Escape a message for transmission through the controller and terminate the line
pub(crate) fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for &b in data {
        if matches!(b, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(b);
    }
    out.push(b'\n');
    out
}

/// Controller setup sent once when its port is first opened
pub(crate) fn setup_commands(eoi: bool) -> Vec<String> {
    vec![
        "++savecfg 0".to_string(),
        "++mode 1".to_string(),
        "++auto 0".to_string(),
        // no terminator appended, the session sends its own
        "++eos 3".to_string(),
        format!("++eoi {}", u8::from(eoi)),
    ]
}

/// Send a `++` command to the controller
fn command(port: &mut dyn SerialPort, command: &str) -> Result<()> {
    tracing::trace!(command, "Prologix");
    port.write_all(command.as_bytes())
        .and_then(|_| port.write_all(b"\n"))
        .and_then(|_| port.flush())
        .map_err(|e| Error::io(command, e))
}

impl PrologixTransport {
    pub fn open(path: &str, primary: u8, config: &SessionConfig) -> Result<Self> {
        let resource = || format!("PROLOGIX::{path}::{primary}");
        let mut controllers = controllers();
        let controller = match controllers.get(path).and_then(Weak::upgrade) {
            Some(controller) => {
                tracing::debug!(path, primary, "Sharing Prologix controller");
                controller
            }
            None => {
                tracing::debug!(path, primary, "Initializing Prologix controller");
                let mut port = serialport::new(path, config.prologix.baud_rate)
                    .timeout(config.timeout)
                    .open()
                    .map_err(|e| Error::connection(resource(), e))?;
                for setup in setup_commands(config.prologix.eoi) {
                    command(port.as_mut(), &setup).map_err(|e| Error::connection(resource(), e))?;
                }
                let controller = Arc::new(Mutex::new(port));
                controllers.insert(path.to_string(), Arc::downgrade(&controller));
                controller
            }
        };
        Ok(Self {
            controller: Some(controller),
            name: path.to_string(),
            primary,
            timeout: config.timeout,
        })
    }

    /// Lock the controller and point it at this instrument
    fn addressed(&self, operation: &str) -> Result<MutexGuard<'_, Box<dyn SerialPort>>> {
        let controller = self
            .controller
            .as_ref()
            .ok_or_else(|| Error::closed(operation))?;
        let mut port = controller.lock().unwrap_or_else(PoisonError::into_inner);
        command(port.as_mut(), &format!("++addr {}", self.primary))?;
        Ok(port)
    }
}

impl Transport for PrologixTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut port = self.addressed("write")?;
        port.write_all(&escape(data))
            .and_then(|_| port.flush())
            .map_err(|e| Error::io("write", e))
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let mut port = self.addressed("read")?;
        command(port.as_mut(), "++read eoi")?;
        read_until(port.as_mut(), b"\n", self.timeout)
    }

    fn close(&mut self) -> Result<()> {
        if self.controller.take().is_some() {
            tracing::debug!(port = %self.name, primary = self.primary, "Released Prologix controller");
        }
        Ok(())
    }
}
