//! An in-memory backend that records traffic, for exercising drivers without hardware.
//!
//! ```
//! use labvisa::{ResourceKind, Session, SessionConfig};
//! use labvisa::transport::mock::MockBackend;
//!
//! let backend = MockBackend::new();
//! backend.push_response("7651 OK\r\n");
//! let mut session =
//!     Session::open_with(&backend, "GPIB0::1::INSTR", ResourceKind::Gpib, &SessionConfig::default())?;
//! assert_eq!(session.query("OS")?, "7651 OK");
//! assert_eq!(backend.commands(), ["OS"]);
//! # Ok::<(), labvisa::Error>(())
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Backend, Transport};
use crate::config::SessionConfig;
use crate::resource::Resource;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct MockState {
    opened: Vec<Resource>,
    written: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    refuse: bool,
    fail_writes: bool,
    closes: usize,
}

/// Cloning gives another handle onto the same recorded traffic
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    terminator: Arc<Mutex<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following `open` fail as if the resource did not exist
    pub fn refuse_connections(&self) {
        self.state().refuse = true;
    }

    /// Make every following write fail
    pub fn fail_writes(&self) {
        self.state().fail_writes = true;
    }

    /// Queue a raw response for the next read
    pub fn push_response(&self, response: impl AsRef<[u8]>) {
        self.state().responses.push_back(response.as_ref().to_vec());
    }

    /// Every resource opened so far
    pub fn opened(&self) -> Vec<Resource> {
        self.state().opened.clone()
    }

    /// Every write so far, exactly as it reached the transport
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Every write so far as text, with the session's write terminator removed
    pub fn commands(&self) -> Vec<String> {
        let terminator = self
            .terminator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.state()
            .written
            .iter()
            .map(|w| {
                let text = String::from_utf8_lossy(w).into_owned();
                match text.strip_suffix(terminator.as_str()) {
                    Some(command) => command.to_string(),
                    None => text,
                }
            })
            .collect()
    }

    /// Forget recorded writes
    pub fn clear(&self) {
        self.state().written.clear();
    }

    /// How many transports have been closed
    pub fn closes(&self) -> usize {
        self.state().closes
    }
}

impl Backend for MockBackend {
    fn open(&self, resource: &Resource, config: &SessionConfig) -> Result<Box<dyn Transport>> {
        let mut state = self.state();
        if state.refuse {
            return Err(Error::connection(
                resource,
                io::Error::new(io::ErrorKind::NotFound, "no such resource"),
            ));
        }
        state.opened.push(resource.clone());
        *self.terminator.lock().unwrap_or_else(PoisonError::into_inner) =
            config.write_terminator.clone();
        Ok(Box::new(MockTransport {
            state: Arc::clone(&self.state),
            read_terminator: config.read_terminator.clone().into_bytes(),
            open: true,
        }))
    }
}

pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    read_terminator: Vec<u8>,
    open: bool,
}

impl MockTransport {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::closed("write"));
        }
        let mut state = self.state();
        if state.fail_writes {
            return Err(Error::io(
                "write",
                io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"),
            ));
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        if !self.open {
            return Err(Error::closed("read"));
        }
        let mut response = self
            .state()
            .responses
            .pop_front()
            .ok_or_else(|| Error::timeout("read", Duration::ZERO))?;
        if response.ends_with(&self.read_terminator) {
            response.truncate(response.len() - self.read_terminator.len());
        }
        Ok(response)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.open, false) {
            self.state().closes += 1;
        }
        Ok(())
    }
}
