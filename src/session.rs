use std::fmt;

use crate::config::SessionConfig;
use crate::resource::{Resource, ResourceKind};
use crate::transport::{Backend, SystemBackend, Transport};
use crate::{Error, Result};

/// An open communication channel to one addressed instrument.
///
/// The channel is released by [`Session::close`] or, failing that, when the session is dropped.
/// A session does no locking of its own; share it between threads only behind the caller's own
/// synchronization.
pub struct Session {
    address: String,
    resource: Resource,
    transport: Option<Box<dyn Transport>>,
    write_terminator: String,
    read_terminator: String,
}

impl Session {
    /// Open `address` as a resource of `kind` with the default configuration
    pub fn open(address: &str, kind: ResourceKind) -> Result<Self> {
        Self::open_with(&SystemBackend, address, kind, &SessionConfig::default())
    }

    /// Open a VISA-style resource string, working out the kind from its prefix
    pub fn open_resource(address: &str) -> Result<Self> {
        Self::open(address, Resource::infer_kind(address))
    }

    pub fn open_with(
        backend: &dyn Backend,
        address: &str,
        kind: ResourceKind,
        config: &SessionConfig,
    ) -> Result<Self> {
        let resource = Resource::parse(address, kind)?;
        tracing::info!(%kind, address, "Opening session");
        let transport = backend.open(&resource, config)?;
        tracing::info!(%resource, "Session opened");
        Ok(Self {
            address: address.to_string(),
            resource,
            transport: Some(transport),
            write_terminator: config.write_terminator.clone(),
            read_terminator: config.read_terminator.clone(),
        })
    }

    fn transport(&mut self, operation: &str) -> Result<&mut Box<dyn Transport>> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::closed(operation))
    }

    /// Send `command` followed by the write terminator
    pub fn send(&mut self, command: &str) -> Result<()> {
        let mut message = Vec::with_capacity(command.len() + self.write_terminator.len());
        message.extend_from_slice(command.as_bytes());
        message.extend_from_slice(self.write_terminator.as_bytes());
        tracing::debug!(session = %self, command, "send");
        let operation = format!("send `{command}`");
        self.transport(&operation)?
            .write(&message)
            .map_err(|e| e.during(&operation))
    }

    /// Block until one response arrives and return it without its terminator
    pub fn receive(&mut self) -> Result<String> {
        let raw = self
            .transport("receive")?
            .read()
            .map_err(|e| e.during("receive"))?;
        let mut response = String::from_utf8(raw).map_err(|e| {
            Error::io(
                "receive",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        let keep = response
            .strip_suffix(self.read_terminator.as_str())
            .map_or(response.len(), str::len);
        response.truncate(keep);
        let keep = response.trim_end_matches(['\r', '\n']).len();
        response.truncate(keep);
        tracing::debug!(session = %self, response, "receive");
        Ok(response)
    }

    /// Send `command` and wait for its response
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.send(command)?;
        self.receive()
    }

    /// A stable, human readable identifier naming the kind of link and the address
    pub fn describe(&self) -> String {
        self.to_string()
    }

    /// Release the channel. Closing a closed session does nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.close()?;
            tracing::info!(session = %self, "Session closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> ResourceKind {
        self.resource.kind()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Replace the terminator appended to every command
    pub fn set_write_terminator(&mut self, terminator: impl Into<String>) {
        self.write_terminator = terminator.into();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.address)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("resource", &self.resource)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(session = %self, error = %e, "Failed to release session");
        }
    }
}
