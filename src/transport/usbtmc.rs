//! USBTMC instruments, driven through `nusb`.
//!
//! `nusb` transfers are futures; [`UsbTmcTransport`] runs them on the calling thread against an
//! `async-io` timer and cancels any transfer that outlives the session timeout by dropping it.

use std::future::Future;
use std::time::Duration;

use async_io::Timer;
use bitflags::bitflags;
use futures_lite::future;
use nusb::{
    transfer::{ControlIn, ControlType, Direction, EndpointType, Recipient, RequestBuffer},
    Interface,
};

use super::Transport;
use crate::config::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Nothing to send")]
    EmptyWrite,
    #[error("No device {vid:04x}:{pid:04x} with a USBTMC interface was found")]
    DeviceNotFound { vid: u16, pid: u16 },
    #[error("The interface only talks, it cannot be written to")]
    TalkOnly,
    #[error("The interface only listens, it cannot be read from")]
    ListenOnly,
    #[error("USB host error")]
    Driver(#[from] nusb::Error),
    #[error("USB transfer failed")]
    Transfer(#[from] nusb::transfer::TransferError),
    #[error("Class request failed with status {0:?}")]
    Control(ControlStatus),
    #[error("Device has no active configuration")]
    Unconfigured(#[from] nusb::descriptors::ActiveConfigurationError),
    #[error("Malformed response from the device")]
    BadData,
}

type Result<T> = std::result::Result<T, Error>;

// ---------- Interface Descriptor

/// Application specific class, test and measurement subclass
const TMC_CLASS: (u8, u8) = (0xFE, 0x03);
const TMC_PROTOCOL: u8 = 0x00;
const USB488_PROTOCOL: u8 = 0x01;

/// Bytes requested from the device per DEV_DEP_MSG_IN transfer
const READ_CHUNK: u32 = 4096;

/// An opened USBTMC interface
pub struct Device {
    interface: Interface,
    interface_capabilities: InterfaceCapabilities,
    device_capabilities: DeviceCapabilities,
    vendor: Option<String>,
    product: Option<String>,
    serial: Option<String>,
    tag: u8,
    max_packet_size: usize,
    bulk_out_endpoint: u8,
    bulk_in_endpoint: u8,
    /// Ends reads early when the device supports it
    term_char: Option<u8>,
}

impl Device {
    /// Claim the USBTMC interface of the first device matching `vid`, `pid` and, if given, the
    /// serial number
    pub async fn open(vid: u16, pid: u16, serial: Option<&str>) -> Result<Self> {
        let di = nusb::list_devices()?
            .find(|dev| {
                dev.vendor_id() == vid
                    && dev.product_id() == pid
                    && serial.map_or(true, |s| dev.serial_number() == Some(s))
            })
            .ok_or(Error::DeviceNotFound { vid, pid })?;
        let device = di.open()?;

        let configuration = device.active_configuration()?;
        let not_found = || Error::DeviceNotFound { vid, pid };

        // First alternate setting with the TMC class and both bulk endpoints; the interrupt
        // endpoint is optional and unused
        let mut found = None;
        'search: for group in configuration.interfaces() {
            for alt in group.alt_settings() {
                if (alt.class(), alt.subclass()) != TMC_CLASS
                    || !matches!(alt.protocol(), TMC_PROTOCOL | USB488_PROTOCOL)
                {
                    continue;
                }
                let mut out = None;
                let mut inp = None;
                for ep in alt.endpoints() {
                    if ep.transfer_type() != EndpointType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::Out => out = out.or(Some(ep.address())),
                        Direction::In => {
                            inp = inp.or(Some((ep.address(), ep.max_packet_size())))
                        }
                    }
                }
                if let (Some(out), Some((inp, packet))) = (out, inp) {
                    let usb488 = alt.protocol() == USB488_PROTOCOL;
                    found = Some((group.interface_number(), usb488, out, inp, packet));
                    break 'search;
                }
            }
        }
        let (number, supports_488, bulk_out_endpoint, bulk_in_endpoint, max_packet_size) =
            found.ok_or_else(not_found)?;

        let interface = device.detach_and_claim_interface(number)?;

        let (interface_capabilities, device_capabilities) = get_capabilities(&interface, number).await?;

        let device = Self {
            interface,
            interface_capabilities,
            device_capabilities,
            product: di.product_string().map(str::to_string),
            vendor: di.manufacturer_string().map(str::to_string),
            serial: di.serial_number().map(str::to_string),
            tag: 1,
            max_packet_size,
            bulk_out_endpoint,
            bulk_in_endpoint,
            term_char: None,
        };
        tracing::debug!(%device, supports_488, "Claimed USBTMC interface");
        Ok(device)
    }

    /// End reads at `term_char` if the device can do that, otherwise rely on EOM alone
    pub fn set_term_char(&mut self, term_char: Option<u8>) {
        self.term_char = term_char.filter(|_| {
            self.device_capabilities
                .contains(DeviceCapabilities::TermCharTransferEnd)
        });
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (serial {})",
            self.vendor.as_deref().unwrap_or_default(),
            self.product.as_deref().unwrap_or_default(),
            self.serial.as_deref().unwrap_or_default()
        )
    }
}

// ---------- Control Endpoints

/// bRequest of the USBTMC GET_CAPABILITIES class request
const GET_CAPABILITIES: u8 = 7;

/// USBTMC_status, the first byte of every class request response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlStatus {
    Success,
    Pending,
    Failed,
    /// Any other status, warning (0x03-0x7F) or failure (0x81 and up)
    Other(u8),
}

impl From<u8> for ControlStatus {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ControlStatus::Success,
            0x02 => ControlStatus::Pending,
            0x80 => ControlStatus::Failed,
            other => ControlStatus::Other(other),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterfaceCapabilities: u8 {
        const IndicatorPulse = 1 << 2;
        /// Accepts no DEV_DEP_MSG_OUT
        const TalkOnly = 1 << 1;
        /// Sends no DEV_DEP_MSG_IN
        const ListenOnly = 1;
        const _ = !0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapabilities: u8 {
        /// Bulk-in transfers can end on a TermChar byte
        const TermCharTransferEnd = 1;
        const _ = !0;
    }
}

async fn get_capabilities(
    interface: &Interface,
    number: u8,
) -> Result<(InterfaceCapabilities, DeviceCapabilities)> {
    let resp = interface
        .control_in(ControlIn {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: GET_CAPABILITIES,
            value: 0,
            index: u16::from(number),
            length: 0x18,
        })
        .await
        .into_result()?;
    let status = ControlStatus::from(*resp.first().ok_or(Error::BadData)?);
    if status != ControlStatus::Success {
        return Err(Error::Control(status));
    }
    if resp.len() < 6 {
        return Err(Error::BadData);
    }
    Ok((
        InterfaceCapabilities::from_bits_retain(resp[4]),
        DeviceCapabilities::from_bits_retain(resp[5]),
    ))
}

// ---------- Bulk Endpoints

/// Size of the bulk transfer headers in bytes
const HEADER_SIZE: usize = 12;

#[derive(Debug, PartialEq, Eq)]
struct BulkMessageHeader {
    tag: u8,
    msg: BulkMessage,
}

#[derive(Debug, PartialEq, Eq)]
enum BulkMessage {
    /// Command bytes for the device
    DevDepMsgOut { transfer_size: u32, eom: bool },
    /// Ask for up to `transfer_size` bytes on bulk-in
    RequestDevDepMsgIn {
        transfer_size: u32,
        term_char: Option<u8>,
    },
    /// Response bytes from the device
    DevDepMsgIn { transfer_size: u32, eom: bool },
}

impl BulkMessage {
    fn msgid(&self) -> u8 {
        match self {
            BulkMessage::DevDepMsgOut { .. } => 0x01,
            BulkMessage::RequestDevDepMsgIn { .. } | BulkMessage::DevDepMsgIn { .. } => 0x02,
        }
    }
}

impl BulkMessageHeader {
    fn pack(&self) -> Vec<u8> {
        let (transfer_size, attributes, term_char) = match self.msg {
            BulkMessage::DevDepMsgOut { transfer_size, eom }
            | BulkMessage::DevDepMsgIn { transfer_size, eom } => (transfer_size, u8::from(eom), 0),
            BulkMessage::RequestDevDepMsgIn {
                transfer_size,
                term_char,
            } => (
                transfer_size,
                u8::from(term_char.is_some()) << 1,
                term_char.unwrap_or(0),
            ),
        };
        let size = transfer_size.to_le_bytes();
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&[self.msg.msgid(), self.tag, !self.tag, 0]);
        header[4..8].copy_from_slice(&size);
        header[8] = attributes;
        header[9] = term_char;
        header.to_vec()
    }

    fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::BadData);
        }
        let tag = bytes[1];
        if !bytes[2] != tag || bytes[3] != 0 {
            return Err(Error::BadData);
        }
        match bytes[0] {
            0x02 => Ok(BulkMessageHeader {
                tag,
                msg: BulkMessage::DevDepMsgIn {
                    transfer_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                    eom: (bytes[8] & 1) != 0,
                },
            }),
            _ => Err(Error::BadData),
        }
    }
}

impl Device {
    /// Returns the tag for the next bulk-out transfer. Tags cycle through 1..=255.
    fn next_tag(&mut self) -> u8 {
        let tag = self.tag;
        self.tag = if self.tag == 255 { 1 } else { self.tag + 1 };
        tag
    }

    async fn bulk_in(&mut self, len: usize) -> Result<Vec<u8>> {
        // Request whole packets so a full-size last packet doesn't overflow
        let packet = self.max_packet_size.max(1);
        let len = len.div_ceil(packet) * packet;
        Ok(self
            .interface
            .bulk_in(self.bulk_in_endpoint, RequestBuffer::new(len))
            .await
            .into_result()?)
    }

    /// Write one message to the device
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self
            .interface_capabilities
            .contains(InterfaceCapabilities::TalkOnly)
        {
            return Err(Error::TalkOnly);
        }
        if data.is_empty() {
            return Err(Error::EmptyWrite);
        }

        let transfer_size = u32::try_from(data.len()).map_err(|_| Error::BadData)?;
        let tag = self.next_tag();
        let mut payload = BulkMessageHeader {
            tag,
            msg: BulkMessage::DevDepMsgOut {
                transfer_size,
                eom: true,
            },
        }
        .pack();
        payload.extend_from_slice(data);
        // Each bulk-out transfer must be 32-bit aligned
        payload.resize(payload.len().next_multiple_of(4), 0);

        self.interface
            .bulk_out(self.bulk_out_endpoint, payload)
            .await
            .into_result()?;
        Ok(())
    }

    /// Request and read one message from the device
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        if self
            .interface_capabilities
            .contains(InterfaceCapabilities::ListenOnly)
        {
            return Err(Error::ListenOnly);
        }

        let mut buf = vec![];
        loop {
            let tag = self.next_tag();
            let request = BulkMessageHeader {
                tag,
                msg: BulkMessage::RequestDevDepMsgIn {
                    transfer_size: READ_CHUNK,
                    term_char: self.term_char,
                },
            }
            .pack();
            self.interface
                .bulk_out(self.bulk_out_endpoint, request)
                .await
                .into_result()?;

            let resp = self.bulk_in(HEADER_SIZE + READ_CHUNK as usize).await?;
            let hdr = BulkMessageHeader::try_from_bytes(&resp)?;
            let BulkMessage::DevDepMsgIn { transfer_size, eom } = hdr.msg else {
                return Err(Error::BadData);
            };
            if hdr.tag != tag {
                return Err(Error::BadData);
            }

            let wanted = transfer_size as usize;
            let mut chunk = resp[HEADER_SIZE..].to_vec();
            while chunk.len() < wanted {
                let more = self.bulk_in(wanted - chunk.len()).await?;
                if more.is_empty() {
                    return Err(Error::BadData);
                }
                chunk.extend_from_slice(&more);
            }
            // Drop the alignment padding
            chunk.truncate(wanted);
            buf.append(&mut chunk);

            if eom {
                break;
            }
        }
        Ok(buf)
    }
}

// ---------- Blocking transport

/// Run `fut` on this thread until it finishes or `timeout` passes. On timeout the future is
/// dropped, which cancels any transfer it had in flight.
fn block_on_timeout<F: Future>(fut: F, timeout: Duration) -> Option<F::Output> {
    future::block_on(future::or(async { Some(fut.await) }, async {
        Timer::after(timeout).await;
        None
    }))
}

pub struct UsbTmcTransport {
    device: Option<Device>,
    name: String,
    timeout: Duration,
}

impl UsbTmcTransport {
    pub fn open(
        vid: u16,
        pid: u16,
        serial: Option<&str>,
        config: &SessionConfig,
    ) -> crate::Result<Self> {
        let name = format!("USB {vid:04x}:{pid:04x}");
        let mut device = future::block_on(Device::open(vid, pid, serial))
            .map_err(|e| crate::Error::connection(&name, e))?;
        device.set_term_char(config.read_terminator.as_bytes().last().copied());
        Ok(Self {
            device: Some(device),
            name,
            timeout: config.timeout,
        })
    }

    fn device(&mut self, operation: &str) -> crate::Result<&mut Device> {
        self.device
            .as_mut()
            .ok_or_else(|| crate::Error::closed(operation))
    }
}

fn finish<T>(operation: &str, timeout: Duration, out: Option<Result<T>>) -> crate::Result<T> {
    match out {
        Some(Ok(out)) => Ok(out),
        Some(Err(e)) => Err(crate::Error::io(operation, std::io::Error::other(e))),
        None => Err(crate::Error::timeout(operation, timeout)),
    }
}

impl Transport for UsbTmcTransport {
    fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        let timeout = self.timeout;
        let device = self.device("write")?;
        finish("write", timeout, block_on_timeout(device.write(data), timeout))
    }

    fn read(&mut self) -> crate::Result<Vec<u8>> {
        let timeout = self.timeout;
        let device = self.device("read")?;
        finish("read", timeout, block_on_timeout(device.read(), timeout))
    }

    fn close(&mut self) -> crate::Result<()> {
        if self.device.take().is_some() {
            tracing::debug!(device = %self.name, "Released USBTMC interface");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pack_dev_dep_msg_out() {
        let bytes = BulkMessageHeader {
            tag: 0xAD,
            msg: BulkMessage::DevDepMsgOut {
                transfer_size: 0xDE,
                eom: true,
            },
        }
        .pack();
        assert_eq!(vec![1, 0xAD, !0xAD, 0, 0xDE, 0, 0, 0, 1, 0, 0, 0], bytes);
    }

    #[test]
    fn test_pack_request_with_term_char() {
        let bytes = BulkMessageHeader {
            tag: 3,
            msg: BulkMessage::RequestDevDepMsgIn {
                transfer_size: 4096,
                term_char: Some(b'\n'),
            },
        }
        .pack();
        assert_eq!(vec![2, 3, !3, 0, 0x00, 0x10, 0, 0, 0b10, b'\n', 0, 0], bytes);
    }

    #[test]
    fn test_parse_dev_dep_msg_in() {
        let mut bytes = vec![2, 7, !7, 0, 5, 0, 0, 0, 1, 0, 0, 0];
        bytes.extend_from_slice(b"1.23\n\0\0\0");
        let hdr = BulkMessageHeader::try_from_bytes(&bytes).unwrap();
        assert_eq!(
            hdr,
            BulkMessageHeader {
                tag: 7,
                msg: BulkMessage::DevDepMsgIn {
                    transfer_size: 5,
                    eom: true
                }
            }
        );
    }

    #[test]
    fn test_reject_bad_headers() {
        // inverted tag mismatch
        assert!(BulkMessageHeader::try_from_bytes(&[2, 7, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // unknown message id
        assert!(BulkMessageHeader::try_from_bytes(&[9, 7, !7, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // short
        assert!(BulkMessageHeader::try_from_bytes(&[2, 7, !7, 0]).is_err());
    }

    #[test]
    fn test_control_status() {
        assert_eq!(ControlStatus::from(0x01), ControlStatus::Success);
        assert_eq!(ControlStatus::from(0x10), ControlStatus::Other(0x10));
        assert_eq!(ControlStatus::from(0x80), ControlStatus::Failed);
        assert_eq!(ControlStatus::from(0xC3), ControlStatus::Other(0xC3));
    }

    #[test]
    fn test_block_on_timeout() {
        assert_eq!(
            block_on_timeout(async { 5 }, Duration::from_millis(10)),
            Some(5)
        );
        let never = std::future::pending::<()>();
        assert_eq!(block_on_timeout(never, Duration::from_millis(10)), None);
    }
}
