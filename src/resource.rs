//! Resource addresses for each kind of communication link.
//!
//! Addresses follow the VISA resource naming convention where one exists:
//!
//! | Kind | Accepted forms |
//! |---|---|
//! | [`ResourceKind::Serial`] | `/dev/ttyUSB0`, `COM3`, `ASRL/dev/ttyUSB0::INSTR`, `ASRL3::INSTR` |
//! | [`ResourceKind::Gpib`] | `GPIB0::14::INSTR`, `GPIB::14`, `14` |
//! | [`ResourceKind::GpibUsbAdapter`] | `PROLOGIX::/dev/ttyUSB0::14`, `/dev/ttyUSB0::14` |
//! | [`ResourceKind::Usb`] | `USB0::0x0B21::0x0039::INSTR`, `USB0::0x0B21::0x0039::SN123::INSTR` |

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Highest valid GPIB primary address
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// The communication link used to reach an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// RS-232 or a USB virtual COM port
    Serial,
    /// A GPIB board and primary address
    Gpib,
    /// A GPIB instrument behind a Prologix GPIB-USB controller
    GpibUsbAdapter,
    /// A USBTMC instrument
    Usb,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Serial => "SERIAL",
            ResourceKind::Gpib => "GPIB",
            ResourceKind::GpibUsbAdapter => "GPIB-USB",
            ResourceKind::Usb => "USB",
        })
    }
}

/// A parsed resource address. Maps to exactly one hardware resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Serial {
        port: String,
    },
    Gpib {
        board: u8,
        primary: u8,
    },
    Prologix {
        port: String,
        primary: u8,
    },
    Usb {
        vendor_id: u16,
        product_id: u16,
        serial: Option<String>,
    },
}

fn splits(address: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = address.trim().split("::").collect();
    if parts.len() > 1
        && parts
            .last()
            .is_some_and(|last| last.eq_ignore_ascii_case("INSTR"))
    {
        parts.pop();
    }
    parts
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&s[prefix.len()..]),
        _ => None,
    }
}

fn parse_primary(address: &str, s: &str) -> Result<u8> {
    let primary: u8 = s
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(address.to_string()))?;
    if primary > MAX_GPIB_ADDRESS {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    Ok(primary)
}

fn parse_hex_u16(address: &str, s: &str) -> Result<u16> {
    let digits = strip_prefix_ignore_case(s, "0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// VISA numbers serial ports from 1, `ASRL1` being the first port of the machine
fn serial_port_for_number(n: u32) -> String {
    if cfg!(windows) {
        format!("COM{n}")
    } else {
        format!("/dev/ttyS{}", n.saturating_sub(1))
    }
}

impl Resource {
    /// Parse `address` as a resource of the given `kind`
    pub fn parse(address: &str, kind: ResourceKind) -> Result<Self> {
        let invalid = || Error::InvalidAddress(address.to_string());
        let parts = splits(address);
        match kind {
            ResourceKind::Serial => {
                if parts.len() != 1 {
                    return Err(invalid());
                }
                let port = match strip_prefix_ignore_case(parts[0], "ASRL") {
                    Some(rest) => match rest.parse::<u32>() {
                        Ok(n) => serial_port_for_number(n),
                        Err(_) => rest.to_string(),
                    },
                    None => parts[0].to_string(),
                };
                if port.is_empty() {
                    return Err(invalid());
                }
                Ok(Resource::Serial { port })
            }
            ResourceKind::Gpib => {
                let (board, primary) = match parts.as_slice() {
                    [primary] => (0, *primary),
                    [interface, primary] => {
                        let board = strip_prefix_ignore_case(interface, "GPIB").ok_or_else(invalid)?;
                        let board = if board.is_empty() {
                            0
                        } else {
                            board.parse().map_err(|_| invalid())?
                        };
                        (board, *primary)
                    }
                    _ => return Err(invalid()),
                };
                Ok(Resource::Gpib {
                    board,
                    primary: parse_primary(address, primary)?,
                })
            }
            ResourceKind::GpibUsbAdapter => {
                let rest = match parts.as_slice() {
                    [prefix, rest @ ..] if prefix.eq_ignore_ascii_case("PROLOGIX") => rest,
                    rest => rest,
                };
                match rest {
                    [port, primary] if !port.is_empty() => Ok(Resource::Prologix {
                        port: port.to_string(),
                        primary: parse_primary(address, primary)?,
                    }),
                    _ => Err(invalid()),
                }
            }
            ResourceKind::Usb => {
                let (interface, rest) = parts.split_first().ok_or_else(invalid)?;
                strip_prefix_ignore_case(interface, "USB").ok_or_else(invalid)?;
                match rest {
                    [vid, pid] => Ok(Resource::Usb {
                        vendor_id: parse_hex_u16(address, vid)?,
                        product_id: parse_hex_u16(address, pid)?,
                        serial: None,
                    }),
                    [vid, pid, serial] => Ok(Resource::Usb {
                        vendor_id: parse_hex_u16(address, vid)?,
                        product_id: parse_hex_u16(address, pid)?,
                        serial: Some(serial.to_string()),
                    }),
                    _ => Err(invalid()),
                }
            }
        }
    }

    /// Work out the kind of resource from the address itself.
    ///
    /// Addresses with a VISA or `PROLOGIX` prefix are unambiguous. Otherwise a bare number is a
    /// GPIB primary address, `port::number` is a Prologix adapter and anything else a serial port.
    pub fn infer_kind(address: &str) -> ResourceKind {
        let address = address.trim();
        let parts = splits(address);
        let head = parts.first().copied().unwrap_or_default();
        if strip_prefix_ignore_case(head, "PROLOGIX").is_some() {
            ResourceKind::GpibUsbAdapter
        } else if strip_prefix_ignore_case(head, "GPIB").is_some() {
            ResourceKind::Gpib
        } else if strip_prefix_ignore_case(head, "ASRL").is_some() {
            ResourceKind::Serial
        } else if strip_prefix_ignore_case(head, "USB").is_some() && parts.len() > 1 {
            ResourceKind::Usb
        } else if parts.len() == 1 && head.parse::<u8>().is_ok() {
            ResourceKind::Gpib
        } else if parts.len() == 2 {
            ResourceKind::GpibUsbAdapter
        } else {
            ResourceKind::Serial
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Serial { .. } => ResourceKind::Serial,
            Resource::Gpib { .. } => ResourceKind::Gpib,
            Resource::Prologix { .. } => ResourceKind::GpibUsbAdapter,
            Resource::Usb { .. } => ResourceKind::Usb,
        }
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Resource::parse(s, Resource::infer_kind(s))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Serial { port } => write!(f, "ASRL{port}::INSTR"),
            Resource::Gpib { board, primary } => write!(f, "GPIB{board}::{primary}::INSTR"),
            Resource::Prologix { port, primary } => write!(f, "PROLOGIX::{port}::{primary}"),
            Resource::Usb {
                vendor_id,
                product_id,
                serial,
            } => {
                write!(f, "USB0::0x{vendor_id:04X}::0x{product_id:04X}")?;
                if let Some(serial) = serial {
                    write!(f, "::{serial}")?;
                }
                f.write_str("::INSTR")
            }
        }
    }
}
