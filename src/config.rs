//! Session settings.
//!
//! Every field has a default, so a configuration file only needs to name what differs:
//!
//! ```toml
//! timeout = "2s"
//!
//! [serial]
//! baud_rate = 4800
//! parity = "even"
//!
//! [gpib]
//! boards = ["/dev/ttyUSB0"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a single read or write may take
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Appended to every command sent
    pub write_terminator: String,
    /// Marks the end of a response
    pub read_terminator: String,
    pub serial: SerialConfig,
    pub prologix: PrologixConfig,
    pub gpib: GpibConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            write_terminator: "\r\n".into(),
            read_terminator: "\n".into(),
            serial: SerialConfig::default(),
            prologix: PrologixConfig::default(),
            gpib: GpibConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    One,
    Two,
}

/// Line settings for [`ResourceKind::Serial`](crate::ResourceKind::Serial) resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    /// Set the framing from the usual shorthand, e.g. `8N1` or `7E2`
    pub fn with_framing(mut self, framing: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("unknown serial framing `{framing}`"));
        let chars: Vec<char> = framing.to_ascii_lowercase().chars().collect();
        let [data_bits, parity, stop_bits] = chars.as_slice() else {
            return Err(invalid());
        };
        self.data_bits = match data_bits {
            '7' => DataBits::Seven,
            '8' => DataBits::Eight,
            _ => return Err(invalid()),
        };
        self.parity = match parity {
            'n' => Parity::None,
            'o' => Parity::Odd,
            'e' => Parity::Even,
            _ => return Err(invalid()),
        };
        self.stop_bits = match stop_bits {
            '1' => StopBits::One,
            '2' => StopBits::Two,
            _ => return Err(invalid()),
        };
        Ok(self)
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Settings for Prologix GPIB-USB controllers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrologixConfig {
    /// Ignored by the USB models, which run at full speed regardless
    pub baud_rate: u32,
    /// Assert EOI with the last byte of every write
    pub eoi: bool,
}

impl Default for PrologixConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            eoi: true,
        }
    }
}

/// Maps GPIB board numbers to the controllers that serve them.
///
/// Board `n` of a `GPIBn::…` address is driven by the Prologix controller on `boards[n]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpibConfig {
    pub boards: Vec<String>,
}

impl GpibConfig {
    pub fn controller(&self, board: u8) -> Option<&str> {
        self.boards.get(usize::from(board)).map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(
            SessionConfig::from_toml_str("").unwrap(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_partial_file() {
        let config = SessionConfig::from_toml_str(
            r#"
            timeout = "250ms"
            write_terminator = "\n"

            [serial]
            baud_rate = 4800
            parity = "even"
            stop_bits = "two"

            [gpib]
            boards = ["/dev/ttyUSB0", "COM7"]
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.write_terminator, "\n");
        assert_eq!(config.read_terminator, "\n");
        assert_eq!(config.serial.baud_rate, 4800);
        assert_eq!(config.serial.data_bits, DataBits::Eight);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.serial.stop_bits, StopBits::Two);
        assert_eq!(config.prologix, PrologixConfig::default());
        assert_eq!(config.gpib.controller(1), Some("COM7"));
        assert_eq!(config.gpib.controller(2), None);
    }

    #[test]
    fn test_bad_file() {
        assert!(matches!(
            SessionConfig::from_toml_str("timeout = \"soon\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SessionConfig::load("/nonexistent/labvisa.toml"),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_framing() {
        let serial = SerialConfig::default().with_framing("7E2").unwrap();
        assert_eq!(serial.data_bits, DataBits::Seven);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, StopBits::Two);
        assert!(SerialConfig::default().with_framing("8X1").is_err());
        assert!(SerialConfig::default().with_framing("8N").is_err());
    }
}
