//! Device and link configuration.
//!
//! A deployment is described by a YAML document listing the devices, how each
//! one is reached and how its sequencer is paced:
//!
//! ```yaml
//! devices:
//!   - name: lift
//!     model: ds5l2
//!     link:
//!       type: serial
//!       port: /dev/ttyUSB0
//!   - name: feeder
//!     model: zs
//!     link:
//!       type: tcp
//!       host: 192.168.1.20
//!     sequencer:
//!       slave: 2
//!       max_attempts: 20
//! ```
//!
//! Nothing here opens a port; the values are handed to whatever does.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modbus_tcp::MODBUS_TCP_PORT;
use crate::registers::DeviceModel;
use crate::transport::Framing;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial line parameters.
///
/// Drives default to 9600 8E1; the oxygen sensor uses 9600 8N1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> Parity {
    Parity::Even
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    /// 9600 8E1, as used by the DS5L2 and ZS drives.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            parity: default_parity(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
        }
    }

    /// 9600 8N1 for the oxygen sensor.
    pub fn o2_sensor(port: impl Into<String>) -> Self {
        Self {
            parity: Parity::None,
            ..Self::new(port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTarget {
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

fn default_tcp_port() -> u16 {
    MODBUS_TCP_PORT
}

impl TcpTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: MODBUS_TCP_PORT,
        }
    }
}

/// Pacing and addressing of one motion sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub slave: u8,
    /// Status polls before giving up on a stop.
    pub max_attempts: u32,
    /// Pause after every write.
    pub settle_delay_ms: u64,
    /// Pause between status polls.
    pub poll_interval_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            slave: 1,
            max_attempts: 10,
            settle_delay_ms: 100,
            poll_interval_ms: 1000,
            response_timeout_ms: 1000,
        }
    }
}

impl SequencerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkConfig {
    Serial(SerialSettings),
    Tcp(TcpTarget),
}

impl LinkConfig {
    /// Encapsulation spoken on this link: RTU on serial lines, MBAP on TCP.
    pub fn framing(&self) -> Framing {
        match self {
            Self::Serial(_) => Framing::Rtu,
            Self::Tcp(_) => Framing::tcp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub model: DeviceModel,
    pub link: LinkConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.name == name)
    }

    /// Device names are unique and no serial port is claimed twice.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(ConfigError::Invalid("device with empty name".to_string()));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name: {}",
                    device.name
                )));
            }
            if let LinkConfig::Serial(serial) = &device.link {
                if !ports.insert(serial.port.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "serial port {} assigned to more than one device",
                        serial.port
                    )));
                }
            }
            if device.sequencer.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: max_attempts must be at least 1",
                    device.name
                )));
            }
        }
        Ok(())
    }
}
