use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use thiserror::Error;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::time::Duration;

use crate::metering_modbus::connection::{ConnectionParameters, Parity};
use crate::metering_modbus::meter_definitions::get_meter_definition;
use crate::models::MeterIdentity;

const CONFIG_ENV: &str = "COUNTERS_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/counters.yaml", "counters.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration found, tried {0}")]
    NotFound(String),
    #[error("Unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Meter {0}: {1}")]
    Invalid(String, String),
}

fn tcp_port_default() -> u16 { return 502 }
fn tcp_timeout_default() -> f64 { return 4.0 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TcpConfig {
    pub host: String,
    #[serde(default="tcp_port_default")]
    pub port: u16,
    /// seconds
    #[serde(default="tcp_timeout_default")]
    pub timeout: f64,
}

fn rtu_port_default() -> String { return "/dev/ttyAMA0".to_string() }
fn rtu_baudrate_default() -> u32 { return 9600 }
fn rtu_bytesize_default() -> u8 { return 8 }
fn rtu_parity_default() -> Parity { return Parity::None }
fn rtu_stopbits_default() -> u8 { return 1 }
fn rtu_timeout_default() -> f64 { return 2.0 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RtuConfig {
    #[serde(default="rtu_port_default")]
    pub port: String,
    #[serde(default="rtu_baudrate_default")]
    pub baudrate: u32,
    #[serde(default="rtu_bytesize_default")]
    pub bytesize: u8,
    #[serde(default="rtu_parity_default")]
    pub parity: Parity,
    #[serde(default="rtu_stopbits_default")]
    pub stopbits: u8,
    /// seconds
    #[serde(default="rtu_timeout_default")]
    pub timeout: f64,
}

fn meter_read_interval_default() -> u64 { return 30 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    pub counter_id: u32,
    pub unit_id: u8,
    pub name: String,
    pub company_id: String,
    pub model: String,
    /// seconds between two samples
    #[serde(default="meter_read_interval_default")]
    pub read_interval: u64,
    /// falls back to the default of the meter model
    #[serde(default)]
    pub error_threshold: Option<u32>,
    #[serde(default)]
    pub tcp: Option<TcpConfig>,
    #[serde(default)]
    pub rtu: Option<RtuConfig>,
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl MeterConfig {
    pub fn identity(&self) -> MeterIdentity {
        MeterIdentity::new(self.counter_id, self.unit_id, &self.name, &self.company_id)
    }

    pub fn tcp_parameters(&self) -> Option<ConnectionParameters> {
        self.tcp.as_ref().map(|tcp| ConnectionParameters::Tcp {
            host: tcp.host.clone(),
            port: tcp.port,
            timeout: seconds(tcp.timeout),
        })
    }

    pub fn serial_parameters(&self) -> Option<ConnectionParameters> {
        self.rtu.as_ref().map(|rtu| ConnectionParameters::Serial {
            path: rtu.port.clone(),
            baud_rate: rtu.baudrate,
            data_bits: rtu.bytesize,
            parity: rtu.parity,
            stop_bits: rtu.stopbits,
            timeout: seconds(rtu.timeout),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(self.name.clone(), reason.to_string()));

        if get_meter_definition(&self.model).is_none() {
            return invalid(&format!("unknown model {}", self.model));
        }
        if self.unit_id == 0 {
            return invalid("unit id 0 is the broadcast address");
        }
        if self.read_interval == 0 {
            return invalid("read interval must be at least one second");
        }
        if self.tcp.is_none() && self.rtu.is_none() {
            return invalid("neither tcp nor rtu is configured");
        }

        if let Some(tcp) = &self.tcp {
            if tcp.host.is_empty() {
                return invalid("tcp host is empty");
            }
            if !(tcp.timeout.is_finite() && tcp.timeout > 0.0) {
                return invalid("tcp timeout must be positive");
            }
        }

        if let Some(rtu) = &self.rtu {
            if !(5..=8).contains(&rtu.bytesize) {
                return invalid("rtu bytesize must be between 5 and 8");
            }
            if !(1..=2).contains(&rtu.stopbits) {
                return invalid("rtu stopbits must be 1 or 2");
            }
            if rtu.baudrate == 0 {
                return invalid("rtu baudrate must not be 0");
            }
            if !(rtu.timeout.is_finite() && rtu.timeout > 0.0) {
                return invalid("rtu timeout must be positive");
            }
        }

        Ok(())
    }
}

fn meters_default() -> Vec<MeterConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
}

impl Config {
    /// Reads the file named by `COUNTERS_CONFIG`, or the first of the default paths
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        for path in CONFIG_PATHS {
            let path = Path::new(path);
            if path.exists() {
                return Self::load_from(path);
            }
            debug!("No configuration at {}", path.display());
        }

        Err(ConfigError::NotFound(CONFIG_PATHS.join(", ")))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config = Self::parse(&contents)?;
        info!("Loaded {} meters from {}", config.meters.len(), path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        for meter in config.meters.iter() {
            meter.validate()?;
        }
        Ok(config)
    }
}
