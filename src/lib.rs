//! Energy counter polling library
//!
//! Reads holding registers from Carlo Gavazzi and Lovato energy counters over
//! Modbus RTU or Modbus TCP, decodes them into named measurements and tracks
//! the communication health of every counter.

pub mod config;
pub mod models;
pub mod metering_modbus;

// Re-export common types for easier access
pub use config::{Config, MeterConfig};
pub use models::{LinkState, LinkStateChanged, MeasurementRecord, MeterIdentity, Transmission, TransportKind};
pub use metering_modbus::{MeterDriver, ModbusManager};
