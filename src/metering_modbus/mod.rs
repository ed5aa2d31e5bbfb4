use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{sync::{mpsc::Sender, watch}, task::JoinHandle, time::{Interval, MissedTickBehavior}};

use crate::config::MeterConfig;
use crate::models::{LinkState, MeasurementRecord, MeterIdentity, Transmission, TransportKind};
use self::connection::{Connection, ConnectionParameters, Connector, ModbusConnector};
use self::registers::{DefinitionError, MeterDefinition};
use self::tracker::{CommunicationState, ErrorStateTracker};

pub mod codec;
pub mod connection;
pub mod meter_definitions;
pub mod registers;
pub mod tracker;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Meter {0} has neither TCP nor serial parameters")]
    NoConnection(String),
    #[error("Meter {0} got {1} parameters where {2} parameters are expected")]
    WrongTransport(String, String, String),
    #[error("Unknown meter model {0}")]
    UnknownModel(String),
    #[error("Invalid register table: {0}")]
    Definition(#[from] DefinitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Connected,
    Sampling,
}

/// Polls one counter: owns its channel, its register table and its error tracker
pub struct MeterDriver {
    identity: MeterIdentity,
    definition: MeterDefinition,
    tcp: Option<ConnectionParameters>,
    serial: Option<ConnectionParameters>,
    connector: Arc<dyn Connector>,
    connection: Connection,
    tracker: ErrorStateTracker,
    state: DriverState,
    sender: Sender<Transmission>,
}

impl MeterDriver {
    pub fn new(
        identity: MeterIdentity,
        definition: MeterDefinition,
        tcp: Option<ConnectionParameters>,
        serial: Option<ConnectionParameters>,
        sender: Sender<Transmission>,
    ) -> Result<Self, DriverError> {
        if tcp.is_none() && serial.is_none() {
            return Err(DriverError::NoConnection(identity.name.clone()));
        }
        if let Some(params) = tcp.as_ref().filter(|p| p.kind() != TransportKind::Tcp) {
            return Err(DriverError::WrongTransport(identity.name.clone(), params.kind().to_string(), "TCP".to_string()));
        }
        if let Some(params) = serial.as_ref().filter(|p| p.kind() != TransportKind::Rtu) {
            return Err(DriverError::WrongTransport(identity.name.clone(), params.kind().to_string(), "RTU".to_string()));
        }
        definition.validate()?;

        let tracker = ErrorStateTracker::new(identity.clone(), definition.error_threshold);
        return Ok(MeterDriver {
            identity,
            definition,
            tcp,
            serial,
            connector: Arc::new(ModbusConnector),
            connection: Connection::closed(),
            tracker,
            state: DriverState::Disconnected,
            sender,
        });
    }

    pub fn from_config(config: &MeterConfig, sender: Sender<Transmission>) -> Result<Self, DriverError> {
        let definition = meter_definitions::get_meter_definition(&config.model)
            .ok_or_else(|| DriverError::UnknownModel(config.model.clone()))?;
        let threshold = config.error_threshold.unwrap_or(definition.error_threshold);

        let driver = MeterDriver::new(
            config.identity(),
            definition,
            config.tcp_parameters(),
            config.serial_parameters(),
            sender,
        )?;
        Ok(driver.with_error_threshold(threshold))
    }

    /// Replaces the factory used to open channels
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.tracker = ErrorStateTracker::new(self.identity.clone(), threshold);
        self
    }

    pub fn identity(&self) -> &MeterIdentity {
        &self.identity
    }

    pub fn definition(&self) -> &MeterDefinition {
        &self.definition
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Transport of the current channel, `None` while disconnected
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.connection.kind()
    }

    pub fn link_state(&self) -> LinkState {
        self.tracker.link_state()
    }

    pub fn communication_state(&self) -> &CommunicationState {
        self.tracker.state()
    }

    pub async fn connect(&mut self) -> bool {
        self.connection.close().await;

        match Connection::open_with_fallback(self.connector.as_ref(), self.tcp.as_ref(), self.serial.as_ref()).await {
            Ok(connection) => {
                let endpoint = match connection.kind() {
                    Some(TransportKind::Tcp) => connection.endpoint().map(|e| e.to_string()),
                    _ => None,
                };
                self.tracker.set_endpoint(endpoint);
                self.connection = connection;
                self.state = DriverState::Connected;
                info!("Connected to {} meter {}", self.definition.model, self.identity.name);
                true
            }
            Err(e) => {
                error!("Failed to connect to {} meter {}: {}", self.definition.model, self.identity.name, e);
                self.connection = Connection::closed();
                self.state = DriverState::Disconnected;
                false
            }
        }
    }

    /// Reads every block of the register table in order and decodes them.
    ///
    /// The first failing read ends the cycle. Blocks already read are dropped.
    pub async fn sample(&mut self) -> Option<MeasurementRecord> {
        if self.state == DriverState::Connected {
            self.state = DriverState::Sampling;
        }

        let record = self.read_record().await;
        self.report_cycle(record.is_none()).await;

        self.state = if self.connection.is_open() { DriverState::Connected } else { DriverState::Disconnected };
        record
    }

    async fn read_record(&mut self) -> Option<MeasurementRecord> {
        let mut blocks = Vec::with_capacity(self.definition.reads.len());

        for read in self.definition.reads {
            match self.connection.read_block(self.identity.unit_id, read.address, read.count).await {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    error!("Meter {} failed reading registers {}-{}: {}",
                        self.identity.name, read.address, read.address as u32 + read.count as u32 - 1, e);
                    return None;
                }
            }
        }

        let values = match self.definition.decode(&blocks) {
            Ok(values) => values,
            Err(e) => {
                error!("Meter {} returned undecodable data: {}", self.identity.name, e);
                return None;
            }
        };

        let mut record = MeasurementRecord::new(&self.identity, self.definition.model, self.connection.kind());
        for (name, value) in values {
            record.insert(name, value);
        }
        debug!("Meter {} sampled {} values", self.identity.name, record.values.len());
        Some(record)
    }

    async fn report_cycle(&mut self, cycle_failed: bool) {
        if let Some(event) = self.tracker.record_cycle(cycle_failed) {
            match event.new_state {
                LinkState::Down => warn!("{}", event.message()),
                LinkState::Up => info!("{}", event.message()),
            }
            if self.sender.send(Transmission::LinkState(event)).await.is_err() {
                warn!("Nobody listens for link events of meter {} anymore", self.identity.name);
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.connection.close().await;
        if self.state != DriverState::Disconnected {
            info!("Disconnected from {} meter {}", self.definition.model, self.identity.name);
        }
        self.state = DriverState::Disconnected;
    }
}

/// A slow cycle postpones the following ticks instead of firing them back to back
fn poll_ticker(interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Samples one meter every `interval` until `shutdown` flips or its sender goes away.
///
/// A missing channel is reopened at the start of a tick. After a failed cycle
/// while the link is reported down the channel is dropped, so the next tick
/// starts from a fresh connection.
pub async fn poll_meter(
    mut driver: MeterDriver,
    interval: Duration,
    sender: Sender<Transmission>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = driver.identity().name.clone();
    let mut ticker = poll_ticker(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        if !driver.is_connected() {
            driver.connect().await;
        }

        match driver.sample().await {
            Some(record) => {
                if sender.send(Transmission::Metering(record)).await.is_err() {
                    warn!("Nobody listens for data of meter {} anymore", name);
                    break;
                }
            }
            None => {
                if driver.link_state() == LinkState::Down {
                    driver.disconnect().await;
                }
            }
        }
    }

    driver.disconnect().await;
    debug!("Polling of meter {} stopped", name);
}

pub struct ModbusManager {
    sender: Sender<Transmission>,
    meters: Vec<MeterConfig>,
    shutdown: watch::Receiver<bool>,
    threads: Vec<JoinHandle<()>>,
}

impl ModbusManager {
    pub fn new(sender: Sender<Transmission>, meters: Vec<MeterConfig>, shutdown: watch::Receiver<bool>) -> Self {
        return ModbusManager {
            sender,
            meters,
            shutdown,
            threads: Vec::new(),
        };
    }

    /// Spawns one polling task per meter and waits for all of them to stop
    pub async fn start_thread(&mut self) {
        for config in self.meters.iter() {
            let driver = match MeterDriver::from_config(config, self.sender.clone()) {
                Ok(driver) => driver,
                Err(e) => {
                    error!("Skipping meter {}: {}", config.name, e);
                    continue;
                }
            };

            let interval = Duration::from_secs(config.read_interval);
            info!("Polling {} meter {} every {} seconds", driver.definition().model, config.name, config.read_interval);
            self.threads.push(tokio::spawn(poll_meter(driver, interval, self.sender.clone(), self.shutdown.clone())));
        }

        info!("Modbus activated with {} meters", self.threads.len());
        for thread in self.threads.drain(..) {
            if let Err(e) = thread.await {
                error!("Meter task ended abnormally: {:?}", e);
            }
        }
    }
}
