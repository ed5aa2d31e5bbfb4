use serde::{Deserialize, Serialize};
use chrono::{DateTime, SecondsFormat, Utc};


/// Static description of one counter, created from configuration and never changed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeterIdentity {
    pub counter_id: u32,
    /// Modbus slave address
    pub unit_id: u8,
    pub name: String,
    pub company_id: String,
}

impl MeterIdentity {
    pub fn new(counter_id: u32, unit_id: u8, name: &str, company_id: &str) -> Self {
        MeterIdentity {
            counter_id,
            unit_id,
            name: name.to_string(),
            company_id: company_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Rtu,
}

impl TransportKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TCP" => Some(TransportKind::Tcp),
            "RTU" => Some(TransportKind::Rtu),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            TransportKind::Tcp => "TCP".to_string(),
            TransportKind::Rtu => "RTU".to_string(),
        }
    }
}

/// Debounced communication state of a counter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Emitted once per debounced transition of a counter's link state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkStateChanged {
    pub counter_id: u32,
    pub meter_name: String,
    pub company_id: String,
    /// host:port of the TCP endpoint, if the counter is reached over TCP
    pub endpoint: Option<String>,
    pub new_state: LinkState,
    pub timestamp: DateTime<Utc>,
}

impl LinkStateChanged {
    pub fn topic(&self) -> String {
        let state = match self.new_state {
            LinkState::Down => "DOWN",
            LinkState::Up => "Restored",
        };
        return format!("{} Comm Error {} {}", self.company_id, self.meter_name, state);
    }

    pub fn message(&self) -> String {
        let ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        let origin = match &self.endpoint {
            Some(endpoint) => format!("{} (ip:{})", self.company_id, endpoint),
            None => self.company_id.clone(),
        };

        match self.new_state {
            LinkState::Down => format!("{} communication with the counter {} is DOWN since {}", origin, self.meter_name, ts),
            LinkState::Up => format!("{} communication with the counter {} has been restored at {}", origin, self.meter_name, ts),
        }
    }
}

/// Result of one complete sample of a counter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    pub company_id: String,
    pub counter_id: u32,
    pub meter_name: String,
    pub model: String,
    pub transport: Option<TransportKind>,
    pub timestamp: DateTime<Utc>,
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl MeasurementRecord {
    pub fn new(identity: &MeterIdentity, model: &str, transport: Option<TransportKind>) -> Self {
        MeasurementRecord {
            company_id: identity.company_id.clone(),
            counter_id: identity.counter_id,
            meter_name: identity.name.clone(),
            model: model.to_string(),
            transport,
            timestamp: Utc::now(),
            values: serde_json::Map::new(),
        }
    }

    pub fn insert(&mut self, channel: &str, value: f64) {
        self.values.insert(channel.to_string(), serde_json::Value::from(value));
    }

    /// Decoded value of a channel
    pub fn value(&self, channel: &str) -> Option<f64> {
        self.values.get(channel).and_then(|v| v.as_f64())
    }
}

/// Everything the counters hand to the outside world
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum Transmission {
    Metering(MeasurementRecord),
    LinkState(LinkStateChanged),
}
