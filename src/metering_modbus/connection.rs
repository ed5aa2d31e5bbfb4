use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::models::TransportKind;

/// Upper bound of registers a single 0x03 request may ask for
pub const MAX_READ_COUNT: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

/// Where and how a counter is reached
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionParameters {
    Serial {
        path: String,
        baud_rate: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: u8,
        timeout: Duration,
    },
    Tcp {
        host: String,
        port: u16,
        timeout: Duration,
    },
}

impl ConnectionParameters {
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionParameters::Serial { .. } => TransportKind::Rtu,
            ConnectionParameters::Tcp { .. } => TransportKind::Tcp,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            ConnectionParameters::Serial { timeout, .. } => *timeout,
            ConnectionParameters::Tcp { timeout, .. } => *timeout,
        }
    }

    /// Device path or host:port
    pub fn endpoint(&self) -> String {
        match self {
            ConnectionParameters::Serial { path, .. } => path.clone(),
            ConnectionParameters::Tcp { host, port, .. } => format!("{}:{}", host, port),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Opening {0} timed out")]
    Timeout(String),
    #[error("Failed to open {endpoint}: {reason}")]
    Device { endpoint: String, reason: String },
    #[error("Invalid serial settings: {0}")]
    InvalidSettings(String),
    #[error("Serial lines are not supported by this build")]
    Unsupported,
    #[error("Neither TCP nor serial parameters are configured")]
    NotConfigured,
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Not connected")]
    NotConnected,
    #[error("Modbus protocol error: {0}")]
    Protocol(String),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Transport failure: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Register count {0} is out of range")]
    InvalidCount(u16),
}

/// Contiguous run of holding registers as returned by the counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    pub address: u16,
    pub count: u16,
    pub words: Vec<u16>,
}

/// An open channel able to answer "read holding registers"
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn is_open(&self) -> bool;

    async fn read_holding_registers(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>, ReadError>;

    async fn close(&mut self);
}

/// Creates transports from connection parameters
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, params: &ConnectionParameters) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// Modbus framing on top of any byte stream, RTU or TCP flavoured.
///
/// A timeout, an I/O failure or a malformed frame header leaves the stream in an
/// unknown position within a frame, so the stream is dropped and the transport
/// reports itself closed. Complete frames that fail to parse keep it open.
pub struct FramedTransport<S> {
    stream: Option<S>,
    kind: TransportKind,
    timeout: Duration,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, kind: TransportKind, timeout: Duration) -> Self {
        FramedTransport {
            stream: Some(stream),
            kind,
            timeout,
        }
    }

    fn proto(&self) -> ModbusProto {
        match self.kind {
            TransportKind::Tcp => ModbusProto::TcpUdp,
            TransportKind::Rtu => ModbusProto::Rtu,
        }
    }

    async fn transact(stream: &mut S, kind: TransportKind, request: &[u8], count: u16) -> Result<Vec<u8>, ReadError> {
        stream.write_all(request).await?;
        stream.flush().await?;

        match kind {
            TransportKind::Tcp => Self::read_tcp_frame(stream, count).await,
            TransportKind::Rtu => Self::read_rtu_frame(stream, count).await,
        }
    }

    async fn read_tcp_frame(stream: &mut S, count: u16) -> Result<Vec<u8>, ReadError> {
        /* MBAP header: transaction, protocol, length of everything that follows */
        let mut header = [0u8; 6];
        stream.read_exact(&mut header).await?;
        let rest = u16::from_be_bytes([header[4], header[5]]) as usize;
        if rest < 2 || rest > 3 + 2 * count as usize {
            return Err(ReadError::Protocol(format!("Invalid MBAP length {}", rest)));
        }

        let mut response = header.to_vec();
        response.resize(6 + rest, 0);
        stream.read_exact(&mut response[6..]).await?;
        Ok(response)
    }

    async fn read_rtu_frame(stream: &mut S, count: u16) -> Result<Vec<u8>, ReadError> {
        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        if header[1] < 0x80 && header[2] as usize > 2 * count as usize {
            return Err(ReadError::Protocol(format!("Unexpected byte count {}", header[2])));
        }

        let len = guess_response_frame_len(&header, ModbusProto::Rtu)
            .map_err(|e| ReadError::Protocol(format!("Failed to determine response length: {:?}", e)))? as usize;

        let mut response = header.to_vec();
        if len > response.len() {
            response.resize(len, 0);
            stream.read_exact(&mut response[3..]).await?;
        }
        Ok(response)
    }
}

#[async_trait]
impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_holding_registers(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ReadError::InvalidCount(count));
        }

        let proto = self.proto();
        let kind = self.kind;
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(ReadError::NotConnected)?;

        let mut mreq = ModbusRequest::new(unit_id, proto);
        let mut request = Vec::new();
        mreq.generate_get_holdings(address, count, &mut request)
            .map_err(|e| ReadError::Protocol(format!("Failed to build request: {:?}", e)))?;

        let response = match tokio::time::timeout(timeout, Self::transact(stream, kind, &request, count)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                /* the rest of a broken frame may still be in flight */
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                self.stream = None;
                return Err(ReadError::Timeout(timeout));
            }
        };

        let mut data: Vec<u16> = Vec::new();
        mreq.parse_u16(&response, &mut data)
            .map_err(|e| ReadError::Protocol(format!("{:?}", e)))?;

        if data.len() != count as usize {
            return Err(ReadError::Protocol(format!("Expected {} registers, got {}", count, data.len())));
        }
        Ok(data)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Opens real sockets and serial devices
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(&self, params: &ConnectionParameters) -> Result<Box<dyn Transport>, ConnectionError> {
        match params {
            ConnectionParameters::Tcp { host, port, timeout } => {
                let endpoint = params.endpoint();
                let stream = match tokio::time::timeout(*timeout, TcpStream::connect((host.as_str(), *port))).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(ConnectionError::Device { endpoint, reason: e.to_string() }),
                    Err(_) => return Err(ConnectionError::Timeout(endpoint)),
                };
                let _ = stream.set_nodelay(true);
                Ok(Box::new(FramedTransport::new(stream, TransportKind::Tcp, *timeout)))
            }
            ConnectionParameters::Serial { .. } => open_serial(params),
        }
    }
}

#[cfg(feature = "serial")]
fn open_serial(params: &ConnectionParameters) -> Result<Box<dyn Transport>, ConnectionError> {
    use tokio_serial::{DataBits, SerialStream, StopBits};

    let ConnectionParameters::Serial { path, baud_rate, data_bits, parity, stop_bits, timeout } = params else {
        return Err(ConnectionError::InvalidSettings("not a serial line".to_string()));
    };

    let data_bits = match *data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => return Err(ConnectionError::InvalidSettings(format!("{} data bits", other))),
    };
    let stop_bits = match *stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => return Err(ConnectionError::InvalidSettings(format!("{} stop bits", other))),
    };
    let parity = match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };

    let builder = tokio_serial::new(path.as_str(), *baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .timeout(*timeout);

    let stream = SerialStream::open(&builder)
        .map_err(|e| ConnectionError::Device { endpoint: path.clone(), reason: e.to_string() })?;

    Ok(Box::new(FramedTransport::new(stream, TransportKind::Rtu, *timeout)))
}

#[cfg(not(feature = "serial"))]
fn open_serial(_params: &ConnectionParameters) -> Result<Box<dyn Transport>, ConnectionError> {
    Err(ConnectionError::Unsupported)
}

/// The single channel a driver talks through. Starts out closed.
pub struct Connection {
    transport: Option<Box<dyn Transport>>,
    endpoint: Option<String>,
}

impl Connection {
    pub fn closed() -> Self {
        Connection { transport: None, endpoint: None }
    }

    pub async fn open(connector: &dyn Connector, params: &ConnectionParameters) -> Result<Self, ConnectionError> {
        let transport = connector.open(params).await?;
        info!("Opened Modbus {} channel to {}", params.kind().to_string(), params.endpoint());
        Ok(Connection {
            transport: Some(transport),
            endpoint: Some(params.endpoint()),
        })
    }

    /// Tries TCP first and falls back to the serial line when TCP cannot be opened
    pub async fn open_with_fallback(
        connector: &dyn Connector,
        tcp: Option<&ConnectionParameters>,
        serial: Option<&ConnectionParameters>,
    ) -> Result<Self, ConnectionError> {
        if let Some(tcp) = tcp {
            match Self::open(connector, tcp).await {
                Ok(connection) => return Ok(connection),
                Err(e) if serial.is_some() => {
                    warn!("Opening {} failed ({}), falling back to the serial line", tcp.endpoint(), e);
                }
                Err(e) => return Err(e),
            }
        }

        match serial {
            Some(serial) => Self::open(connector, serial).await,
            None => Err(ConnectionError::NotConfigured),
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
    }

    pub fn kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub async fn read_block(&mut self, unit_id: u8, address: u16, count: u16) -> Result<RegisterBlock, ReadError> {
        let transport = match self.transport.as_mut() {
            Some(t) if t.is_open() => t,
            _ => return Err(ReadError::NotConnected),
        };

        debug!("Reading {} holding registers at {} from unit {}", count, address, unit_id);
        let words = transport.read_holding_registers(unit_id, address, count).await?;
        if words.len() != count as usize {
            return Err(ReadError::Protocol(format!("Expected {} registers, got {}", count, words.len())));
        }

        Ok(RegisterBlock { address, count, words })
    }

    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            debug!("Closed Modbus channel to {}", self.endpoint.as_deref().unwrap_or("?"));
        }
    }
}
