use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use super::frame::response_complete;
use crate::utils::error::ModbusError;

/// How the receive path decides that a response is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramerVariant {
    /// Completes on the frame's own length prefix only.
    Socket,
    /// Plain RTU over TCP: length prefix or an inter-byte silence gap.
    Rtu,
}

impl fmt::Display for FramerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramerVariant::Socket => f.write_str("socket"),
            FramerVariant::Rtu => f.write_str("rtu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeepAliveSettings {
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub framers: Vec<FramerVariant>,
    pub connect_timeout: Duration,
    pub settle_delay: Duration,
    pub keepalive: KeepAliveSettings,
    pub rtu_silence_gap: Duration,
}

impl ConnectionParams {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Byte transport the request executor drives. `Connection` is the TCP
/// implementation; tests substitute scripted ones.
#[async_trait]
pub trait Transport: Send {
    fn state(&self) -> ConnectionState;

    /// Cached state only, never touches the socket.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn unit_id(&self) -> u8;

    async fn connect(&mut self) -> Result<(), ModbusError>;

    /// Best effort; always ends `Disconnected`.
    async fn disconnect(&mut self);

    /// One send and one bounded receive.
    async fn send_and_receive(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, ModbusError>;
}

pub struct Connection {
    params: ConnectionParams,
    stream: Option<TcpStream>,
    state: ConnectionState,
    framer: Option<FramerVariant>,
}

impl Connection {
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            stream: None,
            state: ConnectionState::Disconnected,
            framer: None,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Variant that established the current session.
    pub fn framer(&self) -> Option<FramerVariant> {
        self.framer
    }

    async fn open(&self, address: &str, framer: FramerVariant) -> Result<TcpStream, ModbusError> {
        debug!("Connecting to {} with {} framer", address, framer);

        let stream = timeout(self.params.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ModbusError::ConnectFailed(format!(
                    "connect timed out after {}ms",
                    self.params.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| ModbusError::ConnectFailed(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("⚠️  Failed to set TCP_NODELAY: {}", e);
        }
        self.configure_keepalive(&stream);

        // The firmware tends to lose whatever arrives right after accept.
        sleep(self.params.settle_delay).await;

        match drain_input(&stream) {
            Ok(0) => {}
            Ok(n) => debug!("Discarded {} bytes received during settle window", n),
            Err(e) => {
                return Err(ModbusError::ConnectFailed(format!(
                    "peer closed during settle window: {}",
                    e
                )))
            }
        }

        Ok(stream)
    }

    fn configure_keepalive(&self, stream: &TcpStream) {
        let settings = &self.params.keepalive;
        let socket = SockRef::from(stream);

        #[allow(unused_mut)]
        let mut keepalive = TcpKeepalive::new().with_time(settings.idle);
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd", windows))]
        {
            keepalive = keepalive.with_interval(settings.interval);
        }
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
        {
            keepalive = keepalive.with_retries(settings.probes);
        }

        match socket.set_tcp_keepalive(&keepalive) {
            Ok(()) => debug!(
                "TCP keep-alive: idle {:?}, interval {:?}, {} probes",
                settings.idle, settings.interval, settings.probes
            ),
            Err(e) => warn!("⚠️  Keep-alive tuning unavailable, relying on periodic reads: {}", e),
        }
    }

    fn mark_lost(&mut self, reason: &ModbusError) {
        warn!("🔌 Connection to {} lost: {}", self.params.address(), reason);
        self.stream = None;
        self.framer = None;
        self.state = ConnectionState::Disconnected;
    }
}

#[async_trait]
impl Transport for Connection {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn unit_id(&self) -> u8 {
        self.params.unit_id
    }

    async fn connect(&mut self) -> Result<(), ModbusError> {
        if self.stream.is_some() {
            self.disconnect().await;
        }

        let address = self.params.address();
        self.state = ConnectionState::Connecting;
        info!("🔌 Connecting to controller at {} (unit {})", address, self.params.unit_id);

        let mut failures = Vec::new();
        for framer in self.params.framers.clone() {
            match self.open(&address, framer).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.framer = Some(framer);
                    self.state = ConnectionState::Connected;
                    info!("✅ Connected to {} using {} framer", address, framer);
                    return Ok(());
                }
                Err(e) => {
                    warn!("⚠️  {} framer failed for {}: {}", framer, address, e);
                    failures.push(format!("{}: {}", framer, e));
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        let reason = if failures.is_empty() {
            "no framer variants configured".to_string()
        } else {
            failures.join("; ")
        };
        error!("❌ Failed to connect to {}: {}", address, reason);
        Err(ModbusError::ConnectFailed(format!("{}: {}", address, reason)))
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error during TCP shutdown: {}", e);
            }
            info!("🔌 Disconnected from {}", self.params.address());
        }
        self.framer = None;
        self.state = ConnectionState::Disconnected;
    }

    async fn send_and_receive(&mut self, frame: &[u8], limit: Duration) -> Result<Vec<u8>, ModbusError> {
        if frame.len() < 2 {
            return Err(ModbusError::Internal("request frame too short".to_string()));
        }
        let (unit, function) = (frame[0], frame[1]);
        let use_gap = self.framer == Some(FramerVariant::Rtu);
        let gap = self.params.rtu_silence_gap;

        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;
        let result = exchange(stream, frame, unit, function, limit, use_gap.then_some(gap)).await;

        if let Err(err) = &result {
            if err.is_connection_loss() {
                self.mark_lost(err);
            }
        }
        result
    }
}

async fn exchange(
    stream: &mut TcpStream,
    frame: &[u8],
    unit: u8,
    function: u8,
    limit: Duration,
    silence_gap: Option<Duration>,
) -> Result<Vec<u8>, ModbusError> {
    let stale = drain_input(stream).map_err(|e| ModbusError::ConnectionClosed(e.to_string()))?;
    if stale > 0 {
        debug!("Discarded {} stale bytes before send", stale);
    }

    trace!("TX {}", hex::encode_upper(frame));
    stream.write_all(frame).await?;

    let deadline = Instant::now() + limit;
    let mut response = Vec::with_capacity(64);
    let mut chunk = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = match silence_gap {
            Some(gap) if !response.is_empty() => gap.min(remaining),
            _ => remaining,
        };

        match timeout(wait, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ModbusError::ConnectionClosed("peer closed the connection".to_string())),
            Ok(Ok(n)) => {
                response.extend_from_slice(&chunk[..n]);
                if response_complete(&response, unit, function) {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            // silence after data ends an RTU frame
            Err(_) if silence_gap.is_some() && !response.is_empty() => break,
            Err(_) => {}
        }
    }

    if response.is_empty() {
        return Err(ModbusError::Timeout);
    }
    trace!("RX {}", hex::encode_upper(&response));
    Ok(response)
}

/// Reads and drops whatever is already buffered. An orderly close from the
/// peer is reported as an error.
fn drain_input(stream: &TcpStream) -> io::Result<usize> {
    let mut scratch = [0u8; 256];
    let mut discarded = 0;
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")),
            Ok(n) => discarded += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(discarded),
            Err(e) => return Err(e),
        }
    }
}
