use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::devices::parameters::{instrument_groups, instrument_parameters, validate_layout};
use crate::devices::{ParameterSpec, PollGroup, SpectrumLayout};
use crate::modbus::connection::{ConnectionParams, FramerVariant, KeepAliveSettings};
use crate::modbus::executor::{OperationTimeouts, RetryPolicy};
use crate::modbus::protocol::MAX_READ_QUANTITY;
use crate::services::liveness::LivenessSettings;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub timing: TimingConfig,
    pub liveness: LivenessConfig,
    pub polling: PollingConfig,
    pub output: OutputConfig,
    pub spectrum: SpectrumLayout,
    pub groups: Vec<PollGroup>,
    pub parameters: Vec<ParameterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Tried in order on every connect.
    pub framers: Vec<FramerVariant>,
    pub connect_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub keepalive_idle_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_probes: u32,
    pub rtu_silence_gap_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub single_read_timeout_ms: u64,
    pub multi_read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub inter_chunk_delay_ms: u64,
    pub max_chunk: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub stale_after_ms: u64,
    pub reconnect_cooldown_ms: u64,
    pub monitor_tick_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub write_suppression_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// "console" or "json".
    pub format: String,
    pub show_snapshot_on_exit: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 503,
            unit_id: 1,
            framers: vec![FramerVariant::Socket, FramerVariant::Rtu],
            connect_timeout_ms: 3000,
            settle_delay_ms: 200,
            keepalive_idle_secs: 2,
            keepalive_interval_secs: 2,
            keepalive_probes: 3,
            rtu_silence_gap_ms: 20,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            single_read_timeout_ms: 2000,
            multi_read_timeout_ms: 500,
            write_timeout_ms: 2000,
            retry_attempts: 2,
            retry_delay_ms: 50,
            inter_chunk_delay_ms: 10,
            max_chunk: 10,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 3000,
            reconnect_cooldown_ms: 3000,
            monitor_tick_ms: 500,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300,
            write_suppression_ms: 500,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "console".to_string(),
            show_snapshot_on_exit: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            timing: TimingConfig::default(),
            liveness: LivenessConfig::default(),
            polling: PollingConfig::default(),
            output: OutputConfig::default(),
            spectrum: SpectrumLayout::default(),
            groups: instrument_groups(),
            parameters: instrument_parameters(),
        }
    }
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, ModbusError> {
    match matches.try_get_one::<String>(name) {
        Ok(Some(raw)) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ModbusError::ConfigError(format!("invalid value '{}' for --{}", raw, name))),
        _ => Ok(None),
    }
}

impl Config {
    /// Loads `--config` if given, then applies the connection overrides.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ModbusError> {
        let mut config = match matches.try_get_one::<String>("config") {
            Ok(Some(path)) => Self::from_file(path)?,
            _ => Self::default(),
        };

        if let Ok(Some(host)) = matches.try_get_one::<String>("host") {
            config.connection.host = host.clone();
        }
        if let Some(port) = parse_arg(matches, "port")? {
            config.connection.port = port;
        }
        if let Some(unit_id) = parse_arg(matches, "unit")? {
            config.connection.unit_id = unit_id;
        }
        if let Some(interval) = parse_arg(matches, "interval")? {
            config.polling.interval_ms = interval;
        }
        if let Some(max_chunk) = parse_arg(matches, "max-chunk")? {
            config.timing.max_chunk = max_chunk;
        }
        if let Ok(Some(format)) = matches.try_get_one::<String>("format") {
            config.output.format = format.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ModbusError::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)?;
        info!("📄 Loaded configuration from {}", path.display());
        debug!(
            "{} poll groups, {} parameters",
            config.groups.len(),
            config.parameters.len()
        );
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ModbusError::ConfigError(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| ModbusError::ConfigError(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        let invalid = |message: &str| Err(ModbusError::ConfigError(message.to_string()));
        let connection = &self.connection;
        let timing = &self.timing;

        if connection.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if connection.port == 0 {
            return invalid("port must not be 0");
        }
        if connection.unit_id == 0 || connection.unit_id > 247 {
            return invalid("unit id must be between 1 and 247");
        }
        if connection.framers.is_empty() {
            return invalid("at least one framer must be configured");
        }
        if connection.connect_timeout_ms == 0 {
            return invalid("connect timeout must be positive");
        }
        if timing.max_chunk == 0 || timing.max_chunk > MAX_READ_QUANTITY {
            return invalid("max chunk must be between 1 and 125 registers");
        }
        if timing.single_read_timeout_ms == 0 || timing.multi_read_timeout_ms == 0 || timing.write_timeout_ms == 0 {
            return invalid("operation timeouts must be positive");
        }
        if timing.retry_attempts == 0 {
            return invalid("retry attempts must be at least 1");
        }
        if self.polling.interval_ms == 0 {
            return invalid("poll interval must be positive");
        }
        if self.liveness.monitor_tick_ms == 0 {
            return invalid("monitor tick must be positive");
        }

        validate_layout(&self.groups, &self.parameters)
    }

    pub fn connection_params(&self) -> ConnectionParams {
        let connection = &self.connection;
        ConnectionParams {
            host: connection.host.clone(),
            port: connection.port,
            unit_id: connection.unit_id,
            framers: connection.framers.clone(),
            connect_timeout: Duration::from_millis(connection.connect_timeout_ms),
            settle_delay: Duration::from_millis(connection.settle_delay_ms),
            keepalive: KeepAliveSettings {
                idle: Duration::from_secs(connection.keepalive_idle_secs),
                interval: Duration::from_secs(connection.keepalive_interval_secs),
                probes: connection.keepalive_probes,
            },
            rtu_silence_gap: Duration::from_millis(connection.rtu_silence_gap_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.timing.retry_attempts,
            delay: Duration::from_millis(self.timing.retry_delay_ms),
        }
    }

    pub fn operation_timeouts(&self) -> OperationTimeouts {
        OperationTimeouts {
            single_read: Duration::from_millis(self.timing.single_read_timeout_ms),
            multi_read: Duration::from_millis(self.timing.multi_read_timeout_ms),
            write: Duration::from_millis(self.timing.write_timeout_ms),
            inter_chunk_delay: Duration::from_millis(self.timing.inter_chunk_delay_ms),
        }
    }

    pub fn liveness_settings(&self) -> LivenessSettings {
        LivenessSettings {
            stale_after: Duration::from_millis(self.liveness.stale_after_ms),
            reconnect_cooldown: Duration::from_millis(self.liveness.reconnect_cooldown_ms),
            tick: Duration::from_millis(self.liveness.monitor_tick_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    pub fn write_suppression(&self) -> Duration {
        Duration::from_millis(self.polling.write_suppression_ms)
    }
}
