use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("CRC checksum mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Device exception on function {function:#04x}: {} ({code})", exception_label(.code))]
    DeviceException { function: u8, code: u8 },

    #[error("Truncated response: frame declares {declared} bytes, {available} received")]
    Truncated { declared: usize, available: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    ConnectFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Parameter {0} is read-only")]
    NotWritable(String),

    #[error("Value {value} out of range for {key}")]
    ValueOutOfRange { key: String, value: f64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModbusError {
    /// Errors worth a second attempt on the same connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout
                | ModbusError::MalformedResponse(_)
                | ModbusError::CrcMismatch { .. }
                | ModbusError::Truncated { .. }
        )
    }

    /// True when the error means the socket is gone and a reconnect is required.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ModbusError::ConnectionClosed(_) | ModbusError::NotConnected)
    }
}

fn exception_label(code: &u8) -> &'static str {
    exception_name(*code)
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "Illegal Function",
        2 => "Illegal Data Address",
        3 => "Illegal Data Value",
        4 => "Slave Device Failure",
        5 => "Acknowledge",
        6 => "Slave Device Busy",
        8 => "Memory Parity Error",
        10 => "Gateway Path Unavailable",
        11 => "Gateway Target Failed To Respond",
        _ => "Unknown Exception",
    }
}

impl From<io::Error> for ModbusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ModbusError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => ModbusError::ConnectionClosed(err.to_string()),
            _ => ModbusError::ConnectionClosed(format!("IO error: {}", err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::ConfigError(format!("TOML write error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ModbusError::Timeout.is_retryable());
        assert!(ModbusError::MalformedResponse("short".into()).is_retryable());
        assert!(ModbusError::CrcMismatch { expected: 1, received: 2 }.is_retryable());
        assert!(!ModbusError::ConnectionClosed("reset".into()).is_retryable());
        assert!(!ModbusError::DeviceException { function: 4, code: 2 }.is_retryable());
        assert!(!ModbusError::NotConnected.is_retryable());
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        assert!(matches!(ModbusError::from(reset), ModbusError::ConnectionClosed(_)));

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(ModbusError::from(timed_out), ModbusError::Timeout);
    }

    #[test]
    fn test_exception_message() {
        let err = ModbusError::DeviceException { function: 0x04, code: 2 };
        assert!(err.to_string().contains("Illegal Data Address"));
    }
}
