//! Error types for the C64 Ultimate receiver

use thiserror::Error;

/// Main error type for the receiver
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Source is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors, reported to the caller of `open`/`update`
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {name} port: {port} (expected 1024..=65535)")]
    InvalidPort { name: &'static str, port: u16 },

    #[error("Video and audio ports must differ (both {0})")]
    PortConflict(u16),

    #[error("Invalid buffer delay: {0} ms (expected 0..=500)")]
    InvalidDelay(u32),

    #[error("Invalid device host: {0:?}")]
    InvalidHost(String),

    #[error("Invalid IPv4 address for {field}: {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file error: {0}")]
    File(#[from] std::io::Error),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to resolve host {0:?}")]
    Resolve(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Thread spawn failed: {0}")]
    Spawn(String),
}

/// TCP reachability probe failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Invalid address")]
    InvalidAddress,

    #[error("Connection refused")]
    Refused,

    #[error("Connection timed out")]
    Timeout,

    #[error("Host unreachable")]
    Unreachable,
}

/// Wire protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Wrong packet length: expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Unexpected {field}: {value}")]
    UnexpectedField { field: &'static str, value: u32 },

    #[error("Packet index out of range: {0}")]
    IndexOutOfRange(usize),

    #[error("Malformed control command: {0}")]
    MalformedCommand(String),
}

/// Result type alias for the receiver
pub type Result<T> = std::result::Result<T, Error>;
