use std::io;
use std::str::Utf8Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Failures reported by a transport adapter.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    Unavailable,

    #[error("The transport does not know a device with id {id}")]
    UnknownDevice { id: String },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,
}

impl TransportError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            TransportError::Unavailable => true,
            TransportError::Btle { source } => matches!(source, btleplug::Error::PermissionDenied),
            _ => false,
        }
    }
}

/// Errors surfaced by the device session to its callers.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Bluetooth is not available on this system: {source}")]
    TransportUnavailable { source: TransportError },

    #[error("Failed to start scanning: {source}")]
    ScanStartFailed { source: TransportError },

    #[error("Device {id} could not be reached")]
    DeviceUnreachable { id: String, #[source] source: Option<TransportError> },

    #[error("Device {id} does not expose the fan service/characteristic")]
    ServiceDiscoveryFailed { id: String, #[source] source: Option<TransportError> },

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Failed to write command to device: {source}")]
    WriteFailed { source: TransportError },

    #[error("The device did not acknowledge the operation in time")]
    Timeout,

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    Transport { #[from] source: TransportError },

    #[error("{source}")]
    Session { #[from] source: SessionError },

    #[error("No {name} device found")]
    NotFound { name: String },

    #[error("Failed to run async runtime: {source}")]
    Runtime { source: std::io::Error },
}
