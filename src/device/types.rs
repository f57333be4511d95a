use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque platform address of a peripheral (a MAC address on most platforms, a UUID on macOS).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        DeviceId::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>, name: Option<&str>) -> Self {
        DeviceDescriptor {
            id: id.into(),
            name: name.map(String::from),
            rssi: None,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "{} {} ({} dBm)", self.id, self.name.as_deref().unwrap_or("NONE"), rssi),
            None => write!(f, "{} {}", self.id, self.name.as_deref().unwrap_or("NONE")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        };

        write!(f, "{}", result)
    }
}

/// Read-only snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub descriptor: Option<DeviceDescriptor>,
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    StateChange(SessionState),
    // the link dropped without anyone asking for it
    LinkLost(DeviceDescriptor),
}
