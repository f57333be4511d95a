use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::command::PayloadFormat;
use crate::device::constants::{
    CONNECT_DEADLINE, DISCONNECT_DEADLINE, FAN_COMMAND_CHARACTERISTIC, FAN_SERVICE, SCAN_WINDOW, TARGET_NAME,
    WRITE_DEADLINE,
};
use crate::device::session::SessionConfig;

/// Persisted settings. Every field is optional in the file, missing ones take the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub target_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub payload_format: PayloadFormat,
    pub scan_window_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            target_name: self.target_name.clone(),
            service_id: self.service_uuid,
            characteristic_id: self.characteristic_uuid,
            payload_format: self.payload_format,
            scan_window: Duration::from_millis(self.scan_window_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_name: String::from(TARGET_NAME),
            service_uuid: FAN_SERVICE,
            characteristic_uuid: FAN_COMMAND_CHARACTERISTIC,
            payload_format: PayloadFormat::Trigger,
            scan_window_ms: SCAN_WINDOW,
            connect_timeout_ms: CONNECT_DEADLINE,
            write_timeout_ms: WRITE_DEADLINE,
            disconnect_timeout_ms: DISCONNECT_DEADLINE,
        }
    }
}
