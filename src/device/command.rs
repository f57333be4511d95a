use std::fmt;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{SPEED_HIGH, SPEED_LOW, SPEED_MEDIUM, TRIGGER_OFF, TRIGGER_ON};
use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Power(bool),
    SetSpeed(u8), // [0, 100]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedPreset {
    Low,
    Medium,
    High,
}

impl SpeedPreset {
    pub fn percentage(&self) -> u8 {
        match self {
            SpeedPreset::Low => SPEED_LOW,
            SpeedPreset::Medium => SPEED_MEDIUM,
            SpeedPreset::High => SPEED_HIGH,
        }
    }
}

impl From<SpeedPreset> for Command {
    fn from(preset: SpeedPreset) -> Self {
        Command::SetSpeed(preset.percentage())
    }
}

/// How commands are laid out on the wire. Which one a given fan understands depends on its firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadFormat {
    /// A single ASCII trigger byte: "1" runs the fan at its default speed, "0" stops it.
    #[default]
    Trigger,
    /// A small JSON object such as `{"speed":66}` or `{"power":false}`.
    Json,
}

// externally tagged, so these serialize as {"power":true} and {"speed":66}
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum JsonCommand {
    Power(bool),
    Speed(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Some platform APIs only take base64 encoded characteristic values.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEncoder {
    service: Uuid,
    characteristic: Uuid,
    format: PayloadFormat,
}

impl CommandEncoder {
    pub fn new(service: Uuid, characteristic: Uuid, format: PayloadFormat) -> Self {
        CommandEncoder { service, characteristic, format }
    }

    pub fn encode(&self, command: Command) -> Result<EncodedCommand, SessionError> {
        if let Command::SetSpeed(pct) = command {
            if pct > 100 {
                return Err(SessionError::InvalidArgument {
                    reason: format!("speed must be a percentage in [0, 100], got {}", pct),
                });
            }
        }

        let payload = match self.format {
            PayloadFormat::Trigger => {
                let on = match command {
                    Command::Power(on) => on,
                    Command::SetSpeed(pct) => pct > 0,
                };
                if on { TRIGGER_ON.to_vec() } else { TRIGGER_OFF.to_vec() }
            },
            PayloadFormat::Json => {
                let json = match command {
                    Command::Power(on) => JsonCommand::Power(on),
                    Command::SetSpeed(pct) => JsonCommand::Speed(pct),
                };
                serde_json::to_vec(&json)
                    .map_err(|err| SessionError::InvalidArgument { reason: err.to_string() })?
            },
        };

        Ok(EncodedCommand {
            service: self.service,
            characteristic: self.characteristic,
            payload: Payload(payload),
        })
    }
}
