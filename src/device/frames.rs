//! Device wire frames
//!
//! ESP meters speak JSON over the WebSocket. Inbound frames are loosely
//! shaped: registration, warnings, and telemetry all arrive on the same
//! connection and are told apart by which fields are present.

use serde::{Deserialize, Serialize};

/// Inbound frame from a metering device
///
/// Unknown fields are ignored so firmware can add diagnostics without
/// breaking older servers.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceFrame {
    pub device_id: String,
    /// Control messages, e.g. "REGISTER"
    #[serde(default)]
    pub message: Option<String>,
    /// Device-side diagnostic, logged and discarded
    #[serde(default)]
    pub warning: Option<String>,
    /// Cumulative energy delivered so far (kWh)
    #[serde(default)]
    pub energy: Option<f64>,
    /// Instantaneous power (W), informational only
    #[serde(default)]
    pub power: Option<f64>,
    /// Line voltage (V), informational only
    #[serde(default)]
    pub voltage: Option<f64>,
}

impl DeviceFrame {
    pub fn is_register(&self) -> bool {
        self.message.as_deref() == Some("REGISTER")
    }
}

/// Outbound command to a metering device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCommand {
    pub device_id: String,
    pub message: CommandKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandKind {
    #[serde(rename = "START_TRANSFER")]
    StartTransfer,
    #[serde(rename = "STOP_TRANSFER")]
    StopTransfer,
}

impl DeviceCommand {
    pub fn start(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            message: CommandKind::StartTransfer,
            reason: None,
        }
    }

    pub fn stop(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            message: CommandKind::StopTransfer,
            reason: Some(reason.into()),
        }
    }
}

/// Everything the server can write to a device connection
///
/// Serialized untagged: the device sees plain command / ack / error objects.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Command(DeviceCommand),
    Ack(RegisterAck),
    Error(ErrorFrame),
}

/// Acknowledgment sent back on a successful REGISTER
#[derive(Debug, Clone, Serialize)]
pub struct RegisterAck {
    pub status: &'static str,
    pub device_id: String,
}

impl RegisterAck {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            status: "REGISTERED",
            device_id: device_id.into(),
        }
    }
}

/// Error frame sent to a connection whose request was rejected
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    pub error: bool,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_frame() {
        let frame: DeviceFrame =
            serde_json::from_str(r#"{"device_id":"esp-01","message":"REGISTER"}"#).unwrap();
        assert!(frame.is_register());
        assert_eq!(frame.device_id, "esp-01");
        assert!(frame.energy.is_none());
    }

    #[test]
    fn test_parse_telemetry_frame() {
        let frame: DeviceFrame = serde_json::from_str(
            r#"{"device_id":"esp-01","energy":42.5,"power":1200.0,"voltage":229.8}"#,
        )
        .unwrap();
        assert!(!frame.is_register());
        assert_eq!(frame.energy, Some(42.5));
    }

    #[test]
    fn test_parse_tolerates_unknown_fields() {
        let frame: DeviceFrame =
            serde_json::from_str(r#"{"device_id":"esp-01","energy":1.0,"rssi":-67}"#).unwrap();
        assert_eq!(frame.energy, Some(1.0));
    }

    #[test]
    fn test_command_serialization() {
        let cmd = DeviceCommand::stop("esp-01", "transfer complete");
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"STOP_TRANSFER\""));
        assert!(json.contains("transfer complete"));

        let cmd = DeviceCommand::start("esp-01");
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"START_TRANSFER\""));
        assert!(!json.contains("reason"));
    }
}
