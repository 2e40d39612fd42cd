//! Wire types of the line protocol.

use crate::errors::{RigError, TransitionFailure};
use crate::registry::RegistryEvent;
use crate::selection::{ConfigRequest, ModeRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// An inbound command, already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetStatus { device_id: Option<String> },
    SelectDevice { device_id: Option<String>, request: ConfigRequest },
    EnablePreview { device_id: Option<String> },
    DisablePreview { device_id: Option<String> },
    StartRecording { device_id: Option<String> },
    StopRecording { device_id: Option<String> },
    TakeSnapshot { device_id: Option<String> },
    ResetDevice { device_id: Option<String> },
    Reprobe { device_id: Option<String> },
    Quit,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::GetStatus { .. } => "get_status",
            Command::SelectDevice { .. } => "select_device",
            Command::EnablePreview { .. } => "enable_preview",
            Command::DisablePreview { .. } => "disable_preview",
            Command::StartRecording { .. } => "start_recording",
            Command::StopRecording { .. } => "stop_recording",
            Command::TakeSnapshot { .. } => "take_snapshot",
            Command::ResetDevice { .. } => "reset_device",
            Command::Reprobe { .. } => "reprobe",
            Command::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not a JSON object with a string `command` field. Ignored on the wire.
    Malformed(String),
    Unsupported(String),
    InvalidArguments { verb: String, message: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed(reason) => write!(f, "malformed command: {}", reason),
            ParseError::Unsupported(verb) => write!(f, "unsupported command: {}", verb),
            ParseError::InvalidArguments { verb, message } => {
                write!(f, "invalid arguments for {}: {}", verb, message)
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Deserialize)]
struct TargetArgs {
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct SelectArgs {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(flatten)]
    request: ConfigRequest,
}

fn check_mode(role: &str, mode: Option<&ModeRequest>) -> Result<(), String> {
    match mode {
        Some(mode) if mode.width == 0 || mode.height == 0 => {
            Err(format!("{} size must be non-zero", role))
        }
        Some(ModeRequest { fps: Some(fps), .. }) if !(fps.is_finite() && *fps > 0.0) => {
            Err(format!("{} fps must be positive", role))
        }
        _ => Ok(()),
    }
}

/// Parse one protocol line.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let verb = value
        .as_object()
        .and_then(|object| object.get("command"))
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::Malformed("missing \"command\" field".to_string()))?
        .to_string();

    let invalid = |message: String| ParseError::InvalidArguments {
        verb: verb.clone(),
        message,
    };
    let target = || {
        serde_json::from_value::<TargetArgs>(value.clone())
            .map(|args| args.device_id)
            .map_err(|e| invalid(e.to_string()))
    };

    let command = match verb.as_str() {
        "get_status" => Command::GetStatus {
            device_id: target()?,
        },
        "select_device" => {
            let args: SelectArgs =
                serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;
            check_mode("preview", args.request.preview.as_ref()).map_err(invalid)?;
            check_mode("record", args.request.record.as_ref()).map_err(invalid)?;
            if let Some(cap) = args.request.target_fps_cap {
                if !(cap.is_finite() && cap > 0.0) {
                    return Err(invalid("target_fps_cap must be positive".to_string()));
                }
            }
            Command::SelectDevice {
                device_id: args.device_id,
                request: args.request,
            }
        }
        "enable_preview" => Command::EnablePreview {
            device_id: target()?,
        },
        "disable_preview" => Command::DisablePreview {
            device_id: target()?,
        },
        "start_recording" => Command::StartRecording {
            device_id: target()?,
        },
        "stop_recording" => Command::StopRecording {
            device_id: target()?,
        },
        "take_snapshot" => Command::TakeSnapshot {
            device_id: target()?,
        },
        "reset_device" => Command::ResetDevice {
            device_id: target()?,
        },
        "reprobe" => Command::Reprobe {
            device_id: target()?,
        },
        "quit" => Command::Quit,
        _ => return Err(ParseError::Unsupported(verb.clone())),
    };
    Ok(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Initialized,
    Searching,
    DeviceNotFound,
    DeviceDiscovered,
    CapabilitiesReady,
    DeviceSelected,
    PreviewStarted,
    PreviewStopped,
    RecordingStarted,
    RecordingStopped,
    SnapshotTaken,
    Status,
    Telemetry,
    Busy,
    Error,
    DeviceLost,
    DeviceReset,
    Quitting,
}

/// One outbound line: `{"type":"status","status":..,"timestamp":..,"data":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub status: StatusKind,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl StatusMessage {
    pub fn new(status: StatusKind, data: Value) -> Self {
        Self {
            message_type: "status".to_string(),
            status,
            timestamp: Utc::now(),
            data,
        }
    }

    /// An `error` status. `code` is the stable machine-readable reason.
    pub fn error(code: &str, detail: impl Into<String>, device_id: Option<&str>) -> Self {
        Self::new(
            StatusKind::Error,
            json!({
                "message": code,
                "detail": detail.into(),
                "device_id": device_id,
            }),
        )
    }

    pub fn failure(failure: &TransitionFailure, device_id: Option<&str>) -> Self {
        Self::error(failure.code(), failure.message.clone(), device_id)
    }

    pub fn to_line(&self) -> Result<String, RigError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&RegistryEvent> for StatusMessage {
    fn from(event: &RegistryEvent) -> Self {
        match event {
            RegistryEvent::Searching => StatusMessage::new(StatusKind::Searching, json!({})),
            RegistryEvent::DeviceNotFound => {
                StatusMessage::new(StatusKind::DeviceNotFound, json!({}))
            }
            RegistryEvent::DeviceDiscovered { device } => StatusMessage::new(
                StatusKind::DeviceDiscovered,
                json!({
                    "device_id": device.identity.stable_id,
                    "backend": device.identity.backend,
                    "friendly_name": device.identity.friendly_name,
                    "connection_hint": device.identity.connection_hint,
                    "generation": device.generation,
                }),
            ),
            RegistryEvent::CapabilitiesReady {
                stable_id,
                source,
                modes,
            } => StatusMessage::new(
                StatusKind::CapabilitiesReady,
                json!({ "device_id": stable_id, "source": source, "modes": modes }),
            ),
            RegistryEvent::DeviceSelected {
                stable_id,
                selection,
            } => StatusMessage::new(
                StatusKind::DeviceSelected,
                json!({
                    "device_id": stable_id,
                    "config": selection.config,
                    "warnings": selection.warnings,
                }),
            ),
            RegistryEvent::PreviewStarted { stable_id } => StatusMessage::new(
                StatusKind::PreviewStarted,
                json!({ "device_id": stable_id }),
            ),
            RegistryEvent::PreviewStopped { stable_id } => StatusMessage::new(
                StatusKind::PreviewStopped,
                json!({ "device_id": stable_id }),
            ),
            RegistryEvent::RecordingStarted { stable_id, path } => StatusMessage::new(
                StatusKind::RecordingStarted,
                json!({ "device_id": stable_id, "path": path }),
            ),
            RegistryEvent::RecordingStopped { stable_id, summary } => StatusMessage::new(
                StatusKind::RecordingStopped,
                json!({
                    "device_id": stable_id,
                    "path": summary.path,
                    "frames_written": summary.frames_written,
                    "bytes_written": summary.bytes_written,
                    "first_frame": summary.first_frame,
                    "last_frame": summary.last_frame,
                }),
            ),
            RegistryEvent::RecordingFailed { stable_id, message } => {
                StatusMessage::error("recording_failed", message.clone(), Some(stable_id))
            }
            RegistryEvent::SnapshotTaken {
                stable_id,
                path,
                frame_number,
            } => StatusMessage::new(
                StatusKind::SnapshotTaken,
                json!({ "device_id": stable_id, "path": path, "frame_number": frame_number }),
            ),
            RegistryEvent::DeviceError { stable_id, message } => {
                StatusMessage::error("device_fault", message.clone(), Some(stable_id))
            }
            RegistryEvent::DeviceLost { stable_id } => StatusMessage::new(
                StatusKind::DeviceLost,
                json!({ "device_id": stable_id }),
            ),
            RegistryEvent::DeviceReset { stable_id } => StatusMessage::new(
                StatusKind::DeviceReset,
                json!({ "device_id": stable_id }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    #[test]
    fn test_parse_targeted_verbs() {
        assert_eq!(
            parse_command(r#"{"command":"enable_preview","device_id":"cam-0001"}"#).unwrap(),
            Command::EnablePreview {
                device_id: Some("cam-0001".to_string())
            }
        );
        assert_eq!(
            parse_command(r#"{"command":"stop_recording"}"#).unwrap(),
            Command::StopRecording { device_id: None }
        );
        assert_eq!(parse_command(r#"{"command":"quit"}"#).unwrap(), Command::Quit);
    }

    #[test]
    fn test_parse_select() {
        let command = parse_command(
            r#"{"command":"select_device","device_id":"cam-0001",
                "preview":{"width":640,"height":480,"fps":60,"pixel_format":"RGB3"},
                "target_fps_cap":15}"#,
        )
        .unwrap();
        let Command::SelectDevice { device_id, request } = command else {
            panic!("expected select");
        };
        assert_eq!(device_id.as_deref(), Some("cam-0001"));
        let preview = request.preview.unwrap();
        assert_eq!((preview.width, preview.height), (640, 480));
        assert_eq!(preview.pixel_format, Some(PixelFormat::Rgb));
        assert_eq!(request.record, None);
        assert_eq!(request.target_fps_cap, Some(15.0));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_command("not json"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse_command("[1,2]"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse_command(r#"{"verb":"quit"}"#), Err(ParseError::Malformed(_))));
        assert_eq!(
            parse_command(r#"{"command":"self_destruct"}"#),
            Err(ParseError::Unsupported("self_destruct".to_string()))
        );
        assert!(matches!(
            parse_command(r#"{"command":"enable_preview","device_id":7}"#),
            Err(ParseError::InvalidArguments { .. })
        ));
        assert!(matches!(
            parse_command(r#"{"command":"select_device","preview":{"width":0,"height":480}}"#),
            Err(ParseError::InvalidArguments { .. })
        ));
        assert!(matches!(
            parse_command(r#"{"command":"select_device","target_fps_cap":-1}"#),
            Err(ParseError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_status_line_shape() {
        let line = StatusMessage::error("invalid_transition", "cannot start_record", Some("cam-0001"))
            .to_line()
            .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "error");
        assert_eq!(value["data"]["message"], "invalid_transition");
        assert_eq!(value["data"]["device_id"], "cam-0001");
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_event_mapping() {
        let message = StatusMessage::from(&RegistryEvent::DeviceLost {
            stable_id: "cam-0002".to_string(),
        });
        assert_eq!(message.status, StatusKind::DeviceLost);
        assert_eq!(message.data["device_id"], "cam-0002");

        let message = StatusMessage::from(&RegistryEvent::DeviceError {
            stable_id: "cam-0002".to_string(),
            message: "end of stream".to_string(),
        });
        assert_eq!(message.status, StatusKind::Error);
        assert_eq!(message.data["message"], "device_fault");
    }
}
