//! Stateless decoders for the inbound message kinds the link cares about.
//!
//! Every decoder is pure. [`parse_message`] is the entry point used by the
//! connection pipeline: it never fails, it logs and returns `None` instead.

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::protocol::{Acknowledgment, Message, MessageKind, ProtocolError, ResultCode};

pub const STATUS_TEXT_MAX_LEN: usize = 50;
pub const HEARTBEAT_PAYLOAD_LEN: usize = 9;
pub const AUTOPILOT_VERSION_MIN_LEN: usize = 20;
pub const COMMAND_ACK_MIN_LEN: usize = 3;

const MODE_FLAG_SAFETY_ARMED: u8 = 0x80;

pub type StatusText = ArrayString<STATUS_TEXT_MAX_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{kind} payload truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },
    #[error("unknown command result code {0}")]
    UnknownResult(u8),
    #[error("no decoder for {0}")]
    Unsupported(MessageKind),
}

impl From<ProtocolError> for ParseError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownResult(code) => ParseError::UnknownResult(code),
            ProtocolError::Truncated { expected, actual } => ParseError::Truncated {
                kind: MessageKind::COMMAND_ACK,
                expected,
                actual,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationLevel {
    Error,
    Warning,
    Info,
}

impl NotificationLevel {
    /// Severity 0..=3 (emergency..error) is an error, 4..=5 a warning, anything else info.
    pub fn from_severity(severity: u8) -> Self {
        if severity < 4 {
            NotificationLevel::Error
        } else if severity < 6 {
            NotificationLevel::Warning
        } else {
            NotificationLevel::Info
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub severity: u8,
    pub level: NotificationLevel,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub vehicle_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub protocol_version: u8,
}

impl Heartbeat {
    pub fn is_armed(&self) -> bool {
        self.base_mode & MODE_FLAG_SAFETY_ARMED != 0
    }

    pub fn autopilot_name(&self) -> &'static str {
        match self.autopilot {
            0 => "Generic",
            3 => "ArduPilot",
            12 => "PX4",
            8 => "Invalid",
            _ => "Unknown",
        }
    }

    pub fn vehicle_type_name(&self) -> &'static str {
        match self.vehicle_type {
            1 => "FixedWing",
            2 => "Quadcopter",
            4 => "Helicopter",
            6 => "GCS",
            10 => "GroundRover",
            12 => "Submarine",
            13 => "Hexacopter",
            14 => "Octocopter",
            _ => "Generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub capabilities: u64,
    pub version: u32,
    pub version_string: String,
    pub capability_names: Vec<String>,
}

/// Named protocol capability flags, in bit order.
pub const CAPABILITY_FLAGS: &[(u64, &str)] = &[
    (1 << 0, "MISSION_FLOAT"),
    (1 << 1, "PARAM_FLOAT"),
    (1 << 2, "MISSION_INT"),
    (1 << 3, "COMMAND_INT"),
    (1 << 4, "PARAM_ENCODE_BYTEWISE"),
    (1 << 5, "FTP"),
    (1 << 6, "SET_ATTITUDE_TARGET"),
    (1 << 7, "SET_POSITION_TARGET_LOCAL_NED"),
    (1 << 8, "SET_POSITION_TARGET_GLOBAL_INT"),
    (1 << 9, "TERRAIN"),
    (1 << 10, "SET_ACTUATOR_TARGET"),
    (1 << 11, "FLIGHT_TERMINATION"),
    (1 << 12, "COMPASS_CALIBRATION"),
    (1 << 13, "MAVLINK2"),
    (1 << 14, "MISSION_FENCE"),
    (1 << 15, "MISSION_RALLY"),
    (1 << 16, "FLIGHT_INFORMATION"),
    (1 << 17, "PARAM_ENCODE_C_CAST"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedMessage {
    Heartbeat(Heartbeat),
    Status(StatusNotification),
    Version(VersionInfo),
    Ack(Acknowledgment),
}

fn require(kind: MessageKind, payload: &[u8], expected: usize) -> Result<(), ParseError> {
    if payload.len() < expected {
        return Err(ParseError::Truncated {
            kind,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

pub fn decode_heartbeat(payload: &[u8]) -> Result<Heartbeat, ParseError> {
    require(MessageKind::HEARTBEAT, payload, HEARTBEAT_PAYLOAD_LEN)?;

    Ok(Heartbeat {
        custom_mode: read_u32(&payload[0..4]),
        vehicle_type: payload[4],
        autopilot: payload[5],
        base_mode: payload[6],
        system_status: payload[7],
        protocol_version: payload[8],
    })
}

/// Severity byte followed by up to 50 bytes of NUL-padded UTF-8.
pub fn decode_status_text(payload: &[u8]) -> Result<StatusNotification, ParseError> {
    require(MessageKind::STATUSTEXT, payload, 1)?;

    let severity = payload[0];
    let raw = &payload[1..payload.len().min(1 + STATUS_TEXT_MAX_LEN)];
    let raw = raw.split(|b| *b == 0).next().unwrap_or_default();

    let mut text = StatusText::new();
    for ch in String::from_utf8_lossy(raw).chars() {
        if text.try_push(ch).is_err() {
            break;
        }
    }

    Ok(StatusNotification {
        severity,
        level: NotificationLevel::from_severity(severity),
        text: text.to_string(),
    })
}

pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        (version >> 24) & 0xFF,
        (version >> 16) & 0xFF,
        (version >> 8) & 0xFF
    )
}

pub fn capability_names(capabilities: u64) -> Vec<&'static str> {
    CAPABILITY_FLAGS
        .iter()
        .filter(|(bit, _)| capabilities & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Capabilities (u64) at offset 0, flight software version (u32) at offset 16.
pub fn decode_autopilot_version(payload: &[u8]) -> Result<VersionInfo, ParseError> {
    require(MessageKind::AUTOPILOT_VERSION, payload, AUTOPILOT_VERSION_MIN_LEN)?;

    let capabilities = read_u64(&payload[0..8]);
    let version = read_u32(&payload[16..20]);

    Ok(VersionInfo {
        capabilities,
        version,
        version_string: format_version(version),
        capability_names: capability_names(capabilities)
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

/// Command id (u16 LE) followed by the result byte.
pub fn decode_command_ack(payload: &[u8]) -> Result<Acknowledgment, ParseError> {
    require(MessageKind::COMMAND_ACK, payload, COMMAND_ACK_MIN_LEN)?;

    let command_id = u16::from_le_bytes([payload[0], payload[1]]);
    let result = ResultCode::from_u8(payload[2]).ok_or(ProtocolError::UnknownResult(payload[2]))?;
    Ok(Acknowledgment::new(command_id, result))
}

pub fn try_parse_message(message: &Message) -> Result<ParsedMessage, ParseError> {
    match message.kind {
        MessageKind::HEARTBEAT => decode_heartbeat(&message.payload).map(ParsedMessage::Heartbeat),
        MessageKind::STATUSTEXT => decode_status_text(&message.payload).map(ParsedMessage::Status),
        MessageKind::AUTOPILOT_VERSION => {
            decode_autopilot_version(&message.payload).map(ParsedMessage::Version)
        }
        MessageKind::COMMAND_ACK => decode_command_ack(&message.payload).map(ParsedMessage::Ack),
        other => Err(ParseError::Unsupported(other)),
    }
}

/// Decode a message, logging and swallowing failures. Unknown kinds yield `None` silently.
pub fn parse_message(message: &Message) -> Option<ParsedMessage> {
    match try_parse_message(message) {
        Ok(parsed) => Some(parsed),
        Err(ParseError::Unsupported(_)) => None,
        Err(e) => {
            warn!(
                system_id = message.system_id,
                sequence = message.sequence,
                "dropping {}: {}",
                message.kind,
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_formatting_uses_upper_three_bytes() {
        assert_eq!(format_version(0x0405_02FF), "4.5.2");
        assert_eq!(format_version(0), "0.0.0");
    }

    #[test]
    fn test_capability_decoding_returns_only_set_flags() {
        let names = capability_names((1 << 2) | (1 << 13));
        assert_eq!(names, vec!["MISSION_INT", "MAVLINK2"]);
        assert!(capability_names(0).is_empty());
    }

    #[test]
    fn test_severity_classification_boundaries() {
        assert_eq!(NotificationLevel::from_severity(0), NotificationLevel::Error);
        assert_eq!(NotificationLevel::from_severity(3), NotificationLevel::Error);
        assert_eq!(NotificationLevel::from_severity(4), NotificationLevel::Warning);
        assert_eq!(NotificationLevel::from_severity(5), NotificationLevel::Warning);
        assert_eq!(NotificationLevel::from_severity(6), NotificationLevel::Info);
        assert_eq!(NotificationLevel::from_severity(7), NotificationLevel::Info);
    }
}
