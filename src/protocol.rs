use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Fixed header overhead charged per message or command in the byte counters.
pub const FRAME_HEADER_LEN: usize = 8;

/// Size of an encoded command-long payload: 7 x f32 + u16 + 3 x u8.
pub const COMMAND_PAYLOAD_LEN: usize = 33;
const_assert_eq!(COMMAND_PAYLOAD_LEN, 7 * 4 + 2 + 3);

pub const DEFAULT_GCS_SYSTEM_ID: u8 = 255;
pub const DEFAULT_GCS_COMPONENT_ID: u8 = 0;

// Well-known command ids
pub const CMD_DO_MOTOR_TEST: u16 = 209;
pub const CMD_COMPONENT_ARM_DISARM: u16 = 400;

/// Magic param2 value that forces a disarm even while airborne.
pub const FORCE_DISARM_MAGIC: f32 = 21196.0;

pub type CommandPayload = [u8; COMMAND_PAYLOAD_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKind(pub u32);

impl MessageKind {
    pub const HEARTBEAT: MessageKind = MessageKind(0);
    pub const COMMAND_ACK: MessageKind = MessageKind(77);
    pub const AUTOPILOT_VERSION: MessageKind = MessageKind(148);
    pub const STATUSTEXT: MessageKind = MessageKind(253);

    pub fn name(self) -> &'static str {
        match self {
            Self::HEARTBEAT => "HEARTBEAT",
            Self::COMMAND_ACK => "COMMAND_ACK",
            Self::AUTOPILOT_VERSION => "AUTOPILOT_VERSION",
            Self::STATUSTEXT => "STATUSTEXT",
            _ => "UNKNOWN",
        }
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Inbound frame as delivered by the transport. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub system_id: u8,
    pub component_id: u8,
    pub kind: MessageKind,
    pub sequence: u8,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub checksum: u16,
    pub timestamp: u64, // ms since Unix epoch
}

impl Message {
    /// Bytes charged against the receive counter for this frame.
    pub fn wire_size(&self) -> usize {
        self.payload.len() + FRAME_HEADER_LEN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: u16,
    pub confirmation: u8,
    pub params: [f32; 7],
    pub target_system: u8,
    pub target_component: u8,
}

impl Command {
    pub fn new(command_id: u16, target_system: u8, target_component: u8) -> Self {
        Self {
            command_id,
            confirmation: 0,
            params: [0.0; 7],
            target_system,
            target_component,
        }
    }

    /// Set `param<index>` (1-based, as in the command catalog). Out of range indices are ignored.
    #[must_use]
    pub fn with_param(mut self, index: usize, value: f32) -> Self {
        if (1..=7).contains(&index) {
            self.params[index - 1] = value;
        }
        self
    }

    #[must_use]
    pub fn with_confirmation(mut self, confirmation: u8) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn param(&self, index: usize) -> Option<f32> {
        (1..=7).contains(&index).then(|| self.params[index - 1])
    }

    pub fn arm(target_system: u8, target_component: u8) -> Self {
        Self::new(CMD_COMPONENT_ARM_DISARM, target_system, target_component).with_param(1, 1.0)
    }

    pub fn disarm(target_system: u8, target_component: u8) -> Self {
        Self::new(CMD_COMPONENT_ARM_DISARM, target_system, target_component).with_param(1, 0.0)
    }

    pub fn force_disarm(target_system: u8, target_component: u8) -> Self {
        Self::disarm(target_system, target_component).with_param(2, FORCE_DISARM_MAGIC)
    }

    /// `throttle_pct` is sent with throttle type 0 (percent); duration in seconds.
    pub fn motor_test(
        target_system: u8,
        target_component: u8,
        motor: u8,
        throttle_pct: f32,
        duration_s: f32,
    ) -> Self {
        Self::new(CMD_DO_MOTOR_TEST, target_system, target_component)
            .with_param(1, f32::from(motor))
            .with_param(2, 0.0)
            .with_param(3, throttle_pct)
            .with_param(4, duration_s)
    }

    /// Pending-table key. A command and its re-sends share one key.
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.target_system, self.target_component, self.command_id, self.confirmation
        )
    }

    /// Command-long layout: param1..7 (f32 LE), command (u16 LE), target system,
    /// target component, confirmation.
    pub fn encode_payload(&self) -> CommandPayload {
        let mut out = [0u8; COMMAND_PAYLOAD_LEN];
        for (i, p) in self.params.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
        }
        out[28..30].copy_from_slice(&self.command_id.to_le_bytes());
        out[30] = self.target_system;
        out[31] = self.target_component;
        out[32] = self.confirmation;
        out
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < COMMAND_PAYLOAD_LEN {
            return Err(ProtocolError::Truncated {
                expected: COMMAND_PAYLOAD_LEN,
                actual: bytes.len(),
            });
        }

        let mut params = [0.0f32; 7];
        for (i, p) in params.iter_mut().enumerate() {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *p = f32::from_le_bytes(raw);
        }

        Ok(Self {
            params,
            command_id: u16::from_le_bytes([bytes[28], bytes[29]]),
            target_system: bytes[30],
            target_component: bytes[31],
            confirmation: bytes[32],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Accepted,
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    InProgress,
    Cancelled,
}

impl ResultCode {
    /// Whether an ack with this result resolves (rather than rejects) the pending command.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Accepted | ResultCode::InProgress)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ResultCode::Accepted,
            1 => ResultCode::TemporarilyRejected,
            2 => ResultCode::Denied,
            3 => ResultCode::Unsupported,
            4 => ResultCode::Failed,
            5 => ResultCode::InProgress,
            6 => ResultCode::Cancelled,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ResultCode::Accepted => "ACCEPTED",
            ResultCode::TemporarilyRejected => "TEMPORARILY_REJECTED",
            ResultCode::Denied => "DENIED",
            ResultCode::Unsupported => "UNSUPPORTED",
            ResultCode::Failed => "FAILED",
            ResultCode::InProgress => "IN_PROGRESS",
            ResultCode::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub command_id: u16,
    pub result: ResultCode,
}

impl Acknowledgment {
    pub fn new(command_id: u16, result: ResultCode) -> Self {
        Self { command_id, result }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown result code {0}")]
    UnknownResult(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_includes_target_command_and_confirmation() {
        let cmd = Command::arm(1, 1).with_confirmation(2);
        assert_eq!(cmd.key(), "1_1_400_2");
    }

    #[test]
    fn test_payload_layout() {
        let cmd = Command::force_disarm(3, 4);
        let bytes = cmd.encode_payload();

        assert_eq!(&bytes[0..4], &0.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &FORCE_DISARM_MAGIC.to_le_bytes());
        assert_eq!(u16::from_le_bytes([bytes[28], bytes[29]]), CMD_COMPONENT_ARM_DISARM);
        assert_eq!(bytes[30], 3);
        assert_eq!(bytes[31], 4);

        let decoded = Command::decode_payload(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let err = Command::decode_payload(&[0u8; 10]).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { expected: 33, actual: 10 });
    }

    #[test]
    fn test_result_code_classification() {
        assert!(ResultCode::Accepted.is_success());
        assert!(ResultCode::InProgress.is_success());
        assert!(!ResultCode::Denied.is_success());
        assert_eq!(ResultCode::from_u8(4), Some(ResultCode::Failed));
        assert_eq!(ResultCode::from_u8(9), None);
        assert_eq!(ResultCode::Cancelled.as_u8(), 6);
    }
}
