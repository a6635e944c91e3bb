use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};

use crate::protocol::{Message, ResultCode, FRAME_HEADER_LEN};

pub const MESSAGE_QUEUE_CAPACITY: usize = 100;
pub const COMMAND_HISTORY_CAPACITY: usize = 100;

/// Link is considered healthy while the last heartbeat is younger than this.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 5000;

pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub last_message_time: Option<u64>,
    pub last_heartbeat: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    pub command_id: u16,
    pub result: ResultCode,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub last_heartbeat: Option<u64>,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub link_quality: f32,
}

/// Bounded record of recent traffic plus running counters.
///
/// Both histories overwrite their oldest entry once full; readers always get
/// copies in arrival order.
#[derive(Debug)]
pub struct TelemetryRecorder {
    stats: TelemetryStats,
    message_queue: HistoryBuffer<Message, MESSAGE_QUEUE_CAPACITY>,
    command_history: HistoryBuffer<AckRecord, COMMAND_HISTORY_CAPACITY>,
}

pub type SharedTelemetry = Arc<Mutex<TelemetryRecorder>>;

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self {
            stats: TelemetryStats::default(),
            message_queue: HistoryBuffer::new(),
            command_history: HistoryBuffer::new(),
        }
    }

    pub fn shared() -> SharedTelemetry {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record_message(&mut self, message: Message) {
        self.stats.messages_received = self.stats.messages_received.saturating_add(1);
        self.stats.bytes_received = self
            .stats
            .bytes_received
            .saturating_add(message.wire_size() as u64);
        self.stats.last_message_time = Some(timestamp_ms());
        self.message_queue.write(message);
    }

    pub fn record_sent_message(&mut self, payload_size: usize) {
        self.stats.messages_sent = self.stats.messages_sent.saturating_add(1);
        self.stats.bytes_sent = self
            .stats
            .bytes_sent
            .saturating_add((payload_size + FRAME_HEADER_LEN) as u64);
    }

    pub fn record_ack(&mut self, command_id: u16, result: ResultCode) {
        self.command_history.write(AckRecord {
            command_id,
            result,
            timestamp: timestamp_ms(),
        });
    }

    pub fn record_error(&mut self) {
        self.stats.errors = self.stats.errors.saturating_add(1);
    }

    pub fn record_heartbeat(&mut self, at_ms: u64) {
        self.stats.last_heartbeat = Some(at_ms);
    }

    pub fn get_stats(&self) -> TelemetryStats {
        self.stats.clone()
    }

    pub fn get_message_queue(&self) -> Vec<Message> {
        self.message_queue.oldest_ordered().cloned().collect()
    }

    pub fn get_command_history(&self) -> Vec<AckRecord> {
        self.command_history.oldest_ordered().copied().collect()
    }

    pub fn clear_stats(&mut self) {
        self.stats = TelemetryStats::default();
        self.message_queue = HistoryBuffer::new();
        self.command_history = HistoryBuffer::new();
    }

    /// Quality is 1.0 within the heartbeat timeout, then decays linearly to 0.0 at twice the timeout.
    pub fn link_status(&self, now_ms: u64, connected: bool) -> LinkStatus {
        let link_quality = match (connected, self.stats.last_heartbeat) {
            (true, Some(last)) => {
                let age = now_ms.saturating_sub(last);
                if age <= HEARTBEAT_TIMEOUT_MS {
                    1.0
                } else {
                    let over = (age - HEARTBEAT_TIMEOUT_MS) as f32;
                    (1.0 - over / HEARTBEAT_TIMEOUT_MS as f32).max(0.0)
                }
            }
            _ => 0.0,
        };

        LinkStatus {
            connected,
            last_heartbeat: self.stats.last_heartbeat,
            messages_received: self.stats.messages_received,
            messages_sent: self.stats.messages_sent,
            link_quality,
        }
    }
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock(shared: &SharedTelemetry) -> MutexGuard<'_, TelemetryRecorder> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn message(sequence: u8) -> Message {
        Message {
            system_id: 1,
            component_id: 1,
            kind: MessageKind::HEARTBEAT,
            sequence,
            payload: vec![0; 9],
            checksum: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn test_queue_wraps_in_arrival_order() {
        let mut recorder = TelemetryRecorder::new();
        for seq in 0..105u8 {
            recorder.record_message(message(seq));
        }

        let queue = recorder.get_message_queue();
        assert_eq!(queue.len(), MESSAGE_QUEUE_CAPACITY);
        assert_eq!(queue.first().map(|m| m.sequence), Some(5));
        assert_eq!(queue.last().map(|m| m.sequence), Some(104));
    }

    #[test]
    fn test_link_quality_decay() {
        let mut recorder = TelemetryRecorder::new();
        assert_eq!(recorder.link_status(10_000, true).link_quality, 0.0);

        recorder.record_heartbeat(10_000);
        assert_eq!(recorder.link_status(14_000, true).link_quality, 1.0);
        assert!((recorder.link_status(17_500, true).link_quality - 0.5).abs() < 1e-6);
        assert_eq!(recorder.link_status(30_000, true).link_quality, 0.0);
        assert_eq!(recorder.link_status(10_500, false).link_quality, 0.0);
    }
}
