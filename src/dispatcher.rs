//! In-flight command tracking with ACK/NACK correlation.
//!
//! Every command sent through [`CommandDispatcher::send_command`] gets an entry
//! in an insertion-ordered pending table. The entry is settled exactly once:
//! by a matching ack, by timeout exhaustion, by eviction when the table is
//! full, by a local send failure, or by [`CommandDispatcher::clear_pending`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{Acknowledgment, Command, ResultCode, COMMAND_PAYLOAD_LEN};
use crate::telemetry::{self, SharedTelemetry};
use crate::transport::{Transport, TransportError, INVOKE_SEND_COMMAND};

pub const MAX_PENDING_COMMANDS: usize = 16;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("transport send failed: {0}")]
    SendFailed(TransportError),
    #[error("command {key} timed out after {retries} retries")]
    Timeout { key: String, retries: u32 },
    #[error("pending queue full, command {key} evicted")]
    QueueFull { key: String },
    #[error("command rejected by vehicle: {0}")]
    Rejected(ResultCode),
    #[error("service shutting down")]
    ShuttingDown,
    #[error("command {key} is already pending")]
    Duplicate { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SendOptions {
    pub fn new(timeout_ms: u64, max_retries: u32) -> Self {
        Self {
            timeout_ms,
            max_retries,
        }
    }
}

/// Read-only view of a pending entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub key: String,
    pub command: Command,
    pub issued_at: Instant,
    pub retry_count: u32,
    pub request_id: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub commands_sent: u64,
    pub acks_matched: u64,
    pub acks_unmatched: u64,
    pub timeouts: u64,
    pub evictions: u64,
    pub send_failures: u64,
}

type Outcome = Result<ResultCode, DispatchError>;

struct PendingEntry {
    info: PendingCommand,
    responder: Option<oneshot::Sender<Outcome>>,
}

impl PendingEntry {
    /// Settling twice is a no-op.
    fn settle(&mut self, outcome: Outcome) {
        if let Some(responder) = self.responder.take() {
            // Receiver gone means the caller already gave up
            let _ = responder.send(outcome);
        }
    }
}

struct DispatchState {
    pending: IndexMap<String, PendingEntry>,
    next_request_id: u64,
    stats: DispatcherStats,
}

pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    telemetry: SharedTelemetry,
    state: Mutex<DispatchState>,
    capacity: usize,
    defaults: SendOptions,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>, telemetry: SharedTelemetry) -> Self {
        Self::with_config(transport, telemetry, MAX_PENDING_COMMANDS, SendOptions::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        telemetry: SharedTelemetry,
        capacity: usize,
        defaults: SendOptions,
    ) -> Self {
        Self {
            transport,
            telemetry,
            state: Mutex::new(DispatchState {
                pending: IndexMap::with_capacity(capacity),
                next_request_id: 1,
                stats: DispatcherStats::default(),
            }),
            capacity: capacity.max(1),
            defaults,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_options(&self) -> SendOptions {
        self.defaults
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Send with the dispatcher's default timeout and retry budget.
    pub async fn send(&self, command: Command) -> Result<ResultCode, DispatchError> {
        self.send_command(command, self.defaults).await
    }

    /// Send `command` and wait for its acknowledgment.
    ///
    /// The first transport send happens on first poll. Each attempt, send
    /// included, gets `timeout_ms` before it counts as a timeout. Dropping the
    /// returned future removes the pending entry.
    pub async fn send_command(
        &self,
        command: Command,
        options: SendOptions,
    ) -> Result<ResultCode, DispatchError> {
        let key = command.key();
        let (tx, mut rx) = oneshot::channel();
        let request_id = self.register(&key, command, tx)?;
        let _guard = PendingGuard {
            dispatcher: self,
            key: key.clone(),
            request_id,
        };

        let timeout = Duration::from_millis(options.timeout_ms);
        let mut retries = 0u32;

        loop {
            // The ack window covers the send itself, so a stalled transport still times out
            let attempt = tokio::select! {
                biased;
                attempt = async {
                    self.transmit(&command).await?;
                    Ok::<_, TransportError>((&mut rx).await.unwrap_or(Err(DispatchError::ShuttingDown)))
                } => Some(attempt),
                () = tokio::time::sleep(timeout) => None,
            };

            match attempt {
                Some(Ok(settled)) => return settled,
                Some(Err(e)) => {
                    if self.take_entry(&key, request_id).is_none() {
                        // Settled by an ack or eviction while the send was in flight
                        return rx.await.unwrap_or(Err(DispatchError::ShuttingDown));
                    }
                    self.lock().stats.send_failures += 1;
                    warn!(key = %key, "send failed: {}", e);
                    return Err(DispatchError::SendFailed(e));
                }
                None => {}
            }

            if retries >= options.max_retries {
                if self.take_entry(&key, request_id).is_none() {
                    return rx.await.unwrap_or(Err(DispatchError::ShuttingDown));
                }
                self.lock().stats.timeouts += 1;
                warn!(key = %key, retries, "command timed out");
                return Err(DispatchError::Timeout { key, retries });
            }

            retries += 1;
            if let Some(entry) = self.lock().pending.get_mut(&key) {
                if entry.info.request_id == request_id {
                    entry.info.retry_count = retries;
                }
            }
            debug!(key = %key, retries, "no ack, re-sending");
        }
    }

    fn register(
        &self,
        key: &str,
        command: Command,
        responder: oneshot::Sender<Outcome>,
    ) -> Result<u64, DispatchError> {
        let mut state = self.lock();

        if state.pending.contains_key(key) {
            return Err(DispatchError::Duplicate {
                key: key.to_string(),
            });
        }

        while state.pending.len() >= self.capacity {
            let Some((evicted_key, mut entry)) = state.pending.shift_remove_index(0) else {
                break;
            };
            state.stats.evictions += 1;
            warn!(key = %evicted_key, "pending queue full, evicting oldest command");
            entry.settle(Err(DispatchError::QueueFull { key: evicted_key }));
        }

        let request_id = state.next_request_id;
        state.next_request_id += 1;
        state.pending.insert(
            key.to_string(),
            PendingEntry {
                info: PendingCommand {
                    key: key.to_string(),
                    command,
                    issued_at: Instant::now(),
                    retry_count: 0,
                    request_id,
                },
                responder: Some(responder),
            },
        );

        Ok(request_id)
    }

    async fn transmit(&self, command: &Command) -> Result<(), TransportError> {
        self.transport
            .invoke(INVOKE_SEND_COMMAND, json!({ "command": command }))
            .await?;

        telemetry::lock(&self.telemetry).record_sent_message(COMMAND_PAYLOAD_LEN);
        self.lock().stats.commands_sent += 1;
        Ok(())
    }

    /// Remove the entry only if it still belongs to `request_id`.
    fn take_entry(&self, key: &str, request_id: u64) -> Option<PendingCommand> {
        let mut state = self.lock();
        match state.pending.get(key) {
            Some(entry) if entry.info.request_id == request_id => {
                state.pending.shift_remove(key).map(|entry| entry.info)
            }
            _ => None,
        }
    }

    /// Resolve the first pending command (insertion order) with a matching command id.
    ///
    /// Commands of the same kind are not told apart beyond the command id.
    /// Returns whether a pending command was settled.
    pub fn handle_ack(&self, ack: Acknowledgment) -> bool {
        let mut state = self.lock();

        let Some(index) = state
            .pending
            .values()
            .position(|entry| entry.info.command.command_id == ack.command_id)
        else {
            state.stats.acks_unmatched += 1;
            debug!(command_id = ack.command_id, result = %ack.result, "ack without pending command");
            return false;
        };

        let Some((key, mut entry)) = state.pending.shift_remove_index(index) else {
            return false;
        };
        state.stats.acks_matched += 1;

        let outcome = if ack.result.is_success() {
            Ok(ack.result)
        } else {
            debug!(key = %key, result = %ack.result, "command rejected");
            Err(DispatchError::Rejected(ack.result))
        };
        entry.settle(outcome);
        true
    }

    /// Reject and drop every pending command. Returns how many were cleared.
    pub fn clear_pending(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.pending.len();
        for (_, mut entry) in state.pending.drain(..) {
            entry.settle(Err(DispatchError::ShuttingDown));
        }
        cleared
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.lock()
            .pending
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().pending.contains_key(key)
    }

    pub fn stats(&self) -> DispatcherStats {
        self.lock().stats
    }
}

struct PendingGuard<'a> {
    dispatcher: &'a CommandDispatcher,
    key: String,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.take_entry(&self.key, self.request_id);
    }
}
