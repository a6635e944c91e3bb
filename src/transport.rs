//! Transport seam between the protocol layer and the backend process.
//!
//! The protocol layer only needs three things from a transport: an async
//! `invoke(name, args)` call, named inbound event streams it can subscribe to,
//! and (optionally) a synchronous raw-frame send used by the emergency stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::{Acknowledgment, Command, Message, ResultCode};

// Routing keys understood by the backend
pub const INVOKE_SEND_COMMAND: &str = "send_mavlink_command";
pub const INVOKE_EMERGENCY_STOP_DIRECT: &str = "emergency_stop_direct";
pub const INVOKE_RESET_EMERGENCY_STOP: &str = "reset_emergency_stop";
pub const INVOKE_LOG_EMERGENCY_STOP: &str = "log_emergency_stop";

pub const DEFAULT_EVENT_PREFIX: &str = "mavlink";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("subscription to '{0}' failed")]
    Subscribe(String),
    #[error("operation not supported by this transport")]
    Unsupported,
    #[error("transport closed")]
    Closed,
}

/// One payload delivered on a named event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub event: String,
    pub payload: Value,
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

pub fn message_event_name(prefix: &str) -> String {
    format!("{prefix}-message")
}

pub fn ack_event_name(prefix: &str) -> String {
    format!("{prefix}-ack")
}

/// Handle returned by [`Transport::subscribe`]. Consuming it removes the subscription.
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn unsubscribe(self) {
        (self.0)();
    }
}

impl core::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Unsubscribe")
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, TransportError>;

    fn subscribe(&self, event: &str, sink: EventSink) -> Result<Unsubscribe, TransportError>;

    /// Lowest-level send that must not suspend. Only the emergency stop uses it.
    fn send_immediate(&self, _command: &str, _frame: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: String,
    pub args: Value,
    pub at: Instant,
}

/// Observer for raw frames accepted by [`LoopbackTransport::send_immediate`].
pub type FrameHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct LoopbackInner {
    invocations: Vec<Invocation>,
    subscribers: HashMap<String, Vec<(u64, EventSink)>>,
    next_subscription: u64,
    failing_commands: Vec<String>,
    fail_all_invokes: bool,
    fail_subscribe: Option<String>,
    auto_ack: Option<ResultCode>,
    immediate_enabled: bool,
    immediate_frames: Vec<Vec<u8>>,
    frame_hook: Option<FrameHook>,
}

/// In-process transport that plays the backend/autopilot side.
///
/// Records every invocation, can be told to fail, can answer commands with an
/// ack on the `<prefix>-ack` stream and exposes the bypass send.
#[derive(Clone)]
pub struct LoopbackTransport {
    prefix: String,
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_EVENT_PREFIX)
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            inner: Arc::new(Mutex::new(LoopbackInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Answer every `send_mavlink_command` with an ack carrying `result`.
    pub fn set_auto_ack(&self, result: Option<ResultCode>) {
        self.lock().auto_ack = result;
    }

    pub fn set_fail_invokes(&self, fail: bool) {
        self.lock().fail_all_invokes = fail;
    }

    pub fn fail_command(&self, command: &str) {
        self.lock().failing_commands.push(command.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing_commands.clear();
        inner.fail_all_invokes = false;
        inner.fail_subscribe = None;
    }

    /// Make subscribing to `event` fail.
    pub fn fail_subscription(&self, event: &str) {
        self.lock().fail_subscribe = Some(event.to_string());
    }

    pub fn enable_immediate(&self, enabled: bool) {
        self.lock().immediate_enabled = enabled;
    }

    pub fn set_frame_hook(&self, hook: FrameHook) {
        self.lock().frame_hook = Some(hook);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn invocations_of(&self, command: &str) -> Vec<Invocation> {
        self.lock()
            .invocations
            .iter()
            .filter(|inv| inv.command == command)
            .cloned()
            .collect()
    }

    pub fn immediate_frames(&self) -> Vec<Vec<u8>> {
        self.lock().immediate_frames.clone()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.lock().subscribers.get(event).map_or(0, Vec::len)
    }

    /// Deliver a payload to every subscriber of `event`. Returns the number of receivers.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        let inner = self.lock();
        let Some(sinks) = inner.subscribers.get(event) else {
            return 0;
        };

        sinks
            .iter()
            .filter(|(_, sink)| {
                sink.send(TransportEvent {
                    event: event.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            })
            .count()
    }

    pub fn emit_message(&self, message: &Message) -> usize {
        match serde_json::to_value(message) {
            Ok(payload) => self.emit(&message_event_name(&self.prefix), payload),
            Err(_) => 0,
        }
    }

    pub fn emit_ack(&self, ack: Acknowledgment) -> usize {
        match serde_json::to_value(ack) {
            Ok(payload) => self.emit(&ack_event_name(&self.prefix), payload),
            Err(_) => 0,
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, TransportError> {
        let auto_ack = {
            let mut inner = self.lock();
            inner.invocations.push(Invocation {
                command: command.to_string(),
                args: args.clone(),
                at: Instant::now(),
            });

            if inner.fail_all_invokes || inner.failing_commands.iter().any(|c| c == command) {
                return Err(TransportError::Send(format!("loopback refused '{command}'")));
            }

            inner.auto_ack
        };

        if let (Some(result), INVOKE_SEND_COMMAND) = (auto_ack, command) {
            if let Some(cmd) = args
                .get("command")
                .and_then(|v| serde_json::from_value::<Command>(v.clone()).ok())
            {
                self.emit_ack(Acknowledgment::new(cmd.command_id, result));
            }
        }

        Ok(Value::Bool(true))
    }

    fn subscribe(&self, event: &str, sink: EventSink) -> Result<Unsubscribe, TransportError> {
        let id = {
            let mut inner = self.lock();
            if inner.fail_subscribe.as_deref() == Some(event) {
                return Err(TransportError::Subscribe(event.to_string()));
            }
            let id = inner.next_subscription;
            inner.next_subscription += 1;
            inner
                .subscribers
                .entry(event.to_string())
                .or_default()
                .push((id, sink));
            id
        };

        let inner = Arc::clone(&self.inner);
        let event = event.to_string();
        Ok(Unsubscribe::new(move || {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(sinks) = inner.subscribers.get_mut(&event) {
                sinks.retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }

    fn send_immediate(&self, command: &str, frame: &[u8]) -> Result<(), TransportError> {
        // try_lock: the bypass path must never wait on another context
        let hook = {
            let mut inner = self.inner.try_lock().map_err(|_| TransportError::Closed)?;
            if !inner.immediate_enabled {
                return Err(TransportError::Unsupported);
            }
            if inner.failing_commands.iter().any(|c| c == command) {
                return Err(TransportError::Send(format!("loopback refused '{command}'")));
            }
            inner.immediate_frames.push(frame.to_vec());
            inner.frame_hook.clone()
        };

        if let Some(hook) = hook {
            hook(frame);
        }
        Ok(())
    }
}
