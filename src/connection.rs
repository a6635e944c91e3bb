use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{Acknowledgment, Message, DEFAULT_GCS_COMPONENT_ID, DEFAULT_GCS_SYSTEM_ID};
use crate::transport::{
    ack_event_name, message_event_name, Transport, TransportError, TransportEvent, Unsubscribe,
    DEFAULT_EVENT_PREFIX,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("invalid connection string '{0}'")]
    InvalidConnectionString(String),
    #[error("subscription failed: {0}")]
    Subscribe(#[from] TransportError),
    #[error("no async runtime available to drive inbound events")]
    NoRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub system_id: u8,
    pub component_id: u8,
    pub event_prefix: String,
    pub connection_string: Option<String>,
    /// Vehicle addressed by outgoing commands.
    pub target_system: u8,
    pub target_component: u8,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            system_id: DEFAULT_GCS_SYSTEM_ID,
            component_id: DEFAULT_GCS_COMPONENT_ID,
            event_prefix: DEFAULT_EVENT_PREFIX.to_string(),
            connection_string: None,
            target_system: 1,
            target_component: 1,
        }
    }
}

/// Accepts `udp://host:port`, `tcp://host:port`, `/dev/<tty>:<baud>` and `COM<n>:<baud>`.
pub fn validate_connection_string(conn: &str) -> bool {
    if let Some(rest) = conn
        .strip_prefix("udp://")
        .or_else(|| conn.strip_prefix("tcp://"))
    {
        return rest.contains(':') && conn.len() > 10;
    }

    if conn.starts_with("/dev/") || conn.starts_with("COM") {
        return match conn.rsplit_once(':') {
            Some((port, baud)) => !port.is_empty() && baud.parse::<u32>().is_ok(),
            None => false,
        };
    }

    false
}

/// Receives decoded inbound traffic, in arrival order, from the connection pump.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, message: Message);

    fn on_ack(&self, ack: Acknowledgment);

    fn on_decode_error(&self, event: &str, error: &str) {
        warn!(event, "undecodable inbound payload: {}", error);
    }
}

/// Owns the subscriptions to the transport's message and ack streams.
///
/// Both streams feed one channel; a single pump task drains it and hands each
/// decoded item to the registered [`InboundHandler`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    connected: bool,
    message_subscription: Option<Unsubscribe>,
    ack_subscription: Option<Unsubscribe>,
    pump: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            options: ConnectionOptions::default(),
            connected: false,
            message_subscription: None,
            ack_subscription: None,
            pump: None,
        }
    }

    /// Subscribe to both event streams and start delivering to `handler`.
    ///
    /// On failure nothing stays subscribed and the manager remains disconnected.
    pub fn initialize(
        &mut self,
        options: ConnectionOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ConnectionError> {
        if self.connected {
            return Err(ConnectionError::AlreadyConnected);
        }

        if let Some(conn) = options.connection_string.as_deref() {
            if !validate_connection_string(conn) {
                warn!(connection = conn, "rejecting connection string");
                return Err(ConnectionError::InvalidConnectionString(conn.to_string()));
            }
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        let message_event = message_event_name(&options.event_prefix);
        let ack_event = ack_event_name(&options.event_prefix);
        let (tx, rx) = mpsc::unbounded_channel();

        let message_subscription = self
            .transport
            .subscribe(&message_event, tx.clone())
            .map_err(|e| {
                warn!(event = %message_event, "subscription failed: {}", e);
                ConnectionError::Subscribe(e)
            })?;

        let ack_subscription = match self.transport.subscribe(&ack_event, tx) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(event = %ack_event, "subscription failed: {}", e);
                message_subscription.unsubscribe();
                return Err(ConnectionError::Subscribe(e));
            }
        };

        self.pump = Some(runtime.spawn(pump(rx, message_event, ack_event, handler)));
        self.message_subscription = Some(message_subscription);
        self.ack_subscription = Some(ack_subscription);
        self.options = options;
        self.connected = true;

        info!(
            system_id = self.options.system_id,
            component_id = self.options.component_id,
            prefix = %self.options.event_prefix,
            "link initialized"
        );
        Ok(())
    }

    /// Drop both subscriptions. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.message_subscription.take() {
            handle.unsubscribe();
        }
        if let Some(handle) = self.ack_subscription.take() {
            handle.unsubscribe();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        if self.connected {
            self.connected = false;
            info!("link shut down");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn get_system_id(&self) -> u8 {
        self.options.system_id
    }

    pub fn get_component_id(&self) -> u8 {
        self.options.component_id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    message_event: String,
    ack_event: String,
    handler: Arc<dyn InboundHandler>,
) {
    while let Some(TransportEvent { event, payload }) = rx.recv().await {
        if event == message_event {
            match serde_json::from_value::<Message>(payload) {
                Ok(message) => handler.on_message(message),
                Err(e) => handler.on_decode_error(&event, &e.to_string()),
            }
        } else if event == ack_event {
            match serde_json::from_value::<Acknowledgment>(payload) {
                Ok(ack) => handler.on_ack(ack),
                Err(e) => handler.on_decode_error(&event, &e.to_string()),
            }
        } else {
            debug!(event = %event, "ignoring event on unknown stream");
        }
    }
    debug!("inbound pump finished");
}
