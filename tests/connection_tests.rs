use std::sync::{Arc, Mutex};
use std::time::Duration;

use vehiclelink::connection::*;
use vehiclelink::protocol::*;
use vehiclelink::transport::LoopbackTransport;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Message(u8),
    Ack(u16, ResultCode),
    DecodeError(String),
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<Seen>>,
}

impl RecordingHandler {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl InboundHandler for RecordingHandler {
    fn on_message(&self, message: Message) {
        self.seen.lock().unwrap().push(Seen::Message(message.sequence));
    }

    fn on_ack(&self, ack: Acknowledgment) {
        self.seen.lock().unwrap().push(Seen::Ack(ack.command_id, ack.result));
    }

    fn on_decode_error(&self, event: &str, _error: &str) {
        self.seen.lock().unwrap().push(Seen::DecodeError(event.to_string()));
    }
}

fn heartbeat(sequence: u8) -> Message {
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

async fn wait_for(handler: &RecordingHandler, count: usize) {
    for _ in 0..100 {
        if handler.seen().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_initialize_subscribes_both_streams() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));

    manager
        .initialize(ConnectionOptions::default(), Arc::new(RecordingHandler::default()))
        .unwrap();

    assert!(manager.is_connected());
    assert_eq!(manager.get_system_id(), 255);
    assert_eq!(manager.get_component_id(), 0);
    assert_eq!(transport.subscriber_count("mavlink-message"), 1);
    assert_eq!(transport.subscriber_count("mavlink-ack"), 1);
}

#[tokio::test]
async fn test_custom_prefix_and_ids() {
    let transport = LoopbackTransport::with_prefix("serial0");
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));
    let options = ConnectionOptions {
        system_id: 200,
        component_id: 190,
        event_prefix: "serial0".to_string(),
        connection_string: Some("/dev/ttyACM0:115200".to_string()),
        ..ConnectionOptions::default()
    };

    manager
        .initialize(options, Arc::new(RecordingHandler::default()))
        .unwrap();

    assert_eq!(manager.get_system_id(), 200);
    assert_eq!(manager.get_component_id(), 190);
    assert_eq!(transport.subscriber_count("serial0-message"), 1);
    assert_eq!(transport.subscriber_count("mavlink-message"), 0);
}

#[tokio::test]
async fn test_second_initialize_is_refused() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));
    let handler = Arc::new(RecordingHandler::default());

    manager.initialize(ConnectionOptions::default(), handler.clone()).unwrap();
    assert_eq!(
        manager.initialize(ConnectionOptions::default(), handler),
        Err(ConnectionError::AlreadyConnected)
    );
    assert_eq!(transport.subscriber_count("mavlink-message"), 1);
}

#[tokio::test]
async fn test_failed_ack_subscription_rolls_back() {
    let transport = LoopbackTransport::new();
    transport.fail_subscription("mavlink-ack");
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));

    let result = manager.initialize(
        ConnectionOptions::default(),
        Arc::new(RecordingHandler::default()),
    );

    assert!(matches!(result, Err(ConnectionError::Subscribe(_))));
    assert!(!manager.is_connected());
    assert_eq!(transport.subscriber_count("mavlink-message"), 0);
}

#[tokio::test]
async fn test_invalid_connection_string_is_rejected() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));
    let options = ConnectionOptions {
        connection_string: Some("bluetooth".to_string()),
        ..ConnectionOptions::default()
    };

    assert_eq!(
        manager.initialize(options, Arc::new(RecordingHandler::default())),
        Err(ConnectionError::InvalidConnectionString("bluetooth".to_string()))
    );
    assert_eq!(transport.subscriber_count("mavlink-message"), 0);
}

#[test]
fn test_initialize_needs_a_runtime() {
    let mut manager = ConnectionManager::new(Arc::new(LoopbackTransport::new()));
    assert_eq!(
        manager.initialize(
            ConnectionOptions::default(),
            Arc::new(RecordingHandler::default())
        ),
        Err(ConnectionError::NoRuntime)
    );
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));
    manager
        .initialize(ConnectionOptions::default(), Arc::new(RecordingHandler::default()))
        .unwrap();

    manager.shutdown();
    manager.shutdown();

    assert!(!manager.is_connected());
    assert_eq!(transport.subscriber_count("mavlink-message"), 0);
    assert_eq!(transport.subscriber_count("mavlink-ack"), 0);

    // Can come back up afterwards
    manager
        .initialize(ConnectionOptions::default(), Arc::new(RecordingHandler::default()))
        .unwrap();
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_inbound_events_reach_handler_in_order() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));
    let handler = Arc::new(RecordingHandler::default());
    manager
        .initialize(ConnectionOptions::default(), handler.clone())
        .unwrap();

    transport.emit_message(&heartbeat(1));
    transport.emit_ack(Acknowledgment::new(400, ResultCode::Accepted));
    transport.emit_message(&heartbeat(2));
    transport.emit("mavlink-ack", serde_json::json!({ "bogus": true }));

    wait_for(&handler, 4).await;
    assert_eq!(
        handler.seen(),
        vec![
            Seen::Message(1),
            Seen::Ack(400, ResultCode::Accepted),
            Seen::Message(2),
            Seen::DecodeError("mavlink-ack".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_no_delivery_after_shutdown() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(Arc::new(transport.clone()));
    let handler = Arc::new(RecordingHandler::default());
    manager
        .initialize(ConnectionOptions::default(), handler.clone())
        .unwrap();

    manager.shutdown();
    assert_eq!(transport.emit_message(&heartbeat(9)), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(handler.seen().is_empty());
}
