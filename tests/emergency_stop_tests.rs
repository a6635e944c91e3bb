use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use vehiclelink::estop::*;
use vehiclelink::protocol::{Command, CommandPayload};
use vehiclelink::transport::{
    EventSink, LoopbackTransport, Transport, TransportError, Unsubscribe,
    INVOKE_EMERGENCY_STOP_DIRECT, INVOKE_LOG_EMERGENCY_STOP, INVOKE_RESET_EMERGENCY_STOP,
};

struct Rig {
    service: EmergencyStopService,
    registers: Arc<RegisterBank>,
    transport: LoopbackTransport,
}

fn rig(shared_memory: bool, bypass: bool) -> Rig {
    let registers = Arc::new(RegisterBank::new(DEFAULT_CHANNEL_COUNT));
    let transport = LoopbackTransport::new();
    transport.enable_immediate(bypass);

    let actuators = Arc::new(ActuatorState::new(registers.clone(), shared_memory));
    let service = EmergencyStopService::new(
        EmergencyStopConfig::default(),
        actuators,
        Arc::new(transport.clone()),
    )
    .with_bypass(Arc::new(TransportBypass::new(Arc::new(transport.clone()))));

    Rig {
        service,
        registers,
        transport,
    }
}

fn spin_all(rig: &Rig, value: f32) {
    for channel in 0..DEFAULT_CHANNEL_COUNT {
        rig.service.actuators().write(channel, value).unwrap();
    }
}

fn assert_all_zero(rig: &Rig) {
    assert!(rig.registers.values().iter().all(|v| *v == 0.0));
    assert!(rig.service.actuators().snapshot().iter().all(|v| *v == 0.0));
}

struct PanickingBypass;

impl BypassChannel for PanickingBypass {
    fn send_stop(&self, _frame: &CommandPayload) -> Result<(), SafetyError> {
        panic!("bypass driver crashed");
    }
}

#[test]
fn test_stop_without_shared_memory_or_bypass_uses_registers() {
    let rig = rig(false, false);
    spin_all(&rig, 0.7);

    let report = rig.service.trigger_emergency_stop("no shared memory");

    assert!(rig.service.is_stopped());
    assert_all_zero(&rig);
    assert_eq!(report.step(StopStep::ZeroMemory).unwrap().outcome, StepOutcome::Skipped);
    assert_eq!(report.step(StopStep::BypassSend).unwrap().outcome, StepOutcome::Skipped);
    assert_eq!(report.step(StopStep::RegisterWrite).unwrap().outcome, StepOutcome::Done);
    assert!(report.succeeded_cleanly());
    assert!(!report.forced_repeat);
}

#[test]
fn test_stop_sends_preserialized_force_disarm_frame() {
    let rig = rig(true, true);
    spin_all(&rig, 0.4);

    let report = rig.service.trigger_emergency_stop("operator");

    let frames = rig.transport.immediate_frames();
    assert_eq!(frames.len(), 1);
    let expected = Command::force_disarm(1, 1).encode_payload();
    assert_eq!(frames[0], expected.to_vec());
    assert_eq!(rig.service.stop_frame(), &expected);

    assert_eq!(report.step(StopStep::ZeroMemory).unwrap().outcome, StepOutcome::Done);
    assert_eq!(report.step(StopStep::BypassSend).unwrap().outcome, StepOutcome::Done);
    assert_eq!(report.step(StopStep::RegisterWrite).unwrap().outcome, StepOutcome::Skipped);
    assert!(rig.service.actuators().snapshot().iter().all(|v| *v == 0.0));
}

#[test]
fn test_bypass_failure_falls_back_and_repeats() {
    let rig = rig(true, true);
    rig.transport.fail_command(INVOKE_EMERGENCY_STOP_DIRECT);
    spin_all(&rig, 0.9);

    let report = rig.service.trigger_emergency_stop("bypass down");

    assert!(rig.service.is_stopped());
    assert_all_zero(&rig);
    assert_eq!(report.step(StopStep::BypassSend).unwrap().outcome, StepOutcome::Failed);
    assert_eq!(report.step(StopStep::RegisterWrite).unwrap().outcome, StepOutcome::Done);
    assert!(report.forced_repeat);
    assert!(report.step(StopStep::ForcedRepeat).is_some());
}

#[test]
fn test_panicking_bypass_never_escapes() {
    let registers = Arc::new(RegisterBank::new(4));
    let actuators = Arc::new(ActuatorState::new(registers.clone(), false));
    let service = EmergencyStopService::new(
        EmergencyStopConfig::default(),
        actuators,
        Arc::new(LoopbackTransport::new()),
    )
    .with_bypass(Arc::new(PanickingBypass));
    service.actuators().write(0, 1.0).unwrap();

    let report = service.trigger_emergency_stop("panic");

    assert!(service.is_stopped());
    assert_eq!(registers.values(), vec![0.0; 4]);
    assert_eq!(report.failures[0].error, SafetyError::Panicked);
    assert!(report.forced_repeat);
}

#[test]
fn test_faulted_register_is_reported_and_others_still_zeroed() {
    let rig = rig(false, false);
    spin_all(&rig, 0.5);
    rig.registers.set_faulted(3, true);

    let report = rig.service.trigger_emergency_stop("register fault");

    assert!(rig.service.is_stopped());
    let values = rig.registers.values();
    for (channel, value) in values.iter().enumerate() {
        if channel != 3 {
            assert_eq!(*value, 0.0, "channel {channel}");
        }
    }
    assert!(report.forced_repeat);
    assert!(report
        .failures
        .iter()
        .any(|f| f.step == StopStep::RegisterWrite && f.channel == Some(3)));
    assert_eq!(report.step(StopStep::RegisterWrite).unwrap().outcome, StepOutcome::Failed);
}

#[test]
fn test_writes_after_stop_land_as_zero() {
    let rig = rig(true, false);
    rig.service.trigger_emergency_stop("interlock");

    assert_eq!(rig.service.actuators().write(2, 0.8).unwrap(), 0.0);
    assert_all_zero(&rig);
}

#[test]
fn test_repeated_stops_are_counted() {
    let rig = rig(false, false);
    rig.service.trigger_emergency_stop("first");
    rig.service.trigger_emergency_stop("second");

    let metrics = rig.service.performance_metrics();
    assert_eq!(metrics.activation_count, 2);
    assert_eq!(metrics.samples, 2);
    assert_eq!(metrics.last_reason.as_deref(), Some("second"));
    assert!(metrics.last_activation.is_some());
    assert!(metrics.stopped);
}

#[tokio::test]
async fn test_manual_stop_then_wrong_code_stays_stopped() {
    let rig = rig(true, true);
    rig.service.trigger_emergency_stop("MANUAL");

    assert!(!rig.service.reset_emergency_stop("WRONG").await);
    assert!(rig.service.is_stopped());
    assert!(rig.transport.invocations_of(INVOKE_RESET_EMERGENCY_STOP).is_empty());
}

#[tokio::test]
async fn test_reset_refused_when_not_stopped() {
    let rig = rig(true, true);
    assert_eq!(
        rig.service.try_reset(DEFAULT_RESET_CODE).await,
        Err(SafetyError::NotStopped)
    );
    assert!(!rig.service.is_stopped());
}

#[tokio::test]
async fn test_reset_refused_while_a_channel_reads_non_zero() {
    let rig = rig(false, false);
    rig.service.trigger_emergency_stop("check readback");
    rig.registers.force(5, 0.25);

    assert!(!rig.service.reset_emergency_stop(DEFAULT_RESET_CODE).await);
    assert!(rig.service.is_stopped());
}

#[tokio::test]
async fn test_reset_refused_when_hardware_kept_outputs() {
    // Bypass accepted the frame but nothing on the vehicle side cut the outputs
    let rig = rig(true, true);
    spin_all(&rig, 0.6);
    rig.service.trigger_emergency_stop("unconfirmed");

    assert_eq!(
        rig.service.try_reset(DEFAULT_RESET_CODE).await,
        Err(SafetyError::ActuatorsNotZero {
            channel: 0,
            value: 0.6
        })
    );
    assert!(rig.service.is_stopped());
}

#[tokio::test]
async fn test_reset_clears_flag_then_notifies() {
    let rig = rig(false, false);
    rig.service.trigger_emergency_stop("recoverable");
    let mut events = rig.service.subscribe();

    assert!(rig.service.reset_emergency_stop(DEFAULT_RESET_CODE).await);
    assert!(!rig.service.is_stopped());
    assert_eq!(rig.transport.invocations_of(INVOKE_RESET_EMERGENCY_STOP).len(), 1);

    // The stop notification may or may not have been delivered before we subscribed
    loop {
        match events.recv().await.unwrap() {
            SafetyEvent::Reset => break,
            SafetyEvent::Stopped { .. } => continue,
        }
    }

    assert_eq!(rig.service.actuators().write(1, 0.3).unwrap(), 0.3);
}

/// Holds the backend reset call open until released.
#[derive(Default)]
struct GatedResetTransport {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Transport for GatedResetTransport {
    async fn invoke(&self, command: &str, _args: Value) -> Result<Value, TransportError> {
        if command == INVOKE_RESET_EMERGENCY_STOP {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Value::Null)
    }

    fn subscribe(&self, _event: &str, _sink: EventSink) -> Result<Unsubscribe, TransportError> {
        Ok(Unsubscribe::noop())
    }
}

#[tokio::test]
async fn test_stop_during_reset_wins() {
    let transport = Arc::new(GatedResetTransport::default());
    let registers = Arc::new(RegisterBank::new(DEFAULT_CHANNEL_COUNT));
    let actuators = Arc::new(ActuatorState::new(registers, false));
    let service = Arc::new(EmergencyStopService::new(
        EmergencyStopConfig::default(),
        actuators,
        transport.clone(),
    ));
    service.trigger_emergency_stop("first");
    let mut events = service.subscribe();

    let reset = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.try_reset(DEFAULT_RESET_CODE).await }
    });
    transport.entered.notified().await;
    service.trigger_emergency_stop("second");
    transport.release.notify_one();

    assert_eq!(reset.await.unwrap(), Err(SafetyError::ResetInterrupted));
    assert!(service.is_stopped());
    assert_eq!(service.actuators().write(0, 0.5).unwrap(), 0.0);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SafetyEvent::Reset));
    }
}

#[tokio::test]
async fn test_backend_failure_on_reset_fails_closed() {
    let rig = rig(false, false);
    rig.transport.fail_command(INVOKE_RESET_EMERGENCY_STOP);
    rig.service.trigger_emergency_stop("backend down");

    let result = rig.service.try_reset(DEFAULT_RESET_CODE).await;
    assert!(matches!(result, Err(SafetyError::Backend(_))));
    assert!(rig.service.is_stopped());
    assert_all_zero(&rig);
}

#[tokio::test]
async fn test_stop_is_logged_and_broadcast_after_the_fact() {
    let rig = rig(true, true);
    let mut events = rig.service.subscribe();

    let report = rig.service.trigger_emergency_stop("notify");

    match events.recv().await.unwrap() {
        SafetyEvent::Stopped {
            reason,
            response_time_us,
        } => {
            assert_eq!(reason, "notify");
            assert_eq!(response_time_us, report.total_us);
        }
        SafetyEvent::Reset => panic!("unexpected reset"),
    }

    // The backend log is written from the same deferred task
    for _ in 0..10 {
        if !rig.transport.invocations_of(INVOKE_LOG_EMERGENCY_STOP).is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let logged = rig.transport.invocations_of(INVOKE_LOG_EMERGENCY_STOP);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].args["reason"], "notify");
}

#[test]
fn test_response_history_is_bounded_and_keeps_true_max() {
    let rig = rig(false, false);

    rig.service.record_response_time(Duration::from_micros(900));
    for _ in 0..100 {
        rig.service.record_response_time(Duration::from_micros(100));
    }

    let history = rig.service.response_time_history();
    assert_eq!(history.len(), RESPONSE_HISTORY_CAPACITY);
    assert!(history.iter().all(|ms| (*ms - 0.1).abs() < 1e-9));
    assert!((rig.service.max_response_time_ms() - 0.9).abs() < 1e-9);
    assert_eq!(rig.service.performance_metrics().target_violations, 0);
}

#[test]
fn test_slow_sample_is_flagged_not_rejected() {
    let rig = rig(false, false);
    rig.service.record_response_time(Duration::from_micros(2500));
    rig.service.record_response_time(Duration::from_micros(200));

    let metrics = rig.service.performance_metrics();
    assert_eq!(metrics.samples, 2);
    assert_eq!(metrics.target_violations, 1);
    assert!((metrics.max_response_ms - 2.5).abs() < 1e-9);
    assert!((metrics.average_response_ms - 1.35).abs() < 1e-9);
    assert!((metrics.last_response_ms.unwrap() - 0.2).abs() < 1e-9);
}
