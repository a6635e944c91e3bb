//! [`VehicleLink`] wires the protocol layer together.
//!
//! Inbound traffic flows transport → connection pump → parser → telemetry,
//! with acknowledgments handed to the dispatcher. Outbound commands go through
//! the dispatcher. The emergency stop sits beside all of this and shares only
//! the actuator state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::connection::{ConnectionError, ConnectionManager, InboundHandler};
use crate::dispatcher::{CommandDispatcher, DispatchError, PendingCommand, SendOptions};
use crate::estop::{
    ActuatorRegisters, ActuatorState, EmergencyStopService, PerformanceMetrics, RegisterBank,
    SafetyError, StopReport, TransportBypass,
};
use crate::parser::{
    try_parse_message, Heartbeat, NotificationLevel, ParseError, ParsedMessage,
    StatusNotification, VersionInfo,
};
use crate::protocol::{Acknowledgment, Command, Message, ResultCode};
use crate::telemetry::{
    self, timestamp_ms, AckRecord, LinkStatus, SharedTelemetry, TelemetryRecorder, TelemetryStats,
};
use crate::transport::Transport;

pub const MAX_MOTOR_INDEX: u8 = 8;
pub const MAX_MOTOR_THROTTLE_PCT: f32 = 100.0;
pub const MAX_MOTOR_TEST_DURATION_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error("not connected")]
    NotConnected,
    #[error("emergency stop is active")]
    EmergencyStopActive,
    #[error("a motor test is already running")]
    MotorTestActive,
    #[error("invalid motor test: {0}")]
    InvalidMotorTest(String),
}

/// What the link has learned about the vehicle from heartbeats and version reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub system_id: Option<u8>,
    pub component_id: Option<u8>,
    pub autopilot: Option<String>,
    pub vehicle_type: Option<String>,
    pub armed: bool,
    pub firmware_version: Option<String>,
    pub capabilities: Vec<String>,
    pub last_status: Option<StatusNotification>,
}

impl VehicleInfo {
    fn apply_heartbeat(&mut self, message: &Message, heartbeat: &Heartbeat) {
        self.system_id = Some(message.system_id);
        self.component_id = Some(message.component_id);
        self.autopilot = Some(heartbeat.autopilot_name().to_string());
        self.vehicle_type = Some(heartbeat.vehicle_type_name().to_string());
        self.armed = heartbeat.is_armed();
    }

    fn apply_version(&mut self, version: VersionInfo) {
        self.firmware_version = Some(version.version_string);
        self.capabilities = version.capability_names;
    }
}

type SharedVehicleInfo = Arc<Mutex<VehicleInfo>>;

fn lock_info(info: &SharedVehicleInfo) -> MutexGuard<'_, VehicleInfo> {
    info.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inbound side of the link, driven by the connection pump.
struct InboundPipeline {
    telemetry: SharedTelemetry,
    dispatcher: Arc<CommandDispatcher>,
    vehicle: SharedVehicleInfo,
}

impl InboundPipeline {
    fn notify_status(status: &StatusNotification) {
        match status.level {
            NotificationLevel::Error => error!(severity = status.severity, "vehicle: {}", status.text),
            NotificationLevel::Warning => warn!(severity = status.severity, "vehicle: {}", status.text),
            NotificationLevel::Info => info!(severity = status.severity, "vehicle: {}", status.text),
        }
    }
}

impl InboundHandler for InboundPipeline {
    fn on_message(&self, message: Message) {
        let parsed = try_parse_message(&message);

        {
            let mut recorder = telemetry::lock(&self.telemetry);
            if matches!(parsed, Ok(ParsedMessage::Heartbeat(_))) {
                recorder.record_heartbeat(timestamp_ms());
            }
            if matches!(parsed, Err(ref e) if !matches!(e, ParseError::Unsupported(_))) {
                recorder.record_error();
            }
            recorder.record_message(message.clone());
        }

        match parsed {
            Ok(ParsedMessage::Heartbeat(heartbeat)) => {
                lock_info(&self.vehicle).apply_heartbeat(&message, &heartbeat);
            }
            Ok(ParsedMessage::Status(status)) => {
                Self::notify_status(&status);
                lock_info(&self.vehicle).last_status = Some(status);
            }
            Ok(ParsedMessage::Version(version)) => {
                info!(version = %version.version_string, "autopilot version received");
                lock_info(&self.vehicle).apply_version(version);
            }
            // The ack stream is authoritative for command correlation
            Ok(ParsedMessage::Ack(ack)) => {
                debug!(command_id = ack.command_id, result = %ack.result, "ack seen on message stream");
            }
            Err(ParseError::Unsupported(_)) => {}
            Err(e) => {
                warn!(
                    system_id = message.system_id,
                    sequence = message.sequence,
                    "dropping {}: {}",
                    message.kind,
                    e
                );
            }
        }
    }

    fn on_ack(&self, ack: Acknowledgment) {
        telemetry::lock(&self.telemetry).record_ack(ack.command_id, ack.result);
        self.dispatcher.handle_ack(ack);
    }

    fn on_decode_error(&self, event: &str, error: &str) {
        telemetry::lock(&self.telemetry).record_error();
        warn!(event, "undecodable inbound payload: {}", error);
    }
}

pub struct VehicleLink {
    config: LinkConfig,
    telemetry: SharedTelemetry,
    dispatcher: Arc<CommandDispatcher>,
    connection: ConnectionManager,
    estop: Arc<EmergencyStopService>,
    vehicle: SharedVehicleInfo,
    motor_test_active: Arc<AtomicBool>,
}

impl VehicleLink {
    /// Link with an in-process register bank sized from the config.
    pub fn new(config: LinkConfig, transport: Arc<dyn Transport>) -> Self {
        let registers = Arc::new(RegisterBank::new(config.emergency_stop.channel_count));
        Self::with_registers(config, transport, registers)
    }

    /// Link over caller-owned output registers.
    ///
    /// The registers decide the channel count; a differing
    /// `emergency_stop.channel_count` is overwritten to match.
    pub fn with_registers(
        mut config: LinkConfig,
        transport: Arc<dyn Transport>,
        registers: Arc<dyn ActuatorRegisters>,
    ) -> Self {
        let channels = registers.channel_count();
        if channels != config.emergency_stop.channel_count {
            warn!(
                configured = config.emergency_stop.channel_count,
                registers = channels,
                "channel count taken from the register bank"
            );
            config.emergency_stop.channel_count = channels;
        }

        let telemetry = TelemetryRecorder::shared();
        let dispatcher = Arc::new(CommandDispatcher::with_config(
            Arc::clone(&transport),
            Arc::clone(&telemetry),
            config.dispatcher.max_pending,
            config.dispatcher.send_options(),
        ));

        let actuators = Arc::new(ActuatorState::new(
            registers,
            config.emergency_stop.shared_memory,
        ));
        let estop = EmergencyStopService::new(
            config.emergency_stop.clone(),
            actuators,
            Arc::clone(&transport),
        )
        .with_bypass(Arc::new(TransportBypass::new(Arc::clone(&transport))));

        Self {
            connection: ConnectionManager::new(transport),
            config,
            telemetry,
            dispatcher,
            estop: Arc::new(estop),
            vehicle: Arc::new(Mutex::new(VehicleInfo::default())),
            motor_test_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connect(&mut self) -> Result<(), LinkError> {
        let pipeline = Arc::new(InboundPipeline {
            telemetry: Arc::clone(&self.telemetry),
            dispatcher: Arc::clone(&self.dispatcher),
            vehicle: Arc::clone(&self.vehicle),
        });
        self.connection
            .initialize(self.config.connection.clone(), pipeline)?;
        Ok(())
    }

    /// Refused while a motor test runs. Pending commands are rejected with `ShuttingDown`.
    pub fn disconnect(&mut self) -> Result<(), LinkError> {
        if self.is_motor_test_active() {
            return Err(LinkError::MotorTestActive);
        }

        let cleared = self.dispatcher.clear_pending();
        if cleared > 0 {
            info!(cleared, "rejected pending commands on disconnect");
        }
        self.connection.shutdown();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn require_connected(&self) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    fn target(&self) -> (u8, u8) {
        let options = &self.config.connection;
        (options.target_system, options.target_component)
    }

    pub async fn send_command(
        &self,
        command: Command,
        options: Option<SendOptions>,
    ) -> Result<ResultCode, LinkError> {
        self.require_connected()?;
        let options = options.unwrap_or_else(|| self.dispatcher.default_options());
        Ok(self.dispatcher.send_command(command, options).await?)
    }

    pub async fn arm(&self) -> Result<ResultCode, LinkError> {
        if self.estop.is_stopped() {
            return Err(LinkError::EmergencyStopActive);
        }
        let (system, component) = self.target();
        info!(system, component, "arming");
        self.send_command(Command::arm(system, component), None).await
    }

    pub async fn disarm(&self) -> Result<ResultCode, LinkError> {
        let (system, component) = self.target();
        info!(system, component, "disarming");
        self.send_command(Command::disarm(system, component), None).await
    }

    /// Spin one motor (1-based) at `throttle_pct` for `duration_ms`.
    ///
    /// While the test runs the matching actuator channel carries the throttle
    /// through the interlocked write, so an emergency stop zeroes it.
    pub async fn test_motor(
        &self,
        motor: u8,
        throttle_pct: f32,
        duration_ms: u64,
    ) -> Result<ResultCode, LinkError> {
        let channel = self.validate_motor_test(motor, throttle_pct, duration_ms)?;
        self.require_connected()?;

        if self.estop.is_stopped() {
            return Err(LinkError::EmergencyStopActive);
        }
        if self
            .motor_test_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LinkError::MotorTestActive);
        }

        let (system, component) = self.target();
        let duration_s = duration_ms as f32 / 1000.0;
        let command = Command::motor_test(system, component, motor, throttle_pct, duration_s);

        let result = match self.send_command(command, None).await {
            Ok(result) => result,
            Err(e) => {
                self.motor_test_active.store(false, Ordering::SeqCst);
                warn!(motor, "motor test not started: {}", e);
                return Err(e);
            }
        };

        let actuators = Arc::clone(self.estop.actuators());
        let written = actuators.write(channel, throttle_pct / MAX_MOTOR_THROTTLE_PCT);
        if let Err(e) = written {
            self.motor_test_active.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        info!(motor, throttle_pct, duration_ms, "motor test running");
        let active = Arc::clone(&self.motor_test_active);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            if let Err(e) = actuators.write(channel, 0.0) {
                warn!(motor, "could not zero motor after test: {}", e);
            }
            active.store(false, Ordering::SeqCst);
            debug!(motor, "motor test finished");
        });

        Ok(result)
    }

    fn validate_motor_test(
        &self,
        motor: u8,
        throttle_pct: f32,
        duration_ms: u64,
    ) -> Result<usize, LinkError> {
        if motor == 0 || motor > MAX_MOTOR_INDEX {
            return Err(LinkError::InvalidMotorTest(format!(
                "motor {motor} outside 1..={MAX_MOTOR_INDEX}"
            )));
        }
        if !(0.0..=MAX_MOTOR_THROTTLE_PCT).contains(&throttle_pct) {
            return Err(LinkError::InvalidMotorTest(format!(
                "throttle {throttle_pct}% outside 0..=100"
            )));
        }
        if duration_ms == 0 || duration_ms > MAX_MOTOR_TEST_DURATION_MS {
            return Err(LinkError::InvalidMotorTest(format!(
                "duration {duration_ms} ms outside 1..={MAX_MOTOR_TEST_DURATION_MS}"
            )));
        }

        let channel = usize::from(motor - 1);
        let channels = self.estop.actuators().channel_count();
        if channel >= channels {
            return Err(LinkError::InvalidMotorTest(format!(
                "motor {motor} has no actuator channel ({channels} configured)"
            )));
        }
        Ok(channel)
    }

    pub fn is_motor_test_active(&self) -> bool {
        self.motor_test_active.load(Ordering::SeqCst)
    }

    /// Synchronous; usable from any context, connected or not.
    pub fn emergency_stop(&self, reason: &str) -> StopReport {
        self.estop.trigger_emergency_stop(reason)
    }

    pub async fn reset_emergency_stop(&self, code: &str) -> bool {
        self.estop.reset_emergency_stop(code).await
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.estop.is_stopped()
    }

    pub fn emergency_stop_service(&self) -> &Arc<EmergencyStopService> {
        &self.estop
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn telemetry(&self) -> &SharedTelemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.dispatcher.pending_commands()
    }

    pub fn get_stats(&self) -> TelemetryStats {
        telemetry::lock(&self.telemetry).get_stats()
    }

    pub fn get_message_queue(&self) -> Vec<Message> {
        telemetry::lock(&self.telemetry).get_message_queue()
    }

    pub fn get_command_history(&self) -> Vec<AckRecord> {
        telemetry::lock(&self.telemetry).get_command_history()
    }

    pub fn clear_stats(&self) {
        telemetry::lock(&self.telemetry).clear_stats();
    }

    pub fn link_status(&self) -> LinkStatus {
        telemetry::lock(&self.telemetry).link_status(timestamp_ms(), self.is_connected())
    }

    pub fn vehicle_info(&self) -> VehicleInfo {
        lock_info(&self.vehicle).clone()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.estop.performance_metrics()
    }
}
