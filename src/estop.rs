//! Emergency stop: the fail-safe path that forces every actuator output to zero.
//!
//! [`EmergencyStopService::trigger_emergency_stop`] is synchronous and contains
//! no suspension points. It runs three independent actions in order (set the
//! stop flag, zero the shared actuator memory, send the pre-serialized stop
//! frame over the bypass channel or fall back to direct register writes) and
//! never returns an error. Anything that goes wrong is recorded in the
//! [`StopReport`], answered with a forced repeat of the shutdown, and logged
//! afterwards from the deferred notification path.
//!
//! Reset fails closed: the flag is only cleared when the confirmation code
//! matches, every channel reads back zero, and the backend accepts the reset.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use arrayvec::ArrayString;
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use serde_json::json;
use static_assertions::const_assert;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::protocol::{Command, CommandPayload};
use crate::telemetry::timestamp_ms;
use crate::transport::{
    Transport, TransportError, INVOKE_EMERGENCY_STOP_DIRECT, INVOKE_LOG_EMERGENCY_STOP,
    INVOKE_RESET_EMERGENCY_STOP,
};

pub const DEFAULT_CHANNEL_COUNT: usize = 8;
pub const RESPONSE_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_RESET_CODE: &str = "CONFIRM_SAFE_RESET";

// Micro-budgets per step, in microseconds
pub const MEMORY_ZERO_BUDGET_US: u64 = 10;
pub const BYPASS_SEND_BUDGET_US: u64 = 100;
pub const REGISTER_WRITE_BUDGET_US: u64 = 50;
pub const RESPONSE_TARGET_US: u64 = 1000;

const MAX_STEP_REPORTS: usize = 8;
const MAX_RECORDED_FAILURES: usize = 16;
const MAX_REASON_LEN: usize = 64;
const SAFETY_EVENT_BUFFER: usize = 16;

const_assert!(RESPONSE_HISTORY_CAPACITY > 0);
const_assert!(MAX_STEP_REPORTS >= 5);

pub type StopReason = ArrayString<MAX_REASON_LEN>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyError {
    #[error("channel {channel} out of range ({count} channels)")]
    ChannelOutOfRange { channel: usize, count: usize },
    #[error("register write on channel {channel} failed: {reason}")]
    Register { channel: usize, reason: String },
    #[error("bypass channel unavailable")]
    BypassUnavailable,
    #[error("bypass send failed: {0}")]
    Bypass(TransportError),
    #[error("step panicked")]
    Panicked,
    #[error("emergency stop is not active")]
    NotStopped,
    #[error("reset code rejected")]
    InvalidResetCode,
    #[error("channel {channel} reads {value}, expected zero")]
    ActuatorsNotZero { channel: usize, value: f32 },
    #[error("backend rejected reset: {0}")]
    Backend(TransportError),
    #[error("emergency stop re-triggered during reset")]
    ResetInterrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyStopConfig {
    pub channel_count: usize,
    pub reset_code: String,
    pub shared_memory: bool,
    pub memory_zero_budget_us: u64,
    pub bypass_send_budget_us: u64,
    pub register_write_budget_us: u64,
    pub response_target_us: u64,
    pub target_system: u8,
    pub target_component: u8,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
            reset_code: DEFAULT_RESET_CODE.to_string(),
            shared_memory: true,
            memory_zero_budget_us: MEMORY_ZERO_BUDGET_US,
            bypass_send_budget_us: BYPASS_SEND_BUDGET_US,
            register_write_budget_us: REGISTER_WRITE_BUDGET_US,
            response_target_us: RESPONSE_TARGET_US,
            target_system: 1,
            target_component: 1,
        }
    }
}

// ===== Actuator hardware seams =====

/// Direct per-channel output registers. Implementations must not block.
pub trait ActuatorRegisters: Send + Sync {
    fn channel_count(&self) -> usize;

    fn write_register(&self, channel: usize, value: f32) -> Result<(), SafetyError>;

    fn read_register(&self, channel: usize) -> Result<f32, SafetyError>;
}

/// Lowest-level send path, used only by the emergency stop. Must not block.
pub trait BypassChannel: Send + Sync {
    fn send_stop(&self, frame: &CommandPayload) -> Result<(), SafetyError>;
}

/// Bypass over the transport's synchronous raw-frame send.
pub struct TransportBypass {
    transport: Arc<dyn Transport>,
}

impl TransportBypass {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl BypassChannel for TransportBypass {
    fn send_stop(&self, frame: &CommandPayload) -> Result<(), SafetyError> {
        match self.transport.send_immediate(INVOKE_EMERGENCY_STOP_DIRECT, frame) {
            Ok(()) => Ok(()),
            Err(TransportError::Unsupported) => Err(SafetyError::BypassUnavailable),
            Err(e) => Err(SafetyError::Bypass(e)),
        }
    }
}

fn check_channel(channel: usize, count: usize) -> Result<(), SafetyError> {
    if channel >= count {
        return Err(SafetyError::ChannelOutOfRange { channel, count });
    }
    Ok(())
}

/// In-process register file. Channels can be marked faulted to refuse writes.
pub struct RegisterBank {
    values: Box<[AtomicU32]>,
    faulted: Box<[AtomicBool]>,
}

impl RegisterBank {
    pub fn new(channel_count: usize) -> Self {
        Self {
            values: (0..channel_count).map(|_| AtomicU32::new(0)).collect(),
            faulted: (0..channel_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn set_faulted(&self, channel: usize, faulted: bool) {
        if let Some(flag) = self.faulted.get(channel) {
            flag.store(faulted, Ordering::SeqCst);
        }
    }

    /// Store directly, bypassing fault injection (simulates hardware-side changes).
    pub fn force(&self, channel: usize, value: f32) {
        if let Some(slot) = self.values.get(channel) {
            slot.store(value.to_bits(), Ordering::SeqCst);
        }
    }

    pub fn values(&self) -> Vec<f32> {
        self.values
            .iter()
            .map(|v| f32::from_bits(v.load(Ordering::SeqCst)))
            .collect()
    }
}

impl ActuatorRegisters for RegisterBank {
    fn channel_count(&self) -> usize {
        self.values.len()
    }

    fn write_register(&self, channel: usize, value: f32) -> Result<(), SafetyError> {
        check_channel(channel, self.values.len())?;
        if self.faulted[channel].load(Ordering::SeqCst) {
            return Err(SafetyError::Register {
                channel,
                reason: "register fault".to_string(),
            });
        }
        self.values[channel].store(value.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    fn read_register(&self, channel: usize) -> Result<f32, SafetyError> {
        check_channel(channel, self.values.len())?;
        Ok(f32::from_bits(self.values[channel].load(Ordering::SeqCst)))
    }
}

// ===== Shared actuator state =====

/// The actuator resource shared by the normal command path and the stop path.
///
/// The stop flag is the only authority on whether non-zero output is allowed.
/// Channel values live in an optional shared-memory view (f32 bits in atomics)
/// and in the output registers.
pub struct ActuatorState {
    stopped: AtomicBool,
    memory: Option<Box<[AtomicU32]>>,
    registers: Arc<dyn ActuatorRegisters>,
}

impl ActuatorState {
    pub fn new(registers: Arc<dyn ActuatorRegisters>, shared_memory: bool) -> Self {
        let count = registers.channel_count();
        Self {
            stopped: AtomicBool::new(false),
            memory: shared_memory.then(|| (0..count).map(|_| AtomicU32::new(0)).collect()),
            registers,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.registers.channel_count()
    }

    pub fn has_shared_memory(&self) -> bool {
        self.memory.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn clear_stopped(&self) -> bool {
        self.stopped
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Interlocked output write. Returns the value that actually landed.
    ///
    /// The flag is re-checked after the store, so a write racing with a stop
    /// can never leave a non-zero value behind.
    pub fn write(&self, channel: usize, value: f32) -> Result<f32, SafetyError> {
        check_channel(channel, self.channel_count())?;

        let value = if self.is_stopped() { 0.0 } else { value };
        self.store(channel, value)?;

        if value != 0.0 && self.is_stopped() {
            self.store(channel, 0.0)?;
            return Ok(0.0);
        }
        Ok(value)
    }

    /// The shared view only follows values the register accepted.
    fn store(&self, channel: usize, value: f32) -> Result<(), SafetyError> {
        self.registers.write_register(channel, value)?;
        if let Some(memory) = &self.memory {
            memory[channel].store(value.to_bits(), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Shared memory when present, otherwise the register.
    pub fn read(&self, channel: usize) -> Result<f32, SafetyError> {
        check_channel(channel, self.channel_count())?;
        match &self.memory {
            Some(memory) => Ok(f32::from_bits(memory[channel].load(Ordering::SeqCst))),
            None => self.registers.read_register(channel),
        }
    }

    pub fn snapshot(&self) -> Vec<f32> {
        (0..self.channel_count())
            .map(|ch| self.read(ch).unwrap_or(f32::NAN))
            .collect()
    }

    /// `None` when the platform has no shared memory view.
    fn zero_memory(&self) -> Option<usize> {
        let memory = self.memory.as_ref()?;
        for slot in memory.iter() {
            slot.store(0, Ordering::SeqCst);
        }
        Some(memory.len())
    }

    /// Write zero to every register, continuing past failed channels.
    fn zero_registers(&self, failures: &mut FailureLog, step: StopStep) {
        for channel in 0..self.registers.channel_count() {
            if let Err(e) = guarded(|| self.registers.write_register(channel, 0.0)) {
                failures.push(step, Some(channel), e);
            }
        }
    }

    /// Both the shared view and the registers must read back exactly zero.
    pub fn verify_all_zero(&self) -> Result<(), SafetyError> {
        for channel in 0..self.channel_count() {
            let register = self.registers.read_register(channel)?;
            let shared = self.read(channel)?;
            for value in [register, shared] {
                if value != 0.0 {
                    return Err(SafetyError::ActuatorsNotZero { channel, value });
                }
            }
        }
        Ok(())
    }
}

/// Run one step, turning a panic into an error so the stop path always continues.
fn guarded<T>(f: impl FnOnce() -> Result<T, SafetyError>) -> Result<T, SafetyError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(SafetyError::Panicked))
}

// ===== Stop reporting =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopStep {
    SetFlag,
    ZeroMemory,
    BypassSend,
    RegisterWrite,
    ForcedRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Done,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub step: StopStep,
    pub outcome: StepOutcome,
    pub elapsed_us: u64,
    pub budget_us: Option<u64>,
}

impl StepReport {
    pub fn over_budget(&self) -> bool {
        self.budget_us.is_some_and(|budget| self.elapsed_us > budget)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step: StopStep,
    pub channel: Option<usize>,
    pub error: SafetyError,
}

#[derive(Debug, Default, Clone)]
struct FailureLog {
    entries: heapless::Vec<StepFailure, MAX_RECORDED_FAILURES>,
    dropped: usize,
}

impl FailureLog {
    fn push(&mut self, step: StopStep, channel: Option<usize>, error: SafetyError) {
        if self.entries.push(StepFailure { step, channel, error }).is_err() {
            self.dropped += 1;
        }
    }

    fn len(&self) -> usize {
        self.entries.len() + self.dropped
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What happened during one emergency stop.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub reason: StopReason,
    pub steps: heapless::Vec<StepReport, MAX_STEP_REPORTS>,
    pub failures: heapless::Vec<StepFailure, MAX_RECORDED_FAILURES>,
    pub dropped_failures: usize,
    pub forced_repeat: bool,
    pub total_us: u64,
    pub timestamp: u64,
}

impl StopReport {
    pub fn step(&self, step: StopStep) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn budget_violations(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.over_budget())
    }

    pub fn succeeded_cleanly(&self) -> bool {
        self.failures.is_empty() && self.dropped_failures == 0
    }
}

fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros().min(u128::from(u64::MAX)) as u64
}

fn truncated_reason(reason: &str) -> StopReason {
    let mut out = StopReason::new();
    for ch in reason.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

// ===== Response-time bookkeeping =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SafetyEvent {
    Stopped { reason: String, response_time_us: u64 },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub stopped: bool,
    pub samples: usize,
    pub last_response_ms: Option<f64>,
    pub average_response_ms: f64,
    pub max_response_ms: f64,
    pub target_violations: u64,
    pub activation_count: u64,
    pub last_activation: Option<u64>,
    pub last_reason: Option<String>,
}

#[derive(Debug)]
struct ResponseHistory {
    samples: HistoryBuffer<f64, RESPONSE_HISTORY_CAPACITY>,
    max_ms: f64,
    target_violations: u64,
    last_reason: Option<String>,
    last_activation: Option<u64>,
}

impl ResponseHistory {
    fn new() -> Self {
        Self {
            samples: HistoryBuffer::new(),
            max_ms: 0.0,
            target_violations: 0,
            last_reason: None,
            last_activation: None,
        }
    }
}

// ===== The service =====

pub struct EmergencyStopService {
    config: EmergencyStopConfig,
    actuators: Arc<ActuatorState>,
    bypass: Option<Arc<dyn BypassChannel>>,
    transport: Arc<dyn Transport>,
    stop_frame: CommandPayload,
    history: Mutex<ResponseHistory>,
    activations: AtomicU64,
    events: broadcast::Sender<SafetyEvent>,
}

impl EmergencyStopService {
    pub fn new(
        config: EmergencyStopConfig,
        actuators: Arc<ActuatorState>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let stop_frame =
            Command::force_disarm(config.target_system, config.target_component).encode_payload();
        let (events, _) = broadcast::channel(SAFETY_EVENT_BUFFER);

        Self {
            config,
            actuators,
            bypass: None,
            transport,
            stop_frame,
            history: Mutex::new(ResponseHistory::new()),
            activations: AtomicU64::new(0),
            events,
        }
    }

    #[must_use]
    pub fn with_bypass(mut self, bypass: Arc<dyn BypassChannel>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    fn lock_history(&self) -> MutexGuard<'_, ResponseHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EmergencyStopConfig {
        &self.config
    }

    pub fn actuators(&self) -> &Arc<ActuatorState> {
        &self.actuators
    }

    pub fn stop_frame(&self) -> &CommandPayload {
        &self.stop_frame
    }

    pub fn is_stopped(&self) -> bool {
        self.actuators.is_stopped()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    /// Force every actuator output to zero. Never fails, never suspends.
    pub fn trigger_emergency_stop(&self, reason: &str) -> StopReport {
        let started = Instant::now();
        let mut steps = heapless::Vec::<StepReport, MAX_STEP_REPORTS>::new();
        let mut failures = FailureLog::default();

        // 1. Flag first: from here on every interlocked write lands as zero
        let t = Instant::now();
        self.actuators.set_stopped();
        let _ = steps.push(StepReport {
            step: StopStep::SetFlag,
            outcome: StepOutcome::Done,
            elapsed_us: micros(t.elapsed()),
            budget_us: None,
        });

        // 2. Shared memory view
        let t = Instant::now();
        let outcome = match guarded(|| Ok(self.actuators.zero_memory())) {
            Ok(Some(_)) => StepOutcome::Done,
            Ok(None) => StepOutcome::Skipped,
            Err(e) => {
                failures.push(StopStep::ZeroMemory, None, e);
                StepOutcome::Failed
            }
        };
        let _ = steps.push(StepReport {
            step: StopStep::ZeroMemory,
            outcome,
            elapsed_us: micros(t.elapsed()),
            budget_us: Some(self.config.memory_zero_budget_us),
        });

        // 3. Bypass frame, falling back to the registers
        let t = Instant::now();
        let bypass = match &self.bypass {
            Some(bypass) => guarded(|| bypass.send_stop(&self.stop_frame)),
            None => Err(SafetyError::BypassUnavailable),
        };
        let outcome = match &bypass {
            Ok(()) => StepOutcome::Done,
            Err(SafetyError::BypassUnavailable) => StepOutcome::Skipped,
            Err(e) => {
                failures.push(StopStep::BypassSend, None, e.clone());
                StepOutcome::Failed
            }
        };
        let _ = steps.push(StepReport {
            step: StopStep::BypassSend,
            outcome,
            elapsed_us: micros(t.elapsed()),
            budget_us: Some(self.config.bypass_send_budget_us),
        });

        // Without a shared view the registers are the only local copy, so write them too
        let t = Instant::now();
        let outcome = if bypass.is_err() || !self.actuators.has_shared_memory() {
            let before = failures.len();
            self.actuators.zero_registers(&mut failures, StopStep::RegisterWrite);
            if failures.len() == before {
                StepOutcome::Done
            } else {
                StepOutcome::Failed
            }
        } else {
            StepOutcome::Skipped
        };
        let _ = steps.push(StepReport {
            step: StopStep::RegisterWrite,
            outcome,
            elapsed_us: micros(t.elapsed()),
            budget_us: Some(self.config.register_write_budget_us),
        });

        // Anything failed: repeat the whole shutdown, best effort
        let forced_repeat = !failures.is_empty();
        if forced_repeat {
            let t = Instant::now();
            self.force_stop(&mut failures);
            let _ = steps.push(StepReport {
                step: StopStep::ForcedRepeat,
                outcome: StepOutcome::Done,
                elapsed_us: micros(t.elapsed()),
                budget_us: None,
            });
        }

        let total = started.elapsed();

        // Critical section over; bookkeeping and notification may take their time
        let report = StopReport {
            reason: truncated_reason(reason),
            steps,
            failures: failures.entries,
            dropped_failures: failures.dropped,
            forced_repeat,
            total_us: micros(total),
            timestamp: timestamp_ms(),
        };

        self.activations.fetch_add(1, Ordering::SeqCst);
        {
            let mut history = self.lock_history();
            history.last_reason = Some(report.reason.to_string());
            history.last_activation = Some(report.timestamp);
        }
        self.record_response_time(total);
        self.schedule_notification(report.clone());

        report
    }

    fn force_stop(&self, failures: &mut FailureLog) {
        self.actuators.set_stopped();
        if let Err(e) = guarded(|| Ok(self.actuators.zero_memory())) {
            failures.push(StopStep::ForcedRepeat, None, e);
        }
        self.actuators.zero_registers(failures, StopStep::ForcedRepeat);
    }

    /// Append a stop duration to the bounded history and update the running maximum.
    pub fn record_response_time(&self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        let mut history = self.lock_history();

        history.samples.write(ms);
        if ms > history.max_ms {
            history.max_ms = ms;
        }

        if micros(duration) > self.config.response_target_us {
            history.target_violations += 1;
            warn!(
                response_us = micros(duration),
                target_us = self.config.response_target_us,
                "emergency stop exceeded response target"
            );
        }
    }

    pub fn response_time_history(&self) -> Vec<f64> {
        self.lock_history().samples.oldest_ordered().copied().collect()
    }

    pub fn max_response_time_ms(&self) -> f64 {
        self.lock_history().max_ms
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let history = self.lock_history();
        let samples = history.samples.len();
        let average_response_ms = if samples == 0 {
            0.0
        } else {
            history.samples.oldest_ordered().sum::<f64>() / samples as f64
        };

        PerformanceMetrics {
            stopped: self.is_stopped(),
            samples,
            last_response_ms: history.samples.recent().copied(),
            average_response_ms,
            max_response_ms: history.max_ms,
            target_violations: history.target_violations,
            activation_count: self.activations.load(Ordering::SeqCst),
            last_activation: history.last_activation,
            last_reason: history.last_reason.clone(),
        }
    }

    fn schedule_notification(&self, report: StopReport) {
        let notifier = StopNotifier {
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { notifier.publish(report).await });
            }
            Err(_) => {
                notifier.log(&report);
                notifier.emit(&report);
            }
        }
    }

    /// Leave the stopped state. Returns `false`, and stays stopped, on any doubt.
    pub async fn reset_emergency_stop(&self, code: &str) -> bool {
        match self.try_reset(code).await {
            Ok(()) => true,
            Err(e) => {
                warn!("emergency stop reset refused: {}", e);
                false
            }
        }
    }

    pub async fn try_reset(&self, code: &str) -> Result<(), SafetyError> {
        if !self.is_stopped() {
            return Err(SafetyError::NotStopped);
        }
        if code != self.config.reset_code {
            return Err(SafetyError::InvalidResetCode);
        }
        self.actuators.verify_all_zero()?;

        if !self.actuators.clear_stopped() {
            return Err(SafetyError::NotStopped);
        }

        let notified = self
            .transport
            .invoke(
                INVOKE_RESET_EMERGENCY_STOP,
                json!({ "timestamp": timestamp_ms() }),
            )
            .await;

        if let Err(e) = notified {
            // Fail closed: back to stopped and make sure nothing slipped out meanwhile
            let mut failures = FailureLog::default();
            self.force_stop(&mut failures);
            error!("backend did not confirm reset, staying stopped: {}", e);
            return Err(SafetyError::Backend(e));
        }

        if self.is_stopped() {
            warn!("emergency stop re-triggered while reset was in flight");
            return Err(SafetyError::ResetInterrupted);
        }

        let _ = self.events.send(SafetyEvent::Reset);
        info!("emergency stop reset, actuators re-enabled");
        Ok(())
    }
}

struct StopNotifier {
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<SafetyEvent>,
}

impl StopNotifier {
    fn log(&self, report: &StopReport) {
        error!(
            reason = %report.reason,
            total_us = report.total_us,
            forced_repeat = report.forced_repeat,
            "EMERGENCY STOP"
        );
        for step in report.budget_violations() {
            warn!(
                step = ?step.step,
                elapsed_us = step.elapsed_us,
                budget_us = step.budget_us.unwrap_or_default(),
                "emergency stop step over budget"
            );
        }
        for failure in &report.failures {
            error!(step = ?failure.step, channel = ?failure.channel, "emergency stop step failed: {}", failure.error);
        }
        if report.dropped_failures > 0 {
            error!(dropped = report.dropped_failures, "further emergency stop failures not recorded");
        }
    }

    fn emit(&self, report: &StopReport) {
        // No subscribers is fine
        let _ = self.events.send(SafetyEvent::Stopped {
            reason: report.reason.to_string(),
            response_time_us: report.total_us,
        });
    }

    async fn publish(self, report: StopReport) {
        self.log(&report);
        self.emit(&report);

        let args = json!({
            "reason": report.reason.as_str(),
            "response_time_us": report.total_us,
            "timestamp": report.timestamp,
            "forced_repeat": report.forced_repeat,
            "failures": report.failures.len() + report.dropped_failures,
        });
        if let Err(e) = self.transport.invoke(INVOKE_LOG_EMERGENCY_STOP, args).await {
            warn!("could not log emergency stop to backend: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(shared_memory: bool) -> (Arc<RegisterBank>, ActuatorState) {
        let bank = Arc::new(RegisterBank::new(4));
        let state = ActuatorState::new(bank.clone(), shared_memory);
        (bank, state)
    }

    #[test]
    fn test_write_passes_through_while_armed() {
        let (bank, state) = state(true);
        assert_eq!(state.write(2, 0.4).unwrap(), 0.4);
        assert_eq!(state.read(2).unwrap(), 0.4);
        assert_eq!(bank.values()[2], 0.4);
    }

    #[test]
    fn test_write_lands_as_zero_while_stopped() {
        let (bank, state) = state(true);
        state.set_stopped();
        assert_eq!(state.write(1, 0.9).unwrap(), 0.0);
        assert_eq!(state.read(1).unwrap(), 0.0);
        assert_eq!(bank.values()[1], 0.0);
    }

    #[test]
    fn test_write_rejects_unknown_channel() {
        let (_, state) = state(false);
        assert_eq!(
            state.write(7, 1.0),
            Err(SafetyError::ChannelOutOfRange { channel: 7, count: 4 })
        );
    }

    #[test]
    fn test_failed_register_write_leaves_shared_view_untouched() {
        let (bank, state) = state(true);
        state.write(0, 0.3).unwrap();
        bank.set_faulted(0, true);

        assert!(matches!(
            state.write(0, 0.7),
            Err(SafetyError::Register { channel: 0, .. })
        ));
        assert_eq!(state.read(0).unwrap(), 0.3);
        assert_eq!(bank.values()[0], 0.3);
    }

    #[test]
    fn test_verify_checks_registers_and_memory() {
        let (bank, state) = state(true);
        assert!(state.verify_all_zero().is_ok());

        bank.force(3, 0.2);
        assert_eq!(
            state.verify_all_zero(),
            Err(SafetyError::ActuatorsNotZero { channel: 3, value: 0.2 })
        );
    }

    #[test]
    fn test_guarded_turns_panic_into_error() {
        let result: Result<(), SafetyError> = guarded(|| panic!("register driver crashed"));
        assert_eq!(result, Err(SafetyError::Panicked));
    }

    #[test]
    fn test_reason_is_truncated() {
        let long = "x".repeat(200);
        assert_eq!(truncated_reason(&long).len(), MAX_REASON_LEN);
    }
}
