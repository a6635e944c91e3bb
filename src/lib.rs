//! # Vehicle Link
//!
//! Command and telemetry protocol layer for talking to an autopilot through a
//! message transport, plus an independent emergency stop path.
//!
//! ## Features
//!
//! - **Command dispatch**: ack correlation with per-command timeout and retry
//! - **Bounded pending table**: oldest command evicted when full
//! - **Message parsing**: heartbeat, status text, autopilot version, command ack
//! - **Telemetry recording**: running counters and bounded traffic history
//! - **Emergency stop**: synchronous, fail-safe, independent of the async stack
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vehiclelink::{LinkConfig, LoopbackTransport, VehicleLink};
//!
//! # async fn run() -> Result<(), vehiclelink::LinkError> {
//! let transport = Arc::new(LoopbackTransport::new());
//! let mut link = VehicleLink::new(LinkConfig::default(), transport);
//! link.connect()?;
//!
//! let result = link.arm().await?;
//! println!("arm: {}", result);
//!
//! // Never fails, never awaits
//! link.emergency_stop("operator request");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Transport trait and the in-process loopback transport
//! - [`protocol`] - Messages, commands, result codes and payload layout
//! - [`parser`] - Stateless decoders for inbound messages
//! - [`telemetry`] - Counters and bounded message/ack history
//! - [`dispatcher`] - Pending-command table with ack correlation
//! - [`connection`] - Event stream subscriptions and the inbound pump
//! - [`estop`] - Emergency stop service and actuator interlock
//! - [`config`] - JSON configuration
//! - [`link`] - Facade tying the pieces together

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod estop;
pub mod link;
pub mod parser;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use config::{ConfigError, DispatcherConfig, LinkConfig};
pub use connection::{ConnectionError, ConnectionManager, ConnectionOptions, InboundHandler};
pub use dispatcher::{CommandDispatcher, DispatchError, PendingCommand, SendOptions};
pub use estop::{
    ActuatorState, EmergencyStopConfig, EmergencyStopService, PerformanceMetrics, RegisterBank,
    SafetyError, StopReport,
};
pub use link::{LinkError, VehicleInfo, VehicleLink};
pub use parser::{parse_message, ParsedMessage};
pub use protocol::{Acknowledgment, Command, Message, MessageKind, ResultCode};
pub use telemetry::{TelemetryRecorder, TelemetryStats};
pub use transport::{LoopbackTransport, Transport, TransportError};
