//! Automated race control for iRacing sessions.
//!
//! Race control watches live session telemetry and runs race director
//! procedures on its own: full course cautions with pit closure and wave
//! arounds, slow zones that rebuild the running order into a restart order,
//! incident cautions and collision penalties.
//!
//! # Features
//!
//! - **Triggers**: time or lap windows with a likelihood, resolved once per session
//! - **Concurrent events**: every configured event is its own task under one supervisor
//! - **Coordination**: a busy flag lets one caution-class procedure control the field at a time
//! - **Cancellation**: cooperative, observed at every wait and every chat send
//!
//! # Quick Start
//!
//! Load a configuration, point it at a telemetry provider and let the
//! supervisor run until the session ends.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use racecontrol::{RaceControlConfig, ReplayTelemetry};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RaceControlConfig::from_path("racecontrol.yaml")?;
//!     let view = Arc::new(ReplayTelemetry::open("session.yaml")?);
//!
//!     let mut handle = config.supervisor().spawn(view, config.into_tasks()?);
//!     let mut queues = handle.take_queues().expect("queues are taken once");
//!     tokio::spawn(async move {
//!         while let Some(cue) = queues.audio.recv().await {
//!             println!("audio: {}", cue);
//!         }
//!     });
//!
//!     for report in handle.join().await {
//!         println!("{}: {:?}", report.name, report.result);
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Session interface
pub mod chat;
pub mod providers;
pub mod telemetry;

// Field analysis
pub mod incidents;
pub mod restart_order;
pub mod running_order;
pub mod speed;

// Scheduling and procedures
pub mod config;
pub mod coordination;
pub mod events;
pub mod supervisor;
pub mod trigger;

// Core exports
pub use error::*;
pub use types::*;

pub use config::{BehaviorConfig, EventConfig, EventPlan, RaceControlConfig};
pub use coordination::{AudioCue, BroadcastMessage, CoordinationContext, OutboundQueues, Wake};
pub use events::{EventBehavior, EventRun, SequenceOutcome};
pub use providers::{ChannelTelemetry, ReplayTelemetry};
pub use restart_order::{RestartOrderEntry, RestartOrderManager};
pub use running_order::RunningOrderEntry;
pub use supervisor::{EventSupervisor, ScheduledTask, SupervisorHandle, TaskReport};
pub use telemetry::TelemetryView;
pub use trigger::{TriggerDecision, TriggerScheduler, TriggerSpec, TriggerWindow};
