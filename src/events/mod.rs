//! Event behaviors run by the supervisor once their trigger fires
//!
//! Each behavior is a strategy object: the supervisor owns the trigger and
//! calls [`EventBehavior::run_sequence`] exactly once when it fires. Any
//! trigger can be paired with any behavior.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RaceControlError, Result};
use crate::coordination::{CoordinationContext, Wake};
use crate::running_order::{self, RunningOrderEntry};
use crate::telemetry::{TelemetryView, capture};
use crate::types::TelemetrySnapshot;

pub mod caution;
pub mod collision_penalty;
pub mod incident_caution;
pub mod slow_zone;

pub use caution::{CautionConfig, CautionPhase, CautionSequence, PacingLapCounter};
pub use collision_penalty::{CollisionPenalty, CollisionPenaltyConfig};
pub use incident_caution::{IncidentCaution, IncidentCautionConfig};
pub use slow_zone::{
    RestartViolation, SlowZoneConfig, SlowZoneControl, SlowZonePhase, SlowZoneSequence,
};

/// How a sequence ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceOutcome {
    /// Ran to its normal end
    Completed,
    /// Did not take control of the field
    Skipped(String),
    /// Stopped at a suspension point after cancellation
    Cancelled,
}

/// Everything a running sequence can reach
#[derive(Clone)]
pub struct EventRun {
    /// Configured event name, used in logs and busy ownership
    pub name: String,
    pub ctx: Arc<CoordinationContext>,
    pub telemetry: Arc<dyn TelemetryView>,
    /// Compressed firing close to another intervention
    pub quickie: bool,
}

impl EventRun {
    pub fn new(
        name: impl Into<String>,
        ctx: Arc<CoordinationContext>,
        telemetry: Arc<dyn TelemetryView>,
    ) -> Self {
        Self { name: name.into(), ctx, telemetry, quickie: false }
    }

    pub fn with_quickie(mut self, quickie: bool) -> Self {
        self.quickie = quickie;
        self
    }

    /// One consistent snapshot
    pub async fn snapshot(&self) -> Result<TelemetrySnapshot> {
        capture(self.telemetry.as_ref()).await
    }

    /// Snapshot plus its running order
    pub async fn sample(&self) -> Result<(TelemetrySnapshot, Vec<RunningOrderEntry>)> {
        let snapshot = self.snapshot().await?;
        let order = running_order::sample(&snapshot);
        Ok((snapshot, order))
    }

    pub async fn sleep(&self, duration: Duration) -> Wake {
        self.ctx.sleep(duration).await
    }

    /// Admin command, retried on failure
    pub async fn command(&self, text: &str) -> Wake {
        self.ctx.send_command(self.telemetry.as_ref(), text).await
    }

    /// Chat text, broadcast to the field or not
    pub async fn say(&self, text: &str, broadcast: bool) -> Wake {
        self.ctx.send_chat(self.telemetry.as_ref(), text, broadcast).await
    }

    /// Private message to one driver
    pub async fn direct(&self, car_number: &str, text: &str) -> Wake {
        self.ctx.send_direct(self.telemetry.as_ref(), car_number, text).await
    }
}

/// A procedure the supervisor runs when a trigger fires
#[async_trait::async_trait]
pub trait EventBehavior: Send {
    /// Short behavior name for logs
    fn kind(&self) -> &'static str;

    /// Run the procedure to completion, skip or cancellation.
    ///
    /// Returns:
    /// - `Ok(outcome)` - The sequence ended normally
    /// - `Err(e)` - A fault; the busy flag may still be held
    async fn run_sequence(&mut self, run: &EventRun) -> Result<SequenceOutcome>;
}

/// Seconds as a `Duration`, clamping negatives and non-finite values to zero
pub(crate) fn secs(seconds: f64) -> Duration {
    if seconds.is_finite() { Duration::from_secs_f64(seconds.max(0.0)) } else { Duration::ZERO }
}

/// Finite and strictly positive
pub(crate) fn positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(RaceControlError::config(field, format!("{} must be a finite positive number", value)))
    }
}

/// Finite and not negative
pub(crate) fn non_negative(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(RaceControlError::config(field, format!("{} must be finite and not negative", value)))
    }
}
