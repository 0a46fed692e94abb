//! Trigger scheduling: when an event is allowed to fire
//!
//! A [`TriggerSpec`] describes a likelihood and a start window, either in
//! session seconds or in leader laps. Negative bounds count back from the end
//! of the session. The window is resolved to a single start threshold when
//! the [`TriggerScheduler`] is built and never moves afterwards.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::TelemetrySnapshot;
use crate::{RaceControlError, Result};

/// Remaining-time floor below which time triggers never fire (seconds)
pub const DEFAULT_MIN_TIME_REMAINING: f64 = 1.0;

/// Start window of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerWindow {
    /// Seconds into the session
    Time { min_start: f64, max_start: f64 },
    /// Laps completed by the leader
    Lap { min_start: i32, max_start: i32 },
}

impl TriggerWindow {
    /// How close to the threshold counts as a compressed firing
    fn quickie_margin(&self) -> f64 {
        match self {
            TriggerWindow::Time { .. } => 60.0,
            TriggerWindow::Lap { .. } => 1.0,
        }
    }

    /// Where the session stands on this window's axis
    fn progress(&self, snapshot: &TelemetrySnapshot) -> f64 {
        match self {
            TriggerWindow::Time { .. } => snapshot.session_time_elapsed,
            TriggerWindow::Lap { .. } => snapshot.leader_laps() as f64,
        }
    }
}

fn default_likelihood() -> u8 {
    100
}

fn default_min_time_remaining() -> f64 {
    DEFAULT_MIN_TIME_REMAINING
}

/// Likelihood and start window for one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Chance in percent that the event fires once eligible
    #[serde(default = "default_likelihood")]
    pub likelihood_percent: u8,
    pub window: TriggerWindow,
    /// Time triggers need more than this many seconds left in the session
    #[serde(default = "default_min_time_remaining")]
    pub min_time_remaining: f64,
}

impl TriggerSpec {
    /// A time window trigger
    pub fn time(likelihood_percent: u8, min_start: f64, max_start: f64) -> Self {
        Self {
            likelihood_percent,
            window: TriggerWindow::Time { min_start, max_start },
            min_time_remaining: DEFAULT_MIN_TIME_REMAINING,
        }
    }

    /// A lap window trigger
    pub fn lap(likelihood_percent: u8, min_start: i32, max_start: i32) -> Self {
        Self {
            likelihood_percent,
            window: TriggerWindow::Lap { min_start, max_start },
            min_time_remaining: DEFAULT_MIN_TIME_REMAINING,
        }
    }

    /// Check the settings that do not depend on the session
    pub fn validate(&self) -> Result<()> {
        if self.likelihood_percent > 100 {
            return Err(RaceControlError::config(
                "likelihood_percent",
                format!("{} is above 100", self.likelihood_percent),
            ));
        }
        if self.min_time_remaining < 0.0 {
            return Err(RaceControlError::config("min_time_remaining", "must not be negative"));
        }
        let (min, max) = match self.window {
            TriggerWindow::Time { min_start, max_start } => (min_start, max_start),
            TriggerWindow::Lap { min_start, max_start } => (min_start as f64, max_start as f64),
        };
        if !min.is_finite() || !max.is_finite() {
            return Err(RaceControlError::config("window", "bounds must be finite"));
        }
        // Mixed signs are only comparable once the session length is known
        if (min < 0.0) == (max < 0.0) && min > max {
            return Err(RaceControlError::config(
                "window",
                format!("min_start {} is after max_start {}", min, max),
            ));
        }
        Ok(())
    }

    /// Resolve the window against the session and draw the start threshold
    ///
    /// Negative time bounds are offsets from the total session duration,
    /// negative lap bounds are offsets from the total race laps.
    pub fn resolve<R: Rng>(&self, snapshot: &TelemetrySnapshot, rng: &mut R) -> Result<f64> {
        self.validate()?;
        match self.window {
            TriggerWindow::Time { min_start, max_start } => {
                let total = snapshot.total_session_duration();
                let resolve = |bound: f64| if bound < 0.0 { total + bound } else { bound };
                let (min, max) = (resolve(min_start), resolve(max_start));
                if min > max {
                    return Err(RaceControlError::config(
                        "window",
                        format!("resolved time window {}..{} is empty", min, max),
                    ));
                }
                Ok(rng.random_range(min..=max))
            }
            TriggerWindow::Lap { min_start, max_start } => {
                let total = snapshot.total_race_laps();
                let resolve = |bound: i32| if bound < 0 { total + bound } else { bound };
                let (min, max) = (resolve(min_start), resolve(max_start));
                if min > max {
                    return Err(RaceControlError::config(
                        "window",
                        format!("resolved lap window {}..{} is empty", min, max),
                    ));
                }
                Ok(rng.random_range(min..=max) as f64)
            }
        }
    }
}

/// Result of polling a [`TriggerScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Not eligible yet
    Waiting,
    /// Eligible and passed the likelihood roll
    Fire,
    /// Failed the likelihood roll; the event never fires
    Skipped,
}

/// Decides when an event may begin
#[derive(Debug, Clone)]
pub struct TriggerScheduler {
    window: TriggerWindow,
    start_threshold: f64,
    likelihood_percent: u8,
    min_time_remaining: f64,
    decision: Option<TriggerDecision>,
    quickie: bool,
}

impl TriggerScheduler {
    /// Build a scheduler, resolving the start threshold once
    pub fn new<R: Rng>(
        spec: &TriggerSpec,
        snapshot: &TelemetrySnapshot,
        rng: &mut R,
    ) -> Result<Self> {
        let start_threshold = spec.resolve(snapshot, rng)?;
        let mut scheduler = Self {
            window: spec.window,
            start_threshold,
            likelihood_percent: spec.likelihood_percent,
            min_time_remaining: spec.min_time_remaining,
            decision: None,
            quickie: false,
        };

        if snapshot.caution_active() && scheduler.window.progress(snapshot) >= start_threshold {
            scheduler.quickie = true;
        }

        debug!(
            window = ?spec.window,
            start_threshold,
            quickie = scheduler.quickie,
            "Trigger resolved"
        );
        Ok(scheduler)
    }

    /// Resolved start threshold (seconds or laps)
    pub fn start_threshold(&self) -> f64 {
        self.start_threshold
    }

    /// Whether this is a compressed firing close to another intervention
    pub fn quickie(&self) -> bool {
        self.quickie
    }

    /// Threshold reached, session racing and, for time triggers, enough time left
    pub fn is_eligible(&self, snapshot: &TelemetrySnapshot) -> bool {
        if !snapshot.is_racing() || self.window.progress(snapshot) < self.start_threshold {
            return false;
        }
        match self.window {
            TriggerWindow::Time { .. } => snapshot.session_time_remaining > self.min_time_remaining,
            TriggerWindow::Lap { .. } => true,
        }
    }

    /// Poll the trigger. The likelihood roll happens once, the first time
    /// the trigger is eligible; the decision is final after that.
    pub fn poll<R: Rng>(
        &mut self,
        snapshot: &TelemetrySnapshot,
        busy: bool,
        rng: &mut R,
    ) -> TriggerDecision {
        if let Some(decision) = self.decision {
            return decision;
        }

        let remaining = self.start_threshold - self.window.progress(snapshot);
        if !self.quickie
            && (busy || snapshot.caution_active())
            && remaining <= self.window.quickie_margin()
        {
            debug!(remaining, "Trigger close to an active intervention, flagged quickie");
            self.quickie = true;
        }

        if !self.is_eligible(snapshot) {
            return TriggerDecision::Waiting;
        }

        let roll = rng.random_range(0..100u32);
        let decision = if roll <= self.likelihood_percent as u32 {
            TriggerDecision::Fire
        } else {
            TriggerDecision::Skipped
        };
        info!(roll, likelihood = self.likelihood_percent, ?decision, "Trigger eligible");
        self.decision = Some(decision);
        decision
    }
}
