//! Caution thrown when several cars spike incidents within a short window

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    CautionConfig, CautionSequence, EventBehavior, EventRun, SequenceOutcome, positive, secs,
};
use crate::coordination::checkpoint;
use crate::incidents::{DEFAULT_SPIKE_THRESHOLD, IncidentAggregator, MultiDriverIncidentDetector};
use crate::{RaceControlError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentCautionConfig {
    /// Rolling incident window per car (s)
    pub window: f64,
    pub spike_threshold: i32,
    /// Window in which distinct spiking cars are counted (s)
    pub detection_window: f64,
    /// Distinct cars that trigger a caution
    pub threshold: u32,
    /// Added to the threshold after each caution
    pub threshold_increase: u32,
    pub poll_interval: f64,
    pub caution: CautionConfig,
}

impl Default for IncidentCautionConfig {
    fn default() -> Self {
        Self {
            window: 10.0,
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            detection_window: 30.0,
            threshold: 3,
            threshold_increase: 0,
            poll_interval: 1.0,
            caution: CautionConfig::default(),
        }
    }
}

impl IncidentCautionConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("window", self.window),
            ("detection_window", self.detection_window),
            ("poll_interval", self.poll_interval),
        ] {
            positive(field, value)?;
        }
        if self.threshold == 0 {
            return Err(RaceControlError::config("threshold", "must be at least 1"));
        }
        if self.spike_threshold <= 0 {
            return Err(RaceControlError::config("spike_threshold", "must be positive"));
        }
        self.caution.validate()
    }
}

/// Multi-driver incident caution
///
/// Spikes seen while another procedure holds the busy flag, or while a
/// caution is out, are dropped rather than counted towards the next one.
pub struct IncidentCaution {
    config: IncidentCautionConfig,
    aggregator: IncidentAggregator,
    detector: MultiDriverIncidentDetector,
    caution: CautionSequence,
}

impl IncidentCaution {
    pub fn new(config: IncidentCautionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_caution(config.clone(), CautionSequence::new(config.caution)))
    }

    pub fn with_caution(config: IncidentCautionConfig, caution: CautionSequence) -> Self {
        let aggregator = IncidentAggregator::with_threshold(config.window, config.spike_threshold);
        let detector = MultiDriverIncidentDetector::new(
            config.detection_window,
            config.threshold,
            config.threshold_increase,
        );
        Self { config, aggregator, detector, caution }
    }

    pub fn detector(&self) -> &MultiDriverIncidentDetector {
        &self.detector
    }
}

#[async_trait::async_trait]
impl EventBehavior for IncidentCaution {
    fn kind(&self) -> &'static str {
        "incident_caution"
    }

    async fn run_sequence(&mut self, run: &EventRun) -> Result<SequenceOutcome> {
        info!(event = %run.name, threshold = self.detector.threshold(), "Incident caution armed");
        loop {
            let snapshot = run.snapshot().await?;
            if !snapshot.is_racing() && !snapshot.is_finishing() {
                info!(
                    event = %run.name,
                    state = ?snapshot.session_state,
                    "Session over, incident caution stopped"
                );
                return Ok(SequenceOutcome::Completed);
            }

            let spiked = self.aggregator.observe(&snapshot);
            if run.ctx.is_busy() || snapshot.caution_active() {
                self.detector.suppress();
            } else if snapshot.is_racing()
                && self.detector.record(snapshot.session_time_elapsed, &spiked)
            {
                if run.ctx.try_claim_busy(&run.name) {
                    info!(event = %run.name, "Throwing incident caution");
                    let outcome = self.caution.run_guarded(run).await?;
                    if outcome == SequenceOutcome::Cancelled {
                        return Ok(outcome);
                    }
                    info!(
                        event = %run.name,
                        threshold = self.detector.threshold(),
                        "Incident caution complete, watching again"
                    );
                } else {
                    debug!(event = %run.name, "Busy flag taken first, incidents dropped");
                    self.detector.suppress();
                }
            }
            checkpoint!(run.sleep(secs(self.config.poll_interval)).await);
        }
    }
}
