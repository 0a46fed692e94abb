//! Per-car collision penalties from incident spikes

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{EventBehavior, EventRun, SequenceOutcome, positive, secs};
use crate::coordination::{AudioCue, checkpoint};
use crate::incidents::{
    CollisionAction, CollisionPenaltyTracker, DEFAULT_SPIKE_THRESHOLD, IncidentAggregator,
};
use crate::{RaceControlError, Result, chat};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionPenaltyConfig {
    /// Rolling incident window (s)
    pub window: f64,
    pub spike_threshold: i32,
    /// Collisions per penalty; unset means collisions are only counted
    pub collisions_per_penalty: Option<u32>,
    /// Penalties in escalation order, as accepted by `!bl`
    pub penalties: Vec<String>,
    /// Tell drivers how many collisions remain before a penalty
    pub warn_drivers: bool,
    pub poll_interval: f64,
}

impl Default for CollisionPenaltyConfig {
    fn default() -> Self {
        Self {
            window: 10.0,
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            collisions_per_penalty: None,
            penalties: Vec::new(),
            warn_drivers: true,
            poll_interval: 1.0,
        }
    }
}

impl CollisionPenaltyConfig {
    pub fn validate(&self) -> Result<()> {
        positive("window", self.window)?;
        positive("poll_interval", self.poll_interval)?;
        if self.spike_threshold <= 0 {
            return Err(RaceControlError::config("spike_threshold", "must be positive"));
        }
        CollisionPenaltyTracker::new(self.collisions_per_penalty, self.penalties.clone())
            .map(|_| ())
    }
}

/// Watches incident spikes and penalises repeat offenders
///
/// Runs until cancelled or the session stops racing; never takes the busy
/// flag.
pub struct CollisionPenalty {
    config: CollisionPenaltyConfig,
    aggregator: IncidentAggregator,
    tracker: CollisionPenaltyTracker,
}

impl CollisionPenalty {
    pub fn new(config: CollisionPenaltyConfig) -> Result<Self> {
        config.validate()?;
        let tracker =
            CollisionPenaltyTracker::new(config.collisions_per_penalty, config.penalties.clone())?;
        let aggregator = IncidentAggregator::with_threshold(config.window, config.spike_threshold);
        Ok(Self { config, aggregator, tracker })
    }

    pub fn tracker(&self) -> &CollisionPenaltyTracker {
        &self.tracker
    }
}

#[async_trait::async_trait]
impl EventBehavior for CollisionPenalty {
    fn kind(&self) -> &'static str {
        "collision_penalty"
    }

    async fn run_sequence(&mut self, run: &EventRun) -> Result<SequenceOutcome> {
        info!(event = %run.name, "Collision penalties active");
        loop {
            let snapshot = run.snapshot().await?;
            if !snapshot.is_racing() && !snapshot.is_finishing() {
                info!(
                    event = %run.name,
                    state = ?snapshot.session_state,
                    "Session over, collision penalties stopped"
                );
                return Ok(SequenceOutcome::Completed);
            }

            for car_number in self.aggregator.observe(&snapshot) {
                match self.tracker.record(&car_number) {
                    CollisionAction::Noted { car_number, collisions } => {
                        info!(event = %run.name, car = %car_number, collisions, "Collision noted");
                    }
                    CollisionAction::Warn { car_number, remaining } => {
                        if self.config.warn_drivers {
                            let text = format!(
                                "collision recorded, {} more until a penalty",
                                remaining
                            );
                            checkpoint!(run.direct(&car_number, &text).await);
                        }
                    }
                    CollisionAction::Penalize { car_number, penalty } => {
                        checkpoint!(run.command(&chat::penalty(&car_number, &penalty)).await);
                        run.ctx.enqueue_audio(AudioCue::Penalty);
                        run.ctx.enqueue_broadcast(
                            "Penalty",
                            format!("#{} {} for repeated collisions", car_number, penalty),
                        );
                    }
                }
            }
            checkpoint!(run.sleep(secs(self.config.poll_interval)).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationContext;
    use crate::test_utils::{ScriptedTelemetry, car, snapshot};
    use crate::types::SessionState;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn second_spike_earns_a_penalty() {
        let view =
            ScriptedTelemetry::new(snapshot(100.0, vec![car(1, "7", 5, 0.2), car(2, "8", 5, 0.1)]));
        let (ctx, mut queues) = CoordinationContext::new();
        let run = EventRun::new("collisions", Arc::clone(&ctx), view.clone());
        let config = CollisionPenaltyConfig {
            collisions_per_penalty: Some(2),
            penalties: vec!["D".to_string()],
            ..CollisionPenaltyConfig::default()
        };
        let mut penalties = CollisionPenalty::new(config).expect("config");

        let script = {
            let view = Arc::clone(&view);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                view.update_car(1, |car| car.incident_count = 4);
                tokio::time::sleep(Duration::from_secs(3)).await;
                view.update_car(1, |car| car.incident_count = 8);
                tokio::time::sleep(Duration::from_secs(3)).await;
                view.update(|snap| snap.session_state = SessionState::CoolDown);
                tokio::time::sleep(Duration::from_secs(3)).await;
                view.update(|snap| snap.session_state = SessionState::Invalid);
            })
        };
        let outcome = penalties.run_sequence(&run).await.expect("sequence");
        script.await.expect("script");

        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(view.count_sent("/7 collision recorded, 1 more"), 1);
        assert_eq!(view.count_sent("!bl 7 D"), 1);
        assert_eq!(view.count_sent("!bl 8"), 0);
        assert_eq!(penalties.tracker().collisions("7"), 2);
        assert_eq!(queues.audio.recv().await, Some(AudioCue::Penalty));
        assert_eq!(
            queues.driver.recv().await.as_deref(),
            Some("#7: collision recorded, 1 more until a penalty")
        );
    }

    #[test]
    fn missing_penalty_fails_at_construction() {
        let config = CollisionPenaltyConfig {
            collisions_per_penalty: Some(3),
            ..CollisionPenaltyConfig::default()
        };
        assert!(CollisionPenalty::new(config).is_err());
    }
}
