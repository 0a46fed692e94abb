//! Race control configuration
//!
//! One YAML document lists the events of a session. Every event pairs a
//! trigger with a behavior, and any trigger can drive any behavior:
//!
//! ```yaml
//! poll_interval: 1.0
//! events:
//!   - name: random caution
//!     trigger:
//!       likelihood_percent: 50
//!       window: { type: time, min_start: 600, max_start: -600 }
//!     behavior:
//!       type: caution
//!       reason: debris on track
//!   - name: incidents
//!     trigger:
//!       window: { type: lap, min_start: 1, max_start: 1 }
//!     behavior:
//!       type: incident_caution
//!       threshold: 3
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::caution::CautionSequence;
use crate::events::collision_penalty::{CollisionPenalty, CollisionPenaltyConfig};
use crate::events::incident_caution::{IncidentCaution, IncidentCautionConfig};
use crate::events::slow_zone::{SlowZoneConfig, SlowZoneControl, SlowZoneSequence};
use crate::events::{CautionConfig, EventBehavior, positive};
use crate::supervisor::{EventSupervisor, ScheduledTask};
use crate::trigger::TriggerSpec;
use crate::{RaceControlError, Result};

fn default_poll_interval() -> f64 {
    1.0
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceControlConfig {
    /// Seconds between trigger polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Seed for reproducible trigger draws
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

impl Default for RaceControlConfig {
    fn default() -> Self {
        Self { poll_interval: default_poll_interval(), seed: None, events: Vec::new() }
    }
}

/// One configured event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,
    pub trigger: TriggerSpec,
    pub behavior: BehaviorConfig,
}

/// Behavior selected by its `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BehaviorConfig {
    Caution(CautionConfig),
    SlowZone(SlowZoneConfig),
    IncidentCaution(IncidentCautionConfig),
    CollisionPenalty(CollisionPenaltyConfig),
}

impl BehaviorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BehaviorConfig::Caution(_) => "caution",
            BehaviorConfig::SlowZone(_) => "slow_zone",
            BehaviorConfig::IncidentCaution(_) => "incident_caution",
            BehaviorConfig::CollisionPenalty(_) => "collision_penalty",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BehaviorConfig::Caution(config) => config.validate(),
            BehaviorConfig::SlowZone(config) => config.validate(),
            BehaviorConfig::IncidentCaution(config) => config.validate(),
            BehaviorConfig::CollisionPenalty(config) => config.validate(),
        }
    }
}

/// Tasks built from a configuration, plus handles for operator control
pub struct EventPlan {
    pub tasks: Vec<ScheduledTask>,
    /// Manual restart and lane controls, by slow zone event name
    pub slow_zone_controls: HashMap<String, Arc<SlowZoneControl>>,
}

impl EventPlan {
    pub fn into_tasks(self) -> Vec<ScheduledTask> {
        self.tasks
    }
}

impl RaceControlConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml_str(&yaml)
            .with_context(|| format!("Invalid race control config {}", path.display()))
    }

    /// Check every event. Errors name the offending event.
    pub fn validate(&self) -> Result<()> {
        positive("poll_interval", self.poll_interval)?;
        let mut names = HashSet::new();
        for event in &self.events {
            if event.name.trim().is_empty() {
                return Err(RaceControlError::config("name", "event names must not be empty"));
            }
            if !names.insert(event.name.as_str()) {
                return Err(RaceControlError::config(
                    "name",
                    format!("duplicate event name '{}'", event.name),
                ));
            }
            let scoped = |e: RaceControlError| match e {
                RaceControlError::Config { field, reason } => {
                    RaceControlError::config(format!("{}.{}", event.name, field), reason)
                }
                other => other,
            };
            event.trigger.validate().map_err(scoped)?;
            event.behavior.validate().map_err(scoped)?;
        }
        Ok(())
    }

    /// Supervisor configured with this poll interval and seed
    pub fn supervisor(&self) -> EventSupervisor {
        let supervisor =
            EventSupervisor::new().with_poll_interval(Duration::from_secs_f64(self.poll_interval));
        match self.seed {
            Some(seed) => supervisor.with_seed(seed),
            None => supervisor,
        }
    }

    /// Build one scheduled task per event
    pub fn build(&self) -> Result<EventPlan> {
        self.validate()?;
        let mut plan = EventPlan {
            tasks: Vec::with_capacity(self.events.len()),
            slow_zone_controls: HashMap::new(),
        };

        for (index, event) in self.events.iter().enumerate() {
            let rng = || match self.seed {
                // Offset from the supervisor's trigger seeds
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1000 + index as u64)),
                None => StdRng::from_os_rng(),
            };
            let behavior: Box<dyn EventBehavior> = match &event.behavior {
                BehaviorConfig::Caution(config) => {
                    Box::new(CautionSequence::with_rng(config.clone(), rng()))
                }
                BehaviorConfig::SlowZone(config) => {
                    let control = Arc::new(SlowZoneControl::new());
                    plan.slow_zone_controls.insert(event.name.clone(), Arc::clone(&control));
                    Box::new(SlowZoneSequence::with_parts(config.clone(), control, rng()))
                }
                BehaviorConfig::IncidentCaution(config) => {
                    let caution = CautionSequence::with_rng(config.caution.clone(), rng());
                    Box::new(IncidentCaution::with_caution(config.clone(), caution))
                }
                BehaviorConfig::CollisionPenalty(config) => {
                    Box::new(CollisionPenalty::new(config.clone())?)
                }
            };
            info!(event = %event.name, kind = event.behavior.kind(), "Event configured");
            plan.tasks.push(ScheduledTask {
                name: event.name.clone(),
                trigger: event.trigger.clone(),
                behavior,
            });
        }
        Ok(plan)
    }

    pub fn into_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.build().map(EventPlan::into_tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerWindow;

    const SAMPLE: &str = r#"
seed: 7
events:
  - name: random caution
    trigger:
      likelihood_percent: 50
      window: { type: time, min_start: 600, max_start: -600 }
    behavior:
      type: caution
      reason: debris on track
      pit_close_warning: 20
  - name: slow zone
    trigger:
      window: { type: lap, min_start: 5, max_start: 10 }
    behavior:
      type: slow_zone
      lane_count: 2
  - name: collisions
    trigger:
      window: { type: lap, min_start: 0, max_start: 0 }
    behavior:
      type: collision_penalty
      collisions_per_penalty: 3
      penalties: ["D", "0"]
"#;

    #[test]
    fn sample_parses_with_defaults() {
        let config = RaceControlConfig::from_yaml_str(SAMPLE).expect("config");
        assert_eq!(config.poll_interval, 1.0);
        assert_eq!(config.events.len(), 3);

        let caution = &config.events[0];
        assert_eq!(caution.trigger.likelihood_percent, 50);
        assert_eq!(
            caution.trigger.window,
            TriggerWindow::Time { min_start: 600.0, max_start: -600.0 }
        );
        match &caution.behavior {
            BehaviorConfig::Caution(c) => {
                assert_eq!(c.reason, "debris on track");
                assert_eq!(c.pit_close_warning, 20);
                assert!(c.full_sequence);
            }
            other => panic!("unexpected behavior {:?}", other),
        }

        assert_eq!(config.events[1].trigger.likelihood_percent, 100);
        assert_eq!(config.events[1].behavior.kind(), "slow_zone");
    }

    #[test]
    fn build_registers_slow_zone_controls() {
        let plan = RaceControlConfig::from_yaml_str(SAMPLE).expect("config").build().expect("plan");
        assert_eq!(plan.tasks.len(), 3);
        assert!(plan.slow_zone_controls.contains_key("slow zone"));
        let kinds: Vec<_> = plan.tasks.iter().map(|t| t.behavior.kind()).collect();
        assert_eq!(kinds, vec!["caution", "slow_zone", "collision_penalty"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let yaml = r#"
events:
  - name: a
    trigger: { window: { type: lap, min_start: 1, max_start: 2 } }
    behavior: { type: caution }
  - name: a
    trigger: { window: { type: lap, min_start: 1, max_start: 2 } }
    behavior: { type: caution }
"#;
        let err = RaceControlConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate event name"));
    }

    #[test]
    fn penalty_threshold_without_penalties_names_the_event() {
        let yaml = r#"
events:
  - name: collisions
    trigger: { window: { type: lap, min_start: 1, max_start: 1 } }
    behavior: { type: collision_penalty, collisions_per_penalty: 2 }
"#;
        match RaceControlConfig::from_yaml_str(yaml) {
            Err(RaceControlError::Config { field, .. }) => {
                assert_eq!(field, "collisions.penalties")
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_behavior_is_a_parse_error() {
        let yaml = r#"
events:
  - name: x
    trigger: { window: { type: lap, min_start: 1, max_start: 1 } }
    behavior: { type: safety_car }
"#;
        assert!(matches!(
            RaceControlConfig::from_yaml_str(yaml),
            Err(RaceControlError::Parse { .. })
        ));
    }

    #[test]
    fn likelihood_above_100_rejected() {
        let yaml = r#"
events:
  - name: x
    trigger: { likelihood_percent: 120, window: { type: time, min_start: 1, max_start: 2 } }
    behavior: { type: caution }
"#;
        match RaceControlConfig::from_yaml_str(yaml) {
            Err(RaceControlError::Config { field, .. }) => {
                assert_eq!(field, "x.likelihood_percent")
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    const LAP_ONE: &str = "{ window: { type: lap, min_start: 1, max_start: 1 } }";

    #[test]
    fn malformed_timings_fail_at_load() {
        for (behavior, value) in [
            ("slow_zone", "-1.0"),
            ("slow_zone", ".nan"),
            ("caution", ".inf"),
            ("caution", "-0.5"),
        ] {
            let yaml = format!(
                "events:\n  - name: x\n    trigger: {}\n    behavior: {{ type: {}, {}: {} }}\n",
                LAP_ONE, behavior, "skip_announce_max_delay", value
            );
            match RaceControlConfig::from_yaml_str(&yaml) {
                Err(RaceControlError::Config { field, .. }) => {
                    assert_eq!(field, "x.skip_announce_max_delay")
                }
                other => panic!("{} {} accepted: {:?}", behavior, value, other.map(|_| ())),
            }
        }

        let yaml = format!(
            "events:\n  - name: x\n    trigger: {}\n    behavior: {}\n",
            LAP_ONE, "{ type: collision_penalty, poll_interval: .inf }"
        );
        assert!(matches!(
            RaceControlConfig::from_yaml_str(&yaml),
            Err(RaceControlError::Config { field, .. }) if field == "x.poll_interval"
        ));
    }

    #[test]
    fn missing_file_carries_path_context() {
        let err = RaceControlConfig::from_path("/nonexistent/racecontrol.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/racecontrol.yaml"));
    }
}
