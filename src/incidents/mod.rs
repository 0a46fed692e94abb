//! Incident spike detection
//!
//! [`IncidentAggregator`] keeps a rolling window of incident counts per car
//! and reports the cars whose count jumped by at least the threshold inside
//! the window (a "4x"). Consumers layer on top:
//!
//! - [`CollisionPenaltyTracker`] escalates penalties per car
//! - [`MultiDriverIncidentDetector`] counts distinct cars for a caution

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{CarId, TelemetrySnapshot};

mod multi_driver;
mod penalty;

pub use multi_driver::MultiDriverIncidentDetector;
pub use penalty::{CollisionAction, CollisionPenaltyTracker};

/// Incident count jump that counts as a spike
pub const DEFAULT_SPIKE_THRESHOLD: i32 = 4;

/// One row of the rolling table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentObservation {
    pub car_number: String,
    pub timestamp: f64,
    pub incident_count: i32,
}

/// Follows which cars took the checkered flag
///
/// Once the session is finishing, a car that completes another lap is done
/// racing and its incidents no longer matter.
#[derive(Debug, Clone, Default)]
pub struct CheckeredWatcher {
    laps: HashMap<CarId, i32>,
    finished: HashSet<CarId>,
}

impl CheckeredWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, snapshot: &TelemetrySnapshot) {
        let finishing = snapshot.is_finishing();
        for car in &snapshot.cars {
            let previous = self.laps.insert(car.car_id, car.laps_completed);
            if finishing
                && previous.is_some_and(|laps| car.laps_completed > laps)
                && self.finished.insert(car.car_id)
            {
                debug!(car = %car.car_number, "Car took the checkered flag");
            }
        }
    }

    pub fn is_finished(&self, car_id: CarId) -> bool {
        self.finished.contains(&car_id)
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }
}

/// Rolling-window incident spike detector
///
/// Stateful; one aggregator per consumer task.
#[derive(Debug, Clone)]
pub struct IncidentAggregator {
    window: f64,
    threshold: i32,
    rows: VecDeque<IncidentObservation>,
    checkered: CheckeredWatcher,
}

impl IncidentAggregator {
    /// Aggregator over a window of `window` seconds with the default threshold
    pub fn new(window: f64) -> Self {
        Self::with_threshold(window, DEFAULT_SPIKE_THRESHOLD)
    }

    pub fn with_threshold(window: f64, threshold: i32) -> Self {
        Self { window, threshold, rows: VecDeque::new(), checkered: CheckeredWatcher::new() }
    }

    /// Record one tick and return the cars that spiked in it.
    ///
    /// A spiking car's rows are purged, so the same jump is reported once.
    pub fn observe(&mut self, snapshot: &TelemetrySnapshot) -> Vec<String> {
        self.checkered.observe(snapshot);
        let now = snapshot.session_time_elapsed;

        for car in &snapshot.cars {
            if Some(car.car_id) == snapshot.pace_car_id || self.checkered.is_finished(car.car_id) {
                continue;
            }
            self.rows.push_back(IncidentObservation {
                car_number: car.car_number.clone(),
                timestamp: now,
                incident_count: car.incident_count,
            });
        }

        let finished: HashSet<&str> = snapshot
            .cars
            .iter()
            .filter(|car| self.checkered.is_finished(car.car_id))
            .map(|car| car.car_number.as_str())
            .collect();
        let cutoff = now - self.window;
        self.rows
            .retain(|row| row.timestamp >= cutoff && !finished.contains(row.car_number.as_str()));

        let mut spread: HashMap<&str, (i32, i32, usize)> = HashMap::new();
        for row in &self.rows {
            let (min, max, rows) =
                spread.entry(row.car_number.as_str()).or_insert((i32::MAX, i32::MIN, 0));
            *min = (*min).min(row.incident_count);
            *max = (*max).max(row.incident_count);
            *rows += 1;
        }

        let mut spiked: Vec<String> = spread
            .into_iter()
            .filter(|(_, (min, max, rows))| *rows >= 2 && max - min >= self.threshold)
            .map(|(number, _)| number.to_string())
            .collect();
        spiked.sort();

        if !spiked.is_empty() {
            debug!(cars = ?spiked, time = now, "Incident spike");
            self.rows.retain(|row| !spiked.contains(&row.car_number));
        }
        trace!(rows = self.rows.len(), "Incident window pruned");
        spiked
    }

    /// Rows currently held for one car
    pub fn rows_for(&self, car_number: &str) -> usize {
        self.rows.iter().filter(|row| row.car_number == car_number).count()
    }

    pub fn checkered(&self) -> &CheckeredWatcher {
        &self.checkered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{car, snapshot};
    use crate::types::{CarTelemetry, SessionState};

    fn with_incidents(mut car: CarTelemetry, count: i32) -> CarTelemetry {
        car.incident_count = count;
        car
    }

    #[test]
    fn spike_is_reported_once_and_purged() {
        let mut aggregator = IncidentAggregator::new(10.0);
        let mut reports = Vec::new();
        for (t, count) in [10, 10, 10, 14, 14].into_iter().enumerate() {
            let snap = snapshot(t as f64, vec![with_incidents(car(1, "7", 3, 0.1), count)]);
            reports.push(aggregator.observe(&snap));
        }
        assert_eq!(reports.iter().filter(|r| !r.is_empty()).count(), 1);
        assert_eq!(reports[3], vec!["7".to_string()]);
        assert_eq!(aggregator.rows_for("7"), 1);
    }

    #[test]
    fn a_new_rise_reports_again() {
        let mut aggregator = IncidentAggregator::new(10.0);
        let counts = [0, 4, 4, 8];
        let spikes: Vec<bool> = counts
            .into_iter()
            .enumerate()
            .map(|(t, count)| {
                let snap = snapshot(t as f64, vec![with_incidents(car(1, "7", 3, 0.1), count)]);
                !aggregator.observe(&snap).is_empty()
            })
            .collect();
        assert_eq!(spikes, vec![false, true, false, true]);
    }

    #[test]
    fn slow_rise_outside_window_is_ignored() {
        let mut aggregator = IncidentAggregator::new(5.0);
        for (t, count) in [(0.0, 0), (3.0, 2), (6.0, 2), (9.0, 4)] {
            let snap = snapshot(t, vec![with_incidents(car(1, "7", 3, 0.1), count)]);
            assert!(aggregator.observe(&snap).is_empty());
        }
    }

    #[test]
    fn finished_cars_are_not_tracked() {
        let mut aggregator = IncidentAggregator::new(10.0);
        let mut snap = snapshot(0.0, vec![car(1, "7", 20, 0.9), car(2, "8", 20, 0.8)]);
        snap.session_state = SessionState::Checkered;
        aggregator.observe(&snap);

        snap.session_time_elapsed = 1.0;
        snap.cars[0].laps_completed = 21;
        snap.cars[0].lap_fraction = 0.01;
        aggregator.observe(&snap);
        assert!(aggregator.checkered().is_finished(1));
        assert!(!aggregator.checkered().is_finished(2));

        snap.session_time_elapsed = 2.0;
        snap.cars[0].incident_count = 8;
        snap.cars[1].incident_count = 8;
        assert_eq!(aggregator.observe(&snap), vec!["8".to_string()]);
        assert_eq!(aggregator.rows_for("7"), 0);
    }
}
