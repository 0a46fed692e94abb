//! Running order sampling and tick-to-tick comparison
//!
//! [`sample`] turns a snapshot into the field ordered by distance covered.
//! [`OrderComparison`] pairs two consecutive samples and answers the
//! questions every state machine asks each tick: who just started a lap, who
//! just left or entered pit road.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{BitField, CarId, TelemetrySnapshot};

/// One car's place in the running order for a single tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningOrderEntry {
    pub car_id: CarId,
    pub car_number: String,
    pub car_class: i32,
    pub laps_completed: i32,
    pub lap_fraction: f64,
    /// `laps_completed + lap_fraction`
    pub total_progress: f64,
    pub in_pits: bool,
    pub best_lap_time: f64,
    pub last_lap_time: f64,
    /// Leader's total progress minus this car's, in laps
    pub gap_to_leader: f64,
    pub pace_flags: BitField,
}

/// Sample the running order: pace car and cars out of the world excluded,
/// sorted by total progress, leader first.
pub fn sample(snapshot: &TelemetrySnapshot) -> Vec<RunningOrderEntry> {
    let mut order: Vec<RunningOrderEntry> = snapshot
        .cars
        .iter()
        .filter(|car| Some(car.car_id) != snapshot.pace_car_id && car.in_world())
        .map(|car| RunningOrderEntry {
            car_id: car.car_id,
            car_number: car.car_number.clone(),
            car_class: car.car_class,
            laps_completed: car.laps_completed,
            lap_fraction: car.lap_fraction,
            total_progress: car.total_progress(),
            in_pits: car.in_pits,
            best_lap_time: car.best_lap_time,
            last_lap_time: car.last_lap_time,
            gap_to_leader: 0.0,
            pace_flags: car.pace_flags,
        })
        .collect();

    order.sort_by(|a, b| b.total_progress.total_cmp(&a.total_progress));

    if let Some(leader_progress) = order.first().map(|leader| leader.total_progress) {
        for entry in &mut order {
            entry.gap_to_leader = leader_progress - entry.total_progress;
        }
    }
    order
}

/// Sample the running order, dropping cars more than `max_laps_behind_leader`
/// laps behind the leader.
pub fn sample_within(
    snapshot: &TelemetrySnapshot,
    max_laps_behind_leader: f64,
) -> Vec<RunningOrderEntry> {
    let mut order = sample(snapshot);
    order.retain(|entry| entry.gap_to_leader <= max_laps_behind_leader);
    order
}

/// Current leader of each class
///
/// The on-track leader of a class is replaced by the class's leading pitted
/// car when that car has completed more laps.
pub fn class_leaders(order: &[RunningOrderEntry]) -> HashMap<i32, &RunningOrderEntry> {
    let mut on_track: HashMap<i32, &RunningOrderEntry> = HashMap::new();
    let mut pitted: HashMap<i32, &RunningOrderEntry> = HashMap::new();

    for entry in order {
        let bucket = if entry.in_pits { &mut pitted } else { &mut on_track };
        bucket.entry(entry.car_class).or_insert(entry);
    }

    for (class, pit_leader) in pitted {
        let replace = on_track
            .get(&class)
            .is_none_or(|track_leader| pit_leader.laps_completed > track_leader.laps_completed);
        if replace {
            on_track.insert(class, pit_leader);
        }
    }
    on_track
}

/// Cars at least a full lap behind the leader
pub fn lapped_cars(order: &[RunningOrderEntry]) -> impl Iterator<Item = &RunningOrderEntry> {
    order.iter().filter(|entry| entry.gap_to_leader > 1.0)
}

/// Two consecutive samples of the running order
pub struct OrderComparison<'a> {
    prior: &'a [RunningOrderEntry],
    current: &'a [RunningOrderEntry],
}

impl<'a> OrderComparison<'a> {
    pub fn new(prior: &'a [RunningOrderEntry], current: &'a [RunningOrderEntry]) -> Self {
        Self { prior, current }
    }

    fn pair(&self, car_id: CarId) -> Option<(&'a RunningOrderEntry, &'a RunningOrderEntry)> {
        let prior = self.prior.iter().find(|entry| entry.car_id == car_id);
        let current = self.current.iter().find(|entry| entry.car_id == car_id);
        match (prior, current) {
            (Some(prior), Some(current)) => Some((prior, current)),
            _ => {
                debug!(
                    car_id,
                    in_prior = prior.is_some(),
                    in_current = current.is_some(),
                    "Car missing from running order comparison"
                );
                None
            }
        }
    }

    /// The car's lap count went up since the prior sample
    pub fn completed_lap(&self, car_id: CarId) -> bool {
        self.pair(car_id)
            .is_some_and(|(prior, current)| current.laps_completed > prior.laps_completed)
    }

    /// The car came off pit road since the prior sample, with at least one
    /// lap completed in both samples
    pub fn left_pits(&self, car_id: CarId) -> bool {
        self.pair(car_id).is_some_and(|(prior, current)| {
            prior.in_pits
                && !current.in_pits
                && prior.laps_completed > 0
                && current.laps_completed > 0
        })
    }

    /// The car went onto pit road since the prior sample, with at least one
    /// lap completed in both samples
    pub fn entered_pits(&self, car_id: CarId) -> bool {
        self.pair(car_id).is_some_and(|(prior, current)| {
            !prior.in_pits
                && current.in_pits
                && prior.laps_completed > 0
                && current.laps_completed > 0
        })
    }

    /// Cars in the current sample that started a new lap or came off pit
    /// road on track since the prior sample
    pub fn crossed_or_exited(&self) -> Vec<&'a RunningOrderEntry> {
        self.current
            .iter()
            .filter(|entry| {
                (self.completed_lap(entry.car_id) && !entry.in_pits) || self.left_pits(entry.car_id)
            })
            .collect()
    }
}
