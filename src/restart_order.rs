//! Authoritative pacing order for slow zone restarts
//!
//! Cars join the order one by one as they reach the line (or leave pit road)
//! after the slow zone starts. The order is sorted by
//! `(wave_around + slower_class_catchup, [class speed rank], join tick)`, so
//! cars owed extra distance sit at the back of the queue and ties go to
//! whoever joined first.
//!
//! Every update computes where each car should be (`expected_progress`) from
//! the car in front of it:
//!
//! ```text
//! expected = min(pred.actual, pred.expected) - SAFETY_GAP - pred.adj + car.adj
//! adj      = wave_around + slower_class_catchup
//! ```
//!
//! and classifies the field against the leader's actual progress:
//!
//! | set            | condition                                              |
//! |----------------|--------------------------------------------------------|
//! | wave around    | `expected - actual > (1 + expected - leader) mod 1`    |
//! | catch up       | `expected - actual > min_catchup_distance`             |
//! | out of place   | `actual > expected`                                    |
//!
//! The sets are advisory: they drive reminder messages and never reorder the
//! queue. `SAFETY_GAP` is small enough that long queues drift slightly;
//! thresholds are kept exactly as listed rather than compensated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::running_order::RunningOrderEntry;
use crate::types::{CarId, CarTelemetry, TelemetrySnapshot};

/// Gap (in laps) reserved between consecutive cars in the expected order
pub const SAFETY_GAP: f64 = 0.001;

/// Speed rank of each car class, fastest class ranked 1
///
/// Derived once from best valid lap times when the slow zone starts, and
/// stable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassSpeedRanks {
    ranks: HashMap<i32, u32>,
    unranked: u32,
}

impl ClassSpeedRanks {
    /// Rank classes by their fastest valid (positive) best lap.
    /// Classes with no valid lap share the rank after the slowest timed class.
    pub fn from_cars<'a>(cars: impl IntoIterator<Item = &'a CarTelemetry>) -> Self {
        let mut best: HashMap<i32, Option<f64>> = HashMap::new();
        for car in cars {
            let slot = best.entry(car.car_class).or_insert(None);
            if car.best_lap_time > 0.0 {
                *slot = Some(slot.map_or(car.best_lap_time, |b: f64| b.min(car.best_lap_time)));
            }
        }

        let mut timed: Vec<(i32, f64)> =
            best.iter().filter_map(|(class, time)| time.map(|t| (*class, t))).collect();
        timed.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let unranked = timed.len() as u32 + 1;
        let mut ranks: HashMap<i32, u32> =
            timed.iter().enumerate().map(|(i, (class, _))| (*class, i as u32 + 1)).collect();
        for class in best.keys() {
            ranks.entry(*class).or_insert(unranked);
        }
        Self { ranks, unranked }
    }

    /// Rank classes from every car in a snapshot except the pace car
    pub fn from_snapshot(snapshot: &TelemetrySnapshot) -> Self {
        Self::from_cars(snapshot.cars.iter().filter(|car| Some(car.car_id) != snapshot.pace_car_id))
    }

    /// Rank of a class; classes never seen rank with the untimed classes
    pub fn rank(&self, car_class: i32) -> u32 {
        self.ranks.get(&car_class).copied().unwrap_or(self.unranked.max(1))
    }
}

/// One car in the pacing order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartOrderEntry {
    pub car_id: CarId,
    pub car_number: String,
    pub car_class: i32,
    pub class_speed_rank: u32,
    /// Total progress when the car joined
    pub pacing_start_progress: f64,
    /// Join sequence number, refreshed when the car re-joins
    pub pacing_start_tick: u64,
    pub wave_around: u8,
    pub slower_class_catchup: u8,
    pub expected_progress: f64,
    pub actual_progress: f64,
}

impl RestartOrderEntry {
    /// Forward offset reserved for a car owed extra distance
    pub fn adjustments(&self) -> f64 {
        (self.wave_around + self.slower_class_catchup) as f64
    }

    /// Laps driven since joining the order
    pub fn pacing_laps(&self) -> f64 {
        self.actual_progress - self.pacing_start_progress
    }
}

/// A car that needs an instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedCar {
    pub car_id: CarId,
    pub car_number: String,
    /// Position in the pacing order, 0 is the leader
    pub position: usize,
    /// Car that should be directly ahead
    pub behind_number: String,
    /// `expected - actual` in laps
    pub deficit: f64,
}

/// Advisory classification from one update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderClassification {
    /// Must overtake the whole field and rejoin at the back
    pub wave_around: Vec<ClassifiedCar>,
    /// Must close the gap to the car ahead
    pub catch_up: Vec<ClassifiedCar>,
    /// Ahead of where the order says, must yield
    pub out_of_place: Vec<ClassifiedCar>,
}

impl OrderClassification {
    pub fn is_empty(&self) -> bool {
        self.wave_around.is_empty() && self.catch_up.is_empty() && self.out_of_place.is_empty()
    }
}

/// Builds and maintains the pacing order
///
/// Owned by exactly one state machine; not shared between tasks.
#[derive(Debug, Clone)]
pub struct RestartOrderManager {
    entries: Vec<RestartOrderEntry>,
    ranks: ClassSpeedRanks,
    class_separation: bool,
    /// Minimum catch-up distance as a fraction of a lap
    min_catchup_distance: f64,
    next_tick: u64,
}

impl RestartOrderManager {
    pub fn new(ranks: ClassSpeedRanks, class_separation: bool, min_catchup_distance: f64) -> Self {
        Self {
            entries: Vec::new(),
            ranks,
            class_separation,
            min_catchup_distance,
            next_tick: 0,
        }
    }

    /// Insert a car, or move an already tracked car to the back of its tier
    /// with a fresh join tick.
    pub fn add_car(
        &mut self,
        car: &RunningOrderEntry,
        wave_around: bool,
        slower_class_catchup: bool,
    ) {
        let rejoined = self.remove(car.car_id).is_some();
        let entry = RestartOrderEntry {
            car_id: car.car_id,
            car_number: car.car_number.clone(),
            car_class: car.car_class,
            class_speed_rank: self.ranks.rank(car.car_class),
            pacing_start_progress: car.total_progress,
            pacing_start_tick: self.take_tick(),
            wave_around: wave_around as u8,
            slower_class_catchup: slower_class_catchup as u8,
            expected_progress: car.total_progress,
            actual_progress: car.total_progress,
        };
        debug!(
            car = %entry.car_number,
            tick = entry.pacing_start_tick,
            wave_around,
            slower_class_catchup,
            rejoined,
            "Car joined pacing order"
        );
        self.entries.push(entry);
    }

    fn take_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, car_id: CarId) -> Option<RestartOrderEntry> {
        let index = self.entries.iter().position(|entry| entry.car_id == car_id)?;
        Some(self.entries.remove(index))
    }

    fn sort_key(&self, entry: &RestartOrderEntry) -> (u8, u32, u64) {
        let rank = if self.class_separation { entry.class_speed_rank } else { 0 };
        (entry.wave_around + entry.slower_class_catchup, rank, entry.pacing_start_tick)
    }

    /// Re-sort, refresh actual progress from `current`, recompute expected
    /// progress and classify the field.
    pub fn update_order(&mut self, current: &[RunningOrderEntry]) -> OrderClassification {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|entry| self.sort_key(entry));
        self.entries = entries;

        for entry in &mut self.entries {
            match current.iter().find(|car| car.car_id == entry.car_id) {
                Some(car) => entry.actual_progress = car.total_progress,
                None => debug!(
                    car = %entry.car_number,
                    "Car missing from sample, keeping last progress"
                ),
            }
        }

        let Some(leader) = self.entries.first_mut() else {
            return OrderClassification::default();
        };
        leader.expected_progress = leader.actual_progress;
        let leader_actual = leader.actual_progress;

        for i in 1..self.entries.len() {
            let (pred_actual, pred_expected, pred_adj) = {
                let pred = &self.entries[i - 1];
                (pred.actual_progress, pred.expected_progress, pred.adjustments())
            };
            let entry = &mut self.entries[i];
            entry.expected_progress =
                pred_actual.min(pred_expected) - SAFETY_GAP - pred_adj + entry.adjustments();
        }

        let mut classification = OrderClassification::default();
        for (position, entry) in self.entries.iter().enumerate().skip(1) {
            let deficit = entry.expected_progress - entry.actual_progress;
            let lap_window = (1.0 + entry.expected_progress - leader_actual).rem_euclid(1.0);
            let car = ClassifiedCar {
                car_id: entry.car_id,
                car_number: entry.car_number.clone(),
                position,
                behind_number: self.entries[position - 1].car_number.clone(),
                deficit,
            };
            if deficit > lap_window {
                classification.wave_around.push(car);
            } else if deficit > self.min_catchup_distance {
                classification.catch_up.push(car);
            } else if entry.actual_progress > entry.expected_progress {
                classification.out_of_place.push(car);
            }
        }

        trace!(
            cars = self.entries.len(),
            wave_around = classification.wave_around.len(),
            catch_up = classification.catch_up.len(),
            out_of_place = classification.out_of_place.len(),
            "Pacing order updated"
        );
        classification
    }

    /// Split the current order round-robin into `lanes` managers.
    ///
    /// Each lane keeps the flags of its cars and their relative order.
    pub fn deal(&self, lanes: usize) -> Vec<RestartOrderManager> {
        let lanes = lanes.max(1);
        let mut dealt: Vec<RestartOrderManager> = (0..lanes)
            .map(|_| {
                RestartOrderManager::new(
                    self.ranks.clone(),
                    self.class_separation,
                    self.min_catchup_distance,
                )
            })
            .collect();

        for (i, entry) in self.entries.iter().enumerate() {
            let lane = &mut dealt[i % lanes];
            let mut entry = entry.clone();
            entry.pacing_start_tick = lane.take_tick();
            lane.entries.push(entry);
        }
        dealt
    }

    pub fn entries(&self) -> &[RestartOrderEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, car_id: CarId) -> bool {
        self.entries.iter().any(|entry| entry.car_id == car_id)
    }

    pub fn position_of(&self, car_id: CarId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.car_id == car_id)
    }

    pub fn leader(&self) -> Option<&RestartOrderEntry> {
        self.entries.first()
    }

    pub fn get(&self, car_id: CarId) -> Option<&RestartOrderEntry> {
        self.entries.iter().find(|entry| entry.car_id == car_id)
    }
}
