//! Slow zone procedure and restart
//!
//! ```text
//! Announced -> WaitingLapBoundary -> BuildingOrder -> [FormingLanes]
//!           -> AwaitingRestart -> Released
//! ```
//!
//! Cars join the pacing order as they start a lap or leave pit road after
//! the zone begins. Reminders follow the order classification, and the green
//! comes once a restart is requested and the leader's sampled speed exceeds
//! the restart speed.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{EventBehavior, EventRun, SequenceOutcome, non_negative, positive, secs};
use crate::coordination::{AudioCue, Wake, checkpoint};
use crate::restart_order::{
    ClassSpeedRanks, OrderClassification, RestartOrderEntry, RestartOrderManager,
};
use crate::running_order::{self, OrderComparison, RunningOrderEntry};
use crate::speed::{SpeedSampler, restart_speed_kmh};
use crate::types::{CarId, TelemetrySnapshot};
use crate::{RaceControlError, Result};

/// Slow zone procedure settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowZoneConfig {
    /// Pace speed cap (km/h)
    pub max_speed_kmh: f64,
    /// Restart speed as a percentage of the pace cap
    pub restart_speed_pct: f64,
    pub lane_count: u32,
    pub lane_names: Vec<String>,
    pub class_separation: bool,
    /// Gap to a tracked class leader that earns a slower class catch-up (laps)
    pub class_catchup_margin: f64,
    /// Gap to the car ahead that triggers a catch-up reminder (m)
    pub min_catchup_distance_m: f64,
    /// Field considered for the order (laps behind the leader)
    pub max_laps_behind_leader: f64,
    /// Re-announce interval while waiting for the lap boundary (s)
    pub reannounce_interval: f64,
    /// Interval between reminder rounds (s)
    pub reminder_interval: f64,
    /// Request the restart once the leader has paced this many laps
    pub auto_restart_after_laps: Option<f64>,
    pub announce_skip: bool,
    pub skip_announce_max_delay: f64,
    /// Telemetry poll interval (s)
    pub poll_interval: f64,
}

impl Default for SlowZoneConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: 60.0,
            restart_speed_pct: 150.0,
            lane_count: 1,
            lane_names: vec!["Left".to_string(), "Right".to_string()],
            class_separation: false,
            class_catchup_margin: 0.1,
            min_catchup_distance_m: 200.0,
            max_laps_behind_leader: 3.0,
            reannounce_interval: 30.0,
            reminder_interval: 10.0,
            auto_restart_after_laps: None,
            announce_skip: true,
            skip_announce_max_delay: 5.0,
            poll_interval: 0.5,
        }
    }
}

impl SlowZoneConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lane_count == 0 {
            return Err(RaceControlError::config("lane_count", "must be at least 1"));
        }
        if self.lane_count > 1 && self.lane_names.len() < self.lane_count as usize {
            return Err(RaceControlError::config(
                "lane_names",
                format!("{} names for {} lanes", self.lane_names.len(), self.lane_count),
            ));
        }
        for (field, value) in [
            ("restart_speed_pct", self.restart_speed_pct),
            ("max_speed_kmh", self.max_speed_kmh),
            ("max_laps_behind_leader", self.max_laps_behind_leader),
            ("reannounce_interval", self.reannounce_interval),
            ("reminder_interval", self.reminder_interval),
            ("poll_interval", self.poll_interval),
        ] {
            positive(field, value)?;
        }
        non_negative("class_catchup_margin", self.class_catchup_margin)?;
        non_negative("min_catchup_distance_m", self.min_catchup_distance_m)?;
        non_negative("skip_announce_max_delay", self.skip_announce_max_delay)?;
        if let Some(laps) = self.auto_restart_after_laps {
            positive("auto_restart_after_laps", laps)?;
        }
        Ok(())
    }

    /// Leader speed the green waits for (km/h)
    pub fn restart_speed_kmh(&self) -> f64 {
        restart_speed_kmh(self.max_speed_kmh, self.restart_speed_pct)
    }

    /// Catch-up threshold as a fraction of a lap
    pub fn min_catchup_fraction(&self, track_length_km: f64) -> f64 {
        if track_length_km > 0.0 {
            self.min_catchup_distance_m / (track_length_km * 1000.0)
        } else {
            0.0
        }
    }

    fn lane_name(&self, lane: usize) -> String {
        self.lane_names.get(lane).cloned().unwrap_or_else(|| format!("Lane {}", lane + 1))
    }
}

/// Where the slow zone procedure is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowZonePhase {
    Idle,
    Announced,
    WaitingLapBoundary,
    BuildingOrder,
    FormingLanes,
    AwaitingRestart,
    Released,
}

/// A car out of place when the green came
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartViolation {
    pub car_number: String,
    pub lane: Option<String>,
    pub expected: f64,
    pub actual: f64,
}

/// Operator handle for a running slow zone
///
/// Shared by `Arc` between the sequence and whoever decides when the field
/// restarts.
#[derive(Debug, Default)]
pub struct SlowZoneControl {
    restart: AtomicBool,
    lanes: AtomicBool,
    violations: Mutex<Vec<RestartViolation>>,
    restart_order: Mutex<Vec<RestartOrderEntry>>,
}

impl SlowZoneControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that the field may restart
    pub fn request_restart(&self) {
        if !self.restart.swap(true, Ordering::SeqCst) {
            info!("Slow zone restart requested");
        }
    }

    /// Ask for the field to be split into lanes
    pub fn request_lanes(&self) {
        if !self.lanes.swap(true, Ordering::SeqCst) {
            info!("Slow zone lanes requested");
        }
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    pub fn lanes_requested(&self) -> bool {
        self.lanes.load(Ordering::SeqCst)
    }

    /// Cars flagged at the most recent green, for post-race review
    pub fn violations(&self) -> Vec<RestartViolation> {
        self.violations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pacing order at the most recent green, lane by lane once lanes are formed
    pub fn restart_order(&self) -> Vec<RestartOrderEntry> {
        self.restart_order.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_violations(&self, violations: &[RestartViolation]) {
        self.violations.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(violations);
    }

    fn record_restart_order(&self, order: Vec<RestartOrderEntry>) {
        *self.restart_order.lock().unwrap_or_else(|e| e.into_inner()) = order;
    }
}

/// Flags for a car joining the order: `(wave_around, slower_class_catchup)`
///
/// A car takes a wave around when its class leader is not yet in the order,
/// or is more than a lap ahead. With class separation, a car of a slower
/// class that trails its tracked class leader by more than the margin takes
/// a slower class catch-up.
pub fn join_flags(
    car: &RunningOrderEntry,
    class_leader: Option<&RunningOrderEntry>,
    leader_tracked: bool,
    ranks: &ClassSpeedRanks,
    config: &SlowZoneConfig,
) -> (bool, bool) {
    let Some(leader) = class_leader.filter(|leader| leader.car_id != car.car_id) else {
        return (false, false);
    };
    let gap = leader.total_progress - car.total_progress;
    if !leader_tracked || gap > 1.0 {
        return (true, false);
    }
    let catchup = config.class_separation
        && ranks.rank(car.car_class) > 1
        && gap > config.class_catchup_margin;
    (false, catchup)
}

/// Green is given only above the restart speed, never at it
pub fn restart_ready(leader_speed_kmh: f64, restart_speed_kmh: f64) -> bool {
    leader_speed_kmh > restart_speed_kmh
}

/// The forming pack: one order, or one order per lane once lanes are formed
#[derive(Debug, Clone)]
pub struct Pack {
    order: RestartOrderManager,
    lanes: Option<Vec<RestartOrderManager>>,
}

impl Pack {
    pub fn new(order: RestartOrderManager) -> Self {
        Self { order, lanes: None }
    }

    pub fn has_lanes(&self) -> bool {
        self.lanes.is_some()
    }

    pub fn lanes(&self) -> Option<&[RestartOrderManager]> {
        self.lanes.as_deref()
    }

    pub fn contains(&self, car_id: CarId) -> bool {
        match &self.lanes {
            Some(lanes) => lanes.iter().any(|lane| lane.contains(car_id)),
            None => self.order.contains(car_id),
        }
    }

    pub fn len(&self) -> usize {
        match &self.lanes {
            Some(lanes) => lanes.iter().map(RestartOrderManager::len).sum(),
            None => self.order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tracked car, lane by lane once lanes are formed
    pub fn entries(&self) -> Vec<RestartOrderEntry> {
        match &self.lanes {
            Some(lanes) => lanes.iter().flat_map(|lane| lane.entries().iter().cloned()).collect(),
            None => self.order.entries().to_vec(),
        }
    }

    /// Insert or refresh a car. With lanes, a car stays in its lane and a
    /// newcomer goes to the shortest lane.
    pub fn add_car(&mut self, car: &RunningOrderEntry, wave_around: bool, catchup: bool) {
        match &mut self.lanes {
            Some(lanes) => {
                let index = lanes
                    .iter()
                    .position(|lane| lane.contains(car.car_id))
                    .or_else(|| {
                        lanes.iter().enumerate().min_by_key(|(_, lane)| lane.len()).map(|(i, _)| i)
                    });
                if let Some(lane) = index.and_then(|i| lanes.get_mut(i)) {
                    lane.add_car(car, wave_around, catchup);
                }
            }
            None => self.order.add_car(car, wave_around, catchup),
        }
    }

    /// Deal the current order round-robin into lanes
    pub fn form_lanes(&mut self, lane_count: usize) {
        if self.lanes.is_none() {
            self.lanes = Some(self.order.deal(lane_count));
        }
    }

    /// Update every order; the lane index is `None` before lanes are formed
    pub fn update(
        &mut self,
        current: &[RunningOrderEntry],
    ) -> Vec<(Option<usize>, OrderClassification)> {
        match &mut self.lanes {
            Some(lanes) => lanes
                .iter_mut()
                .enumerate()
                .map(|(i, lane)| (Some(i), lane.update_order(current)))
                .collect(),
            None => vec![(None, self.order.update_order(current))],
        }
    }

    /// Front car of the pack (front of the first lane once lanes exist)
    pub fn leader(&self) -> Option<&RestartOrderEntry> {
        match &self.lanes {
            Some(lanes) => lanes.first().and_then(RestartOrderManager::leader),
            None => self.order.leader(),
        }
    }
}

/// Slow zone behavior
pub struct SlowZoneSequence {
    config: SlowZoneConfig,
    control: std::sync::Arc<SlowZoneControl>,
    phase: SlowZonePhase,
    rng: StdRng,
}

/// Per-run tracking that lives across phases
struct Tracking {
    pack: Pack,
    ranks: ClassSpeedRanks,
    prior: Vec<RunningOrderEntry>,
    classification: Vec<(Option<usize>, OrderClassification)>,
    sampler: Option<SpeedSampler>,
    last_reminder: Option<Instant>,
    last_pester: Option<Instant>,
}

impl SlowZoneSequence {
    pub fn new(config: SlowZoneConfig) -> Self {
        Self::with_parts(config, std::sync::Arc::new(SlowZoneControl::new()), StdRng::from_os_rng())
    }

    pub fn with_parts(
        config: SlowZoneConfig,
        control: std::sync::Arc<SlowZoneControl>,
        rng: StdRng,
    ) -> Self {
        Self { config, control, phase: SlowZonePhase::Idle, rng }
    }

    /// Handle for requesting the restart and reading violations
    pub fn control(&self) -> std::sync::Arc<SlowZoneControl> {
        std::sync::Arc::clone(&self.control)
    }

    pub fn phase(&self) -> SlowZonePhase {
        self.phase
    }

    fn enter(&mut self, run: &EventRun, phase: SlowZonePhase) {
        info!(event = %run.name, from = ?self.phase, to = ?phase, "Slow zone phase");
        self.phase = phase;
    }

    async fn skip(&mut self, run: &EventRun, reason: &str) -> Result<SequenceOutcome> {
        info!(event = %run.name, reason, "Slow zone skipped");
        if self.config.announce_skip {
            let delay = self.rng.random_range(0.0..=self.config.skip_announce_max_delay);
            checkpoint!(run.sleep(secs(delay)).await);
            let text = format!("{} skipped, {}", run.name.replace('!', ""), reason);
            checkpoint!(run.say(&text, true).await);
        }
        Ok(SequenceOutcome::Skipped(reason.to_string()))
    }

    async fn announce(&self, run: &EventRun) -> Wake {
        run.say("Slow zone. Hold position and form up behind the leader at the line", true).await
    }

    fn lane_label(&self, lane: Option<usize>) -> Option<String> {
        lane.map(|i| self.config.lane_name(i))
    }

    /// Add every car that started a lap on track or left pit road
    fn track_joins(&self, tracking: &mut Tracking, current: &[RunningOrderEntry]) {
        let comparison = OrderComparison::new(&tracking.prior, current);
        let joins = comparison.crossed_or_exited();
        if joins.is_empty() {
            return;
        }

        let leaders = running_order::class_leaders(current);
        for car in joins {
            if car.gap_to_leader > self.config.max_laps_behind_leader {
                debug!(
                    car = %car.car_number,
                    gap = car.gap_to_leader,
                    "Car too far back for the order"
                );
                continue;
            }
            let class_leader = leaders.get(&car.car_class).copied();
            let leader_tracked =
                class_leader.is_some_and(|leader| tracking.pack.contains(leader.car_id));
            let (wave, catchup) =
                join_flags(car, class_leader, leader_tracked, &tracking.ranks, &self.config);
            tracking.pack.add_car(car, wave, catchup);
        }
    }

    /// One tick of order maintenance shared by the building and restart phases
    async fn maintain(
        &self,
        run: &EventRun,
        tracking: &mut Tracking,
        snapshot: &TelemetrySnapshot,
        current: Vec<RunningOrderEntry>,
    ) -> Wake {
        self.track_joins(tracking, &current);
        tracking.classification = tracking.pack.update(&current);

        if let Some(leader) = tracking.pack.leader()
            && tracking.sampler.as_ref().is_none_or(|sampler| sampler.car_id() != leader.car_id)
        {
            debug!(car = %leader.car_number, "Tracking pack leader speed");
            let mut sampler = SpeedSampler::new(leader.car_id);
            let _ = sampler.next(snapshot);
            tracking.sampler = Some(sampler);
        }

        tracking.prior = current;

        let due = tracking
            .last_reminder
            .is_none_or(|at| at.elapsed() >= secs(self.config.reminder_interval));
        if due && !tracking.classification.iter().all(|(_, c)| c.is_empty()) {
            tracking.last_reminder = Some(Instant::now());
            if self.send_reminders(run, &tracking.classification).await.is_cancelled() {
                return Wake::Cancelled;
            }
        }
        Wake::Elapsed
    }

    async fn send_reminders(
        &self,
        run: &EventRun,
        classification: &[(Option<usize>, OrderClassification)],
    ) -> Wake {
        for (lane, sets) in classification {
            let prefix = self
                .lane_label(*lane)
                .map(|name| format!("{} lane: ", name))
                .unwrap_or_default();
            let wave = sets
                .wave_around
                .iter()
                .map(|car| (car, "wave around, pass the pack and rejoin at the back".to_string()));
            let catch_up = sets
                .catch_up
                .iter()
                .map(|car| (car, format!("catch up to #{}", car.behind_number)));
            let yield_to =
                sets.out_of_place.iter().map(|car| (car, format!("let #{} by", car.behind_number)));
            for (car, text) in wave.chain(catch_up).chain(yield_to) {
                let text = format!("{}{}", prefix, text);
                if run.direct(&car.car_number, &text).await.is_cancelled() {
                    return Wake::Cancelled;
                }
            }
        }
        Wake::Elapsed
    }

    /// Sampled leader speed, pestering the leader when above the cap
    async fn leader_speed(
        &self,
        run: &EventRun,
        tracking: &mut Tracking,
        snapshot: &TelemetrySnapshot,
        pester: bool,
    ) -> (Wake, Option<f64>) {
        let sampled = tracking.sampler.as_mut().and_then(|sampler| sampler.next(snapshot));
        let Some(speed) = sampled else {
            return (Wake::Elapsed, None);
        };
        let number = tracking.pack.leader().map(|leader| leader.car_number.clone());
        let due = tracking
            .last_pester
            .is_none_or(|at| at.elapsed() >= secs(self.config.reminder_interval));
        if let Some(number) = number
            && pester
            && due
            && speed > self.config.max_speed_kmh
        {
            debug!(
                car = %number,
                speed,
                cap = self.config.max_speed_kmh,
                "Leader above pace speed"
            );
            tracking.last_pester = Some(Instant::now());
            let text = format!("slow down, pace speed is {:.0} km/h", self.config.max_speed_kmh);
            if run.direct(&number, &text).await.is_cancelled() {
                return (Wake::Cancelled, Some(speed));
            }
        }
        (Wake::Elapsed, Some(speed))
    }

    fn form_lanes(&mut self, run: &EventRun, tracking: &mut Tracking) -> Vec<String> {
        self.enter(run, SlowZonePhase::FormingLanes);
        tracking.pack.form_lanes(self.config.lane_count as usize);
        tracking
            .pack
            .lanes()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, lane)| lane_assignment(&self.config.lane_name(i), lane.entries()))
            .collect()
    }

    fn violations(&self, tracking: &Tracking) -> Vec<RestartViolation> {
        let mut violations = Vec::new();
        for (lane, sets) in &tracking.classification {
            for car in &sets.out_of_place {
                let entry = match (lane, tracking.pack.lanes()) {
                    (Some(i), Some(lanes)) => lanes.get(*i).and_then(|l| l.get(car.car_id)),
                    _ => tracking.pack.order.get(car.car_id),
                };
                if let Some(entry) = entry {
                    violations.push(RestartViolation {
                        car_number: car.car_number.clone(),
                        lane: self.lane_label(*lane),
                        expected: entry.expected_progress,
                        actual: entry.actual_progress,
                    });
                }
            }
        }
        violations
    }
}

/// Broadcast text listing the cars dealt into one lane
pub fn lane_assignment(lane_name: &str, entries: &[RestartOrderEntry]) -> String {
    let cars: Vec<String> = entries.iter().map(|entry| format!("#{}", entry.car_number)).collect();
    format!("{} lane: {}", lane_name, cars.join(", "))
}

#[async_trait::async_trait]
impl EventBehavior for SlowZoneSequence {
    fn kind(&self) -> &'static str {
        "slow_zone"
    }

    async fn run_sequence(&mut self, run: &EventRun) -> Result<SequenceOutcome> {
        let (snapshot, order) = run.sample().await?;
        if snapshot.caution_active() || snapshot.slow_zone_active() {
            return self.skip(run, "the field is already under a caution or slow zone").await;
        }
        if !run.ctx.try_claim_busy(&run.name) {
            return self.skip(run, "another intervention is in progress").await;
        }

        self.enter(run, SlowZonePhase::Announced);
        run.ctx.enqueue_audio(AudioCue::SlowZone);
        run.ctx.enqueue_broadcast("Slow zone", "Form up behind the leader");
        checkpoint!(self.announce(run).await);

        let ranks = ClassSpeedRanks::from_snapshot(&snapshot);
        let min_catchup = self.config.min_catchup_fraction(snapshot.track_length_km);
        let mut tracking = Tracking {
            pack: Pack::new(RestartOrderManager::new(
                ranks.clone(),
                self.config.class_separation,
                min_catchup,
            )),
            ranks,
            prior: order,
            classification: Vec::new(),
            sampler: None,
            last_reminder: None,
            last_pester: None,
        };

        // Lap boundary
        self.enter(run, SlowZonePhase::WaitingLapBoundary);
        let entry_laps = snapshot.leader_laps();
        let mut last_announce = Instant::now();
        let poll = secs(self.config.poll_interval);
        let mut boundary = loop {
            checkpoint!(run.sleep(poll).await);
            let (snapshot, current) = run.sample().await?;
            if snapshot.leader_laps() > entry_laps {
                break (snapshot, current);
            }

            let comparison = OrderComparison::new(&tracking.prior, &current);
            for car in comparison.crossed_or_exited() {
                let text = "still racing, one more lap to the slow zone";
                checkpoint!(run.direct(&car.car_number, text).await);
            }
            if !run.quickie && last_announce.elapsed() >= secs(self.config.reannounce_interval) {
                last_announce = Instant::now();
                checkpoint!(self.announce(run).await);
            }
            tracking.prior = current;
        };
        info!(event = %run.name, laps = entry_laps + 1, "Slow zone lap boundary reached");

        // Building order
        self.enter(run, SlowZonePhase::BuildingOrder);
        loop {
            let (snapshot, current) = boundary;
            checkpoint!(self.maintain(run, &mut tracking, &snapshot, current).await);
            let (wake, _) = self.leader_speed(run, &mut tracking, &snapshot, true).await;
            checkpoint!(wake);

            if let Some(laps) = self.config.auto_restart_after_laps
                && let Some(leader) = tracking.pack.leader()
                && leader.pacing_laps() >= laps
            {
                self.control.request_restart();
            }

            let lanes_due = self.config.lane_count > 1
                && !tracking.pack.has_lanes()
                && (self.control.lanes_requested() || self.control.restart_requested());
            if lanes_due {
                for text in self.form_lanes(run, &mut tracking) {
                    checkpoint!(run.say(&text, true).await);
                }
                self.enter(run, SlowZonePhase::BuildingOrder);
            }

            if self.control.restart_requested() {
                break;
            }
            checkpoint!(run.sleep(poll).await);
            boundary = run.sample().await?;
        }

        // Restart
        self.enter(run, SlowZonePhase::AwaitingRestart);
        let restart_speed = self.config.restart_speed_kmh();
        run.ctx.enqueue_audio(AudioCue::GetReady);
        let text = format!("Get ready, green when the leader reaches {:.0} km/h", restart_speed);
        checkpoint!(run.say(&text, true).await);
        if let Some(sampler) = tracking.sampler.as_mut() {
            // The average so far predates the restart signal
            let _ = sampler.next(&run.snapshot().await?);
        }

        loop {
            checkpoint!(run.sleep(poll).await);
            let (snapshot, current) = run.sample().await?;
            checkpoint!(self.maintain(run, &mut tracking, &snapshot, current).await);
            let (wake, speed) = self.leader_speed(run, &mut tracking, &snapshot, false).await;
            checkpoint!(wake);
            if let Some(speed) = speed {
                debug!(event = %run.name, speed, restart_speed, "Leader speed");
                if restart_ready(speed, restart_speed) {
                    info!(event = %run.name, speed, restart_speed, "Green flag");
                    break;
                }
            }
        }

        run.ctx.enqueue_audio(AudioCue::Green);
        run.ctx.enqueue_broadcast("Green flag", "Slow zone over, racing resumes");
        checkpoint!(run.say("Green flag, the slow zone is over", true).await);

        let violations = self.violations(&tracking);
        for violation in &violations {
            warn!(
                event = %run.name,
                car = %violation.car_number,
                lane = ?violation.lane,
                expected = violation.expected,
                actual = violation.actual,
                "Restart violation"
            );
            run.ctx.enqueue_broadcast(
                "Restart violation",
                format!("#{} was out of place at the green", violation.car_number),
            );
        }
        self.control.record_violations(&violations);
        self.control.record_restart_order(tracking.pack.entries());

        self.enter(run, SlowZonePhase::Released);
        run.ctx.release_busy(&run.name);
        Ok(SequenceOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationContext;
    use crate::running_order::sample;
    use crate::test_utils::{ScriptedTelemetry, car, class_car, init_tracing, snapshot};
    use std::sync::Arc;
    use std::time::Duration;

    const PACE_KMH: f64 = 54.0;

    fn session() -> TelemetrySnapshot {
        snapshot(
            1200.0,
            vec![
                car(1, "1", 10, 0.90),
                car(2, "2", 10, 0.85),
                car(3, "3", 10, 0.80),
                car(4, "4", 8, 0.95),
            ],
        )
    }

    fn moving_session() -> Arc<ScriptedTelemetry> {
        let view = ScriptedTelemetry::new(session());
        for id in 1..=4 {
            view.set_speed(id, PACE_KMH);
        }
        view
    }

    fn config() -> SlowZoneConfig {
        SlowZoneConfig { announce_skip: false, ..SlowZoneConfig::default() }
    }

    fn sequence(config: SlowZoneConfig) -> SlowZoneSequence {
        let control = Arc::new(SlowZoneControl::new());
        SlowZoneSequence::with_parts(config, control, StdRng::seed_from_u64(3))
    }

    fn after(delay: u64, f: impl FnOnce() + Send + 'static) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            f();
        })
    }

    #[test]
    fn restart_speed_is_strictly_exceeded() {
        let config = SlowZoneConfig { max_speed_kmh: 60.0, restart_speed_pct: 150.0, ..config() };
        assert_eq!(config.restart_speed_kmh(), 90.0);
        assert!(!restart_ready(90.0, config.restart_speed_kmh()));
        assert!(restart_ready(90.01, config.restart_speed_kmh()));
    }

    #[test]
    fn lane_settings_are_validated() {
        let no_lanes = SlowZoneConfig { lane_count: 0, ..config() };
        assert!(matches!(
            no_lanes.validate(),
            Err(RaceControlError::Config { field, .. }) if field == "lane_count"
        ));

        let unnamed = SlowZoneConfig { lane_count: 3, ..config() };
        assert!(matches!(
            unnamed.validate(),
            Err(RaceControlError::Config { field, .. }) if field == "lane_names"
        ));

        let no_restart = SlowZoneConfig { restart_speed_pct: 0.0, ..config() };
        assert!(no_restart.validate().is_err());
        assert!(SlowZoneConfig { lane_count: 2, ..config() }.validate().is_ok());
    }

    #[test]
    fn skip_delay_and_poll_interval_must_be_finite() {
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let delay = SlowZoneConfig { skip_announce_max_delay: bad, ..config() };
            assert!(matches!(
                delay.validate(),
                Err(RaceControlError::Config { field, .. }) if field == "skip_announce_max_delay"
            ));
            let poll = SlowZoneConfig { poll_interval: bad, ..config() };
            assert!(matches!(
                poll.validate(),
                Err(RaceControlError::Config { field, .. }) if field == "poll_interval"
            ));
        }
    }

    #[test]
    fn join_flags_follow_class_leader() {
        let cars = vec![
            class_car(1, "1", 1, 80.0, 10, 0.50),
            class_car(2, "2", 1, 80.0, 9, 0.40),
            class_car(3, "3", 2, 90.0, 10, 0.30),
            class_car(4, "4", 2, 90.0, 10, 0.10),
        ];
        let ranks = ClassSpeedRanks::from_cars(&cars);
        let order = sample(&snapshot(0.0, cars));
        let get = |id: CarId| order.iter().find(|e| e.car_id == id).expect("car");
        let separated = SlowZoneConfig { class_separation: true, ..config() };

        // Class leader joins clean
        assert_eq!(join_flags(get(1), Some(get(1)), false, &ranks, &separated), (false, false));
        // More than a lap behind the tracked leader
        assert_eq!(join_flags(get(2), Some(get(1)), true, &ranks, &separated), (true, false));
        // Leader not in the order yet
        assert_eq!(join_flags(get(4), Some(get(3)), false, &ranks, &separated), (true, false));
        // Slower class trailing its tracked leader by more than the margin
        assert_eq!(join_flags(get(4), Some(get(3)), true, &ranks, &separated), (false, true));
        assert_eq!(join_flags(get(4), Some(get(3)), true, &ranks, &config()), (false, false));
    }

    #[test]
    fn newcomers_join_the_shortest_lane() {
        let order = sample(&session());
        let mut pack = Pack::new(RestartOrderManager::new(ClassSpeedRanks::default(), false, 0.05));
        pack.add_car(&order[0], false, false);
        pack.form_lanes(2);
        pack.add_car(&order[1], false, false);
        pack.add_car(&order[2], false, false);
        pack.add_car(&order[1], false, false);

        let lanes = pack.lanes().expect("lanes");
        let ids = |lane: &RestartOrderManager| {
            lane.entries().iter().map(|e| e.car_id).collect::<Vec<_>>()
        };
        assert_eq!(ids(&lanes[0]), vec![1, 3]);
        assert_eq!(ids(&lanes[1]), vec![2]);
        assert_eq!(pack.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn green_waits_for_leader_above_restart_speed() {
        init_tracing();
        let view = moving_session();
        let (ctx, mut queues) = CoordinationContext::new();
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());
        let mut zone = sequence(config());
        let control = zone.control();

        let start = Instant::now();
        let restart = after(60, move || control.request_restart());
        let speed_up = {
            let view = Arc::clone(&view);
            after(80, move || view.set_speed(1, 95.0))
        };
        let outcome = zone.run_sequence(&run).await.expect("sequence");
        restart.await.expect("restart");
        speed_up.await.expect("speed up");

        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(zone.phase(), SlowZonePhase::Released);
        assert!(start.elapsed() >= Duration::from_secs(80));
        assert!(!ctx.is_busy());
        assert!(zone.control().violations().is_empty());

        assert!(view.count_sent("/4 still racing") >= 1);
        assert_eq!(view.count_sent("/1 still racing"), 0);
        let sent = view.sent();
        let get_ready = sent.iter().position(|s| s.starts_with("Get ready")).expect("get ready");
        let green = sent.iter().position(|s| s.starts_with("Green flag")).expect("green");
        assert!(get_ready < green);
        assert!(sent[get_ready].contains("90 km/h"));

        assert_eq!(queues.audio.recv().await, Some(AudioCue::SlowZone));
        assert_eq!(queues.audio.recv().await, Some(AudioCue::GetReady));
        assert_eq!(queues.audio.recv().await, Some(AudioCue::Green));
    }

    #[tokio::test(start_paused = true)]
    async fn car_ahead_of_slot_at_green_is_a_violation() {
        let view = moving_session();
        let (ctx, mut queues) = CoordinationContext::new();
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());
        let mut zone = sequence(config());
        let control = zone.control();

        let pass = {
            let view = Arc::clone(&view);
            after(55, move || {
                view.update(|snap| {
                    let leader = snap.car(1).map(|c| (c.laps_completed, c.lap_fraction));
                    if let (Some((laps, fraction)), Some(car)) =
                        (leader, snap.cars.iter_mut().find(|c| c.car_id == 2))
                    {
                        car.laps_completed = laps;
                        car.lap_fraction = fraction + 0.02;
                    }
                })
            })
        };
        let restart = after(60, move || control.request_restart());
        let speed_up = {
            let view = Arc::clone(&view);
            after(80, move || view.set_speed(1, 95.0))
        };
        let outcome = zone.run_sequence(&run).await.expect("sequence");
        for handle in [pass, restart, speed_up] {
            handle.await.expect("task");
        }

        assert_eq!(outcome, SequenceOutcome::Completed);
        let violations = zone.control().violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].car_number, "2");
        assert!(violations[0].actual > violations[0].expected);
        assert!(view.count_sent("/2 let #1 by") >= 1);

        let mut titles = Vec::new();
        while let Ok(message) = queues.broadcast.try_recv() {
            titles.push(message.title);
        }
        assert!(titles.contains(&"Restart violation".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn lanes_are_dealt_and_announced() {
        let view = moving_session();
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());
        let mut zone = sequence(SlowZoneConfig { lane_count: 2, ..config() });
        let lanes = zone.control();
        let restart = zone.control();

        let lanes = after(50, move || lanes.request_lanes());
        let restart = after(60, move || restart.request_restart());
        let speed_up = {
            let view = Arc::clone(&view);
            after(80, move || view.set_speed(1, 95.0))
        };
        let outcome = zone.run_sequence(&run).await.expect("sequence");
        for handle in [lanes, restart, speed_up] {
            handle.await.expect("task");
        }

        assert_eq!(outcome, SequenceOutcome::Completed);
        let sent = view.sent();
        assert!(sent.contains(&"Left lane: #1, #3".to_string()));
        assert!(sent.contains(&"Right lane: #2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_can_follow_leader_pacing_laps() {
        let view = moving_session();
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());
        let mut zone = sequence(SlowZoneConfig { auto_restart_after_laps: Some(0.05), ..config() });

        let speed_up = {
            let view = Arc::clone(&view);
            after(100, move || view.set_speed(1, 100.0))
        };
        let outcome = zone.run_sequence(&run).await.expect("sequence");
        speed_up.await.expect("speed up");

        assert_eq!(outcome, SequenceOutcome::Completed);
        assert!(zone.control().restart_requested());
    }

    fn numbers(order: &[RestartOrderEntry]) -> Vec<&str> {
        order.iter().map(|entry| entry.car_number.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn car_rejoining_from_pit_road_goes_to_the_back() {
        let view = moving_session();
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());
        let mut zone = sequence(config());
        let control = zone.control();

        // Car 2 joins at 36 s, pits, and comes back out after car 3 joined at 48 s
        let pit_in = {
            let view = Arc::clone(&view);
            after(40, move || view.update_car(2, |car| car.in_pits = true))
        };
        let pit_out = {
            let view = Arc::clone(&view);
            after(50, move || view.update_car(2, |car| car.in_pits = false))
        };
        let restart = after(60, move || control.request_restart());
        let speed_up = {
            let view = Arc::clone(&view);
            after(80, move || view.set_speed(1, 95.0))
        };
        let outcome = zone.run_sequence(&run).await.expect("sequence");
        for handle in [pit_in, pit_out, restart, speed_up] {
            handle.await.expect("task");
        }

        assert_eq!(outcome, SequenceOutcome::Completed);
        let order = zone.control().restart_order();
        assert_eq!(numbers(&order), vec!["1", "3", "2"]);
        assert!(order[2].pacing_start_tick > order[1].pacing_start_tick);
        assert!(order.iter().all(|entry| entry.adjustments() == 0.0));

        assert!(view.count_sent("/3 catch up to #1") >= 1);
        assert!(view.count_sent("/2 let #3 by") >= 1);
        let violations = zone.control().violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].car_number, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn owed_distance_earns_wave_around_directs() {
        // Class 2 trails class 1 on lap times; car 3 is well behind its class
        // leader and car 4 is a lap down on it
        let view = ScriptedTelemetry::new(snapshot(
            1200.0,
            vec![
                class_car(1, "1", 1, 80.0, 10, 0.90),
                class_car(2, "2", 2, 90.0, 10, 0.80),
                class_car(3, "3", 2, 90.0, 10, 0.65),
                class_car(4, "4", 2, 90.0, 9, 0.55),
            ],
        ));
        for id in 1..=4 {
            view.set_speed(id, PACE_KMH);
        }
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());
        let mut zone = sequence(SlowZoneConfig { class_separation: true, ..config() });
        let control = zone.control();

        let restart = after(130, move || control.request_restart());
        let speed_up = {
            let view = Arc::clone(&view);
            after(150, move || view.set_speed(1, 95.0))
        };
        let outcome = zone.run_sequence(&run).await.expect("sequence");
        restart.await.expect("restart");
        speed_up.await.expect("speed up");

        assert_eq!(outcome, SequenceOutcome::Completed);
        let order = zone.control().restart_order();
        assert_eq!(numbers(&order), vec!["1", "2", "3", "4"]);
        let flags: Vec<_> =
            order.iter().map(|entry| (entry.wave_around, entry.slower_class_catchup)).collect();
        assert_eq!(flags, vec![(0, 0), (0, 0), (0, 1), (1, 0)]);

        let sent = view.sent();
        let get_ready = sent.iter().position(|s| s.starts_with("Get ready")).expect("get ready");
        let first = |text: &str| sent.iter().position(|s| s == text);
        let wave = "wave around, pass the pack and rejoin at the back";
        for text in [
            "/2 catch up to #1".to_string(),
            format!("/3 {}", wave),
            format!("/4 {}", wave),
        ] {
            let at = first(&text).unwrap_or_else(|| panic!("{} not sent", text));
            assert!(at < get_ready, "{} sent after the restart call", text);
        }
        assert!(zone.control().violations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_context_skips() {
        let view = moving_session();
        let (ctx, _queues) = CoordinationContext::new();
        assert!(ctx.try_claim_busy("caution"));
        let run = EventRun::new("slow zone", Arc::clone(&ctx), view.clone());

        let outcome = sequence(config()).run_sequence(&run).await.expect("sequence");
        assert!(matches!(outcome, SequenceOutcome::Skipped(_)));
        assert!(view.sent().is_empty());
    }
}
