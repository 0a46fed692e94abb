//! Full course caution procedure
//!
//! ```text
//! Idle -> ClosingPits -> AwaitingPitLaneClear -> CautionThrown
//!      -> [ExtendingLaps] -> [WaveArounds] -> AwaitingGreen -> Idle
//! ```
//!
//! The sequence only starts when no caution is flagged and the busy flag can
//! be claimed. The flag is released on the normal exit path only; a fault or
//! a cancellation leaves it set until an operator clears it.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{EventBehavior, EventRun, SequenceOutcome, non_negative, positive, secs};
use crate::coordination::{AudioCue, Wake, checkpoint};
use crate::running_order::{self, OrderComparison};
use crate::types::{CarId, TelemetrySnapshot, waved_around};
use crate::{Result, chat};

/// Countdown marks announced before pit road closes, in seconds
const PIT_CLOSE_MARKS: [u32; 7] = [30, 20, 10, 5, 3, 2, 1];

/// Caution procedure settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CautionConfig {
    /// Reason shown with the caution command
    pub reason: String,
    /// Close pit road before throwing the caution
    pub full_sequence: bool,
    /// Length of the pit-close countdown (s)
    pub pit_close_warning: u32,
    /// Longest wait for pit road to empty after closing it (s)
    pub pit_close_max_wait: f64,
    /// Field considered for pit clearing and wave arounds (laps)
    pub max_laps_behind_leader: f64,
    /// Laps added with `!pacelaps`, 0 disables the extension
    pub extend_laps: u32,
    /// Pacing laps before the extension is sent
    pub extend_after_laps: u32,
    pub wave_arounds: bool,
    /// Pacing laps before cars are waved around
    pub wave_around_lap: u32,
    /// Tell the field when the caution was skipped
    pub announce_skip: bool,
    /// Upper bound of the random delay before a skip announcement (s)
    pub skip_announce_max_delay: f64,
    /// Longest wait for the caution flag to show after the command (s)
    pub caution_confirm_timeout: f64,
    /// Telemetry poll interval (s)
    pub poll_interval: f64,
}

impl Default for CautionConfig {
    fn default() -> Self {
        Self {
            reason: String::new(),
            full_sequence: true,
            pit_close_warning: 30,
            pit_close_max_wait: 30.0,
            max_laps_behind_leader: 3.0,
            extend_laps: 0,
            extend_after_laps: 1,
            wave_arounds: true,
            wave_around_lap: 1,
            announce_skip: true,
            skip_announce_max_delay: 5.0,
            caution_confirm_timeout: 10.0,
            poll_interval: 0.5,
        }
    }
}

impl CautionConfig {
    pub fn validate(&self) -> Result<()> {
        positive("poll_interval", self.poll_interval)?;
        positive("max_laps_behind_leader", self.max_laps_behind_leader)?;
        non_negative("pit_close_max_wait", self.pit_close_max_wait)?;
        non_negative("skip_announce_max_delay", self.skip_announce_max_delay)?;
        non_negative("caution_confirm_timeout", self.caution_confirm_timeout)?;
        Ok(())
    }
}

/// Where the caution procedure is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CautionPhase {
    Idle,
    ClosingPits,
    AwaitingPitLaneClear,
    CautionThrown,
    ExtendingLaps,
    WaveArounds,
    AwaitingGreen,
}

/// Counts laps completed by the pace car
///
/// A lap counts when the pace car wraps past the line after passing through
/// the middle of the lap (0.4 to 0.5), so a single noisy sample near the line
/// cannot count twice. Stateful; one counter per caution.
#[derive(Debug, Clone, Default)]
pub struct PacingLapCounter {
    armed: bool,
    laps: u32,
}

impl PacingLapCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the pace car's lap fraction. Returns true when a lap was counted.
    pub fn observe(&mut self, lap_fraction: f64) -> bool {
        if lap_fraction > 0.4 && lap_fraction < 0.5 {
            self.armed = true;
        } else if self.armed && lap_fraction < 0.4 {
            self.armed = false;
            self.laps += 1;
            return true;
        }
        false
    }

    pub fn laps(&self) -> u32 {
        self.laps
    }
}

/// Pit-close countdown marks for a warning of `total` seconds, total first
pub fn pit_close_checkpoints(total: u32) -> Vec<u32> {
    if total == 0 {
        return Vec::new();
    }
    std::iter::once(total).chain(PIT_CLOSE_MARKS.into_iter().filter(|mark| *mark < total)).collect()
}

enum PaceWait {
    Reached,
    Overridden,
    Cancelled,
}

/// Full course caution behavior
pub struct CautionSequence {
    config: CautionConfig,
    phase: CautionPhase,
    rng: StdRng,
}

impl CautionSequence {
    pub fn new(config: CautionConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn with_rng(config: CautionConfig, rng: StdRng) -> Self {
        Self { config, phase: CautionPhase::Idle, rng }
    }

    pub fn config(&self) -> &CautionConfig {
        &self.config
    }

    pub fn phase(&self) -> CautionPhase {
        self.phase
    }

    fn enter(&mut self, run: &EventRun, phase: CautionPhase) {
        info!(event = %run.name, from = ?self.phase, to = ?phase, "Caution phase");
        self.phase = phase;
    }

    /// Decline to start, optionally telling the field after a random delay
    async fn skip(&mut self, run: &EventRun, reason: &str) -> Result<SequenceOutcome> {
        info!(event = %run.name, reason, "Caution skipped");
        if self.config.announce_skip {
            let delay = self.rng.random_range(0.0..=self.config.skip_announce_max_delay);
            checkpoint!(run.sleep(secs(delay)).await);
            let text = format!("{} skipped, {}", run.name.replace('!', ""), reason);
            checkpoint!(run.say(&text, true).await);
        }
        Ok(SequenceOutcome::Skipped(reason.to_string()))
    }

    /// Run everything after the entry guard. The caller holds the busy flag.
    pub async fn run_guarded(&mut self, run: &EventRun) -> Result<SequenceOutcome> {
        if self.config.full_sequence {
            self.enter(run, CautionPhase::ClosingPits);
            if run.quickie {
                debug!(event = %run.name, "Quickie caution, pit close countdown skipped");
            } else {
                checkpoint!(self.pit_close_countdown(run).await);
            }
            checkpoint!(run.command(&chat::pit_close()).await);

            self.enter(run, CautionPhase::AwaitingPitLaneClear);
            checkpoint!(self.await_pit_lane_clear(run).await?);
        }

        self.enter(run, CautionPhase::CautionThrown);
        checkpoint!(run.command(&chat::caution(&self.config.reason)).await);
        run.ctx.enqueue_audio(AudioCue::Caution);
        let text = if self.config.reason.is_empty() {
            "Full course caution"
        } else {
            self.config.reason.as_str()
        };
        run.ctx.enqueue_broadcast("Caution", text);
        checkpoint!(self.await_caution_flag(run).await?);

        let mut pacing = PacingLapCounter::new();
        let mut overridden = false;

        if self.config.extend_laps > 0 {
            self.enter(run, CautionPhase::ExtendingLaps);
            match self.await_pacing_laps(run, &mut pacing, self.config.extend_after_laps).await? {
                PaceWait::Cancelled => return Ok(SequenceOutcome::Cancelled),
                PaceWait::Overridden => overridden = true,
                PaceWait::Reached => {
                    checkpoint!(run.command(&chat::pace_laps(self.config.extend_laps)).await);
                }
            }
        }

        if self.config.wave_arounds && !overridden {
            self.enter(run, CautionPhase::WaveArounds);
            match self.await_pacing_laps(run, &mut pacing, self.config.wave_around_lap).await? {
                PaceWait::Cancelled => return Ok(SequenceOutcome::Cancelled),
                PaceWait::Overridden => {}
                PaceWait::Reached => checkpoint!(self.wave_arounds(run).await?),
            }
        }

        self.enter(run, CautionPhase::AwaitingGreen);
        loop {
            if !run.snapshot().await?.caution_active() {
                break;
            }
            checkpoint!(run.sleep(secs(self.config.poll_interval)).await);
        }

        run.ctx.enqueue_audio(AudioCue::TrackClear);
        run.ctx.release_busy(&run.name);
        self.enter(run, CautionPhase::Idle);
        Ok(SequenceOutcome::Completed)
    }

    async fn pit_close_countdown(&self, run: &EventRun) -> Wake {
        let marks = pit_close_checkpoints(self.config.pit_close_warning);
        run.ctx.enqueue_audio(AudioCue::PitsClosing);
        for (i, mark) in marks.iter().enumerate() {
            let text = format!("Pits closing in {} seconds", mark);
            if run.say(&text, true).await.is_cancelled() {
                return Wake::Cancelled;
            }
            let next = marks.get(i + 1).copied().unwrap_or(0);
            if run.sleep(secs((mark - next) as f64)).await.is_cancelled() {
                return Wake::Cancelled;
            }
        }
        Wake::Elapsed
    }

    async fn await_pit_lane_clear(&self, run: &EventRun) -> Result<Wake> {
        let deadline = Instant::now() + secs(self.config.pit_close_max_wait);
        loop {
            let snapshot = run.snapshot().await?;
            let in_pits: Vec<String> =
                running_order::sample_within(&snapshot, self.config.max_laps_behind_leader)
                    .into_iter()
                    .filter(|entry| entry.in_pits)
                    .map(|entry| entry.car_number)
                    .collect();
            if in_pits.is_empty() {
                debug!(event = %run.name, "Pit lane clear");
                return Ok(Wake::Elapsed);
            }
            if Instant::now() >= deadline {
                warn!(
                    event = %run.name,
                    cars = ?in_pits,
                    "Pit lane not clear, throwing caution anyway"
                );
                return Ok(Wake::Elapsed);
            }
            if run.sleep(secs(self.config.poll_interval)).await.is_cancelled() {
                return Ok(Wake::Cancelled);
            }
        }
    }

    async fn await_caution_flag(&self, run: &EventRun) -> Result<Wake> {
        let deadline = Instant::now() + secs(self.config.caution_confirm_timeout);
        loop {
            if run.snapshot().await?.caution_active() {
                return Ok(Wake::Elapsed);
            }
            if Instant::now() >= deadline {
                warn!(
                    event = %run.name,
                    timeout = self.config.caution_confirm_timeout,
                    "Caution flag not reported, continuing"
                );
                return Ok(Wake::Elapsed);
            }
            if run.sleep(secs(self.config.poll_interval)).await.is_cancelled() {
                return Ok(Wake::Cancelled);
            }
        }
    }

    async fn await_pacing_laps(
        &self,
        run: &EventRun,
        counter: &mut PacingLapCounter,
        target: u32,
    ) -> Result<PaceWait> {
        loop {
            if counter.laps() >= target {
                return Ok(PaceWait::Reached);
            }
            let snapshot = run.snapshot().await?;
            if !snapshot.caution_active() {
                info!(event = %run.name, laps = counter.laps(), "Caution ended early, overridden");
                return Ok(PaceWait::Overridden);
            }
            match snapshot.pace_car() {
                Some(pace_car) => {
                    if counter.observe(pace_car.lap_fraction) {
                        debug!(event = %run.name, laps = counter.laps(), "Pacing lap completed");
                    }
                }
                None => debug!(event = %run.name, "No pace car in telemetry"),
            }
            if run.sleep(secs(self.config.poll_interval)).await.is_cancelled() {
                return Ok(PaceWait::Cancelled);
            }
        }
    }

    fn wave_candidates(&self, snapshot: &TelemetrySnapshot) -> HashMap<CarId, String> {
        let within = running_order::sample_within(snapshot, self.config.max_laps_behind_leader);
        running_order::lapped_cars(&within)
            .filter(|entry| !waved_around(entry.pace_flags))
            .map(|entry| (entry.car_id, entry.car_number.clone()))
            .collect()
    }

    async fn wave_arounds(&self, run: &EventRun) -> Result<Wake> {
        let (snapshot, mut prior) = run.sample().await?;
        let mut pending = self.wave_candidates(&snapshot);
        info!(event = %run.name, cars = pending.len(), "Wave arounds started");

        while !pending.is_empty() {
            if run.sleep(secs(self.config.poll_interval)).await.is_cancelled() {
                return Ok(Wake::Cancelled);
            }
            let (snapshot, current) = run.sample().await?;
            if !snapshot.caution_active() {
                info!(event = %run.name, remaining = pending.len(), "Wave arounds overridden");
                return Ok(Wake::Elapsed);
            }

            for entry in &current {
                if waved_around(entry.pace_flags) && pending.remove(&entry.car_id).is_some() {
                    debug!(event = %run.name, car = %entry.car_number, "Wave around granted");
                }
            }

            let comparison = OrderComparison::new(&prior, &current);
            for entry in comparison.crossed_or_exited() {
                if entry.in_pits || !pending.contains_key(&entry.car_id) {
                    continue;
                }
                info!(event = %run.name, car = %entry.car_number, "Waving car around");
                if run.command(&chat::wave_around(&entry.car_number)).await.is_cancelled() {
                    return Ok(Wake::Cancelled);
                }
            }
            prior = current;
        }
        info!(event = %run.name, "Wave arounds complete");
        Ok(Wake::Elapsed)
    }
}

#[async_trait::async_trait]
impl EventBehavior for CautionSequence {
    fn kind(&self) -> &'static str {
        "caution"
    }

    async fn run_sequence(&mut self, run: &EventRun) -> Result<SequenceOutcome> {
        let snapshot = run.snapshot().await?;
        if snapshot.caution_active() {
            return self.skip(run, "a caution is already out").await;
        }
        if !run.ctx.try_claim_busy(&run.name) {
            return self.skip(run, "another intervention is in progress").await;
        }
        self.run_guarded(run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RaceControlError;
    use crate::coordination::CoordinationContext;
    use crate::test_utils::{ScriptedTelemetry, car, init_tracing, pace_car, snapshot};
    use crate::types::irsdk_flags::{pace_flags, session_flags};
    use crate::types::CarTelemetry;
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> TelemetrySnapshot {
        let cars: Vec<CarTelemetry> = vec![
            pace_car(10, 0.55),
            car(1, "1", 10, 0.50),
            car(2, "2", 10, 0.45),
            car(3, "3", 8, 0.60),
        ];
        TelemetrySnapshot { pace_car_id: Some(0), ..snapshot(600.0, cars) }
    }

    fn quick_config() -> CautionConfig {
        CautionConfig {
            reason: "debris".to_string(),
            pit_close_warning: 3,
            announce_skip: false,
            ..CautionConfig::default()
        }
    }

    fn caution_on(snap: &mut TelemetrySnapshot) {
        snap.flags = snap.flags.with_flag(session_flags::CAUTION);
    }

    fn sequence(config: CautionConfig) -> CautionSequence {
        CautionSequence::with_rng(config, StdRng::seed_from_u64(7))
    }

    #[test]
    fn checkpoints_start_with_total() {
        assert_eq!(pit_close_checkpoints(45), vec![45, 30, 20, 10, 5, 3, 2, 1]);
        assert_eq!(pit_close_checkpoints(10), vec![10, 5, 3, 2, 1]);
        assert_eq!(pit_close_checkpoints(1), vec![1]);
        assert!(pit_close_checkpoints(0).is_empty());
    }

    #[test]
    fn pacing_lap_needs_mid_lap_before_wrap() {
        let mut counter = PacingLapCounter::new();
        // Wrap without passing mid lap does not count
        assert!(!counter.observe(0.95));
        assert!(!counter.observe(0.05));
        assert!(!counter.observe(0.45));
        assert!(!counter.observe(0.8));
        assert!(counter.observe(0.1));
        assert!(!counter.observe(0.2));
        assert_eq!(counter.laps(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CautionConfig { poll_interval: 0.0, ..CautionConfig::default() };
        assert!(matches!(config.validate(), Err(RaceControlError::Config { .. })));
        assert!(CautionConfig::default().validate().is_ok());
    }

    #[test]
    fn non_finite_timings_are_rejected() {
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let delay = CautionConfig { skip_announce_max_delay: bad, ..CautionConfig::default() };
            match delay.validate() {
                Err(RaceControlError::Config { field, .. }) => {
                    assert_eq!(field, "skip_announce_max_delay")
                }
                other => panic!("{} accepted: {:?}", bad, other),
            }
            let poll = CautionConfig { poll_interval: bad, ..CautionConfig::default() };
            assert!(poll.validate().is_err(), "poll_interval {} accepted", bad);
        }
        let zero = CautionConfig { skip_announce_max_delay: 0.0, ..CautionConfig::default() };
        assert!(zero.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn active_caution_at_entry_sends_nothing() {
        init_tracing();
        let view = ScriptedTelemetry::new(session());
        view.update(caution_on);
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("random caution", Arc::clone(&ctx), view.clone());

        let config = CautionConfig { announce_skip: true, ..quick_config() };
        let outcome = sequence(config).run_sequence(&run).await.expect("sequence");

        assert!(matches!(outcome, SequenceOutcome::Skipped(_)));
        assert_eq!(view.count_sent("!y"), 0);
        assert_eq!(view.count_sent("!pitclose"), 0);
        assert!(view.sent().iter().all(|text| !text.contains('!')));
        assert_eq!(view.sent().len(), 1);
        assert!(!ctx.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_context_skips_without_commands() {
        let view = ScriptedTelemetry::new(session());
        let (ctx, _queues) = CoordinationContext::new();
        assert!(ctx.try_claim_busy("slow zone"));
        let run = EventRun::new("random caution", Arc::clone(&ctx), view.clone());

        let outcome = sequence(quick_config()).run_sequence(&run).await.expect("sequence");
        assert!(matches!(outcome, SequenceOutcome::Skipped(_)));
        assert!(view.sent().is_empty());
        assert_eq!(ctx.busy_holder().as_deref(), Some("slow zone"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_sequence_closes_pits_extends_and_waves() {
        init_tracing();
        let view = ScriptedTelemetry::new(session());
        for id in 0..=3 {
            view.set_speed(id, 120.0);
        }
        view.on_chat("!y", caution_on);
        view.on_chat("!w 3", |snap| {
            if let Some(car) = snap.cars.iter_mut().find(|car| car.car_id == 3) {
                car.pace_flags = car.pace_flags.with_flag(pace_flags::WAVED_AROUND);
            }
        });
        let clearer = {
            let view = Arc::clone(&view);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(400)).await;
                view.update(|snap| snap.flags = Default::default());
            })
        };

        let (ctx, mut queues) = CoordinationContext::new();
        let run = EventRun::new("random caution", Arc::clone(&ctx), view.clone());
        let config = CautionConfig { extend_laps: 2, ..quick_config() };
        let mut caution = sequence(config);
        let outcome = caution.run_sequence(&run).await.expect("sequence");
        clearer.await.expect("clearer");

        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(caution.phase(), CautionPhase::Idle);
        assert!(!ctx.is_busy());

        let sent = view.sent();
        let position = |text: &str| sent.iter().position(|s| s == text).expect(text);
        assert!(position("Pits closing in 3 seconds") < position("!pitclose"));
        assert!(position("!pitclose") < position("!y debris"));
        assert!(position("!y debris") < position("!pacelaps 2"));
        assert!(position("!pacelaps 2") < position("!w 3"));
        assert_eq!(view.count_sent("!w"), 1);

        assert_eq!(queues.audio.recv().await, Some(AudioCue::PitsClosing));
        assert_eq!(queues.audio.recv().await, Some(AudioCue::Caution));
        assert_eq!(queues.audio.recv().await, Some(AudioCue::TrackClear));
    }

    #[tokio::test(start_paused = true)]
    async fn quickie_skips_countdown_but_closes_pits() {
        // The flag never shows, so the confirm wait times out
        let view = ScriptedTelemetry::new(session());
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("quick caution", Arc::clone(&ctx), view.clone()).with_quickie(true);

        let config =
            CautionConfig { wave_arounds: false, caution_confirm_timeout: 1.0, ..quick_config() };
        let outcome = sequence(config).run_sequence(&run).await.expect("sequence");

        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(view.count_sent("Pits closing"), 0);
        assert_eq!(view.count_sent("!pitclose"), 1);
        assert_eq!(view.count_sent("!y debris"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn early_green_overrides_wave_arounds() {
        let view = ScriptedTelemetry::new(session());
        view.on_chat("!y", caution_on);
        let clearer = {
            let view = Arc::clone(&view);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                view.update(|snap| snap.flags = Default::default());
            })
        };
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("random caution", Arc::clone(&ctx), view.clone());
        let config = CautionConfig { full_sequence: false, ..quick_config() };

        let outcome = sequence(config).run_sequence(&run).await.expect("sequence");
        clearer.await.expect("clearer");

        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(view.count_sent("!w"), 0);
        assert_eq!(view.count_sent("!pitclose"), 0);
        assert!(!ctx.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_countdown_keeps_busy() {
        let view = ScriptedTelemetry::new(session());
        let (ctx, _queues) = CoordinationContext::new();
        let run = EventRun::new("random caution", Arc::clone(&ctx), view.clone());
        let config = CautionConfig { pit_close_warning: 30, ..quick_config() };

        let mut caution = sequence(config);
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ctx.cancel();
        };
        let (outcome, ()) = tokio::join!(caution.run_sequence(&run), canceller);

        assert_eq!(outcome.expect("sequence"), SequenceOutcome::Cancelled);
        assert_eq!(caution.phase(), CautionPhase::ClosingPits);
        assert_eq!(view.count_sent("!pitclose"), 0);
        assert!(ctx.is_busy());
    }
}
