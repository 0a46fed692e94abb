//! Test utilities for building snapshots and timelines
//!
//! Shared by the unit tests, integration tests and benches so every test
//! describes a session the same way.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::Result;
use crate::telemetry::TelemetryView;
use crate::types::{BitField, CarId, CarTelemetry, SessionState, TelemetrySnapshot};

/// Track length used by fixtures (km)
pub const TEST_TRACK_LENGTH_KM: f64 = 3.6;

/// Install a fmt subscriber honouring `RUST_LOG`, once per process.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A racing car on track in class 1.
pub fn car(car_id: CarId, number: &str, laps_completed: i32, lap_fraction: f64) -> CarTelemetry {
    CarTelemetry {
        car_id,
        car_number: number.to_string(),
        car_class: 1,
        laps_completed,
        lap_fraction,
        in_pits: false,
        best_lap_time: 90.0,
        last_lap_time: 91.0,
        incident_count: 0,
        pace_flags: BitField::default(),
    }
}

/// Same as [`car`] with an explicit class and best lap.
pub fn class_car(
    car_id: CarId,
    number: &str,
    car_class: i32,
    best_lap_time: f64,
    laps_completed: i32,
    lap_fraction: f64,
) -> CarTelemetry {
    CarTelemetry { car_class, best_lap_time, ..car(car_id, number, laps_completed, lap_fraction) }
}

/// The pace car fixture, always car id 0.
pub fn pace_car(laps_completed: i32, lap_fraction: f64) -> CarTelemetry {
    CarTelemetry { car_class: 0, best_lap_time: -1.0, ..car(0, "PC", laps_completed, lap_fraction) }
}

/// A racing snapshot at `elapsed` seconds with an hour remaining.
pub fn snapshot(elapsed: f64, cars: Vec<CarTelemetry>) -> TelemetrySnapshot {
    TelemetrySnapshot {
        session_time_elapsed: elapsed,
        session_time_remaining: 3600.0 - elapsed,
        session_state: SessionState::Racing,
        laps_remaining: 30,
        flags: BitField::default(),
        pace_car_id: None,
        track_length_km: TEST_TRACK_LENGTH_KM,
        cars,
    }
}

/// Same as [`snapshot`] with session flags set.
pub fn flagged(elapsed: f64, flags: u32, cars: Vec<CarTelemetry>) -> TelemetrySnapshot {
    TelemetrySnapshot { flags: BitField::new(flags), ..snapshot(elapsed, cars) }
}

/// Lap fraction covered per second at `speed_kmh` on the fixture track.
pub fn fraction_per_second(speed_kmh: f64) -> f64 {
    speed_kmh / 3600.0 / TEST_TRACK_LENGTH_KM
}

/// Split a total progress value into (laps, fraction).
pub fn split_progress(progress: f64) -> (i32, f64) {
    let laps = progress.floor();
    (laps as i32, progress - laps)
}

/// A full field of `count` cars spaced evenly behind a leader on lap 10.
pub fn field(count: u32) -> Vec<CarTelemetry> {
    (1..=count)
        .map(|id| {
            let (laps, fraction) = split_progress(10.9 - id as f64 * 0.02);
            car(id, &id.to_string(), laps, fraction)
        })
        .collect()
}

type Reaction = Box<dyn Fn(&mut TelemetrySnapshot) + Send + Sync>;

/// A small simulated session for driving event sequences in tests
///
/// Session time follows the tokio clock. Cars given a speed move round the
/// lap on every read. Chat sends are recorded and can trigger reactions, so
/// a test can make the caution flag appear when `!y` is sent.
pub struct ScriptedTelemetry {
    state: Mutex<TelemetrySnapshot>,
    last_read: Mutex<Instant>,
    speeds: Mutex<HashMap<CarId, f64>>,
    sent: Mutex<Vec<(String, bool)>>,
    reactions: Mutex<Vec<(String, Reaction)>>,
}

impl ScriptedTelemetry {
    pub fn new(snapshot: TelemetrySnapshot) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(snapshot),
            last_read: Mutex::new(Instant::now()),
            speeds: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        })
    }

    /// Mutate the session in place
    pub fn update(&self, f: impl FnOnce(&mut TelemetrySnapshot)) {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Mutate one car in place
    pub fn update_car(&self, car_id: CarId, f: impl FnOnce(&mut CarTelemetry)) {
        self.update(|snap| {
            if let Some(car) = snap.cars.iter_mut().find(|car| car.car_id == car_id) {
                f(car);
            }
        });
    }

    /// Move a car at a constant speed from now on
    pub fn set_speed(&self, car_id: CarId, speed_kmh: f64) {
        self.speeds.lock().unwrap_or_else(|e| e.into_inner()).insert(car_id, speed_kmh);
    }

    /// Run `f` on the session whenever a send starts with `prefix`
    pub fn on_chat(
        &self,
        prefix: &str,
        f: impl Fn(&mut TelemetrySnapshot) + Send + Sync + 'static,
    ) {
        self.reactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.to_string(), Box::new(f)));
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn count_sent(&self, prefix: &str) -> usize {
        self.sent().iter().filter(|text| text.starts_with(prefix)).count()
    }

    fn advance(&self, snap: &mut TelemetrySnapshot) {
        let now = Instant::now();
        let dt = {
            let mut last = self.last_read.lock().unwrap_or_else(|e| e.into_inner());
            let dt = now.duration_since(*last).as_secs_f64();
            *last = now;
            dt
        };
        if dt <= 0.0 {
            return;
        }
        snap.session_time_elapsed += dt;
        snap.session_time_remaining = (snap.session_time_remaining - dt).max(0.0);

        let speeds = self.speeds.lock().unwrap_or_else(|e| e.into_inner());
        let track_km = snap.track_length_km;
        for car in snap.cars.iter_mut() {
            if let Some(speed) = speeds.get(&car.car_id) {
                let fraction = car.lap_fraction + speed / 3600.0 / track_km * dt;
                car.laps_completed += fraction.floor() as i32;
                car.lap_fraction = fraction.fract();
            }
        }
    }
}

#[async_trait::async_trait]
impl TelemetryView for ScriptedTelemetry {
    async fn snapshot(&self) -> Result<TelemetrySnapshot> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.advance(&mut state);
        Ok(state.clone())
    }

    async fn send_chat(&self, text: &str, broadcast: bool) -> Result<()> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((text.to_string(), broadcast));
        let reactions = self.reactions.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (prefix, reaction) in reactions.iter() {
            if text.starts_with(prefix.as_str()) {
                reaction(&mut state);
            }
        }
        Ok(())
    }
}
