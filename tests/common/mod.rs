//! Shared fixtures for integration tests

#![allow(dead_code)]

use racecontrol::types::irsdk_flags::session_flags;
use racecontrol::{BitField, CarId, CarTelemetry, SessionState, TelemetrySnapshot};

pub const SESSION_LENGTH: f64 = 3600.0;

pub const CAUTION: u32 = session_flags::CAUTION;

pub fn car(car_id: CarId, laps_completed: i32, lap_fraction: f64) -> CarTelemetry {
    CarTelemetry {
        car_id,
        car_number: car_id.to_string(),
        car_class: 1,
        laps_completed,
        lap_fraction,
        best_lap_time: 90.0,
        last_lap_time: 91.0,
        ..CarTelemetry::default()
    }
}

/// Six cars spread over half a lap with the leader on lap 10
pub fn field() -> Vec<CarTelemetry> {
    (1..=6).map(|id| car(id, 10, 0.9 - id as f64 * 0.08)).collect()
}

pub fn frame(elapsed: f64, flags: u32, cars: Vec<CarTelemetry>) -> TelemetrySnapshot {
    TelemetrySnapshot {
        session_time_elapsed: elapsed,
        session_time_remaining: SESSION_LENGTH - elapsed,
        session_state: SessionState::Racing,
        laps_remaining: 20,
        flags: BitField::new(flags),
        pace_car_id: None,
        track_length_km: 3.6,
        cars,
    }
}

/// One frame per second for `seconds`, flags chosen per second
pub fn timeline(seconds: u32, flags_at: impl Fn(u32) -> u32) -> Vec<TelemetrySnapshot> {
    (0..=seconds).map(|t| frame(t as f64, flags_at(t), field())).collect()
}
