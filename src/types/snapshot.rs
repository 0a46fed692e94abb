//! Point-in-time telemetry snapshot consumed by every race control component

use serde::{Deserialize, Serialize};

use super::{BitField, bitfield};

/// Car index as reported by the simulator (CarIdx)
pub type CarId = u32;

/// Session state (irsdk_SessionState)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Invalid,
    GetInCar,
    Warmup,
    ParadeLaps,
    Racing,
    Checkered,
    CoolDown,
}

impl SessionState {
    /// Whether the session is in green-flag racing
    pub fn is_racing(self) -> bool {
        matches!(self, SessionState::Racing)
    }

    /// Whether the session has reached the checkered flag
    pub fn is_finishing(self) -> bool {
        matches!(self, SessionState::Checkered | SessionState::CoolDown)
    }
}

/// Per-car telemetry values for one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarTelemetry {
    pub car_id: CarId,
    /// Car number as displayed ("07" and "7" are different cars)
    pub car_number: String,
    /// Car class identifier
    pub car_class: i32,
    pub laps_completed: i32,
    /// Progress within the current lap, 0..1. Negative when the car is not in the world.
    pub lap_fraction: f64,
    pub in_pits: bool,
    /// Best lap time in seconds, non-positive when no valid lap was set
    pub best_lap_time: f64,
    pub last_lap_time: f64,
    pub incident_count: i32,
    pub pace_flags: BitField,
}

impl CarTelemetry {
    /// Whether the car is currently in the world (on track or on pit road)
    pub fn in_world(&self) -> bool {
        self.lap_fraction >= 0.0 && self.laps_completed >= 0
    }

    /// Laps completed plus progress within the current lap
    pub fn total_progress(&self) -> f64 {
        self.laps_completed as f64 + self.lap_fraction
    }
}

/// Consistent multi-field read of the session, taken between freeze and unfreeze
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    /// Seconds since the session started
    pub session_time_elapsed: f64,
    /// Seconds left in the session
    pub session_time_remaining: f64,
    pub session_state: SessionState,
    pub laps_remaining: i32,
    pub flags: BitField,
    pub pace_car_id: Option<CarId>,
    pub track_length_km: f64,
    pub cars: Vec<CarTelemetry>,
}

impl TelemetrySnapshot {
    /// Total session duration in seconds (elapsed + remaining)
    pub fn total_session_duration(&self) -> f64 {
        self.session_time_elapsed + self.session_time_remaining
    }

    /// Laps completed by the lead car, excluding the pace car
    pub fn leader_laps(&self) -> i32 {
        self.cars
            .iter()
            .filter(|car| Some(car.car_id) != self.pace_car_id)
            .map(|car| car.laps_completed)
            .max()
            .unwrap_or(0)
            .max(0)
    }

    /// Race length in laps as seen from this snapshot
    pub fn total_race_laps(&self) -> i32 {
        self.leader_laps() + self.laps_remaining.max(0)
    }

    pub fn is_racing(&self) -> bool {
        self.session_state.is_racing()
    }

    pub fn caution_active(&self) -> bool {
        bitfield::caution_active(self.flags)
    }

    pub fn slow_zone_active(&self) -> bool {
        bitfield::slow_zone_active(self.flags)
    }

    /// Whether the session is past the checkered flag
    pub fn is_finishing(&self) -> bool {
        self.session_state.is_finishing() || bitfield::checkered(self.flags)
    }

    /// Look up one car by index
    pub fn car(&self, car_id: CarId) -> Option<&CarTelemetry> {
        self.cars.iter().find(|car| car.car_id == car_id)
    }

    /// The pace car, when the session has one
    pub fn pace_car(&self) -> Option<&CarTelemetry> {
        self.pace_car_id.and_then(|id| self.car(id))
    }
}
