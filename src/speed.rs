//! Speed sampling from lap progress
//!
//! The simulator does not publish the speed of other cars, so it is derived
//! from how far round the lap a car moved between two snapshots.

use tracing::debug;

use crate::types::{CarId, TelemetrySnapshot};

/// Km/h a car must exceed to trigger the green at a slow zone restart
pub fn restart_speed_kmh(max_speed_kmh: f64, restart_speed_pct: f64) -> f64 {
    max_speed_kmh * restart_speed_pct / 100.0
}

/// Stateful speed cursor for one car
///
/// Each call to [`next`](Self::next) returns the average speed since the
/// previous call. The first call only records a starting point. A sampler
/// belongs to one task and is rebuilt, not reset, when the tracked car
/// changes.
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    car_id: CarId,
    last: Option<Sample>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: f64,
    lap_fraction: f64,
}

impl SpeedSampler {
    pub fn new(car_id: CarId) -> Self {
        Self { car_id, last: None }
    }

    /// Car this sampler follows
    pub fn car_id(&self) -> CarId {
        self.car_id
    }

    /// Average speed in km/h since the previous call.
    ///
    /// `None` on the first call, when no time passed, or when the car is
    /// missing from the snapshot.
    pub fn next(&mut self, snapshot: &TelemetrySnapshot) -> Option<f64> {
        let Some(car) = snapshot.car(self.car_id).filter(|car| car.in_world()) else {
            debug!(car_id = self.car_id, "Speed sample skipped, car not in world");
            return None;
        };

        let current =
            Sample { time: snapshot.session_time_elapsed, lap_fraction: car.lap_fraction };
        let previous = match self.last {
            Some(previous) if current.time <= previous.time => return None,
            previous => {
                self.last = Some(current);
                previous?
            }
        };

        let mut delta = current.lap_fraction - previous.lap_fraction;
        if delta < -0.5 {
            // Crossed the start/finish line
            delta += 1.0;
        }
        let elapsed = current.time - previous.time;
        Some(delta / elapsed * snapshot.track_length_km * 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{car, fraction_per_second, snapshot};

    fn at(time: f64, fraction: f64) -> TelemetrySnapshot {
        snapshot(time, vec![car(4, "4", 10, fraction)])
    }

    #[test]
    fn restart_speed_from_percentage() {
        assert_eq!(restart_speed_kmh(60.0, 150.0), 90.0);
        assert_eq!(restart_speed_kmh(80.0, 100.0), 80.0);
    }

    #[test]
    fn first_sample_only_primes() {
        let mut sampler = SpeedSampler::new(4);
        assert_eq!(sampler.next(&at(0.0, 0.1)), None);
        let speed = sampler.next(&at(2.0, 0.1 + 2.0 * fraction_per_second(60.0))).expect("speed");
        assert!((speed - 60.0).abs() < 1e-6);
    }

    #[test]
    fn line_crossing_is_not_negative() {
        let mut sampler = SpeedSampler::new(4);
        let step = fraction_per_second(90.0);
        sampler.next(&at(0.0, 1.0 - step / 2.0));
        let speed = sampler.next(&at(1.0, step / 2.0)).expect("speed");
        assert!((speed - 90.0).abs() < 1e-6);
    }

    #[test]
    fn same_tick_yields_nothing_and_keeps_origin() {
        let mut sampler = SpeedSampler::new(4);
        sampler.next(&at(0.0, 0.2));
        assert_eq!(sampler.next(&at(0.0, 0.2)), None);
        let speed = sampler.next(&at(1.0, 0.2 + fraction_per_second(50.0))).expect("speed");
        assert!((speed - 50.0).abs() < 1e-6);
    }

    #[test]
    fn missing_car_yields_nothing() {
        let mut sampler = SpeedSampler::new(9);
        assert_eq!(sampler.next(&at(0.0, 0.2)), None);
        assert_eq!(sampler.car_id(), 9);
    }
}
