use std::collections::HashMap;

use tracing::{debug, info};

/// Triggers when enough distinct cars spike within a window
///
/// Each car counts once, at its latest spike. After a trigger the state is
/// cleared and the threshold optionally rises.
#[derive(Debug, Clone)]
pub struct MultiDriverIncidentDetector {
    window: f64,
    threshold: u32,
    threshold_increase: u32,
    recent: HashMap<String, f64>,
}

impl MultiDriverIncidentDetector {
    pub fn new(window: f64, threshold: u32, threshold_increase: u32) -> Self {
        Self { window, threshold, threshold_increase, recent: HashMap::new() }
    }

    /// Record the cars that spiked at `now`. Returns true when the distinct
    /// car count reaches the threshold.
    pub fn record(&mut self, now: f64, spiked: &[String]) -> bool {
        for car in spiked {
            self.recent.insert(car.clone(), now);
        }
        let cutoff = now - self.window;
        self.recent.retain(|_, at| *at >= cutoff);

        if (self.recent.len() as u32) < self.threshold {
            if !spiked.is_empty() {
                debug!(
                    cars = self.recent.len(),
                    threshold = self.threshold,
                    "Multi driver incidents"
                );
            }
            return false;
        }

        info!(
            cars = ?self.recent.keys().collect::<Vec<_>>(),
            threshold = self.threshold,
            "Multi driver incident"
        );
        self.recent.clear();
        self.threshold += self.threshold_increase;
        true
    }

    /// Drop accumulated state while another procedure controls the field
    pub fn suppress(&mut self) {
        if !self.recent.is_empty() {
            debug!(cars = self.recent.len(), "Multi driver incidents suppressed");
            self.recent.clear();
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn pending(&self) -> usize {
        self.recent.len()
    }
}
