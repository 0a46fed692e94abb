use std::collections::HashMap;

use tracing::info;

use crate::{RaceControlError, Result};

/// What to do about one detected collision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionAction {
    /// No penalties configured; the collision is only counted
    Noted { car_number: String, collisions: u32 },
    /// Tell the driver how many more collisions until a penalty
    Warn { car_number: String, remaining: u32 },
    /// Issue a penalty
    Penalize { car_number: String, penalty: String },
}

/// Counts collisions per car and escalates penalties
///
/// Every `collisions_per_penalty`-th collision of a car earns the next
/// penalty of the list; the last one repeats.
#[derive(Debug, Clone)]
pub struct CollisionPenaltyTracker {
    collisions_per_penalty: Option<u32>,
    penalties: Vec<String>,
    collisions: HashMap<String, u32>,
    issued: HashMap<String, usize>,
}

impl CollisionPenaltyTracker {
    pub fn new(collisions_per_penalty: Option<u32>, penalties: Vec<String>) -> Result<Self> {
        match collisions_per_penalty {
            Some(0) => {
                return Err(RaceControlError::config(
                    "collisions_per_penalty",
                    "must be at least 1",
                ));
            }
            Some(_) if penalties.iter().all(|p| p.trim().is_empty()) => {
                return Err(RaceControlError::config(
                    "penalties",
                    "collisions_per_penalty is set but no penalty is configured",
                ));
            }
            _ => {}
        }
        Ok(Self {
            collisions_per_penalty,
            penalties,
            collisions: HashMap::new(),
            issued: HashMap::new(),
        })
    }

    /// Record a collision for `car_number`
    pub fn record(&mut self, car_number: &str) -> CollisionAction {
        let collisions = self.collisions.entry(car_number.to_string()).or_insert(0);
        *collisions += 1;
        let collisions = *collisions;

        let Some(per_penalty) = self.collisions_per_penalty else {
            return CollisionAction::Noted { car_number: car_number.to_string(), collisions };
        };

        if collisions % per_penalty != 0 {
            return CollisionAction::Warn {
                car_number: car_number.to_string(),
                remaining: per_penalty - collisions % per_penalty,
            };
        }

        let issued = self.issued.entry(car_number.to_string()).or_insert(0);
        let index = (*issued).min(self.penalties.len().saturating_sub(1));
        *issued += 1;
        let penalty = self.penalties[index].clone();
        info!(car = %car_number, collisions, penalty = %penalty, "Collision penalty");
        CollisionAction::Penalize { car_number: car_number.to_string(), penalty }
    }

    pub fn collisions(&self, car_number: &str) -> u32 {
        self.collisions.get(car_number).copied().unwrap_or(0)
    }
}
