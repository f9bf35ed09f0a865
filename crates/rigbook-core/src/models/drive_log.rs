//! Drive log model

use serde::{Deserialize, Serialize};

use super::{bump_modified, EntityId};

/// A single trip recorded against a vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveLog {
    pub id: EntityId,
    /// Vehicle driven; a log without one is kept but shown as orphaned
    pub vehicle_id: Option<EntityId>,
    /// Trip date (Unix ms)
    pub date: i64,
    pub reason: String,
    pub start_odometer: f64,
    pub end_odometer: f64,
    pub notes: String,
    /// Pre-trip checklist filled in for this drive
    pub checklist_id: Option<EntityId>,
    pub last_modified: i64,
    pub needs_push: bool,
}

impl DriveLog {
    #[must_use]
    pub fn new(vehicle_id: EntityId) -> Self {
        let now = crate::util::now_millis();
        Self {
            id: EntityId::new(),
            vehicle_id: Some(vehicle_id),
            date: now,
            reason: String::new(),
            start_odometer: 0.0,
            end_odometer: 0.0,
            notes: String::new(),
            checklist_id: None,
            last_modified: now,
            needs_push: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = bump_modified(self.last_modified);
        self.needs_push = true;
    }

    /// Distance covered, never negative.
    #[must_use]
    pub fn distance(&self) -> f64 {
        (self.end_odometer - self.start_odometer).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_clamps_at_zero() {
        let mut log = DriveLog::new(EntityId::new());
        log.start_odometer = 1200.0;
        log.end_odometer = 1350.5;
        assert!((log.distance() - 150.5).abs() < f64::EPSILON);

        log.end_odometer = 1000.0;
        assert!(log.distance().abs() < f64::EPSILON);
    }
}
