//! Vehicle and trailer models

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{bump_modified, EntityId};

/// Vehicle classification, shared with checklists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    #[default]
    Car,
    Motorcycle,
    Truck,
    Van,
    Camper,
    Tractor,
    Other,
}

impl VehicleType {
    pub const ALL: [Self; 7] = [
        Self::Car,
        Self::Motorcycle,
        Self::Truck,
        Self::Van,
        Self::Camper,
        Self::Tractor,
        Self::Other,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Truck => "truck",
            Self::Van => "van",
            Self::Camper => "camper",
            Self::Tractor => "tractor",
            Self::Other => "other",
        }
    }

    /// Parse a stored or remote value; unknown values fall back to the default.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .unwrap_or_default()
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vehicle in the garage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: EntityId,
    pub vehicle_type: VehicleType,
    pub brand: String,
    pub model: String,
    pub color: String,
    pub plate: String,
    pub notes: String,
    /// Raw image bytes as captured on this device
    pub photo: Option<Vec<u8>>,
    /// Trailer currently hitched to this vehicle
    pub trailer_id: Option<EntityId>,
    /// Last local or accepted remote modification (Unix ms)
    pub last_modified: i64,
    /// Carries changes the remote has not acknowledged yet
    pub needs_push: bool,
}

impl Vehicle {
    #[must_use]
    pub fn new(vehicle_type: VehicleType) -> Self {
        Self {
            id: EntityId::new(),
            vehicle_type,
            brand: String::new(),
            model: String::new(),
            color: String::new(),
            plate: String::new(),
            notes: String::new(),
            photo: None,
            trailer_id: None,
            last_modified: crate::util::now_millis(),
            needs_push: true,
        }
    }

    /// Record a local edit that must be replicated.
    pub fn touch(&mut self) {
        self.last_modified = bump_modified(self.last_modified);
        self.needs_push = true;
    }

    /// Human readable label, e.g. "Volvo FH16 (ABC-123)".
    #[must_use]
    pub fn display_name(&self) -> String {
        display_name(&self.brand, &self.model, &self.plate)
    }
}

/// A trailer; same shape as a vehicle minus the type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    pub id: EntityId,
    pub brand: String,
    pub model: String,
    pub color: String,
    pub plate: String,
    pub notes: String,
    pub photo: Option<Vec<u8>>,
    pub last_modified: i64,
    pub needs_push: bool,
}

impl Trailer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: EntityId::new(),
            brand: String::new(),
            model: String::new(),
            color: String::new(),
            plate: String::new(),
            notes: String::new(),
            photo: None,
            last_modified: crate::util::now_millis(),
            needs_push: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = bump_modified(self.last_modified);
        self.needs_push = true;
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        display_name(&self.brand, &self.model, &self.plate)
    }
}

impl Default for Trailer {
    fn default() -> Self {
        Self::new()
    }
}

fn display_name(brand: &str, model: &str, plate: &str) -> String {
    let name = [brand.trim(), model.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let plate = plate.trim();

    match (name.is_empty(), plate.is_empty()) {
        (true, true) => "(unnamed)".to_string(),
        (true, false) => plate.to_string(),
        (false, true) => name,
        (false, false) => format!("{name} ({plate})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_new_is_pending() {
        let vehicle = Vehicle::new(VehicleType::Truck);
        assert!(vehicle.needs_push);
        assert!(vehicle.last_modified > 0);
        assert!(vehicle.trailer_id.is_none());
    }

    #[test]
    fn test_touch_strictly_increases_timestamp() {
        let mut vehicle = Vehicle::new(VehicleType::Car);
        vehicle.needs_push = false;
        vehicle.last_modified = i64::MAX / 2;
        let before = vehicle.last_modified;

        vehicle.touch();

        assert!(vehicle.last_modified > before);
        assert!(vehicle.needs_push);
    }

    #[test]
    fn test_vehicle_type_parse_lenient() {
        assert_eq!(VehicleType::parse_lenient("Truck"), VehicleType::Truck);
        assert_eq!(VehicleType::parse_lenient(" van "), VehicleType::Van);
        assert_eq!(VehicleType::parse_lenient("hovercraft"), VehicleType::Car);
        assert_eq!(VehicleType::parse_lenient(""), VehicleType::Car);
    }

    #[test]
    fn test_display_name() {
        let mut trailer = Trailer::new();
        assert_eq!(trailer.display_name(), "(unnamed)");

        trailer.plate = "TR-001".to_string();
        assert_eq!(trailer.display_name(), "TR-001");

        trailer.brand = "Krone".to_string();
        assert_eq!(trailer.display_name(), "Krone (TR-001)");
    }
}
