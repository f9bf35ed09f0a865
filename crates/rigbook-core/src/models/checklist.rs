//! Checklist and checklist item models

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{bump_modified, EntityId, VehicleType};

/// A pre-trip inspection checklist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checklist {
    pub id: EntityId,
    pub vehicle_type: VehicleType,
    pub title: String,
    pub vehicle_id: Option<EntityId>,
    pub trailer_id: Option<EntityId>,
    pub last_modified: i64,
    pub needs_push: bool,
}

impl Checklist {
    #[must_use]
    pub fn new(vehicle_type: VehicleType, title: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            vehicle_type,
            title: title.into(),
            vehicle_id: None,
            trailer_id: None,
            last_modified: crate::util::now_millis(),
            needs_push: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = bump_modified(self.last_modified);
        self.needs_push = true;
    }
}

/// Outcome of a single checklist line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Unset,
    Confirmed,
    NotApplicable,
    Flagged,
}

impl ItemState {
    pub const ALL: [Self; 4] = [
        Self::Unset,
        Self::Confirmed,
        Self::NotApplicable,
        Self::Flagged,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Confirmed => "confirmed",
            Self::NotApplicable => "not_applicable",
            Self::Flagged => "flagged",
        }
    }

    /// Parse a stored or remote value; unknown values decode as `Unset`.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(value))
            .unwrap_or_default()
    }

    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Unset => "[ ]",
            Self::Confirmed => "[x]",
            Self::NotApplicable => "[-]",
            Self::Flagged => "[!]",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a checklist, owned by it.
///
/// Items carry no timestamp of their own; merges follow the parent
/// checklist's `last_modified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: EntityId,
    pub checklist_id: Option<EntityId>,
    /// Ordering within the checklist
    pub position: i64,
    pub section: String,
    pub title: String,
    pub state: ItemState,
    pub note: Option<String>,
    pub needs_push: bool,
}

impl ChecklistItem {
    #[must_use]
    pub fn new(
        checklist_id: EntityId,
        position: i64,
        section: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityId::new(),
            checklist_id: Some(checklist_id),
            position,
            section: section.into(),
            title: title.into(),
            state: ItemState::Unset,
            note: None,
            needs_push: true,
        }
    }
}
