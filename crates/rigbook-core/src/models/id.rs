//! Entity identifiers and type tags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A client-generated identifier shared by every replica, using UUID v7.
///
/// This is the sync join key; it never changes once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new unique ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The replicated entity types.
///
/// Declaration order is the fetch dependency order: targets of a
/// relationship come before the entities that point at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Trailer,
    Vehicle,
    Checklist,
    DriveLog,
    ChecklistItem,
}

impl EntityKind {
    /// All kinds in dependency order.
    pub const ALL: [Self; 5] = [
        Self::Trailer,
        Self::Vehicle,
        Self::Checklist,
        Self::DriveLog,
        Self::ChecklistItem,
    ];

    /// Remote record type name, also the record-id prefix.
    #[must_use]
    pub const fn type_tag(self) -> &'static str {
        match self {
            Self::Trailer => "Trailer",
            Self::Vehicle => "Vehicle",
            Self::Checklist => "Checklist",
            Self::DriveLog => "DriveLog",
            Self::ChecklistItem => "ChecklistItem",
        }
    }

    pub fn from_type_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_tag() == tag)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}
