//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;

use super::EntityKind;

/// Which side a last-write-wins decision kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

impl ConflictWinner {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("remote") {
            Self::Remote
        } else {
            Self::Local
        }
    }
}

impl fmt::Display for ConflictWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded sync conflict resolved by strategy (e.g., LWW)
///
/// Raised when a fetched record collides with a local edit that had not
/// been pushed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier (0 until persisted)
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Local `last_modified` when the conflict occurred
    pub local_modified: i64,
    /// Incoming record's `lastModified`
    pub remote_modified: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    pub winner: ConflictWinner,
    /// Resolution strategy name
    pub strategy: String,
}
