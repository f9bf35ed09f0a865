//! Flat field-set records exchanged with the remote store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{EntityId, EntityKind};

/// Record type of tombstone records.
pub const TOMBSTONE_RECORD_TYPE: &str = "Tombstone";

/// Remote record identifier, `"{TypeTag}_{entityId}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new(type_tag: &str, id: &EntityId) -> Self {
        Self(format!("{type_tag}_{id}"))
    }

    #[must_use]
    pub fn for_entity(kind: EntityKind, id: &EntityId) -> Self {
        Self::new(kind.type_tag(), id)
    }

    #[must_use]
    pub fn for_tombstone(id: &EntityId) -> Self {
        Self::new(TOMBSTONE_RECORD_TYPE, id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into type tag and entity id text.
    #[must_use]
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once('_')
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Double(f64),
    /// Unix milliseconds
    Timestamp(i64),
    /// Inline binary attachment
    Asset(#[serde(with = "base64_bytes")] Vec<u8>),
    Reference(RecordId),
    /// Explicitly cleared; equivalent to an absent field once stored
    Null,
}

/// How a save treats fields the record does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Replace the stored record entirely.
    #[default]
    AllKeys,
    /// Only overwrite the supplied fields; `Null` clears a field.
    ChangedKeys,
}

/// One remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: String,
    pub record_id: RecordId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    #[must_use]
    pub fn new(record_type: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            record_type: record_type.into(),
            record_id,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn for_entity(kind: EntityKind, id: &EntityId) -> Self {
        Self::new(kind.type_tag(), RecordId::for_entity(kind, id))
    }

    pub fn set(&mut self, key: &str, value: FieldValue) {
        self.fields.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: FieldValue) -> Self {
        self.set(key, value);
        self
    }

    #[must_use]
    pub fn with_text(self, key: &str, value: &str) -> Self {
        self.with(key, FieldValue::Text(value.to_string()))
    }

    #[must_use]
    pub fn with_optional_text(self, key: &str, value: Option<&str>) -> Self {
        let value = value.map_or(FieldValue::Null, |text| FieldValue::Text(text.to_string()));
        self.with(key, value)
    }

    #[must_use]
    pub fn with_reference(self, key: &str, kind: EntityKind, id: Option<&EntityId>) -> Self {
        let value = id.map_or(FieldValue::Null, |id| {
            FieldValue::Reference(RecordId::for_entity(kind, id))
        });
        self.with(key, value)
    }

    #[must_use]
    pub fn with_asset(self, key: &str, bytes: Option<&[u8]>) -> Self {
        let value = bytes.map_or(FieldValue::Null, |bytes| FieldValue::Asset(bytes.to_vec()));
        self.with(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).filter(|value| **value != FieldValue::Null)
    }

    /// Text field, or an empty string when missing or of another type.
    pub fn text(&self, key: &str) -> String {
        match self.get(key) {
            Some(FieldValue::Text(value)) => value.clone(),
            _ => String::new(),
        }
    }

    pub fn optional_text(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(FieldValue::Text(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(FieldValue::Int(value) | FieldValue::Timestamp(value)) => *value,
            #[allow(clippy::cast_possible_truncation)]
            Some(FieldValue::Double(value)) => *value as i64,
            _ => 0,
        }
    }

    pub fn double(&self, key: &str) -> f64 {
        match self.get(key) {
            Some(FieldValue::Double(value)) => *value,
            #[allow(clippy::cast_precision_loss)]
            Some(FieldValue::Int(value)) => *value as f64,
            _ => 0.0,
        }
    }

    pub fn timestamp(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(FieldValue::Timestamp(value) | FieldValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn asset(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key) {
            Some(FieldValue::Asset(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn reference(&self, key: &str) -> Option<&RecordId> {
        match self.get(key) {
            Some(FieldValue::Reference(id)) => Some(id),
            _ => None,
        }
    }

    /// Apply a partial update: supplied fields overwrite, `Null` removes.
    pub fn apply_changes(&mut self, changes: &Self) {
        for (key, value) in &changes.fields {
            if *value == FieldValue::Null {
                self.fields.remove(key);
            } else {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// Drop explicit `Null` fields; stored records never carry them.
    #[must_use]
    pub fn without_nulls(mut self) -> Self {
        self.fields.retain(|_, value| *value != FieldValue::Null);
        self
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
