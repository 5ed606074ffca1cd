//! Source-id normalization and the per-entity-type id mapping table.
//!
//! Source CRM payloads carry ids as JSON numbers in some places and as strings
//! in others (cached task `entity_id`, index files, CLI input). Every lookup and
//! insert goes through [`normalize_id`] so `12345` and `"12345"` land on the
//! same key.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::model::EntityType;

/// An id exactly as it appeared in source data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(serde_json::Number),
    Text(String),
}

impl From<u64> for RawId {
    fn from(v: u64) -> Self {
        RawId::Number(v.into())
    }
}

impl From<i64> for RawId {
    fn from(v: i64) -> Self {
        RawId::Number(v.into())
    }
}

impl From<i32> for RawId {
    fn from(v: i32) -> Self {
        RawId::Number(i64::from(v).into())
    }
}

impl From<&str> for RawId {
    fn from(v: &str) -> Self {
        RawId::Text(v.to_string())
    }
}

impl From<String> for RawId {
    fn from(v: String) -> Self {
        RawId::Text(v)
    }
}

impl From<&SourceKey> for RawId {
    fn from(v: &SourceKey) -> Self {
        RawId::Text(v.0.clone())
    }
}

impl From<SourceKey> for RawId {
    fn from(v: SourceKey) -> Self {
        RawId::Text(v.0)
    }
}

impl From<&RawId> for RawId {
    fn from(v: &RawId) -> Self {
        v.clone()
    }
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawId::Number(n) => write!(f, "{n}"),
            RawId::Text(s) => f.write_str(s),
        }
    }
}

/// Canonical string form of a source id. Only [`normalize_id`] builds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Destination ids are always positive integers.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SourceKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        RawId::deserialize(deserializer).map(normalize_id)
    }
}

/// Map any representation of a source id onto its canonical key.
///
/// - integers (and integral floats such as `12345.0`) render in plain decimal
/// - strings are trimmed; numeric strings are re-rendered so `"012"` == `12`
/// - anything else keeps its trimmed text
pub fn normalize_id(raw: impl Into<RawId>) -> SourceKey {
    match raw.into() {
        RawId::Number(n) => {
            if let Some(v) = n.as_i64() {
                SourceKey(v.to_string())
            } else if let Some(v) = n.as_u64() {
                SourceKey(v.to_string())
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                        SourceKey((f as i64).to_string())
                    }
                    _ => SourceKey(n.to_string()),
                }
            }
        }
        RawId::Text(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<i64>() {
                SourceKey(v.to_string())
            } else if let Ok(v) = trimmed.parse::<u64>() {
                SourceKey(v.to_string())
            } else {
                SourceKey(trimmed.to_string())
            }
        }
    }
}

/// Source key → destination id for one entity type.
///
/// Entries are only ever added after the destination confirmed an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap {
    entries: HashMap<SourceKey, u64>,
}

impl IdMap {
    pub fn put(&mut self, source_id: impl Into<RawId>, dest_id: u64) {
        self.entries.insert(normalize_id(source_id), dest_id);
    }

    pub fn get(&self, source_id: impl Into<RawId>) -> Option<u64> {
        self.entries.get(&normalize_id(source_id)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One [`IdMap`] per entity type, created per run (optionally from a seed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdMaps {
    maps: BTreeMap<EntityType, IdMap>,
}

impl IdMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, entity: EntityType, source_id: impl Into<RawId>, dest_id: u64) {
        self.maps.entry(entity).or_default().put(source_id, dest_id);
    }

    /// `None` means "not migrated yet"; callers decide whether that matters.
    pub fn get(&self, entity: EntityType, source_id: impl Into<RawId>) -> Option<u64> {
        self.maps.get(&entity).and_then(|m| m.get(source_id))
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.maps.get(&entity).map_or(0, IdMap::len)
    }
}
