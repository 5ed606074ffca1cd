use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::model::{EntityType, NoteParent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteCounts {
    pub fetched: usize,
    pub transferred: usize,
}

/// What a run did. Only ever added to while the run is in progress, and
/// handed back whole however many stages failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub transferred: BTreeMap<EntityType, usize>,
    pub created_ids: BTreeMap<EntityType, Vec<u64>>,
    /// Records deliberately not sent: already migrated, or their parent is missing.
    pub skipped: BTreeMap<EntityType, usize>,
    /// Cached tasks whose deal was selected, or whose contact or company was
    /// created, in this run.
    pub tasks_found: usize,
    pub notes: BTreeMap<NoteParent, NoteCounts>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl MigrationResult {
    pub fn record_created(&mut self, entity: EntityType, dest_id: u64) {
        *self.transferred.entry(entity).or_default() += 1;
        self.created_ids.entry(entity).or_default().push(dest_id);
    }

    pub fn record_skipped(&mut self, entity: EntityType) {
        *self.skipped.entry(entity).or_default() += 1;
    }

    pub fn notes_fetched(&mut self, parent: NoteParent, count: usize) {
        self.notes.entry(parent).or_default().fetched += count;
    }

    pub fn note_transferred(&mut self, parent: NoteParent, dest_id: u64) {
        self.notes.entry(parent).or_default().transferred += 1;
        self.record_created(EntityType::Note, dest_id);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn transferred(&self, entity: EntityType) -> usize {
        self.transferred.get(&entity).copied().unwrap_or(0)
    }

    pub fn skipped(&self, entity: EntityType) -> usize {
        self.skipped.get(&entity).copied().unwrap_or(0)
    }

    pub fn created_ids(&self, entity: EntityType) -> &[u64] {
        self.created_ids.get(&entity).map_or(&[], Vec::as_slice)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let counts: Vec<String> = EntityType::ALL
            .iter()
            .map(|e| format!("{}={}", e.api_name(), self.transferred(*e)))
            .collect();
        format!(
            "{} errors={} warnings={}",
            counts.join(" "),
            self.errors.len(),
            self.warnings.len()
        )
    }
}
