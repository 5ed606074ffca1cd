//! Record of every (source id, destination id) pair created, kept so a run can
//! be rolled back or resumed later.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::ids::{normalize_id, IdMaps, RawId, SourceKey};
use super::model::EntityType;

/// Receives the pairs created by each stage.
pub trait RollbackRegistrar {
    fn register(&mut self, entity: EntityType, pairs: &[(SourceKey, u64)]) -> Result<()>;
}

/// Registrar that only keeps pairs in memory.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    pub registered: BTreeMap<EntityType, Vec<(SourceKey, u64)>>,
}

#[cfg(test)]
impl MemoryLedger {
    pub fn pairs(&self, entity: EntityType) -> &[(SourceKey, u64)] {
        self.registered.get(&entity).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
impl RollbackRegistrar for MemoryLedger {
    fn register(&mut self, entity: EntityType, pairs: &[(SourceKey, u64)]) -> Result<()> {
        self.registered
            .entry(entity)
            .or_default()
            .extend_from_slice(pairs);
        Ok(())
    }
}

/// On-disk index: `{ "leads": { "<source id>": "<dest id>" }, ... }`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct MigrationIndex(BTreeMap<String, BTreeMap<String, RawId>>);

impl MigrationIndex {
    /// Rewrite source keys into canonical form so `"007"` and `7` from other
    /// tooling land on one entry.
    fn normalized(self) -> Self {
        let sections = self
            .0
            .into_iter()
            .map(|(section, entries)| {
                let mut out = BTreeMap::new();
                for (source, dest) in entries {
                    let key = normalize_id(source.as_str()).as_str().to_string();
                    if let Some(previous) = out.insert(key.clone(), dest) {
                        warn!(%section, source_id = %key, dropped = %previous, "duplicate source id in migration index");
                    }
                }
                (section, out)
            })
            .collect();
        Self(sections)
    }
}

/// JSON file registrar. Every `register` call rewrites the file, so an
/// interrupted run keeps everything registered before the interruption.
#[derive(Debug)]
pub struct JsonLedger {
    path: PathBuf,
    index: MigrationIndex,
}

impl JsonLedger {
    pub const FILE_NAME: &'static str = "migration_index.json";

    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let index = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read migration index {}", path.display()))?;
            if raw.trim().is_empty() {
                MigrationIndex::default()
            } else {
                serde_json::from_str::<MigrationIndex>(&raw)
                    .with_context(|| {
                        format!("failed to parse migration index {}", path.display())
                    })?
                    .normalized()
            }
        } else {
            MigrationIndex::default()
        };
        Ok(Self { path, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id maps for every entity type the index knows, used to seed a run.
    pub fn seed(&self) -> IdMaps {
        let mut maps = IdMaps::new();
        for (name, entries) in &self.index.0 {
            let Some(entity) = EntityType::from_api_name(name) else {
                warn!(section = %name, "unknown section in migration index; ignored");
                continue;
            };
            for (source, dest) in entries {
                match normalize_id(dest).as_u64() {
                    Some(dest_id) => maps.put(entity, source.as_str(), dest_id),
                    None => warn!(
                        entity = %entity,
                        source_id = %source,
                        dest = %dest,
                        "non-numeric destination id in migration index; ignored"
                    ),
                }
            }
        }
        maps
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.index
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        let body = serde_json::to_string_pretty(&self.index)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl RollbackRegistrar for JsonLedger {
    fn register(&mut self, entity: EntityType, pairs: &[(SourceKey, u64)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let section = self
            .index
            .0
            .entry(entity.api_name().to_string())
            .or_default();
        for (source, dest) in pairs {
            section.insert(source.as_str().to_string(), RawId::Text(dest.to_string()));
        }
        self.save()?;
        info!(
            entity = %entity,
            pairs = pairs.len(),
            path = %self.path.display(),
            "registered migrated ids"
        );
        Ok(())
    }
}
