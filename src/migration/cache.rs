//! Files the upstream export leaves in the backup directory: the source data
//! cache and the mapping tables, plus deal selection over the cache.
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::ids::{normalize_id, IdMaps, RawId, SourceKey};
use super::model::{EntityType, SourceCompany, SourceContact, SourceDeal, SourceTask};
use super::transform::{FieldMappings, MappingContext};

pub const CACHE_FILE: &str = "amo_data_cache.json";
pub const FIELD_MAPPING_FILE: &str = "field_mapping.json";
pub const STAGE_MAPPING_FILE: &str = "stage_mapping.json";
pub const USER_MAPPING_FILE: &str = "user_mapping.json";

/// Snapshot of the source CRM taken before the run.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCache {
    #[serde(default)]
    pub leads: Vec<SourceDeal>,
    #[serde(default)]
    pub contacts: Vec<SourceContact>,
    #[serde(default)]
    pub companies: Vec<SourceCompany>,
    #[serde(default)]
    tasks: Vec<SourceTask>,
    #[serde(default)]
    lead_tasks: Vec<SourceTask>,
    #[serde(default)]
    contact_tasks: Vec<SourceTask>,
    #[serde(default)]
    company_tasks: Vec<SourceTask>,
    #[serde(default)]
    pub fetched_at: Option<String>,
}

/// Which deals a run should take.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Explicit source deal ids. When set, the other criteria are ignored.
    pub deal_ids: Vec<SourceKey>,
    /// Responsible managers (source user ids); empty means everyone.
    pub managers: Vec<SourceKey>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_deals: usize,
    pub eligible_deals: usize,
    pub migrated_deals: usize,
    pub remaining_deals: usize,
    pub contacts: usize,
    pub companies: usize,
    pub tasks: usize,
    pub fetched_at: Option<String>,
}

impl SourceCache {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CACHE_FILE);
        let cache: SourceCache = read_json(&path)?.with_context(|| {
            format!(
                "source cache {} not found; export the source CRM first",
                path.display()
            )
        })?;
        info!(
            path = %path.display(),
            deals = cache.leads.len(),
            contacts = cache.contacts.len(),
            companies = cache.companies.len(),
            fetched_at = cache.fetched_at.as_deref().unwrap_or("unknown"),
            "loaded source cache"
        );
        Ok(cache)
    }

    /// Every cached task, whichever list it was exported under, once per id.
    pub fn all_tasks(&self) -> Vec<SourceTask> {
        let mut seen: HashSet<SourceKey> = HashSet::new();
        self.tasks
            .iter()
            .chain(&self.lead_tasks)
            .chain(&self.contact_tasks)
            .chain(&self.company_tasks)
            .filter(|t| seen.insert(normalize_id(&t.id)))
            .cloned()
            .collect()
    }

    /// Deals owned by one of `managers` (all deals when empty).
    pub fn eligible<'c>(&'c self, managers: &[SourceKey]) -> Vec<&'c SourceDeal> {
        if managers.is_empty() {
            return self.leads.iter().collect();
        }
        let wanted: HashSet<&SourceKey> = managers.iter().collect();
        self.leads
            .iter()
            .filter(|d| {
                d.responsible_user_id
                    .as_ref()
                    .is_some_and(|u| wanted.contains(&normalize_id(u)))
            })
            .collect()
    }

    /// Resolve `selection` against the cache.
    ///
    /// Explicit ids are taken as asked, even when already migrated (the engine
    /// skips those). Otherwise eligible deals not yet in `migrated` are taken
    /// in cache order, up to `limit`.
    pub fn select(&self, selection: &Selection, migrated: &IdMaps) -> Result<Vec<SourceDeal>> {
        if !selection.deal_ids.is_empty() {
            let wanted: HashSet<&SourceKey> = selection.deal_ids.iter().collect();
            let found: Vec<SourceDeal> = self
                .leads
                .iter()
                .filter(|d| wanted.contains(&normalize_id(&d.id)))
                .cloned()
                .collect();
            if found.is_empty() {
                bail!(
                    "none of the {} requested deals is in the source cache",
                    selection.deal_ids.len()
                );
            }
            if found.len() < wanted.len() {
                warn!(
                    requested = wanted.len(),
                    found = found.len(),
                    "some requested deals are missing from the source cache"
                );
            }
            return Ok(found);
        }

        let limit = selection.limit.unwrap_or(usize::MAX);
        Ok(self
            .eligible(&selection.managers)
            .into_iter()
            .filter(|d| migrated.get(EntityType::Deal, &d.id).is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    pub fn stats(&self, managers: &[SourceKey], migrated: &IdMaps) -> CacheStats {
        let eligible = self.eligible(managers);
        let migrated_deals = eligible
            .iter()
            .filter(|d| migrated.get(EntityType::Deal, &d.id).is_some())
            .count();
        CacheStats {
            total_deals: self.leads.len(),
            eligible_deals: eligible.len(),
            migrated_deals,
            remaining_deals: eligible.len() - migrated_deals,
            contacts: self.contacts.len(),
            companies: self.companies.len(),
            tasks: self.all_tasks().len(),
            fetched_at: self.fetched_at.clone(),
        }
    }
}

#[derive(Deserialize)]
struct UserRow {
    amo_user_id: RawId,
    kommo_user_id: RawId,
}

/// Either `{ "<source user>": <dest user> }` or a list of rows.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserMappingFile {
    Map(HashMap<SourceKey, RawId>),
    Rows(Vec<UserRow>),
}

/// Build the transform lookup tables from the backup directory. Every file is
/// optional; a missing one leaves its table empty.
pub fn load_mapping_context(dir: &Path) -> Result<MappingContext> {
    let fields: FieldMappings = read_json(&dir.join(FIELD_MAPPING_FILE))?.unwrap_or_else(|| {
        warn!(dir = %dir.display(), "no field mapping; custom fields will be dropped");
        FieldMappings::default()
    });

    let stages: HashMap<SourceKey, RawId> =
        read_json(&dir.join(STAGE_MAPPING_FILE))?.unwrap_or_default();
    let stage_mapping = dest_ids(stages, "stage");

    let user_mapping = match read_json::<UserMappingFile>(&dir.join(USER_MAPPING_FILE))? {
        Some(UserMappingFile::Map(map)) => dest_ids(map, "user"),
        Some(UserMappingFile::Rows(rows)) => dest_ids(
            rows.into_iter()
                .map(|r| (normalize_id(r.amo_user_id), r.kommo_user_id))
                .collect(),
            "user",
        ),
        None => HashMap::new(),
    };

    info!(
        stages = stage_mapping.len(),
        users = user_mapping.len(),
        deal_fields = fields.deals.len(),
        "loaded mapping tables"
    );
    Ok(MappingContext {
        stage_mapping,
        user_mapping,
        fields,
    })
}

fn dest_ids(raw: HashMap<SourceKey, RawId>, table: &str) -> HashMap<SourceKey, u64> {
    raw.into_iter()
        .filter_map(|(source, dest)| match normalize_id(&dest).as_u64() {
            Some(id) => Some((source, id)),
            None => {
                warn!(table, source = %source, dest = %dest, "unusable destination id in mapping");
                None
            }
        })
        .collect()
}

/// `Ok(None)` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}
