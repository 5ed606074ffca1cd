//! The migration run: Deals, then Tasks, then Lead Notes, then Contact Notes.
//!
//! Each stage returns `Result<(), StageFailure>`; the driver records a failed
//! stage in the result and moves on, so a late failure never discards what an
//! earlier stage already created.
//!
//! Two passes sit outside the stage order. Before Deals, the contacts and
//! companies linked to pending deals are created so the deals can embed them.
//! After Contact Notes, the notes of companies created in this run follow.
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::embed::embed_relations;
use super::ids::{normalize_id, IdMaps, RawId, SourceKey};
use super::ledger::RollbackRegistrar;
use super::model::{
    EntityType, NoteParent, NotePayload, RelationPayload, RelationRef, SourceCompany,
    SourceContact, SourceDeal, SourceTask, TaskPayload,
};
use super::result::MigrationResult;
use super::transform::{
    transform_company, transform_contact, transform_deal, transform_note, transform_task,
    MappingContext,
};
use super::writer::{BatchWriter, WriteError};
use crate::crm::destination::{CreateTarget, CreatedRecord};
use crate::crm::source::SourceApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Deals,
    Tasks,
    LeadNotes,
    ContactNotes,
}

impl Stage {
    /// Later stages read ids written by earlier ones.
    pub const ORDER: [Stage; 4] = [
        Stage::Deals,
        Stage::Tasks,
        Stage::LeadNotes,
        Stage::ContactNotes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Deals => "deals",
            Stage::Tasks => "tasks",
            Stage::LeadNotes => "lead notes",
            Stage::ContactNotes => "contact notes",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stage stopped early. Whatever it recorded before stopping stays.
#[derive(Debug, Error)]
#[error("{stage}: {message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

impl StageFailure {
    fn new(stage: Stage, err: impl fmt::Display) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

const COMPANY_NOTES: &str = "company notes";

/// State owned by one run and threaded through every stage.
#[derive(Debug, Default)]
pub struct RunContext {
    pub id_maps: IdMaps,
    pub result: MigrationResult,
    /// Deals this run tried to create, in selection order. Deals skipped
    /// because the seed already maps them are not in here.
    pub selected_deals: Vec<SourceKey>,
    /// Contacts the destination confirmed during this run.
    pub created_contacts: Vec<SourceKey>,
    /// Companies the destination confirmed during this run.
    pub created_companies: Vec<SourceKey>,
}

impl RunContext {
    pub fn new(seed: IdMaps) -> Self {
        Self {
            id_maps: seed,
            ..Self::default()
        }
    }

    /// Selected deals that the destination confirmed during this run.
    fn created_deals(&self) -> impl Iterator<Item = (&SourceKey, u64)> {
        self.selected_deals
            .iter()
            .filter_map(move |k| self.id_maps.get(EntityType::Deal, k).map(|d| (k, d)))
    }

    fn created_relations(&self, entity: EntityType) -> &[SourceKey] {
        match entity {
            EntityType::Contact => &self.created_contacts,
            EntityType::Company => &self.created_companies,
            _ => &[],
        }
    }

    fn created_relations_mut(&mut self, entity: EntityType) -> Option<&mut Vec<SourceKey>> {
        match entity {
            EntityType::Contact => Some(&mut self.created_contacts),
            EntityType::Company => Some(&mut self.created_companies),
            _ => None,
        }
    }
}

/// Cached contact or company the relation pass can create.
trait RelationRecord {
    const ENTITY: EntityType;
    const TARGET: CreateTarget;

    fn source_id(&self) -> &RawId;
    fn payload(&self, mapping: &MappingContext) -> RelationPayload;
}

impl RelationRecord for SourceContact {
    const ENTITY: EntityType = EntityType::Contact;
    const TARGET: CreateTarget = CreateTarget::Contacts;

    fn source_id(&self) -> &RawId {
        &self.id
    }

    fn payload(&self, mapping: &MappingContext) -> RelationPayload {
        transform_contact(self, mapping)
    }
}

impl RelationRecord for SourceCompany {
    const ENTITY: EntityType = EntityType::Company;
    const TARGET: CreateTarget = CreateTarget::Companies;

    fn source_id(&self) -> &RawId {
        &self.id
    }

    fn payload(&self, mapping: &MappingContext) -> RelationPayload {
        transform_company(self, mapping)
    }
}

pub struct MigrationEngine<'a> {
    source: &'a dyn SourceApi,
    writer: BatchWriter<'a>,
    registrar: &'a mut dyn RollbackRegistrar,
    mapping: &'a MappingContext,
    contacts: &'a [SourceContact],
    companies: &'a [SourceCompany],
    pipeline_id: Option<u64>,
    now_unix: i64,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(
        source: &'a dyn SourceApi,
        writer: BatchWriter<'a>,
        registrar: &'a mut dyn RollbackRegistrar,
        mapping: &'a MappingContext,
    ) -> Self {
        Self {
            source,
            writer,
            registrar,
            mapping,
            contacts: &[],
            companies: &[],
            pipeline_id: None,
            now_unix: Utc::now().timestamp(),
        }
    }

    /// Destination pipeline every created deal is placed in.
    pub fn with_pipeline(mut self, pipeline_id: u64) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    /// Cached contacts and companies. Without them the run only links
    /// relations the seed already maps.
    pub fn with_relations(
        mut self,
        contacts: &'a [SourceContact],
        companies: &'a [SourceCompany],
    ) -> Self {
        self.contacts = contacts;
        self.companies = companies;
        self
    }

    /// Reference time for task deadline fallbacks.
    pub fn with_clock(mut self, now_unix: i64) -> Self {
        self.now_unix = now_unix;
        self
    }

    /// Run every stage once and return what happened. Never fails: stage
    /// problems end up in `errors` / `warnings`.
    pub async fn migrate(
        &mut self,
        deals: &[SourceDeal],
        tasks: &[SourceTask],
        seed: Option<IdMaps>,
    ) -> MigrationResult {
        self.run(deals, tasks, seed).await.result
    }

    /// Like [`migrate`](Self::migrate) but hands back the whole context,
    /// id maps included.
    pub async fn run(
        &mut self,
        deals: &[SourceDeal],
        tasks: &[SourceTask],
        seed: Option<IdMaps>,
    ) -> RunContext {
        let mut ctx = RunContext::new(seed.unwrap_or_default());
        info!(
            deals = deals.len(),
            cached_tasks = tasks.len(),
            cached_contacts = self.contacts.len(),
            cached_companies = self.companies.len(),
            seeded_deals = ctx.id_maps.len(EntityType::Deal),
            seeded_contacts = ctx.id_maps.len(EntityType::Contact),
            chunk_size = self.writer.chunk_size(),
            "migration started"
        );

        self.relations_pass(&mut ctx, deals).await;

        for stage in Stage::ORDER {
            let started = Instant::now();
            let outcome = match stage {
                Stage::Deals => self.deals_stage(&mut ctx, deals).await,
                Stage::Tasks => self.tasks_stage(&mut ctx, tasks).await,
                Stage::LeadNotes => self.lead_notes_stage(&mut ctx).await,
                Stage::ContactNotes => {
                    self.relation_notes(&mut ctx, deals, NoteParent::Contact, stage.name())
                        .await;
                    Ok(())
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(()) => info!(stage = %stage, elapsed_ms, "stage finished"),
                Err(failure) => {
                    error!(stage = %stage, elapsed_ms, error = %failure.message, "stage aborted");
                    ctx.result.error(failure.to_string());
                }
            }
        }

        self.relation_notes(&mut ctx, deals, NoteParent::Company, COMPANY_NOTES)
            .await;

        info!(summary = %ctx.result.summary(), "migration finished");
        ctx
    }

    /// Create the companies, then the contacts, linked to deals this run will
    /// create. Each entity type fails on its own; a failure only costs the
    /// links the deal stage could have embedded.
    async fn relations_pass(&mut self, ctx: &mut RunContext, deals: &[SourceDeal]) {
        let pending = pending_deals(&ctx.id_maps, deals);
        if pending.is_empty() {
            return;
        }
        let (contacts, companies) = (self.contacts, self.companies);

        let needed = linked_relations(&pending, EntityType::Company);
        if let Err(e) = self.create_relations(ctx, needed, companies).await {
            error!(entity = %EntityType::Company, error = %e, "relation pass aborted");
            ctx.result.error(e.to_string());
        }
        let needed = linked_relations(&pending, EntityType::Contact);
        if let Err(e) = self.create_relations(ctx, needed, contacts).await {
            error!(entity = %EntityType::Contact, error = %e, "relation pass aborted");
            ctx.result.error(e.to_string());
        }
    }

    async fn create_relations<R: RelationRecord>(
        &mut self,
        ctx: &mut RunContext,
        needed: Vec<SourceKey>,
        cached: &[R],
    ) -> Result<(), WriteError> {
        let entity = R::ENTITY;
        let by_key: HashMap<SourceKey, &R> = cached
            .iter()
            .map(|r| (normalize_id(r.source_id()), r))
            .collect();

        let mut candidates: Vec<(SourceKey, &R)> = Vec::new();
        for key in needed {
            if ctx.id_maps.get(entity, &key).is_some() {
                debug!(entity = %entity, source_id = %key, "already migrated; reused");
                ctx.result.record_skipped(entity);
                continue;
            }
            match by_key.get(&key) {
                Some(record) => candidates.push((key, *record)),
                None => debug!(entity = %entity, source_id = %key, "linked record not in source cache"),
            }
        }
        info!(entity = %entity, candidates = candidates.len(), "relation pass");
        if candidates.is_empty() {
            return Ok(());
        }

        let payloads: Vec<RelationPayload> = candidates
            .iter()
            .map(|(_, record)| record.payload(self.mapping))
            .collect();
        let (slots, failure) = split(self.writer.submit(R::TARGET, &payloads).await);
        let mut pairs = Vec::new();
        for ((key, _), slot) in candidates.iter().zip(&slots) {
            match slot {
                Some(created) => {
                    ctx.id_maps.put(entity, key, created.id);
                    ctx.result.record_created(entity, created.id);
                    if let Some(list) = ctx.created_relations_mut(entity) {
                        list.push(key.clone());
                    }
                    pairs.push((key.clone(), created.id));
                }
                None => {
                    warn!(entity = %entity, source_id = %key, "destination rejected record");
                    ctx.result
                        .warn(format!("{} {key}: rejected by destination", entity.label()));
                }
            }
        }
        self.register(ctx, entity.api_name(), entity, &pairs);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn deals_stage(
        &mut self,
        ctx: &mut RunContext,
        deals: &[SourceDeal],
    ) -> Result<(), StageFailure> {
        let stage = Stage::Deals;
        let mut seen: HashSet<SourceKey> = HashSet::new();
        let mut candidates: Vec<(SourceKey, &SourceDeal)> = Vec::new();
        for deal in deals {
            let key = normalize_id(&deal.id);
            if !seen.insert(key.clone()) {
                debug!(deal = %key, "duplicate deal in selection");
                continue;
            }
            if ctx.id_maps.get(EntityType::Deal, &key).is_some() {
                info!(deal = %key, "deal already migrated; skipped");
                ctx.result.record_skipped(EntityType::Deal);
                continue;
            }
            ctx.selected_deals.push(key.clone());
            candidates.push((key, deal));
        }
        info!(stage = %stage, candidates = candidates.len(), "stage started");
        if candidates.is_empty() {
            return Ok(());
        }

        let mut payloads = Vec::with_capacity(candidates.len());
        for (key, deal) in &candidates {
            let mut payload = transform_deal(deal, self.mapping);
            payload.pipeline_id = self.pipeline_id;
            for missing in embed_relations(deal, &ctx.id_maps, &mut payload.embedded) {
                ctx.result.warn(format!(
                    "deal {key}: {} {} not migrated; link skipped",
                    missing.entity, missing.source_id
                ));
            }
            payloads.push(payload);
        }

        let (slots, failure) = split(self.writer.submit(CreateTarget::Deals, &payloads).await);
        let mut pairs = Vec::new();
        for ((key, _), slot) in candidates.iter().zip(&slots) {
            match slot {
                Some(created) => {
                    ctx.id_maps.put(EntityType::Deal, key, created.id);
                    ctx.result.record_created(EntityType::Deal, created.id);
                    pairs.push((key.clone(), created.id));
                }
                None => {
                    warn!(deal = %key, "destination rejected deal");
                    ctx.result.warn(format!("deal {key}: rejected by destination"));
                }
            }
        }
        self.register(ctx, stage.name(), EntityType::Deal, &pairs);

        match failure {
            Some(e) => Err(StageFailure::new(stage, e)),
            None => Ok(()),
        }
    }

    /// Cached tasks of the deals selected for this run, plus those of the
    /// contacts and companies this run created.
    async fn tasks_stage(
        &mut self,
        ctx: &mut RunContext,
        tasks: &[SourceTask],
    ) -> Result<(), StageFailure> {
        let stage = Stage::Tasks;
        let in_run: HashSet<(EntityType, SourceKey)> = ctx
            .selected_deals
            .iter()
            .map(|k| (EntityType::Deal, k.clone()))
            .chain(ctx.created_contacts.iter().map(|k| (EntityType::Contact, k.clone())))
            .chain(ctx.created_companies.iter().map(|k| (EntityType::Company, k.clone())))
            .collect();
        let mut seen: HashSet<SourceKey> = HashSet::new();
        let mut candidates: Vec<(SourceKey, &SourceTask, EntityType, u64)> = Vec::new();

        for task in tasks {
            let Some(parent) = task_parent(task) else {
                continue;
            };
            let Some(raw) = task.entity_id.as_ref() else {
                continue;
            };
            let parent_key = normalize_id(raw);
            if !in_run.contains(&(parent, parent_key.clone())) {
                continue;
            }
            let task_key = normalize_id(&task.id);
            if !seen.insert(task_key.clone()) {
                continue;
            }
            ctx.result.tasks_found += 1;
            match ctx.id_maps.get(parent, &parent_key) {
                Some(dest_parent) => candidates.push((task_key, task, parent, dest_parent)),
                None => {
                    warn!(task = %task_key, parent = %parent, parent_id = %parent_key, "parent not migrated; task skipped");
                    ctx.result.record_skipped(EntityType::Task);
                    ctx.result.warn(format!(
                        "task {task_key}: {} {parent_key} was not migrated; task skipped",
                        parent.label()
                    ));
                }
            }
        }
        info!(
            stage = %stage,
            found = ctx.result.tasks_found,
            candidates = candidates.len(),
            "stage started"
        );
        if candidates.is_empty() {
            return Ok(());
        }

        let payloads: Vec<TaskPayload> = candidates
            .iter()
            .map(|(_, task, parent, dest_parent)| {
                transform_task(task, *parent, *dest_parent, self.mapping, self.now_unix)
            })
            .collect();

        let (slots, failure) = split(self.writer.submit(CreateTarget::Tasks, &payloads).await);
        let mut pairs = Vec::new();
        for ((key, _, _, _), slot) in candidates.iter().zip(&slots) {
            match slot {
                Some(created) => {
                    ctx.id_maps.put(EntityType::Task, key, created.id);
                    ctx.result.record_created(EntityType::Task, created.id);
                    pairs.push((key.clone(), created.id));
                }
                None => {
                    warn!(task = %key, "destination rejected task");
                    ctx.result.warn(format!("task {key}: rejected by destination"));
                }
            }
        }
        self.register(ctx, stage.name(), EntityType::Task, &pairs);

        match failure {
            Some(e) => Err(StageFailure::new(stage, e)),
            None => Ok(()),
        }
    }

    async fn lead_notes_stage(&mut self, ctx: &mut RunContext) -> Result<(), StageFailure> {
        let stage = Stage::LeadNotes;
        let parents = ctx.selected_deals.clone();
        info!(stage = %stage, parents = parents.len(), "stage started");
        for key in parents {
            let Some(dest) = ctx.id_maps.get(EntityType::Deal, &key) else {
                warn!(deal = %key, "deal not migrated; notes skipped");
                ctx.result
                    .warn(format!("{stage}: deal {key} was not migrated; notes skipped"));
                continue;
            };
            if let Err(e) = self.transfer_notes(ctx, NoteParent::Deal, &key, dest).await {
                error!(deal = %key, error = %e, "note transfer failed");
                ctx.result.error(format!("{stage}: deal {key}: {e}"));
            }
        }
        Ok(())
    }

    /// Notes of the contacts (or companies) linked to this run's deals.
    /// Per-parent failures are recorded and iteration goes on.
    async fn relation_notes(
        &mut self,
        ctx: &mut RunContext,
        deals: &[SourceDeal],
        parent: NoteParent,
        scope: &str,
    ) {
        let entity = parent.entity();
        let label = entity.label();
        let parents = note_parents(ctx, deals, entity);
        info!(stage = scope, parents = parents.len(), "stage started");
        for key in parents {
            let Some(dest) = ctx.id_maps.get(entity, &key) else {
                warn!(parent = label, source_id = %key, "parent not migrated; notes skipped");
                ctx.result
                    .warn(format!("{scope}: {label} {key} was not migrated; notes skipped"));
                continue;
            };
            if let Err(e) = self.transfer_notes(ctx, parent, &key, dest).await {
                error!(parent = label, source_id = %key, error = %e, "note transfer failed");
                ctx.result.error(format!("{scope}: {label} {key}: {e}"));
            }
        }
    }

    /// Fetch one parent's notes and recreate them under `dest_parent`.
    async fn transfer_notes(
        &self,
        ctx: &mut RunContext,
        parent: NoteParent,
        parent_key: &SourceKey,
        dest_parent: u64,
    ) -> anyhow::Result<()> {
        let notes = self.source.fetch_notes(parent, parent_key).await?;
        ctx.result.notes_fetched(parent, notes.len());
        if notes.is_empty() {
            return Ok(());
        }

        let payloads: Vec<NotePayload> = notes
            .iter()
            .map(|n| transform_note(n, dest_parent))
            .collect();
        let (slots, failure) = split(
            self.writer
                .submit(CreateTarget::Notes(parent), &payloads)
                .await,
        );
        for (note, slot) in notes.iter().zip(&slots) {
            match slot {
                Some(created) => {
                    ctx.id_maps.put(EntityType::Note, &note.id, created.id);
                    ctx.result.note_transferred(parent, created.id);
                }
                None => {
                    warn!(parent = parent.api_name(), %parent_key, note = %note.id, "destination rejected note");
                    ctx.result.warn(format!(
                        "{} {parent_key}: note {} rejected by destination",
                        parent.api_name(),
                        note.id
                    ));
                }
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn register(
        &mut self,
        ctx: &mut RunContext,
        scope: &str,
        entity: EntityType,
        pairs: &[(SourceKey, u64)],
    ) {
        if pairs.is_empty() {
            return;
        }
        if let Err(e) = self.registrar.register(entity, pairs) {
            error!(stage = scope, entity = %entity, pairs = pairs.len(), error = %e, "rollback registration failed");
            ctx.result.error(format!(
                "{scope}: rollback registration of {} {entity} failed: {e:#}",
                pairs.len()
            ));
        }
    }
}

/// Slots that made it, plus the failure if a chunk did not.
fn split(
    outcome: Result<Vec<Option<CreatedRecord>>, WriteError>,
) -> (Vec<Option<CreatedRecord>>, Option<WriteError>) {
    match outcome {
        Ok(slots) => (slots, None),
        Err(e) => (e.committed().to_vec(), Some(e)),
    }
}

/// Owner of a cached task, when it is one the run can migrate tasks for.
fn task_parent(task: &SourceTask) -> Option<EntityType> {
    task.entity_type
        .as_deref()
        .map(str::trim)
        .and_then(EntityType::from_api_name)
        .filter(|e| matches!(e, EntityType::Deal | EntityType::Contact | EntityType::Company))
}

fn relation_refs(deal: &SourceDeal, entity: EntityType) -> &[RelationRef] {
    match entity {
        EntityType::Contact => &deal.embedded.contacts,
        EntityType::Company => &deal.embedded.companies,
        _ => &[],
    }
}

/// Distinct deals of the selection the id map does not know yet.
fn pending_deals<'d>(maps: &IdMaps, deals: &'d [SourceDeal]) -> Vec<&'d SourceDeal> {
    let mut seen: HashSet<SourceKey> = HashSet::new();
    deals
        .iter()
        .filter(|d| {
            let key = normalize_id(&d.id);
            maps.get(EntityType::Deal, &key).is_none() && seen.insert(key)
        })
        .collect()
}

/// Distinct `entity` ids linked from `deals`, first-seen order.
fn linked_relations(deals: &[&SourceDeal], entity: EntityType) -> Vec<SourceKey> {
    let mut seen: HashSet<SourceKey> = HashSet::new();
    let mut out = Vec::new();
    for deal in deals {
        for r in relation_refs(deal, entity) {
            let key = normalize_id(&r.id);
            if seen.insert(key.clone()) {
                out.push(key);
            }
        }
    }
    out
}

/// Note parents of type `entity`, first-seen order over `deals`.
///
/// A relation created in this run is a parent. A relation linked to a deal
/// created in this run but missing from the id map is listed too, so the
/// caller can warn about it. A relation an earlier run created is not: its
/// notes moved with it.
fn note_parents(ctx: &RunContext, deals: &[SourceDeal], entity: EntityType) -> Vec<SourceKey> {
    let created: HashSet<&SourceKey> = ctx.created_relations(entity).iter().collect();
    let created_deals: HashSet<&SourceKey> = ctx.created_deals().map(|(k, _)| k).collect();
    let mut seen: HashSet<SourceKey> = HashSet::new();
    let mut out = Vec::new();
    for deal in deals {
        let deal_created = created_deals.contains(&normalize_id(&deal.id));
        for r in relation_refs(deal, entity) {
            let key = normalize_id(&r.id);
            let wanted = created.contains(&key)
                || (deal_created && ctx.id_maps.get(entity, &key).is_none());
            if wanted && seen.insert(key.clone()) {
                out.push(key);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::http::{CrmError, RequestThrottle};
    use crate::migration::ledger::MemoryLedger;
    use crate::migration::model::SourceNote;
    use crate::migration::writer::fake::FakeDestination;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSource {
        notes: HashMap<(NoteParent, SourceKey), Vec<SourceNote>>,
        failing: HashSet<(NoteParent, SourceKey)>,
        fetched: Mutex<Vec<(NoteParent, SourceKey)>>,
    }

    impl FakeSource {
        fn with_notes(mut self, parent: NoteParent, id: u64, texts: &[&str]) -> Self {
            let notes = texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    serde_json::from_value(json!({
                        "id": id * 1000 + i as u64,
                        "entity_id": id,
                        "note_type": "common",
                        "params": { "text": t }
                    }))
                    .unwrap()
                })
                .collect();
            self.notes.insert((parent, normalize_id(id)), notes);
            self
        }

        fn failing_for(mut self, parent: NoteParent, id: u64) -> Self {
            self.failing.insert((parent, normalize_id(id)));
            self
        }

        fn fetched(&self) -> Vec<(NoteParent, SourceKey)> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceApi for FakeSource {
        async fn fetch_notes(
            &self,
            parent: NoteParent,
            parent_id: &SourceKey,
        ) -> Result<Vec<SourceNote>, CrmError> {
            let key = (parent, parent_id.clone());
            self.fetched.lock().unwrap().push(key.clone());
            if self.failing.contains(&key) {
                return Err(CrmError::Http {
                    method: reqwest::Method::GET,
                    url: format!("fake://{}/{parent_id}/notes", parent.api_name()),
                    status: StatusCode::BAD_GATEWAY,
                    body: "upstream down".into(),
                    retry_after: None,
                });
            }
            Ok(self.notes.get(&key).cloned().unwrap_or_default())
        }
    }

    fn deal(v: Value) -> SourceDeal {
        serde_json::from_value(v).unwrap()
    }

    fn task(id: u64, entity_id: Value, text: &str) -> SourceTask {
        serde_json::from_value(json!({
            "id": id,
            "entity_type": "leads",
            "entity_id": entity_id,
            "text": text,
            "complete_till": 1_800_000_000
        }))
        .unwrap()
    }

    fn contacts_seed(pairs: &[(u64, u64)]) -> IdMaps {
        let mut seed = IdMaps::new();
        for (src, dst) in pairs {
            seed.put(EntityType::Contact, *src, *dst);
        }
        seed
    }

    fn parent_task(id: u64, entity_type: &str, entity_id: Value, text: &str) -> SourceTask {
        serde_json::from_value(json!({
            "id": id,
            "entity_type": entity_type,
            "entity_id": entity_id,
            "text": text
        }))
        .unwrap()
    }

    fn contact(id: u64, name: &str) -> SourceContact {
        serde_json::from_value(json!({ "id": id, "name": name })).unwrap()
    }

    fn company(id: u64, name: &str) -> SourceCompany {
        serde_json::from_value(json!({ "id": id, "name": name })).unwrap()
    }

    async fn run_with(
        source: &FakeSource,
        dest: &FakeDestination,
        ledger: &mut MemoryLedger,
        deals: &[SourceDeal],
        tasks: &[SourceTask],
        seed: Option<IdMaps>,
    ) -> RunContext {
        run_with_relations(source, dest, ledger, deals, tasks, seed, &[], &[]).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with_relations(
        source: &FakeSource,
        dest: &FakeDestination,
        ledger: &mut MemoryLedger,
        deals: &[SourceDeal],
        tasks: &[SourceTask],
        seed: Option<IdMaps>,
        contacts: &[SourceContact],
        companies: &[SourceCompany],
    ) -> RunContext {
        let mapping = MappingContext::default();
        let writer = BatchWriter::new(dest, RequestThrottle::disabled(), 50);
        let mut engine = MigrationEngine::new(source, writer, ledger, &mapping)
            .with_pipeline(777)
            .with_relations(contacts, companies)
            .with_clock(1_700_000_000);
        engine.run(deals, tasks, seed).await
    }

    #[tokio::test]
    async fn deal_payload_embeds_only_resolved_contacts() {
        let source = FakeSource::default();
        let dest = FakeDestination::new(5000);
        let mut ledger = MemoryLedger::default();
        let deals = vec![
            deal(json!({
                "id": 1, "name": "Linked",
                "_embedded": { "contacts": [{ "id": "11" }, { "id": 12 }], "companies": [{ "id": 99 }] }
            })),
            deal(json!({ "id": 2, "name": "Lonely", "_embedded": { "contacts": [{ "id": 13 }] } })),
        ];

        let ctx = run_with(
            &source,
            &dest,
            &mut ledger,
            &deals,
            &[],
            Some(contacts_seed(&[(11, 111)])),
        )
        .await;

        let calls = dest.calls_for(CreateTarget::Deals);
        let sent = &calls[0];
        assert_eq!(sent[0]["_embedded"]["contacts"], json!([{ "id": 111 }]));
        assert!(sent[0]["_embedded"].get("companies").is_none());
        assert_eq!(sent[0]["pipeline_id"], 777);
        assert!(sent[1].get("_embedded").is_none(), "nothing resolvable: no embedded keys");

        assert_eq!(ctx.result.transferred(EntityType::Deal), 2);
        assert_eq!(ctx.id_maps.get(EntityType::Deal, "1"), Some(5000));
        assert_eq!(ledger.pairs(EntityType::Deal).len(), 2);
        // contact 12 and company 99 on deal 1, contact 13 on deal 2
        let link_warnings = ctx
            .result
            .warnings
            .iter()
            .filter(|w| w.contains("link skipped"))
            .count();
        assert_eq!(link_warnings, 3);
    }

    #[tokio::test]
    async fn string_and_numeric_task_entity_ids_both_match() {
        let source = FakeSource::default();
        let dest = FakeDestination::new(100);
        let mut ledger = MemoryLedger::default();
        let deals = vec![deal(json!({ "id": 12345, "name": "Big" }))];
        let tasks = vec![
            task(1, json!(12345), "numeric"),
            task(2, json!("12345"), "string"),
            task(3, json!(999), "other deal"),
        ];

        let ctx = run_with(&source, &dest, &mut ledger, &deals, &tasks, None).await;

        assert_eq!(ctx.result.tasks_found, 2);
        assert_eq!(ctx.result.transferred(EntityType::Task), 2);
        let calls = dest.calls_for(CreateTarget::Tasks);
        let sent = &calls[0];
        assert_eq!(sent.len(), 2);
        for payload in sent {
            assert_eq!(payload["entity_id"], json!(100));
            assert!(payload["entity_id"].is_u64(), "entity_id must be numeric");
            assert_eq!(payload["entity_type"], "leads");
        }
        assert!(ctx.result.errors.is_empty());
    }

    #[tokio::test]
    async fn rejected_deal_turns_its_tasks_and_notes_into_warnings() {
        let source = FakeSource::default().with_notes(NoteParent::Deal, 2, &["kept"]);
        let dest = FakeDestination::new(10);
        dest.reject_named("Bad");
        let mut ledger = MemoryLedger::default();
        let deals = vec![
            deal(json!({ "id": 1, "name": "Bad" })),
            deal(json!({ "id": 2, "name": "Good" })),
        ];
        let tasks = vec![
            task(1, json!(1), "t1"),
            task(2, json!("1"), "t2"),
            task(3, json!(2), "t3"),
        ];

        let ctx = run_with(&source, &dest, &mut ledger, &deals, &tasks, None).await;
        let r = &ctx.result;

        assert!(r.errors.is_empty(), "{:?}", r.errors);
        assert_eq!(r.transferred(EntityType::Deal), 1);
        assert_eq!(r.created_ids(EntityType::Deal), &[10]);
        assert_eq!(r.transferred(EntityType::Task), 1);
        assert_eq!(r.skipped(EntityType::Task), 2);
        assert_eq!(r.warnings.iter().filter(|w| w.starts_with("task 1:")).count(), 1);
        assert_eq!(r.warnings.iter().filter(|w| w.starts_with("task 2:")).count(), 1);
        assert_eq!(
            r.warnings
                .iter()
                .filter(|w| w.contains("deal 1 was not migrated; notes skipped"))
                .count(),
            1
        );
        assert_eq!(source.fetched(), vec![(NoteParent::Deal, normalize_id(2u64))]);
        assert_eq!(r.transferred(EntityType::Note), 1);
    }

    #[tokio::test]
    async fn task_chunk_failure_keeps_deals_and_runs_note_stages() {
        let source = FakeSource::default()
            .with_notes(NoteParent::Deal, 1, &["a", "b"])
            .with_notes(NoteParent::Contact, 11, &["c"]);
        let dest = FakeDestination::new(1);
        dest.fail(CreateTarget::Tasks);
        let mut ledger = MemoryLedger::default();
        let deals = vec![deal(json!({
            "id": 1, "name": "D", "_embedded": { "contacts": [{ "id": 11 }] }
        }))];
        let tasks = vec![task(7, json!(1), "t")];
        let contacts = vec![contact(11, "Ann")];

        let ctx = run_with_relations(
            &source,
            &dest,
            &mut ledger,
            &deals,
            &tasks,
            None,
            &contacts,
            &[],
        )
        .await;
        let r = &ctx.result;

        // contact 11 takes id 1, the deal id 2
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].starts_with("tasks: "), "{}", r.errors[0]);
        assert_eq!(r.transferred(EntityType::Deal), 1);
        assert_eq!(r.created_ids(EntityType::Deal), &[2]);
        assert_eq!(ctx.id_maps.get(EntityType::Deal, 1u64), Some(2));
        assert_eq!(ledger.pairs(EntityType::Deal), &[(normalize_id(1u64), 2)]);
        assert_eq!(r.transferred(EntityType::Task), 0);

        assert_eq!(r.notes[&NoteParent::Deal].transferred, 2);
        assert_eq!(r.notes[&NoteParent::Contact].transferred, 1);
        let calls = dest.calls_for(CreateTarget::Notes(NoteParent::Contact));
        let contact_note = &calls[0][0];
        assert_eq!(contact_note["entity_id"], json!(1));
    }

    #[tokio::test]
    async fn deal_chunk_failure_keeps_committed_chunk() {
        let source = FakeSource::default();
        let dest = FakeDestination::new(1);
        let mut ledger = MemoryLedger::default();
        let deals: Vec<SourceDeal> = (1..=3)
            .map(|i| deal(json!({ "id": i, "name": format!("d{i}") })))
            .collect();

        struct FailAfterFirst<'d>(&'d FakeDestination);

        #[async_trait]
        impl<'d> crate::crm::destination::DestinationApi for FailAfterFirst<'d> {
            async fn create_batch(
                &self,
                target: CreateTarget,
                records: &[Value],
            ) -> Result<crate::crm::destination::CreatedBatch, CrmError> {
                if target == CreateTarget::Deals && !self.0.calls_for(target).is_empty() {
                    self.0.fail(target);
                }
                self.0.create_batch(target, records).await
            }
        }

        let wrapped = FailAfterFirst(&dest);
        let mapping = MappingContext::default();
        let writer = BatchWriter::new(&wrapped, RequestThrottle::disabled(), 2);
        let mut engine = MigrationEngine::new(&source, writer, &mut ledger, &mapping);
        let tasks = vec![task(1, json!(3), "orphan")];
        let ctx = engine.run(&deals, &tasks, None).await;

        assert_eq!(ctx.result.transferred(EntityType::Deal), 2);
        assert_eq!(ctx.id_maps.get(EntityType::Deal, 3u64), None);
        assert!(ctx.result.errors[0].starts_with("deals: "));
        assert_eq!(ctx.result.skipped(EntityType::Task), 1);
        drop(engine);
        assert_eq!(ledger.pairs(EntityType::Deal).len(), 2);
    }

    #[tokio::test]
    async fn seeded_deal_is_not_recreated() {
        let source = FakeSource::default().with_notes(NoteParent::Deal, 1, &["old"]);
        let dest = FakeDestination::new(1);
        let mut ledger = MemoryLedger::default();
        let mut seed = IdMaps::new();
        seed.put(EntityType::Deal, "1", 500);
        let deals = vec![
            deal(json!({ "id": 1, "name": "Done" })),
            deal(json!({ "id": 2, "name": "New" })),
        ];
        let tasks = vec![task(1, json!(1), "old task")];

        let ctx = run_with(&source, &dest, &mut ledger, &deals, &tasks, Some(seed)).await;

        assert_eq!(ctx.result.skipped(EntityType::Deal), 1);
        assert_eq!(dest.calls_for(CreateTarget::Deals)[0].len(), 1);
        assert!(dest.calls_for(CreateTarget::Tasks).is_empty());
        assert_eq!(ctx.result.tasks_found, 0);
        assert_eq!(source.fetched(), vec![(NoteParent::Deal, normalize_id(2u64))]);
    }

    #[tokio::test]
    async fn one_parents_note_failure_does_not_stop_the_others() {
        let source = FakeSource::default()
            .failing_for(NoteParent::Deal, 1)
            .with_notes(NoteParent::Deal, 2, &["x"]);
        let dest = FakeDestination::new(1);
        let mut ledger = MemoryLedger::default();
        let deals = vec![
            deal(json!({ "id": 1, "name": "a" })),
            deal(json!({ "id": 2, "name": "b" })),
        ];

        let ctx = run_with(&source, &dest, &mut ledger, &deals, &[], None).await;

        assert_eq!(ctx.result.errors.len(), 1);
        assert!(ctx.result.errors[0].starts_with("lead notes: deal 1:"));
        assert_eq!(ctx.result.notes[&NoteParent::Deal].transferred, 1);
    }

    #[tokio::test]
    async fn unmapped_contact_is_warned_and_never_fetched() {
        let source = FakeSource::default().with_notes(NoteParent::Contact, 21, &["n"]);
        let dest = FakeDestination::new(1);
        let mut ledger = MemoryLedger::default();
        let deals = vec![
            deal(json!({ "id": 1, "name": "a", "_embedded": { "contacts": [{ "id": 21 }, { "id": 22 }] } })),
            deal(json!({ "id": 2, "name": "b", "_embedded": { "contacts": [{ "id": "21" }] } })),
        ];
        // 22 is not in the cache, so it is never created
        let contacts = vec![contact(21, "Known")];

        let ctx = run_with_relations(
            &source,
            &dest,
            &mut ledger,
            &deals,
            &[],
            None,
            &contacts,
            &[],
        )
        .await;

        let contact_fetches: Vec<_> = source
            .fetched()
            .into_iter()
            .filter(|(p, _)| *p == NoteParent::Contact)
            .collect();
        assert_eq!(contact_fetches, vec![(NoteParent::Contact, normalize_id(21u64))]);
        assert!(ctx
            .result
            .warnings
            .iter()
            .any(|w| w == "contact notes: contact 22 was not migrated; notes skipped"));
        assert_eq!(ctx.result.notes[&NoteParent::Contact].transferred, 1);
    }

    #[tokio::test]
    async fn contact_notes_move_once_across_resumed_runs() {
        let source = FakeSource::default().with_notes(NoteParent::Contact, 21, &["hello"]);
        let dest = FakeDestination::new(1);
        let mut ledger = MemoryLedger::default();
        let contacts = vec![contact(21, "Shared")];
        let first_deals = vec![deal(json!({
            "id": 1, "name": "first", "_embedded": { "contacts": [{ "id": 21 }] }
        }))];
        let second_deals = vec![deal(json!({
            "id": 2, "name": "second", "_embedded": { "contacts": [{ "id": "21" }] }
        }))];

        let first = run_with_relations(
            &source,
            &dest,
            &mut ledger,
            &first_deals,
            &[],
            None,
            &contacts,
            &[],
        )
        .await;
        let contact_dest = first.id_maps.get(EntityType::Contact, 21u64).unwrap();
        assert_eq!(first.result.notes[&NoteParent::Contact].transferred, 1);

        let second = run_with_relations(
            &source,
            &dest,
            &mut ledger,
            &second_deals,
            &[],
            Some(first.id_maps.clone()),
            &contacts,
            &[],
        )
        .await;

        let note_calls = dest.calls_for(CreateTarget::Notes(NoteParent::Contact));
        assert_eq!(note_calls.len(), 1);
        assert_eq!(note_calls.iter().map(Vec::len).sum::<usize>(), 1);
        assert_eq!(dest.calls_for(CreateTarget::Contacts).len(), 1);
        assert_eq!(second.result.skipped(EntityType::Contact), 1);
        assert!(second.result.notes.get(&NoteParent::Contact).is_none());
        assert!(second.result.warnings.is_empty(), "{:?}", second.result.warnings);

        let deal_calls = dest.calls_for(CreateTarget::Deals);
        assert_eq!(
            deal_calls[1][0]["_embedded"]["contacts"],
            json!([{ "id": contact_dest }])
        );
        assert_eq!(ledger.pairs(EntityType::Contact), &[(normalize_id(21u64), contact_dest)]);
    }

    #[tokio::test]
    async fn relations_are_created_first_and_bring_their_tasks_and_notes() {
        let source = FakeSource::default()
            .with_notes(NoteParent::Contact, 7, &["contact note"])
            .with_notes(NoteParent::Company, 8, &["company note"]);
        let dest = FakeDestination::new(100);
        let mut ledger = MemoryLedger::default();
        let contacts = vec![contact(7, "Ann")];
        let companies = vec![company(8, "Acme")];
        let deals = vec![deal(json!({
            "id": 1, "name": "D",
            "_embedded": { "contacts": [{ "id": 7 }], "companies": [{ "id": "8" }] }
        }))];
        let tasks = vec![
            task(1, json!(1), "deal task"),
            parent_task(2, "contacts", json!("7"), "contact task"),
            parent_task(3, "companies", json!(8), "company task"),
            parent_task(4, "contacts", json!(99), "someone else"),
        ];

        let ctx = run_with_relations(
            &source,
            &dest,
            &mut ledger,
            &deals,
            &tasks,
            None,
            &contacts,
            &companies,
        )
        .await;
        let r = &ctx.result;

        assert!(r.errors.is_empty(), "{:?}", r.errors);
        assert!(r.warnings.is_empty(), "{:?}", r.warnings);
        assert_eq!(ctx.id_maps.get(EntityType::Company, 8u64), Some(100));
        assert_eq!(ctx.id_maps.get(EntityType::Contact, "7"), Some(101));
        assert_eq!(ctx.id_maps.get(EntityType::Deal, 1u64), Some(102));
        assert_eq!(ledger.pairs(EntityType::Company), &[(normalize_id(8u64), 100)]);
        assert_eq!(ledger.pairs(EntityType::Contact), &[(normalize_id(7u64), 101)]);

        let deal_calls = dest.calls_for(CreateTarget::Deals);
        assert_eq!(deal_calls[0][0]["_embedded"]["contacts"], json!([{ "id": 101 }]));
        assert_eq!(deal_calls[0][0]["_embedded"]["companies"], json!([{ "id": 100 }]));

        assert_eq!(r.tasks_found, 3);
        let task_calls = dest.calls_for(CreateTarget::Tasks);
        let owners: Vec<(Value, Value)> = task_calls[0]
            .iter()
            .map(|t| (t["entity_type"].clone(), t["entity_id"].clone()))
            .collect();
        assert_eq!(
            owners,
            vec![
                (json!("leads"), json!(102)),
                (json!("contacts"), json!(101)),
                (json!("companies"), json!(100)),
            ]
        );

        assert_eq!(r.notes[&NoteParent::Contact].transferred, 1);
        assert_eq!(r.notes[&NoteParent::Company].transferred, 1);
        let company_notes = dest.calls_for(CreateTarget::Notes(NoteParent::Company));
        assert_eq!(company_notes[0][0]["entity_id"], json!(100));
    }

    #[tokio::test]
    async fn company_failure_leaves_contacts_and_deals_running() {
        let source = FakeSource::default();
        let dest = FakeDestination::new(1);
        dest.fail(CreateTarget::Companies);
        let mut ledger = MemoryLedger::default();
        let contacts = vec![contact(7, "Ann")];
        let companies = vec![company(8, "Acme")];
        let deals = vec![deal(json!({
            "id": 1, "name": "D",
            "_embedded": { "contacts": [{ "id": 7 }], "companies": [{ "id": 8 }] }
        }))];

        let ctx = run_with_relations(
            &source,
            &dest,
            &mut ledger,
            &deals,
            &[],
            None,
            &contacts,
            &companies,
        )
        .await;
        let r = &ctx.result;

        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].starts_with("companies: "), "{}", r.errors[0]);
        assert_eq!(r.transferred(EntityType::Contact), 1);
        assert_eq!(r.transferred(EntityType::Deal), 1);
        let deal_calls = dest.calls_for(CreateTarget::Deals);
        assert!(deal_calls[0][0]["_embedded"].get("companies").is_none());
        assert!(r
            .warnings
            .iter()
            .any(|w| w == "deal 1: companies 8 not migrated; link skipped"));
        assert!(ledger.pairs(EntityType::Company).is_empty());
    }

    #[tokio::test]
    async fn failing_registrar_is_reported_without_undoing_results() {
        struct Broken;
        impl RollbackRegistrar for Broken {
            fn register(&mut self, _: EntityType, _: &[(SourceKey, u64)]) -> anyhow::Result<()> {
                anyhow::bail!("disk full")
            }
        }

        let source = FakeSource::default();
        let dest = FakeDestination::new(1);
        let mut broken = Broken;
        let mapping = MappingContext::default();
        let writer = BatchWriter::new(&dest, RequestThrottle::disabled(), 50);
        let mut engine = MigrationEngine::new(&source, writer, &mut broken, &mapping);
        let deals = vec![deal(json!({ "id": 1, "name": "a" }))];
        let tasks = vec![task(9, json!(1), "t")];

        let result = engine.migrate(&deals, &tasks, None).await;

        assert_eq!(result.transferred(EntityType::Deal), 1);
        assert_eq!(result.transferred(EntityType::Task), 1);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].starts_with("deals: rollback registration"));
        assert!(result.errors[1].starts_with("tasks: rollback registration"));
    }
}
