//! Pure source → destination record conversion. No I/O happens here; every
//! lookup table arrives through [`MappingContext`].
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::ids::SourceKey;
use super::model::{
    CustomFieldValue, DealEmbeddedPayload, DealPayload, EntityType, NotePayload, RelationPayload,
    SourceCompany, SourceContact, SourceDeal, SourceNote, SourceTask, TagPayload, TaskPayload,
};
use super::model::{FieldValue, FieldValuePayload};

const SECONDS_PER_DAY: i64 = 86_400;

/// How one source custom field lands on the destination side.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    #[serde(alias = "kommoFieldId")]
    pub dest_field_id: u64,
    #[serde(default)]
    pub enum_map: HashMap<SourceKey, u64>,
    #[serde(default, alias = "kommoFieldType")]
    pub dest_field_type: Option<String>,
    #[serde(default, alias = "amoFieldType")]
    pub source_field_type: Option<String>,
    /// Older mapping files only carry this one.
    #[serde(default)]
    pub field_type: Option<String>,
}

impl FieldMapping {
    fn effective_type(&self) -> &str {
        self.dest_field_type
            .as_deref()
            .or(self.source_field_type.as_deref())
            .or(self.field_type.as_deref())
            .unwrap_or("text")
    }
}

/// Per-entity custom field tables, keyed by source field id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldMappings {
    #[serde(default, alias = "leads")]
    pub deals: HashMap<SourceKey, FieldMapping>,
    #[serde(default)]
    pub contacts: HashMap<SourceKey, FieldMapping>,
    #[serde(default)]
    pub companies: HashMap<SourceKey, FieldMapping>,
}

/// Lookup tables shared by every transform in a run.
#[derive(Debug, Clone, Default)]
pub struct MappingContext {
    /// Source status id → destination status id.
    pub stage_mapping: HashMap<SourceKey, u64>,
    /// Source user id → destination user id.
    pub user_mapping: HashMap<SourceKey, u64>,
    pub fields: FieldMappings,
}

impl MappingContext {
    fn status_for(&self, deal: &SourceDeal) -> Option<u64> {
        let raw = deal.status_id.as_ref()?;
        self.stage_mapping.get(&super::ids::normalize_id(raw)).copied()
    }

    fn user_for(&self, raw: Option<&super::ids::RawId>) -> Option<u64> {
        let raw = raw?;
        self.user_mapping.get(&super::ids::normalize_id(raw)).copied()
    }
}

/// Destination deal without relations or pipeline; the deal stage attaches both.
pub fn transform_deal(deal: &SourceDeal, ctx: &MappingContext) -> DealPayload {
    let tags = deal
        .embedded
        .tags
        .iter()
        .filter_map(|t| t.name.as_deref())
        .filter(|n| !n.trim().is_empty())
        .map(|n| TagPayload { name: n.to_string() })
        .collect();

    DealPayload {
        name: non_empty(deal.name.as_deref()).unwrap_or_else(|| format!("Lead #{}", deal.id)),
        price: whole_price(deal.price),
        pipeline_id: None,
        // An unmapped status is left out; the destination rejects a null one.
        status_id: ctx.status_for(deal),
        responsible_user_id: ctx.user_for(deal.responsible_user_id.as_ref()),
        custom_fields_values: transform_custom_fields(
            &deal.custom_fields_values,
            Some(&ctx.fields.deals),
        ),
        embedded: DealEmbeddedPayload {
            tags,
            ..DealEmbeddedPayload::default()
        },
    }
}

pub fn transform_contact(contact: &SourceContact, ctx: &MappingContext) -> RelationPayload {
    RelationPayload {
        name: non_empty(contact.name.as_deref())
            .unwrap_or_else(|| format!("Contact #{}", contact.id)),
        responsible_user_id: ctx.user_for(contact.responsible_user_id.as_ref()),
        custom_fields_values: transform_custom_fields(
            &contact.custom_fields_values,
            Some(&ctx.fields.contacts),
        ),
    }
}

pub fn transform_company(company: &SourceCompany, ctx: &MappingContext) -> RelationPayload {
    RelationPayload {
        name: non_empty(company.name.as_deref())
            .unwrap_or_else(|| format!("Company #{}", company.id)),
        responsible_user_id: ctx.user_for(company.responsible_user_id.as_ref()),
        custom_fields_values: transform_custom_fields(
            &company.custom_fields_values,
            Some(&ctx.fields.companies),
        ),
    }
}

/// `entity_id` is the already-resolved destination id of the owning
/// `parent` (a deal, contact or company).
pub fn transform_task(
    task: &SourceTask,
    parent: EntityType,
    entity_id: u64,
    ctx: &MappingContext,
    now_unix: i64,
) -> TaskPayload {
    let complete_till = match task.complete_till {
        Some(ts) if ts > 0 => ts,
        _ => now_unix + SECONDS_PER_DAY,
    };
    let result = match &task.result {
        Some(Value::Object(map)) if !map.is_empty() => Some(Value::Object(map.clone())),
        Some(Value::String(s)) if !s.is_empty() => Some(json!({ "text": s })),
        _ => None,
    };
    TaskPayload {
        task_type_id: task.task_type_id.filter(|t| *t > 0).unwrap_or(1),
        text: task.text.clone().unwrap_or_default(),
        complete_till,
        entity_id,
        entity_type: parent.api_name(),
        responsible_user_id: ctx.user_for(task.responsible_user_id.as_ref()),
        result,
    }
}

pub fn transform_note(note: &SourceNote, entity_id: u64) -> NotePayload {
    NotePayload {
        entity_id,
        note_type: non_empty(note.note_type.as_deref()).unwrap_or_else(|| "common".to_string()),
        params: match &note.params {
            Some(v) if !v.is_null() => v.clone(),
            _ => json!({}),
        },
        created_at: note.created_at,
        updated_at: note.updated_at,
    }
}

/// Convert custom field values through the mapping table. Unmapped fields and
/// fields that end up with no values are dropped.
pub fn transform_custom_fields(
    values: &[CustomFieldValue],
    mapping: Option<&HashMap<SourceKey, FieldMapping>>,
) -> Vec<FieldValuePayload> {
    let Some(mapping) = mapping else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for field in values {
        let Some(mapped) = mapping.get(&super::ids::normalize_id(&field.field_id)) else {
            continue;
        };
        let converted = convert_values(&field.values, mapped);
        if !converted.is_empty() {
            out.push(FieldValuePayload {
                field_id: mapped.dest_field_id,
                values: converted,
            });
        }
    }
    out
}

fn convert_values(values: &[FieldValue], mapped: &FieldMapping) -> Vec<Value> {
    let enum_target = |v: &FieldValue| {
        v.enum_id
            .as_ref()
            .and_then(|id| mapped.enum_map.get(&super::ids::normalize_id(id)).copied())
    };

    match mapped.effective_type() {
        "multitext" => values
            .iter()
            .filter(|v| v.value.as_ref().is_some_and(truthy))
            .map(|v| match &v.enum_code {
                Some(code) => json!({ "value": v.value, "enum_code": code }),
                None => json!({ "value": v.value }),
            })
            .collect(),
        // Single choice: only the first mapped option survives.
        "select" | "radiobutton" => values
            .iter()
            .find_map(enum_target)
            .map(|id| vec![json!({ "enum_id": id })])
            .unwrap_or_default(),
        "multiselect" => values
            .iter()
            .filter_map(enum_target)
            .map(|id| json!({ "enum_id": id }))
            .collect(),
        "checkbox" => values
            .iter()
            .map(|v| json!({ "value": v.value.as_ref().is_some_and(truthy) }))
            .collect(),
        "birthday" | "date" | "date_time" => values
            .iter()
            .filter_map(|v| v.value.as_ref())
            .filter_map(to_iso_timestamp)
            .map(|iso| json!({ "value": iso }))
            .collect(),
        _ => values
            .iter()
            .filter_map(|v| v.value.as_ref())
            .filter_map(|v| match v {
                Value::Null | Value::Bool(false) => None,
                Value::String(s) if s.is_empty() => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .map(|s| json!({ "value": s }))
            .collect(),
    }
}

/// Seconds-since-epoch or an ISO string → `YYYY-MM-DDTHH:MM:SS+00:00`.
fn to_iso_timestamp(raw: &Value) -> Option<String> {
    let parsed: DateTime<Utc> = match raw {
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0)?,
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => {
            let s = s.trim();
            if s.bytes().all(|b| b.is_ascii_digit()) {
                DateTime::from_timestamp(s.parse().ok()?, 0)?
            } else if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                dt.with_timezone(&Utc)
            } else {
                let day = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
                day.and_hms_opt(0, 0, 0)?.and_utc()
            }
        }
        _ => return None,
    };
    Some(parsed.format("%Y-%m-%dT%H:%M:%S+00:00").to_string())
}

/// Missing, negative or non-finite prices become 0; fractions are rounded.
fn whole_price(raw: Option<f64>) -> u64 {
    match raw {
        Some(p) if p.is_finite() && p > 0.0 => p.round() as u64,
        _ => 0,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty()).map(str::to_string)
}
