use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::ids::RawId;

/// Business entity kinds moved between the two CRMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Deal,
    Contact,
    Company,
    Task,
    Note,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Deal,
        EntityType::Contact,
        EntityType::Company,
        EntityType::Task,
        EntityType::Note,
    ];

    /// Plural segment both CRM APIs use in paths and `_embedded` keys.
    pub fn api_name(self) -> &'static str {
        match self {
            EntityType::Deal => "leads",
            EntityType::Contact => "contacts",
            EntityType::Company => "companies",
            EntityType::Task => "tasks",
            EntityType::Note => "notes",
        }
    }

    /// Singular label for messages.
    pub fn label(self) -> &'static str {
        match self {
            EntityType::Deal => "deal",
            EntityType::Contact => "contact",
            EntityType::Company => "company",
            EntityType::Task => "task",
            EntityType::Note => "note",
        }
    }

    pub fn from_api_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.api_name() == name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// Entity that owns notes fetched live from the source CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteParent {
    Deal,
    Contact,
    Company,
}

impl NoteParent {
    pub fn entity(self) -> EntityType {
        match self {
            NoteParent::Deal => EntityType::Deal,
            NoteParent::Contact => EntityType::Contact,
            NoteParent::Company => EntityType::Company,
        }
    }

    pub fn api_name(self) -> &'static str {
        self.entity().api_name()
    }
}

// ---------------------------------------------------------------------------
// Source side (as cached / fetched from the source CRM)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRef {
    pub id: RawId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealRelations {
    #[serde(default)]
    pub contacts: Vec<RelationRef>,
    #[serde(default)]
    pub companies: Vec<RelationRef>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub enum_id: Option<RawId>,
    #[serde(default)]
    pub enum_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub field_id: RawId,
    #[serde(default)]
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDeal {
    pub id: RawId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub status_id: Option<RawId>,
    #[serde(default)]
    pub pipeline_id: Option<RawId>,
    #[serde(default)]
    pub responsible_user_id: Option<RawId>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub custom_fields_values: Vec<CustomFieldValue>,
    #[serde(rename = "_embedded", default)]
    pub embedded: DealRelations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContact {
    pub id: RawId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub responsible_user_id: Option<RawId>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub custom_fields_values: Vec<CustomFieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCompany {
    pub id: RawId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub responsible_user_id: Option<RawId>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub custom_fields_values: Vec<CustomFieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTask {
    pub id: RawId,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<RawId>,
    #[serde(default)]
    pub task_type_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub complete_till: Option<i64>,
    #[serde(default)]
    pub responsible_user_id: Option<RawId>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNote {
    pub id: RawId,
    #[serde(default)]
    pub entity_id: Option<RawId>,
    #[serde(default)]
    pub note_type: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Destination side (request payloads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedId {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValuePayload {
    pub field_id: u64,
    pub values: Vec<Value>,
}

/// `_embedded` block of a deal create request. Empty categories are omitted
/// entirely; the destination treats an empty array as "clear".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DealEmbeddedPayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<EmbeddedId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub companies: Vec<EmbeddedId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagPayload>,
}

impl DealEmbeddedPayload {
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty() && self.companies.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealPayload {
    pub name: String,
    /// Whole currency units; the destination field is an integer.
    pub price: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible_user_id: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields_values: Vec<FieldValuePayload>,
    #[serde(rename = "_embedded", skip_serializing_if = "DealEmbeddedPayload::is_empty")]
    pub embedded: DealEmbeddedPayload,
}

/// Contact or company create request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationPayload {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible_user_id: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields_values: Vec<FieldValuePayload>,
}

/// `entity_id` is a `u64` so the mapped id can only ever be sent as a number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPayload {
    pub task_type_id: i64,
    pub text: String,
    pub complete_till: i64,
    pub entity_id: u64,
    pub entity_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible_user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotePayload {
    pub entity_id: u64,
    pub note_type: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}
