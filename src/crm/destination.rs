use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

use super::http::{CrmError, CrmHttp};
use crate::migration::ids::RawId;
use crate::migration::model::{EntityType, NoteParent};

/// Bulk-create endpoint on the destination CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateTarget {
    Deals,
    Contacts,
    Companies,
    Tasks,
    Notes(NoteParent),
}

impl CreateTarget {
    pub fn path(self) -> String {
        match self {
            CreateTarget::Notes(parent) => format!("{}/notes", parent.api_name()),
            other => other.entity().api_name().to_string(),
        }
    }

    /// Key of the created list inside the response `_embedded` object.
    pub fn embedded_key(self) -> &'static str {
        self.entity().api_name()
    }

    pub fn entity(self) -> EntityType {
        match self {
            CreateTarget::Deals => EntityType::Deal,
            CreateTarget::Contacts => EntityType::Contact,
            CreateTarget::Companies => EntityType::Company,
            CreateTarget::Tasks => EntityType::Task,
            CreateTarget::Notes(_) => EntityType::Note,
        }
    }
}

impl fmt::Display for CreateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// One created entity as echoed back by the destination.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedRecord {
    pub id: u64,
    #[serde(default)]
    pub request_id: Option<RawId>,
}

/// One answered bulk-create call.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedBatch {
    pub status: StatusCode,
    pub records: Vec<Option<CreatedRecord>>,
}

/// Destination CRM write surface.
///
/// Contract: `create_batch` returns exactly one slot per input record, in input
/// order. Slot `i` is `Some` when record `i` was created and `None` when the
/// destination rejected that record alone. Implementations must fail rather
/// than return a list they cannot align, since callers pair slots with source
/// ids by position.
#[async_trait]
pub trait DestinationApi: Send + Sync {
    async fn create_batch(
        &self,
        target: CreateTarget,
        records: &[Value],
    ) -> Result<CreatedBatch, CrmError>;
}

/// Kommo-style REST destination (`POST /api/v4/<entity>` with a JSON array).
#[derive(Clone, Debug)]
pub struct KommoClient {
    http: CrmHttp,
}

impl KommoClient {
    pub fn new(http: CrmHttp) -> Self {
        Self { http }
    }
}

#[async_trait]
impl DestinationApi for KommoClient {
    async fn create_batch(
        &self,
        target: CreateTarget,
        records: &[Value],
    ) -> Result<CreatedBatch, CrmError> {
        if records.is_empty() {
            return Ok(CreatedBatch {
                status: StatusCode::NO_CONTENT,
                records: Vec::new(),
            });
        }
        let body = Value::Array(records.to_vec());
        let (status, resp) = self.http.post_json(&target.path(), &body).await?;
        let items = resp
            .get("_embedded")
            .and_then(|e| e.get(target.embedded_key()))
            .and_then(Value::as_array)
            .ok_or_else(|| CrmError::Decode {
                url: format!("{}/api/v4/{}", self.http.base_url(), target.path()),
                message: format!("missing _embedded.{}", target.embedded_key()),
            })?;
        info!(
            endpoint = %target,
            status = status.as_u16(),
            sent = records.len(),
            returned = items.len(),
            "destination bulk create"
        );
        Ok(CreatedBatch {
            status,
            records: align_created(records.len(), items)?,
        })
    }
}

/// Pair created entries with request positions.
///
/// When every entry carries a distinct in-range `request_id` the entries are
/// placed by it; otherwise they are taken positionally. A response longer than
/// the request cannot be paired and is rejected.
pub fn align_created(sent: usize, items: &[Value]) -> Result<Vec<Option<CreatedRecord>>, CrmError> {
    if items.len() > sent {
        return Err(CrmError::ResponseMismatch {
            sent,
            received: items.len(),
        });
    }
    let parsed: Vec<Option<CreatedRecord>> = items
        .iter()
        .map(|v| serde_json::from_value::<CreatedRecord>(v.clone()).ok())
        .collect();

    if let Some(by_request) = place_by_request_id(sent, &parsed) {
        return Ok(by_request);
    }

    if parsed.len() < sent {
        warn!(
            sent,
            received = parsed.len(),
            "destination returned fewer records than sent; trailing records treated as rejected"
        );
    }
    let mut out = parsed;
    out.resize(sent, None);
    Ok(out)
}

fn place_by_request_id(sent: usize, parsed: &[Option<CreatedRecord>]) -> Option<Vec<Option<CreatedRecord>>> {
    let mut out: Vec<Option<CreatedRecord>> = vec![None; sent];
    let mut placed = 0usize;
    for rec in parsed.iter().flatten() {
        let idx: usize = rec.request_id.as_ref()?.to_string().trim().parse().ok()?;
        if idx >= sent || out[idx].is_some() {
            return None;
        }
        out[idx] = Some(rec.clone());
        placed += 1;
    }
    (placed > 0).then_some(out)
}
