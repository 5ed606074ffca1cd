use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::http::{CrmError, CrmHttp, RequestThrottle};
use crate::migration::ids::SourceKey;
use crate::migration::model::{NoteParent, SourceNote};

/// Largest page the source API serves.
pub const NOTES_PAGE_LIMIT: usize = 250;

/// Hard stop for runaway pagination.
const MAX_NOTE_PAGES: u32 = 200;

/// Source CRM read surface used during a run. Everything else (deals, tasks)
/// is fetched upfront and handed to the engine.
#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn fetch_notes(
        &self,
        parent: NoteParent,
        parent_id: &SourceKey,
    ) -> Result<Vec<SourceNote>, CrmError>;
}

/// amoCRM-style REST source: `GET /api/v4/<entity>/<id>/notes`.
#[derive(Clone, Debug)]
pub struct AmoClient {
    http: CrmHttp,
    throttle: RequestThrottle,
}

impl AmoClient {
    pub fn new(http: CrmHttp, throttle: RequestThrottle) -> Self {
        Self { http, throttle }
    }
}

#[async_trait]
impl SourceApi for AmoClient {
    async fn fetch_notes(
        &self,
        parent: NoteParent,
        parent_id: &SourceKey,
    ) -> Result<Vec<SourceNote>, CrmError> {
        let path = format!("{}/{}/notes", parent.api_name(), parent_id);
        let mut all = Vec::new();
        for page in 1..=MAX_NOTE_PAGES {
            self.throttle.acquire().await;
            let query = [
                ("page", page.to_string()),
                ("limit", NOTES_PAGE_LIMIT.to_string()),
            ];
            let Some(body) = self.http.get_json(&path, &query).await? else {
                break;
            };
            let batch = parse_notes(&body).map_err(|message| CrmError::Decode {
                url: format!("{}/api/v4/{path}", self.http.base_url()),
                message,
            })?;
            let fetched = batch.len();
            debug!(parent = parent.api_name(), %parent_id, page, fetched, "source notes page");
            all.extend(batch);
            if fetched < NOTES_PAGE_LIMIT {
                break;
            }
        }
        info!(parent = parent.api_name(), %parent_id, notes = all.len(), "fetched source notes");
        Ok(all)
    }
}

fn parse_notes(body: &Value) -> Result<Vec<SourceNote>, String> {
    let Some(items) = body
        .get("_embedded")
        .and_then(|e| e.get("notes"))
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|v| serde_json::from_value::<SourceNote>(v.clone()).map_err(|e| e.to_string()))
        .collect()
}
