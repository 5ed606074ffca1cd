use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::crm::destination::{CreateTarget, CreatedBatch, CreatedRecord, DestinationApi};
use crate::crm::http::{truncate_for_log, CrmError, RequestThrottle, LOG_BODY_LIMIT};

/// Largest batch the destination accepts per bulk-create call.
pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const MAX_CHUNK_SIZE: usize = 250;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{target}: could not encode record {index}: {source}")]
    Encode {
        target: CreateTarget,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    /// A chunk failed; `committed` holds the slots of every earlier chunk so
    /// the caller can still record what was created.
    #[error("{target}: chunk {chunk}/{chunks} failed after {} committed records: {source}", .committed.len())]
    Chunk {
        target: CreateTarget,
        chunk: usize,
        chunks: usize,
        committed: Vec<Option<CreatedRecord>>,
        #[source]
        source: CrmError,
    },
}

impl WriteError {
    pub fn committed(&self) -> &[Option<CreatedRecord>] {
        match self {
            WriteError::Encode { .. } => &[],
            WriteError::Chunk { committed, .. } => committed,
        }
    }
}

/// Splits records into fixed-size pages and submits them one bulk call at a
/// time, taking a throttle permit before each call.
pub struct BatchWriter<'a> {
    dest: &'a dyn DestinationApi,
    throttle: RequestThrottle,
    chunk_size: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(dest: &'a dyn DestinationApi, throttle: RequestThrottle, chunk_size: usize) -> Self {
        Self {
            dest,
            throttle,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of bulk calls `len` records take.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Create `records` on the destination. The result has one slot per
    /// record, in input order; `None` marks a record the destination rejected.
    /// Retries are the destination client's business, not the writer's.
    pub async fn submit<T: Serialize>(
        &self,
        target: CreateTarget,
        records: &[T],
    ) -> Result<Vec<Option<CreatedRecord>>, WriteError> {
        let encoded = records
            .iter()
            .enumerate()
            .map(|(index, r)| {
                serde_json::to_value(r).map_err(|source| WriteError::Encode {
                    target,
                    index,
                    source,
                })
            })
            .collect::<Result<Vec<Value>, _>>()?;

        let chunks = self.chunk_count(encoded.len());
        let mut created: Vec<Option<CreatedRecord>> = Vec::with_capacity(encoded.len());
        for (i, chunk) in encoded.chunks(self.chunk_size).enumerate() {
            self.throttle.acquire().await;
            let CreatedBatch {
                status,
                records: mut slots,
            } = match self.dest.create_batch(target, chunk).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(
                        endpoint = %target,
                        chunk = i + 1,
                        chunks,
                        size = chunk.len(),
                        status = ?e.status(),
                        error = %truncate_for_log(e.to_string(), LOG_BODY_LIMIT),
                        "bulk create chunk failed"
                    );
                    return Err(WriteError::Chunk {
                        target,
                        chunk: i + 1,
                        chunks,
                        committed: created,
                        source: e,
                    });
                }
            };
            let returned = slots.len();
            if slots.len() > chunk.len() {
                let source = CrmError::ResponseMismatch {
                    sent: chunk.len(),
                    received: slots.len(),
                };
                error!(endpoint = %target, chunk = i + 1, error = %source, "bulk create response cannot be paired");
                return Err(WriteError::Chunk {
                    target,
                    chunk: i + 1,
                    chunks,
                    committed: created,
                    source,
                });
            }
            if slots.len() < chunk.len() {
                warn!(
                    endpoint = %target,
                    chunk = i + 1,
                    sent = chunk.len(),
                    received = slots.len(),
                    "short bulk create response; missing slots treated as rejected"
                );
                slots.resize(chunk.len(), None);
            }
            let accepted = slots.iter().filter(|s| s.is_some()).count();
            info!(
                endpoint = %target,
                chunk = i + 1,
                chunks,
                size = chunk.len(),
                status = status.as_u16(),
                returned,
                accepted,
                "bulk create chunk submitted"
            );
            created.extend(slots);
        }
        Ok(created)
    }
}
