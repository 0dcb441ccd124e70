//! Activity recorder: appends one immutable record per processed message
//! and serves the read path for summaries and the API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::retry::{RetryPolicy, retry};
use crate::pipeline::types::{ActivityRecord, RecordKind, TimeRange};
use crate::store::{ActivityFilter, ActivityStore};

/// Backoff between store retries; writes are local so this stays short.
const STORE_BACKOFF: Duration = Duration::from_millis(50);

/// Whether the record reached the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Recorded,
    Unrecorded { attempts: u32, reason: String },
}

impl RecordStatus {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded)
    }
}

pub struct ActivityRecorder {
    store: Arc<dyn ActivityStore>,
    policy: RetryPolicy,
}

impl ActivityRecorder {
    pub fn new(store: Arc<dyn ActivityStore>, attempts: u32) -> Self {
        Self {
            store,
            policy: RetryPolicy::new(attempts, STORE_BACKOFF),
        }
    }

    /// Append `record`, retrying transient failures. Never panics or
    /// returns an error; exhaustion is reported as `Unrecorded`.
    pub async fn record(&self, record: &ActivityRecord) -> RecordStatus {
        let result = retry(&self.policy, "append_activity", || self.store.append(record)).await;
        match result {
            Ok(()) => {
                info!(
                    id = %record.id,
                    message_id = %record.message.id,
                    kind = record.kind.as_str(),
                    "Activity recorded"
                );
                RecordStatus::Recorded
            }
            Err(exhausted) => {
                let failure = PipelineError::StoreWriteFailure {
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                };
                error!(id = %record.id, error = %failure, "Activity not recorded");
                RecordStatus::Unrecorded {
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                }
            }
        }
    }

    pub async fn list(
        &self,
        range: &TimeRange,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityRecord>, DatabaseError> {
        self.store.query(range, filter).await
    }

    pub async fn count_by_kind(
        &self,
        range: &TimeRange,
    ) -> Result<BTreeMap<RecordKind, u64>, DatabaseError> {
        self.store.count_by_kind(range).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ActivityRecord>, DatabaseError> {
        self.store.get(id).await
    }

    /// Whether `message_id` already has an activity record.
    pub async fn contains_message(&self, message_id: &str) -> Result<bool, DatabaseError> {
        self.store.contains_message(message_id).await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<ActivityRecord>, DatabaseError> {
        self.store.recent(limit).await
    }
}
