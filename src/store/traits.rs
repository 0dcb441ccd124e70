//! `ActivityStore` trait: the append-only audit log behind the recorder.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{ActivityRecord, RecordKind, TimeRange};

/// Optional narrowing for range queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ActivityFilter {
    #[serde(default)]
    pub kind: Option<RecordKind>,
    /// Bare sender address.
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ActivityFilter {
    pub fn kind(kind: RecordKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Backend-agnostic activity log. Records are only ever inserted.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Insert a new record. Fails if a record with the same id exists.
    async fn append(&self, record: &ActivityRecord) -> Result<(), DatabaseError>;

    /// Get a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<ActivityRecord>, DatabaseError>;

    /// Whether any record was written for the inbound message `message_id`.
    async fn contains_message(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Records created within `range`, oldest first.
    async fn query(
        &self,
        range: &TimeRange,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityRecord>, DatabaseError>;

    /// Number of records per kind within `range`. Kinds with no records are
    /// absent.
    async fn count_by_kind(
        &self,
        range: &TimeRange,
    ) -> Result<BTreeMap<RecordKind, u64>, DatabaseError>;

    /// The most recent records, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ActivityRecord>, DatabaseError>;
}
