//! libSQL backend: async `ActivityStore` implementation.
//!
//! Supports local file and in-memory databases. The full record is stored
//! as a JSON column; the indexed columns beside it exist only for
//! filtering.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{ActivityRecord, RecordKind, TimeRange};
use crate::store::migrations;
use crate::store::traits::{ActivityFilter, ActivityStore};

/// Activity store over one reused libSQL connection.
pub struct LibSqlBackend {
    /// Owns the database the connection was opened from.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) the activity log at `path`, creating parent
    /// directories as needed.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| DatabaseError::Open(format!("create {}: {e}", dir.display())))?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("open {}: {e}", path.display())))?;
        let backend = Self::with_database(db).await?;
        info!(path = %path.display(), "Activity store opened");
        Ok(backend)
    }

    /// Throwaway store for tests and dry runs.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("open in-memory database: {e}")))?;
        Self::with_database(db).await
    }

    async fn with_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("connect: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self { _db: db, conn })
    }

    async fn collect_records(
        &self,
        mut rows: libsql::Rows,
        op: &str,
    ) -> Result<Vec<ActivityRecord>, DatabaseError> {
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(row_to_record(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so lexical order matches time order.
fn db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_record(row: &libsql::Row) -> Result<ActivityRecord, DatabaseError> {
    let json: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("activity row: {e}")))?;
    serde_json::from_str(&json)
        .map_err(|e| DatabaseError::Serialization(format!("activity record: {e}")))
}

#[async_trait]
impl ActivityStore for LibSqlBackend {
    async fn append(&self, record: &ActivityRecord) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(record)
            .map_err(|e| DatabaseError::Serialization(format!("activity record: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO activities (id, message_id, sender, subject, kind, confidence, record, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.message.id.clone(),
                    record.message.sender_address(),
                    record.message.subject.clone(),
                    record.kind.as_str(),
                    record.intent.confidence,
                    json,
                    db_timestamp(&record.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_activity: {e}")))?;

        debug!(id = %record.id, kind = record.kind.as_str(), "Activity appended");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ActivityRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT record FROM activities WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_activity: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_activity: {e}"))),
        }
    }

    async fn contains_message(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM activities WHERE message_id = ?1 LIMIT 1",
                params![message_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("contains_message: {e}")))?;

        rows.next()
            .await
            .map(|row| row.is_some())
            .map_err(|e| DatabaseError::Query(format!("contains_message: {e}")))
    }

    async fn query(
        &self,
        range: &TimeRange,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityRecord>, DatabaseError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let sender = filter.sender.as_ref().map(|s| s.to_lowercase());
        let rows = self
            .conn
            .query(
                "SELECT record FROM activities
                 WHERE created_at >= ?1 AND created_at < ?2
                   AND (?3 IS NULL OR kind = ?3)
                   AND (?4 IS NULL OR sender = ?4)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?5",
                params![
                    db_timestamp(&range.start()),
                    db_timestamp(&range.end()),
                    opt_text(filter.kind.map(|k| k.as_str())),
                    opt_text(sender.as_deref()),
                    limit,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query_activities: {e}")))?;

        self.collect_records(rows, "query_activities").await
    }

    async fn count_by_kind(
        &self,
        range: &TimeRange,
    ) -> Result<BTreeMap<RecordKind, u64>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, COUNT(*) FROM activities
                 WHERE created_at >= ?1 AND created_at < ?2
                 GROUP BY kind",
                params![db_timestamp(&range.start()), db_timestamp(&range.end())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_kind: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let kind: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_by_kind: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("count_by_kind: {e}")))?;
            let kind: RecordKind = kind.parse().map_err(DatabaseError::Serialization)?;
            counts.insert(kind, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ActivityRecord>, DatabaseError> {
        let rows = self
            .conn
            .query(
                "SELECT record FROM activities ORDER BY created_at DESC, id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_activities: {e}")))?;

        self.collect_records(rows, "recent_activities").await
    }
}
