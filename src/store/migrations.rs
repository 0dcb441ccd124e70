//! Schema versions for the activity log.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version; append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "activity_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                kind TEXT NOT NULL,
                confidence REAL NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activities_created_at ON activities(created_at);
            CREATE INDEX IF NOT EXISTS idx_activities_kind ON activities(kind);
            CREATE INDEX IF NOT EXISTS idx_activities_sender ON activities(sender);
        "#,
    },
    Migration {
        version: 2,
        name: "append_only_guards",
        sql: r#"
            CREATE TRIGGER IF NOT EXISTS activities_no_update
            BEFORE UPDATE ON activities
            BEGIN
                SELECT RAISE(ABORT, 'activities are append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS activities_no_delete
            BEFORE DELETE ON activities
            BEGIN
                SELECT RAISE(ABORT, 'activities are append-only');
            END;
        "#,
    },
    Migration {
        version: 3,
        name: "message_id_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_activities_message_id ON activities(message_id);
        "#,
    },
];

const CREATE_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_versions (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)";

/// Bring the schema up to the latest version. Each step runs in its own
/// transaction together with its version row.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(CREATE_VERSION_TABLE, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema_versions: {e}")))?;

    let from = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_versions (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // A failed statement can leave the transaction open.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} {} failed: {e}",
                step.version, step.name
            )));
        }
    }

    tracing::info!(from, to = current_version(conn).await?, "Schema migrated");
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Migration(format!("decode schema version: {e}")))
}
