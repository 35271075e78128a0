use sqlx::Row;
use tracing::info;

use crate::database::connection::DbPool;

pub const QUEUE_TABLE: &str = "attendance_queue";
pub const LEASE_TABLE: &str = "sync_lease";

// Diagnostics columns added after the first queue layout shipped; older
// stores are upgraded in place.
const DIAGNOSTIC_COLUMNS: &[(&str, &str)] = &[
    ("last_error", "TEXT NULL"),
    ("attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("rejections", "INTEGER NOT NULL DEFAULT 0"),
    ("retryable", "INTEGER NOT NULL DEFAULT 1"),
];

/// Creates the queue table if needed and adds any missing diagnostics columns.
pub async fn ensure_queue_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attendance_queue (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id TEXT NOT NULL CHECK (length(trim(worker_id)) > 0),
            project_id TEXT NOT NULL CHECK (length(trim(project_id)) > 0),
            attendance_date TEXT NOT NULL,
            present INTEGER NOT NULL,
            sync_state TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_state IN ('pending', 'in_flight', 'failed')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info(?1)")
        .bind(QUEUE_TABLE)
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()?;

    for (column, definition) in DIAGNOSTIC_COLUMNS {
        if !existing.iter().any(|name| name == column) {
            info!(column, "adding missing queue column");
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                QUEUE_TABLE, column, definition
            ))
            .execute(pool)
            .await?;
        }
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_attendance_queue_state ON attendance_queue(sync_state)",
    )
    .execute(pool)
    .await?;

    // One row at most: the process currently allowed to run sync cycles.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_lease (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
