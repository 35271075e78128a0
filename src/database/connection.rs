use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub type DbPool = Pool<Sqlite>;

// Several writers may be queued behind an in-flight cycle; let them wait
// instead of failing with SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the local queue database, creating the file (and its directory) if missing.
///
/// WAL with `synchronous = FULL` means a committed append survives a crash
/// or power loss, not only a clean shutdown.
pub async fn connect_local_store(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    info!(database_url, "local attendance store connected");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_missing_database_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("queue.db");
        let db_url = format!("sqlite://{}", db_path.display());

        let pool = connect_local_store(&db_url).await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();

        assert!(db_path.exists());
        pool.close().await;
    }
}
