use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::connection::{connect_local_store, DbPool};
use crate::database::schema::ensure_queue_schema;
use crate::error::{StoreError, SubmitError};
use crate::models::{AttendanceRecord, LocalId, NewAttendance, SyncState};

const DEFAULT_MAX_REJECTIONS: u32 = 3;
// Renewed before every submission unit, so it only has to outlive one unit.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);
const INTERRUPTED_ERROR: &str = "interrupted before the server acknowledged it";

const SELECT_RECORD: &str = "SELECT local_id, worker_id, project_id, attendance_date, present, \
     sync_state, retryable, last_error, attempts, rejections, created_at \
     FROM attendance_queue";

/// Per-state totals, used for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.failed + self.rejected
    }
}

/// Durable queue of attendance records the server has not yet acknowledged.
///
/// Every mutation is committed before the call returns. State changes are
/// guarded in SQL (`WHERE sync_state = ...`) so an illegal transition is
/// reported instead of applied.
///
/// Several processes may open the same file (the `record` command next to a
/// running `run`). Only the holder of the cycle lease may submit or recover
/// `in_flight` records.
#[derive(Clone)]
pub struct LocalStore {
    pool: DbPool,
    max_rejections: u32,
    holder: Arc<str>,
    lease_ttl: Duration,
}

impl LocalStore {
    /// Opens (or creates) the store. Records left `in_flight` are untouched
    /// here; the next lease holder recovers them.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = connect_local_store(database_url).await?;
        ensure_queue_schema(&pool).await?;

        Ok(Self {
            pool,
            max_rejections: DEFAULT_MAX_REJECTIONS,
            holder: new_holder_id(),
            lease_ttl: DEFAULT_LEASE_TTL,
        })
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Number of 4xx rejections after which a record stops being retried.
    pub fn with_max_rejections(mut self, max_rejections: u32) -> Self {
        self.max_rejections = max_rejections.max(1);
        self
    }

    pub fn max_rejections(&self) -> u32 {
        self.max_rejections
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Validates and persists a new record as `Pending`.
    pub async fn append(&self, record: &NewAttendance) -> Result<LocalId, StoreError> {
        record.validate()?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO attendance_queue (
                worker_id, project_id, attendance_date, present,
                sync_state, retryable, attempts, rejections, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 1, 0, 0, ?5, ?5)
            "#,
        )
        .bind(&record.worker_id)
        .bind(&record.project_id)
        .bind(record.date)
        .bind(record.present)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let local_id = LocalId(result.last_insert_rowid());
        debug!(
            %local_id,
            worker = %record.worker_id,
            project = %record.project_id,
            "record queued"
        );
        Ok(local_id)
    }

    pub async fn get(&self, local_id: LocalId) -> Result<Option<AttendanceRecord>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE local_id = ?1", SELECT_RECORD))
            .bind(local_id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    /// Every record not yet acknowledged, in creation order.
    pub async fn list_pending(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!("{} ORDER BY local_id", SELECT_RECORD);
        let records: Vec<AttendanceRecord> = sqlx::query(&sql)
            .fetch(&self.pool)
            .map(|row| row.and_then(|row| record_from_row(&row)))
            .try_collect()
            .await?;
        Ok(records)
    }

    /// Records that exhausted their rejection budget and wait for a human.
    pub async fn list_rejected(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "{} WHERE sync_state = 'failed' AND retryable = 0 ORDER BY local_id",
            SELECT_RECORD
        );
        let records: Vec<AttendanceRecord> = sqlx::query(&sql)
            .fetch(&self.pool)
            .map(|row| row.and_then(|row| record_from_row(&row)))
            .try_collect()
            .await?;
        Ok(records)
    }

    pub async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN sync_state = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN sync_state = 'in_flight' THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN sync_state = 'failed' AND retryable = 1
                    THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN sync_state = 'failed' AND retryable = 0
                    THEN 1 ELSE 0 END), 0) AS rejected
            FROM attendance_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueCounts {
            pending: row.try_get::<i64, _>("pending")? as u64,
            in_flight: row.try_get::<i64, _>("in_flight")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            rejected: row.try_get::<i64, _>("rejected")? as u64,
        })
    }

    /// Records the server has not acknowledged yet, whatever their state.
    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attendance_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Pending -> InFlight for a whole submission unit. All or nothing.
    pub async fn mark_in_flight(&self, local_ids: &[LocalId]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for &local_id in local_ids {
            let updated = sqlx::query(
                r#"
                UPDATE attendance_queue
                SET sync_state = 'in_flight', attempts = attempts + 1, updated_at = ?2
                WHERE local_id = ?1 AND sync_state = 'pending'
                "#,
            )
            .bind(local_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                let current = current_state(&mut *tx, local_id).await?;
                tx.rollback().await?;
                return Err(match current {
                    Some(from) => StoreError::InvalidTransition {
                        local_id,
                        from,
                        to: "in_flight",
                    },
                    None => StoreError::NotFound(local_id),
                });
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Removes an acknowledged record. Already-absent records are not an error,
    /// so a repeated acknowledgment is harmless.
    pub async fn mark_synced(&self, local_id: LocalId) -> Result<(), StoreError> {
        let deleted = sqlx::query(
            "DELETE FROM attendance_queue WHERE local_id = ?1 AND sync_state = 'in_flight'",
        )
        .bind(local_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            if let Some(from) = current_state(&self.pool, local_id).await? {
                return Err(StoreError::InvalidTransition {
                    local_id,
                    from,
                    to: "synced",
                });
            }
        }
        Ok(())
    }

    /// InFlight -> Failed. Rejections count towards the retry cap; once it is
    /// reached the record is kept but no longer retried.
    pub async fn mark_failed(
        &self,
        local_id: LocalId,
        error: &SubmitError,
    ) -> Result<SyncState, StoreError> {
        let rejection = i64::from(error.is_rejection());

        let row = sqlx::query(
            r#"
            UPDATE attendance_queue
            SET sync_state = 'failed',
                last_error = ?2,
                rejections = rejections + ?3,
                retryable = CASE WHEN rejections + ?3 >= ?4 THEN 0 ELSE 1 END,
                updated_at = ?5
            WHERE local_id = ?1 AND sync_state = 'in_flight'
            RETURNING last_error, retryable
            "#,
        )
        .bind(local_id.0)
        .bind(error.to_string())
        .bind(rejection)
        .bind(i64::from(self.max_rejections))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(SyncState::Failed {
                last_error: row.try_get::<Option<String>, _>("last_error")?.unwrap_or_default(),
                retryable: row.try_get::<i64, _>("retryable")? != 0,
            }),
            None => Err(match current_state(&self.pool, local_id).await? {
                Some(from) => StoreError::InvalidTransition {
                    local_id,
                    from,
                    to: "failed",
                },
                None => StoreError::NotFound(local_id),
            }),
        }
    }

    /// Claims (or renews) the right to run sync cycles against this file.
    /// Returns false while another store holds an unexpired lease.
    pub async fn try_acquire_cycle_lease(&self) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let ttl = i64::try_from(self.lease_ttl.as_millis()).unwrap_or(i64::MAX);
        let claimed = sqlx::query(
            r#"
            INSERT INTO sync_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE sync_lease.holder = excluded.holder OR sync_lease.expires_at <= ?3
            "#,
        )
        .bind(&*self.holder)
        .bind(now.saturating_add(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 {
            debug!("cycle lease held by another process");
        }
        Ok(claimed > 0)
    }

    pub async fn release_cycle_lease(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_lease WHERE id = 1 AND holder = ?1")
            .bind(&*self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Failed (retryable) -> Pending for every eligible record.
    pub async fn rearm_failed(&self) -> Result<u64, StoreError> {
        let rearmed = sqlx::query(
            r#"
            UPDATE attendance_queue
            SET sync_state = 'pending', updated_at = ?1
            WHERE sync_state = 'failed' AND retryable = 1
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rearmed)
    }

    /// InFlight -> Failed (retryable) for records whose submission never
    /// finished. A no-op unless this store holds the cycle lease, so a
    /// second process cannot steal records from a running cycle.
    pub async fn recover_interrupted(&self) -> Result<u64, StoreError> {
        let recovered = sqlx::query(
            r#"
            UPDATE attendance_queue
            SET sync_state = 'failed', retryable = 1, last_error = ?1, updated_at = ?2
            WHERE sync_state = 'in_flight'
              AND EXISTS (SELECT 1 FROM sync_lease WHERE id = 1 AND holder = ?3)
            "#,
        )
        .bind(INTERRUPTED_ERROR)
        .bind(Utc::now())
        .bind(&*self.holder)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(recovered)
    }

    /// Manual resolution of a rejected record: clears its rejection count and
    /// puts it back in the queue.
    pub async fn requeue(&self, local_id: LocalId) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE attendance_queue
            SET sync_state = 'pending', retryable = 1, rejections = 0, updated_at = ?2
            WHERE local_id = ?1 AND sync_state = 'failed' AND retryable = 0
            "#,
        )
        .bind(local_id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(match self.get(local_id).await? {
                Some(record) => StoreError::InvalidTransition {
                    local_id,
                    from: record.sync_state.label(),
                    to: "pending",
                },
                None => StoreError::NotFound(local_id),
            });
        }
        info!(%local_id, "rejected record requeued");
        Ok(())
    }

    /// Deletes every record. Only for use after a confirmed full
    /// synchronization; the sync engine never calls this.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let removed = sqlx::query("DELETE FROM attendance_queue")
            .execute(&self.pool)
            .await?
            .rows_affected();
        warn!(removed, "local attendance queue cleared");
        Ok(removed)
    }
}

fn new_holder_id() -> Arc<str> {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", std::process::id(), Utc::now().timestamp_millis(), n).into()
}

async fn current_state<'e, E>(
    executor: E,
    local_id: LocalId,
) -> Result<Option<&'static str>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let state: Option<String> =
        sqlx::query_scalar("SELECT sync_state FROM attendance_queue WHERE local_id = ?1")
            .bind(local_id.0)
            .fetch_optional(executor)
            .await?;

    Ok(state.map(|state| match state.as_str() {
        "pending" => "pending",
        "in_flight" => "in_flight",
        _ => "failed",
    }))
}

fn record_from_row(row: &SqliteRow) -> Result<AttendanceRecord, sqlx::Error> {
    let state: String = row.try_get("sync_state")?;
    let sync_state = match state.as_str() {
        "pending" => SyncState::Pending,
        "in_flight" => SyncState::InFlight,
        "failed" => SyncState::Failed {
            last_error: row.try_get::<Option<String>, _>("last_error")?.unwrap_or_default(),
            retryable: row.try_get::<i64, _>("retryable")? != 0,
        },
        other => {
            return Err(sqlx::Error::Decode(
                format!("unknown sync_state {:?}", other).into(),
            ))
        }
    };

    Ok(AttendanceRecord {
        local_id: LocalId(row.try_get("local_id")?),
        worker_id: row.try_get("worker_id")?,
        project_id: row.try_get("project_id")?,
        date: row.try_get("attendance_date")?,
        present: row.try_get::<i64, _>("present")? != 0,
        sync_state,
        created_at: row.try_get("created_at")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        rejections: row.try_get::<i64, _>("rejections")? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    async fn open_store() -> (LocalStore, TempDir, String) {
        let temp_dir = TempDir::new().unwrap();
        let db_url = format!("sqlite://{}", temp_dir.path().join("queue.db").display());
        let store = LocalStore::open(&db_url).await.unwrap();
        (store, temp_dir, db_url)
    }

    fn attendance(worker: &str) -> NewAttendance {
        NewAttendance::new(worker, "P1", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), true)
    }

    fn rejected() -> SubmitError {
        SubmitError::Rejected {
            status: 400,
            message: "bad payload".to_string(),
        }
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids_and_lists_in_order() {
        let (store, _dir, _) = open_store().await;

        let first = store.append(&attendance("W1")).await.unwrap();
        let second = store.append(&attendance("W2")).await.unwrap();
        let third = store.append(&attendance("W3")).await.unwrap();
        assert!(first < second && second < third);

        let pending = store.list_pending().await.unwrap();
        let workers: Vec<_> = pending.iter().map(|r| r.worker_id.as_str()).collect();
        assert_eq!(workers, vec!["W1", "W2", "W3"]);
        assert!(pending.iter().all(|r| r.sync_state == SyncState::Pending));

        // Stable across calls.
        assert_eq!(store.list_pending().await.unwrap(), pending);
    }

    #[tokio::test]
    async fn append_rejects_invalid_records() {
        let (store, _dir, _) = open_store().await;
        let blank = attendance("   ");

        assert!(matches!(store.append(&blank).await, Err(StoreError::Invalid(_))));
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_removal() {
        let (store, _dir, _) = open_store().await;
        let first = store.append(&attendance("W1")).await.unwrap();
        store.mark_in_flight(&[first]).await.unwrap();
        store.mark_synced(first).await.unwrap();

        let second = store.append(&attendance("W1")).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let (store, _dir, db_url) = open_store().await;
        let id = store.append(&attendance("W1")).await.unwrap();
        let before = store.get(id).await.unwrap().unwrap();
        store.close().await;
        drop(store);

        let reopened = LocalStore::open(&db_url).await.unwrap();
        assert_eq!(reopened.list_pending().await.unwrap(), vec![before]);
    }

    #[tokio::test]
    async fn lease_holder_recovers_interrupted_submissions() {
        let (store, _dir, db_url) = open_store().await;
        let id = store.append(&attendance("W1")).await.unwrap();
        store.mark_in_flight(&[id]).await.unwrap();
        store.close().await;
        drop(store);

        // Opening alone never touches in-flight rows.
        let reopened = LocalStore::open(&db_url).await.unwrap();
        assert_eq!(
            reopened.get(id).await.unwrap().unwrap().sync_state,
            SyncState::InFlight
        );
        assert_eq!(reopened.recover_interrupted().await.unwrap(), 0);

        assert!(reopened.try_acquire_cycle_lease().await.unwrap());
        assert_eq!(reopened.recover_interrupted().await.unwrap(), 1);
        let record = reopened.get(id).await.unwrap().unwrap();
        assert!(matches!(
            record.sync_state,
            SyncState::Failed { retryable: true, .. }
        ));
        assert_eq!(reopened.rearm_failed().await.unwrap(), 1);
        assert_eq!(
            reopened.get(id).await.unwrap().unwrap().sync_state,
            SyncState::Pending
        );
    }

    #[tokio::test]
    async fn second_store_leaves_running_cycle_alone() {
        let (cycle_owner, _dir, db_url) = open_store().await;
        let w1 = cycle_owner.append(&attendance("W1")).await.unwrap();
        assert!(cycle_owner.try_acquire_cycle_lease().await.unwrap());
        cycle_owner.mark_in_flight(&[w1]).await.unwrap();

        let other = LocalStore::open(&db_url).await.unwrap();
        let w2 = other.append(&attendance("W2")).await.unwrap();
        assert!(!other.try_acquire_cycle_lease().await.unwrap());
        assert_eq!(other.recover_interrupted().await.unwrap(), 0);
        assert_eq!(
            cycle_owner.get(w1).await.unwrap().unwrap().sync_state,
            SyncState::InFlight
        );

        // The server's acknowledgment still settles the record.
        cycle_owner.mark_synced(w1).await.unwrap();
        assert!(cycle_owner.get(w1).await.unwrap().is_none());
        let pending = cycle_owner.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, w2);

        cycle_owner.release_cycle_lease().await.unwrap();
        assert!(other.try_acquire_cycle_lease().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (store, _dir, db_url) = open_store().await;
        let crashed = store.with_lease_ttl(Duration::ZERO);
        assert!(crashed.try_acquire_cycle_lease().await.unwrap());

        let successor = LocalStore::open(&db_url).await.unwrap();
        assert!(successor.try_acquire_cycle_lease().await.unwrap());
        // Renewal by the current holder always succeeds.
        assert!(successor.try_acquire_cycle_lease().await.unwrap());
        assert!(!crashed
            .clone()
            .with_lease_ttl(DEFAULT_LEASE_TTL)
            .try_acquire_cycle_lease()
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_nothing_is_queued() {
        let (store, _dir, db_url) = open_store().await;
        store.close().await;

        let result = store.append(&attendance("W1")).await;
        assert!(matches!(result, Err(StoreError::Persistence(_))));

        let reopened = LocalStore::open(&db_url).await.unwrap();
        assert!(reopened.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let (store, _dir, _) = open_store().await;
        let id = store.append(&attendance("W1")).await.unwrap();
        store.mark_in_flight(&[id]).await.unwrap();

        store.mark_synced(id).await.unwrap();
        store.mark_synced(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn illegal_transitions_are_refused() {
        let (store, _dir, _) = open_store().await;
        let id = store.append(&attendance("W1")).await.unwrap();

        assert!(matches!(
            store.mark_synced(id).await,
            Err(StoreError::InvalidTransition { from: "pending", .. })
        ));
        assert!(matches!(
            store.mark_failed(id, &rejected()).await,
            Err(StoreError::InvalidTransition { from: "pending", .. })
        ));
        assert!(matches!(
            store.mark_in_flight(&[LocalId(999)]).await,
            Err(StoreError::NotFound(LocalId(999)))
        ));

        store.mark_in_flight(&[id]).await.unwrap();
        assert!(matches!(
            store.mark_in_flight(&[id]).await,
            Err(StoreError::InvalidTransition { from: "in_flight", .. })
        ));
    }

    #[tokio::test]
    async fn mark_in_flight_is_all_or_nothing() {
        let (store, _dir, _) = open_store().await;
        let first = store.append(&attendance("W1")).await.unwrap();
        let second = store.append(&attendance("W2")).await.unwrap();
        store.mark_in_flight(&[second]).await.unwrap();

        assert!(store.mark_in_flight(&[first, second]).await.is_err());
        assert_eq!(
            store.get(first).await.unwrap().unwrap().sync_state,
            SyncState::Pending
        );
    }

    #[tokio::test]
    async fn rejections_are_capped() {
        let (store, _dir, _) = open_store().await;
        let store = store.with_max_rejections(2);
        let id = store.append(&attendance("W1")).await.unwrap();

        store.mark_in_flight(&[id]).await.unwrap();
        let state = store.mark_failed(id, &rejected()).await.unwrap();
        assert!(matches!(state, SyncState::Failed { retryable: true, .. }));

        store.rearm_failed().await.unwrap();
        store.mark_in_flight(&[id]).await.unwrap();
        let state = store.mark_failed(id, &rejected()).await.unwrap();
        assert!(matches!(state, SyncState::Failed { retryable: false, .. }));

        // Not re-armed, still stored, listed for a human.
        assert_eq!(store.rearm_failed().await.unwrap(), 0);
        let rejected_records = store.list_rejected().await.unwrap();
        assert_eq!(rejected_records.len(), 1);
        assert_eq!(rejected_records[0].rejections, 2);
        assert_eq!(rejected_records[0].attempts, 2);

        store.requeue(id).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.rejections, 0);
    }

    #[tokio::test]
    async fn transient_failures_never_exhaust_retries() {
        let (store, _dir, _) = open_store().await;
        let store = store.with_max_rejections(1);
        let id = store.append(&attendance("W1")).await.unwrap();

        for _ in 0..5 {
            store.mark_in_flight(&[id]).await.unwrap();
            let state = store
                .mark_failed(id, &SubmitError::Transient("HTTP 500".to_string()))
                .await
                .unwrap();
            assert!(state.is_retry_eligible());
            store.rearm_failed().await.unwrap();
        }
        assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 5);
    }

    #[tokio::test]
    async fn requeue_only_applies_to_rejected_records() {
        let (store, _dir, _) = open_store().await;
        let id = store.append(&attendance("W1")).await.unwrap();

        assert!(matches!(
            store.requeue(id).await,
            Err(StoreError::InvalidTransition { from: "pending", .. })
        ));
        assert!(matches!(
            store.requeue(LocalId(42)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn counts_and_clear() {
        let (store, _dir, _) = open_store().await;
        let store = store.with_max_rejections(1);
        let a = store.append(&attendance("W1")).await.unwrap();
        let b = store.append(&attendance("W2")).await.unwrap();
        store.append(&attendance("W3")).await.unwrap();

        store.mark_in_flight(&[a, b]).await.unwrap();
        store.mark_failed(a, &rejected()).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            QueueCounts {
                pending: 1,
                in_flight: 1,
                failed: 0,
                rejected: 1
            }
        );
        assert_eq!(counts.total(), 3);
        assert_eq!(store.pending_count().await.unwrap(), 3);

        assert_eq!(store.clear().await.unwrap(), 3);
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }
}
