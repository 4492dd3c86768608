//! Postgres-backed retry store.
//!
//! Durable implementation of [`RetryStore`]: in-flight retries survive a
//! process restart, and several reconciler instances can share one table
//! (`claim_due` uses `FOR UPDATE SKIP LOCKED`). The schema lives in
//! `migrations/0001_create_retry_records.sql`.
//!
//! ## Error Mapping
//!
//! | Situation | StoreError |
//! |-----------|------------|
//! | Guarded `UPDATE` matched no row, row missing | `NotFound` |
//! | Guarded `UPDATE` matched no row, status not a valid predecessor | `InvalidTransition` |
//! | `increment_attempts` on a record with `attempts = max_attempts` | `AttemptBudgetExhausted` |
//! | Any SQLx error, undecodable row | `Storage` |
//!
//! ## Runtime
//!
//! The [`RetryStore`] trait is synchronous. Each call is driven to completion
//! on the Tokio runtime handle given at construction with `block_on`, so the
//! trait methods must be called from outside async code (e.g. the reconciler
//! thread or a blocking task). Async callers can use the inherent methods
//! directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use rebound_core::{AggregateId, EventId, OriginatorId};

use super::{RetryStore, StoreError};
use crate::clock::after;
use crate::record::{RetryRecord, RetryStatus};
use crate::stats::{RetryStats, StatsAccumulator};

const COLUMNS: &str = "event_id, event_type, aggregate_id, originator_id, attempts, max_attempts, \
     first_attempt_at, last_attempt_at, next_retry_at, last_error, status, metadata";

/// Postgres-backed retry store.
#[derive(Debug, Clone)]
pub struct PostgresRetryStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresRetryStore {
    /// Create a store that runs queries on `handle`.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create a store bound to the runtime of the calling context.
    pub fn from_current(pool: PgPool) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::Storage(
                "PostgresRetryStore requires a tokio runtime; construct it from within one"
                    .to_string(),
            )
        })?;
        Ok(Self::new(pool, handle))
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    #[instrument(skip(self, record), fields(event_id = %record.event_id), err)]
    pub async fn save(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let metadata = serde_json::to_value(&record.metadata)
            .map_err(|e| StoreError::Storage(format!("failed to encode metadata: {e}")))?;
        let allowed_from = status_names(&record.status.predecessors());

        let result = sqlx::query(
            r#"
            INSERT INTO retry_records (
                event_id, event_type, aggregate_id, originator_id,
                attempts, max_attempts, first_attempt_at, last_attempt_at,
                next_retry_at, last_error, status, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (event_id) DO UPDATE SET
                attempts = EXCLUDED.attempts,
                max_attempts = EXCLUDED.max_attempts,
                last_attempt_at = GREATEST(retry_records.last_attempt_at, EXCLUDED.last_attempt_at),
                next_retry_at = EXCLUDED.next_retry_at,
                last_error = EXCLUDED.last_error,
                status = EXCLUDED.status,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            WHERE retry_records.status = ANY($13)
            "#,
        )
        .bind(record.event_id.as_uuid())
        .bind(&record.event_type)
        .bind(record.aggregate_id.as_uuid())
        .bind(record.originator_id.map(uuid::Uuid::from))
        .bind(record.attempts as i32)
        .bind(record.max_attempts as i32)
        .bind(record.first_attempt_at)
        .bind(record.last_attempt_at)
        .bind(record.next_retry_at)
        .bind(&record.last_error)
        .bind(record.status.as_str())
        .bind(metadata)
        .bind(&allowed_from)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        if result.rows_affected() == 0 {
            let existing = self.find_by_event_id(record.event_id).await?;
            return Err(StoreError::InvalidTransition {
                event_id: record.event_id,
                from: existing.map_or(RetryStatus::Pending, |r| r.status),
                to: record.status,
            });
        }
        Ok(())
    }

    pub async fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Result<Option<RetryRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM retry_records WHERE event_id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_event_id", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn delete(&self, event_id: EventId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM retry_records WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM retry_records \
             WHERE status = 'retrying' AND next_retry_at <= $1 \
             ORDER BY next_retry_at ASC, event_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        let sql = format!(
            r#"
            WITH due AS (
                SELECT event_id AS claimed_id, next_retry_at AS due_at
                FROM retry_records
                WHERE status = 'retrying' AND next_retry_at <= $1
                ORDER BY next_retry_at ASC, event_id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE retry_records
            SET next_retry_at = $2, updated_at = NOW()
            FROM due
            WHERE retry_records.event_id = due.claimed_id
            RETURNING {COLUMNS}, due.due_at
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(after(now, lease))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_due", e))?;

        // RETURNING carries no order; restore the one the claim was made in.
        let claimed = rows
            .iter()
            .map(|row| -> Result<_, StoreError> {
                let due_at: DateTime<Utc> = row.try_get("due_at").map_err(decode_error)?;
                Ok((due_at, record_from_row(row)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(in_due_order(claimed))
    }

    #[instrument(skip(self, error), err)]
    pub async fn increment_attempts(
        &self,
        event_id: EventId,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        let sql = format!(
            r#"
            UPDATE retry_records
            SET attempts = attempts + 1,
                last_attempt_at = GREATEST(last_attempt_at, $2),
                last_error = COALESCE($3, last_error),
                status = CASE WHEN status = 'pending' THEN 'retrying' ELSE status END,
                updated_at = NOW()
            WHERE event_id = $1
              AND status IN ('pending', 'retrying')
              AND attempts < max_attempts
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .bind(at)
            .bind(error)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_attempts", e))?;

        if let Some(row) = row {
            return record_from_row(&row);
        }

        match self.find_by_event_id(event_id).await? {
            None => Err(StoreError::NotFound(event_id)),
            Some(existing) if existing.is_terminal() => Err(StoreError::InvalidTransition {
                event_id,
                from: existing.status,
                to: RetryStatus::Retrying,
            }),
            Some(existing) => Err(StoreError::AttemptBudgetExhausted {
                event_id,
                max_attempts: existing.max_attempts,
            }),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn update_status(
        &self,
        event_id: EventId,
        status: RetryStatus,
    ) -> Result<RetryRecord, StoreError> {
        let sql = format!(
            r#"
            UPDATE retry_records
            SET status = $2,
                next_retry_at = CASE WHEN $2 = 'retrying' THEN next_retry_at ELSE NULL END,
                updated_at = NOW()
            WHERE event_id = $1 AND status = ANY($3)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .bind(status.as_str())
            .bind(status_names(&status.predecessors()))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;

        if let Some(row) = row {
            return record_from_row(&row);
        }

        match self.find_by_event_id(event_id).await? {
            None => Err(StoreError::NotFound(event_id)),
            Some(existing) => Err(StoreError::InvalidTransition {
                event_id,
                from: existing.status,
                to: status,
            }),
        }
    }

    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM retry_records
            WHERE status IN ('succeeded', 'failed', 'dead_letter')
              AND last_attempt_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cleanup", e))?;

        Ok(result.rows_affected() as usize)
    }

    pub async fn get_statistics(&self) -> Result<RetryStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_type, status, COUNT(*) AS count, COALESCE(SUM(attempts), 0)::BIGINT AS attempts_sum
            FROM retry_records
            GROUP BY event_type, status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_statistics", e))?;

        let mut acc = StatsAccumulator::new();
        for row in rows {
            let event_type: String = row.try_get("event_type").map_err(decode_error)?;
            let status: String = row.try_get("status").map_err(decode_error)?;
            let count: i64 = row.try_get("count").map_err(decode_error)?;
            let attempts_sum: i64 = row.try_get("attempts_sum").map_err(decode_error)?;

            acc.add_group(
                &event_type,
                parse_status(&status)?,
                count.max(0) as u64,
                attempts_sum.max(0) as u64,
            );
        }
        Ok(acc.finish())
    }
}

impl RetryStore for PostgresRetryStore {
    fn save(&self, record: &RetryRecord) -> Result<(), StoreError> {
        self.block_on(PostgresRetryStore::save(self, record))
    }

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, StoreError> {
        self.block_on(PostgresRetryStore::find_by_event_id(self, event_id))
    }

    fn delete(&self, event_id: EventId) -> Result<bool, StoreError> {
        self.block_on(PostgresRetryStore::delete(self, event_id))
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        self.block_on(PostgresRetryStore::find_due(self, now))
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        self.block_on(PostgresRetryStore::claim_due(self, now, lease, limit))
    }

    fn increment_attempts(
        &self,
        event_id: EventId,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        self.block_on(PostgresRetryStore::increment_attempts(self, event_id, error, at))
    }

    fn update_status(
        &self,
        event_id: EventId,
        status: RetryStatus,
    ) -> Result<RetryRecord, StoreError> {
        self.block_on(PostgresRetryStore::update_status(self, event_id, status))
    }

    fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.block_on(PostgresRetryStore::cleanup(self, cutoff))
    }

    fn get_statistics(&self) -> Result<RetryStats, StoreError> {
        self.block_on(PostgresRetryStore::get_statistics(self))
    }
}

fn status_names(statuses: &[RetryStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn parse_status(raw: &str) -> Result<RetryStatus, StoreError> {
    RetryStatus::parse(raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown retry status in database: {raw}")))
}

fn record_from_row(row: &PgRow) -> Result<RetryRecord, StoreError> {
    let attempts: i32 = row.try_get("attempts").map_err(decode_error)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(decode_error)?;
    let originator_id: Option<uuid::Uuid> = row.try_get("originator_id").map_err(decode_error)?;

    Ok(RetryRecord {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(decode_error)?),
        event_type: row.try_get("event_type").map_err(decode_error)?,
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode_error)?),
        originator_id: originator_id.map(OriginatorId::from_uuid),
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        first_attempt_at: row.try_get("first_attempt_at").map_err(decode_error)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(decode_error)?,
        next_retry_at: row.try_get("next_retry_at").map_err(decode_error)?,
        last_error: row.try_get("last_error").map_err(decode_error)?,
        status: parse_status(&status)?,
        metadata: serde_json::from_value(metadata)
            .map_err(|e| StoreError::Storage(format!("failed to decode metadata: {e}")))?,
    })
}

/// Oldest due time first, event id breaking ties.
fn in_due_order(mut claimed: Vec<(DateTime<Utc>, RetryRecord)>) -> Vec<RetryRecord> {
    claimed.sort_by_key(|(due_at, record)| (*due_at, record.event_id));
    claimed.into_iter().map(|(_, record)| record).collect()
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to decode retry record row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
