//! Durable job queue on the `jobs` table.
//!
//! Reservation is a single `UPDATE ... RETURNING` on the writer connection,
//! so two workers can never claim the same job. Delays are expressed through
//! `run_at`; a job is due once `run_at <= now`.
//!
//! Every way back to `waiting` bumps either `attempts_made` (retry) or
//! `stalled_count` (stall sweep), so `(reserved_at, attempts_made,
//! stalled_count)` identifies one reservation. Settling matches on all
//! three.

use std::time::Duration;

use chrono::Utc;
use flowline_core::queue::{JobQueue, JobState, QueuedJob, STALLED_ERROR, StallSweep};
use flowline_types::error::QueueError;
use flowline_types::job::{JobOptions, QueueName};
use flowline_types::workflow::{Backoff, BackoffKind};
use serde_json::Value;
use sqlx::Row;

use super::format_datetime;
use super::pool::DatabasePool;

pub struct SqliteJobQueue {
    pool: DatabasePool,
}

impl SqliteJobQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn backend(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650))
}

struct JobRow {
    id: String,
    queue: String,
    payload: String,
    state: String,
    attempts_made: i64,
    stalled_count: i64,
    max_attempts: i64,
    backoff_kind: String,
    backoff_delay_ms: i64,
    last_error: Option<String>,
    reserved_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            attempts_made: row.try_get("attempts_made")?,
            stalled_count: row.try_get("stalled_count")?,
            max_attempts: row.try_get("max_attempts")?,
            backoff_kind: row.try_get("backoff_kind")?,
            backoff_delay_ms: row.try_get("backoff_delay_ms")?,
            last_error: row.try_get("last_error")?,
            reserved_at: row.try_get("reserved_at")?,
        })
    }

    fn into_job(self) -> Result<QueuedJob, QueueError> {
        let payload: Value = serde_json::from_str(&self.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let kind: BackoffKind = self.backoff_kind.parse().map_err(QueueError::Backend)?;
        let reserved_at = self
            .reserved_at
            .as_deref()
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(backend)
            })
            .transpose()?;

        Ok(QueuedJob {
            id: self.id,
            queue: self.queue.parse().map_err(QueueError::Backend)?,
            payload,
            attempts_made: self.attempts_made as u32,
            options: JobOptions {
                max_attempts: self.max_attempts as u32,
                backoff: Backoff {
                    kind,
                    delay_ms: self.backoff_delay_ms as u64,
                },
            },
            state: self.state.parse().map_err(QueueError::Backend)?,
            last_error: self.last_error,
            reserved_at,
            stalled_count: self.stalled_count as u32,
        })
    }
}

/// `WHERE` clause shared by every settle call.
const RESERVATION_MATCH: &str = "id = ? AND state = 'active' AND reserved_at = ? \
     AND attempts_made = ? AND stalled_count = ?";

impl SqliteJobQueue {
    /// Explain why a settle matched no row.
    async fn settle_miss(&self, job_id: &str) -> QueueError {
        match self.get(job_id).await {
            Ok(Some(_)) => QueueError::ReservationLost(job_id.to_string()),
            Ok(None) => QueueError::JobNotFound(job_id.to_string()),
            Err(e) => e,
        }
    }

    /// Run a settle `UPDATE` whose `SET` binds come first, then the
    /// reservation match.
    async fn settle<'q>(
        &self,
        job: &QueuedJob,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<(), QueueError> {
        let result = query
            .bind(job.id.clone())
            .bind(job.reserved_at.as_ref().map(format_datetime))
            .bind(job.attempts_made as i64)
            .bind(job.stalled_count as i64)
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(self.settle_miss(&job.id).await);
        }
        Ok(())
    }
}

impl JobQueue for SqliteJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: &Value,
        options: &JobOptions,
    ) -> Result<bool, QueueError> {
        let payload =
            serde_json::to_string(payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"INSERT INTO jobs
               (id, queue, payload, state, attempts_made, max_attempts,
                backoff_kind, backoff_delay_ms, run_at, created_at)
               VALUES (?, ?, ?, 'waiting', 0, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(job_id)
        .bind(queue.as_str())
        .bind(&payload)
        .bind(options.max_attempts as i64)
        .bind(options.backoff.kind.to_string())
        .bind(options.backoff.delay_ms as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reserve(&self, queue: QueueName) -> Result<Option<QueuedJob>, QueueError> {
        let now = format_datetime(&Utc::now());
        let row = sqlx::query(
            r#"UPDATE jobs SET state = 'active', reserved_at = ?
               WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue = ? AND state = 'waiting' AND run_at <= ?
                 ORDER BY run_at ASC, rowid ASC
                 LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(&now)
        .bind(queue.as_str())
        .bind(&now)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(backend)?;

        row.map(|row| JobRow::from_row(&row).map_err(backend)?.into_job())
            .transpose()
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let sql = format!("UPDATE jobs SET state = 'completed' WHERE {RESERVATION_MATCH}");
        self.settle(job, sqlx::query(&sql)).await
    }

    async fn retry(&self, job: &QueuedJob, delay: Duration, error: &str) -> Result<(), QueueError> {
        let run_at = format_datetime(&(Utc::now() + chrono_delay(delay)));
        let sql = format!(
            r#"UPDATE jobs SET
                 state = 'waiting',
                 attempts_made = attempts_made + 1,
                 last_error = ?,
                 run_at = ?,
                 reserved_at = NULL
               WHERE {RESERVATION_MATCH}"#
        );
        self.settle(job, sqlx::query(&sql).bind(error.to_string()).bind(run_at))
            .await
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError> {
        let sql = format!(
            r#"UPDATE jobs SET
                 state = 'failed',
                 attempts_made = attempts_made + 1,
                 last_error = ?
               WHERE {RESERVATION_MATCH}"#
        );
        self.settle(job, sqlx::query(&sql).bind(error.to_string())).await
    }

    async fn requeue_stalled(
        &self,
        queue: QueueName,
        older_than: Duration,
        max_stalls: u32,
    ) -> Result<StallSweep, QueueError> {
        let cutoff = format_datetime(&(Utc::now() - chrono_delay(older_than)));

        let failed_rows = sqlx::query(
            r#"UPDATE jobs SET state = 'failed', last_error = ?
               WHERE queue = ? AND state = 'active' AND reserved_at <= ?
                 AND stalled_count >= ?
               RETURNING *"#,
        )
        .bind(STALLED_ERROR)
        .bind(queue.as_str())
        .bind(&cutoff)
        .bind(max_stalls as i64)
        .fetch_all(&self.pool.writer)
        .await
        .map_err(backend)?;
        let failed = failed_rows
            .iter()
            .map(|row| JobRow::from_row(row).map_err(backend)?.into_job())
            .collect::<Result<Vec<_>, _>>()?;

        let result = sqlx::query(
            r#"UPDATE jobs SET
                 state = 'waiting',
                 reserved_at = NULL,
                 stalled_count = stalled_count + 1
               WHERE queue = ? AND state = 'active' AND reserved_at <= ?"#,
        )
        .bind(queue.as_str())
        .bind(&cutoff)
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        Ok(StallSweep {
            requeued: result.rows_affected(),
            failed,
        })
    }

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(backend)?;

        row.map(|row| JobRow::from_row(&row).map_err(backend)?.into_job())
            .transpose()
    }
}
