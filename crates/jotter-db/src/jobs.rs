//! Durable job queue on PostgreSQL.
//!
//! Jobs live in the `jobs` table keyed by [`JobKey`]. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so several worker processes can share the
//! table; enqueue uses `ON CONFLICT DO NOTHING` so a duplicate key collapses
//! onto the existing row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jotter_core::{
    Error, FailOutcome, Job, JobKey, JobPayload, JobQueue, QueueStats, Result, RetryPolicy,
    SpaceQueueStatus,
};

const JOB_COLUMNS: &str = "job_key, request_id, space_id, request_type, state, attempts_made, \
     max_attempts, seq, enqueued_at, run_at, last_error";

/// PostgreSQL implementation of JobQueue.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
    policy: RetryPolicy,
    /// Wakes the local worker pool on enqueue.
    notify: Arc<Notify>,
}

impl PgJobQueue {
    pub fn new(pool: Pool<Postgres>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Retry policy stamped onto newly enqueued jobs.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn row_to_job(row: &PgRow) -> Result<Job> {
        let request_type: String = row.try_get("request_type")?;
        let state: String = row.try_get("state")?;
        let attempts_made: i32 = row.try_get("attempts_made")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let payload = JobPayload {
            request_id: row.try_get("request_id")?,
            space_id: row.try_get("space_id")?,
            request_type: request_type.parse()?,
        };
        Ok(Job {
            key: payload.key(),
            payload,
            state: state.parse()?,
            attempts_made: attempts_made.max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
            seq: row.try_get("seq")?,
            enqueued_at: row.try_get("enqueued_at")?,
            run_at: row.try_get("run_at")?,
            last_error: row.try_get("last_error")?,
        })
    }

    async fn waiting_in_space(&self, space_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE space_id = $1 AND state IN ('waiting', 'delayed')",
        )
        .bind(space_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<i64> {
        let key = payload.key();
        let result = sqlx::query(
            "INSERT INTO jobs (job_key, request_id, space_id, request_type, max_attempts, backoff_ms)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (job_key) DO NOTHING",
        )
        .bind(key.as_str())
        .bind(payload.request_id)
        .bind(payload.space_id)
        .bind(payload.request_type.as_str())
        .bind(self.policy.max_attempts as i32)
        .bind(self.policy.backoff_base.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            self.notify.notify_one();
            debug!(
                subsystem = "db",
                component = "pg_queue",
                op = "enqueue",
                job_key = %key,
                "Job enqueued"
            );
        } else {
            debug!(
                subsystem = "db",
                component = "pg_queue",
                op = "enqueue",
                job_key = %key,
                "Duplicate enqueue collapsed onto existing job"
            );
        }

        self.position(payload.request_id, payload.space_id).await
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs
             SET state = 'active', attempts_made = attempts_made + 1
             WHERE job_key = (
                 SELECT job_key FROM jobs
                 WHERE state IN ('waiting', 'delayed') AND run_at <= now()
                 ORDER BY seq
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn complete(&self, key: &JobKey) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'completed', finished_at = $1
             WHERE job_key = $2 AND state = 'active'",
        )
        .bind(Utc::now())
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!("no active job {key}")));
        }
        Ok(())
    }

    async fn fail(&self, key: &JobKey, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempts_made, max_attempts, backoff_ms FROM jobs
             WHERE job_key = $1 AND state = 'active'
             FOR UPDATE",
        )
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::Job(format!("no active job {key}")))?;

        let attempts_made: i32 = row.try_get("attempts_made")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let backoff_ms: i64 = row.try_get("backoff_ms")?;
        let attempts = attempts_made.max(0) as u32;
        let policy = RetryPolicy {
            max_attempts: max_attempts.max(1) as u32,
            backoff_base: Duration::from_millis(backoff_ms.max(0) as u64),
        };

        let outcome = if retryable && attempts < policy.max_attempts {
            let delay = policy.delay_for(attempts);
            let run_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| Error::Internal(format!("backoff out of range: {e}")))?;
            sqlx::query(
                "UPDATE jobs SET state = 'delayed', run_at = $1, last_error = $2
                 WHERE job_key = $3",
            )
            .bind(run_at)
            .bind(error)
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retrying {
                attempt: attempts,
                delay,
            }
        } else {
            sqlx::query(
                "UPDATE jobs SET state = 'failed', finished_at = $1, last_error = $2
                 WHERE job_key = $3",
            )
            .bind(Utc::now())
            .bind(error)
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Exhausted { attempts }
        };

        tx.commit().await?;

        match outcome {
            FailOutcome::Retrying { attempt, delay } => info!(
                subsystem = "db",
                component = "pg_queue",
                op = "fail",
                job_key = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Job scheduled for retry"
            ),
            FailOutcome::Exhausted { attempts } => warn!(
                subsystem = "db",
                component = "pg_queue",
                op = "fail",
                job_key = %key,
                attempts,
                retryable,
                "Job failed permanently"
            ),
        }
        Ok(outcome)
    }

    async fn cancel(&self, request_id: Uuid, space_id: Uuid) -> Result<bool> {
        let key = JobKey::new(space_id, request_id);
        let result = sqlx::query(
            "DELETE FROM jobs WHERE job_key = $1 AND state IN ('waiting', 'delayed')",
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn position(&self, request_id: Uuid, space_id: Uuid) -> Result<i64> {
        let key = JobKey::new(space_id, request_id);
        let rank: Option<i64> = sqlx::query_scalar(
            "SELECT rank FROM (
                 SELECT job_key, ROW_NUMBER() OVER (ORDER BY seq) AS rank
                 FROM jobs
                 WHERE space_id = $1 AND state IN ('waiting', 'delayed')
             ) ranked
             WHERE job_key = $2",
        )
        .bind(space_id)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match rank {
            Some(rank) => Ok(rank),
            None => Ok(self.waiting_in_space(space_id).await? + 1),
        }
    }

    async fn get(&self, key: &JobKey) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_key = $1");
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE state IN ('waiting', 'delayed')) AS waiting,
                 COUNT(*) FILTER (WHERE state = 'active') AS active,
                 COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                 COUNT(*) FILTER (WHERE state = 'failed') AS failed
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            waiting: row.try_get("waiting")?,
            active: row.try_get("active")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
        })
    }

    async fn space_status(&self, space_id: Uuid) -> Result<SpaceQueueStatus> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE state IN ('waiting', 'delayed')) AS waiting,
                 COUNT(*) FILTER (WHERE state = 'active') AS processing
             FROM jobs
             WHERE space_id = $1",
        )
        .bind(space_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(SpaceQueueStatus {
            waiting: row.try_get("waiting")?,
            processing: row.try_get("processing")?,
        })
    }

    fn wake_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
