//! Request repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use jotter_core::{
    Error, NewRequest, Request, RequestRepository, RequestStatus, RequestWithOwner, Result,
};

const REQUEST_COLUMNS: &str = "id, space_id, user_id, request_type, input, status, position, \
     result, error, created_at, started_at, completed_at";

/// PostgreSQL implementation of RequestRepository.
#[derive(Clone)]
pub struct PgRequestRepository {
    pool: Pool<Postgres>,
}

impl PgRequestRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn row_to_request(row: &PgRow) -> Result<Request> {
        let request_type: String = row.try_get("request_type")?;
        let status: String = row.try_get("status")?;
        Ok(Request {
            id: row.try_get("id")?,
            space_id: row.try_get("space_id")?,
            user_id: row.try_get("user_id")?,
            request_type: request_type.parse()?,
            input: row.try_get("input")?,
            status: status.parse()?,
            position: row.try_get("position")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    /// Lock the row and check that `to` is reachable from its current status.
    async fn lock_for_transition(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        to: RequestStatus,
    ) -> Result<()> {
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM requests WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;

        let from: RequestStatus = current.ok_or(Error::RequestNotFound(id))?.parse()?;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        Ok(())
    }

    async fn finish_transition(
        mut tx: Transaction<'_, Postgres>,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Request> {
        let row = query.fetch_one(&mut *tx).await?;
        let request = Self::row_to_request(&row)?;
        tx.commit().await?;
        Ok(request)
    }
}

#[async_trait]
impl RequestRepository for PgRequestRepository {
    async fn insert(&self, new: NewRequest) -> Result<Request> {
        let sql = format!(
            "INSERT INTO requests (id, space_id, user_id, request_type, input, status, created_at)
             VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(new.space_id)
            .bind(new.user_id)
            .bind(new.request_type.as_str())
            .bind(&new.input)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_request(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Request>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn get_with_owner(&self, id: Uuid) -> Result<Option<RequestWithOwner>> {
        let row = sqlx::query(
            "SELECT r.id, r.space_id, r.user_id, r.request_type, r.input, r.status, r.position,
                    r.result, r.error, r.created_at, r.started_at, r.completed_at,
                    COALESCE(u.login_id, r.user_id::text) AS login_id
             FROM requests r
             LEFT JOIN users u ON u.id = r.user_id
             WHERE r.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(RequestWithOwner {
                request: Self::row_to_request(&row)?,
                owner_login: row.try_get("login_id")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_owner(&self, user_id: Uuid, login: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, login_id) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET login_id = EXCLUDED.login_id
             WHERE users.login_id <> EXCLUDED.login_id",
        )
        .bind(user_id)
        .bind(login)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_position(&self, id: Uuid, position: Option<i64>) -> Result<()> {
        let result =
            sqlx::query("UPDATE requests SET position = $1 WHERE id = $2 AND status = 'PENDING'")
                .bind(position)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(Error::RequestNotFound(id));
            }
        }
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request> {
        let mut tx = self.pool.begin().await?;
        Self::lock_for_transition(&mut tx, id, RequestStatus::Processing).await?;

        let sql = format!(
            "UPDATE requests
             SET status = 'PROCESSING', started_at = $1, position = NULL,
                 error = NULL, completed_at = NULL
             WHERE id = $2
             RETURNING {REQUEST_COLUMNS}"
        );
        Self::finish_transition(tx, sqlx::query(&sql).bind(at).bind(id)).await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result: JsonValue,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        let mut tx = self.pool.begin().await?;
        Self::lock_for_transition(&mut tx, id, RequestStatus::Completed).await?;

        let sql = format!(
            "UPDATE requests
             SET status = 'COMPLETED', result = $1, completed_at = $2
             WHERE id = $3
             RETURNING {REQUEST_COLUMNS}"
        );
        Self::finish_transition(tx, sqlx::query(&sql).bind(result).bind(at).bind(id)).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<Request> {
        let mut tx = self.pool.begin().await?;
        Self::lock_for_transition(&mut tx, id, RequestStatus::Failed).await?;

        let sql = format!(
            "UPDATE requests
             SET status = 'FAILED', error = $1, completed_at = $2
             WHERE id = $3
             RETURNING {REQUEST_COLUMNS}"
        );
        Self::finish_transition(tx, sqlx::query(&sql).bind(error).bind(at).bind(id)).await
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request> {
        let mut tx = self.pool.begin().await?;
        Self::lock_for_transition(&mut tx, id, RequestStatus::Cancelled).await?;

        let sql = format!(
            "UPDATE requests
             SET status = 'CANCELLED', position = NULL, completed_at = $1
             WHERE id = $2
             RETURNING {REQUEST_COLUMNS}"
        );
        Self::finish_transition(tx, sqlx::query(&sql).bind(at).bind(id)).await
    }
}
