//! Core traits for jotter abstractions.
//!
//! These traits define the storage seams of the pipeline. `jotter-db`
//! provides Postgres/Redis implementations and in-memory ones used by tests
//! and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// REQUEST REPOSITORY
// =============================================================================

/// Persistence for [`Request`] records.
///
/// Every `mark_*` method validates the change with
/// [`RequestStatus::can_transition_to`] and returns
/// `Error::InvalidTransition` when it is not allowed, or
/// `Error::RequestNotFound` when the record does not exist.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Persist a new request in `PENDING`.
    async fn insert(&self, new: NewRequest) -> Result<Request>;

    /// Get a request by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Request>>;

    /// Get a request together with its owner's login id.
    ///
    /// Owners without a recorded login resolve to their user id.
    async fn get_with_owner(&self, id: Uuid) -> Result<Option<RequestWithOwner>>;

    /// Record the login id of a request owner, as asserted by a verified
    /// credential. Used to resolve the `user:{login}` topic.
    async fn upsert_owner(&self, user_id: Uuid, login: &str) -> Result<()>;

    /// Record the queue rank reported at admission (or clear it).
    ///
    /// No-op once the request has left `PENDING`: a worker may claim the job
    /// before admission records its position.
    async fn set_position(&self, id: Uuid, position: Option<i64>) -> Result<()>;

    /// `PENDING|FAILED -> PROCESSING`; stamps `started_at`, clears `position`
    /// and any previous error.
    async fn mark_processing(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request>;

    /// `PROCESSING -> COMPLETED`; stores the serialized result.
    async fn mark_completed(&self, id: Uuid, result: JsonValue, at: DateTime<Utc>)
        -> Result<Request>;

    /// `PROCESSING -> FAILED`; stores the error message.
    async fn mark_failed(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<Request>;

    /// `PENDING -> CANCELLED`.
    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request>;
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable work queue with per-key identity and retry/backoff.
///
/// Job identity is [`JobKey::new`]`(space_id, request_id)`; enqueueing an
/// existing key is a no-op that reports the existing job's position.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job (idempotent per key) and return its 1-based position in
    /// its space.
    async fn enqueue(&self, payload: JobPayload) -> Result<i64>;

    /// Claim the oldest ready waiting/delayed job, moving it to `active`
    /// and counting the attempt.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Mark an active job completed.
    async fn complete(&self, key: &JobKey) -> Result<()>;

    /// Record a failed attempt. Retryable failures with attempts left move
    /// the job to `delayed` with exponential backoff; others fail it.
    async fn fail(&self, key: &JobKey, error: &str, retryable: bool) -> Result<FailOutcome>;

    /// Remove a waiting/delayed job. Returns `false` for active, finished or
    /// unknown jobs.
    async fn cancel(&self, request_id: Uuid, space_id: Uuid) -> Result<bool>;

    /// 1-based rank among the space's waiting/delayed jobs, or
    /// `waiting_in_space + 1` when the job is not queued.
    async fn position(&self, request_id: Uuid, space_id: Uuid) -> Result<i64>;

    /// Get a job by key.
    async fn get(&self, key: &JobKey) -> Result<Option<Job>>;

    /// Global counts.
    async fn stats(&self) -> Result<QueueStats>;

    /// Waiting and processing counts for one space.
    async fn space_status(&self, space_id: Uuid) -> Result<SpaceQueueStatus>;

    /// Notified whenever new work may be claimable.
    fn wake_handle(&self) -> Arc<Notify>;
}

// =============================================================================
// RATE LIMIT COUNTERS
// =============================================================================

/// Counter value and remaining window after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u64,
    /// Seconds until the counter expires.
    pub ttl_secs: u64,
}

/// Atomic fixed-window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, setting its expiry to `window_secs` when this is the
    /// first increment of the window.
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterSnapshot>;
}
