//! Domain models for the jotter request pipeline.
//!
//! A [`Request`] is the persisted record of one unit of user work; a [`Job`]
//! is the queue's execution unit for it. Both are plain data: storage
//! backends in `jotter-db` own persistence, `jotter-jobs` owns execution.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Kind of work a request asks for.
///
/// Closed set: every consumer dispatches with an exhaustive `match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Ingest free text into notes.
    Input,
    /// Search the space's notes.
    Search,
    /// Reorganize existing notes.
    Refactor,
}

impl RequestType {
    pub const ALL: [RequestType; 3] = [RequestType::Input, RequestType::Search, RequestType::Refactor];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Input => "INPUT",
            RequestType::Search => "SEARCH",
            RequestType::Refactor => "REFACTOR",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INPUT" => Ok(RequestType::Input),
            "SEARCH" => Ok(RequestType::Search),
            "REFACTOR" => Ok(RequestType::Refactor),
            other => Err(Error::InvalidInput(format!("unknown request type: {other}"))),
        }
    }
}

/// Lifecycle status of a persisted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    /// Whether the status is an end state of the request state machine.
    ///
    /// `Failed` counts as terminal even though a queue retry can reopen it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// Transition table shared by every storage backend.
    ///
    /// `Failed -> Processing` is the retry edge: the request is marked
    /// failed on the first processing error while the job itself may still
    /// be retried by the queue.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RequestStatus::Pending),
            "PROCESSING" => Ok(RequestStatus::Processing),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            "CANCELLED" => Ok(RequestStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown request status: {other}"))),
        }
    }
}

/// A persisted unit of user work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: Uuid,
    pub space_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub input: String,
    pub status: RequestStatus,
    pub position: Option<i64>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied by the caller when admitting a new request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub space_id: Uuid,
    pub user_id: Uuid,
    pub request_type: RequestType,
    pub input: String,
}

/// A request together with its owner's login id (used for `user:` topics).
#[derive(Debug, Clone)]
pub struct RequestWithOwner {
    pub request: Request,
    pub owner_login: String,
}

/// Structured result returned by the processing collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_created: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folders_created: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Queue-level state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Waiting for its backoff delay to elapse before it can be claimed.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Waiting or delayed: counted for positions and cancellable.
    pub fn is_queued(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::Job(format!("unknown job state: {other}"))),
        }
    }
}

/// Stable job identity derived from `(space_id, request_id)`.
///
/// Two enqueues of the same pair produce the same key and collapse into one
/// job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(space_id: Uuid, request_id: Uuid) -> Self {
        Self(format!("{space_id}:{request_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload carried by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub request_id: Uuid,
    pub space_id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
}

impl JobPayload {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.space_id, self.request_id)
    }
}

impl From<&Request> for JobPayload {
    fn from(request: &Request) -> Self {
        Self {
            request_id: request.id,
            space_id: request.space_id,
            request_type: request.request_type,
        }
    }
}

/// A job as stored by a queue backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub key: JobKey,
    pub payload: JobPayload,
    pub state: JobState,
    /// Attempts started so far, including the current one when active.
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Arrival sequence; defines FIFO order within and across spaces.
    pub seq: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Attempt limit and exponential backoff applied to failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(defaults::JOB_BACKOFF_BASE_MS),
        }
    }
}

impl RetryPolicy {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_MAX_ATTEMPTS` | `3` | Attempts before a job fails for good |
    /// | `JOB_BACKOFF_BASE_MS` | `1000` | First retry delay, doubled per retry |
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
            .max(1);

        let backoff_ms = std::env::var("JOB_BACKOFF_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_BACKOFF_BASE_MS);

        Self {
            max_attempts,
            backoff_base: Duration::from_millis(backoff_ms),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    ///
    /// 1 → base, 2 → 2×base, 3 → 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was moved to `delayed` and will run again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The job reached `failed` and will not run again.
    Exhausted { attempts: u32 },
}

impl FailOutcome {
    pub fn will_retry(&self) -> bool {
        matches!(self, FailOutcome::Retrying { .. })
    }
}

/// Global queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting plus delayed jobs.
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Queue snapshot for one space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceQueueStatus {
    pub waiting: i64,
    pub processing: i64,
}

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Operation classes with independent rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitOperation {
    Input,
    Search,
    Refactor,
}

impl RateLimitOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitOperation::Input => "input",
            RateLimitOperation::Search => "search",
            RateLimitOperation::Refactor => "refactor",
        }
    }
}

impl From<RequestType> for RateLimitOperation {
    fn from(request_type: RequestType) -> Self {
        match request_type {
            RequestType::Input => RateLimitOperation::Input,
            RequestType::Search => RateLimitOperation::Search,
            RequestType::Refactor => RateLimitOperation::Refactor,
        }
    }
}

/// Who a rate limit counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Authenticated session user.
    User(Uuid),
    /// Caller-supplied id on unauthenticated quick-submission routes.
    Submitter(String),
}

impl Identity {
    /// Counter key segment, e.g. `user:<uuid>` or `anon:<id>`.
    pub fn key_segment(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{id}"),
            Identity::Submitter(id) => format!("anon:{id}"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Identity::User(id) => id.is_nil(),
            Identity::Submitter(id) => id.trim().is_empty(),
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds at which the current window ends.
    pub reset_at: i64,
    /// Seconds until the window ends (0 when admitted on a fresh window
    /// without a store answer).
    pub retry_after_secs: u64,
}
