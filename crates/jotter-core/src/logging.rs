//! Structured logging field name constants for jotter.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query by the same keys across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data (fanout deliveries) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Persisted request UUID.
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "api", "db", "jobs", "hub", "ratelimit"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "worker", "pg_queue", "memory_queue", "redis_counters"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "claim_next", "cancel", "admit"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Space UUID scoping a request.
pub const SPACE_ID: &str = "space_id";

/// Derived job key (`space_id:request_id`).
pub const JOB_KEY: &str = "job_key";

/// Request type (INPUT/SEARCH/REFACTOR).
pub const REQUEST_TYPE: &str = "request_type";

/// Notification topic.
pub const TOPIC: &str = "topic";

/// WebSocket connection id.
pub const CONNECTION_ID: &str = "connection_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number of a job execution (1-based).
pub const ATTEMPT: &str = "attempt";

/// Queue position reported to the caller.
pub const POSITION: &str = "position";

/// Number of connections an event was delivered to.
pub const DELIVERED: &str = "delivered";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
