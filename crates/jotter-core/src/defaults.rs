//! Centralized default constants for jotter.
//!
//! **This module is the single source of truth** for shared default values.
//! Config types read environment overrides and fall back to these.

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Interval between WebSocket pings in seconds.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

// =============================================================================
// NOTIFICATION HUB
// =============================================================================

/// Per-connection outbound buffer. A full buffer drops events for that
/// connection only.
pub const HUB_CHANNEL_CAPACITY: usize = 64;

/// Worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Counter key prefix.
pub const RATE_LIMIT_PREFIX: &str = "ratelimit";

/// INPUT submissions per window.
pub const RATE_LIMIT_INPUT_MAX: u64 = 30;

/// SEARCH submissions per window.
pub const RATE_LIMIT_SEARCH_MAX: u64 = 60;

/// REFACTOR submissions per window.
pub const RATE_LIMIT_REFACTOR_MAX: u64 = 10;

/// Window length in seconds shared by all operations unless overridden.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Admit requests when the counter store is unreachable.
pub const RATE_LIMIT_FAIL_OPEN: bool = true;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Attempts per job, including the first.
pub const JOB_MAX_ATTEMPTS: u32 = 3;

/// First retry delay in milliseconds; doubled on each further retry.
pub const JOB_BACKOFF_BASE_MS: u64 = 1_000;

/// Maximum jobs processed concurrently across all spaces.
pub const JOB_MAX_CONCURRENT: usize = 20;

/// Maximum jobs claimed per second, smoothing bursts.
pub const JOB_DEQUEUE_PER_SECOND: u32 = 10;

/// Safety-net poll interval in milliseconds.
///
/// The worker is woken on enqueue and on retry scheduling; polling covers
/// delayed jobs becoming due and enqueues from other processes.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Terminal jobs retained per state by the in-memory queue.
pub const JOB_RETAIN_TERMINAL: usize = 1_000;

// =============================================================================
// PROCESSING COLLABORATOR
// =============================================================================

/// Default agent endpoint.
pub const AGENT_URL: &str = "http://127.0.0.1:8787";

/// HTTP timeout for one processing call in seconds.
pub const AGENT_TIMEOUT_SECS: u64 = 600;
