//! In-process storage backends.
//!
//! Used by tests and by single-process deployments (`STORAGE_BACKEND=memory`).
//! Semantics match the PostgreSQL and Redis backends; nothing survives a
//! restart.

mod counters;
mod jobs;
mod requests;

pub use counters::MemoryCounterStore;
pub use jobs::MemoryJobQueue;
pub use requests::MemoryRequestRepository;
