//! # jotter-core
//!
//! Core types, traits, and abstractions for the jotter request pipeline.
//!
//! This crate provides the data model (requests, jobs, rate limit
//! decisions), the storage traits implemented by `jotter-db`, and the
//! [`NotificationHub`] that fans job lifecycle events out to connected
//! clients.

pub mod defaults;
pub mod error;
pub mod hub;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use hub::{ConnectionId, HubEvent, NotificationHub, Topic};
pub use models::*;
pub use traits::*;
