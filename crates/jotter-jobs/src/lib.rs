//! # jotter-jobs
//!
//! Background processing for jotter requests.
//!
//! This crate provides:
//! - A worker pool bounded by a concurrency cap and a claim rate
//! - Closed dispatch of requests to one processor per request type
//! - Progress and clarification events via the notification hub
//! - Retry handling delegated to the job queue's backoff policy
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jotter_jobs::{NoOpProcessor, ProcessorSet, WorkerBuilder, WorkerConfig};
//!
//! let worker = WorkerBuilder::new(queue, requests, hub)
//!     .with_config(WorkerConfig::default().with_max_concurrent(4))
//!     .with_processors(ProcessorSet::uniform(Arc::new(NoOpProcessor::new())))
//!     .build()?;
//!
//! // Start worker and get handle
//! let handle = worker.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod processor;
pub mod worker;

// Re-export core types
pub use jotter_core::*;

pub use processor::{
    AgentConfig, HttpProcessor, NoOpProcessor, ProcessContext, ProcessorSet, ProgressReporter,
    RequestProcessor,
};
pub use worker::{WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};
