//! # jotter-db
//!
//! Storage backends for the jotter request pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL request repository and durable job queue
//! - Redis fixed-window counters for rate limiting
//! - In-memory implementations of all three for tests and single-process runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use jotter_db::{Database, RequestRepository, NewRequest, RequestType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/jotter").await?;
//!
//!     let request = db.requests.insert(NewRequest {
//!         space_id: uuid::Uuid::new_v4(),
//!         user_id: uuid::Uuid::new_v4(),
//!         request_type: RequestType::Input,
//!         input: "buy milk".to_string(),
//!     }).await?;
//!
//!     println!("Created request: {}", request.id);
//!     Ok(())
//! }
//! ```
pub mod counters;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod requests;

// Re-export core types
pub use jotter_core::*;

pub use counters::RedisCounterStore;
pub use jobs::PgJobQueue;
pub use memory::{MemoryCounterStore, MemoryJobQueue, MemoryRequestRepository};
pub use pool::{create_pool, log_pool_metrics, PoolConfig};
pub use requests::PgRequestRepository;

/// Combined PostgreSQL context with the pipeline's repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Persisted requests.
    pub requests: PgRequestRepository,
    /// Durable job queue.
    pub jobs: PgJobQueue,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>, policy: RetryPolicy) -> Self {
        Self {
            requests: PgRequestRepository::new(pool.clone()),
            jobs: PgJobQueue::new(pool.clone(), policy),
            pool,
        }
    }

    /// Connect using pool and retry settings from the environment.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::from_env(), RetryPolicy::from_env()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(
        url: &str,
        config: PoolConfig,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool, policy))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
