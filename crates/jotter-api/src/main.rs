use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use jotter_api::error::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use jotter_api::services::{RateLimitConfig, RateLimiter, RequestLifecycle};
use jotter_api::{logging, router, AppState, ServerConfig, StorageBackend, TokenSigner};
use jotter_db::{
    CounterStore, Database, JobQueue, MemoryCounterStore, MemoryJobQueue,
    MemoryRequestRepository, NotificationHub, RedisCounterStore, RequestRepository, RetryPolicy,
};
use jotter_jobs::{AgentConfig, HttpProcessor, ProcessorSet, WorkerBuilder, WorkerConfig};

struct Backends {
    requests: Arc<dyn RequestRepository>,
    queue: Arc<dyn JobQueue>,
    counters: Arc<dyn CounterStore>,
}

async fn build_backends(config: &ServerConfig) -> anyhow::Result<Backends> {
    let counters: Arc<dyn CounterStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisCounterStore::connect(url).await?),
        None => {
            warn!("REDIS_URL not set, rate limit counters are per process");
            Arc::new(MemoryCounterStore::new())
        }
    };

    match config.storage {
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
            let db = Database::connect(url).await?;
            db.migrate().await?;
            info!("Database migrations applied");
            Ok(Backends {
                requests: Arc::new(db.requests.clone()),
                queue: Arc::new(db.jobs.clone()),
                counters,
            })
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; requests and jobs are lost on restart");
            Ok(Backends {
                requests: Arc::new(MemoryRequestRepository::new()),
                queue: Arc::new(MemoryJobQueue::new(RetryPolicy::from_env())),
                counters,
            })
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([
            X_RATELIMIT_LIMIT,
            X_RATELIMIT_REMAINING,
            X_RATELIMIT_RESET,
            header::RETRY_AFTER,
        ])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _log_guard = logging::init();

    let config = ServerConfig::from_env()?;
    info!(
        storage = ?config.storage,
        redis = config.redis_url.is_some(),
        "Configuration loaded"
    );

    let backends = build_backends(&config).await?;
    let hub = Arc::new(NotificationHub::new(config.hub_channel_capacity));

    let limiter = RateLimiter::new(backends.counters, RateLimitConfig::from_env());
    let lifecycle = Arc::new(RequestLifecycle::new(
        backends.requests.clone(),
        backends.queue.clone(),
        hub.clone(),
        limiter,
    ));

    // Start the worker pool
    let worker_config = WorkerConfig::from_env();
    let processor = Arc::new(HttpProcessor::new(AgentConfig::from_env())?);
    let worker_handle = WorkerBuilder::new(backends.queue, backends.requests, hub)
        .with_config(worker_config.clone())
        .with_processors(ProcessorSet::uniform(processor))
        .build()?
        .start();
    info!(
        enabled = worker_config.enabled,
        max_concurrent = worker_config.max_concurrent_jobs,
        "Worker pool started"
    );

    let state = AppState::new(lifecycle, Arc::new(TokenSigner::new(&config.auth_secret)));
    let app = router(state).layer(cors_layer(&config.allowed_origins));

    let addr = config.bind_addr();
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining worker pool");
    worker_handle.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
