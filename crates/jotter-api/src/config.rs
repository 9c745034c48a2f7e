//! Server configuration read from the environment.
//!
//! Environment variables:
//!   HOST                  - bind address (default: "0.0.0.0")
//!   PORT                  - bind port (default: 3000)
//!   STORAGE_BACKEND       - "postgres" or "memory" (default: "postgres")
//!   DATABASE_URL          - required for the postgres backend
//!   REDIS_URL             - rate limit counters; in-process counters when unset
//!   AUTH_SECRET           - HMAC key for signed credentials (required)
//!   HUB_CHANNEL_CAPACITY  - per-connection event buffer (default: 64)
//!   ALLOWED_ORIGINS       - comma-separated CORS origins (default: any)

use std::str::FromStr;

use jotter_core::defaults;
use jotter_core::{Error, Result};

/// Where requests, jobs and counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// PostgreSQL for requests and jobs, Redis (if configured) for counters.
    Postgres,
    /// Everything in process. Single node only; state is lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StorageBackend::Postgres),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            other => Err(Error::Config(format!("unknown STORAGE_BACKEND: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub auth_secret: String,
    pub hub_channel_capacity: usize,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let storage = match std::env::var("STORAGE_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => StorageBackend::Postgres,
        };
        let database_url = non_empty_var("DATABASE_URL");
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(Error::Config(
                "DATABASE_URL is required for the postgres backend".to_string(),
            ));
        }
        let auth_secret = non_empty_var("AUTH_SECRET")
            .ok_or_else(|| Error::Config("AUTH_SECRET must be set".to_string()))?;
        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT: {v}")))?,
            Err(_) => defaults::SERVER_PORT,
        };

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            storage,
            database_url,
            redis_url: non_empty_var("REDIS_URL"),
            auth_secret,
            hub_channel_capacity: std::env::var("HUB_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::HUB_CHANNEL_CAPACITY),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
