//! Per-identity fixed-window admission limits.
//!
//! Each `(operation, identity)` pair has a counter keyed
//! `{prefix}:{operation}:{identity}` in a [`CounterStore`]. The first
//! increment of a window sets its expiry; once the count passes the
//! operation's maximum, calls are denied until the key expires.
//!
//! When the store fails, `fail_open` decides: admit and warn (default), or
//! return `Error::CounterStoreUnavailable`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use jotter_core::defaults;
use jotter_core::{
    CounterStore, Error, Identity, RateLimitDecision, RateLimitOperation, Result,
};

/// Limit for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs: window_secs.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub prefix: String,
    pub fail_open: bool,
    pub input: RateLimitRule,
    pub search: RateLimitRule,
    pub refactor: RateLimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            prefix: defaults::RATE_LIMIT_PREFIX.to_string(),
            fail_open: defaults::RATE_LIMIT_FAIL_OPEN,
            input: RateLimitRule::new(
                defaults::RATE_LIMIT_INPUT_MAX,
                defaults::RATE_LIMIT_WINDOW_SECS,
            ),
            search: RateLimitRule::new(
                defaults::RATE_LIMIT_SEARCH_MAX,
                defaults::RATE_LIMIT_WINDOW_SECS,
            ),
            refactor: RateLimitRule::new(
                defaults::RATE_LIMIT_REFACTOR_MAX,
                defaults::RATE_LIMIT_WINDOW_SECS,
            ),
        }
    }
}

impl RateLimitConfig {
    /// Load from environment.
    ///
    /// `RATE_LIMIT_PREFIX`, `RATE_LIMIT_FAIL_OPEN`, and
    /// `RATE_LIMIT_{INPUT,SEARCH,REFACTOR}_{MAX,WINDOW_SECS}`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let rule = |name: &str, fallback: RateLimitRule| {
            RateLimitRule::new(
                env_u64(&format!("RATE_LIMIT_{name}_MAX")).unwrap_or(fallback.max_requests),
                env_u64(&format!("RATE_LIMIT_{name}_WINDOW_SECS")).unwrap_or(fallback.window_secs),
            )
        };

        Self {
            prefix: std::env::var("RATE_LIMIT_PREFIX").unwrap_or(defaults.prefix),
            fail_open: std::env::var("RATE_LIMIT_FAIL_OPEN")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(defaults.fail_open),
            input: rule("INPUT", defaults.input),
            search: rule("SEARCH", defaults.search),
            refactor: rule("REFACTOR", defaults.refactor),
        }
    }

    pub fn rule(&self, operation: RateLimitOperation) -> RateLimitRule {
        match operation {
            RateLimitOperation::Input => self.input,
            RateLimitOperation::Search => self.search,
            RateLimitOperation::Refactor => self.refactor,
        }
    }

    pub fn with_rule(mut self, operation: RateLimitOperation, rule: RateLimitRule) -> Self {
        match operation {
            RateLimitOperation::Input => self.input = rule,
            RateLimitOperation::Search => self.search = rule,
            RateLimitOperation::Refactor => self.refactor = rule,
        }
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Fixed-window admission control keyed by operation and caller identity.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counter key for a pair.
    pub fn key(&self, identity: &Identity, operation: RateLimitOperation) -> String {
        format!(
            "{}:{}:{}",
            self.config.prefix,
            operation.as_str(),
            identity.key_segment()
        )
    }

    /// Count one call and decide whether it is admitted.
    ///
    /// A denial is a normal `Ok` decision with `allowed == false`; errors are
    /// reserved for invalid identities and, with fail-open disabled, store
    /// failures.
    pub async fn admit(
        &self,
        identity: &Identity,
        operation: RateLimitOperation,
    ) -> Result<RateLimitDecision> {
        if identity.is_empty() {
            return Err(Error::InvalidInput(
                "rate limit identity must not be empty".to_string(),
            ));
        }

        let rule = self.config.rule(operation);
        let key = self.key(identity, operation);
        let now = Utc::now().timestamp();

        match self.store.increment(&key, rule.window_secs).await {
            Ok(snapshot) => {
                let allowed = snapshot.count <= rule.max_requests;
                let decision = RateLimitDecision {
                    allowed,
                    limit: rule.max_requests,
                    remaining: rule.max_requests - snapshot.count.min(rule.max_requests),
                    reset_at: now + snapshot.ttl_secs as i64,
                    retry_after_secs: snapshot.ttl_secs,
                };
                if !allowed {
                    debug!(
                        subsystem = "rate_limit",
                        op = operation.as_str(),
                        key = %key,
                        count = snapshot.count,
                        retry_after = snapshot.ttl_secs,
                        "Admission denied"
                    );
                }
                Ok(decision)
            }
            Err(e) if self.config.fail_open => {
                warn!(
                    subsystem = "rate_limit",
                    op = operation.as_str(),
                    error = %e,
                    "Counter store unavailable, admitting"
                );
                Ok(RateLimitDecision {
                    allowed: true,
                    limit: rule.max_requests,
                    remaining: rule.max_requests,
                    reset_at: now + rule.window_secs as i64,
                    retry_after_secs: 0,
                })
            }
            Err(e) => {
                warn!(
                    subsystem = "rate_limit",
                    op = operation.as_str(),
                    error = %e,
                    "Counter store unavailable, rejecting"
                );
                Err(Error::CounterStoreUnavailable(e.to_string()))
            }
        }
    }
}
