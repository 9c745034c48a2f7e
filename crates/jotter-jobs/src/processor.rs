//! Request processors and the context handed to them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use jotter_core::hub::{QueueUpdate, RequestAskUser, RequestProgress};
use jotter_core::{
    defaults, Error, HubEvent, NotificationHub, ProcessingResult, RequestStatus, RequestType,
    Result, Topic,
};

/// Publishes intermediate progress of one request to its subscribers.
#[derive(Clone)]
pub struct ProgressReporter {
    hub: Arc<NotificationHub>,
    request_id: Uuid,
    space_id: Uuid,
    owner_login: String,
}

impl ProgressReporter {
    pub fn new(
        hub: Arc<NotificationHub>,
        request_id: Uuid,
        space_id: Uuid,
        owner_login: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            request_id,
            space_id,
            owner_login: owner_login.into(),
        }
    }

    /// Emit `request:progress` to the request topic. A percentage is also
    /// mirrored to the space's queue listeners.
    pub async fn report(&self, progress: RequestProgress) -> usize {
        let percent = progress.progress;
        let delivered = self
            .hub
            .emit(
                &Topic::Request(self.request_id),
                HubEvent::RequestProgress(RequestProgress {
                    request_id: self.request_id,
                    ..progress
                }),
            )
            .await;

        if let Some(percent) = percent {
            self.hub
                .emit(
                    &Topic::Queue(self.space_id),
                    HubEvent::QueueUpdate(QueueUpdate {
                        request_id: self.request_id,
                        space_id: self.space_id,
                        status: RequestStatus::Processing,
                        position: None,
                        progress: Some(percent.min(100)),
                    }),
                )
                .await;
        }
        delivered
    }

    /// Shorthand for a percentage with an optional message.
    pub async fn percent(&self, percent: u8, message: Option<&str>) -> usize {
        self.report(RequestProgress {
            progress: Some(percent),
            message: message.map(String::from),
            ..Default::default()
        })
        .await
    }

    /// Ask the owner a clarification question. Returns the question id the
    /// answer must reference; waiting for the answer, and giving up after
    /// `timeout`, is up to the processor.
    pub async fn ask_user(
        &self,
        question: impl Into<String>,
        options: Option<Vec<String>>,
        timeout: Duration,
    ) -> Uuid {
        let question_id = Uuid::new_v4();
        self.hub
            .emit_many(
                &[
                    Topic::Request(self.request_id),
                    Topic::User(self.owner_login.clone()),
                ],
                HubEvent::RequestAskUser(RequestAskUser {
                    request_id: self.request_id,
                    question_id,
                    question: question.into(),
                    options,
                    timeout_ms: timeout.as_millis() as u64,
                }),
            )
            .await;
        question_id
    }
}

/// Everything a processor needs to handle one attempt of a request.
pub struct ProcessContext {
    pub request_id: Uuid,
    pub space_id: Uuid,
    pub request_type: RequestType,
    pub input: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub progress: ProgressReporter,
}

/// External processing collaborator for one request type.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, ctx: ProcessContext) -> Result<ProcessingResult>;
}

/// One processor per request type.
#[derive(Clone)]
pub struct ProcessorSet {
    pub input: Arc<dyn RequestProcessor>,
    pub search: Arc<dyn RequestProcessor>,
    pub refactor: Arc<dyn RequestProcessor>,
}

impl ProcessorSet {
    pub fn new(
        input: Arc<dyn RequestProcessor>,
        search: Arc<dyn RequestProcessor>,
        refactor: Arc<dyn RequestProcessor>,
    ) -> Self {
        Self {
            input,
            search,
            refactor,
        }
    }

    /// Use the same processor for every request type.
    pub fn uniform(processor: Arc<dyn RequestProcessor>) -> Self {
        Self::new(processor.clone(), processor.clone(), processor)
    }

    pub fn for_type(&self, request_type: RequestType) -> &Arc<dyn RequestProcessor> {
        match request_type {
            RequestType::Input => &self.input,
            RequestType::Search => &self.search,
            RequestType::Refactor => &self.refactor,
        }
    }
}

/// No-op processor for testing.
#[derive(Debug, Default)]
pub struct NoOpProcessor;

impl NoOpProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestProcessor for NoOpProcessor {
    async fn process(&self, ctx: ProcessContext) -> Result<ProcessingResult> {
        ctx.progress.percent(50, Some("Processing...")).await;
        ctx.progress.percent(100, Some("Done")).await;
        Ok(ProcessingResult {
            summary: Some(format!("{} processed", ctx.request_type)),
            ..Default::default()
        })
    }
}

/// Configuration for the HTTP agent processor.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the agent service.
    pub url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: defaults::AGENT_URL.to_string(),
            timeout: Duration::from_secs(defaults::AGENT_TIMEOUT_SECS),
        }
    }
}

impl AgentConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `AGENT_URL` | `http://127.0.0.1:8787` | Agent base URL |
    /// | `AGENT_TIMEOUT_SECS` | `600` | Per-request timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let url = std::env::var("AGENT_URL").unwrap_or(defaults.url);
        let timeout = std::env::var("AGENT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        Self { url, timeout }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentRequest<'a> {
    request_id: Uuid,
    space_id: Uuid,
    #[serde(rename = "type")]
    request_type: RequestType,
    input: &'a str,
    attempt: u32,
}

/// Forwards requests to an HTTP agent service at `POST {url}/process`.
pub struct HttpProcessor {
    client: Client,
    config: AgentConfig,
}

impl HttpProcessor {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        info!(
            subsystem = "jobs",
            component = "http_processor",
            url = %config.url,
            timeout_secs = config.timeout.as_secs(),
            "Initializing agent processor"
        );
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RequestProcessor for HttpProcessor {
    async fn process(&self, ctx: ProcessContext) -> Result<ProcessingResult> {
        let start = Instant::now();
        ctx.progress.percent(0, Some("Sent to agent")).await;

        let body = AgentRequest {
            request_id: ctx.request_id,
            space_id: ctx.space_id,
            request_type: ctx.request_type,
            input: &ctx.input,
            attempt: ctx.attempt,
        };
        let response = self
            .client
            .post(format!("{}/process", self.config.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Agent request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Processing(format!("Agent returned {status}: {body}")));
        }

        let result: ProcessingResult = response
            .json()
            .await
            .map_err(|e| Error::Processing(format!("Failed to parse agent response: {e}")))?;

        debug!(
            subsystem = "jobs",
            component = "http_processor",
            request_id = %ctx.request_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Agent response received"
        );
        ctx.progress.percent(100, None).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(hub: Arc<NotificationHub>, request_type: RequestType) -> ProcessContext {
        let request_id = Uuid::new_v4();
        let space_id = Uuid::new_v4();
        ProcessContext {
            request_id,
            space_id,
            request_type,
            input: "buy milk".to_string(),
            attempt: 1,
            progress: ProgressReporter::new(hub, request_id, space_id, "alice"),
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl RequestProcessor for Fixed {
        async fn process(&self, _ctx: ProcessContext) -> Result<ProcessingResult> {
            Ok(ProcessingResult {
                summary: Some(self.0.to_string()),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_processor_set_dispatches_by_type() {
        let set = ProcessorSet::new(
            Arc::new(Fixed("input")),
            Arc::new(Fixed("search")),
            Arc::new(Fixed("refactor")),
        );
        let hub = Arc::new(NotificationHub::default());

        for (request_type, expected) in [
            (RequestType::Input, "input"),
            (RequestType::Search, "search"),
            (RequestType::Refactor, "refactor"),
        ] {
            let result = set
                .for_type(request_type)
                .process(context(hub.clone(), request_type))
                .await
                .unwrap();
            assert_eq!(result.summary.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_progress_reaches_request_and_queue_topics() {
        let hub = Arc::new(NotificationHub::default());
        let ctx = context(hub.clone(), RequestType::Input);

        let (request_conn, mut request_rx) = hub.connect_anonymous().await;
        hub.join(request_conn, Topic::Request(ctx.request_id)).await;
        let (queue_conn, mut queue_rx) = hub.connect_anonymous().await;
        hub.join(queue_conn, Topic::Queue(ctx.space_id)).await;

        ctx.progress
            .report(RequestProgress {
                iteration: Some(2),
                tool: Some("create_note".to_string()),
                progress: Some(40),
                ..Default::default()
            })
            .await;

        match request_rx.try_recv().unwrap() {
            HubEvent::RequestProgress(p) => {
                assert_eq!(p.request_id, ctx.request_id);
                assert_eq!(p.iteration, Some(2));
                assert_eq!(p.tool.as_deref(), Some("create_note"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match queue_rx.try_recv().unwrap() {
            HubEvent::QueueUpdate(u) => {
                assert_eq!(u.status, RequestStatus::Processing);
                assert_eq!(u.progress, Some(40));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ask_user_targets_owner() {
        let hub = Arc::new(NotificationHub::default());
        let ctx = context(hub.clone(), RequestType::Refactor);
        let (_conn, mut rx) = hub.connect("alice").await;

        let question_id = ctx
            .progress
            .ask_user("Merge these notes?", None, Duration::from_secs(30))
            .await;

        match rx.try_recv().unwrap() {
            HubEvent::RequestAskUser(ask) => {
                assert_eq!(ask.question_id, question_id);
                assert_eq!(ask.timeout_ms, 30_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_noop_processor() {
        let hub = Arc::new(NotificationHub::default());
        let result = NoOpProcessor::new()
            .process(context(hub, RequestType::Search))
            .await
            .unwrap();
        assert_eq!(result.summary.as_deref(), Some("SEARCH processed"));
    }

    #[test]
    fn test_agent_config_builder() {
        let config = AgentConfig::default()
            .with_url("http://agent:9000")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.url, "http://agent:9000");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
