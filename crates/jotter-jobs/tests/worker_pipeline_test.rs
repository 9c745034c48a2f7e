//! Integration tests for the worker pool on the in-memory backends.
//!
//! This test suite validates:
//! - A submitted request is processed and completion reaches the owner
//! - A failing attempt marks the request FAILED, then a retry completes it
//! - Exhausted retries leave the request and the job failed
//! - A job without a request record fails without notifications
//! - The concurrency cap is never exceeded
//! - Shutdown drains in-flight jobs
//! - A failed owner lookup leaves the request retryable
//! - Status changes follow the request state machine across a retry

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jotter_db::{MemoryJobQueue, MemoryRequestRepository};
use jotter_jobs::{
    Error, HubEvent, JobPayload, JobQueue, JobState, NewRequest, NotificationHub,
    ProcessContext, ProcessingResult, ProcessorSet, Request, RequestProcessor, RequestRepository,
    RequestStatus, RequestType, RequestWithOwner, Result, RetryPolicy, Topic, WorkerBuilder,
    WorkerConfig,
    WorkerEvent, WorkerHandle,
};
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    queue: Arc<MemoryJobQueue>,
    requests: Arc<MemoryRequestRepository>,
    hub: Arc<NotificationHub>,
}

impl Harness {
    fn new() -> Self {
        let policy = RetryPolicy::default().with_backoff_base(Duration::from_millis(10));
        Self {
            queue: Arc::new(MemoryJobQueue::new(policy)),
            requests: Arc::new(MemoryRequestRepository::new()),
            hub: Arc::new(NotificationHub::default()),
        }
    }

    fn start(&self, processor: Arc<dyn RequestProcessor>, max_concurrent: usize) -> WorkerHandle {
        self.start_with(self.requests.clone(), processor, max_concurrent)
    }

    fn start_with(
        &self,
        requests: Arc<dyn RequestRepository>,
        processor: Arc<dyn RequestProcessor>,
        max_concurrent: usize,
    ) -> WorkerHandle {
        WorkerBuilder::new(self.queue.clone(), requests, self.hub.clone())
            .with_config(
                WorkerConfig::default()
                    .with_max_concurrent(max_concurrent)
                    .with_dequeue_per_second(1000)
                    .with_poll_interval(20),
            )
            .with_processors(ProcessorSet::uniform(processor))
            .build()
            .expect("worker should build")
            .start()
    }

    async fn submit(&self, user_id: Uuid, space_id: Uuid, input: &str) -> Request {
        let request = self
            .requests
            .insert(NewRequest {
                space_id,
                user_id,
                request_type: RequestType::Input,
                input: input.to_string(),
            })
            .await
            .unwrap();
        self.queue
            .enqueue(JobPayload::from(&request))
            .await
            .unwrap();
        request
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<WorkerEvent>,
    mut pred: impl FnMut(&WorkerEvent) -> bool,
) -> WorkerEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("worker events closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

/// Fails the first `failures` attempts, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl RequestProcessor for Flaky {
    async fn process(&self, ctx: ProcessContext) -> Result<ProcessingResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(Error::Processing(format!("agent unavailable (call {call})")));
        }
        Ok(ProcessingResult {
            files_created: Some(vec![format!("notes/{}.md", ctx.input.replace(' ', "-"))]),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn test_input_request_completes_and_notifies_owner() {
    let h = Harness::new();
    let user_id = Uuid::new_v4();
    h.requests.register_user(user_id, "alice").await;
    let (_conn, mut inbox) = h.hub.connect("alice").await;

    let handle = h.start(
        Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        }),
        4,
    );
    let mut events = handle.events();

    let request = h.submit(user_id, Uuid::new_v4(), "buy milk").await;
    wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::JobCompleted { request_id, .. } if *request_id == request.id)
    })
    .await;

    let stored = h.requests.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());
    assert_eq!(
        stored.result,
        Some(serde_json::json!({"filesCreated": ["notes/buy-milk.md"]}))
    );

    let job = h.queue.get(&JobPayload::from(&request).key()).await.unwrap();
    assert_eq!(job.unwrap().state, JobState::Completed);

    match inbox.recv().await.unwrap() {
        HubEvent::RequestComplete(done) => {
            assert_eq!(done.request_id, request.id);
            assert_eq!(done.request_type, RequestType::Input);
        }
        other => panic!("unexpected event {other:?}"),
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_attempt_is_retried_to_completion() {
    let h = Harness::new();
    let user_id = Uuid::new_v4();
    h.requests.register_user(user_id, "bob").await;
    let (_conn, mut inbox) = h.hub.connect("bob").await;

    let handle = h.start(
        Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        }),
        4,
    );
    let mut events = handle.events();

    let request = h.submit(user_id, Uuid::new_v4(), "call mom").await;
    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
    assert!(matches!(failed, WorkerEvent::JobFailed { will_retry: true, .. }));

    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobCompleted { .. })).await;
    let stored = h.requests.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert_eq!(stored.error, None);

    match inbox.recv().await.unwrap() {
        HubEvent::RequestFailed(f) => {
            assert_eq!(f.attempt, 1);
            assert_eq!(f.max_attempts, 3);
            assert!(f.will_retry);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        inbox.recv().await.unwrap(),
        HubEvent::RequestComplete(_)
    ));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_leave_request_failed() {
    let h = Harness::new();
    let user_id = Uuid::new_v4();
    let handle = h.start(
        Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        }),
        4,
    );
    let mut events = handle.events();

    let request = h.submit(user_id, Uuid::new_v4(), "never works").await;
    wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::JobFailed { will_retry: false, .. })
    })
    .await;

    let stored = h.requests.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("Processing error: agent unavailable (call 3)"));

    let job = h
        .queue
        .get(&JobPayload::from(&request).key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_request_record_fails_without_notifications() {
    let h = Harness::new();
    let space_id = Uuid::new_v4();
    let (conn, mut inbox) = h.hub.connect_anonymous().await;
    h.hub.join(conn, Topic::Queue(space_id)).await;

    let handle = h.start(
        Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        }),
        4,
    );
    let mut events = handle.events();

    let payload = JobPayload {
        request_id: Uuid::new_v4(),
        space_id,
        request_type: RequestType::Search,
    };
    h.queue.enqueue(payload).await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
    assert!(matches!(failed, WorkerEvent::JobFailed { will_retry: false, .. }));

    let job = h.queue.get(&payload.key()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 1);
    assert!(inbox.try_recv().is_err());

    handle.shutdown().await.unwrap();
}

/// Tracks the highest number of simultaneous calls.
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl RequestProcessor for Gauge {
    async fn process(&self, _ctx: ProcessContext) -> Result<ProcessingResult> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ProcessingResult::default())
    }
}

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let h = Harness::new();
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let handle = h.start(gauge.clone(), 2);
    let mut events = handle.events();

    let space_id = Uuid::new_v4();
    for i in 0..6 {
        h.submit(Uuid::new_v4(), space_id, &format!("note {i}")).await;
    }

    let mut completed = 0;
    while completed < 6 {
        wait_for(&mut events, |e| matches!(e, WorkerEvent::JobCompleted { .. })).await;
        completed += 1;
    }

    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.queue.stats().await.unwrap().completed, 6);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_jobs() {
    let h = Harness::new();
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let handle = h.start(gauge.clone(), 4);
    let mut events = handle.events();

    let request = h.submit(Uuid::new_v4(), Uuid::new_v4(), "slow").await;
    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobStarted { .. })).await;
    handle.shutdown().await.unwrap();

    let stored = h.requests.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disabled_worker_does_not_claim() {
    let h = Harness::new();
    let request = h.submit(Uuid::new_v4(), Uuid::new_v4(), "idle").await;

    let handle = WorkerBuilder::new(h.queue.clone(), h.requests.clone(), h.hub.clone())
        .with_config(WorkerConfig::default().with_enabled(false))
        .with_processors(ProcessorSet::uniform(Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        })))
        .build()
        .unwrap()
        .start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await.unwrap();

    let stored = h.requests.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Pending);
}

/// Request store whose first owner lookup fails with a transient error.
struct FlakyLookup {
    inner: Arc<MemoryRequestRepository>,
    tripped: AtomicBool,
}

#[async_trait]
impl RequestRepository for FlakyLookup {
    async fn insert(&self, new: NewRequest) -> Result<Request> {
        self.inner.insert(new).await
    }
    async fn get(&self, id: Uuid) -> Result<Option<Request>> {
        self.inner.get(id).await
    }
    async fn get_with_owner(&self, id: Uuid) -> Result<Option<RequestWithOwner>> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("connection reset".to_string()));
        }
        self.inner.get_with_owner(id).await
    }
    async fn upsert_owner(&self, user_id: Uuid, login: &str) -> Result<()> {
        self.inner.upsert_owner(user_id, login).await
    }
    async fn set_position(&self, id: Uuid, position: Option<i64>) -> Result<()> {
        self.inner.set_position(id, position).await
    }
    async fn mark_processing(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request> {
        self.inner.mark_processing(id, at).await
    }
    async fn mark_completed(
        &self,
        id: Uuid,
        result: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        self.inner.mark_completed(id, result, at).await
    }
    async fn mark_failed(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<Request> {
        self.inner.mark_failed(id, error, at).await
    }
    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<Request> {
        self.inner.mark_cancelled(id, at).await
    }
}

#[tokio::test]
async fn test_failed_owner_lookup_is_retried_to_completion() {
    let h = Harness::new();
    let requests = Arc::new(FlakyLookup {
        inner: h.requests.clone(),
        tripped: AtomicBool::new(false),
    });
    let handle = h.start_with(
        requests,
        Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        }),
        4,
    );
    let mut events = handle.events();

    let request = h.submit(Uuid::new_v4(), Uuid::new_v4(), "water plants").await;
    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::JobFailed { .. })).await;
    assert!(matches!(failed, WorkerEvent::JobFailed { will_retry: true, .. }));

    wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::JobCompleted { request_id, .. } if *request_id == request.id)
    })
    .await;

    let stored = h.requests.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    let job = h
        .queue
        .get(&JobPayload::from(&request).key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_sequence_across_retry() {
    let h = Harness::new();
    let space_id = Uuid::new_v4();
    let (conn, mut inbox) = h.hub.connect_anonymous().await;
    h.hub.join(conn, Topic::Queue(space_id)).await;

    let request = h.submit(Uuid::new_v4(), space_id, "book flights").await;
    let mut seen = vec![h.requests.get(request.id).await.unwrap().unwrap().status];

    let handle = h.start(
        Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        }),
        1,
    );

    while seen.last() != Some(&RequestStatus::Completed) {
        let event = timeout(WAIT, inbox.recv())
            .await
            .expect("timed out waiting for queue update")
            .expect("hub closed");
        if let HubEvent::QueueUpdate(update) = event {
            assert_eq!(update.request_id, request.id);
            seen.push(update.status);
        }
    }

    assert_eq!(
        seen,
        vec![
            RequestStatus::Pending,
            RequestStatus::Processing,
            RequestStatus::Failed,
            RequestStatus::Processing,
            RequestStatus::Completed,
        ]
    );
    for pair in seen.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
    }

    handle.shutdown().await.unwrap();
}
