//! Request admission, cancellation and status queries.
//!
//! Admission runs synchronously on the caller's HTTP request:
//! rate limit, persist `PENDING`, enqueue, record the position. Everything
//! after that happens in the worker pool and reaches clients through the
//! notification hub.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jotter_core::hub::QueueUpdate;
use jotter_core::{
    Error, HubEvent, Identity, JobPayload, JobQueue, NewRequest, NotificationHub, QueueStats,
    RateLimitDecision, Request, RequestRepository, RequestStatus, RequestType, Result,
    SpaceQueueStatus, Topic,
};

use super::rate_limiter::RateLimiter;

/// A request as submitted by a client.
#[derive(Debug, Clone)]
pub struct Submission {
    pub space_id: Uuid,
    pub user_id: Uuid,
    /// Login asserted by a verified credential; recorded so completion
    /// events can reach `user:{login}`.
    pub owner_login: Option<String>,
    pub request_type: RequestType,
    pub input: String,
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct Admission {
    pub request: Request,
    pub position: i64,
    pub rate: RateLimitDecision,
}

/// Admission and cancellation front end over the request store, job queue and hub.
pub struct RequestLifecycle {
    requests: Arc<dyn RequestRepository>,
    queue: Arc<dyn JobQueue>,
    hub: Arc<NotificationHub>,
    limiter: RateLimiter,
}

impl RequestLifecycle {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        queue: Arc<dyn JobQueue>,
        hub: Arc<NotificationHub>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            requests,
            queue,
            hub,
            limiter,
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Admit, persist and enqueue a request.
    ///
    /// Denied admissions return `Error::RateLimited` carrying the decision.
    pub async fn submit(&self, identity: &Identity, submission: Submission) -> Result<Admission> {
        if submission.input.trim().is_empty() {
            return Err(Error::InvalidInput("input must not be empty".to_string()));
        }

        let rate = self
            .limiter
            .admit(identity, submission.request_type.into())
            .await?;
        if !rate.allowed {
            return Err(Error::RateLimited(rate));
        }

        if let Some(login) = submission.owner_login.as_deref() {
            self.requests
                .upsert_owner(submission.user_id, login)
                .await?;
        }

        let mut request = self
            .requests
            .insert(NewRequest {
                space_id: submission.space_id,
                user_id: submission.user_id,
                request_type: submission.request_type,
                input: submission.input,
            })
            .await?;

        let position = match self.queue.enqueue(JobPayload::from(&request)).await {
            Ok(position) => position,
            Err(e) => {
                self.withdraw(&request, &e).await;
                return Err(e);
            }
        };
        // The job exists from here on; a missed position write only affects display.
        if let Err(e) = self.requests.set_position(request.id, Some(position)).await {
            warn!(
                subsystem = "lifecycle",
                op = "submit",
                request_id = %request.id,
                error = %e,
                "Failed to record queue position"
            );
        }
        request.position = Some(position);

        self.hub
            .emit(
                &Topic::Queue(request.space_id),
                HubEvent::QueueUpdate(QueueUpdate {
                    request_id: request.id,
                    space_id: request.space_id,
                    status: RequestStatus::Pending,
                    position: Some(position),
                    progress: None,
                }),
            )
            .await;

        info!(
            subsystem = "lifecycle",
            op = "submit",
            request_id = %request.id,
            space_id = %request.space_id,
            request_type = %request.request_type,
            position,
            remaining = rate.remaining,
            "Request admitted"
        );

        Ok(Admission {
            request,
            position,
            rate,
        })
    }

    /// Take a request that never reached the queue out of `PENDING` so it
    /// does not sit there with no job behind it.
    async fn withdraw(&self, request: &Request, cause: &Error) {
        warn!(
            subsystem = "lifecycle",
            op = "submit",
            request_id = %request.id,
            error = %cause,
            "Enqueue failed, withdrawing request"
        );
        if let Err(e) = self.queue.cancel(request.id, request.space_id).await {
            debug!(request_id = %request.id, error = %e, "No job to withdraw");
        }
        if let Err(e) = self.requests.mark_cancelled(request.id, Utc::now()).await {
            error!(
                subsystem = "lifecycle",
                request_id = %request.id,
                error = %e,
                "Failed to withdraw request"
            );
        }
    }

    /// Cancel a request whose job has not started.
    ///
    /// Returns `false` when the request has left `PENDING` (including a
    /// failed attempt waiting on its retry) or the job is already active;
    /// the request is left to run to completion.
    pub async fn cancel(&self, request_id: Uuid, requester: Uuid) -> Result<bool> {
        let request = self.get(request_id).await?;
        if request.user_id != requester {
            return Err(Error::Forbidden(
                "only the owner may cancel a request".to_string(),
            ));
        }

        if request.status != RequestStatus::Pending {
            debug!(
                subsystem = "lifecycle",
                op = "cancel",
                request_id = %request_id,
                status = %request.status,
                "Request not cancellable"
            );
            return Ok(false);
        }

        if !self.queue.cancel(request_id, request.space_id).await? {
            debug!(
                subsystem = "lifecycle",
                op = "cancel",
                request_id = %request_id,
                status = %request.status,
                "Job not cancellable"
            );
            return Ok(false);
        }

        self.requests.mark_cancelled(request_id, Utc::now()).await?;
        self.hub
            .emit_many(
                &[Topic::Queue(request.space_id), Topic::Request(request_id)],
                HubEvent::QueueUpdate(QueueUpdate {
                    request_id,
                    space_id: request.space_id,
                    status: RequestStatus::Cancelled,
                    position: None,
                    progress: None,
                }),
            )
            .await;

        info!(
            subsystem = "lifecycle",
            op = "cancel",
            request_id = %request_id,
            space_id = %request.space_id,
            "Request cancelled"
        );
        Ok(true)
    }

    pub async fn get(&self, request_id: Uuid) -> Result<Request> {
        self.requests
            .get(request_id)
            .await?
            .ok_or(Error::RequestNotFound(request_id))
    }

    /// Current queue rank, recomputed from the queue.
    pub async fn position(&self, request_id: Uuid) -> Result<(Request, i64)> {
        let request = self.get(request_id).await?;
        let position = self.queue.position(request_id, request.space_id).await?;
        Ok((request, position))
    }

    pub async fn space_status(&self, space_id: Uuid) -> Result<SpaceQueueStatus> {
        self.queue.space_status(space_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rate_limiter::{RateLimitConfig, RateLimitRule};
    use jotter_core::{FailOutcome, Job, JobKey, JobState, RateLimitOperation};
    use tokio::sync::{Mutex, Notify};
    use jotter_db::{MemoryCounterStore, MemoryJobQueue, MemoryRequestRepository};

    struct Fixture {
        lifecycle: RequestLifecycle,
        requests: Arc<MemoryRequestRepository>,
        queue: Arc<MemoryJobQueue>,
        hub: Arc<NotificationHub>,
    }

    fn fixture(input_max: u64) -> Fixture {
        let requests = Arc::new(MemoryRequestRepository::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let hub = Arc::new(NotificationHub::default());
        let limiter = RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            RateLimitConfig::default()
                .with_rule(RateLimitOperation::Input, RateLimitRule::new(input_max, 60)),
        );
        Fixture {
            lifecycle: RequestLifecycle::new(
                requests.clone(),
                queue.clone(),
                hub.clone(),
                limiter,
            ),
            requests,
            queue,
            hub,
        }
    }

    fn submission(user_id: Uuid, space_id: Uuid, input: &str) -> Submission {
        Submission {
            space_id,
            user_id,
            owner_login: Some("alice".to_string()),
            request_type: RequestType::Input,
            input: input.to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_enqueues() {
        let f = fixture(5);
        let user = Uuid::new_v4();
        let space = Uuid::new_v4();
        let (conn, mut inbox) = f.hub.connect_anonymous().await;
        f.hub.join(conn, Topic::Queue(space)).await;

        let admission = f
            .lifecycle
            .submit(&Identity::User(user), submission(user, space, "buy milk"))
            .await
            .unwrap();

        assert_eq!(admission.position, 1);
        assert_eq!(admission.request.status, RequestStatus::Pending);
        assert_eq!(admission.request.position, Some(1));
        assert_eq!(admission.rate.remaining, 4);

        let stored = f.requests.get(admission.request.id).await.unwrap().unwrap();
        assert_eq!(stored.position, Some(1));
        assert_eq!(f.queue.stats().await.unwrap().waiting, 1);

        let owned = f
            .requests
            .get_with_owner(admission.request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owned.owner_login, "alice");

        match inbox.recv().await.unwrap() {
            HubEvent::QueueUpdate(update) => {
                assert_eq!(update.status, RequestStatus::Pending);
                assert_eq!(update.position, Some(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_positions_are_per_space() {
        let f = fixture(10);
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let id = Identity::User(user);

        let first = f.lifecycle.submit(&id, submission(user, a, "one")).await.unwrap();
        let second = f.lifecycle.submit(&id, submission(user, a, "two")).await.unwrap();
        let other = f.lifecycle.submit(&id, submission(user, b, "three")).await.unwrap();

        assert_eq!(first.position, 1);
        assert_eq!(second.position, 2);
        assert_eq!(other.position, 1);

        let (_, pos) = f.lifecycle.position(second.request.id).await.unwrap();
        assert_eq!(pos, 2);
        assert_eq!(f.lifecycle.space_status(a).await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_submission_is_not_persisted() {
        let f = fixture(1);
        let user = Uuid::new_v4();
        let space = Uuid::new_v4();
        let id = Identity::User(user);

        f.lifecycle.submit(&id, submission(user, space, "ok")).await.unwrap();
        let err = f
            .lifecycle
            .submit(&id, submission(user, space, "too many"))
            .await
            .unwrap_err();

        match err {
            Error::RateLimited(decision) => {
                assert!(!decision.allowed);
                assert_eq!(decision.remaining, 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(f.queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let f = fixture(5);
        let user = Uuid::new_v4();
        let err = f
            .lifecycle
            .submit(&Identity::User(user), submission(user, Uuid::new_v4(), "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancel_waiting_request() {
        let f = fixture(5);
        let user = Uuid::new_v4();
        let admission = f
            .lifecycle
            .submit(&Identity::User(user), submission(user, Uuid::new_v4(), "later"))
            .await
            .unwrap();

        assert!(f.lifecycle.cancel(admission.request.id, user).await.unwrap());

        let stored = f.lifecycle.get(admission.request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Cancelled);
        assert_eq!(f.queue.stats().await.unwrap().waiting, 0);
        assert!(f.queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_active_request_returns_false() {
        let f = fixture(5);
        let user = Uuid::new_v4();
        let admission = f
            .lifecycle
            .submit(&Identity::User(user), submission(user, Uuid::new_v4(), "busy"))
            .await
            .unwrap();
        f.queue.claim_next().await.unwrap().unwrap();
        f.requests
            .mark_processing(admission.request.id, Utc::now())
            .await
            .unwrap();

        assert!(!f.lifecycle.cancel(admission.request.id, user).await.unwrap());
        let stored = f.lifecycle.get(admission.request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Processing);
    }

    #[tokio::test]
    async fn test_cancel_by_other_user_forbidden() {
        let f = fixture(5);
        let user = Uuid::new_v4();
        let admission = f
            .lifecycle
            .submit(&Identity::User(user), submission(user, Uuid::new_v4(), "mine"))
            .await
            .unwrap();

        let err = f
            .lifecycle
            .cancel(admission.request.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff_returns_false() {
        let f = fixture(5);
        let user = Uuid::new_v4();
        let admission = f
            .lifecycle
            .submit(&Identity::User(user), submission(user, Uuid::new_v4(), "flaky"))
            .await
            .unwrap();
        let id = admission.request.id;

        let job = f.queue.claim_next().await.unwrap().unwrap();
        f.requests.mark_processing(id, Utc::now()).await.unwrap();
        f.requests.mark_failed(id, "agent timeout", Utc::now()).await.unwrap();
        let outcome = f.queue.fail(&job.key, "agent timeout", true).await.unwrap();
        assert!(outcome.will_retry());

        assert!(!f.lifecycle.cancel(id, user).await.unwrap());

        let stored = f.lifecycle.get(id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Failed);
        let retained = f.queue.get(&job.key).await.unwrap().unwrap();
        assert_eq!(retained.state, JobState::Delayed);
    }

    /// Job queue whose enqueue always fails; remembers what it turned away.
    #[derive(Default)]
    struct RejectingQueue {
        inner: MemoryJobQueue,
        rejected: Mutex<Vec<Uuid>>,
    }

    #[async_trait::async_trait]
    impl JobQueue for RejectingQueue {
        async fn enqueue(&self, payload: JobPayload) -> Result<i64> {
            self.rejected.lock().await.push(payload.request_id);
            Err(Error::Job("queue offline".to_string()))
        }
        async fn claim_next(&self) -> Result<Option<Job>> {
            self.inner.claim_next().await
        }
        async fn complete(&self, key: &JobKey) -> Result<()> {
            self.inner.complete(key).await
        }
        async fn fail(&self, key: &JobKey, error: &str, retryable: bool) -> Result<FailOutcome> {
            self.inner.fail(key, error, retryable).await
        }
        async fn cancel(&self, request_id: Uuid, space_id: Uuid) -> Result<bool> {
            self.inner.cancel(request_id, space_id).await
        }
        async fn position(&self, request_id: Uuid, space_id: Uuid) -> Result<i64> {
            self.inner.position(request_id, space_id).await
        }
        async fn get(&self, key: &JobKey) -> Result<Option<Job>> {
            self.inner.get(key).await
        }
        async fn stats(&self) -> Result<QueueStats> {
            self.inner.stats().await
        }
        async fn space_status(&self, space_id: Uuid) -> Result<SpaceQueueStatus> {
            self.inner.space_status(space_id).await
        }
        fn wake_handle(&self) -> Arc<Notify> {
            self.inner.wake_handle()
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_withdraws_request() {
        let requests = Arc::new(MemoryRequestRepository::new());
        let queue = Arc::new(RejectingQueue::default());
        let lifecycle = RequestLifecycle::new(
            requests.clone(),
            queue.clone(),
            Arc::new(NotificationHub::default()),
            RateLimiter::new(Arc::new(MemoryCounterStore::new()), RateLimitConfig::default()),
        );
        let user = Uuid::new_v4();
        let space = Uuid::new_v4();

        let err = lifecycle
            .submit(&Identity::User(user), submission(user, space, "buy milk"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(_)));

        let rejected = queue.rejected.lock().await.clone();
        assert_eq!(rejected.len(), 1);
        let stored = requests.get(rejected[0]).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Cancelled);
        assert_eq!(stored.space_id, space);
    }

    #[tokio::test]
    async fn test_get_unknown_request() {
        let f = fixture(5);
        let err = f.lifecycle.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::RequestNotFound(_)));
    }
}
