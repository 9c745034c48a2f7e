use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use jotter_core::defaults::JOB_RETAIN_TERMINAL;
use jotter_core::{
    Error, FailOutcome, Job, JobKey, JobPayload, JobQueue, JobState, QueueStats, Result,
    RetryPolicy, SpaceQueueStatus,
};

struct Entry {
    job: Job,
    /// Monotonic readiness, so paused-clock tests advance backoff.
    ready_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<JobKey, Entry>,
    next_seq: i64,
    completed: VecDeque<JobKey>,
    failed: VecDeque<JobKey>,
}

impl State {
    fn queued_in_space(&self, space_id: Uuid) -> impl Iterator<Item = &Job> {
        self.entries
            .values()
            .map(|e| &e.job)
            .filter(move |j| j.payload.space_id == space_id && j.state.is_queued())
    }

    fn position(&self, key: &JobKey, space_id: Uuid) -> i64 {
        let queued: Vec<&Job> = self.queued_in_space(space_id).collect();
        match queued.iter().find(|j| &j.key == key) {
            Some(job) => queued.iter().filter(|j| j.seq < job.seq).count() as i64 + 1,
            None => queued.len() as i64 + 1,
        }
    }

    /// Remember a terminal job, evicting the oldest beyond `retain`.
    fn retire(&mut self, key: JobKey, state: JobState, retain: usize) {
        let list = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return,
        };
        list.push_back(key);
        let mut evicted = Vec::new();
        while list.len() > retain {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.entries.remove(&old);
        }
    }
}

/// In-memory JobQueue.
pub struct MemoryJobQueue {
    state: Mutex<State>,
    policy: RetryPolicy,
    retain: usize,
    notify: Arc<Notify>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl MemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy,
            retain: JOB_RETAIN_TERMINAL,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Number of completed and failed jobs kept for duplicate detection.
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn finish(&self, key: &JobKey, state: JobState) -> Result<()> {
        let mut guard = self.state.lock().await;
        let entry = guard
            .entries
            .get_mut(key)
            .filter(|e| e.job.state == JobState::Active)
            .ok_or_else(|| Error::Job(format!("no active job {key}")))?;
        entry.job.state = state;
        guard.retire(key.clone(), state, self.retain);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<i64> {
        let key = payload.key();
        let mut state = self.state.lock().await;

        if !state.entries.contains_key(&key) {
            state.next_seq += 1;
            let now = Utc::now();
            let job = Job {
                key: key.clone(),
                payload,
                state: JobState::Waiting,
                attempts_made: 0,
                max_attempts: self.policy.max_attempts,
                seq: state.next_seq,
                enqueued_at: now,
                run_at: now,
                last_error: None,
            };
            state.entries.insert(
                key.clone(),
                Entry {
                    job,
                    ready_at: Instant::now(),
                },
            );
            self.notify.notify_one();
            debug!(
                subsystem = "db",
                component = "memory_queue",
                op = "enqueue",
                job_key = %key,
                "Job enqueued"
            );
        }

        Ok(state.position(&key, payload.space_id))
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let next = state
            .entries
            .values()
            .filter(|e| e.job.state.is_queued() && e.ready_at <= now)
            .min_by_key(|e| e.job.seq)
            .map(|e| e.job.key.clone());

        Ok(next.and_then(|key| {
            state.entries.get_mut(&key).map(|entry| {
                entry.job.state = JobState::Active;
                entry.job.attempts_made += 1;
                entry.job.clone()
            })
        }))
    }

    async fn complete(&self, key: &JobKey) -> Result<()> {
        self.finish(key, JobState::Completed).await
    }

    async fn fail(&self, key: &JobKey, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(key)
            .filter(|e| e.job.state == JobState::Active)
            .ok_or_else(|| Error::Job(format!("no active job {key}")))?;

        entry.job.last_error = Some(error.to_string());
        let attempts = entry.job.attempts_made;

        if retryable && attempts < entry.job.max_attempts {
            let delay = self.policy.delay_for(attempts);
            entry.job.state = JobState::Delayed;
            entry.ready_at = Instant::now() + delay;
            entry.job.run_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| Error::Internal(format!("backoff out of range: {e}")))?;
            Ok(FailOutcome::Retrying {
                attempt: attempts,
                delay,
            })
        } else {
            entry.job.state = JobState::Failed;
            state.retire(key.clone(), JobState::Failed, self.retain);
            Ok(FailOutcome::Exhausted { attempts })
        }
    }

    async fn cancel(&self, request_id: Uuid, space_id: Uuid) -> Result<bool> {
        let key = JobKey::new(space_id, request_id);
        let mut state = self.state.lock().await;
        let queued = state
            .entries
            .get(&key)
            .is_some_and(|e| e.job.state.is_queued());
        if queued {
            state.entries.remove(&key);
        }
        Ok(queued)
    }

    async fn position(&self, request_id: Uuid, space_id: Uuid) -> Result<i64> {
        let key = JobKey::new(space_id, request_id);
        Ok(self.state.lock().await.position(&key, space_id))
    }

    async fn get(&self, key: &JobKey) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .await
            .entries
            .get(key)
            .map(|e| e.job.clone()))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for entry in state.entries.values() {
            match entry.job.state {
                JobState::Waiting | JobState::Delayed => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn space_status(&self, space_id: Uuid) -> Result<SpaceQueueStatus> {
        let state = self.state.lock().await;
        let mut status = SpaceQueueStatus::default();
        for job in state
            .entries
            .values()
            .map(|e| &e.job)
            .filter(|j| j.payload.space_id == space_id)
        {
            match job.state {
                JobState::Waiting | JobState::Delayed => status.waiting += 1,
                JobState::Active => status.processing += 1,
                JobState::Completed | JobState::Failed => {}
            }
        }
        Ok(status)
    }

    fn wake_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
