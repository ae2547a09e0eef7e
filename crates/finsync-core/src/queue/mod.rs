//! Queue engine: enqueue, claim, and outcome-driven transitions.
//!
//! The engine owns the retry decision. Handlers only return
//! `Result<(), JobError>`; whether that becomes Completed, Retryable,
//! Discarded or Cancelled is decided here and written through the
//! [`JobStore`] as a conditional transition on the lease's attempt.

pub mod cancel;
pub mod retry;

pub use cancel::CancelRegistry;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::domain::payload::inspect_payload;
use crate::domain::{
    JobArgs, JobFailure, JobId, JobKind, JobRecord, JobState, NewJob, Transition,
};
use crate::error::{JobError, StoreError};
use crate::ports::{CancelOutcome, ClaimRequest, Clock, IdGenerator, InsertOutcome, JobStore};

/// Routing and concurrency limits for one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    /// Cap on Running jobs across all processes.
    pub max_running: usize,
    pub kinds: Vec<JobKind>,
}

impl QueueSettings {
    pub fn new(name: impl Into<String>, kinds: Vec<JobKind>) -> Self {
        Self {
            name: name.into(),
            max_running: usize::MAX,
            kinds,
        }
    }

    pub fn accepts(&self, kind: JobKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// One queue per kind, named after the kind.
pub fn default_queues() -> Vec<QueueSettings> {
    JobKind::ALL
        .into_iter()
        .map(|kind| QueueSettings::new(kind.default_queue(), vec![kind]))
        .collect()
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    /// Defaults to the queue the kind is routed to.
    pub queue: Option<String>,
    pub max_attempts: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            queue: None,
            max_attempts: None,
            scheduled_at: None,
        }
    }

    pub fn typed<A: JobArgs>(args: &A) -> Result<Self, JobError> {
        let payload = serde_json::to_value(args)
            .map_err(|e| JobError::Validation(format!("{} payload: {e}", A::KIND)))?;
        Ok(Self::new(A::KIND, payload))
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub job: JobRecord,
    /// The request merged into an in-flight job with the same uniqueness key.
    pub deduplicated: bool,
}

/// A claimed job plus the token its handler observes.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: JobRecord,
    pub token: CancellationToken,
}

impl Lease {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }
}

pub struct QueueEngine {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retry: RetryPolicy,
    queues: Vec<QueueSettings>,
    default_max_attempts: u32,
    notify: Arc<Notify>,
    cancels: CancelRegistry,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            retry: RetryPolicy::default(),
            queues: default_queues(),
            default_max_attempts: 3,
            notify: Arc::new(Notify::new()),
            cancels: CancelRegistry::new(),
        }
    }

    pub fn from_config(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: &AppConfig,
    ) -> Self {
        let queues = config
            .queues
            .iter()
            .map(|q| QueueSettings {
                name: q.name.clone(),
                max_running: q.max_running.unwrap_or(usize::MAX),
                kinds: q.routed_kinds(),
            })
            .collect();
        Self::new(store, clock, ids)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_queues(queues)
            .with_default_max_attempts(config.jobs.max_attempts)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueSettings>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn queues(&self) -> &[QueueSettings] {
        &self.queues
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Jobs of this process currently holding a cancellation token.
    pub fn leased(&self) -> usize {
        self.cancels.len()
    }

    fn settings(&self, queue: &str) -> Option<&QueueSettings> {
        self.queues.iter().find(|q| q.name == queue)
    }

    fn route(&self, kind: JobKind, queue: Option<&str>) -> Result<&QueueSettings, JobError> {
        match queue {
            Some(name) => {
                let settings = self
                    .settings(name)
                    .ok_or_else(|| JobError::Validation(format!("unknown queue '{name}'")))?;
                if !settings.accepts(kind) {
                    return Err(JobError::Validation(format!(
                        "queue '{name}' does not accept {kind} jobs"
                    )));
                }
                Ok(settings)
            }
            None => self
                .queues
                .iter()
                .find(|q| q.accepts(kind))
                .ok_or_else(|| JobError::Validation(format!("no queue accepts {kind} jobs"))),
        }
    }

    /// Validate and persist a job. A payload failing validation never
    /// creates a row.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, JobError> {
        let unique_key = inspect_payload(request.kind, &request.payload)?;
        let queue = self.route(request.kind, request.queue.as_deref())?.name.clone();
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(JobError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let job = NewJob {
            id: self.ids.job_id(),
            queue,
            kind: request.kind,
            payload: request.payload,
            max_attempts,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            unique_key,
            created_at: now,
        };

        match self.store.insert(job).await? {
            InsertOutcome::Inserted(job) => {
                info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    queue = %job.queue,
                    scheduled_at = %job.scheduled_at,
                    "job enqueued"
                );
                // Notify outside any store lock
                self.notify.notify_waiters();
                Ok(Enqueued {
                    job,
                    deduplicated: false,
                })
            }
            InsertOutcome::Duplicate(job) => {
                info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    state = %job.state,
                    "enqueue merged into in-flight job"
                );
                Ok(Enqueued {
                    job,
                    deduplicated: true,
                })
            }
        }
    }

    /// Lease up to `capacity` jobs from `queue`.
    pub async fn claim(&self, queue: &str, capacity: usize) -> Result<Vec<Lease>, StoreError> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let max_running = self.settings(queue).map_or(usize::MAX, |q| q.max_running);
        let jobs = self
            .store
            .claim(ClaimRequest {
                queue: queue.to_string(),
                limit: capacity,
                max_running,
                now: self.clock.now(),
            })
            .await?;

        Ok(jobs
            .into_iter()
            .map(|job| {
                debug!(job_id = %job.id, queue, attempt = job.attempt, "job claimed");
                let token = self.cancels.register(job.id, job.attempt);
                Lease { job, token }
            })
            .collect())
    }

    /// Record the handler's result and release the lease's token.
    pub async fn finish(
        &self,
        lease: &Lease,
        result: Result<(), JobError>,
    ) -> Result<JobRecord, StoreError> {
        let job = &lease.job;
        let now = self.clock.now();
        let result = match result {
            // cancelled by shutdown rather than by a user: retry later
            Err(JobError::Cancelled) if !self.cancels.was_requested(job.id) => Err(
                JobError::Interrupted("worker shut down while the job was running".to_string()),
            ),
            other => other,
        };

        let transition = match &result {
            Ok(()) => Transition::Complete,
            Err(JobError::Cancelled) => Transition::Cancel {
                error: Some(JobFailure::from_error(&JobError::Cancelled, job.attempt, now)),
            },
            Err(err) if err.is_transient() && job.attempt < job.max_attempts => {
                let delay = self.retry.next_delay(job.attempt);
                let scheduled_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Transition::Retry {
                    scheduled_at,
                    error: JobFailure::from_error(err, job.attempt, now),
                }
            }
            Err(err) => Transition::Discard {
                error: JobFailure::from_error(err, job.attempt, now),
            },
        };

        let decision = transition.name();
        let written = self
            .store
            .transition(job.id, job.attempt, transition, now)
            .await;
        self.cancels.remove(job.id, job.attempt);

        let record = match written {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    decision,
                    error = %err,
                    "could not record job outcome"
                );
                return Err(err);
            }
        };

        match &result {
            Ok(()) => info!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt,
                "job completed"
            ),
            Err(err) => warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                class = ?err.class(),
                decision,
                next_run_at = %record.scheduled_at,
                error = %err,
                "job failed"
            ),
        }
        if record.state == JobState::Retryable {
            self.notify.notify_waiters();
        }
        Ok(record)
    }

    /// Mark the lease as started. A lease that was rescued while it waited
    /// in the executor's batch is stale: its token is dropped and the caller
    /// must not run the handler.
    pub async fn start(&self, lease: &Lease) -> Result<(), StoreError> {
        let job = &lease.job;
        let renewed = self
            .store
            .renew_lease(job.id, job.attempt, self.clock.now())
            .await;
        if renewed.is_err() {
            self.cancels.remove(job.id, job.attempt);
        }
        renewed
    }

    /// Keep a running lease fresh. On a stale lease the local token is fired
    /// so the handler stops; the job already belongs to someone else.
    pub async fn renew(&self, lease: &Lease) -> Result<(), StoreError> {
        let job = &lease.job;
        let renewed = self
            .store
            .renew_lease(job.id, job.attempt, self.clock.now())
            .await;
        if let Err(StoreError::StaleTransition { .. }) = &renewed {
            warn!(job_id = %job.id, attempt = job.attempt, "lease lost while running");
            lease.token.cancel();
        }
        renewed
    }

    /// Give back a lease whose handler never started.
    pub async fn release(&self, lease: &Lease) -> Result<JobRecord, StoreError> {
        let job = &lease.job;
        let record = self
            .store
            .transition(job.id, job.attempt, Transition::Release, self.clock.now())
            .await;
        self.cancels.remove(job.id, job.attempt);
        let record = record?;
        debug!(job_id = %job.id, "lease released");
        self.notify.notify_waiters();
        Ok(record)
    }

    /// Cancel a job: immediately when not yet running, otherwise by setting
    /// the durable flag and firing the local token if the job runs here.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, StoreError> {
        let outcome = self.store.request_cancel(id, self.clock.now()).await?;
        match &outcome {
            CancelOutcome::Cancelled(job) => info!(job_id = %job.id, "job cancelled"),
            CancelOutcome::Requested(job) => {
                let local = self.cancels.request(id);
                info!(job_id = %job.id, local, "cancellation requested for running job");
            }
            CancelOutcome::AlreadyFinal(job) => {
                debug!(job_id = %job.id, state = %job.state, "cancel ignored for finalized job")
            }
        }
        Ok(outcome)
    }

    /// Check the durable cancel flag of a running job and fire its token when
    /// set. Covers requests made by another process.
    pub async fn poll_cancellation(&self, id: JobId) -> Result<bool, StoreError> {
        let requested = self
            .store
            .get(id)
            .await?
            .is_some_and(|job| job.cancel_requested);
        if requested {
            self.cancels.request(id);
        }
        Ok(requested)
    }

    /// Fire every token held by this process (forced shutdown).
    pub fn interrupt_all(&self) -> usize {
        self.cancels.interrupt_all()
    }

    /// Sleep until a job is enqueued or `max_wait` elapses.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
