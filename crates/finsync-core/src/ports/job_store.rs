//! JobStore port - ジョブの永続化
//!
//! JobStore は job 状態の唯一の source of truth です。
//! - claim は compare-and-swap（同じ job を二つの worker が取ることはない）
//! - transition は「Running かつ attempt 一致」の場合のみ成功する
//! - 取れる job がない claim は空の Vec を返す（エラーではない）
//! - renew_lease も同じ条件付き書き込み（rescue された lease は更新できない）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{JobId, JobKind, JobRecord, JobState, NewJob, Transition};
use crate::error::StoreError;
use crate::observability::QueueCounts;

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub queue: String,
    pub limit: usize,
    /// Cap on jobs Running in this queue across all workers.
    pub max_running: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(JobRecord),
    /// A job holding the same uniqueness key is still in flight.
    Duplicate(JobRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// Was Available / Retryable and is now Cancelled.
    Cancelled(JobRecord),
    /// Running; the durable flag is set and the handler must observe it.
    Requested(JobRecord),
    AlreadyFinal(JobRecord),
}

impl CancelOutcome {
    pub fn job(&self) -> &JobRecord {
        match self {
            CancelOutcome::Cancelled(job)
            | CancelOutcome::Requested(job)
            | CancelOutcome::AlreadyFinal(job) => job,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobRecord) -> bool {
        self.queue.as_deref().is_none_or(|q| q == job.queue)
            && self.state.is_none_or(|s| s == job.state)
            && self.kind.is_none_or(|k| k == job.kind)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert, or return the in-flight job sharing `unique_key`.
    async fn insert(&self, job: NewJob) -> Result<InsertOutcome, StoreError>;

    /// Atomically move up to `limit` eligible jobs to Running, ordered by
    /// `scheduled_at` then id. Due Retryable jobs are promoted first.
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<JobRecord>, StoreError>;

    /// Apply `transition` if the job is still Running under `attempt`,
    /// otherwise `StoreError::StaleTransition`.
    async fn transition(
        &self,
        id: JobId,
        attempt: u32,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError>;

    /// Stamp `attempted_at = now` if the job is still Running under
    /// `attempt`, otherwise `StoreError::StaleTransition`. Executors call
    /// this when a handler starts and periodically while it runs, so a live
    /// lease never looks stuck to `rescue_stuck`.
    async fn renew_lease(
        &self,
        id: JobId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn request_cancel(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError>;

    async fn counts(&self) -> Result<Vec<QueueCounts>, StoreError>;

    /// Running jobs last claimed before `attempted_before` go back to
    /// Retryable (or Discarded once their attempts are used up).
    async fn rescue_stuck(
        &self,
        attempted_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Delete (or with `dry_run` only count) jobs in terminal `state`
    /// finalized before `finalized_before`.
    async fn purge_finalized(
        &self,
        state: JobState,
        finalized_before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
