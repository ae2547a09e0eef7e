//! JobService - API 層向けの facade
//!
//! HTTP ハンドラや CLI はこの型だけを触ります。enqueue は型付き args を受け取り、
//! 状態の参照は store と（同一プロセスにあれば）worker pool から組み立てます。

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    AnalysisArgs, JobArgs, JobId, JobKind, JobRecord, JobState, MaintenanceArgs, OrganizationId,
    SyncArgs,
};
use crate::error::{JobError, StoreError};
use crate::observability::{HealthReport, QueueCounts, QueueStats, WorkerPoolStats};
use crate::ports::{CancelOutcome, JobFilter, JobStore, LedgerRepository};
use crate::queue::{EnqueueRequest, QueueEngine};
use crate::worker::PoolStatus;

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueReceipt {
    Enqueued {
        job_id: JobId,
        state: JobState,
        /// An in-flight job with the same uniqueness key absorbed the request.
        deduplicated: bool,
    },
    Skipped {
        reason: String,
    },
}

impl EnqueueReceipt {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EnqueueReceipt::Enqueued { job_id, .. } => Some(*job_id),
            EnqueueReceipt::Skipped { .. } => None,
        }
    }
}

pub struct JobService {
    engine: Arc<QueueEngine>,
    ledger: Arc<dyn LedgerRepository>,
    pool: RwLock<Option<PoolStatus>>,
}

impl JobService {
    pub fn new(engine: Arc<QueueEngine>, ledger: Arc<dyn LedgerRepository>) -> Self {
        Self {
            engine,
            ledger,
            pool: RwLock::new(None),
        }
    }

    /// Report executor activity of a pool running in this process.
    pub fn attach_pool(&self, status: PoolStatus) {
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(status);
    }

    fn pool(&self) -> Option<PoolStatus> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        self.engine.store()
    }

    async fn enqueue_typed<A: JobArgs>(&self, args: &A) -> Result<EnqueueReceipt, JobError> {
        let enqueued = self.engine.enqueue(EnqueueRequest::typed(args)?).await?;
        Ok(EnqueueReceipt::Enqueued {
            job_id: enqueued.job.id,
            state: enqueued.job.state,
            deduplicated: enqueued.deduplicated,
        })
    }

    pub async fn enqueue_sync(&self, args: SyncArgs) -> Result<EnqueueReceipt, JobError> {
        self.enqueue_typed(&args).await
    }

    /// With `skip_if_unchanged`, nothing is enqueued when the organization's
    /// ledger has not changed since its newest completed analysis.
    pub async fn enqueue_analysis(&self, args: AnalysisArgs) -> Result<EnqueueReceipt, JobError> {
        if args.skip_if_unchanged
            && let Some(last_run) = self.last_completed_analysis(args.organization_id).await?
        {
            let activity = self.ledger.last_activity(args.organization_id).await?;
            if activity.is_none_or(|at| at <= last_run) {
                info!(
                    organization_id = %args.organization_id,
                    last_run = %last_run,
                    "analysis skipped, no ledger changes since last run"
                );
                return Ok(EnqueueReceipt::Skipped {
                    reason: format!("no ledger changes since {}", last_run.to_rfc3339()),
                });
            }
        }
        self.enqueue_typed(&args).await
    }

    pub async fn enqueue_maintenance(
        &self,
        args: MaintenanceArgs,
    ) -> Result<EnqueueReceipt, JobError> {
        self.enqueue_typed(&args).await
    }

    async fn last_completed_analysis(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let filter = JobFilter {
            kind: Some(JobKind::Analysis),
            state: Some(JobState::Completed),
            ..JobFilter::default()
        };
        let finished = self
            .store()
            .list(&filter)
            .await?
            .into_iter()
            .filter(|job| {
                serde_json::from_value::<AnalysisArgs>(job.payload.clone())
                    .is_ok_and(|a| a.organization_id == organization_id)
            })
            .filter_map(|job| job.finalized_at)
            .max();
        Ok(finished)
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.store()
            .get(id)
            .await?
            .ok_or(StoreError::JobNotFound(id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = self.store().list(filter).await?;
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Available / Retryable jobs are cancelled at once; a Running job gets a
    /// durable cancel request that its handler observes.
    pub async fn cancel_job(&self, id: JobId) -> Result<CancelOutcome, StoreError> {
        let outcome = self.engine.cancel(id).await?;
        debug!(job_id = %id, state = %outcome.job().state, "cancel requested");
        Ok(outcome)
    }

    /// Counts for every configured queue, including queues with no jobs yet.
    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>, StoreError> {
        let mut by_queue: BTreeMap<String, QueueCounts> = self
            .engine
            .queues()
            .iter()
            .map(|q| (q.name.clone(), QueueCounts::new(&q.name)))
            .collect();
        for counts in self.store().counts().await? {
            by_queue.insert(counts.queue.clone(), counts);
        }

        let pool = self.pool();
        Ok(by_queue
            .into_values()
            .map(|counts| {
                let active_workers = pool.as_ref().and_then(|p| p.busy_on(&counts.queue));
                QueueStats {
                    counts,
                    active_workers,
                }
            })
            .collect())
    }

    pub fn worker_stats(&self) -> Option<WorkerPoolStats> {
        self.pool().map(|p| p.snapshot())
    }

    /// Healthy when the store answers and, if a pool is attached, it still
    /// accepts work with at least one live executor.
    pub async fn health(&self) -> HealthReport {
        let (store_reachable, store_error) = match self.store().ping().await {
            Ok(()) => (true, None),
            Err(err) => {
                warn!(error = %err, "job store health check failed");
                (false, Some(err.to_string()))
            }
        };
        let pool = self.pool();
        let pool_ok = pool
            .as_ref()
            .is_none_or(|p| p.is_accepting() && p.alive() > 0);
        HealthReport {
            healthy: store_reachable && pool_ok,
            store_reachable,
            store_error,
            workers_alive: pool.map(|p| p.alive()),
        }
    }
}
