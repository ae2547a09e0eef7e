//! Maintenance jobs: purge old finalized jobs, rescue jobs abandoned in Running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::MaintenanceConfig;
use crate::domain::{JobState, MaintenanceArgs, MaintenanceTask};
use crate::error::JobError;
use crate::ports::{Clock, JobStore};
use crate::worker::{Handler, JobContext};

/// How long finalized jobs are kept, per terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub cancelled: Duration,
    pub discarded: Duration,
    /// Running jobs claimed longer ago than this are treated as abandoned.
    pub rescue_after: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self {
            completed: hours(config.completed_retention_hours),
            cancelled: hours(config.cancelled_retention_hours),
            discarded: hours(config.discarded_retention_hours),
            rescue_after: config.rescue_after(),
        }
    }

    fn per_state(&self) -> [(JobState, Duration); 3] {
        [
            (JobState::Completed, self.completed),
            (JobState::Cancelled, self.cancelled),
            (JobState::Discarded, self.discarded),
        ]
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&MaintenanceConfig::default())
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub task: Option<MaintenanceTask>,
    pub dry_run: bool,
    pub purged_completed: usize,
    pub purged_cancelled: usize,
    pub purged_discarded: usize,
    pub rescued: usize,
}

pub struct MaintenanceHandler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retention: RetentionPolicy,
}

impl MaintenanceHandler {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    #[instrument(skip_all, fields(task = args.task.as_str(), dry_run = args.dry_run, job_id = %ctx.job_id))]
    pub async fn run(
        &self,
        ctx: &JobContext,
        args: &MaintenanceArgs,
    ) -> Result<MaintenanceReport, JobError> {
        let now = self.clock.now();
        let mut report = MaintenanceReport {
            task: Some(args.task),
            dry_run: args.dry_run,
            ..MaintenanceReport::default()
        };

        match args.task {
            MaintenanceTask::PurgeFinalizedJobs => {
                for (state, keep_for) in self.retention.per_state() {
                    ctx.checkpoint()?;
                    let n = self
                        .store
                        .purge_finalized(state, before(now, keep_for), args.dry_run)
                        .await?;
                    match state {
                        JobState::Completed => report.purged_completed = n,
                        JobState::Cancelled => report.purged_cancelled = n,
                        _ => report.purged_discarded = n,
                    }
                }
                info!(
                    completed = report.purged_completed,
                    cancelled = report.purged_cancelled,
                    discarded = report.purged_discarded,
                    "finalized jobs purged"
                );
            }
            MaintenanceTask::RescueStuckJobs => {
                ctx.checkpoint()?;
                let threshold = before(now, self.retention.rescue_after);
                if args.dry_run {
                    warn!("dry run is not supported for rescue; nothing changed");
                } else {
                    let rescued = self.store.rescue_stuck(threshold, now).await?;
                    for job in &rescued {
                        warn!(
                            rescued_job = %job.id,
                            kind = %job.kind,
                            state = %job.state,
                            attempt = job.attempt,
                            "rescued abandoned job"
                        );
                    }
                    report.rescued = rescued.len();
                }
                info!(rescued = report.rescued, "stuck job rescue finished");
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Handler<MaintenanceArgs> for MaintenanceHandler {
    async fn handle(&self, ctx: &JobContext, args: MaintenanceArgs) -> Result<(), JobError> {
        self.run(ctx, &args).await.map(|_| ())
    }
}
