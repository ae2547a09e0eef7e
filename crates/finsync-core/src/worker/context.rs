//! JobContext - handler に渡される実行コンテキスト

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::domain::{JobId, JobKind};
use crate::error::JobError;
use crate::queue::Lease;

/// 実行中の job の情報と、キャンセルを観測する手段
///
/// handler は長い処理の区切りで [`JobContext::checkpoint`] を呼ぶか、
/// 外部呼び出しを [`JobContext::guard`] で包む。
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    pub attempt: u32,
    pub max_attempts: u32,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl JobContext {
    pub fn from_lease(lease: &Lease, timeout: Duration) -> Self {
        Self {
            job_id: lease.job.id,
            kind: lease.job.kind,
            attempt: lease.job.attempt,
            max_attempts: lease.job.max_attempts,
            token: lease.token.clone(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Context not tied to a stored job (tests, one-off runs).
    pub fn detached(kind: JobKind) -> Self {
        Self {
            job_id: JobId::from_ulid(Ulid::new()),
            kind,
            attempt: 1,
            max_attempts: 1,
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation has been signalled.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it finishes or the job is cancelled, whichever comes
    /// first. A cancelled future is dropped.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, JobError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(JobError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Time left before the worker gives up on this attempt.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_returns_output_when_not_cancelled() {
        let ctx = JobContext::detached(JobKind::Sync);
        let out = ctx.guard(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
        assert!(ctx.checkpoint().is_ok());
    }

    #[tokio::test]
    async fn guard_stops_on_cancellation() {
        let ctx = JobContext::detached(JobKind::Sync);
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = ctx.guard(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(JobError::Cancelled)));
        assert!(matches!(ctx.checkpoint(), Err(JobError::Cancelled)));
    }

    #[test]
    fn detached_context_has_no_deadline() {
        let ctx = JobContext::detached(JobKind::Analysis);
        assert!(ctx.remaining().is_none());
        assert!(ctx.is_last_attempt());
    }
}
