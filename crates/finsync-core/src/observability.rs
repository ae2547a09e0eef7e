//! Read models for the API layer: queue counts, worker activity, health.
//!
//! Everything here is derived on demand from the job store and the running
//! worker pool; nothing is persisted.

use serde::{Deserialize, Serialize};

use crate::domain::JobState;

/// Job counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queue: String,
    pub available: usize,
    pub running: usize,
    pub retryable: usize,
    pub completed: usize,
    pub discarded: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Available => self.available += n,
            JobState::Running => self.running += n,
            JobState::Retryable => self.retryable += n,
            JobState::Completed => self.completed += n,
            JobState::Discarded => self.discarded += n,
            JobState::Cancelled => self.cancelled += n,
        }
    }
}

/// Executor activity for one served queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWorkerStats {
    pub queue: String,
    pub executors: usize,
    pub alive: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub accepting: bool,
    pub queues: Vec<QueueWorkerStats>,
}

impl WorkerPoolStats {
    pub fn alive(&self) -> usize {
        self.queues.iter().map(|q| q.alive).sum()
    }

    pub fn busy(&self) -> usize {
        self.queues.iter().map(|q| q.busy).sum()
    }
}

/// Queue counts joined with the number of executors currently busy on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub counts: QueueCounts,
    /// `None` when no worker pool is attached to this process.
    pub active_workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    /// `None` when no worker pool is attached to this process.
    pub workers_alive: Option<usize>,
}
