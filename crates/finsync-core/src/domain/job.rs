//! Job record, states and the transitions between them.
//!
//! 状態遷移のルールはここに集約し、InMemoryStore と SqliteStore の両方が
//! [`JobRecord::apply`] を通して同じ遷移を行います。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use crate::error::{FailureClass, JobError};

/// The closed set of job kinds. Each kind maps to exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Analysis,
    Maintenance,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Sync, JobKind::Analysis, JobKind::Maintenance];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Analysis => "analysis",
            JobKind::Maintenance => "maintenance",
        }
    }

    /// Queue a job of this kind lands on when the caller does not name one.
    pub fn default_queue(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown job kind '{s}'"))
    }
}

/// Job lifecycle state.
///
/// ```text
/// Available ──claim──▶ Running ──▶ Completed
///     ▲                  │ ├────▶ Discarded
///     │                  │ └────▶ Cancelled
///     └── (due) ── Retryable ◀┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Completed,
    Retryable,
    Discarded,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Available,
        JobState::Running,
        JobState::Completed,
        JobState::Retryable,
        JobState::Discarded,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Completed / Discarded / Cancelled never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    /// States that count as "in flight" for uniqueness keys.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobState::Available | JobState::Running | JobState::Retryable
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{s}'"))
    }
}

/// Structured `last_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub class: FailureClass,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl JobFailure {
    pub fn from_error(err: &JobError, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
            attempt,
            at,
        }
    }
}

/// Row to insert. Ids and timestamps are assigned by the queue engine.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub queue: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub unique_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A durable job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub unique_key: Option<String>,
    pub cancel_requested: bool,
    pub last_error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Outcome-driven transition out of `Running`.
#[derive(Debug, Clone)]
pub enum Transition {
    Complete,
    Retry {
        scheduled_at: DateTime<Utc>,
        error: JobFailure,
    },
    Discard {
        error: JobFailure,
    },
    Cancel {
        error: Option<JobFailure>,
    },
    /// Give back a lease whose handler never started (shutdown mid-batch).
    Release,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Complete => "complete",
            Transition::Retry { .. } => "retry",
            Transition::Discard { .. } => "discard",
            Transition::Cancel { .. } => "cancel",
            Transition::Release => "release",
        }
    }
}

impl From<NewJob> for JobRecord {
    fn from(job: NewJob) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            kind: job.kind,
            payload: job.payload,
            state: JobState::Available,
            attempt: 0,
            max_attempts: job.max_attempts,
            scheduled_at: job.scheduled_at,
            unique_key: job.unique_key,
            cancel_requested: false,
            last_error: None,
            created_at: job.created_at,
            attempted_at: None,
            finalized_at: None,
        }
    }
}

impl JobRecord {
    /// Whether a claim at `now` may take this job.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Available
            && self.scheduled_at <= now
            && self.attempt < self.max_attempts
            && !self.cancel_requested
    }

    /// Whether this job is held by the given lease.
    pub fn is_leased_by(&self, attempt: u32) -> bool {
        self.state == JobState::Running && self.attempt == attempt
    }

    /// Available -> Running.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.attempt < self.max_attempts);
        self.state = JobState::Running;
        self.attempt += 1;
        self.attempted_at = Some(now);
    }

    /// Retryable -> Available once the backoff has elapsed.
    pub fn promote_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == JobState::Retryable && self.scheduled_at <= now {
            self.state = JobState::Available;
            true
        } else {
            false
        }
    }

    /// Apply a transition out of `Running`. Callers check
    /// [`JobRecord::is_leased_by`] first.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) {
        match transition {
            Transition::Complete => {
                self.state = JobState::Completed;
                self.finalized_at = Some(now);
            }
            Transition::Retry {
                scheduled_at,
                error,
            } => {
                self.state = JobState::Retryable;
                self.scheduled_at = scheduled_at;
                self.last_error = Some(error);
            }
            Transition::Discard { error } => {
                self.state = JobState::Discarded;
                self.last_error = Some(error);
                self.finalized_at = Some(now);
            }
            Transition::Cancel { error } => {
                self.state = JobState::Cancelled;
                if error.is_some() {
                    self.last_error = error;
                }
                self.finalized_at = Some(now);
            }
            Transition::Release => {
                self.state = JobState::Available;
                self.attempt = self.attempt.saturating_sub(1);
            }
        }
    }

    /// Cancel a job that is not running yet (Available or Retryable).
    pub fn cancel_pending(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.cancel_requested = true;
        self.finalized_at = Some(now);
    }

    /// Return a Running job whose lease was lost (crash, forced stop).
    pub fn rescue(&mut self, now: DateTime<Utc>) {
        let error = JobFailure {
            class: FailureClass::Interrupted,
            message: "job was running when its worker stopped".to_string(),
            attempt: self.attempt,
            at: now,
        };
        if self.cancel_requested {
            self.apply(Transition::Cancel { error: Some(error) }, now);
        } else if self.attempt >= self.max_attempts {
            self.apply(Transition::Discard { error }, now);
        } else {
            self.apply(
                Transition::Retry {
                    scheduled_at: now,
                    error,
                },
                now,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::JobId;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn record(max_attempts: u32) -> JobRecord {
        JobRecord::from(NewJob {
            id: JobId::from_ulid(Ulid::new()),
            queue: "sync".into(),
            kind: JobKind::Sync,
            payload: json!({}),
            max_attempts,
            scheduled_at: now(),
            unique_key: None,
            created_at: now(),
        })
    }

    #[rstest]
    #[case(JobState::Available, false)]
    #[case(JobState::Running, false)]
    #[case(JobState::Retryable, false)]
    #[case(JobState::Completed, true)]
    #[case(JobState::Discarded, true)]
    #[case(JobState::Cancelled, true)]
    fn terminal_states(#[case] state: JobState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_in_flight(), !terminal);
    }

    #[test]
    fn kind_and_state_round_trip_through_str() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("backup".parse::<JobKind>().is_err());
    }

    #[test]
    fn start_attempt_increments_and_marks_running() {
        let mut job = record(3);
        assert!(job.is_claimable(now()));
        job.start_attempt(now());
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert!(job.is_leased_by(1));
        assert!(!job.is_leased_by(2));
    }

    #[test]
    fn future_or_exhausted_jobs_are_not_claimable() {
        let mut job = record(1);
        assert!(!job.is_claimable(now() - chrono::Duration::seconds(1)));

        job.start_attempt(now());
        job.apply(Transition::Release, now());
        assert!(job.is_claimable(now()));

        job.attempt = job.max_attempts;
        assert!(!job.is_claimable(now()));
    }

    #[test]
    fn retry_then_promote() {
        let mut job = record(3);
        job.start_attempt(now());
        let later = now() + chrono::Duration::seconds(2);
        let error = JobFailure::from_error(&JobError::Timeout(std::time::Duration::from_secs(1)), 1, now());
        job.apply(
            Transition::Retry {
                scheduled_at: later,
                error,
            },
            now(),
        );
        assert_eq!(job.state, JobState::Retryable);
        assert!(!job.promote_if_due(now()));
        assert!(job.promote_if_due(later));
        assert_eq!(job.state, JobState::Available);
        assert_eq!(job.last_error.as_ref().unwrap().class, FailureClass::Timeout);
    }

    #[test]
    fn rescue_discards_when_attempts_are_exhausted() {
        let mut job = record(1);
        job.start_attempt(now());
        job.rescue(now());
        assert_eq!(job.state, JobState::Discarded);
        assert!(job.finalized_at.is_some());

        let mut job = record(2);
        job.start_attempt(now());
        job.rescue(now());
        assert_eq!(job.state, JobState::Retryable);
        assert_eq!(
            job.last_error.unwrap().class,
            FailureClass::Interrupted
        );
    }

    #[test]
    fn rescue_finalizes_cancel_requested_jobs() {
        let mut job = record(3);
        job.start_attempt(now());
        job.cancel_requested = true;
        job.rescue(now());
        assert_eq!(job.state, JobState::Cancelled);
    }
}
