//! Typed job arguments.
//!
//! # 学習ポイント
//! - Associated Constants (`const KIND`)
//! - payload は queue からは不透明な JSON、handler 側で型に戻す
//!
//! 各 args 型は enqueue 時に [`JobArgs::validate`] で検証され、不正な payload は
//! job が作られる前に `JobError::Validation` で拒否されます。

use chrono::{Datelike, Months, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::finance::DateRange;
use super::ids::{ConnectionId, OrganizationId};
use super::job::JobKind;
use crate::error::JobError;

/// JobArgs は payload の型と JobKind を対応付ける
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: JobKind;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// In-flight uniqueness key. A second enqueue with the same key while a
    /// job holding it is Available / Running / Retryable merges into that job.
    fn unique_key(&self) -> Option<String> {
        None
    }
}

/// Decode and validate a raw payload for `kind`, returning its uniqueness key.
pub fn inspect_payload(
    kind: JobKind,
    payload: &serde_json::Value,
) -> Result<Option<String>, JobError> {
    match kind {
        JobKind::Sync => inspect::<SyncArgs>(payload),
        JobKind::Analysis => inspect::<AnalysisArgs>(payload),
        JobKind::Maintenance => inspect::<MaintenanceArgs>(payload),
    }
}

fn inspect<A: JobArgs>(payload: &serde_json::Value) -> Result<Option<String>, JobError> {
    let args: A = serde_json::from_value(payload.clone())
        .map_err(|e| JobError::Validation(format!("{} payload: {e}", A::KIND)))?;
    args.validate()
        .map_err(|e| JobError::Validation(format!("{} payload: {e}", A::KIND)))?;
    Ok(args.unique_key())
}

// ========================================
// Sync
// ========================================

/// What a sync job does with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch and reconcile into the ledger.
    #[default]
    Reconcile,
    /// Connection test: decrypt and list accounts, optionally fetch the first
    /// account's last week. Writes nothing to the ledger.
    Verify {
        #[serde(default)]
        sample_transactions: bool,
    },
}

impl SyncMode {
    pub fn is_reconcile(&self) -> bool {
        matches!(self, SyncMode::Reconcile)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncArgs {
    pub organization_id: OrganizationId,
    pub connection_id: ConnectionId,
    /// Restrict the sync to one provider account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_account_id: Option<String>,
    /// Explicit range; otherwise derived from the account's cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "SyncMode::is_reconcile")]
    pub mode: SyncMode,
}

impl SyncArgs {
    pub fn new(organization_id: OrganizationId, connection_id: ConnectionId) -> Self {
        Self {
            organization_id,
            connection_id,
            provider_account_id: None,
            date_range: None,
            mode: SyncMode::Reconcile,
        }
    }

    /// Connection test for `connection_id`.
    pub fn verify(
        organization_id: OrganizationId,
        connection_id: ConnectionId,
        sample_transactions: bool,
    ) -> Self {
        Self {
            mode: SyncMode::Verify {
                sample_transactions,
            },
            ..Self::new(organization_id, connection_id)
        }
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_account(mut self, provider_account_id: impl Into<String>) -> Self {
        self.provider_account_id = Some(provider_account_id.into());
        self
    }
}

impl JobArgs for SyncArgs {
    const KIND: JobKind = JobKind::Sync;

    fn validate(&self) -> Result<(), String> {
        if let Some(range) = &self.date_range {
            range.validate()?;
        }
        if matches!(&self.provider_account_id, Some(id) if id.trim().is_empty()) {
            return Err("provider_account_id must not be empty".to_string());
        }
        if !self.mode.is_reconcile()
            && (self.date_range.is_some() || self.provider_account_id.is_some())
        {
            return Err("a connection test takes no date_range or provider_account_id".to_string());
        }
        Ok(())
    }

    fn unique_key(&self) -> Option<String> {
        Some(sync_unique_key(self.connection_id))
    }
}

pub fn sync_unique_key(connection_id: ConnectionId) -> String {
    format!("sync:{}", connection_id.as_ulid())
}

// ========================================
// Analysis
// ========================================

/// Reporting period, resolved against the current UTC date when the job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RangePreset {
    #[default]
    CurrentMonth,
    LastMonth,
    #[serde(rename = "last_3_months")]
    Last3Months,
    CurrentYear,
    LastYear,
    Custom {
        start: NaiveDate,
        end: NaiveDate,
    },
}

impl RangePreset {
    pub fn resolve(&self, today: NaiveDate) -> Result<DateRange, String> {
        let first_of_month = today.with_day(1).unwrap_or(today);
        match *self {
            RangePreset::CurrentMonth => DateRange::new(first_of_month, today),
            RangePreset::LastMonth => {
                let start = first_of_month
                    .checked_sub_months(Months::new(1))
                    .ok_or("date out of range")?;
                let end = first_of_month.pred_opt().ok_or("date out of range")?;
                DateRange::new(start, end)
            }
            RangePreset::Last3Months => {
                let start = first_of_month
                    .checked_sub_months(Months::new(3))
                    .ok_or("date out of range")?;
                DateRange::new(start, today)
            }
            RangePreset::CurrentYear => {
                let start =
                    NaiveDate::from_ymd_opt(today.year(), 1, 1).ok_or("date out of range")?;
                DateRange::new(start, today)
            }
            RangePreset::LastYear => {
                let year = today.year() - 1;
                let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or("date out of range")?;
                let end = NaiveDate::from_ymd_opt(year, 12, 31).ok_or("date out of range")?;
                DateRange::new(start, end)
            }
            RangePreset::Custom { start, end } => DateRange::new(start, end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Spending,
    Trends,
    Insights,
    Budgets,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Spending => "spending",
            AnalysisType::Trends => "trends",
            AnalysisType::Insights => "insights",
            AnalysisType::Budgets => "budgets",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    Ntfy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisArgs {
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub range: RangePreset,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_channels: Vec<NotifyChannel>,
    /// Skip enqueueing when no ledger data changed since the last completed run.
    #[serde(default)]
    pub skip_if_unchanged: bool,
}

impl AnalysisArgs {
    pub fn new(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            range: RangePreset::default(),
            analysis_type: AnalysisType::default(),
            notify_channels: Vec::new(),
            skip_if_unchanged: false,
        }
    }
}

impl JobArgs for AnalysisArgs {
    const KIND: JobKind = JobKind::Analysis;

    fn validate(&self) -> Result<(), String> {
        if let RangePreset::Custom { start, end } = self.range {
            DateRange::new(start, end)?;
        }
        Ok(())
    }
}

// ========================================
// Maintenance
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    /// Delete finalized jobs older than their retention.
    PurgeFinalizedJobs,
    /// Return jobs stuck in Running (lost worker) to the queue.
    RescueStuckJobs,
}

impl MaintenanceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::PurgeFinalizedJobs => "purge_finalized_jobs",
            MaintenanceTask::RescueStuckJobs => "rescue_stuck_jobs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceArgs {
    pub task: MaintenanceTask,
    #[serde(default)]
    pub dry_run: bool,
}

impl MaintenanceArgs {
    pub fn new(task: MaintenanceTask) -> Self {
        Self {
            task,
            dry_run: false,
        }
    }
}

impl JobArgs for MaintenanceArgs {
    const KIND: JobKind = JobKind::Maintenance;

    fn unique_key(&self) -> Option<String> {
        Some(format!("maintenance:{}", self.task.as_str()))
    }
}
