//! Collaborators of the analysis handler: the AI analysis delegate and the
//! notification channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AnalysisType, DateRange, OrganizationId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub organization_id: OrganizationId,
    pub analysis_type: AnalysisType,
    pub start: chrono::NaiveDate,
    pub end: chrono::NaiveDate,
}

impl AnalysisRequest {
    pub fn new(
        organization_id: OrganizationId,
        analysis_type: AnalysisType,
        range: DateRange,
    ) -> Self {
        Self {
            organization_id,
            analysis_type,
            start: range.start,
            end: range.end,
        }
    }
}

/// Formatted report returned by the delegate.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisReport {
    pub summary: String,
    #[serde(default)]
    pub report: String,
}

#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error("analysis service unavailable: {0}")]
    Unavailable(String),
    #[error("analysis rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisReport, AnalysisError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Default,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub message: String,
    pub priority: Priority,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            priority: Priority::Default,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            priority: Priority::High,
        }
    }
}

#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}
