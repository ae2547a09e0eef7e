//! Analysis jobs: resolve the reporting period, ask the analysis service for a
//! report and forward its summary to the requested channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::AnalysisConfig;
use crate::domain::{AnalysisArgs, AnalysisType, NotifyChannel, OrganizationId};
use crate::error::JobError;
use crate::ports::{
    AnalysisError, AnalysisReport, AnalysisRequest, AnalysisService, Clock, Notification,
    Notifier,
};
use crate::worker::{Handler, JobContext};

pub fn map_analysis_error(err: AnalysisError) -> JobError {
    match err {
        AnalysisError::Unavailable(msg) => JobError::TransientProvider(msg),
        AnalysisError::Rejected(msg) => JobError::PermanentProvider(msg),
    }
}

pub struct AnalysisHandler {
    service: Arc<dyn AnalysisService>,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl AnalysisHandler {
    pub fn new(service: Arc<dyn AnalysisService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            clock,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[instrument(skip_all, fields(organization_id = %args.organization_id, job_id = %ctx.job_id))]
    pub async fn run(
        &self,
        ctx: &JobContext,
        args: &AnalysisArgs,
    ) -> Result<AnalysisReport, JobError> {
        let today = self.clock.now().date_naive();
        let range = args.range.resolve(today).map_err(JobError::Validation)?;
        let request = AnalysisRequest::new(args.organization_id, args.analysis_type, range);

        ctx.checkpoint()?;
        let report = ctx
            .guard(self.service.analyze(&request))
            .await?
            .map_err(map_analysis_error)?;
        ctx.checkpoint()?;

        info!(
            analysis_type = args.analysis_type.as_str(),
            start = %range.start,
            end = %range.end,
            report_len = report.report.len(),
            "analysis finished"
        );

        for channel in &args.notify_channels {
            self.forward(*channel, args.analysis_type, &report).await;
        }
        Ok(report)
    }

    async fn forward(&self, channel: NotifyChannel, kind: AnalysisType, report: &AnalysisReport) {
        match channel {
            NotifyChannel::Ntfy => {
                let Some(notifier) = &self.notifier else {
                    debug!("ntfy requested but no notifier configured");
                    return;
                };
                let message = format!("{} analysis: {}", kind.as_str(), report.summary);
                if let Err(err) = notifier.notify(&Notification::info(message)).await {
                    warn!(error = %err, "could not deliver analysis summary");
                }
            }
        }
    }
}

#[async_trait]
impl Handler<AnalysisArgs> for AnalysisHandler {
    async fn handle(&self, ctx: &JobContext, args: AnalysisArgs) -> Result<(), JobError> {
        self.run(ctx, &args).await.map(|_| ())
    }
}

// ========================================
// HTTP delegate
// ========================================

#[derive(Debug, Serialize)]
struct AnalyzeBody<'a> {
    organization_id: OrganizationId,
    analysis_type: &'a str,
    start: chrono::NaiveDate,
    end: chrono::NaiveDate,
}

/// Posts the request as JSON to a configured endpoint and decodes an
/// [`AnalysisReport`] from the response.
#[derive(Clone)]
pub struct HttpAnalysisService {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAnalysisService {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &AnalysisConfig) -> Option<Self> {
        let endpoint = config.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        Some(Self::new(
            endpoint,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_seconds),
        ))
    }
}

impl std::fmt::Debug for HttpAnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAnalysisService")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisReport, AnalysisError> {
        let body = AnalyzeBody {
            organization_id: request.organization_id,
            analysis_type: request.analysis_type.as_str(),
            start: request.start,
            end: request.end,
        };
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AnalysisError::Unavailable(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("analysis service returned {status}");
            return Err(if is_retryable_status(status) {
                AnalysisError::Unavailable(message)
            } else {
                AnalysisError::Rejected(message)
            });
        }

        response
            .json::<AnalysisReport>()
            .await
            .map_err(|e| AnalysisError::Rejected(format!("unreadable report: {}", e.without_url())))
    }
}
