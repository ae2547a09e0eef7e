//! Wiring: config → stores → engine → service / worker pool.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use finsync_core::config::AppConfig;
use finsync_core::domain::{AnalysisArgs, MaintenanceArgs, SyncArgs};
use finsync_core::handlers::{
    AnalysisHandler, HttpAnalysisService, MaintenanceHandler, RetentionPolicy,
};
use finsync_core::notify::NtfyNotifier;
use finsync_core::ports::{
    AnalysisError, AnalysisReport, AnalysisRequest, AnalysisService, Clock, ConnectionStore,
    JobStore, LedgerRepository, Notifier, SystemClock, UlidGenerator,
};
use finsync_core::providers::default_registry;
use finsync_core::queue::QueueEngine;
use finsync_core::service::JobService;
use finsync_core::storage::{InMemoryStore, SqliteStore};
use finsync_core::sync::{SyncOrchestrator, SyncSettings};
use finsync_core::vault::CredentialVault;
use finsync_core::worker::{WorkerOptions, WorkerPool, WorkerPoolBuilder};

/// The three store ports, backed by one store instance.
#[derive(Clone)]
pub struct Backend {
    pub jobs: Arc<dyn JobStore>,
    pub connections: Arc<dyn ConnectionStore>,
    pub ledger: Arc<dyn LedgerRepository>,
}

impl Backend {
    pub fn open(config: &AppConfig) -> Result<Self> {
        match config.database.backend.as_str() {
            "memory" => {
                warn!("using the in-memory backend; nothing survives this process");
                let store = Arc::new(InMemoryStore::new());
                Ok(Self {
                    jobs: store.clone(),
                    connections: store.clone(),
                    ledger: store,
                })
            }
            "sqlite" => {
                let path = Path::new(&config.database.path);
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let store = Arc::new(
                    SqliteStore::new(path)
                        .with_context(|| format!("opening database {}", path.display()))?,
                );
                info!(path = %path.display(), "database opened");
                Ok(Self {
                    jobs: store.clone(),
                    connections: store.clone(),
                    ledger: store,
                })
            }
            other => bail!("unknown database backend '{other}'"),
        }
    }
}

pub struct App {
    pub config: AppConfig,
    pub backend: Backend,
    pub clock: Arc<dyn Clock>,
    pub engine: Arc<QueueEngine>,
    pub service: Arc<JobService>,
}

impl App {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let backend = Backend::open(&config)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = Arc::new(QueueEngine::from_config(
            backend.jobs.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(SystemClock)),
            &config,
        ));
        let service = Arc::new(JobService::new(engine.clone(), backend.ledger.clone()));
        Ok(Self {
            config,
            backend,
            clock,
            engine,
            service,
        })
    }

    pub fn vault(&self) -> Result<Arc<CredentialVault>> {
        self.config.require_vault_key()?;
        let vault = CredentialVault::from_config(&self.config.vault)
            .context("loading vault keys")?;
        Ok(Arc::new(vault))
    }

    fn notifier(&self) -> Option<Arc<dyn Notifier>> {
        let ntfy = NtfyNotifier::from_config(&self.config.notifications);
        if ntfy.is_enabled() {
            Some(Arc::new(ntfy))
        } else {
            info!("no ntfy topic configured, notifications disabled");
            None
        }
    }

    /// Build a pool serving `only` (or every configured queue when empty).
    pub fn worker_pool(&self, only: &[String]) -> Result<WorkerPool> {
        let vault = self.vault()?;
        let notifier = self.notifier();

        let mut sync = SyncOrchestrator::new(
            self.backend.connections.clone(),
            self.backend.ledger.clone(),
            default_registry(&self.config.providers),
            vault,
            self.clock.clone(),
        )
        .with_settings(SyncSettings::from(&self.config.sync));

        let analysis_service: Arc<dyn AnalysisService> =
            match HttpAnalysisService::from_config(&self.config.analysis) {
                Some(http) => Arc::new(http),
                None => {
                    warn!("no analysis endpoint configured; analysis jobs will be discarded");
                    Arc::new(Unconfigured)
                }
            };
        let mut analysis = AnalysisHandler::new(analysis_service, self.clock.clone());

        if let Some(notifier) = notifier {
            sync = sync.with_notifier(notifier.clone());
            analysis = analysis.with_notifier(notifier);
        }

        let maintenance = MaintenanceHandler::new(self.backend.jobs.clone(), self.clock.clone())
            .with_retention(RetentionPolicy::from_config(&self.config.maintenance));

        let mut options = WorkerOptions::from_config(&self.config);
        if !only.is_empty() {
            for name in only {
                if !options.queues.iter().any(|q| &q.name == name) {
                    bail!("queue '{name}' is not configured");
                }
            }
            let served = options
                .queues
                .iter()
                .filter(|q| only.contains(&q.name))
                .cloned()
                .collect();
            options = options.with_queues(served);
        }

        let pool = WorkerPoolBuilder::new(self.engine.clone(), options)
            .register::<SyncArgs, _>(sync)?
            .register::<AnalysisArgs, _>(analysis)?
            .register::<MaintenanceArgs, _>(maintenance)?
            .build()?;
        Ok(pool)
    }
}

/// Stand-in delegate used when no analysis endpoint is configured.
struct Unconfigured;

#[async_trait]
impl AnalysisService for Unconfigured {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalysisReport, AnalysisError> {
        Err(AnalysisError::Rejected(
            "no analysis endpoint configured".to_string(),
        ))
    }
}
