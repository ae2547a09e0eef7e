//! Configuration for the finsync worker and CLI.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with FINSYNC_ prefix)
//! 3. .env files
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::JobKind;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    /// Served queues and their executor budgets
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub jobs: JobDefaults,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Vault key material. Set the key via FINSYNC_VAULT_KEY rather than the file.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Base64 encoded 32-byte key used for new ciphertexts
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_key_version")]
    pub key_version: u32,

    /// Older keys that can still decrypt until connections are resealed
    #[serde(default)]
    pub retired_keys: Vec<RetiredKey>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RetiredKey {
    pub version: u32,
    pub key: String,
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let retired: Vec<u32> = self.retired_keys.iter().map(|k| k.version).collect();
        f.debug_struct("VaultConfig")
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("key_version", &self.key_version)
            .field("retired_versions", &retired)
            .finish()
    }
}

impl fmt::Debug for RetiredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredKey")
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// One served queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    /// Concurrent executors in this process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Jobs claimed per round trip
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cap on Running jobs in this queue across every process
    #[serde(default)]
    pub max_running: Option<usize>,

    /// Job kinds routed here; empty means the kinds whose default queue has this name
    #[serde(default)]
    pub kinds: Vec<JobKind>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            batch_size: default_batch_size(),
            max_running: None,
            kinds: Vec::new(),
        }
    }

    pub fn routed_kinds(&self) -> Vec<JobKind> {
        if self.kinds.is_empty() {
            JobKind::ALL
                .into_iter()
                .filter(|k| k.default_queue() == self.name)
                .collect()
        } else {
            self.kinds.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Idle executors re-check the store at this interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often a running job's durable cancel flag is checked
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,

    /// Time in-flight handlers get to finish after shutdown is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Time cancelled handlers get to unwind before their tasks are aborted
    #[serde(default = "default_force_stop")]
    pub force_stop_seconds: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn force_stop(&self) -> Duration {
        Duration::from_secs(self.force_stop_seconds)
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_retry_factor")]
    pub factor: f64,

    #[serde(default = "default_retry_max_seconds")]
    pub max_delay_seconds: u64,

    /// Relative jitter, e.g. 0.2 for ±20%
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

/// Per-kind handler deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_sync_timeout")]
    pub sync_seconds: u64,

    #[serde(default = "default_analysis_timeout")]
    pub analysis_seconds: u64,

    #[serde(default = "default_maintenance_timeout")]
    pub maintenance_seconds: u64,
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: JobKind) -> Duration {
        let secs = match kind {
            JobKind::Sync => self.sync_seconds,
            JobKind::Analysis => self.analysis_seconds,
            JobKind::Maintenance => self.maintenance_seconds,
        };
        Duration::from_secs(secs)
    }

    pub fn longest(&self) -> Duration {
        JobKind::ALL
            .into_iter()
            .map(|k| self.for_kind(k))
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Run the periodic maintenance scheduler inside the worker
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_maintenance_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_completed_retention")]
    pub completed_retention_hours: u64,

    #[serde(default = "default_cancelled_retention")]
    pub cancelled_retention_hours: u64,

    #[serde(default = "default_discarded_retention")]
    pub discarded_retention_hours: u64,

    /// Running jobs claimed longer ago than this are considered abandoned
    #[serde(default = "default_rescue_after")]
    pub rescue_after_seconds: u64,
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn rescue_after(&self) -> Duration {
        Duration::from_secs(self.rescue_after_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Range fetched for an account that has never been synced
    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_provider_timeout")]
    pub simplefin_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_ntfy_server")]
    pub ntfy_server: String,

    /// Notifications are disabled without a topic
    #[serde(default)]
    pub ntfy_topic: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// HTTP endpoint of the analysis service
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_analysis_request_timeout")]
    pub timeout_seconds: u64,
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "console" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_database_path() -> String {
    "finsync.db".to_string()
}

fn default_key_version() -> u32 {
    1
}

fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("sync", 3),
        QueueConfig::new("analysis", 1),
        QueueConfig::new("maintenance", 1),
    ]
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_cancel_poll_interval_ms() -> u64 {
    2_000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_force_stop() -> u64 {
    5
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_seconds() -> u64 {
    300 // 5 minutes
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_sync_timeout() -> u64 {
    900 // 15 minutes
}

fn default_analysis_timeout() -> u64 {
    600
}

fn default_maintenance_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_maintenance_interval() -> u64 {
    3_600
}

fn default_completed_retention() -> u64 {
    24 * 7
}

fn default_cancelled_retention() -> u64 {
    24
}

fn default_discarded_retention() -> u64 {
    24 * 7
}

fn default_rescue_after() -> u64 {
    1_800 // 30 minutes
}

fn default_lookback_days() -> u32 {
    30
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_ntfy_server() -> String {
    "https://ntfy.sh".to_string()
}

fn default_analysis_request_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_database_path(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
            shutdown_grace_seconds: default_shutdown_grace(),
            force_stop_seconds: default_force_stop(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            factor: default_retry_factor(),
            max_delay_seconds: default_retry_max_seconds(),
            jitter: default_retry_jitter(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sync_seconds: default_sync_timeout(),
            analysis_seconds: default_analysis_timeout(),
            maintenance_seconds: default_maintenance_timeout(),
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_maintenance_interval(),
            completed_retention_hours: default_completed_retention(),
            cancelled_retention_hours: default_cancelled_retention(),
            discarded_retention_hours: default_discarded_retention(),
            rescue_after_seconds: default_rescue_after(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_lookback_days: default_lookback_days(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            simplefin_timeout_seconds: default_provider_timeout(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            ntfy_server: default_ntfy_server(),
            ntfy_topic: None,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_seconds: default_analysis_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            vault: VaultConfig {
                key_version: default_key_version(),
                ..VaultConfig::default()
            },
            queues: default_queues(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            jobs: JobDefaults::default(),
            maintenance: MaintenanceConfig::default(),
            sync: SyncConfig::default(),
            providers: ProvidersConfig::default(),
            notifications: NotificationConfig::default(),
            analysis: AnalysisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load configuration with the following precedence:
    /// 1. Load .env file if it exists
    /// 2. Load from file if provided
    /// 3. Apply environment variable overrides
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => AppConfig::default(),
        };

        let config = config.merge_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Merge environment variables into this configuration.
    ///
    /// Only variables that are set override the file-loaded (or default)
    /// values. Unparsable numbers are an error rather than silently ignored.
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Database
        if let Some(v) = lookup("FINSYNC_DATABASE_BACKEND") {
            self.database.backend = v;
        }
        if let Some(v) = lookup("FINSYNC_DATABASE_PATH") {
            self.database.path = v;
        }

        // Vault
        if let Some(v) = lookup("FINSYNC_VAULT_KEY") {
            self.vault.key = Some(v);
        }
        if let Some(v) = lookup("FINSYNC_VAULT_KEY_VERSION") {
            self.vault.key_version = parse_env("FINSYNC_VAULT_KEY_VERSION", &v)?;
        }

        // Jobs / worker
        if let Some(v) = lookup("FINSYNC_MAX_ATTEMPTS") {
            self.jobs.max_attempts = parse_env("FINSYNC_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("FINSYNC_SHUTDOWN_GRACE_SECONDS") {
            self.worker.shutdown_grace_seconds = parse_env("FINSYNC_SHUTDOWN_GRACE_SECONDS", &v)?;
        }
        if let Some(v) = lookup("FINSYNC_SYNC_WORKERS") {
            let workers = parse_env("FINSYNC_SYNC_WORKERS", &v)?;
            if let Some(queue) = self.queues.iter_mut().find(|q| q.name == "sync") {
                queue.workers = workers;
            }
        }

        // Collaborators
        if let Some(v) = lookup("FINSYNC_NTFY_SERVER") {
            self.notifications.ntfy_server = v;
        }
        if let Some(v) = lookup("FINSYNC_NTFY_TOPIC") {
            self.notifications.ntfy_topic = Some(v);
        }
        if let Some(v) = lookup("FINSYNC_ANALYSIS_ENDPOINT") {
            self.analysis.endpoint = Some(v);
        }
        if let Some(v) = lookup("FINSYNC_ANALYSIS_API_KEY") {
            self.analysis.api_key = Some(v);
        }

        // Logging
        if let Some(v) = lookup("FINSYNC_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("FINSYNC_LOG_FORMAT") {
            self.logging.format = v;
        }

        Ok(self)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.database.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown database backend: {other}"
                )));
            }
        }

        self.validate_queues()?;
        self.validate_retry()?;

        if self.jobs.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "jobs.max_attempts must be at least 1".to_string(),
            ));
        }

        if JobKind::ALL
            .into_iter()
            .any(|k| self.timeouts.for_kind(k).is_zero())
        {
            return Err(ConfigError::ValidationError(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        // 実行中の job を rescue してはいけない
        if self.maintenance.rescue_after() <= self.timeouts.longest() {
            return Err(ConfigError::ValidationError(format!(
                "maintenance.rescue_after_seconds ({}) must exceed the longest job timeout ({}s)",
                self.maintenance.rescue_after_seconds,
                self.timeouts.longest().as_secs()
            )));
        }

        if self.maintenance.enabled && self.maintenance.interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "maintenance.interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.worker.poll_interval_ms == 0 || self.worker.cancel_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "worker poll intervals must be greater than 0".to_string(),
            ));
        }

        // running leases are renewed on the cancel poll
        if self.worker.cancel_poll_interval() >= self.maintenance.rescue_after() {
            return Err(ConfigError::ValidationError(
                "worker.cancel_poll_interval_ms must be shorter than maintenance.rescue_after_seconds"
                    .to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )));
            }
        }

        match self.logging.format.as_str() {
            "console" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {other}"
                )));
            }
        }

        Ok(())
    }

    /// Commands that touch credentials need a vault key.
    pub fn require_vault_key(&self) -> Result<&str, ConfigError> {
        self.vault.key.as_deref().ok_or_else(|| {
            ConfigError::ValidationError(
                "vault key is not configured; set FINSYNC_VAULT_KEY".to_string(),
            )
        })
    }

    /// Queue a job kind is routed to.
    pub fn queue_for(&self, kind: JobKind) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.routed_kinds().contains(&kind))
    }

    fn validate_queues(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one queue must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for queue in &self.queues {
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate queue: {}",
                    queue.name
                )));
            }
            if queue.workers == 0 || queue.batch_size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "queue {}: workers and batch_size must be greater than 0",
                    queue.name
                )));
            }
            if queue.max_running == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "queue {}: max_running must be greater than 0",
                    queue.name
                )));
            }
        }

        for kind in JobKind::ALL {
            let routed = self
                .queues
                .iter()
                .filter(|q| q.routed_kinds().contains(&kind))
                .count();
            if routed > 1 {
                return Err(ConfigError::ValidationError(format!(
                    "job kind {kind} is routed to more than one queue"
                )));
            }
        }

        Ok(())
    }

    fn validate_retry(&self) -> Result<(), ConfigError> {
        let r = &self.retry;
        if r.base_ms == 0 || r.max_delay_seconds.saturating_mul(1_000) < r.base_ms {
            return Err(ConfigError::ValidationError(
                "retry.base_ms must be positive and not above retry.max_delay_seconds".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return Err(ConfigError::ValidationError(
                "retry.jitter must be in [0, 1)".to_string(),
            ));
        }
        // 連続する delay が単調非減少になる条件
        if r.factor * (1.0 - r.jitter) < 1.0 + r.jitter {
            return Err(ConfigError::ValidationError(format!(
                "retry.factor {} is too small for jitter {}; delays would not be monotonic",
                r.factor, r.jitter
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("{name}: cannot parse '{value}'")))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.backend, "sqlite");
        assert_eq!(config.jobs.max_attempts, 3);
        assert_eq!(config.retry.max_delay_seconds, 300);
        assert_eq!(config.timeouts.for_kind(JobKind::Sync), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_queues_route_every_kind() {
        let config = AppConfig::default();
        for kind in JobKind::ALL {
            assert_eq!(config.queue_for(kind).unwrap().name, kind.default_queue());
        }
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = r#"
database:
  path: /var/lib/finsync/jobs.db
queues:
  - name: sync
    workers: 4
    max_running: 8
  - name: background
    kinds: [analysis, maintenance]
retry:
  jitter: 0.1
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.database.path, "/var/lib/finsync/jobs.db");
        assert_eq!(config.queues[0].workers, 4);
        assert_eq!(config.queues[0].batch_size, 5);
        assert_eq!(config.queue_for(JobKind::Analysis).unwrap().name, "background");
        assert_eq!(config.retry.jitter, 0.1);
        assert_eq!(config.retry.factor, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let config = AppConfig::default()
            .merge_env(env(&[
                ("FINSYNC_DATABASE_PATH", "/tmp/x.db"),
                ("FINSYNC_VAULT_KEY", "abc"),
                ("FINSYNC_SYNC_WORKERS", "7"),
                ("FINSYNC_NTFY_TOPIC", "finance"),
            ]))
            .unwrap();
        assert_eq!(config.database.path, "/tmp/x.db");
        assert_eq!(config.require_vault_key().unwrap(), "abc");
        assert_eq!(config.queue_for(JobKind::Sync).unwrap().workers, 7);
        assert_eq!(config.notifications.ntfy_topic.as_deref(), Some("finance"));
    }

    #[test]
    fn unparsable_env_number_is_an_error() {
        let result = AppConfig::default().merge_env(env(&[("FINSYNC_MAX_ATTEMPTS", "many")]));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.database.backend = "postgres".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queues[0].workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queues.push(QueueConfig::new("sync", 1));
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.factor = 1.1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.maintenance.rescue_after_seconds = 60;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.cancel_poll_interval_ms = config.maintenance.rescue_after_seconds * 1_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn huge_retry_cap_does_not_overflow() {
        let mut config = AppConfig::default();
        config.retry.max_delay_seconds = u64::MAX;
        assert!(config.validate().is_ok());

        config.retry.base_ms = u64::MAX;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.vault.key = Some("c2VjcmV0LWtleS1tYXRlcmlhbA==".into());
        config.analysis.api_key = Some("sk-live-123".into());
        let shown = format!("{config:?}");
        assert!(!shown.contains("c2VjcmV0"));
        assert!(!shown.contains("sk-live-123"));
        assert!(shown.contains("[REDACTED]"));
    }

    #[test]
    fn missing_vault_key_is_reported() {
        assert!(AppConfig::default().require_vault_key().is_err());
    }
}
