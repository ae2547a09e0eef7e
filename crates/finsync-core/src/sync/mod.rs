//! Sync orchestrator: reconcile one provider connection into the ledger.
//!
//! All provider I/O happens before the first write, and cursors advance only
//! after every account and transaction of the run has been written. A sync
//! cancelled or failed midway therefore leaves cursors where they were and
//! the next run re-fetches the same range; upserts make that harmless.
//!
//! A [`SyncMode::Verify`] job is a connection test: it goes through the same
//! vault and provider path but never touches the ledger or the cursors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::domain::{
    Connection, ConnectionId, ConnectionStatus, DateRange, ProviderAccount, ProviderTransaction,
    SyncArgs, SyncMode, UpsertSummary,
};
use crate::error::JobError;
use crate::ports::{
    Clock, ConnectionStore, LedgerRepository, Notification, Notifier, ProviderClient,
    ProviderError, ProviderRegistry,
};
use crate::vault::{CredentialVault, Credentials};
use crate::worker::{Handler, JobContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Range fetched for an account without a cursor.
    pub lookback_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { lookback_days: 30 }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            lookback_days: config.default_lookback_days,
        }
    }
}

/// Days of history a connection test samples from the first account.
const VERIFY_SAMPLE_DAYS: u64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub accounts: usize,
    pub transactions: UpsertSummary,
    /// Transactions seen by a connection test's sample fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled_transactions: Option<usize>,
}

/// Everything fetched for one account before reconciliation starts.
struct FetchedAccount {
    account: ProviderAccount,
    range: DateRange,
    transactions: Vec<ProviderTransaction>,
}

pub fn map_provider_error(err: ProviderError) -> JobError {
    if err.is_transient() {
        JobError::TransientProvider(err.to_string())
    } else {
        JobError::PermanentProvider(err.to_string())
    }
}

pub struct SyncOrchestrator {
    connections: Arc<dyn ConnectionStore>,
    ledger: Arc<dyn LedgerRepository>,
    providers: ProviderRegistry,
    vault: Arc<CredentialVault>,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn Notifier>>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        ledger: Arc<dyn LedgerRepository>,
        providers: ProviderRegistry,
        vault: Arc<CredentialVault>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connections,
            ledger,
            providers,
            vault,
            clock,
            notifier: None,
            settings: SyncSettings::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    #[instrument(skip_all, fields(connection_id = %args.connection_id, job_id = %ctx.job_id))]
    pub async fn run(&self, ctx: &JobContext, args: &SyncArgs) -> Result<SyncReport, JobError> {
        let connection = self.load_connection(args).await?;
        let outcome = match args.mode {
            SyncMode::Reconcile => self.sync_connection(ctx, args, &connection).await,
            SyncMode::Verify {
                sample_transactions,
            } => {
                self.verify_connection(ctx, &connection, sample_transactions)
                    .await
            }
        };
        match outcome {
            Ok(report) => Ok(report),
            Err(err) => {
                self.record_failure(&connection, args.mode, &err).await;
                Err(err)
            }
        }
    }

    async fn load_connection(&self, args: &SyncArgs) -> Result<Connection, JobError> {
        let connection = self
            .connections
            .get_connection(args.connection_id)
            .await?
            .ok_or_else(|| {
                JobError::Validation(format!("connection {} not found", args.connection_id))
            })?;
        if connection.organization_id != args.organization_id {
            return Err(JobError::Validation(format!(
                "connection {} does not belong to organization {}",
                connection.id, args.organization_id
            )));
        }
        if connection.status == ConnectionStatus::Disabled {
            return Err(JobError::ConnectionDisabled(connection.id));
        }
        Ok(connection)
    }

    fn open_credentials(&self, connection: &Connection) -> Result<Credentials, JobError> {
        self.vault
            .open(&connection.credentials, &connection.credentials_aad())
            .map_err(|e| JobError::Credential(e.to_string()))
    }

    fn provider_for(&self, connection: &Connection) -> Result<Arc<dyn ProviderClient>, JobError> {
        self.providers
            .get(&connection.provider_type)
            .ok_or_else(|| {
                JobError::Internal(format!(
                    "no provider client for '{}'",
                    connection.provider_type
                ))
            })
    }

    async fn verify_connection(
        &self,
        ctx: &JobContext,
        connection: &Connection,
        sample_transactions: bool,
    ) -> Result<SyncReport, JobError> {
        let credentials = self.open_credentials(connection)?;
        let provider = self.provider_for(connection)?;

        ctx.checkpoint()?;
        let accounts = ctx
            .guard(provider.list_accounts(&credentials))
            .await?
            .map_err(map_provider_error)?;
        let mut report = SyncReport {
            accounts: accounts.len(),
            ..SyncReport::default()
        };

        if sample_transactions && let Some(first) = accounts.first() {
            let today = self.clock.now().date_naive();
            let start = today
                .checked_sub_days(Days::new(VERIFY_SAMPLE_DAYS))
                .unwrap_or(today);
            ctx.checkpoint()?;
            let sample = ctx
                .guard(provider.get_transactions(
                    &credentials,
                    &first.provider_account_id,
                    start,
                    today,
                ))
                .await?
                .map_err(map_provider_error)?;
            report.sampled_transactions = Some(sample.len());
        }
        drop(credentials);

        ctx.checkpoint()?;
        self.connections
            .mark_connection_verified(connection.id, "connection test passed")
            .await?;
        Ok(report)
    }

    async fn sync_connection(
        &self,
        ctx: &JobContext,
        args: &SyncArgs,
        connection: &Connection,
    ) -> Result<SyncReport, JobError> {
        let credentials = self.open_credentials(connection)?;
        let provider = self.provider_for(connection)?;

        ctx.checkpoint()?;
        let accounts = match &args.provider_account_id {
            Some(pid) => match self.ledger.find_account(connection.id, pid).await? {
                Some(stored) => vec![stored.as_provider_account()],
                None => {
                    let listed = ctx
                        .guard(provider.list_accounts(&credentials))
                        .await?
                        .map_err(map_provider_error)?;
                    let scoped: Vec<_> = listed
                        .into_iter()
                        .filter(|a| a.provider_account_id == *pid)
                        .collect();
                    if scoped.is_empty() {
                        return Err(JobError::Validation(format!(
                            "provider account '{pid}' not found on connection"
                        )));
                    }
                    scoped
                }
            },
            None => ctx
                .guard(provider.list_accounts(&credentials))
                .await?
                .map_err(map_provider_error)?,
        };
        debug!(accounts = accounts.len(), "accounts listed");

        let today = self.clock.now().date_naive();
        let mut fetched = Vec::with_capacity(accounts.len());
        for account in accounts {
            let range = self
                .resolve_range(args, connection.id, &account.provider_account_id, today)
                .await?;
            ctx.checkpoint()?;
            let transactions = ctx
                .guard(provider.get_transactions(
                    &credentials,
                    &account.provider_account_id,
                    range.start,
                    range.end,
                ))
                .await?
                .map_err(map_provider_error)?;
            debug!(
                provider_account_id = %account.provider_account_id,
                start = %range.start,
                end = %range.end,
                transactions = transactions.len(),
                "transactions fetched"
            );
            fetched.push(FetchedAccount {
                account,
                range,
                transactions,
            });
        }
        drop(credentials);

        ctx.checkpoint()?;
        let now = self.clock.now();
        let mut report = SyncReport {
            accounts: fetched.len(),
            ..SyncReport::default()
        };
        for item in &fetched {
            let stored = self
                .ledger
                .upsert_account(connection, &item.account, now)
                .await?;
            let summary = self
                .ledger
                .upsert_transactions(stored.id, &item.transactions, now)
                .await?;
            report.transactions.merge(summary);
        }

        for item in &fetched {
            self.ledger
                .advance_cursor(
                    connection.id,
                    &item.account.provider_account_id,
                    item.range,
                    now,
                )
                .await?;
        }
        self.connections
            .mark_connection_synced(connection.id, now)
            .await?;
        Ok(report)
    }

    /// Requested range, else from the cursor up to today, else the lookback
    /// window ending today.
    async fn resolve_range(
        &self,
        args: &SyncArgs,
        connection_id: ConnectionId,
        provider_account_id: &str,
        today: NaiveDate,
    ) -> Result<DateRange, JobError> {
        if let Some(range) = args.date_range {
            return Ok(range);
        }
        let start = match self
            .ledger
            .get_cursor(connection_id, provider_account_id)
            .await?
        {
            Some(cursor) => cursor.synced_through.min(today),
            None => today
                .checked_sub_days(Days::new(u64::from(self.settings.lookback_days)))
                .unwrap_or(today),
        };
        DateRange::new(start, today).map_err(JobError::Validation)
    }

    /// Permanent failures the user has to act on flip the connection to Error.
    async fn record_failure(&self, connection: &Connection, mode: SyncMode, err: &JobError) {
        let activity = match mode {
            SyncMode::Reconcile => "sync",
            SyncMode::Verify { .. } => "connection test",
        };
        let message = match err {
            JobError::Credential(_) => {
                "credentials could not be decrypted; re-authenticate".to_string()
            }
            JobError::PermanentProvider(reason) => {
                format!("provider refused the {activity} ({reason}); re-authenticate")
            }
            _ => return,
        };

        if let Err(store_err) = self
            .connections
            .mark_connection_error(connection.id, &message)
            .await
        {
            warn!(connection_id = %connection.id, error = %store_err, "could not mark connection as failed");
        }

        if let Some(notifier) = &self.notifier {
            let notice = Notification::warning(format!(
                "The {activity} of '{}' failed: {message}",
                connection.name
            ));
            if let Err(notify_err) = notifier.notify(&notice).await {
                warn!(connection_id = %connection.id, error = %notify_err, "could not send re-authentication notice");
            }
        }
    }
}

#[async_trait]
impl Handler<SyncArgs> for SyncOrchestrator {
    async fn handle(&self, ctx: &JobContext, args: SyncArgs) -> Result<(), JobError> {
        let report = self.run(ctx, &args).await?;
        if let SyncMode::Verify { .. } = args.mode {
            info!(
                connection_id = %args.connection_id,
                accounts = report.accounts,
                sampled_transactions = ?report.sampled_transactions,
                "connection verified"
            );
            return Ok(());
        }
        info!(
            connection_id = %args.connection_id,
            accounts = report.accounts,
            inserted = report.transactions.inserted,
            updated = report.transactions.updated,
            unchanged = report.transactions.unchanged,
            "sync finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, OrganizationId, SealedCredentials};
    use crate::ports::{FixedClock, ProviderClient, ProviderErrorKind, NotifyError};
    use crate::storage::InMemoryStore;
    use crate::vault::{Credentials, VaultKey};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use ulid::Ulid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[derive(Default)]
    struct FakeProvider {
        failure: Mutex<Option<ProviderError>>,
        requested: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    }

    impl FakeProvider {
        fn failing(kind: ProviderErrorKind) -> Self {
            let provider = Self::default();
            *provider.failure.lock().unwrap() = Some(ProviderError::new("fake", kind, "nope"));
            provider
        }
    }

    #[async_trait]
    impl ProviderClient for FakeProvider {
        fn provider_type(&self) -> &str {
            "fake"
        }

        async fn list_accounts(
            &self,
            credentials: &Credentials,
        ) -> Result<Vec<ProviderAccount>, ProviderError> {
            assert_eq!(credentials.get("token"), Some("s3cret"));
            if let Some(err) = self.failure.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(vec![ProviderAccount {
                provider_account_id: "ACT-1".into(),
                name: "Checking".into(),
                currency: "USD".into(),
                balance: dec!(100.00),
                balance_date: None,
                institution: Some("First Bank".into()),
            }])
        }

        async fn get_transactions(
            &self,
            _credentials: &Credentials,
            provider_account_id: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<ProviderTransaction>, ProviderError> {
            self.requested
                .lock()
                .unwrap()
                .push((provider_account_id.to_string(), start, end));
            let all = [
                ("TX-1", date(2024, 1, 5), dec!(-12.50)),
                ("TX-2", date(2024, 1, 15), dec!(2000.00)),
                ("TX-3", date(2024, 1, 31), dec!(-80.10)),
            ];
            Ok(all
                .into_iter()
                .filter(|(_, posted, _)| start <= *posted && *posted <= end)
                .map(|(id, posted, amount)| ProviderTransaction {
                    provider_transaction_id: id.into(),
                    posted,
                    amount,
                    description: format!("{id} description"),
                    pending: false,
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        provider: Arc<FakeProvider>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: SyncOrchestrator,
        connection: Connection,
    }

    async fn fixture(provider: FakeProvider) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(provider);
        let notifier = Arc::new(RecordingNotifier::default());
        let vault = Arc::new(CredentialVault::new(VaultKey::generate(1), vec![]).unwrap());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 2, 10, 8, 0, 0).unwrap(),
        ));

        let id = ConnectionId::from_ulid(Ulid::new());
        let sealed = vault
            .seal(
                &Credentials::new().with("token", "s3cret"),
                &crate::domain::connection::credentials_aad(id),
            )
            .unwrap();
        let connection = Connection {
            id,
            organization_id: OrganizationId::from_ulid(Ulid::new()),
            provider_type: "fake".into(),
            name: "First Bank".into(),
            credentials: sealed,
            status: ConnectionStatus::Active,
            status_message: None,
            last_synced_at: None,
            created_at: clock.now(),
        };
        store.insert_connection(&connection).await.unwrap();

        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            ProviderRegistry::new().with(provider.clone()),
            vault,
            clock,
        )
        .with_notifier(notifier.clone());

        Fixture {
            store,
            provider,
            notifier,
            orchestrator,
            connection,
        }
    }

    fn args(f: &Fixture) -> SyncArgs {
        SyncArgs::new(f.connection.organization_id, f.connection.id)
    }

    #[tokio::test]
    async fn january_sync_is_idempotent() {
        let f = fixture(FakeProvider::default()).await;
        let ctx = JobContext::detached(JobKind::Sync);
        let january = DateRange::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap();

        let first = f
            .orchestrator
            .run(&ctx, &args(&f).with_range(january))
            .await
            .unwrap();
        assert_eq!(first.accounts, 1);
        assert_eq!(first.transactions.inserted, 3);

        let cursor = f
            .store
            .get_cursor(f.connection.id, "ACT-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.synced_through, date(2024, 1, 31));

        let second = f
            .orchestrator
            .run(&ctx, &args(&f).with_range(january))
            .await
            .unwrap();
        assert_eq!(second.transactions.inserted, 0);
        assert_eq!(second.transactions.unchanged, 3);
        assert_eq!(f.store.transaction_count(f.connection.id).await.unwrap(), 3);

        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Active);
        assert!(conn.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn range_defaults_to_lookback_then_cursor() {
        let f = fixture(FakeProvider::default()).await;
        let ctx = JobContext::detached(JobKind::Sync);

        f.orchestrator.run(&ctx, &args(&f)).await.unwrap();
        f.orchestrator.run(&ctx, &args(&f)).await.unwrap();

        let requested = f.provider.requested.lock().unwrap().clone();
        assert_eq!(
            requested,
            vec![
                ("ACT-1".to_string(), date(2024, 1, 11), date(2024, 2, 10)),
                ("ACT-1".to_string(), date(2024, 2, 10), date(2024, 2, 10)),
            ]
        );
    }

    #[tokio::test]
    async fn auth_failure_marks_connection_and_notifies() {
        let f = fixture(FakeProvider::failing(ProviderErrorKind::Auth)).await;
        let ctx = JobContext::detached(JobKind::Sync);

        let err = f.orchestrator.run(&ctx, &args(&f)).await.unwrap_err();
        assert!(matches!(err, JobError::PermanentProvider(_)));
        assert!(!err.is_transient());

        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Error);
        let sent = f.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].priority, crate::ports::Priority::High);
    }

    #[tokio::test]
    async fn transient_failure_leaves_connection_active() {
        let f = fixture(FakeProvider::failing(ProviderErrorKind::Transient)).await;
        let ctx = JobContext::detached(JobKind::Sync);

        let err = f.orchestrator.run(&ctx, &args(&f)).await.unwrap_err();
        assert!(err.is_transient());
        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Active);
        assert!(f.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecryptable_credentials_are_a_credential_error() {
        let f = fixture(FakeProvider::default()).await;
        let tampered = SealedCredentials {
            ciphertext: vec![0u8; 32],
            ..f.connection.credentials.clone()
        };
        f.store
            .update_credentials(f.connection.id, &tampered)
            .await
            .unwrap();

        let ctx = JobContext::detached(JobKind::Sync);
        let err = f.orchestrator.run(&ctx, &args(&f)).await.unwrap_err();
        assert!(matches!(err, JobError::Credential(_)));
        assert!(!err.to_string().contains("s3cret"));

        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn disabled_connection_is_left_untouched() {
        let f = fixture(FakeProvider::default()).await;
        f.store.disable_connection(f.connection.id).await.unwrap();

        let ctx = JobContext::detached(JobKind::Sync);
        let err = f.orchestrator.run(&ctx, &args(&f)).await.unwrap_err();
        assert!(matches!(err, JobError::ConnectionDisabled(_)));
        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Disabled);
        assert!(f.provider.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_organization_is_rejected() {
        let f = fixture(FakeProvider::default()).await;
        let other = SyncArgs::new(OrganizationId::from_ulid(Ulid::new()), f.connection.id);
        let ctx = JobContext::detached(JobKind::Sync);
        let err = f.orchestrator.run(&ctx, &other).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn cancelled_sync_writes_nothing() {
        let f = fixture(FakeProvider::default()).await;
        let ctx = JobContext::detached(JobKind::Sync);
        ctx.token().cancel();

        let err = f.orchestrator.run(&ctx, &args(&f)).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
        assert!(f
            .store
            .get_cursor(f.connection.id, "ACT-1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.store.transaction_count(f.connection.id).await.unwrap(), 0);
    }

    fn verify(f: &Fixture, sample_transactions: bool) -> SyncArgs {
        SyncArgs::verify(
            f.connection.organization_id,
            f.connection.id,
            sample_transactions,
        )
    }

    #[tokio::test]
    async fn connection_test_writes_nothing_to_the_ledger() {
        let f = fixture(FakeProvider::default()).await;
        f.store
            .mark_connection_error(f.connection.id, "stale error")
            .await
            .unwrap();
        let ctx = JobContext::detached(JobKind::Sync);

        let report = f.orchestrator.run(&ctx, &verify(&f, true)).await.unwrap();
        assert_eq!(report.accounts, 1);
        assert_eq!(report.transactions, UpsertSummary::default());
        // 2024-02-03..=2024-02-10 has none of the January transactions
        assert_eq!(report.sampled_transactions, Some(0));
        assert_eq!(
            f.provider.requested.lock().unwrap().clone(),
            vec![("ACT-1".to_string(), date(2024, 2, 3), date(2024, 2, 10))]
        );

        assert!(f.store.find_account(f.connection.id, "ACT-1").await.unwrap().is_none());
        assert!(f
            .store
            .get_cursor(f.connection.id, "ACT-1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.store.transaction_count(f.connection.id).await.unwrap(), 0);

        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Active);
        assert_eq!(conn.status_message.as_deref(), Some("connection test passed"));
        assert_eq!(conn.last_synced_at, None);
    }

    #[tokio::test]
    async fn connection_test_without_sampling_only_lists_accounts() {
        let f = fixture(FakeProvider::default()).await;
        let ctx = JobContext::detached(JobKind::Sync);

        let report = f.orchestrator.run(&ctx, &verify(&f, false)).await.unwrap();
        assert_eq!(report.accounts, 1);
        assert_eq!(report.sampled_transactions, None);
        assert!(f.provider.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_connection_test_marks_error() {
        let f = fixture(FakeProvider::failing(ProviderErrorKind::Auth)).await;
        let ctx = JobContext::detached(JobKind::Sync);

        let err = f.orchestrator.run(&ctx, &verify(&f, true)).await.unwrap_err();
        assert!(matches!(err, JobError::PermanentProvider(_)));

        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Error);
        assert!(conn
            .status_message
            .as_deref()
            .unwrap()
            .starts_with("provider refused the connection test"));
        let sent = f.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].message.contains("s3cret"));
    }

    #[test]
    fn provider_errors_keep_their_classification() {
        let transient = ProviderError::new("fake", ProviderErrorKind::Transient, "503");
        assert!(matches!(
            map_provider_error(transient),
            JobError::TransientProvider(_)
        ));
        for kind in [
            ProviderErrorKind::Auth,
            ProviderErrorKind::Malformed,
            ProviderErrorKind::Rejected,
        ] {
            let err = ProviderError::new("fake", kind, "bad");
            assert!(matches!(
                map_provider_error(err),
                JobError::PermanentProvider(_)
            ));
        }
    }
}
