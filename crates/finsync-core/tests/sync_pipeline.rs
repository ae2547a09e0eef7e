//! End-to-end sync jobs: enqueue through the facade, run on a worker pool,
//! check the job row, the ledger and the connection afterwards.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use finsync_core::domain::{ConnectionStatus, DateRange, JobState, SyncArgs};
use finsync_core::error::FailureClass;
use finsync_core::ports::{
    CancelOutcome, ConnectionStore, LedgerRepository, ProviderErrorKind,
    ProviderRegistry, SystemClock,
};
use finsync_core::service::{EnqueueReceipt, JobService};
use finsync_core::storage::{InMemoryStore, SqliteStore};
use finsync_core::sync::SyncOrchestrator;
use finsync_core::worker::{ServedQueue, WorkerGroup, WorkerOptions, WorkerPoolBuilder};

use common::{FullStore, ScriptedProvider, date, engine, seed_connection, vault, wait_for_final};

struct Harness<S: FullStore> {
    store: Arc<S>,
    service: JobService,
    group: WorkerGroup,
    provider: Arc<ScriptedProvider>,
    connection: finsync_core::domain::Connection,
}

async fn start<S: FullStore>(store: Arc<S>, provider: ScriptedProvider) -> Harness<S> {
    let vault = vault();
    let connection = seed_connection(store.as_ref(), &vault).await;
    let provider = Arc::new(provider);

    let engine = engine(store.clone());
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        store.clone(),
        ProviderRegistry::new().with(provider.clone()),
        vault,
        Arc::new(SystemClock),
    );
    let options = WorkerOptions {
        queues: vec![ServedQueue::new("sync", 2)],
        poll_interval: Duration::from_millis(20),
        cancel_poll_interval: Duration::from_millis(20),
        force_stop: Duration::from_millis(500),
        timeouts: BTreeMap::new(),
        maintenance_interval: None,
    };
    let pool = WorkerPoolBuilder::new(engine.clone(), options)
        .register::<SyncArgs, _>(orchestrator)
        .unwrap()
        .build()
        .unwrap();

    let service = JobService::new(engine, store.clone());
    service.attach_pool(pool.status());
    let group = pool.start();
    tokio::time::timeout(Duration::from_secs(5), async {
        while group.stats().alive() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("executors did not start");

    Harness {
        store,
        service,
        group,
        provider,
        connection,
    }
}

fn january() -> DateRange {
    DateRange::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap()
}

fn sqlite() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("finsync.db")).unwrap();
    (dir, Arc::new(store))
}

async fn january_sync_is_idempotent<S: FullStore>(store: Arc<S>) {
    let h = start(store, ScriptedProvider::healthy()).await;
    let args = SyncArgs::new(h.connection.organization_id, h.connection.id).with_range(january());

    for run in 0..2 {
        let receipt = h.service.enqueue_sync(args.clone()).await.unwrap();
        let id = receipt.job_id().unwrap();
        let job = wait_for_final(h.store.as_ref(), id).await;
        assert_eq!(job.state, JobState::Completed, "run {run}");
        assert_eq!(job.attempt, 1);
    }

    assert_eq!(h.store.transaction_count(h.connection.id).await.unwrap(), 3);
    let cursor = h
        .store
        .get_cursor(h.connection.id, "ACT-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cursor.synced_through, date(2024, 1, 31));

    let conn = h.store.get_connection(h.connection.id).await.unwrap().unwrap();
    assert_eq!(conn.status, ConnectionStatus::Active);
    assert!(conn.last_synced_at.is_some());

    let report = h.group.shutdown(Duration::from_secs(1)).await;
    assert!(report.graceful);
}

#[tokio::test]
async fn january_sync_is_idempotent_in_memory() {
    january_sync_is_idempotent(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn january_sync_is_idempotent_on_sqlite() {
    let (_dir, store) = sqlite();
    january_sync_is_idempotent(store).await;
}

async fn auth_failure_is_not_retried<S: FullStore>(store: Arc<S>) {
    let h = start(store, ScriptedProvider::failing(ProviderErrorKind::Auth, u32::MAX)).await;
    let args = SyncArgs::new(h.connection.organization_id, h.connection.id);

    let id = h.service.enqueue_sync(args).await.unwrap().job_id().unwrap();
    let job = wait_for_final(h.store.as_ref(), id).await;

    assert_eq!(job.state, JobState::Discarded);
    assert_eq!(job.attempt, 1);
    assert_eq!(
        job.last_error.map(|e| e.class),
        Some(FailureClass::Permanent)
    );
    let conn = h.store.get_connection(h.connection.id).await.unwrap().unwrap();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert!(h.store.get_cursor(h.connection.id, "ACT-1").await.unwrap().is_none());

    h.group.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn auth_failure_is_not_retried_in_memory() {
    auth_failure_is_not_retried(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn auth_failure_is_not_retried_on_sqlite() {
    let (_dir, store) = sqlite();
    auth_failure_is_not_retried(store).await;
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let h = start(
        Arc::new(InMemoryStore::new()),
        ScriptedProvider::failing(ProviderErrorKind::Transient, 2),
    )
    .await;
    let args = SyncArgs::new(h.connection.organization_id, h.connection.id).with_range(january());

    let id = h.service.enqueue_sync(args).await.unwrap().job_id().unwrap();
    let job = wait_for_final(h.store.as_ref(), id).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 3);
    assert_eq!(h.store.transaction_count(h.connection.id).await.unwrap(), 3);

    h.group.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn transient_failures_exhaust_attempts() {
    let h = start(
        Arc::new(InMemoryStore::new()),
        ScriptedProvider::failing(ProviderErrorKind::Transient, u32::MAX),
    )
    .await;
    let args = SyncArgs::new(h.connection.organization_id, h.connection.id);

    let id = h.service.enqueue_sync(args).await.unwrap().job_id().unwrap();
    let job = wait_for_final(h.store.as_ref(), id).await;

    assert_eq!(job.state, JobState::Discarded);
    assert_eq!(job.attempt, job.max_attempts);
    assert_eq!(
        job.last_error.map(|e| e.class),
        Some(FailureClass::Transient)
    );
    // Transient failures never flag the connection.
    let conn = h.store.get_connection(h.connection.id).await.unwrap().unwrap();
    assert_eq!(conn.status, ConnectionStatus::Active);

    h.group.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancelling_a_running_sync_keeps_cursor() {
    let h = start(
        Arc::new(InMemoryStore::new()),
        ScriptedProvider::slow(Duration::from_secs(30)),
    )
    .await;
    let args = SyncArgs::new(h.connection.organization_id, h.connection.id).with_range(january());

    let id = h.service.enqueue_sync(args).await.unwrap().job_id().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.provider.transaction_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let outcome = h.service.cancel_job(id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Requested(_)));

    let job = wait_for_final(h.store.as_ref(), id).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(h.store.get_cursor(h.connection.id, "ACT-1").await.unwrap().is_none());
    assert_eq!(h.store.transaction_count(h.connection.id).await.unwrap(), 0);

    h.group.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn duplicate_sync_requests_share_one_job() {
    let h = start(
        Arc::new(InMemoryStore::new()),
        ScriptedProvider::slow(Duration::from_millis(200)),
    )
    .await;
    let args = SyncArgs::new(h.connection.organization_id, h.connection.id).with_range(january());

    let first = h.service.enqueue_sync(args.clone()).await.unwrap();
    let second = h.service.enqueue_sync(args).await.unwrap();
    assert_eq!(first.job_id(), second.job_id());
    assert!(matches!(
        second,
        EnqueueReceipt::Enqueued {
            deduplicated: true,
            ..
        }
    ));

    let job = wait_for_final(h.store.as_ref(), first.job_id().unwrap()).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(h.provider.transaction_calls.load(Ordering::SeqCst), 1);

    let stats = h.service.worker_stats().unwrap();
    assert_eq!(stats.alive(), 2);

    h.group.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn health_reports_attached_pool() {
    let h = start(Arc::new(InMemoryStore::new()), ScriptedProvider::healthy()).await;
    let health = h.service.health().await;
    assert!(health.healthy);
    assert_eq!(health.workers_alive, Some(2));

    h.group.shutdown(Duration::from_secs(1)).await;
}
