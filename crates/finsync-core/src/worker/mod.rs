//! WorkerPool - 常駐ワーカー
//!
//! # 学習ポイント
//! - Builder パターン + 起動時検証（Fail-fast）
//! - `watch::channel` による shutdown 通知
//! - handler を別 task で動かして panic を閉じ込める
//!
//! served queue ごとに N 個の executor が
//! claim → dispatch → finish を繰り返します。
//! 一つの executor が同時に実行する job は一つだけです。

pub mod context;
pub mod registry;

pub use context::JobContext;
pub use registry::{DynHandler, Handler, HandlerRegistry, RegistryError, TypedHandler};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::AppConfig;
use crate::domain::{JobArgs, JobKind, MaintenanceArgs, MaintenanceTask};
use crate::error::{JobError, StoreError};
use crate::observability::{QueueWorkerStats, WorkerPoolStats};
use crate::queue::{EnqueueRequest, Lease, QueueEngine};

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(900);

/// A queue this process serves.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedQueue {
    pub name: String,
    pub executors: usize,
    pub batch_size: usize,
}

impl ServedQueue {
    pub fn new(name: impl Into<String>, executors: usize) -> Self {
        Self {
            name: name.into(),
            executors,
            batch_size: 5,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queues: Vec<ServedQueue>,
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    /// Time cancelled handlers get to unwind before their tasks are aborted.
    pub force_stop: Duration,
    pub timeouts: BTreeMap<JobKind, Duration>,
    /// `None` disables the periodic maintenance scheduler.
    pub maintenance_interval: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl WorkerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            queues: config
                .queues
                .iter()
                .map(|q| ServedQueue::new(&q.name, q.workers).batch_size(q.batch_size))
                .collect(),
            poll_interval: config.worker.poll_interval(),
            cancel_poll_interval: config.worker.cancel_poll_interval(),
            force_stop: config.worker.force_stop(),
            timeouts: JobKind::ALL
                .into_iter()
                .map(|kind| (kind, config.timeouts.for_kind(kind)))
                .collect(),
            maintenance_interval: config
                .maintenance
                .enabled
                .then(|| config.maintenance.interval()),
        }
    }

    pub fn with_queues(mut self, queues: Vec<ServedQueue>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_timeout(mut self, kind: JobKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    pub fn without_maintenance(mut self) -> Self {
        self.maintenance_interval = None;
        self
    }

    pub fn timeout_for(&self, kind: JobKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(DEFAULT_JOB_TIMEOUT)
    }
}

/// BuildError はワーカー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers for job kinds {0:?}. These kinds are routed to served queues but not registered.")]
    MissingHandlers(Vec<JobKind>),

    #[error("Queue '{0}' is served but not configured on the queue engine")]
    UnknownQueue(String),

    #[error("Queue '{0}' is served with zero executors")]
    NoExecutors(String),
}

/// WorkerPoolBuilder は handler を登録して WorkerPool を構築
///
/// # 使用例
/// ```ignore
/// let pool = WorkerPoolBuilder::new(engine, WorkerOptions::from_config(&config))
///     .register::<SyncArgs, _>(orchestrator)?
///     .register::<AnalysisArgs, _>(analysis)?
///     .register::<MaintenanceArgs, _>(maintenance)?
///     .build()?;
/// let group = pool.start();
/// ```
///
/// # Fail-fast 設計
/// build() は served queue に routing される全 JobKind に handler が
/// 登録されているかをチェックし、不足があれば BuildError を返す。
pub struct WorkerPoolBuilder {
    engine: Arc<QueueEngine>,
    registry: HandlerRegistry,
    options: WorkerOptions,
}

impl WorkerPoolBuilder {
    pub fn new(engine: Arc<QueueEngine>, options: WorkerOptions) -> Self {
        Self {
            engine,
            registry: HandlerRegistry::new(),
            options,
        }
    }

    pub fn register<A: JobArgs, H: Handler<A> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<A, H>(handler)?;
        Ok(self)
    }

    pub fn build(self) -> Result<WorkerPool, BuildError> {
        let registered = self.registry.registered_kinds();
        let mut missing = Vec::new();
        for served in &self.options.queues {
            if served.executors == 0 {
                return Err(BuildError::NoExecutors(served.name.clone()));
            }
            let settings = self
                .engine
                .queues()
                .iter()
                .find(|q| q.name == served.name)
                .ok_or_else(|| BuildError::UnknownQueue(served.name.clone()))?;
            for kind in &settings.kinds {
                if !registered.contains(kind) && !missing.contains(kind) {
                    missing.push(*kind);
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(BuildError::MissingHandlers(missing));
        }

        let status = PoolStatus::new(&self.options.queues);
        Ok(WorkerPool {
            engine: self.engine,
            registry: Arc::new(self.registry),
            options: self.options,
            status,
        })
    }
}

/// Live executor counters shared between the pool and the API layer.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    inner: Arc<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    accepting: AtomicBool,
    queues: Vec<QueueActivity>,
}

#[derive(Debug)]
struct QueueActivity {
    name: String,
    executors: usize,
    alive: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
}

impl PoolStatus {
    fn new(queues: &[ServedQueue]) -> Self {
        let queues = queues
            .iter()
            .map(|q| QueueActivity {
                name: q.name.clone(),
                executors: q.executors,
                alive: Arc::new(AtomicUsize::new(0)),
                busy: Arc::new(AtomicUsize::new(0)),
            })
            .collect();
        Self {
            inner: Arc::new(StatusInner {
                accepting: AtomicBool::new(false),
                queues,
            }),
        }
    }

    fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            accepting: self.is_accepting(),
            queues: self
                .inner
                .queues
                .iter()
                .map(|q| QueueWorkerStats {
                    queue: q.name.clone(),
                    executors: q.executors,
                    alive: q.alive.load(Ordering::SeqCst),
                    busy: q.busy.load(Ordering::SeqCst),
                })
                .collect(),
        }
    }

    /// Executors currently running a job from `queue`; `None` if not served.
    pub fn busy_on(&self, queue: &str) -> Option<usize> {
        self.inner
            .queues
            .iter()
            .find(|q| q.name == queue)
            .map(|q| q.busy.load(Ordering::SeqCst))
    }

    pub fn alive(&self) -> usize {
        self.inner
            .queues
            .iter()
            .map(|q| q.alive.load(Ordering::SeqCst))
            .sum()
    }
}

struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct WorkerPool {
    engine: Arc<QueueEngine>,
    registry: Arc<HandlerRegistry>,
    options: WorkerOptions,
    status: PoolStatus,
}

impl WorkerPool {
    pub fn status(&self) -> PoolStatus {
        self.status.clone()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Spawn every executor (and the maintenance scheduler when enabled).
    pub fn start(self) -> WorkerGroup {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::new();

        for (served, activity) in self.options.queues.iter().zip(&self.status.inner.queues) {
            let runner = Arc::new(QueueRunner {
                engine: Arc::clone(&self.engine),
                registry: Arc::clone(&self.registry),
                queue: served.clone(),
                poll_interval: self.options.poll_interval,
                cancel_poll_interval: self.options.cancel_poll_interval,
                timeouts: self.options.timeouts.clone(),
                alive: Arc::clone(&activity.alive),
                busy: Arc::clone(&activity.busy),
            });
            for executor_id in 0..served.executors {
                let runner = Arc::clone(&runner);
                let mut rx = shutdown_rx.clone();
                joins.push(tokio::spawn(async move {
                    runner.run(executor_id, &mut rx).await;
                }));
            }
        }

        if let Some(every) = self.options.maintenance_interval {
            let engine = Arc::clone(&self.engine);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                schedule_maintenance(engine, every, &mut rx).await;
            }));
        }

        self.status.set_accepting(true);
        info!(
            queues = ?self.options.queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            executors = self.options.queues.iter().map(|q| q.executors).sum::<usize>(),
            "worker pool started"
        );

        WorkerGroup {
            shutdown_tx,
            joins,
            engine: self.engine,
            status: self.status,
            force_stop: self.options.force_stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every executor finished within the grace period.
    pub graceful: bool,
    /// Leases whose tokens were fired after the grace period.
    pub interrupted: usize,
    /// Tasks still running after the force-stop period.
    pub aborted: usize,
}

/// Worker group handle.
/// - `request_shutdown()` で新しい claim を止める
/// - `shutdown()` で grace → interrupt → abort の順に停止する
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    engine: Arc<QueueEngine>,
    status: PoolStatus,
    force_stop: Duration,
}

impl WorkerGroup {
    pub fn status(&self) -> PoolStatus {
        self.status.clone()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        self.status.snapshot()
    }

    /// Stop claiming new jobs. In-flight handlers keep running.
    pub fn request_shutdown(&self) {
        self.status.set_accepting(false);
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Graceful shutdown: wait up to `grace` for in-flight jobs, then fire
    /// their cancellation tokens (they return to the queue as interrupted),
    /// then abort whatever is still running after the force-stop period.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        self.request_shutdown();
        info!(grace_ms = grace.as_millis() as u64, "worker pool shutting down");

        if tokio::time::timeout(grace, drain(&mut self.joins)).await.is_ok() {
            info!("worker pool stopped");
            return ShutdownReport {
                graceful: true,
                interrupted: 0,
                aborted: 0,
            };
        }

        let interrupted = self.engine.interrupt_all();
        warn!(interrupted, "grace period elapsed, interrupting running jobs");

        let mut aborted = 0;
        if tokio::time::timeout(self.force_stop, drain(&mut self.joins))
            .await
            .is_err()
        {
            for join in &self.joins {
                if !join.is_finished() {
                    join.abort();
                    aborted += 1;
                }
            }
            error!(aborted, "executors did not stop, aborted");
            drain(&mut self.joins).await;
        }

        ShutdownReport {
            graceful: false,
            interrupted,
            aborted,
        }
    }

    /// Shutdown and wait for all executors without a deadline.
    pub async fn shutdown_and_join(mut self) {
        self.request_shutdown();
        drain(&mut self.joins).await;
    }
}

/// Await every handle, popping each once it has completed so that a
/// timed-out drain can be resumed.
async fn drain(joins: &mut Vec<JoinHandle<()>>) {
    while let Some(join) = joins.last_mut() {
        let _ = join.await;
        joins.pop();
    }
}

fn should_stop(shutdown_rx: &watch::Receiver<bool>) -> bool {
    // a dropped sender counts as shutdown
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}

/// State shared by the executors of one served queue.
struct QueueRunner {
    engine: Arc<QueueEngine>,
    registry: Arc<HandlerRegistry>,
    queue: ServedQueue,
    poll_interval: Duration,
    cancel_poll_interval: Duration,
    timeouts: BTreeMap<JobKind, Duration>,
    alive: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
}

impl QueueRunner {
    async fn run(&self, executor_id: usize, shutdown_rx: &mut watch::Receiver<bool>) {
        let _alive = CountGuard::enter(&self.alive);
        debug!(queue = %self.queue.name, executor_id, "executor started");

        loop {
            if should_stop(shutdown_rx) {
                break;
            }

            // claim は select に入れない: 途中で drop すると lease を失う
            let leases = match self
                .engine
                .claim(&self.queue.name, self.queue.batch_size)
                .await
            {
                Ok(leases) => leases,
                Err(err) => {
                    warn!(queue = %self.queue.name, executor_id, error = %err, "claim failed");
                    Vec::new()
                }
            };

            if leases.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = self.engine.wait_for_work(self.poll_interval) => {}
                }
                continue;
            }

            let mut leases = leases.into_iter();
            while let Some(lease) = leases.next() {
                if should_stop(shutdown_rx) {
                    self.release(lease).await;
                    for rest in leases.by_ref() {
                        self.release(rest).await;
                    }
                    break;
                }
                self.execute(lease).await;
            }
        }

        debug!(queue = %self.queue.name, executor_id, "executor stopped");
    }

    async fn execute(&self, lease: Lease) {
        let _busy = CountGuard::enter(&self.busy);
        let span = info_span!(
            "job",
            job_id = %lease.id(),
            kind = %lease.job.kind,
            attempt = lease.attempt(),
        );

        // batch の後ろで待っている間に rescue された lease は実行しない
        if let Err(err) = self.engine.start(&lease).instrument(span.clone()).await {
            let _enter = span.enter();
            warn!(error = %err, "lease no longer held, skipping job");
            return;
        }

        let result = self.invoke(&lease).instrument(span.clone()).await;
        // finish logs the outcome itself
        let _ = self.engine.finish(&lease, result).instrument(span).await;
    }

    async fn invoke(&self, lease: &Lease) -> Result<(), JobError> {
        let kind = lease.job.kind;
        let Some(handler) = self.registry.get(kind) else {
            return Err(JobError::Internal(format!(
                "no handler registered for {kind}"
            )));
        };
        let timeout = self.timeouts.get(&kind).copied().unwrap_or(DEFAULT_JOB_TIMEOUT);
        let ctx = JobContext::from_lease(lease, timeout);
        let payload = lease.job.payload.clone();

        debug!("handler started");
        let mut task = AbortOnDrop(tokio::spawn(
            async move { handler.handle_dyn(&ctx, payload).await }.in_current_span(),
        ));
        let _watcher = AbortOnDrop(tokio::spawn(watch_lease(
            Arc::clone(&self.engine),
            lease.clone(),
            self.cancel_poll_interval,
        )));

        match tokio::time::timeout(timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(JobError::Internal(format!(
                "handler panicked: {}",
                panic_message(join_err)
            ))),
            Ok(Err(_)) => Err(JobError::Interrupted(
                "handler task was aborted".to_string(),
            )),
            Err(_) => Err(JobError::Timeout(timeout)),
        }
    }

    async fn release(&self, lease: Lease) {
        if let Err(err) = self.engine.release(&lease).await {
            warn!(job_id = %lease.id(), error = %err, "could not release lease");
        }
    }
}

/// While the handler runs: renew the lease so rescue leaves it alone, and
/// fire the job's token when another process sets its durable cancel flag.
async fn watch_lease(engine: Arc<QueueEngine>, lease: Lease, every: Duration) {
    let id = lease.id();
    loop {
        tokio::select! {
            _ = lease.token.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match engine.renew(&lease).await {
            Ok(()) => {}
            Err(StoreError::StaleTransition { .. }) => return,
            Err(err) => debug!(job_id = %id, error = %err, "lease renewal failed"),
        }
        match engine.poll_cancellation(id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => debug!(job_id = %id, error = %err, "cancel poll failed"),
        }
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Periodically enqueue the maintenance tasks. Uniqueness keys keep at most
/// one of each in flight.
async fn schedule_maintenance(
    engine: Arc<QueueEngine>,
    every: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if should_stop(shutdown_rx) {
            break;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => continue,
            _ = ticker.tick() => {}
        }

        for task in [
            MaintenanceTask::RescueStuckJobs,
            MaintenanceTask::PurgeFinalizedJobs,
        ] {
            let enqueued = match EnqueueRequest::typed(&MaintenanceArgs::new(task)) {
                Ok(request) => engine.enqueue(request).await,
                Err(err) => Err(err),
            };
            match enqueued {
                Ok(e) if e.deduplicated => {
                    debug!(task = task.as_str(), job_id = %e.job.id, "maintenance already pending")
                }
                Ok(e) => debug!(task = task.as_str(), job_id = %e.job.id, "maintenance scheduled"),
                Err(err) => warn!(task = task.as_str(), error = %err, "could not schedule maintenance"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobState, SyncArgs};
    use crate::error::FailureClass;
    use crate::ports::{JobStore, SystemClock, UlidGenerator};
    use crate::queue::RetryPolicy;
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use ulid::Ulid;

    fn engine(store: Arc<InMemoryStore>) -> Arc<QueueEngine> {
        let ids = Arc::new(UlidGenerator::new(SystemClock));
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        }
        .without_jitter();
        Arc::new(QueueEngine::new(store, Arc::new(SystemClock), ids).with_retry_policy(retry))
    }

    fn options(executors: usize) -> WorkerOptions {
        WorkerOptions {
            queues: vec![ServedQueue::new("sync", executors)],
            poll_interval: Duration::from_millis(20),
            cancel_poll_interval: Duration::from_millis(20),
            force_stop: Duration::from_millis(200),
            timeouts: BTreeMap::new(),
            maintenance_interval: None,
        }
    }

    async fn enqueue_sync(engine: &QueueEngine, max_attempts: u32) -> JobId {
        let args = SyncArgs::new(Ulid::new().into(), Ulid::new().into());
        let request = EnqueueRequest::typed(&args)
            .unwrap()
            .max_attempts(max_attempts);
        engine.enqueue(request).await.unwrap().job.id
    }

    async fn wait_for_state(store: &InMemoryStore, id: JobId, state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get(id).await.unwrap().is_some_and(|j| j.state == state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach the expected state");
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl Handler<SyncArgs> for Recording {
        async fn handle(&self, ctx: &JobContext, _args: SyncArgs) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().unwrap().push(ctx.job_id);
            Ok(())
        }
    }

    /// Counts runs per job and flags any job running twice at once.
    #[derive(Default)]
    struct OverlapWatch {
        runs: Mutex<HashMap<JobId, usize>>,
        active: Mutex<HashMap<JobId, usize>>,
        overlapped: AtomicBool,
    }

    #[async_trait]
    impl Handler<SyncArgs> for OverlapWatch {
        async fn handle(&self, ctx: &JobContext, _args: SyncArgs) -> Result<(), JobError> {
            *self.runs.lock().unwrap().entry(ctx.job_id).or_default() += 1;
            {
                let mut active = self.active.lock().unwrap();
                let n = active.entry(ctx.job_id).or_default();
                *n += 1;
                if *n > 1 {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            *self.active.lock().unwrap().entry(ctx.job_id).or_default() -= 1;
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Handler<SyncArgs> for Panicking {
        async fn handle(&self, _ctx: &JobContext, _args: SyncArgs) -> Result<(), JobError> {
            panic!("boom");
        }
    }

    struct WaitsForCancel;

    #[async_trait]
    impl Handler<SyncArgs> for WaitsForCancel {
        async fn handle(&self, ctx: &JobContext, _args: SyncArgs) -> Result<(), JobError> {
            ctx.guard(std::future::pending::<()>()).await?;
            Ok(())
        }
    }

    struct IgnoresCancel;

    #[async_trait]
    impl Handler<SyncArgs> for IgnoresCancel {
        async fn handle(&self, _ctx: &JobContext, _args: SyncArgs) -> Result<(), JobError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn build_fails_without_handler_for_served_kind() {
        let store = Arc::new(InMemoryStore::new());
        let result = WorkerPoolBuilder::new(engine(store), options(1)).build();
        assert!(matches!(
            result,
            Err(BuildError::MissingHandlers(kinds)) if kinds == vec![JobKind::Sync]
        ));
    }

    #[test]
    fn build_rejects_unknown_queue() {
        let store = Arc::new(InMemoryStore::new());
        let opts = options(1).with_queues(vec![ServedQueue::new("reports", 1)]);
        let result = WorkerPoolBuilder::new(engine(store), opts)
            .register::<SyncArgs, _>(Recording::default())
            .unwrap()
            .build();
        assert!(matches!(result, Err(BuildError::UnknownQueue(q)) if q == "reports"));
    }

    #[test]
    fn options_follow_config() {
        let opts = WorkerOptions::from_config(&AppConfig::default());
        assert_eq!(opts.queues.len(), 3);
        assert_eq!(opts.timeout_for(JobKind::Sync), Duration::from_secs(900));
        assert!(opts.maintenance_interval.is_some());
        assert!(opts.without_maintenance().maintenance_interval.is_none());
    }

    #[tokio::test]
    async fn every_job_runs_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(Arc::clone(&store));
        let handler = Arc::new(Recording::default());
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(enqueue_sync(&engine, 3).await);
        }

        let group = WorkerPoolBuilder::new(Arc::clone(&engine), options(3))
            .register::<SyncArgs, _>(Arc::clone(&handler))
            .unwrap()
            .build()
            .unwrap()
            .start();

        for id in &ids {
            wait_for_state(&store, *id, JobState::Completed).await;
        }
        let report = group.shutdown(Duration::from_secs(1)).await;
        assert!(report.graceful);

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 10);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test]
    async fn rescued_lease_waiting_in_batch_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(Arc::clone(&store));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(enqueue_sync(&engine, 3).await);
        }

        let handler = Arc::new(OverlapWatch::default());
        let opts = options(1)
            .with_queues(vec![ServedQueue::new("sync", 1).batch_size(3)])
            .with_timeout(JobKind::Sync, Duration::from_millis(400));
        let first = WorkerPoolBuilder::new(Arc::clone(&engine), opts.clone())
            .register::<SyncArgs, _>(Arc::clone(&handler))
            .unwrap()
            .build()
            .unwrap()
            .start();

        // job 0 done, job 1 mid-run, job 2 still queued behind it in the batch
        wait_for_state(&store, ids[0], JobState::Completed).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let now = chrono::Utc::now();
        let rescued = store
            .rescue_stuck(now - chrono::Duration::milliseconds(120), now)
            .await
            .unwrap();
        let rescued: Vec<JobId> = rescued.iter().map(|j| j.id).collect();
        assert_eq!(rescued, vec![ids[2]]);

        let second = WorkerPoolBuilder::new(Arc::clone(&engine), opts)
            .register::<SyncArgs, _>(Arc::clone(&handler))
            .unwrap()
            .build()
            .unwrap()
            .start();

        for id in &ids {
            wait_for_state(&store, *id, JobState::Completed).await;
        }
        first.shutdown(Duration::from_secs(1)).await;
        second.shutdown(Duration::from_secs(1)).await;

        let runs = handler.runs.lock().unwrap().clone();
        for id in &ids {
            assert_eq!(runs.get(id), Some(&1), "job {id} ran more than once");
        }
        assert!(!handler.overlapped.load(Ordering::SeqCst));
        assert_eq!(store.get(ids[2]).await.unwrap().unwrap().attempt, 2);
        assert_eq!(engine.leased(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_discarded_as_internal() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(Arc::clone(&store));
        let id = enqueue_sync(&engine, 3).await;

        let group = WorkerPoolBuilder::new(Arc::clone(&engine), options(1))
            .register::<SyncArgs, _>(Panicking)
            .unwrap()
            .build()
            .unwrap()
            .start();

        wait_for_state(&store, id, JobState::Discarded).await;
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(job.last_error.unwrap().class, FailureClass::Internal);
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn timeout_is_recorded_and_retried() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(Arc::clone(&store));
        let id = enqueue_sync(&engine, 2).await;

        let opts = options(1).with_timeout(JobKind::Sync, Duration::from_millis(30));
        let group = WorkerPoolBuilder::new(Arc::clone(&engine), opts)
            .register::<SyncArgs, _>(IgnoresCancel)
            .unwrap()
            .build()
            .unwrap()
            .start();

        wait_for_state(&store, id, JobState::Discarded).await;
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.last_error.unwrap().class, FailureClass::Timeout);
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn forced_shutdown_interrupts_running_and_releases_pending() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(Arc::clone(&store));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(enqueue_sync(&engine, 3).await);
        }

        let group = WorkerPoolBuilder::new(Arc::clone(&engine), options(1))
            .register::<SyncArgs, _>(WaitsForCancel)
            .unwrap()
            .build()
            .unwrap()
            .start();
        wait_for_state(&store, ids[0], JobState::Running).await;
        assert_eq!(group.stats().busy(), 1);

        let report = group.shutdown(Duration::from_millis(50)).await;
        assert!(!report.graceful);
        // tokens of the two claimed-but-unstarted leases fire as well
        assert_eq!(report.interrupted, 3);
        assert_eq!(report.aborted, 0);

        let first = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Retryable);
        assert_eq!(first.last_error.unwrap().class, FailureClass::Interrupted);
        for id in &ids[1..] {
            let job = store.get(*id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Available);
            assert_eq!(job.attempt, 0);
        }
        assert_eq!(engine.leased(), 0);
    }

    #[tokio::test]
    async fn user_cancel_reaches_running_handler() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine(Arc::clone(&store));
        let id = enqueue_sync(&engine, 3).await;

        let group = WorkerPoolBuilder::new(Arc::clone(&engine), options(1))
            .register::<SyncArgs, _>(WaitsForCancel)
            .unwrap()
            .build()
            .unwrap()
            .start();
        wait_for_state(&store, id, JobState::Running).await;

        engine.cancel(id).await.unwrap();
        wait_for_state(&store, id, JobState::Cancelled).await;
        let report = group.shutdown(Duration::from_secs(1)).await;
        assert!(report.graceful);
    }
}
