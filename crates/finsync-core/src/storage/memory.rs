//! In-memory store implementing every persistence port.
//!
//! Used by tests and by `database.backend: memory`. One mutex guards all
//! state, so a claim is trivially atomic with respect to other claims.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    AccountId, Connection, ConnectionId, ConnectionStatus, DateRange, JobId, JobRecord, JobState,
    NewJob, OrganizationId, ProviderAccount, ProviderTransaction, SealedCredentials,
    StoredAccount, StoredTransaction, SyncCursor, Transition, UpsertOutcome, UpsertSummary,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{
    CancelOutcome, ClaimRequest, ConnectionStore, IdGenerator, InsertOutcome, JobFilter,
    JobStore, LedgerRepository, SystemClock, UlidGenerator,
};

/// Retryable job waiting for its backoff to elapse.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledJob {
    scheduled_at: DateTime<Utc>,
    id: JobId,
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .scheduled_at
            .cmp(&self.scheduled_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct MemoryState {
    /// All job records (single source of truth for jobs).
    jobs: HashMap<JobId, JobRecord>,

    /// Available jobs per queue in claim order.
    ready: HashMap<String, BTreeSet<(DateTime<Utc>, JobId)>>,

    /// Retryable jobs (backoff).
    scheduled: BinaryHeap<ScheduledJob>,

    connections: HashMap<ConnectionId, Connection>,
    accounts: HashMap<(ConnectionId, String), StoredAccount>,
    transactions: HashMap<(AccountId, String), StoredTransaction>,
    cursors: HashMap<(ConnectionId, String), SyncCursor>,
}

impl MemoryState {
    fn push_ready(&mut self, job: &JobRecord) {
        self.ready
            .entry(job.queue.clone())
            .or_default()
            .insert((job.scheduled_at, job.id));
    }

    fn remove_ready(&mut self, job: &JobRecord) {
        if let Some(ready) = self.ready.get_mut(&job.queue) {
            ready.remove(&(job.scheduled_at, job.id));
        }
    }

    fn push_scheduled(&mut self, job: &JobRecord) {
        self.scheduled.push(ScheduledJob {
            scheduled_at: job.scheduled_at,
            id: job.id,
        });
    }

    /// Move Retryable jobs whose backoff has elapsed back to the ready set.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.scheduled_at > now {
                break; // Heap is sorted, so we can stop
            }

            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            // stale entries (cancelled, purged, re-scheduled) are dropped here
            let promoted = match self.jobs.get_mut(&entry.id) {
                Some(job) if job.scheduled_at == entry.scheduled_at => {
                    job.promote_if_due(now).then(|| job.clone())
                }
                _ => None,
            };
            if let Some(job) = promoted {
                self.push_ready(&job);
            }
        }
    }

    fn running_in(&self, queue: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Running)
            .count()
    }

    fn find_in_flight(&self, unique_key: &str) -> Option<&JobRecord> {
        self.jobs
            .values()
            .filter(|j| j.state.is_in_flight() && j.unique_key.as_deref() == Some(unique_key))
            .min_by_key(|j| j.id)
    }

    fn account_by_id(&self, id: AccountId) -> Option<&StoredAccount> {
        self.accounts.values().find(|a| a.id == id)
    }
}

/// In-memory store.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    /// Account and transaction ids come from `ids`.
    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            ids,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(key) = job.unique_key.as_deref()
            && let Some(existing) = state.find_in_flight(key)
        {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        let record = JobRecord::from(job);
        state.push_ready(&record);
        state.jobs.insert(record.id, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<JobRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.promote_due(request.now);

        let room = request
            .max_running
            .saturating_sub(state.running_in(&request.queue))
            .min(request.limit);
        if room == 0 {
            return Ok(Vec::new());
        }

        let candidates: Vec<(DateTime<Utc>, JobId)> = match state.ready.get(&request.queue) {
            Some(ready) => ready
                .iter()
                .take_while(|(at, _)| *at <= request.now)
                .copied()
                .collect(),
            None => return Ok(Vec::new()),
        };

        let mut claimed = Vec::with_capacity(room);
        for (at, id) in candidates {
            if claimed.len() == room {
                break;
            }
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if !job.is_claimable(request.now) {
                continue;
            }
            job.start_attempt(request.now);
            claimed.push(job.clone());
            if let Some(ready) = state.ready.get_mut(&request.queue) {
                ready.remove(&(at, id));
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: JobId,
        attempt: u32,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.is_leased_by(attempt) {
            return Err(StoreError::StaleTransition { id, attempt });
        }
        job.apply(transition, now);
        let job = job.clone();

        match job.state {
            JobState::Retryable => state.push_scheduled(&job),
            JobState::Available => state.push_ready(&job),
            _ => {}
        }
        Ok(job)
    }

    async fn renew_lease(
        &self,
        id: JobId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.is_leased_by(attempt) {
            return Err(StoreError::StaleTransition { id, attempt });
        }
        job.attempted_at = Some(now);
        Ok(())
    }

    async fn request_cancel(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get(&id).ok_or(StoreError::JobNotFound(id))?.clone();

        let outcome = match job.state {
            JobState::Available | JobState::Retryable => {
                state.remove_ready(&job);
                let record = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
                record.cancel_pending(now);
                CancelOutcome::Cancelled(record.clone())
            }
            JobState::Running => {
                let record = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
                record.cancel_requested = true;
                CancelOutcome::Requested(record.clone())
            }
            _ => CancelOutcome::AlreadyFinal(job),
        };
        Ok(outcome)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn counts(&self) -> Result<Vec<QueueCounts>, StoreError> {
        let state = self.state.lock().await;
        let mut by_queue: BTreeMap<&str, QueueCounts> = BTreeMap::new();
        for job in state.jobs.values() {
            by_queue
                .entry(job.queue.as_str())
                .or_insert_with(|| QueueCounts::new(job.queue.clone()))
                .add(job.state, 1);
        }
        Ok(by_queue.into_values().collect())
    }

    async fn rescue_stuck(
        &self,
        attempted_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let mut rescued = Vec::new();
        for job in state.jobs.values_mut() {
            let stuck = job.state == JobState::Running
                && job.attempted_at.is_some_and(|at| at < attempted_before);
            if stuck {
                job.rescue(now);
                rescued.push(job.clone());
            }
        }
        for job in &rescued {
            if job.state == JobState::Retryable {
                state.push_scheduled(job);
            }
        }
        Ok(rescued)
    }

    async fn purge_finalized(
        &self,
        target: JobState,
        finalized_before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize, StoreError> {
        if !target.is_terminal() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.state == target && j.finalized_at.is_some_and(|at| at < finalized_before))
            .map(|j| j.id)
            .collect();
        if !dry_run {
            for id in &expired {
                state.jobs.remove(id);
            }
        }
        Ok(expired.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for InMemoryStore {
    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.connections.contains_key(&connection.id) {
            return Err(StoreError::Database(format!(
                "connection {} already exists",
                connection.id
            )));
        }
        state.connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn get_connection(&self, id: ConnectionId) -> Result<Option<Connection>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.connections.get(&id).cloned())
    }

    async fn update_credentials(
        &self,
        id: ConnectionId,
        credentials: &SealedCredentials,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(StoreError::ConnectionNotFound(id))?;
        conn.credentials = credentials.clone();
        Ok(())
    }

    async fn mark_connection_error(
        &self,
        id: ConnectionId,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(StoreError::ConnectionNotFound(id))?;
        if conn.status != ConnectionStatus::Disabled {
            conn.status = ConnectionStatus::Error;
            conn.status_message = Some(message.to_string());
        }
        Ok(())
    }

    async fn mark_connection_synced(
        &self,
        id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(StoreError::ConnectionNotFound(id))?;
        // 無効化されたコネクションは同期が終わっても Disabled のまま
        if conn.status != ConnectionStatus::Disabled {
            conn.status = ConnectionStatus::Active;
            conn.status_message = None;
        }
        conn.last_synced_at = Some(at);
        Ok(())
    }

    async fn mark_connection_verified(
        &self,
        id: ConnectionId,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(StoreError::ConnectionNotFound(id))?;
        if conn.status != ConnectionStatus::Disabled {
            conn.status = ConnectionStatus::Active;
            conn.status_message = Some(message.to_string());
        }
        Ok(())
    }

    async fn disable_connection(&self, id: ConnectionId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(StoreError::ConnectionNotFound(id))?;
        conn.status = ConnectionStatus::Disabled;
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryStore {
    async fn upsert_account(
        &self,
        connection: &Connection,
        account: &ProviderAccount,
        now: DateTime<Utc>,
    ) -> Result<StoredAccount, StoreError> {
        let mut state = self.state.lock().await;
        let key = (connection.id, account.provider_account_id.clone());

        if let Some(existing) = state.accounts.get_mut(&key) {
            if existing.differs_from(account) {
                existing.name = account.name.clone();
                existing.currency = account.currency.clone();
                existing.balance = account.balance;
                existing.balance_date = account.balance_date;
                existing.institution = account.institution.clone();
                existing.updated_at = now;
            }
            return Ok(existing.clone());
        }

        let stored = StoredAccount {
            id: self.ids.account_id(),
            connection_id: connection.id,
            organization_id: connection.organization_id,
            provider_account_id: account.provider_account_id.clone(),
            name: account.name.clone(),
            currency: account.currency.clone(),
            balance: account.balance,
            balance_date: account.balance_date,
            institution: account.institution.clone(),
            updated_at: now,
        };
        state.accounts.insert(key, stored.clone());
        Ok(stored)
    }

    async fn find_account(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
    ) -> Result<Option<StoredAccount>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .get(&(connection_id, provider_account_id.to_string()))
            .cloned())
    }

    async fn upsert_transactions(
        &self,
        account_id: AccountId,
        transactions: &[ProviderTransaction],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary, StoreError> {
        let mut state = self.state.lock().await;
        if state.account_by_id(account_id).is_none() {
            return Err(StoreError::Database(format!(
                "account {account_id} does not exist"
            )));
        }

        let mut summary = UpsertSummary::default();
        for txn in transactions {
            let key = (account_id, txn.provider_transaction_id.clone());
            let outcome = match state.transactions.get_mut(&key) {
                Some(existing) if existing.differs_from(txn) => {
                    existing.posted = txn.posted;
                    existing.amount = txn.amount;
                    existing.description = txn.description.clone();
                    existing.pending = txn.pending;
                    existing.updated_at = now;
                    UpsertOutcome::Updated
                }
                Some(_) => UpsertOutcome::Unchanged,
                None => {
                    let stored = StoredTransaction {
                        id: self.ids.transaction_id(),
                        account_id,
                        provider_transaction_id: txn.provider_transaction_id.clone(),
                        posted: txn.posted,
                        amount: txn.amount,
                        description: txn.description.clone(),
                        pending: txn.pending,
                        updated_at: now,
                    };
                    state.transactions.insert(key, stored);
                    UpsertOutcome::Inserted
                }
            };
            summary.record(outcome);
        }
        Ok(summary)
    }

    async fn transaction_count(&self, connection_id: ConnectionId) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        let accounts: BTreeSet<AccountId> = state
            .accounts
            .values()
            .filter(|a| a.connection_id == connection_id)
            .map(|a| a.id)
            .collect();
        Ok(state
            .transactions
            .values()
            .filter(|t| accounts.contains(&t.account_id))
            .count())
    }

    async fn get_cursor(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
    ) -> Result<Option<SyncCursor>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .cursors
            .get(&(connection_id, provider_account_id.to_string()))
            .cloned())
    }

    async fn advance_cursor(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<SyncCursor, StoreError> {
        let mut state = self.state.lock().await;
        let key = (connection_id, provider_account_id.to_string());
        let cursor = SyncCursor::advanced(
            state.cursors.get(&key),
            connection_id,
            provider_account_id,
            range,
            now,
        );
        state.cursors.insert(key, cursor.clone());
        Ok(cursor)
    }

    async fn last_activity(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        let accounts: HashMap<AccountId, DateTime<Utc>> = state
            .accounts
            .values()
            .filter(|a| a.organization_id == organization_id)
            .map(|a| (a.id, a.updated_at))
            .collect();
        let newest_txn = state
            .transactions
            .values()
            .filter(|t| accounts.contains_key(&t.account_id))
            .map(|t| t.updated_at)
            .max();
        Ok(accounts.values().copied().chain(newest_txn).max())
    }
}
