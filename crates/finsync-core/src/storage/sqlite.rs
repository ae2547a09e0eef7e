//! SQLite storage backend implementation.
//!
//! One database file holds jobs, connections and the ledger:
//! - claims run inside an IMMEDIATE transaction, so two processes sharing
//!   the file never lease the same job
//! - transitions are conditional updates on `state = 'running' AND attempt = ?`
//! - timestamps are integer milliseconds, dates are ISO text, money is decimal text

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use rust_decimal::Decimal;
use tokio::task;
use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker};
use crate::domain::{
    AccountId, Connection as ProviderConnection, ConnectionId, ConnectionStatus, DateRange, JobId,
    JobRecord, JobState, NewJob, OrganizationId, ProviderAccount, ProviderTransaction,
    SealedCredentials, StoredAccount, StoredTransaction, SyncCursor, Transition, UpsertOutcome,
    UpsertSummary,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{
    CancelOutcome, ClaimRequest, ConnectionStore, IdGenerator, InsertOutcome, JobFilter,
    JobStore, LedgerRepository, SystemClock, UlidGenerator,
};

const JOB_COLUMNS: &str = "id, queue, kind, payload, state, attempt, max_attempts, scheduled_at, \
     unique_key, cancel_requested, last_error, created_at, attempted_at, finalized_at";

const CONNECTION_COLUMNS: &str = "id, organization_id, provider_type, name, ciphertext, nonce, \
     key_version, status, status_message, last_synced_at, created_at";

const ACCOUNT_COLUMNS: &str = "id, connection_id, organization_id, provider_account_id, name, \
     currency, balance, balance_date, institution, updated_at";

/// SQLite storage backend.
#[derive(Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    ///
    /// Blocks on the connection mutex; call before the worker pool starts.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Account and transaction ids come from `ids`.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            connection: Arc::new(Mutex::new(conn)),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self
            .connection
            .lock()
            .map_err(|_| StoreError::Database("database lock poisoned".into()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                scheduled_at INTEGER NOT NULL,
                unique_key TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                attempted_at INTEGER,
                finalized_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claim
                ON jobs(queue, state, scheduled_at, id);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_unique_in_flight
                ON jobs(unique_key)
                WHERE unique_key IS NOT NULL
                  AND state IN ('available', 'running', 'retryable');

            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                provider_type TEXT NOT NULL,
                name TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                nonce BLOB NOT NULL,
                key_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                status_message TEXT,
                last_synced_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                connection_id TEXT NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
                organization_id TEXT NOT NULL,
                provider_account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                currency TEXT NOT NULL,
                balance TEXT NOT NULL,
                balance_date INTEGER,
                institution TEXT,
                updated_at INTEGER NOT NULL,
                UNIQUE (connection_id, provider_account_id)
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_org ON accounts(organization_id);

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                provider_transaction_id TEXT NOT NULL,
                posted TEXT NOT NULL,
                amount TEXT NOT NULL,
                description TEXT NOT NULL,
                pending INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (account_id, provider_transaction_id)
            );

            CREATE TABLE IF NOT EXISTS sync_cursors (
                connection_id TEXT NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
                provider_account_id TEXT NOT NULL,
                synced_from TEXT NOT NULL,
                synced_through TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (connection_id, provider_account_id)
            );",
        )?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.connection);
        task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Database("database lock poisoned".into()))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("task join error: {e}")))?
    }
}

// ========================================
// Row conversion
// ========================================

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn id_text<T: IdMarker>(id: Id<T>) -> String {
    id.as_ulid().to_string()
}

fn parse_id<T: IdMarker>(raw: &str) -> Result<Id<T>, StoreError> {
    Ulid::from_string(raw)
        .map(Id::from_ulid)
        .map_err(|_| StoreError::Corrupt(format!("invalid id: {raw}")))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::from_str(raw).map_err(|_| StoreError::Corrupt(format!("invalid date: {raw}")))
}

fn parse_decimal(raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|_| StoreError::Corrupt(format!("invalid amount: {raw}")))
}

struct JobRow {
    id: String,
    queue: String,
    kind: String,
    payload: String,
    state: String,
    attempt: u32,
    max_attempts: u32,
    scheduled_at: i64,
    unique_key: Option<String>,
    cancel_requested: bool,
    last_error: Option<String>,
    created_at: i64,
    attempted_at: Option<i64>,
    finalized_at: Option<i64>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue: row.get(1)?,
            kind: row.get(2)?,
            payload: row.get(3)?,
            state: row.get(4)?,
            attempt: row.get(5)?,
            max_attempts: row.get(6)?,
            scheduled_at: row.get(7)?,
            unique_key: row.get(8)?,
            cancel_requested: row.get(9)?,
            last_error: row.get(10)?,
            created_at: row.get(11)?,
            attempted_at: row.get(12)?,
            finalized_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        Ok(JobRecord {
            id: parse_id(&self.id)?,
            queue: self.queue,
            kind: self.kind.parse().map_err(StoreError::Corrupt)?,
            payload: serde_json::from_str(&self.payload)?,
            state: self.state.parse().map_err(StoreError::Corrupt)?,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            scheduled_at: from_millis(self.scheduled_at)?,
            unique_key: self.unique_key,
            cancel_requested: self.cancel_requested,
            last_error: self
                .last_error
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: from_millis(self.created_at)?,
            attempted_at: self.attempted_at.map(from_millis).transpose()?,
            finalized_at: self.finalized_at.map(from_millis).transpose()?,
        })
    }
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<JobRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        JobRow::from_row,
    )
    .optional()?
    .map(JobRow::into_record)
    .transpose()
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<JobRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, JobRow::from_row)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?.into_record()?);
    }
    Ok(jobs)
}

/// Persist the mutable columns of `job`. With `lease`, only while the row is
/// still Running under that attempt.
fn write_back(conn: &Connection, job: &JobRecord, lease: Option<u32>) -> Result<usize, StoreError> {
    let last_error = job
        .last_error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let id = id_text(job.id);
    let state = job.state.as_str();
    let scheduled_at = millis(job.scheduled_at);
    let attempted_at = job.attempted_at.map(millis);
    let finalized_at = job.finalized_at.map(millis);
    let mut args: Vec<&dyn rusqlite::ToSql> = vec![
        &id,
        &state,
        &job.attempt,
        &scheduled_at,
        &job.cancel_requested,
        &last_error,
        &attempted_at,
        &finalized_at,
    ];

    let mut sql = String::from(
        "UPDATE jobs SET state = ?2, attempt = ?3, scheduled_at = ?4, cancel_requested = ?5, \
         last_error = ?6, attempted_at = ?7, finalized_at = ?8 WHERE id = ?1",
    );
    if let Some(attempt) = &lease {
        sql.push_str(" AND state = 'running' AND attempt = ?9");
        args.push(attempt);
    }
    let changed = conn.execute(&sql, args.as_slice())?;
    Ok(changed)
}

fn load_connection(
    conn: &Connection,
    id: &str,
) -> Result<Option<ProviderConnection>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = ?1"),
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        organization_id,
        provider_type,
        name,
        ciphertext,
        nonce,
        key_version,
        status,
        status_message,
        last_synced_at,
        created_at,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(ProviderConnection {
        id: parse_id(&id)?,
        organization_id: parse_id(&organization_id)?,
        provider_type,
        name,
        credentials: SealedCredentials {
            ciphertext,
            nonce,
            key_version,
        },
        status: status.parse().map_err(StoreError::Corrupt)?,
        status_message,
        last_synced_at: last_synced_at.map(from_millis).transpose()?,
        created_at: from_millis(created_at)?,
    }))
}

type AccountRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    Option<String>,
    i64,
);

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn account_from_values(row: AccountRow) -> Result<StoredAccount, StoreError> {
    let (
        id,
        connection_id,
        organization_id,
        provider_account_id,
        name,
        currency,
        balance,
        balance_date,
        institution,
        updated_at,
    ) = row;
    Ok(StoredAccount {
        id: parse_id(&id)?,
        connection_id: parse_id(&connection_id)?,
        organization_id: parse_id(&organization_id)?,
        provider_account_id,
        name,
        currency,
        balance: parse_decimal(&balance)?,
        balance_date: balance_date.map(from_millis).transpose()?,
        institution,
        updated_at: from_millis(updated_at)?,
    })
}

fn load_account(
    conn: &Connection,
    connection_id: &str,
    provider_account_id: &str,
) -> Result<Option<StoredAccount>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE connection_id = ?1 AND provider_account_id = ?2"
        ),
        params![connection_id, provider_account_id],
        account_from_row,
    )
    .optional()?
    .map(account_from_values)
    .transpose()
}

fn load_transaction(
    conn: &Connection,
    account_id: &str,
    provider_transaction_id: &str,
) -> Result<Option<StoredTransaction>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, posted, amount, description, pending, updated_at FROM transactions \
             WHERE account_id = ?1 AND provider_transaction_id = ?2",
            params![account_id, provider_transaction_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, posted, amount, description, pending, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(StoredTransaction {
        id: parse_id(&id)?,
        account_id: parse_id(account_id)?,
        provider_transaction_id: provider_transaction_id.to_string(),
        posted: parse_date(&posted)?,
        amount: parse_decimal(&amount)?,
        description,
        pending,
        updated_at: from_millis(updated_at)?,
    }))
}

fn load_cursor(
    conn: &Connection,
    connection_id: ConnectionId,
    provider_account_id: &str,
) -> Result<Option<SyncCursor>, StoreError> {
    let row = conn
        .query_row(
            "SELECT synced_from, synced_through, updated_at FROM sync_cursors \
             WHERE connection_id = ?1 AND provider_account_id = ?2",
            params![id_text(connection_id), provider_account_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((from, through, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(SyncCursor {
        connection_id,
        provider_account_id: provider_account_id.to_string(),
        synced_from: parse_date(&from)?,
        synced_through: parse_date(&through)?,
        updated_at: from_millis(updated_at)?,
    }))
}

// ========================================
// JobStore
// ========================================

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        let record = JobRecord::from(job);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(key) = record.unique_key.as_deref() {
                let existing = query_jobs(
                    &tx,
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE unique_key = ?1 \
                         AND state IN ('available', 'running', 'retryable') LIMIT 1"
                    ),
                    params![key],
                )?;
                if let Some(existing) = existing.into_iter().next() {
                    return Ok(InsertOutcome::Duplicate(existing));
                }
            }

            tx.execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, NULL, NULL)"
                ),
                params![
                    id_text(record.id),
                    record.queue,
                    record.kind.as_str(),
                    serde_json::to_string(&record.payload)?,
                    record.state.as_str(),
                    record.attempt,
                    record.max_attempts,
                    millis(record.scheduled_at),
                    record.unique_key,
                    record.cancel_requested,
                    millis(record.created_at),
                ],
            )?;
            tx.commit()?;
            Ok(InsertOutcome::Inserted(record))
        })
        .await
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<JobRecord>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = millis(request.now);

            tx.execute(
                "UPDATE jobs SET state = 'available' \
                 WHERE queue = ?1 AND state = 'retryable' AND scheduled_at <= ?2",
                params![request.queue, now],
            )?;

            let running: i64 = tx.query_row(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND state = 'running'",
                params![request.queue],
                |row| row.get(0),
            )?;
            let room = request
                .max_running
                .saturating_sub(usize::try_from(running).unwrap_or(usize::MAX))
                .min(request.limit);
            if room == 0 {
                tx.commit()?;
                return Ok(Vec::new());
            }

            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM jobs \
                     WHERE queue = ?1 AND state = 'available' AND scheduled_at <= ?2 \
                       AND attempt < max_attempts AND cancel_requested = 0 \
                     ORDER BY scheduled_at, id LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![request.queue, now, i64::try_from(room).unwrap_or(i64::MAX)],
                    |row| row.get::<_, String>(0),
                )?;
                rows.collect::<Result<_, _>>()?
            };

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                let changed = tx.execute(
                    "UPDATE jobs SET state = 'running', attempt = attempt + 1, attempted_at = ?2 \
                     WHERE id = ?1 AND state = 'available'",
                    params![id, now],
                )?;
                if changed == 1
                    && let Some(job) = load_job(&tx, &id)?
                {
                    claimed.push(job);
                }
            }
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn transition(
        &self,
        id: JobId,
        attempt: u32,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = load_job(&tx, &id_text(id))?.ok_or(StoreError::JobNotFound(id))?;
            if !job.is_leased_by(attempt) {
                return Err(StoreError::StaleTransition { id, attempt });
            }
            job.apply(transition, now);
            if write_back(&tx, &job, Some(attempt))? != 1 {
                return Err(StoreError::StaleTransition { id, attempt });
            }
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn renew_lease(
        &self,
        id: JobId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET attempted_at = ?3 \
                 WHERE id = ?1 AND state = 'running' AND attempt = ?2",
                params![id_text(id), attempt, millis(now)],
            )?;
            if changed == 1 {
                Ok(())
            } else {
                Err(StoreError::StaleTransition { id, attempt })
            }
        })
        .await
    }

    async fn request_cancel(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = load_job(&tx, &id_text(id))?.ok_or(StoreError::JobNotFound(id))?;

            let outcome = match job.state {
                JobState::Available | JobState::Retryable => {
                    job.cancel_pending(now);
                    write_back(&tx, &job, None)?;
                    CancelOutcome::Cancelled(job)
                }
                JobState::Running => {
                    job.cancel_requested = true;
                    write_back(&tx, &job, None)?;
                    CancelOutcome::Requested(job)
                }
                _ => CancelOutcome::AlreadyFinal(job),
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.with_conn(move |conn| load_job(conn, &id_text(id))).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut args: Vec<Value> = Vec::new();
            if let Some(queue) = filter.queue {
                args.push(Value::Text(queue));
                clauses.push(format!("queue = ?{}", args.len()));
            }
            if let Some(state) = filter.state {
                args.push(Value::Text(state.as_str().to_string()));
                clauses.push(format!("state = ?{}", args.len()));
            }
            if let Some(kind) = filter.kind {
                args.push(Value::Text(kind.as_str().to_string()));
                clauses.push(format!("kind = ?{}", args.len()));
            }
            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let limit = filter
                .limit
                .and_then(|n| i64::try_from(n).ok())
                .unwrap_or(-1);
            args.push(Value::Integer(limit));

            query_jobs(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs {where_clause} ORDER BY id DESC LIMIT ?{}",
                    args.len()
                ),
                params_from_iter(args),
            )
        })
        .await
    }

    async fn counts(&self) -> Result<Vec<QueueCounts>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT queue, state, COUNT(*) FROM jobs GROUP BY queue, state ORDER BY queue",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut counts: Vec<QueueCounts> = Vec::new();
            for row in rows {
                let (queue, state, n) = row?;
                let state: JobState = state.parse().map_err(StoreError::Corrupt)?;
                let n = usize::try_from(n).unwrap_or_default();
                match counts.last_mut() {
                    Some(last) if last.queue == queue => last.add(state, n),
                    _ => {
                        let mut entry = QueueCounts::new(queue);
                        entry.add(state, n);
                        counts.push(entry);
                    }
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn rescue_stuck(
        &self,
        attempted_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stuck = query_jobs(
                &tx,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE state = 'running' AND attempted_at < ?1 ORDER BY id"
                ),
                params![millis(attempted_before)],
            )?;

            let mut rescued = Vec::with_capacity(stuck.len());
            for mut job in stuck {
                let attempt = job.attempt;
                job.rescue(now);
                if write_back(&tx, &job, Some(attempt))? == 1 {
                    rescued.push(job);
                }
            }
            tx.commit()?;
            Ok(rescued)
        })
        .await
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
        self.with_conn(move |conn| {
            let state = target.as_str();
            let before = millis(finalized_before);
            let n = if dry_run {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE state = ?1 AND finalized_at < ?2",
                    params![state, before],
                    |row| row.get(0),
                )?;
                usize::try_from(n).unwrap_or_default()
            } else {
                conn.execute(
                    "DELETE FROM jobs WHERE state = ?1 AND finalized_at < ?2",
                    params![state, before],
                )?
            };
            Ok(n)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

// ========================================
// ConnectionStore
// ========================================

impl SqliteStore {
    async fn update_connection<F>(&self, id: ConnectionId, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Connection, &str) -> rusqlite::Result<usize> + Send + 'static,
    {
        self.with_conn(move |conn| {
            if update(conn, &id_text(id))? == 0 {
                return Err(StoreError::ConnectionNotFound(id));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ConnectionStore for SqliteStore {
    async fn insert_connection(&self, connection: &ProviderConnection) -> Result<(), StoreError> {
        let c = connection.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO connections ({CONNECTION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    id_text(c.id),
                    id_text(c.organization_id),
                    c.provider_type,
                    c.name,
                    c.credentials.ciphertext,
                    c.credentials.nonce,
                    c.credentials.key_version,
                    c.status.as_str(),
                    c.status_message,
                    c.last_synced_at.map(millis),
                    millis(c.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_connection(
        &self,
        id: ConnectionId,
    ) -> Result<Option<ProviderConnection>, StoreError> {
        self.with_conn(move |conn| load_connection(conn, &id_text(id)))
            .await
    }

    async fn update_credentials(
        &self,
        id: ConnectionId,
        credentials: &SealedCredentials,
    ) -> Result<(), StoreError> {
        let sealed = credentials.clone();
        self.update_connection(id, move |conn, id| {
            conn.execute(
                "UPDATE connections SET ciphertext = ?2, nonce = ?3, key_version = ?4 WHERE id = ?1",
                params![id, sealed.ciphertext, sealed.nonce, sealed.key_version],
            )
        })
        .await
    }

    async fn mark_connection_error(
        &self,
        id: ConnectionId,
        message: &str,
    ) -> Result<(), StoreError> {
        let message = message.to_string();
        self.update_connection(id, move |conn, id| {
            conn.execute(
                "UPDATE connections SET \
                 status = CASE WHEN status = ?4 THEN status ELSE ?2 END, \
                 status_message = CASE WHEN status = ?4 THEN status_message ELSE ?3 END \
                 WHERE id = ?1",
                params![
                    id,
                    ConnectionStatus::Error.as_str(),
                    message,
                    ConnectionStatus::Disabled.as_str(),
                ],
            )
        })
        .await
    }

    async fn mark_connection_synced(
        &self,
        id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_connection(id, move |conn, id| {
            conn.execute(
                "UPDATE connections SET \
                 status = CASE WHEN status = ?4 THEN status ELSE ?2 END, \
                 status_message = CASE WHEN status = ?4 THEN status_message ELSE NULL END, \
                 last_synced_at = ?3 \
                 WHERE id = ?1",
                params![
                    id,
                    ConnectionStatus::Active.as_str(),
                    millis(at),
                    ConnectionStatus::Disabled.as_str(),
                ],
            )
        })
        .await
    }

    async fn mark_connection_verified(
        &self,
        id: ConnectionId,
        message: &str,
    ) -> Result<(), StoreError> {
        let message = message.to_string();
        self.update_connection(id, move |conn, id| {
            conn.execute(
                "UPDATE connections SET \
                 status = CASE WHEN status = ?4 THEN status ELSE ?2 END, \
                 status_message = CASE WHEN status = ?4 THEN status_message ELSE ?3 END \
                 WHERE id = ?1",
                params![
                    id,
                    ConnectionStatus::Active.as_str(),
                    message,
                    ConnectionStatus::Disabled.as_str(),
                ],
            )
        })
        .await
    }

    async fn disable_connection(&self, id: ConnectionId) -> Result<(), StoreError> {
        self.update_connection(id, move |conn, id| {
            conn.execute(
                "UPDATE connections SET status = ?2 WHERE id = ?1",
                params![id, ConnectionStatus::Disabled.as_str()],
            )
        })
        .await
    }
}

// ========================================
// LedgerRepository
// ========================================

#[async_trait]
impl LedgerRepository for SqliteStore {
    async fn upsert_account(
        &self,
        connection: &ProviderConnection,
        account: &ProviderAccount,
        now: DateTime<Utc>,
    ) -> Result<StoredAccount, StoreError> {
        let connection_id = connection.id;
        let organization_id = connection.organization_id;
        let account = account.clone();
        let new_id = self.ids.account_id();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = load_account(
                &tx,
                &id_text(connection_id),
                &account.provider_account_id,
            )?;

            let stored = match existing {
                Some(mut stored) => {
                    if stored.differs_from(&account) {
                        tx.execute(
                            "UPDATE accounts SET name = ?2, currency = ?3, balance = ?4, \
                             balance_date = ?5, institution = ?6, updated_at = ?7 WHERE id = ?1",
                            params![
                                id_text(stored.id),
                                account.name,
                                account.currency,
                                account.balance.to_string(),
                                account.balance_date.map(millis),
                                account.institution,
                                millis(now),
                            ],
                        )?;
                        stored.name = account.name;
                        stored.currency = account.currency;
                        stored.balance = account.balance;
                        stored.balance_date = account.balance_date;
                        stored.institution = account.institution;
                        stored.updated_at = now;
                    }
                    stored
                }
                None => {
                    let stored = StoredAccount {
                        id: new_id,
                        connection_id,
                        organization_id,
                        provider_account_id: account.provider_account_id,
                        name: account.name,
                        currency: account.currency,
                        balance: account.balance,
                        balance_date: account.balance_date,
                        institution: account.institution,
                        updated_at: now,
                    };
                    tx.execute(
                        &format!(
                            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                        ),
                        params![
                            id_text(stored.id),
                            id_text(stored.connection_id),
                            id_text(stored.organization_id),
                            stored.provider_account_id,
                            stored.name,
                            stored.currency,
                            stored.balance.to_string(),
                            stored.balance_date.map(millis),
                            stored.institution,
                            millis(now),
                        ],
                    )?;
                    stored
                }
            };
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn find_account(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
    ) -> Result<Option<StoredAccount>, StoreError> {
        let provider_account_id = provider_account_id.to_string();
        self.with_conn(move |conn| {
            load_account(conn, &id_text(connection_id), &provider_account_id)
        })
        .await
    }

    async fn upsert_transactions(
        &self,
        account_id: AccountId,
        transactions: &[ProviderTransaction],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary, StoreError> {
        let transactions = transactions.to_vec();
        let new_ids: Vec<_> = transactions
            .iter()
            .map(|_| self.ids.transaction_id())
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let account = id_text(account_id);
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM accounts WHERE id = ?1",
                    params![account],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::Database(format!(
                    "account {account_id} does not exist"
                )));
            }

            let mut summary = UpsertSummary::default();
            for (txn, new_id) in transactions.iter().zip(new_ids) {
                let outcome = match load_transaction(&tx, &account, &txn.provider_transaction_id)? {
                    Some(existing) if existing.differs_from(txn) => {
                        tx.execute(
                            "UPDATE transactions SET posted = ?2, amount = ?3, description = ?4, \
                             pending = ?5, updated_at = ?6 WHERE id = ?1",
                            params![
                                id_text(existing.id),
                                txn.posted.to_string(),
                                txn.amount.to_string(),
                                txn.description,
                                txn.pending,
                                millis(now),
                            ],
                        )?;
                        UpsertOutcome::Updated
                    }
                    Some(_) => UpsertOutcome::Unchanged,
                    None => {
                        tx.execute(
                            "INSERT INTO transactions (id, account_id, provider_transaction_id, \
                             posted, amount, description, pending, updated_at) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                            params![
                                id_text(new_id),
                                account,
                                txn.provider_transaction_id,
                                txn.posted.to_string(),
                                txn.amount.to_string(),
                                txn.description,
                                txn.pending,
                                millis(now),
                            ],
                        )?;
                        UpsertOutcome::Inserted
                    }
                };
                summary.record(outcome);
            }
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn transaction_count(&self, connection_id: ConnectionId) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM transactions t JOIN accounts a ON t.account_id = a.id \
                 WHERE a.connection_id = ?1",
                params![id_text(connection_id)],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
        .await
    }

    async fn get_cursor(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
    ) -> Result<Option<SyncCursor>, StoreError> {
        let provider_account_id = provider_account_id.to_string();
        self.with_conn(move |conn| load_cursor(conn, connection_id, &provider_account_id))
            .await
    }

    async fn advance_cursor(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<SyncCursor, StoreError> {
        let provider_account_id = provider_account_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let previous = load_cursor(&tx, connection_id, &provider_account_id)?;
            let cursor = SyncCursor::advanced(
                previous.as_ref(),
                connection_id,
                &provider_account_id,
                range,
                now,
            );
            tx.execute(
                "INSERT OR REPLACE INTO sync_cursors \
                 (connection_id, provider_account_id, synced_from, synced_through, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id_text(connection_id),
                    cursor.provider_account_id,
                    cursor.synced_from.to_string(),
                    cursor.synced_through.to_string(),
                    millis(now),
                ],
            )?;
            tx.commit()?;
            Ok(cursor)
        })
        .await
    }

    async fn last_activity(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_conn(move |conn| {
            let newest: Option<i64> = conn.query_row(
                "SELECT MAX(m) FROM (
                    SELECT MAX(updated_at) AS m FROM accounts WHERE organization_id = ?1
                    UNION ALL
                    SELECT MAX(t.updated_at) FROM transactions t
                        JOIN accounts a ON t.account_id = a.id
                        WHERE a.organization_id = ?1
                )",
                params![id_text(organization_id)],
                |row| row.get(0),
            )?;
            newest.map(from_millis).transpose()
        })
        .await
    }
}
