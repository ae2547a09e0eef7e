//! Connection and ledger repositories consumed by the sync handler.
//!
//! Account and transaction upserts are idempotent by contract: re-applying the
//! same provider ids updates in place and never inserts a duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AccountId, Connection, ConnectionId, DateRange, OrganizationId, ProviderAccount,
    ProviderTransaction, SealedCredentials, StoredAccount, SyncCursor, UpsertSummary,
};
use crate::error::StoreError;

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError>;

    async fn get_connection(&self, id: ConnectionId) -> Result<Option<Connection>, StoreError>;

    async fn update_credentials(
        &self,
        id: ConnectionId,
        credentials: &SealedCredentials,
    ) -> Result<(), StoreError>;

    /// Flip to `Error` with a user-facing message. A disabled connection
    /// keeps its status.
    async fn mark_connection_error(
        &self,
        id: ConnectionId,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Flip back to `Active` and record the sync time. A disabled connection
    /// only gets the sync time.
    async fn mark_connection_synced(
        &self,
        id: ConnectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flip to `Active` after a successful connection test, leaving the sync
    /// time alone. A disabled connection keeps its status.
    async fn mark_connection_verified(
        &self,
        id: ConnectionId,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn disable_connection(&self, id: ConnectionId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Upsert keyed by `(connection_id, provider_account_id)`.
    async fn upsert_account(
        &self,
        connection: &Connection,
        account: &ProviderAccount,
        now: DateTime<Utc>,
    ) -> Result<StoredAccount, StoreError>;

    async fn find_account(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
    ) -> Result<Option<StoredAccount>, StoreError>;

    /// Upsert keyed by `(account_id, provider_transaction_id)`, all or nothing.
    async fn upsert_transactions(
        &self,
        account_id: AccountId,
        transactions: &[ProviderTransaction],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary, StoreError>;

    async fn transaction_count(&self, connection_id: ConnectionId) -> Result<usize, StoreError>;

    async fn get_cursor(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
    ) -> Result<Option<SyncCursor>, StoreError>;

    async fn advance_cursor(
        &self,
        connection_id: ConnectionId,
        provider_account_id: &str,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<SyncCursor, StoreError>;

    /// Latest time any account or transaction of the organization changed.
    async fn last_activity(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}
