//! Provider-side and reconciled ledger data.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, ConnectionId, OrganizationId, TransactionId};

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.start > self.end {
            return Err(format!(
                "start date {} is after end date {}",
                self.start, self.end
            ));
        }
        Ok(())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Account as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAccount {
    pub provider_account_id: String,
    pub name: String,
    pub currency: String,
    pub balance: Decimal,
    pub balance_date: Option<DateTime<Utc>>,
    pub institution: Option<String>,
}

/// Transaction as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTransaction {
    pub provider_transaction_id: String,
    pub posted: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAccount {
    pub id: AccountId,
    pub connection_id: ConnectionId,
    pub organization_id: OrganizationId,
    pub provider_account_id: String,
    pub name: String,
    pub currency: String,
    pub balance: Decimal,
    pub balance_date: Option<DateTime<Utc>>,
    pub institution: Option<String>,
    /// Last time the stored values actually changed.
    pub updated_at: DateTime<Utc>,
}

impl StoredAccount {
    /// Whether applying `incoming` would change anything.
    pub fn differs_from(&self, incoming: &ProviderAccount) -> bool {
        self.name != incoming.name
            || self.currency != incoming.currency
            || self.balance != incoming.balance
            || self.balance_date != incoming.balance_date
            || self.institution != incoming.institution
    }

    pub fn as_provider_account(&self) -> ProviderAccount {
        ProviderAccount {
            provider_account_id: self.provider_account_id.clone(),
            name: self.name.clone(),
            currency: self.currency.clone(),
            balance: self.balance,
            balance_date: self.balance_date,
            institution: self.institution.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub provider_transaction_id: String,
    pub posted: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub pending: bool,
    pub updated_at: DateTime<Utc>,
}

impl StoredTransaction {
    pub fn differs_from(&self, incoming: &ProviderTransaction) -> bool {
        self.posted != incoming.posted
            || self.amount != incoming.amount
            || self.description != incoming.description
            || self.pending != incoming.pending
    }
}

/// Last successfully reconciled range for one account of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub connection_id: ConnectionId,
    pub provider_account_id: String,
    pub synced_from: NaiveDate,
    pub synced_through: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    /// Cursor after reconciling `range`. Coverage only grows: the cursor never
    /// moves backwards when an older range is re-synced.
    pub fn advanced(
        previous: Option<&SyncCursor>,
        connection_id: ConnectionId,
        provider_account_id: &str,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> SyncCursor {
        let (from, through) = match previous {
            Some(prev) => (
                prev.synced_from.min(range.start),
                prev.synced_through.max(range.end),
            ),
            None => (range.start, range.end),
        };
        SyncCursor {
            connection_id,
            provider_account_id: provider_account_id.to_string(),
            synced_from: from,
            synced_through: through,
            updated_at: now,
        }
    }
}

/// What an idempotent upsert did with one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}
