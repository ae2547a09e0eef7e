//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型ごとに区別します。
//! - 生成順でソート可能（claim の tie-break に使う）
//! - `JobId` と `ConnectionId` は混同できない
//!
//! Display はプレフィックス付き（`job-01H...`）、serde とストレージでは
//! ULID 文字列のみを使います。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "job-", "conn-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when an id string is neither `<prefix><ulid>` nor a bare ULID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id '{0}'")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Connection {}

impl IdMarker for Connection {
    fn prefix() -> &'static str {
        "conn-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Organization {}

impl IdMarker for Organization {
    fn prefix() -> &'static str {
        "org-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Account {}

impl IdMarker for Account {
    fn prefix() -> &'static str {
        "acct-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transaction {}

impl IdMarker for Transaction {
    fn prefix() -> &'static str {
        "txn-"
    }
}

/// Identifier of a queued job.
pub type JobId = Id<Job>;

/// Identifier of a provider connection.
pub type ConnectionId = Id<Connection>;

/// Identifier of the organization owning connections and ledger data.
pub type OrganizationId = Id<Organization>;

/// Local identifier of a reconciled account.
pub type AccountId = Id<Account>;

/// Local identifier of a reconciled transaction.
pub type TransactionId = Id<Transaction>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        let ulid = Ulid::new();
        assert_eq!(JobId::from_ulid(ulid).to_string(), format!("job-{ulid}"));
        assert_eq!(
            ConnectionId::from_ulid(ulid).to_string(),
            format!("conn-{ulid}")
        );
    }

    #[test]
    fn parse_accepts_prefixed_and_bare() {
        let ulid = Ulid::new();
        let prefixed: JobId = format!("job-{ulid}").parse().unwrap();
        let bare: JobId = ulid.to_string().parse().unwrap();
        assert_eq!(prefixed, bare);
        assert_eq!(prefixed.as_ulid(), ulid);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("job-not-a-ulid".parse::<JobId>().is_err());
        assert!("".parse::<ConnectionId>().is_err());
    }

    #[test]
    fn serializes_as_bare_ulid_string() {
        let ulid = Ulid::new();
        let id = ConnectionId::from_ulid(ulid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{ulid}\""));

        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ordering_follows_ulid() {
        let a = JobId::from_ulid(Ulid::from_parts(1_000, 5));
        let b = JobId::from_ulid(Ulid::from_parts(1_000, 6));
        let c = JobId::from_ulid(Ulid::from_parts(1_001, 0));
        assert!(a < b);
        assert!(b < c);
        // ストレージは ULID 文字列で ORDER BY するので文字列順も一致する必要がある
        assert!(a.as_ulid().to_string() < b.as_ulid().to_string());
        assert!(b.as_ulid().to_string() < c.as_ulid().to_string());
    }
}
