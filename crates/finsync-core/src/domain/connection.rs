//! Provider connections.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConnectionId, OrganizationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    /// A permanent failure needs the user to re-authenticate.
    Error,
    Disabled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "error" => Ok(ConnectionStatus::Error),
            "disabled" => Ok(ConnectionStatus::Disabled),
            other => Err(format!("unknown connection status '{other}'")),
        }
    }
}

/// Ciphertext of a connection's credentials, as persisted.
///
/// `key_version` names the vault key that sealed it; the key itself is never
/// stored next to the ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedCredentials {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub key_version: u32,
}

impl fmt::Debug for SealedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedCredentials")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    pub organization_id: OrganizationId,
    pub provider_type: String,
    pub name: String,
    pub credentials: SealedCredentials,
    pub status: ConnectionStatus,
    pub status_message: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    /// Additional authenticated data binding a ciphertext to its connection row.
    pub fn credentials_aad(&self) -> Vec<u8> {
        credentials_aad(self.id)
    }
}

pub fn credentials_aad(id: ConnectionId) -> Vec<u8> {
    format!("connection:{}", id.as_ulid()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_debug_hides_bytes() {
        let sealed = SealedCredentials {
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
            nonce: vec![0; 12],
            key_version: 2,
        };
        let shown = format!("{sealed:?}");
        assert!(shown.contains("ciphertext_len: 4"));
        assert!(!shown.contains("222"));
        assert!(!shown.contains("nonce"));
    }

    #[test]
    fn status_parses() {
        for status in [
            ConnectionStatus::Active,
            ConnectionStatus::Error,
            ConnectionStatus::Disabled,
        ] {
            assert_eq!(status.as_str().parse::<ConnectionStatus>().unwrap(), status);
        }
    }
}
