//! ProviderClient port - 外部金融データプロバイダ
//!
//! 実装はすべてのエラーを transient / permanent に分類して返します。
//! orchestrator はエラーメッセージから推測しません。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::{ProviderAccount, ProviderTransaction};
use crate::vault::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network failure, rate limit, 5xx.
    Transient,
    /// Credentials rejected; the user must re-authenticate.
    Auth,
    /// Response could not be decoded.
    Malformed,
    /// Any other refusal that will not change on retry.
    Rejected,
}

#[derive(Debug, Clone, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: &str, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_type(&self) -> &str;

    async fn list_accounts(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<ProviderAccount>, ProviderError>;

    /// Transactions posted within `[start, end]`, both inclusive.
    async fn get_transactions(
        &self,
        credentials: &Credentials,
        provider_account_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;
}

/// provider_type → client
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients
            .insert(client.provider_type().to_string(), client);
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, provider_type: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider_type).cloned()
    }

    pub fn provider_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.clients.keys().cloned().collect();
        types.sort();
        types
    }
}
