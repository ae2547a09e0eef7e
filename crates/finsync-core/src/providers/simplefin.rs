//! SimpleFIN bridge client.
//!
//! Credentials carry a single `access_url` field holding the bridge URL with
//! basic-auth userinfo. The userinfo is moved into an `Authorization` header
//! and never appears in logs or error messages.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Days, NaiveDate, NaiveTime};
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProvidersConfig;
use crate::domain::{DateRange, ProviderAccount, ProviderTransaction};
use crate::ports::{ProviderClient, ProviderError, ProviderErrorKind};
use crate::vault::Credentials;

pub const PROVIDER_TYPE: &str = "simplefin";
pub const ACCESS_URL_FIELD: &str = "access_url";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct AccountSet {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    accounts: Vec<WireAccount>,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    id: String,
    name: String,
    #[serde(default = "default_currency")]
    currency: String,
    balance: Decimal,
    #[serde(rename = "balance-date")]
    balance_date: Option<i64>,
    org: Option<WireOrganization>,
    transactions: Option<Vec<WireTransaction>>,
}

#[derive(Debug, Deserialize)]
struct WireOrganization {
    name: Option<String>,
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    id: String,
    /// Unix seconds; 0 while the transaction is pending.
    posted: i64,
    amount: Decimal,
    #[serde(default)]
    description: String,
    transacted_at: Option<i64>,
    pending: Option<bool>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl WireAccount {
    fn into_account(self) -> ProviderAccount {
        let institution = self.org.and_then(|org| org.name.or(org.domain));
        ProviderAccount {
            provider_account_id: self.id,
            name: self.name,
            currency: self.currency,
            balance: self.balance,
            balance_date: self
                .balance_date
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            institution,
        }
    }
}

impl WireTransaction {
    fn into_transaction(self) -> Option<ProviderTransaction> {
        let secs = if self.posted > 0 {
            self.posted
        } else {
            self.transacted_at?
        };
        let posted = DateTime::from_timestamp(secs, 0)?.date_naive();
        Some(ProviderTransaction {
            provider_transaction_id: self.id,
            posted,
            amount: self.amount,
            description: self.description,
            pending: self.pending.unwrap_or(self.posted == 0),
        })
    }
}

/// Query parameters of `GET /accounts`.
#[derive(Debug, Default, Clone)]
struct AccountsQuery<'a> {
    range: Option<DateRange>,
    account: Option<&'a str>,
    balances_only: bool,
}

impl AccountsQuery<'_> {
    fn is_empty(&self) -> bool {
        self.range.is_none() && self.account.is_none() && !self.balances_only
    }

    /// Replaces the query of `url`, percent-encoding every value.
    fn apply_to(&self, url: &mut Url) {
        url.set_query(None);
        if self.is_empty() {
            return;
        }
        let mut pairs = url.query_pairs_mut();
        if let Some(range) = self.range {
            pairs.append_pair("start-date", &unix_start_of(range.start).to_string());
            // end-date is exclusive on the bridge
            let end = range.end.checked_add_days(Days::new(1)).unwrap_or(range.end);
            pairs.append_pair("end-date", &unix_start_of(end).to_string());
        }
        if let Some(account) = self.account {
            pairs.append_pair("account", account);
        }
        if self.balances_only {
            pairs.append_pair("balances-only", "1");
        }
    }
}

fn unix_start_of(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        408 | 425 | 429 => ProviderErrorKind::Transient,
        _ if status.is_server_error() => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Rejected,
    }
}

fn error(kind: ProviderErrorKind, message: impl Into<String>) -> ProviderError {
    ProviderError::new(PROVIDER_TYPE, kind, message)
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    let kind = if err.is_decode() {
        ProviderErrorKind::Malformed
    } else {
        ProviderErrorKind::Transient
    };
    error(kind, format!("request failed: {}", err.without_url()))
}

/// Access URL with its userinfo split off as basic-auth credentials.
struct Endpoint {
    base: Url,
    username: String,
    password: Option<String>,
}

impl Endpoint {
    fn from_credentials(credentials: &Credentials) -> Result<Self, ProviderError> {
        let raw = credentials.get(ACCESS_URL_FIELD).ok_or_else(|| {
            error(
                ProviderErrorKind::Rejected,
                format!("credentials have no '{ACCESS_URL_FIELD}' field"),
            )
        })?;
        let mut base = Url::parse(raw)
            .map_err(|e| error(ProviderErrorKind::Rejected, format!("invalid access URL: {e}")))?;
        let username = base.username().to_string();
        let password = base.password().map(str::to_string);
        // set_* only fail for cannot-be-a-base URLs, which have no userinfo
        let _ = base.set_username("");
        let _ = base.set_password(None);
        Ok(Self {
            base,
            username,
            password,
        })
    }

    fn accounts_url(&self, query: &AccountsQuery<'_>) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}/accounts", url.path().trim_end_matches('/'));
        url.set_path(&path);
        query.apply_to(&mut url);
        url
    }
}

pub struct SimpleFinClient {
    client: Client,
}

impl Default for SimpleFinClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SimpleFinClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn from_config(config: &ProvidersConfig) -> Self {
        Self::new(Duration::from_secs(config.simplefin_timeout_seconds))
    }

    async fn fetch(
        &self,
        credentials: &Credentials,
        query: AccountsQuery<'_>,
    ) -> Result<AccountSet, ProviderError> {
        let endpoint = Endpoint::from_credentials(credentials)?;
        let url = endpoint.accounts_url(&query);
        debug!(
            provider = PROVIDER_TYPE,
            host = url.host_str().unwrap_or_default(),
            "fetching accounts"
        );

        let mut request = self.client.get(url);
        if !endpoint.username.is_empty() {
            request = request.basic_auth(&endpoint.username, endpoint.password.as_deref());
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(error(classify_status(status), format!("HTTP {status}")));
        }

        let set: AccountSet = response.json().await.map_err(|e| {
            error(
                ProviderErrorKind::Malformed,
                format!("could not decode account set: {}", e.without_url()),
            )
        })?;
        for message in &set.errors {
            warn!(provider = PROVIDER_TYPE, message = %message, "bridge reported an error");
        }
        Ok(set)
    }

    /// Exchange a base64 setup token for access credentials. A setup token
    /// can be claimed exactly once.
    pub async fn claim_access_url(&self, setup_token: &str) -> Result<Credentials, ProviderError> {
        let decoded = BASE64
            .decode(setup_token.trim())
            .map_err(|e| error(ProviderErrorKind::Rejected, format!("setup token is not base64: {e}")))?;
        let claim_url = String::from_utf8(decoded)
            .map_err(|_| error(ProviderErrorKind::Rejected, "setup token is not UTF-8"))?;
        let claim_url = Url::parse(claim_url.trim())
            .map_err(|e| error(ProviderErrorKind::Rejected, format!("setup token is not a URL: {e}")))?;

        let response = self
            .client
            .post(claim_url)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(error(
                classify_status(status),
                format!("claiming setup token failed: HTTP {status}"),
            ));
        }

        let body = response.text().await.map_err(transport_error)?;
        let access_url = body.trim();
        Url::parse(access_url).map_err(|_| {
            error(
                ProviderErrorKind::Malformed,
                "claim response is not an access URL",
            )
        })?;
        Ok(Credentials::new().with(ACCESS_URL_FIELD, access_url))
    }
}

#[async_trait]
impl ProviderClient for SimpleFinClient {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn list_accounts(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        let query = AccountsQuery {
            balances_only: true,
            ..AccountsQuery::default()
        };
        let set = self.fetch(credentials, query).await?;
        Ok(set
            .accounts
            .into_iter()
            .map(WireAccount::into_account)
            .collect())
    }

    async fn get_transactions(
        &self,
        credentials: &Credentials,
        provider_account_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        let range = DateRange::new(start, end)
            .map_err(|e| error(ProviderErrorKind::Rejected, e))?;
        let query = AccountsQuery {
            range: Some(range),
            account: Some(provider_account_id),
            balances_only: false,
        };
        let set = self.fetch(credentials, query).await?;

        let Some(account) = set
            .accounts
            .into_iter()
            .find(|a| a.id == provider_account_id)
        else {
            warn!(
                provider = PROVIDER_TYPE,
                provider_account_id, "account missing from bridge response"
            );
            return Ok(Vec::new());
        };

        Ok(account
            .transactions
            .unwrap_or_default()
            .into_iter()
            .filter_map(WireTransaction::into_transaction)
            .filter(|tx| range.contains(tx.posted))
            .collect())
    }
}
