//! PayPal REST Adapter
//!
//! OAuth client-credentials tokens cached per (alias, mode), plus the order
//! and webhook-verification calls the pipeline needs.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::env;
use crate::error::{PaymentError, Result};

const LIVE_BASE_URL: &str = "https://api-m.paypal.com";
const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";

/// Tokens this close to expiry are refreshed
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

pub const DEFAULT_ACCOUNT_ALIAS: &str = "primary";

/// PayPal environment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayPalMode {
    Live,
    #[default]
    Test,
}

impl PayPalMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Test => "TEST",
        }
    }

    pub const fn base_url(self) -> &'static str {
        match self {
            Self::Live => LIVE_BASE_URL,
            Self::Test => SANDBOX_BASE_URL,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "live" | "prod" | "production" => Some(Self::Live),
            "test" | "sandbox" | "dev" | "development" => Some(Self::Test),
            _ => None,
        }
    }
}

impl fmt::Display for PayPalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account a PayPal call is made for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayPalAccount {
    pub alias: Option<String>,
    pub mode: PayPalMode,
}

impl PayPalAccount {
    pub const fn new(mode: PayPalMode) -> Self {
        Self { alias: None, mode }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialField {
    ClientId,
    ClientSecret,
    WebhookId,
}

impl CredentialField {
    const fn env_prefix(self) -> &'static str {
        match self {
            Self::ClientId => "PAYPAL_CLIENT_ID",
            Self::ClientSecret => "PAYPAL_CLIENT_SECRET",
            Self::WebhookId => "PAYPAL_WEBHOOK_ID",
        }
    }
}

/// A credential and the alias it actually came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub value: String,
    pub alias: String,
    pub is_fallback: bool,
}

/// Snapshot of the `PAYPAL_*` environment
#[derive(Clone, Debug, Default)]
pub struct PayPalCredentials {
    vars: HashMap<String, String>,
}

impl PayPalCredentials {
    pub fn from_env() -> Self {
        Self::new(
            std::env::vars()
                .filter(|(k, _)| k.starts_with("PAYPAL_"))
                .collect::<HashMap<_, _>>(),
        )
    }

    pub fn new(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k, v.trim().to_string()))
                .filter(|(_, v)| !v.is_empty())
                .collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn default_alias(&self) -> String {
        self.get("PAYPAL_DEFAULT_ACCOUNT")
            .map_or_else(|| DEFAULT_ACCOUNT_ALIAS.to_string(), str::to_lowercase)
    }

    /// `PAYPAL_MODE`, else test.
    pub fn mode(&self) -> PayPalMode {
        self.get("PAYPAL_MODE")
            .and_then(PayPalMode::parse)
            .unwrap_or_default()
    }

    /// Alias-specific names first, then the account-less defaults. Landing
    /// on the defaults for a named alias counts as a fallback.
    pub fn resolve(
        &self,
        alias: Option<&str>,
        field: CredentialField,
        mode: PayPalMode,
    ) -> Option<ResolvedCredential> {
        let default_alias = self.default_alias();
        let alias = alias
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| default_alias.clone());
        let prefix = field.env_prefix();
        let mode_suffix = mode.suffix();

        if alias != default_alias {
            let suffix = env::alias_suffix(&alias);
            let aliased = [
                format!("{prefix}_{suffix}_{mode_suffix}"),
                format!("{prefix}_{suffix}"),
            ];
            if let Some(value) = aliased.iter().find_map(|name| self.get(name)) {
                return Some(ResolvedCredential {
                    value: value.to_string(),
                    alias,
                    is_fallback: false,
                });
            }
        }

        let defaults = [format!("{prefix}_{mode_suffix}"), prefix.to_string()];
        defaults
            .iter()
            .find_map(|name| self.get(name))
            .map(|value| ResolvedCredential {
                value: value.to_string(),
                is_fallback: alias != default_alias,
                alias: default_alias,
            })
    }

    fn require(&self, alias: Option<&str>, field: CredentialField, mode: PayPalMode) -> Result<ResolvedCredential> {
        let resolved = self.resolve(alias, field, mode).ok_or_else(|| {
            PaymentError::Config(format!(
                "missing PayPal {field:?} for {mode} mode (alias: {})",
                alias.unwrap_or("default")
            ))
        })?;
        if resolved.is_fallback {
            tracing::warn!(
                requested_alias = ?alias,
                resolved_alias = %resolved.alias,
                field = ?field,
                "paypal.account_alias_fallback"
            );
        }
        Ok(resolved)
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// A created PayPal order
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PayPalOrder {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PayPalLink {
    pub href: String,
    pub rel: String,
    #[serde(default)]
    pub method: Option<String>,
}

/// Transmission headers of a PayPal webhook delivery
#[derive(Clone, Debug, Default)]
pub struct WebhookTransmission {
    pub transmission_id: String,
    pub transmission_time: String,
    pub cert_url: String,
    pub auth_algo: String,
    pub transmission_sig: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationStatus {
    Success,
    Failure,
}

/// PayPal calls the webhook path depends on
#[async_trait]
pub trait PayPalApi: Send + Sync {
    async fn get_order(&self, order_id: &str, account: &PayPalAccount) -> Result<Value>;

    async fn verify_webhook_signature(
        &self,
        transmission: &WebhookTransmission,
        event: &Value,
        account: &PayPalAccount,
    ) -> Result<VerificationStatus>;
}

/// PayPal REST client
pub struct PayPalClient {
    http: reqwest::Client,
    credentials: PayPalCredentials,
    base_url_override: Option<String>,
    tokens: RwLock<HashMap<String, CachedToken>>,
}

impl PayPalClient {
    pub fn new(credentials: PayPalCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            base_url_override: None,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PayPalCredentials::from_env())
    }

    /// Send every request to `base_url` regardless of mode.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub const fn credentials(&self) -> &PayPalCredentials {
        &self.credentials
    }

    /// Default account for this deployment
    pub fn default_account(&self) -> PayPalAccount {
        PayPalAccount::new(self.credentials.mode())
    }

    fn base_url(&self, mode: PayPalMode) -> &str {
        self.base_url_override.as_deref().unwrap_or(mode.base_url())
    }

    /// Cached bearer token; returns it with the alias it was issued for.
    pub async fn access_token(&self, account: &PayPalAccount) -> Result<(String, String)> {
        let client_id = self
            .credentials
            .require(account.alias.as_deref(), CredentialField::ClientId, account.mode)?;
        let client_secret = self.credentials.require(
            Some(&client_id.alias),
            CredentialField::ClientSecret,
            account.mode,
        )?;

        let key = format!("{}:{}", client_id.alias, account.mode);
        if let Some(cached) = self.tokens.read().await.get(&key) {
            if cached.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok((cached.token.clone(), client_id.alias));
            }
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.base_url(account.mode)))
            .basic_auth(&client_id.value, Some(&client_secret.value))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), mode = %account.mode, "paypal.fetch_access_token_failed");
            return Err(PaymentError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response.json().await?;
        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PaymentError::PayPal("token response missing access_token".into()))?;
        let ttl = Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS));

        self.tokens.write().await.insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok((token, client_id.alias))
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        account: &PayPalAccount,
    ) -> Result<T> {
        let (token, _) = self.access_token(account).await?;
        let mut request = self
            .http
            .request(method.clone(), format!("{}{path}", self.base_url(account.mode)))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path, method = %method, status = status.as_u16(), "paypal.api_request_failed");
            return Err(PaymentError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn create_order(&self, payload: &Value, account: &PayPalAccount) -> Result<PayPalOrder> {
        self.request(reqwest::Method::POST, "/v2/checkout/orders", Some(payload), account)
            .await
    }

    pub async fn capture_order(&self, order_id: &str, account: &PayPalAccount) -> Result<Value> {
        self.request(
            reqwest::Method::POST,
            &format!("/v2/checkout/orders/{order_id}/capture"),
            None,
            account,
        )
        .await
    }

    /// Configured webhook id for an account
    pub fn webhook_id(&self, account: &PayPalAccount) -> Option<String> {
        self.credentials
            .resolve(account.alias.as_deref(), CredentialField::WebhookId, account.mode)
            .map(|c| c.value)
    }
}

#[async_trait]
impl PayPalApi for PayPalClient {
    async fn get_order(&self, order_id: &str, account: &PayPalAccount) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            &format!("/v2/checkout/orders/{order_id}"),
            None,
            account,
        )
        .await
    }

    async fn verify_webhook_signature(
        &self,
        transmission: &WebhookTransmission,
        event: &Value,
        account: &PayPalAccount,
    ) -> Result<VerificationStatus> {
        let webhook_id = self
            .webhook_id(account)
            .ok_or_else(|| PaymentError::Config("PAYPAL_WEBHOOK_ID not set".into()))?;
        let (token, _) = self.access_token(account).await?;

        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.base_url(account.mode)
            ))
            .bearer_auth(token)
            .json(&json!({
                "transmission_id": transmission.transmission_id,
                "transmission_time": transmission.transmission_time,
                "cert_url": transmission.cert_url,
                "auth_algo": transmission.auth_algo,
                "transmission_sig": transmission.transmission_sig,
                "webhook_id": webhook_id,
                "webhook_event": event,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::error!(status = response.status().as_u16(), "paypal.verify_webhook_failed");
            return Ok(VerificationStatus::Failure);
        }

        let body: Value = response.json().await?;
        Ok(match body.get("verification_status").and_then(Value::as_str) {
            Some("SUCCESS") => VerificationStatus::Success,
            _ => VerificationStatus::Failure,
        })
    }
}
