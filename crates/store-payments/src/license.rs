//! License Issuance
//!
//! Client for the external license-admin API. Creation never fails the
//! caller: any error falls back to a lookup by email, and an unavailable
//! license is reported as `None`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::env;
use crate::error::{PaymentError, Result, clip};
use crate::metadata::MetadataBag;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OBJECT_PREFIX: &str = "order";
const ERROR_BODY_LIMIT: usize = 2_000;

/// License admin configuration
#[derive(Clone, Debug)]
pub struct LicenseConfig {
    /// Full purchase endpoint, e.g. `https://license.example.com/admin/purchases`
    pub endpoint: Option<String>,

    pub api_key: Option<String>,

    pub timeout: Duration,

    /// Prefix for synthesized provider object ids
    pub provider_object_prefix: String,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            provider_object_prefix: DEFAULT_OBJECT_PREFIX.into(),
        }
    }
}

impl LicenseConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("LICENSE_ADMIN_URL"),
            api_key: env::var("LICENSE_KEY_ADMIN_API_KEY"),
            timeout: Duration::from_millis(
                env::parse("LICENSE_ADMIN_TIMEOUT_MS").unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            provider_object_prefix: env::var("LICENSE_ADMIN_PROVIDER_OBJECT_PREFIX")
                .unwrap_or_else(|| DEFAULT_OBJECT_PREFIX.into()),
        }
    }

    fn credentials(&self) -> std::result::Result<(&str, &str), &'static str> {
        match (self.endpoint.as_deref(), self.api_key.as_deref()) {
            (Some(endpoint), Some(key)) => Ok((endpoint, key)),
            (None, _) => Err("missing_endpoint"),
            (_, None) => Err("missing_token"),
        }
    }
}

/// Purchase facts sent to the license authority
#[derive(Clone, Debug)]
pub struct LicenseRequest {
    /// Event id; normalized to start with `evt`
    pub id: String,
    pub provider: String,
    pub provider_object_id: Option<String>,
    pub user_email: String,
    pub tier: Option<String>,
    pub entitlements: Vec<String>,
    pub features: Map<String, Value>,
    pub metadata: MetadataBag,
    pub status: String,
    pub event_type: String,
    /// Major units
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub raw_event: Map<String, Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LicenseRequest {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, user_email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            provider_object_id: None,
            user_email: user_email.into(),
            tier: None,
            entitlements: Vec::new(),
            features: Map::new(),
            metadata: MetadataBag::new(),
            status: "completed".into(),
            event_type: "checkout.completed".into(),
            amount: None,
            currency: None,
            raw_event: Map::new(),
            expires_at: None,
        }
    }
}

/// Refund of a previously issued license
#[derive(Clone, Debug)]
pub struct LicenseRefund {
    pub event_id: String,
    pub provider: String,
    pub provider_object_id: Option<String>,
    pub user_email: String,
    pub reason: Option<String>,
    pub original_event_id: Option<String>,
    pub tier: Option<String>,
    pub entitlements: Vec<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
}

impl From<LicenseRefund> for LicenseRequest {
    fn from(refund: LicenseRefund) -> Self {
        let reason = refund
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "refund".into());

        let mut metadata = MetadataBag::new().with("revocationReason", reason.clone());
        metadata.insert_opt("originalEventId", refund.original_event_id);

        let mut raw_event = Map::new();
        raw_event.insert("source".into(), "license.refund".into());
        raw_event.insert("reason".into(), reason.into());

        Self {
            provider_object_id: refund.provider_object_id,
            tier: refund.tier,
            entitlements: refund.entitlements,
            metadata,
            status: "refunded".into(),
            event_type: "license.refunded".into(),
            amount: refund.amount,
            currency: refund.currency,
            raw_event,
            ..Self::new(refund.event_id, refund.provider, refund.user_email)
        }
    }
}

/// License as returned by the admin API
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRecord {
    pub action: Option<String>,
    pub license_id: Option<String>,
    pub license_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PurchasePayload<'a> {
    id: String,
    provider: &'a str,
    provider_object_id: String,
    event_type: &'a str,
    status: String,
    user_email: &'a str,
    tier: &'a str,
    entitlements: &'a [String],
    features: &'a Map<String, Value>,
    metadata: &'a MetadataBag,
    amount: Option<f64>,
    currency: Option<String>,
    raw_event: Map<String, Value>,
    expires_at: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PurchaseResponse {
    action: Option<String>,
    license_id: Option<String>,
    license_key: Option<String>,
    key: Option<String>,
}

/// Event ids sent to the admin API always start with `evt`.
pub fn normalize_event_id(id: &str) -> String {
    if id.starts_with("evt") {
        id.to_string()
    } else {
        format!("evt-{id}")
    }
}

/// License issuance seam used by the orchestrator
#[async_trait]
pub trait LicenseIssuer: Send + Sync {
    /// Create (or upsert) the license for a purchase. `None` means the
    /// license is unavailable and fulfillment continues without it.
    async fn create_license_for_order(&self, request: LicenseRequest) -> Option<LicenseRecord>;

    async fn fetch_license_by_email(&self, email: &str) -> Option<LicenseRecord>;

    async fn mark_license_refunded(&self, refund: LicenseRefund) -> Option<LicenseRecord> {
        self.create_license_for_order(refund.into()).await
    }
}

/// HTTP client for the license-admin API
pub struct LicenseServiceClient {
    http: reqwest::Client,
    config: LicenseConfig,
}

impl LicenseServiceClient {
    pub fn new(config: LicenseConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(LicenseConfig::from_env())
    }

    pub fn is_configured(&self) -> bool {
        self.config.credentials().is_ok()
    }

    async fn post_purchase(&self, endpoint: &str, token: &str, payload: &PurchasePayload<'_>) -> Result<PurchaseResponse> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(token)
            .timeout(self.config.timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Http {
                status: status.as_u16(),
                body: clip(body, ERROR_BODY_LIMIT),
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(PurchaseResponse::default());
        }
        serde_json::from_str(&text).map_err(|e| PaymentError::Downstream(e.to_string()))
    }

    async fn lookup(&self, endpoint: &str, token: &str, email: &str) -> Result<Option<LicenseRecord>> {
        let url = reqwest::Url::parse(endpoint)
            .and_then(|u| u.join("/admin/licenses"))
            .map_err(|e| PaymentError::Config(format!("invalid LICENSE_ADMIN_URL: {e}")))?;

        let response = self
            .http
            .get(url)
            .query(&[("email", email)])
            .bearer_auth(token)
            .timeout(self.config.timeout)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PaymentError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: Value = response.json().await?;
        Ok(newest_active_license(&body))
    }
}

#[async_trait]
impl LicenseIssuer for LicenseServiceClient {
    async fn create_license_for_order(&self, request: LicenseRequest) -> Option<LicenseRecord> {
        let (endpoint, token) = match self.config.credentials() {
            Ok(pair) => pair,
            Err(reason) => {
                tracing::debug!(reason, provider = %request.provider, id = %request.id, "license_service.create_skipped");
                return None;
            }
        };

        let provider_object_id = request
            .provider_object_id
            .clone()
            .or_else(|| request.metadata.get_str("providerObjectId"))
            .unwrap_or_else(|| format!("{}-{}", self.config.provider_object_prefix, request.id));
        let mut raw_event = request.raw_event.clone();
        if raw_event.is_empty() {
            raw_event.insert("source".into(), "store.fulfillment".into());
        }

        let payload = PurchasePayload {
            id: normalize_event_id(&request.id),
            provider: &request.provider,
            provider_object_id,
            event_type: &request.event_type,
            status: normalize_status(&request.status),
            user_email: &request.user_email,
            tier: request.tier.as_deref().unwrap_or(&request.provider),
            entitlements: &request.entitlements,
            features: &request.features,
            metadata: &request.metadata,
            amount: request.amount,
            currency: request.currency.as_deref().map(str::to_lowercase),
            raw_event,
            expires_at: request.expires_at.map(|t| t.timestamp()),
        };

        tracing::debug!(
            provider = %request.provider,
            id = %payload.id,
            provider_object_id = %payload.provider_object_id,
            entitlements = request.entitlements.len(),
            "license_service.create_request"
        );

        match self.post_purchase(endpoint, token, &payload).await {
            Ok(response) => {
                let mut record = LicenseRecord {
                    action: response.action,
                    license_id: response.license_id,
                    license_key: response.license_key.or(response.key),
                };
                if record.license_key.is_none() {
                    if let Some(existing) = self.fetch_license_by_email(&request.user_email).await {
                        record.license_key = existing.license_key;
                    }
                }
                tracing::info!(
                    provider = %request.provider,
                    id = %request.id,
                    action = ?record.action,
                    license_id = ?record.license_id,
                    has_license_key = record.license_key.is_some(),
                    "license_service.create_success"
                );
                Some(record)
            }
            Err(e) => {
                tracing::error!(
                    provider = %request.provider,
                    id = %request.id,
                    status = ?e.http_status(),
                    error = %e,
                    "license_service.create_error"
                );
                let fallback = self.fetch_license_by_email(&request.user_email).await;
                if fallback.is_some() {
                    tracing::warn!(provider = %request.provider, id = %request.id, "license_service.fallback_license");
                }
                fallback
            }
        }
    }

    async fn fetch_license_by_email(&self, email: &str) -> Option<LicenseRecord> {
        let (endpoint, token) = self.config.credentials().ok()?;
        match self.lookup(endpoint, token, email).await {
            Ok(record) => record.filter(|r| r.license_key.is_some()),
            Err(e) => {
                tracing::warn!(error = %e, "license_service.lookup_failed");
                None
            }
        }
    }
}

fn normalize_status(status: &str) -> String {
    let status = status.trim().to_lowercase();
    if status.is_empty() { "completed".into() } else { status }
}

/// Pick the newest active license from a lookup response. Accepts a bare
/// list, `{licenses: [...]}` or a single license object.
fn newest_active_license(body: &Value) -> Option<LicenseRecord> {
    let items: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("licenses") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => vec![body],
        },
        _ => Vec::new(),
    };

    let field = |item: &Value, names: &[&str]| {
        names
            .iter()
            .find_map(|name| item.get(*name).and_then(Value::as_str))
            .map(str::to_string)
    };

    items
        .into_iter()
        .filter(|item| {
            item.get("status")
                .and_then(Value::as_str)
                .is_none_or(|s| s.eq_ignore_ascii_case("active"))
        })
        .max_by_key(|item| field(item, &["createdAt", "created_at"]).unwrap_or_default())
        .map(|item| LicenseRecord {
            action: None,
            license_id: field(item, &["licenseId", "id"]),
            license_key: field(item, &["licenseKey", "key"]),
        })
}
