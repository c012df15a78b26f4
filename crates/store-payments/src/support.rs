//! Support Sync
//!
//! Mirrors live purchases into the support desk as a people profile,
//! structured people data and a timeline event. The people id is the
//! SHA-256 hex of the normalized email, so every purchase by the same
//! customer lands on the same profile. Progress is tracked through
//! `crispSyncedAt`/`crispPeopleId` on the checkout session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::env;
use crate::error::{PaymentError, Result};
use crate::fulfillment::OrderUrls;
use crate::ledger::{CheckoutLedger, SessionStatus, SessionStatusUpdate};
use crate::metadata::MetadataBag;
use crate::resolve::normalize_email;

const DEFAULT_BASE_URL: &str = "https://api.crisp.chat/v1";
const EVENT_TEXT: &str = "Checkout purchase";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CrispTier {
    #[default]
    Plugin,
    User,
}

impl CrispTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::User => "user",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("user") { Self::User } else { Self::Plugin }
    }
}

/// Support desk credentials
#[derive(Clone)]
pub struct CrispConfig {
    pub website_id: String,
    pub identifier: String,
    key: String,
    pub tier: CrispTier,
    pub base_url: String,
    pub timeout: Duration,
}

impl fmt::Debug for CrispConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrispConfig")
            .field("website_id", &mask(&self.website_id))
            .field("identifier", &mask(&self.identifier))
            .field("tier", &self.tier)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CrispConfig {
    pub fn new(website_id: impl Into<String>, identifier: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            website_id: website_id.into(),
            identifier: identifier.into(),
            key: key.into(),
            tier: CrispTier::default(),
            base_url: DEFAULT_BASE_URL.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// `None` unless website id, identifier and key are all set.
    pub fn from_env() -> Option<Self> {
        let website_id = env::var("CRISP_WEBSITE_ID");
        let identifier = env::first_var(&["CRISP_API_TOKEN_IDENTIFIER", "CRISP_API_DEVELOPMENT_TOKEN_IDENTIFIER"]);
        let key = env::first_var(&["CRISP_API_TOKEN_KEY", "CRISP_API_DEVELOPMENT_TOKEN_KEY"]);

        match (website_id, identifier, key) {
            (Some(website_id), Some(identifier), Some(key)) => {
                let mut config = Self::new(website_id, identifier, key);
                config.tier = env::first_var(&["CRISP_API_TIER", "CRISP_TIER"])
                    .map(|t| CrispTier::parse(&t))
                    .unwrap_or_default();
                Some(config)
            }
            (website_id, identifier, key) => {
                tracing::info!(
                    reason = "missing_config",
                    has_website_id = website_id.is_some(),
                    has_identifier = identifier.is_some(),
                    has_key = key.is_some(),
                    "crisp.sync_skipped"
                );
                None
            }
        }
    }
}

/// First and last four characters of a secret-ish value.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Deterministic people id for an email.
pub fn people_id(email: &str) -> Option<String> {
    normalize_email(email).map(|e| hex::encode(Sha256::digest(e.as_bytes())))
}

/// Purchase facts handed to the support desk
#[derive(Clone, Debug, Default)]
pub struct SupportContext {
    /// Checkout session id the sync markers are written to
    pub session_id: String,
    pub offer_id: String,
    pub product_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_status: Option<String>,
    pub payment_method: Option<String>,
    pub provider: String,

    /// `live` or `test`
    pub provider_mode: Option<String>,
    pub provider_session_id: Option<String>,
    pub provider_payment_id: Option<String>,
    pub provider_charge_id: Option<String>,
    pub license_id: Option<String>,
    pub license_key: Option<String>,
    pub license_tier: Option<String>,
    pub license_entitlements: Vec<String>,
    pub urls: OrderUrls,
}

impl SupportContext {
    fn event_data(&self) -> Value {
        #[allow(clippy::cast_precision_loss)]
        let amount = self.amount_total.map(|cents| cents as f64 / 100.0);
        let data = json!({
            "orderId": self.session_id,
            "offerId": self.offer_id,
            "productName": self.product_name.as_deref().unwrap_or(&self.offer_id),
            "paymentProvider": self.provider,
            "providerMode": self.provider_mode,
            "providerSessionId": self.provider_session_id.as_deref().unwrap_or(&self.session_id),
            "providerPaymentId": self.provider_payment_id,
            "providerChargeId": self.provider_charge_id,
            "paymentStatus": self.payment_status,
            "paymentMethod": self.payment_method,
            "amountCents": self.amount_total,
            "amount": amount,
            "currency": self.currency,
            "licenseId": self.license_id,
            "licenseKey": self.license_key,
            "licenseTier": self.license_tier,
            "licenseEntitlements": (!self.license_entitlements.is_empty()).then_some(&self.license_entitlements),
            "productPageUrl": self.urls.product_page_url,
            "purchaseUrl": self.urls.purchase_url,
            "storeProductPageUrl": self.urls.store_product_page_url,
            "appsProductPageUrl": self.urls.apps_product_page_url,
            "serplyLink": self.urls.serply_link,
            "successUrl": self.urls.success_url,
            "cancelUrl": self.urls.cancel_url,
        });
        compact_fields(data)
    }
}

/// Drop null and empty-string fields of an object (one level).
pub fn compact_fields(value: Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
                .collect(),
        ),
        other => other,
    }
}

/// Where a sync stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStage {
    LookupSession,
    Profile,
    Data,
    Event,
    MetadataUpdate,
}

impl SyncStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LookupSession => "lookup_session",
            Self::Profile => "profile",
            Self::Data => "data",
            Self::Event => "event",
            Self::MetadataUpdate => "metadata_update",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportSkip {
    MissingConfig,
    NonLive,
    MissingEmail,
    AlreadySynced,
}

impl SupportSkip {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingConfig => "missing_config",
            Self::NonLive => "non_live",
            Self::MissingEmail => "missing_email",
            Self::AlreadySynced => "already_synced",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupportSyncResult {
    Synced {
        people_id: String,
    },
    Skipped {
        reason: SupportSkip,
        people_id: Option<String>,
    },
    Failed {
        people_id: String,
        stage: SyncStage,
    },
}

impl SupportSyncResult {
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Synced { .. } => "synced",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "error",
        }
    }
}

/// Support seam used by the orchestrator. Never fails the caller.
#[async_trait]
pub trait SupportSync: Send + Sync {
    async fn sync_purchase(&self, context: &SupportContext) -> SupportSyncResult;
}

#[derive(Deserialize)]
struct CrispEnvelope {
    #[serde(default)]
    error: bool,
    reason: Option<String>,
}

/// Support desk REST client
pub struct CrispClient {
    http: reqwest::Client,
    config: Option<CrispConfig>,
    ledger: Arc<dyn CheckoutLedger>,
}

impl CrispClient {
    pub fn new(config: Option<CrispConfig>, ledger: Arc<dyn CheckoutLedger>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            ledger,
        }
    }

    pub fn from_env(ledger: Arc<dyn CheckoutLedger>) -> Self {
        Self::new(CrispConfig::from_env(), ledger)
    }

    async fn request(&self, config: &CrispConfig, method: Method, path: &str, body: &Value) -> Result<()> {
        let response = self
            .http
            .request(method, format!("{}{path}", config.base_url))
            .basic_auth(&config.identifier, Some(&config.key))
            .header("X-Crisp-Tier", config.tier.as_str())
            .header("Accept", "application/json")
            .timeout(config.timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let ok = response.status().is_success();
        let envelope = response.json::<CrispEnvelope>().await.ok();

        match envelope {
            Some(envelope) if ok && !envelope.error => Ok(()),
            other => Err(PaymentError::Http {
                status,
                body: other
                    .and_then(|e| e.reason)
                    .unwrap_or_else(|| format!("Crisp API request failed ({status}).")),
            }),
        }
    }

    async fn run(&self, config: &CrispConfig, ctx: &SupportContext, email: &str, people_id: &str, stage: &mut SyncStage) -> Result<bool> {
        *stage = SyncStage::LookupSession;
        let existing = self.ledger.find_checkout_session_by_stripe_session_id(&ctx.session_id).await?;
        let already_synced = existing.is_some_and(|session| {
            session.metadata.get_str("crispSyncedAt").is_some()
                || session.metadata.get_str("crispPeopleId").as_deref() == Some(people_id)
        });
        if already_synced {
            return Ok(false);
        }

        let website = &config.website_id;
        let masked_website = mask(website);
        let nickname = ctx.customer_name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        let phone = ctx.customer_phone.as_deref().map(str::trim).filter(|p| !p.is_empty());
        let event_data = ctx.event_data();

        tracing::info!(
            session_id = %ctx.session_id,
            offer_id = %ctx.offer_id,
            people_id,
            email_domain = ?email.split_once('@').map(|(_, d)| d),
            website_id = %masked_website,
            "crisp.sync_started"
        );

        *stage = SyncStage::Profile;
        let profile = json!({
            "email": email,
            "person": compact_fields(json!({ "nickname": nickname, "phone": phone })),
        });
        self.request(config, Method::PUT, &format!("/website/{website}/people/profile/{people_id}"), &profile)
            .await?;
        tracing::info!(session_id = %ctx.session_id, people_id, website_id = %masked_website, "crisp.profile_saved");

        *stage = SyncStage::Data;
        let data = json!({
            "data": compact_fields(json!({
                "type": "customer",
                "signup": "finished",
                "email": email,
                "nickname": nickname,
                "phone_number": phone,
                "metadata": event_data,
            })),
        });
        self.request(config, Method::PUT, &format!("/website/{website}/people/data/{people_id}"), &data)
            .await?;
        tracing::info!(session_id = %ctx.session_id, people_id, website_id = %masked_website, "crisp.data_saved");

        *stage = SyncStage::Event;
        let event = json!({ "text": EVENT_TEXT, "color": "green", "data": event_data });
        self.request(config, Method::POST, &format!("/website/{website}/people/events/{people_id}"), &event)
            .await?;
        tracing::info!(session_id = %ctx.session_id, people_id, website_id = %masked_website, "crisp.event_added");

        *stage = SyncStage::MetadataUpdate;
        let markers = MetadataBag::new()
            .with("crispSyncedAt", chrono::Utc::now().to_rfc3339())
            .with("crispPeopleId", people_id)
            .with("crispEventText", EVENT_TEXT);
        self.ledger
            .update_checkout_session_status(
                &ctx.session_id,
                SessionStatus::Completed,
                SessionStatusUpdate {
                    metadata: markers,
                    ..Default::default()
                },
            )
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl SupportSync for CrispClient {
    async fn sync_purchase(&self, ctx: &SupportContext) -> SupportSyncResult {
        let Some(config) = &self.config else {
            return SupportSyncResult::Skipped {
                reason: SupportSkip::MissingConfig,
                people_id: None,
            };
        };

        if ctx.provider_mode.as_deref() != Some("live") {
            tracing::debug!(
                reason = SupportSkip::NonLive.as_str(),
                session_id = %ctx.session_id,
                offer_id = %ctx.offer_id,
                provider_mode = ?ctx.provider_mode,
                "crisp.sync_skipped"
            );
            return SupportSyncResult::Skipped {
                reason: SupportSkip::NonLive,
                people_id: None,
            };
        }

        let Some(email) = ctx.customer_email.as_deref().and_then(normalize_email) else {
            tracing::info!(
                reason = SupportSkip::MissingEmail.as_str(),
                session_id = %ctx.session_id,
                offer_id = %ctx.offer_id,
                "crisp.sync_skipped"
            );
            return SupportSyncResult::Skipped {
                reason: SupportSkip::MissingEmail,
                people_id: None,
            };
        };
        let people_id = hex::encode(Sha256::digest(email.as_bytes()));

        let mut stage = SyncStage::LookupSession;
        match self.run(config, ctx, &email, &people_id, &mut stage).await {
            Ok(true) => {
                tracing::info!(
                    session_id = %ctx.session_id,
                    people_id = %people_id,
                    website_id = %mask(&config.website_id),
                    "crisp.sync_succeeded"
                );
                SupportSyncResult::Synced { people_id }
            }
            Ok(false) => {
                tracing::info!(
                    reason = SupportSkip::AlreadySynced.as_str(),
                    session_id = %ctx.session_id,
                    people_id = %people_id,
                    "crisp.sync_skipped"
                );
                SupportSyncResult::Skipped {
                    reason: SupportSkip::AlreadySynced,
                    people_id: Some(people_id),
                }
            }
            Err(e) => {
                tracing::error!(
                    session_id = %ctx.session_id,
                    people_id = %people_id,
                    website_id = %mask(&config.website_id),
                    stage = stage.as_str(),
                    status = ?e.http_status(),
                    error = %e,
                    "crisp.sync_failed"
                );
                SupportSyncResult::Failed { people_id, stage }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{post, put};
    use axum::{Json, Router};

    use super::*;
    use crate::ledger::{CheckoutSessionUpsert, MemoryLedger, PaymentSource};
    use crate::test_support::serve;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn router(calls: Calls, fail_data: bool) -> Router {
        Router::new()
            .route(
                "/website/{website}/people/profile/{people}",
                put(|State(calls): State<Calls>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers["x-crisp-tier"], "plugin");
                    assert!(headers["authorization"].to_str().unwrap().starts_with("Basic "));
                    assert_eq!(body["email"], "buyer@example.com");
                    calls.lock().unwrap().push("profile".into());
                    Json(json!({ "error": false, "reason": "updated" }))
                }),
            )
            .route(
                "/website/{website}/people/data/{people}",
                put(move |State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    calls.lock().unwrap().push("data".into());
                    assert!(body["data"]["metadata"].get("providerChargeId").is_none());
                    if fail_data {
                        (StatusCode::BAD_REQUEST, Json(json!({ "error": true, "reason": "invalid_data" })))
                    } else {
                        (StatusCode::OK, Json(json!({ "error": false })))
                    }
                }),
            )
            .route(
                "/website/{website}/people/events/{people}",
                post(|State(calls): State<Calls>, Path((_, people)): Path<(String, String)>| async move {
                    calls.lock().unwrap().push(format!("event:{people}"));
                    Json(json!({ "error": false }))
                }),
            )
            .with_state(calls)
    }

    async fn setup(fail_data: bool) -> (CrispClient, Arc<MemoryLedger>, Calls) {
        let calls = Calls::default();
        let base = serve(router(calls.clone(), fail_data)).await;
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_checkout_session(CheckoutSessionUpsert::new("cs_1", SessionStatus::Completed, PaymentSource::Stripe))
            .await
            .unwrap();
        let mut config = CrispConfig::new("website-1234-5678", "ident", "key");
        config.base_url = base;
        (CrispClient::new(Some(config), ledger.clone()), ledger, calls)
    }

    fn ctx() -> SupportContext {
        SupportContext {
            session_id: "cs_1".into(),
            offer_id: "demo-offer".into(),
            customer_email: Some(" Buyer@Example.com ".into()),
            amount_total: Some(9900),
            provider: "stripe".into(),
            provider_mode: Some("live".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_people_id_is_sha256_of_normalized_email() {
        assert_eq!(
            people_id(" Buyer@Example.com").unwrap(),
            hex::encode(Sha256::digest(b"buyer@example.com"))
        );
        assert!(people_id("").is_none());
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("abc"), "***");
        assert_eq!(mask("website-1234-5678"), "webs...5678");
    }

    #[tokio::test]
    async fn test_sync_runs_every_stage_then_marks_session() {
        let (client, ledger, calls) = setup(false).await;
        let result = client.sync_purchase(&ctx()).await;
        let people = people_id("buyer@example.com").unwrap();
        assert_eq!(result, SupportSyncResult::Synced { people_id: people.clone() });
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["profile".to_string(), "data".to_string(), format!("event:{people}")]
        );

        let session = ledger.find_checkout_session_by_stripe_session_id("cs_1").await.unwrap().unwrap();
        assert!(session.metadata.get_str("crispSyncedAt").is_some());
        assert_eq!(session.metadata.get_str("crispPeopleId"), Some(people));

        let again = client.sync_purchase(&ctx()).await;
        assert!(matches!(
            again,
            SupportSyncResult::Skipped {
                reason: SupportSkip::AlreadySynced,
                ..
            }
        ));
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_reports_stage_without_marker() {
        let (client, ledger, calls) = setup(true).await;
        let result = client.sync_purchase(&ctx()).await;
        assert!(matches!(result, SupportSyncResult::Failed { stage: SyncStage::Data, .. }));
        assert_eq!(calls.lock().unwrap().len(), 2);

        let session = ledger.find_checkout_session_by_stripe_session_id("cs_1").await.unwrap().unwrap();
        assert!(session.metadata.get_str("crispSyncedAt").is_none());
    }

    #[tokio::test]
    async fn test_skip_reasons() {
        let (client, _, calls) = setup(false).await;

        let test_mode = SupportContext {
            provider_mode: Some("test".into()),
            ..ctx()
        };
        assert_eq!(client.sync_purchase(&test_mode).await.status(), "skipped");

        let no_email = SupportContext {
            customer_email: None,
            ..ctx()
        };
        assert!(matches!(
            client.sync_purchase(&no_email).await,
            SupportSyncResult::Skipped {
                reason: SupportSkip::MissingEmail,
                ..
            }
        ));

        let unconfigured = CrispClient::new(None, Arc::new(MemoryLedger::new()));
        assert!(matches!(
            unconfigured.sync_purchase(&ctx()).await,
            SupportSyncResult::Skipped {
                reason: SupportSkip::MissingConfig,
                ..
            }
        ));
        assert!(calls.lock().unwrap().is_empty());
    }
}
