//! PayPal Webhook Handling
//!
//! Deliveries are verified through PayPal's verify-webhook-signature API,
//! then completed captures and orders are normalized into the same
//! fulfillment path Stripe checkouts use.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::error::{PaymentError, Result};
use crate::fulfillment::urls::normalize_store_product_url;
use crate::fulfillment::{EventReport, Fulfillment, NormalizedOrder, OrderUrls};
use crate::ledger::{OrderUpsert, PaymentSource, SessionStatus, SessionStatusUpdate, WebhookLogStore};
use crate::maintenance::{MaintenanceConfig, spawn_stale_sweep};
use crate::metadata::MetadataBag;
use crate::offer::OfferConfig;
use crate::providers::paypal::{VerificationStatus, WebhookTransmission};
use crate::providers::{PayPalAccount, PayPalApi, PayPalClient};
use crate::resolve::{ResolverChain, first_non_empty};
use crate::webhook::log::{DeliveryLog, DispatchOutcome};

/// Header names of a PayPal delivery
pub const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-transmission-id",
    "paypal-transmission-time",
    "paypal-cert-url",
    "paypal-auth-algo",
    "paypal-transmission-sig",
];

impl WebhookTransmission {
    /// Build from a header lookup. Missing headers are empty strings.
    pub fn from_headers<'a>(header: impl Fn(&str) -> Option<&'a str>) -> Self {
        let get = |name: &str| header(name).unwrap_or_default().trim().to_string();
        Self {
            transmission_id: get(TRANSMISSION_HEADERS[0]),
            transmission_time: get(TRANSMISSION_HEADERS[1]),
            cert_url: get(TRANSMISSION_HEADERS[2]),
            auth_algo: get(TRANSMISSION_HEADERS[3]),
            transmission_sig: get(TRANSMISSION_HEADERS[4]),
        }
    }

    pub fn is_complete(&self) -> bool {
        [
            &self.transmission_id,
            &self.transmission_time,
            &self.cert_url,
            &self.auth_algo,
            &self.transmission_sig,
        ]
        .iter()
        .all(|v| !v.is_empty())
    }
}

/// PayPal event envelope, kept as JSON for verification passthrough
#[derive(Clone, Debug)]
pub struct PayPalEvent {
    pub id: String,
    pub event_type: String,
    pub resource: Value,
    pub raw: Value,
}

impl PayPalEvent {
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(payload).map_err(|e| PaymentError::WebhookParse(e.to_string()))?;
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(ToString::to_string);
        let id = text("id").ok_or_else(|| PaymentError::WebhookParse("PayPal event without id".into()))?;
        let event_type = text("event_type").unwrap_or_default();
        Ok(Self {
            id,
            event_type,
            resource: raw.get("resource").cloned().unwrap_or(Value::Null),
            raw,
        })
    }

    fn is_completion(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.COMPLETED"
        )
    }
}

fn path<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().try_fold(value, |v, key| match key.parse::<usize>() {
        Ok(index) => v.get(index),
        Err(_) => v.get(*key),
    })
}

fn path_str(value: &Value, keys: &[&str]) -> Option<String> {
    path(value, keys)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn order_id_chain() -> ResolverChain<Value, String> {
    ResolverChain::new()
        .then("related_ids.order_id", |r| {
            path_str(r, &["supplementary_data", "related_ids", "order_id"])
        })
        .then("purchase_units.reference_id", |r| {
            path_str(r, &["purchase_units", "0", "reference_id"])
        })
        .then("resource.id", |r| path_str(r, &["id"]))
}

fn slug_chain() -> ResolverChain<Value, String> {
    ResolverChain::new()
        .then("custom_id", |r| path_str(r, &["custom_id"]))
        .then("purchase_units.custom_id", |r| path_str(r, &["purchase_units", "0", "custom_id"]))
        .then("purchase_units.reference_id", |r| {
            path_str(r, &["purchase_units", "0", "reference_id"])
        })
}

/// `(minor units, uppercase currency)` from the first amount found
fn amount(resource: &Value) -> Option<(i64, Option<String>)> {
    let candidates: [&[&str]; 3] = [
        &["purchase_units", "0", "amount"],
        &["amount"],
        &["seller_receivable_breakdown", "gross_amount"],
    ];
    candidates.iter().find_map(|keys| {
        let amount = path(resource, keys)?;
        let minor = match amount.get("value")? {
            Value::String(s) => minor_units(s)?,
            Value::Number(n) => minor_units(&n.to_string())?,
            _ => return None,
        };
        let currency = path_str(amount, &["currency_code"]).map(|c| c.to_uppercase());
        Some((minor, currency))
    })
}

/// Decimal string to minor units, rounding half up on the third decimal.
/// Signs, exponents and values that overflow `i64` are rejected.
fn minor_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !digits(whole) || !digits(fraction) {
        return None;
    }

    let whole = if whole.is_empty() { 0 } else { whole.parse::<i64>().ok()? };
    let mut decimals = fraction.bytes().map(|b| i64::from(b - b'0'));
    let tens = decimals.next().unwrap_or(0);
    let ones = decimals.next().unwrap_or(0);
    let round_up = i64::from(decimals.next().unwrap_or(0) >= 5);

    whole.checked_mul(100)?.checked_add(tens * 10 + ones + round_up)
}

fn payer_email(source: &Value) -> Option<String> {
    path_str(source, &["payer", "email_address"]).or_else(|| path_str(source, &["payer", "payer_info", "email"]))
}

fn payer_name(source: &Value) -> Option<String> {
    let given = path_str(source, &["payer", "name", "given_name"]);
    let surname = path_str(source, &["payer", "name", "surname"]);
    let name = [given, surname].into_iter().flatten().collect::<Vec<_>>().join(" ");
    (!name.is_empty()).then_some(name)
}

fn urls_from_metadata(metadata: &MetadataBag) -> OrderUrls {
    let product_page_url = normalize_store_product_url(metadata.get_str("product_page_url"));
    OrderUrls {
        store_product_page_url: normalize_store_product_url(metadata.get_str("store_serp_co_product_page_url"))
            .or_else(|| product_page_url.clone()),
        apps_product_page_url: metadata
            .get_str("apps_serp_co_product_page_url")
            .or_else(|| product_page_url.clone()),
        purchase_url: metadata.get_str("purchase_url"),
        serply_link: metadata.get_str("serply_link"),
        success_url: metadata.get_str("success_url"),
        cancel_url: metadata.get_str("cancel_url"),
        product_page_url,
    }
}

/// Turn a completed PayPal capture or order into a fulfillment order.
///
/// `order_details` is the `GET /v2/checkout/orders/{id}` body, used when the
/// event resource does not carry the slug or payer.
pub fn normalize_paypal_event(
    event: &PayPalEvent,
    account: &PayPalAccount,
    offer: Option<&OfferConfig>,
    slug: &str,
    order_details: Option<&Value>,
) -> NormalizedOrder {
    let resource = &event.resource;
    let order_id = order_id_chain().resolve(resource);
    let capture_id = if event.event_type == "PAYMENT.CAPTURE.COMPLETED" {
        path_str(resource, &["id"])
    } else {
        path_str(resource, &["purchase_units", "0", "payments", "captures", "0", "id"])
    };

    let mut metadata: MetadataBag = offer
        .map(|o| {
            o.metadata
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect()
        })
        .unwrap_or_default();
    metadata.insert("paypal_event_id", event.id.clone());
    metadata.insert("paypal_event_type", event.event_type.clone());
    metadata.insert_opt("paypal_order_id", order_id.clone());
    metadata.insert_opt("paypal_capture_id", capture_id.clone());

    let (amount_total, currency) = amount(resource)
        .or_else(|| order_details.and_then(amount))
        .map_or((None, None), |(minor, currency)| (Some(minor), currency));

    let mut order = NormalizedOrder::new(
        PaymentSource::Paypal,
        order_id.clone().unwrap_or_else(|| event.id.clone()),
        slug,
    );
    order.provider_account_alias = account.alias.clone();
    order.provider_mode = Some(account.mode.as_str().to_string());
    order.event_id = Some(event.id.clone());
    order.provider_session_id = order_id;
    order.provider_payment_id = capture_id.clone();
    order.charge_id = capture_id;
    order.product_slug = Some(slug.to_string());
    order.product_name = offer.and_then(|o| o.product_name.clone());
    order.customer_email = payer_email(resource).or_else(|| order_details.and_then(payer_email));
    order.customer_name = payer_name(resource).or_else(|| order_details.and_then(payer_name));
    order.amount_total = amount_total;
    order.currency = currency;
    order.payment_status = first_non_empty([resource.get("status").and_then(Value::as_str)]).map(|s| s.to_lowercase());
    order.payment_method = Some("paypal".into());
    order.urls = Some(urls_from_metadata(&metadata));
    order.metadata = metadata;
    order
}

/// Verifies and processes PayPal deliveries
pub struct PayPalWebhookHandler {
    api: Arc<dyn PayPalApi>,
    account: PayPalAccount,

    /// Unset when no webhook id is configured
    verify: bool,
    fulfillment: Fulfillment,
    log: Arc<dyn WebhookLogStore>,
    maintenance: MaintenanceConfig,
}

impl PayPalWebhookHandler {
    pub fn new(
        api: Arc<dyn PayPalApi>,
        account: PayPalAccount,
        fulfillment: Fulfillment,
        log: Arc<dyn WebhookLogStore>,
    ) -> Self {
        Self {
            api,
            account,
            verify: true,
            fulfillment,
            log,
            maintenance: MaintenanceConfig::default(),
        }
    }

    /// Verification is skipped when the client has no webhook id.
    pub fn from_client(client: Arc<PayPalClient>, fulfillment: Fulfillment, log: Arc<dyn WebhookLogStore>) -> Self {
        let account = client.default_account();
        let verify = client.webhook_id(&account).is_some();
        if !verify {
            tracing::warn!(mode = %account.mode, "paypal.webhook_verification_disabled");
        }
        Self {
            verify,
            ..Self::new(client, account, fulfillment, log)
        }
    }

    #[must_use]
    pub const fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub async fn handle(&self, transmission: &WebhookTransmission, payload: &str) -> Result<DispatchOutcome> {
        let event = PayPalEvent::parse(payload)?;

        if self.verify {
            if !transmission.is_complete() {
                return Err(PaymentError::InvalidSignature("missing PayPal transmission headers".into()));
            }
            let status = self
                .api
                .verify_webhook_signature(transmission, &event.raw, &self.account)
                .await?;
            if status == VerificationStatus::Failure {
                tracing::error!(event_id = %event.id, "paypal.webhook_signature_invalid");
                return Err(PaymentError::InvalidSignature("PayPal verification failed".into()));
            }
        }

        tracing::info!(event_id = %event.id, event_type = %event.event_type, "paypal.webhook_received");

        let log = DeliveryLog::new(self.log.as_ref(), &event.id, &event.event_type);
        if log.is_processed().await {
            tracing::info!(event_id = %event.id, "webhook.duplicate_event");
            return Ok(DispatchOutcome::Duplicate);
        }
        log.pending(None).await;

        let result = match event.event_type.as_str() {
            _ if event.is_completion() => self.order_completed(&event).await,
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => {
                self.capture_reversed(&event).await
            }
            _ => {
                tracing::debug!(event_type = %event.event_type, "paypal.webhook_unhandled");
                Ok(EventReport::ignored("unhandled_event_type"))
            }
        };
        spawn_stale_sweep(self.fulfillment.ledger.clone(), self.maintenance.stale_after());

        match result {
            Ok(report) => Ok(log.complete(report, None, self.fulfillment.notifier.as_ref()).await),
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "paypal.webhook.order_processing_failed");
                log.failed(None, &e).await;
                Err(e)
            }
        }
    }

    async fn order_completed(&self, event: &PayPalEvent) -> Result<EventReport> {
        let resource = &event.resource;
        let order_id = order_id_chain().resolve(resource);

        let mut details = None;
        let mut slug = slug_chain().resolve(resource);
        let needs_details = slug.is_none() || payer_email(resource).is_none();
        if let (true, Some(order_id)) = (needs_details, &order_id) {
            match self.api.get_order(order_id, &self.account).await {
                Ok(order) => details = Some(order),
                Err(e) => tracing::warn!(order_id = %order_id, error = %e, "paypal.get_order_failed"),
            }
        }
        if slug.is_none() {
            slug = details.as_ref().and_then(|d| slug_chain().resolve(d));
        }

        let Some(slug) = slug else {
            tracing::error!(event_id = %event.id, order_id = ?order_id, "paypal.webhook.missing_slug");
            return Ok(EventReport::ignored("missing_slug"));
        };

        let offer = self.fulfillment.offers.get(&slug);
        let order = normalize_paypal_event(event, &self.account, offer.as_ref(), &slug, details.as_ref());
        let session_id = order.session_id.clone();
        let summary = self.fulfillment.process_fulfilled_order(order).await?;

        tracing::info!(
            event_id = %event.id,
            order_id = %session_id,
            offer_id = %slug,
            crm = summary.crm.as_str(),
            "paypal.webhook.order_processed"
        );

        Ok(EventReport {
            handled: true,
            payment_intent_id: None,
            outcome: summary.outcome().with("offerId", slug),
            crm_error: summary.crm.error().map(ToString::to_string),
        })
    }

    async fn capture_reversed(&self, event: &PayPalEvent) -> Result<EventReport> {
        let Some(order_id) = order_id_chain().resolve(&event.resource) else {
            return Ok(EventReport::ignored("missing_order_id"));
        };
        let ledger = &self.fulfillment.ledger;
        let denied = event.event_type == "PAYMENT.CAPTURE.DENIED";

        let marker = if denied {
            MetadataBag::new().with("paypalCaptureDeniedAt", Utc::now().to_rfc3339())
        } else {
            MetadataBag::new().with("refundedAt", Utc::now().to_rfc3339())
        };

        let session_found = ledger
            .update_checkout_session_status(
                &order_id,
                SessionStatus::Failed,
                SessionStatusUpdate {
                    metadata: marker.clone(),
                    ..Default::default()
                },
            )
            .await?;

        if !denied {
            let mut refund = OrderUpsert::new(PaymentSource::Paypal);
            refund.stripe_session_id = Some(order_id.clone());
            refund.payment_status = Some("refunded".into());
            refund.metadata = marker;
            ledger.upsert_order(refund).await?;
        }

        Ok(EventReport {
            handled: true,
            payment_intent_id: None,
            outcome: MetadataBag::new()
                .with("outcome", if denied { "denied" } else { "refunded" })
                .with("orderId", order_id)
                .with("sessionFound", session_found),
            crm_error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::fulfillment::fakes::Harness;
    use crate::ledger::CheckoutLedger;
    use crate::providers::PayPalMode;

    struct FakePayPal {
        verification: VerificationStatus,
        order: Option<Value>,
        order_lookups: Mutex<Vec<String>>,
    }

    impl FakePayPal {
        fn new(verification: VerificationStatus) -> Self {
            Self {
                verification,
                order: None,
                order_lookups: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PayPalApi for FakePayPal {
        async fn get_order(&self, order_id: &str, _account: &PayPalAccount) -> Result<Value> {
            self.order_lookups.lock().unwrap().push(order_id.to_string());
            self.order
                .clone()
                .ok_or_else(|| PaymentError::NotFound(order_id.to_string()))
        }

        async fn verify_webhook_signature(
            &self,
            _transmission: &WebhookTransmission,
            _event: &Value,
            _account: &PayPalAccount,
        ) -> Result<VerificationStatus> {
            Ok(self.verification)
        }
    }

    fn transmission() -> WebhookTransmission {
        WebhookTransmission {
            transmission_id: "tx-1".into(),
            transmission_time: "2024-01-01T00:00:00Z".into(),
            cert_url: "https://api.paypal.com/cert".into(),
            auth_algo: "SHA256withRSA".into(),
            transmission_sig: "sig".into(),
        }
    }

    fn capture_completed() -> String {
        json!({
            "id": "WH-1",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAPTURE-1",
                "status": "COMPLETED",
                "custom_id": "demo-offer",
                "amount": { "value": "49.99", "currency_code": "usd" },
                "payer": {
                    "email_address": "buyer@example.com",
                    "name": { "given_name": "Pat", "surname": "Buyer" }
                },
                "supplementary_data": { "related_ids": { "order_id": "ORDER-1" } }
            }
        })
        .to_string()
    }

    fn handler(harness: &Harness, api: FakePayPal) -> PayPalWebhookHandler {
        let mut offer = OfferConfig::new("demo-offer");
        offer.product_name = Some("Demo Offer".into());
        offer
            .metadata
            .insert("product_page_url".into(), "https://store.serp.co/product-details/product/demo".into());
        PayPalWebhookHandler::new(
            Arc::new(api),
            PayPalAccount::new(PayPalMode::Live),
            harness.fulfillment_with_offers([offer]),
            harness.ledger.clone(),
        )
    }

    #[test]
    fn test_normalize_capture() {
        let event = PayPalEvent::parse(&capture_completed()).unwrap();
        let account = PayPalAccount::new(PayPalMode::Test).alias("apps");
        let order = normalize_paypal_event(&event, &account, None, "demo-offer", None);

        assert_eq!(order.session_id, "ORDER-1");
        assert_eq!(order.provider_payment_id.as_deref(), Some("CAPTURE-1"));
        assert_eq!(order.amount_total, Some(4999));
        assert_eq!(order.currency.as_deref(), Some("USD"));
        assert_eq!(order.customer_email.as_deref(), Some("buyer@example.com"));
        assert_eq!(order.customer_name.as_deref(), Some("Pat Buyer"));
        assert_eq!(order.provider_mode.as_deref(), Some("test"));
        assert_eq!(order.provider_account_alias.as_deref(), Some("apps"));
        assert_eq!(order.metadata.get_str("paypal_order_id").as_deref(), Some("ORDER-1"));
        assert_eq!(order.metadata.get_str("paypal_capture_id").as_deref(), Some("CAPTURE-1"));
        assert!(order.payment_intent_id.is_none());
    }

    #[test]
    fn test_order_id_falls_back_to_reference_then_resource() {
        let by_reference = json!({ "id": "CAP", "purchase_units": [{ "reference_id": "REF-1" }] });
        assert_eq!(order_id_chain().resolve(&by_reference).as_deref(), Some("REF-1"));
        let bare = json!({ "id": "ORDER-9" });
        assert_eq!(order_id_chain().resolve(&bare).as_deref(), Some("ORDER-9"));
    }

    #[test]
    fn test_amount_from_breakdown() {
        let resource = json!({
            "seller_receivable_breakdown": { "gross_amount": { "value": "10.50", "currency_code": "eur" } }
        });
        assert_eq!(amount(&resource), Some((1050, Some("EUR".into()))));
    }

    #[test]
    fn test_minor_units_parse_decimals_exactly() {
        assert_eq!(minor_units("19.99"), Some(1999));
        assert_eq!(minor_units("19.999"), Some(2000));
        assert_eq!(minor_units("0.285"), Some(29));
        assert_eq!(minor_units(" 5 "), Some(500));
        assert_eq!(minor_units(".5"), Some(50));
        assert_eq!(minor_units("1.005"), Some(101));
    }

    #[test]
    fn test_minor_units_reject_garbage_and_overflow() {
        assert_eq!(minor_units(""), None);
        assert_eq!(minor_units("."), None);
        assert_eq!(minor_units("-1.00"), None);
        assert_eq!(minor_units("1e9"), None);
        assert_eq!(minor_units("NaN"), None);
        assert_eq!(minor_units("92233720368547758.08"), None);
        assert_eq!(minor_units("99999999999999999999"), None);

        let resource = json!({ "amount": { "value": "1e400", "currency_code": "USD" } });
        assert_eq!(amount(&resource), None);
        let resource = json!({ "amount": { "value": 12.5, "currency_code": "USD" } });
        assert_eq!(amount(&resource), Some((1250, Some("USD".into()))));
    }

    #[tokio::test]
    async fn test_capture_runs_fulfillment_once() {
        let harness = Harness::new();
        let handler = handler(&harness, FakePayPal::new(VerificationStatus::Success));

        let outcome = handler.handle(&transmission(), &capture_completed()).await.unwrap();
        assert_eq!(outcome.as_str(), "processed");
        let replay = handler.handle(&transmission(), &capture_completed()).await.unwrap();
        assert_eq!(replay.as_str(), "duplicate");

        let session = harness
            .ledger
            .find_checkout_session_by_stripe_session_id("ORDER-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.source, PaymentSource::Paypal);
        assert_eq!(harness.ledger.order_count(), 1);
        assert_eq!(harness.license.requests().len(), 1);
        assert_eq!(harness.entitlements.grants()[0].entitlements, vec!["demo-offer"]);

        let support = harness.support.calls();
        assert_eq!(
            support[0].urls.product_page_url.as_deref(),
            Some("https://apps.serp.co/demo")
        );
    }

    #[tokio::test]
    async fn test_failed_verification_is_rejected() {
        let harness = Harness::new();
        let handler = handler(&harness, FakePayPal::new(VerificationStatus::Failure));

        let err = handler.handle(&transmission(), &capture_completed()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let missing = handler
            .handle(&WebhookTransmission::default(), &capture_completed())
            .await
            .unwrap_err();
        assert_eq!(missing.status_code(), 400);
        assert_eq!(harness.ledger.order_count(), 0);
    }

    #[tokio::test]
    async fn test_slug_comes_from_order_details() {
        let harness = Harness::new();
        let mut api = FakePayPal::new(VerificationStatus::Success);
        api.order = Some(json!({
            "id": "ORDER-2",
            "purchase_units": [{ "reference_id": "demo-offer" }],
            "payer": { "email_address": "details@example.com" }
        }));
        let handler = handler(&harness, api);
        let payload = json!({
            "id": "WH-2",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAPTURE-2",
                "amount": { "value": "5.00", "currency_code": "USD" },
                "supplementary_data": { "related_ids": { "order_id": "ORDER-2" } }
            }
        })
        .to_string();

        handler.handle(&transmission(), &payload).await.unwrap();

        let session = harness
            .ledger
            .find_checkout_session_by_stripe_session_id("ORDER-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.offer_id.as_deref(), Some("demo-offer"));
        assert_eq!(session.customer_email.as_deref(), Some("details@example.com"));
    }

    #[tokio::test]
    async fn test_missing_slug_is_acknowledged() {
        let harness = Harness::new();
        let handler = handler(&harness, FakePayPal::new(VerificationStatus::Success));
        let payload = json!({
            "id": "WH-3",
            "event_type": "CHECKOUT.ORDER.COMPLETED",
            "resource": { "id": "ORDER-3" }
        })
        .to_string();

        let outcome = handler.handle(&transmission(), &payload).await.unwrap();
        assert_eq!(outcome.as_str(), "ignored");
        assert_eq!(harness.ledger.order_count(), 0);
    }

    #[tokio::test]
    async fn test_refund_marks_order() {
        let harness = Harness::new();
        let handler = handler(&harness, FakePayPal::new(VerificationStatus::Success));
        handler.handle(&transmission(), &capture_completed()).await.unwrap();

        let refund = json!({
            "id": "WH-4",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {
                "id": "REFUND-1",
                "supplementary_data": { "related_ids": { "order_id": "ORDER-1" } }
            }
        })
        .to_string();
        let outcome = handler.handle(&transmission(), &refund).await.unwrap();
        assert_eq!(outcome.report().and_then(|r| r.outcome.get_str("outcome")).as_deref(), Some("refunded"));

        let refunded = harness.ledger.find_refunded_orders().await.unwrap();
        assert_eq!(refunded.len(), 1);
        assert_eq!(refunded[0].stripe_session_id.as_deref(), Some("ORDER-1"));

        let session = harness
            .ledger
            .find_checkout_session_by_stripe_session_id("ORDER-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }
}
