//! Stripe Event Envelope
//!
//! Only the fields the fulfillment path reads are modelled. Unknown fields
//! are ignored so API version bumps do not break parsing.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{PaymentError, Result};
use crate::metadata::MetadataBag;

/// Stripe event envelope `{id, type, created, livemode, data: {object}}`
#[derive(Clone, Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub created: i64,

    #[serde(default)]
    pub livemode: bool,

    pub data: EventData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// Event types with a dedicated handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    CheckoutSessionAsyncPaymentSucceeded,
    PaymentIntentSucceeded,
    PaymentIntentPaymentFailed,
    PaymentIntentCanceled,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    ChargeRefunded,
    ChargeDisputeCreated,
    ChargeDisputeClosed,
    CustomerSubscriptionDeleted,
    Unhandled,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "checkout.session.async_payment_succeeded" => Self::CheckoutSessionAsyncPaymentSucceeded,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentPaymentFailed,
            "payment_intent.canceled" => Self::PaymentIntentCanceled,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "charge.refunded" => Self::ChargeRefunded,
            "charge.dispute.created" => Self::ChargeDisputeCreated,
            "charge.dispute.closed" => Self::ChargeDisputeClosed,
            "customer.subscription.deleted" => Self::CustomerSubscriptionDeleted,
            _ => Self::Unhandled,
        }
    }
}

impl StripeEvent {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| PaymentError::WebhookParse(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Deserialize `data.object` into a typed object.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            PaymentError::WebhookParse(format!("{} object: {e}", self.event_type))
        })
    }

    /// Payment intent referenced by the event object, when there is one.
    pub fn payment_intent_id(&self) -> Option<String> {
        let object = &self.data.object;
        match self.kind() {
            EventKind::PaymentIntentSucceeded
            | EventKind::PaymentIntentPaymentFailed
            | EventKind::PaymentIntentCanceled => object.get("id").and_then(Value::as_str).map(String::from),
            _ => object.get("payment_intent").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("id").and_then(Value::as_str).map(String::from),
                _ => None,
            }),
        }
    }
}

/// A reference that Stripe returns either as an id or as the expanded object
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object(ExpandedObject),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExpandedObject {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(object) => &object.id,
        }
    }

    /// Display name of an expanded object
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Object(object) => object.name.as_deref().map(str::trim).filter(|n| !n.is_empty()),
        }
    }
}

fn expandable_id(value: Option<&Expandable>) -> Option<String> {
    value.map(|v| v.id().to_string())
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Consent {
    pub terms_of_service: Option<String>,
}

/// `checkout.session` object
#[derive(Clone, Debug, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
    #[serde(default)]
    pub metadata: MetadataBag,
    #[serde(default)]
    pub consent: Option<Consent>,
    #[serde(default)]
    pub consent_collection: Option<Consent>,
    #[serde(default)]
    pub livemode: bool,
}

impl CheckoutSessionObject {
    pub fn payment_intent_id(&self) -> Option<String> {
        expandable_id(self.payment_intent.as_ref())
    }

    pub fn subscription_id(&self) -> Option<String> {
        expandable_id(self.subscription.as_ref())
    }

    /// `customer_details.email`, then `customer_email`
    pub fn email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| self.customer_email.clone())
            .filter(|e| !e.trim().is_empty())
    }

    pub fn customer_name(&self) -> Option<String> {
        self.customer_details.as_ref().and_then(|d| d.name.clone())
    }

    pub fn customer_phone(&self) -> Option<String> {
        self.customer_details.as_ref().and_then(|d| d.phone.clone())
    }

    /// Paid sessions, including sessions that needed no payment
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid" | "no_payment_required")
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LastPaymentError {
    pub message: Option<String>,
    pub code: Option<String>,
    pub decline_code: Option<String>,
}

/// `payment_intent` object
#[derive(Clone, Debug, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub amount_received: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub receipt_email: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub invoice: Option<Expandable>,
    #[serde(default)]
    pub latest_charge: Option<Expandable>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
    #[serde(default)]
    pub metadata: MetadataBag,
    #[serde(default)]
    pub livemode: bool,
}

impl PaymentIntentObject {
    pub fn charge_id(&self) -> Option<String> {
        expandable_id(self.latest_charge.as_ref())
    }

    pub fn customer_id(&self) -> Option<String> {
        expandable_id(self.customer.as_ref())
    }

    pub fn invoice_id(&self) -> Option<String> {
        expandable_id(self.invoice.as_ref())
    }

    pub fn failure_message(&self) -> Option<String> {
        self.last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .filter(|m| !m.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvoicePrice {
    pub id: Option<String>,
    #[serde(default)]
    pub product: Option<Expandable>,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<InvoicePrice>,
    #[serde(default)]
    pub metadata: MetadataBag,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

/// `invoice` object
#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub metadata: MetadataBag,
    #[serde(default)]
    pub lines: InvoiceLines,
    #[serde(default)]
    pub livemode: bool,
}

impl InvoiceObject {
    pub fn subscription_id(&self) -> Option<String> {
        expandable_id(self.subscription.as_ref())
    }

    pub fn payment_intent_id(&self) -> Option<String> {
        expandable_id(self.payment_intent.as_ref())
    }

    pub fn first_line(&self) -> Option<&InvoiceLine> {
        self.lines.data.first()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BillingDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// `charge` object
#[derive(Clone, Debug, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub amount_refunded: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub receipt_email: Option<String>,
    #[serde(default)]
    pub billing_details: Option<BillingDetails>,
    #[serde(default)]
    pub metadata: MetadataBag,
    #[serde(default)]
    pub livemode: bool,
}

impl ChargeObject {
    pub fn payment_intent_id(&self) -> Option<String> {
        expandable_id(self.payment_intent.as_ref())
    }

    pub fn email(&self) -> Option<String> {
        self.billing_details
            .as_ref()
            .and_then(|b| b.email.clone())
            .or_else(|| self.receipt_email.clone())
    }
}

/// `dispute` object
#[derive(Clone, Debug, Deserialize)]
pub struct DisputeObject {
    pub id: String,
    #[serde(default)]
    pub charge: Option<Expandable>,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub livemode: bool,
}

impl DisputeObject {
    pub fn payment_intent_id(&self) -> Option<String> {
        expandable_id(self.payment_intent.as_ref())
    }

    pub fn charge_id(&self) -> Option<String> {
        expandable_id(self.charge.as_ref())
    }

    pub fn is_lost(&self) -> bool {
        self.status.as_deref() == Some("lost")
    }

    pub fn is_won(&self) -> bool {
        self.status.as_deref() == Some("won")
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CancellationDetails {
    pub reason: Option<String>,
    pub feedback: Option<String>,
}

/// `subscription` object
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub cancellation_details: Option<CancellationDetails>,
    #[serde(default)]
    pub metadata: MetadataBag,
    #[serde(default)]
    pub livemode: bool,
}

impl SubscriptionObject {
    pub fn customer_id(&self) -> Option<String> {
        expandable_id(self.customer.as_ref())
    }

    pub fn cancellation_reason(&self) -> Option<String> {
        self.cancellation_details.as_ref().and_then(|d| d.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_checkout_completed() {
        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "livemode": false,
            "data": { "object": {
                "id": "cs_test_1",
                "object": "checkout.session",
                "payment_intent": "pi_test_123",
                "subscription": { "id": "sub_1", "object": "subscription" },
                "customer_details": { "email": "buyer@example.com", "name": "Buyer" },
                "amount_total": 9900,
                "currency": "usd",
                "payment_status": "paid",
                "payment_method_types": ["card"],
                "metadata": { "offerId": "demo-offer", "landerId": null }
            }}
        })
        .to_string();

        let event = StripeEvent::parse(&payload).unwrap();
        assert_eq!(event.kind(), EventKind::CheckoutSessionCompleted);
        assert_eq!(event.payment_intent_id().as_deref(), Some("pi_test_123"));

        let session: CheckoutSessionObject = event.object().unwrap();
        assert_eq!(session.payment_intent_id().as_deref(), Some("pi_test_123"));
        assert_eq!(session.subscription_id().as_deref(), Some("sub_1"));
        assert_eq!(session.email().as_deref(), Some("buyer@example.com"));
        assert!(session.is_paid());
        assert!(!session.metadata.contains_key("landerId"));
    }

    #[test]
    fn test_payment_intent_event_uses_object_id() {
        let event = StripeEvent::parse(
            &json!({
                "id": "evt_2",
                "type": "payment_intent.payment_failed",
                "data": { "object": {
                    "id": "pi_test_9",
                    "last_payment_error": { "message": "card declined" },
                    "latest_charge": "ch_1"
                }}
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(event.payment_intent_id().as_deref(), Some("pi_test_9"));
        let intent: PaymentIntentObject = event.object().unwrap();
        assert_eq!(intent.failure_message().as_deref(), Some("card declined"));
        assert_eq!(intent.charge_id().as_deref(), Some("ch_1"));
    }

    #[test]
    fn test_expanded_product_name() {
        let line: InvoiceLine = serde_json::from_value(json!({
            "price": { "id": "price_1", "product": { "id": "prod_1", "name": " Pro Plan " } }
        }))
        .unwrap();
        let product = line.price.unwrap().product.unwrap();
        assert_eq!(product.id(), "prod_1");
        assert_eq!(product.name(), Some("Pro Plan"));
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        assert_eq!(EventKind::from_type("customer.created"), EventKind::Unhandled);
    }

    #[test]
    fn test_lifecycle_event_kinds() {
        assert_eq!(EventKind::from_type("charge.dispute.created"), EventKind::ChargeDisputeCreated);
        assert_eq!(EventKind::from_type("charge.dispute.closed"), EventKind::ChargeDisputeClosed);
        assert_eq!(
            EventKind::from_type("customer.subscription.deleted"),
            EventKind::CustomerSubscriptionDeleted
        );
        assert_eq!(EventKind::from_type("invoice.payment_failed"), EventKind::InvoicePaymentFailed);
    }

    #[test]
    fn test_dispute_references_expanded_charge() {
        let event = StripeEvent::parse(
            &json!({
                "id": "evt_dp",
                "type": "charge.dispute.created",
                "data": { "object": {
                    "id": "dp_1",
                    "charge": { "id": "ch_1" },
                    "payment_intent": "pi_1",
                    "status": "needs_response"
                }}
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(event.payment_intent_id().as_deref(), Some("pi_1"));
        let dispute: DisputeObject = event.object().unwrap();
        assert_eq!(dispute.charge_id().as_deref(), Some("ch_1"));
        assert!(!dispute.is_lost());
    }

    #[test]
    fn test_malformed_envelope_is_bad_request() {
        let err = StripeEvent::parse("{not json").unwrap_err();
        assert!(matches!(err, PaymentError::WebhookParse(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_malformed_object_is_parse_error() {
        let event = StripeEvent::parse(
            r#"{"id":"evt_3","type":"charge.refunded","data":{"object":{"amount":5}}}"#,
        )
        .unwrap();
        assert!(matches!(event.object::<ChargeObject>(), Err(PaymentError::WebhookParse(_))));
    }
}
