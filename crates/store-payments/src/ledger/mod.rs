//! Checkout/Order Ledger
//!
//! Durable record of checkout sessions, orders and inbound webhook
//! deliveries. Every write is an insert-or-merge keyed by a provider
//! identifier, so concurrent deliveries for the same payment converge
//! without in-process locking.

mod memory;
mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::metadata::MetadataBag;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Default age after which a pending session counts as abandoned
pub const DEFAULT_STALE_SESSION_HOURS: i64 = 24;

/// Upper bound for `find_recent_orders_by_email`
pub const MAX_RECENT_ORDERS: u32 = 200;

/// Checkout session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Completed,
    Failed,
    Abandoned,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Resolve the stored status after an incoming write.
    ///
    /// `completed` is terminal: replays and late failure notices never move
    /// a paid session backwards. Every other state takes the incoming value.
    #[must_use]
    pub const fn advance(self, incoming: Self) -> Self {
        match self {
            Self::Completed => Self::Completed,
            _ => incoming,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(PaymentError::Storage(format!("unknown session status: {other}"))),
        }
    }
}

/// Payment provider that produced a ledger row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentSource {
    Stripe,
    Paypal,
}

impl PaymentSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paypal => "paypal",
        }
    }
}

impl fmt::Display for PaymentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentSource {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::Paypal),
            other => Err(PaymentError::Storage(format!("unknown payment source: {other}"))),
        }
    }
}

/// A provider checkout attempt
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,

    /// Provider session id (unique)
    pub stripe_session_id: String,

    /// Provider payment-intent id (unique when present)
    pub stripe_payment_intent_id: Option<String>,

    pub stripe_subscription_id: Option<String>,

    pub offer_id: Option<String>,

    pub lander_id: Option<String>,

    pub customer_email: Option<String>,

    pub metadata: MetadataBag,

    pub status: SessionStatus,

    pub source: PaymentSource,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Insert-or-merge payload for a checkout session
#[derive(Clone, Debug)]
pub struct CheckoutSessionUpsert {
    pub stripe_session_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub offer_id: Option<String>,
    pub lander_id: Option<String>,
    pub customer_email: Option<String>,
    pub metadata: MetadataBag,
    pub status: SessionStatus,
    pub source: PaymentSource,
}

impl CheckoutSessionUpsert {
    pub fn new(stripe_session_id: impl Into<String>, status: SessionStatus, source: PaymentSource) -> Self {
        Self {
            stripe_session_id: stripe_session_id.into(),
            stripe_payment_intent_id: None,
            stripe_subscription_id: None,
            offer_id: None,
            lander_id: None,
            customer_email: None,
            metadata: MetadataBag::new(),
            status,
            source,
        }
    }
}

/// Optional fields carried by a status change
#[derive(Clone, Debug, Default)]
pub struct SessionStatusUpdate {
    pub payment_intent_id: Option<String>,
    pub customer_email: Option<String>,
    pub metadata: MetadataBag,
}

/// A financial fact derived from a payment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub checkout_session_id: Option<String>,
    pub stripe_session_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_charge_id: Option<String>,

    /// Amount in minor units
    pub amount_total: Option<i64>,

    /// Lowercase ISO currency
    pub currency: Option<String>,

    pub offer_id: Option<String>,
    pub lander_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub metadata: MetadataBag,
    pub payment_status: Option<String>,
    pub payment_method: Option<String>,
    pub source: PaymentSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert-or-merge payload for an order
#[derive(Clone, Debug)]
pub struct OrderUpsert {
    pub checkout_session_id: Option<String>,
    pub stripe_session_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub offer_id: Option<String>,
    pub lander_id: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub metadata: MetadataBag,
    pub payment_status: Option<String>,
    pub payment_method: Option<String>,
    pub source: PaymentSource,
}

impl OrderUpsert {
    pub fn new(source: PaymentSource) -> Self {
        Self {
            checkout_session_id: None,
            stripe_session_id: None,
            stripe_payment_intent_id: None,
            stripe_charge_id: None,
            amount_total: None,
            currency: None,
            offer_id: None,
            lander_id: None,
            customer_email: None,
            customer_name: None,
            metadata: MetadataBag::new(),
            payment_status: None,
            payment_method: None,
            source,
        }
    }
}

/// Metadata patch for an existing order
#[derive(Clone, Debug, Default)]
pub struct OrderMetadataUpdate {
    pub payment_intent_id: Option<String>,
    pub stripe_session_id: Option<String>,
    pub metadata: MetadataBag,
}

/// Webhook processing state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Success,
    Error,
}

impl WebhookStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Attempt counter increment for a write with this status
    pub const fn attempt_increment(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Success | Self::Error => 1,
        }
    }
}

impl FromStr for WebhookStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(PaymentError::Storage(format!("unknown webhook status: {other}"))),
        }
    }
}

/// Audit record per inbound webhook event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub event_id: String,
    pub event_type: String,
    pub payment_intent_id: Option<String>,
    pub status: WebhookStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub metadata: MetadataBag,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write to the webhook log
#[derive(Clone, Debug)]
pub struct WebhookLogUpdate {
    pub event_id: String,
    pub event_type: String,
    pub payment_intent_id: Option<String>,
    pub status: WebhookStatus,
    pub error: Option<String>,
    pub metadata: MetadataBag,
}

impl WebhookLogUpdate {
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>, status: WebhookStatus) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payment_intent_id: None,
            status,
            error: None,
            metadata: MetadataBag::new(),
        }
    }

    #[must_use]
    pub fn payment_intent(mut self, payment_intent_id: Option<String>) -> Self {
        self.payment_intent_id = payment_intent_id;
        self
    }

    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: MetadataBag) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Checkout session and order persistence
#[async_trait]
pub trait CheckoutLedger: Send + Sync {
    /// Create or merge a session keyed by provider session id. Returns the internal id.
    async fn upsert_checkout_session(&self, input: CheckoutSessionUpsert) -> Result<String>;

    /// Change status with the same merge semantics as the upsert.
    /// Returns `false` when no session exists for the id.
    async fn update_checkout_session_status(
        &self,
        stripe_session_id: &str,
        status: SessionStatus,
        update: SessionStatusUpdate,
    ) -> Result<bool>;

    async fn find_checkout_session_by_stripe_session_id(
        &self,
        stripe_session_id: &str,
    ) -> Result<Option<CheckoutSession>>;

    async fn find_checkout_session_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<CheckoutSession>>;

    async fn find_checkout_session_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<CheckoutSession>>;

    /// Create or merge an order. Keyed by payment-intent id, falling back to
    /// (provider session id, source) when no payment intent is known.
    async fn upsert_order(&self, input: OrderUpsert) -> Result<String>;

    /// Merge metadata into the order for a payment intent, else for a session id.
    async fn update_order_metadata(&self, update: OrderMetadataUpdate) -> Result<bool>;

    async fn find_order_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Option<Order>>;

    /// Newest first; `limit` is clamped to `1..=200`.
    async fn find_recent_orders_by_email(&self, email: &str, limit: u32) -> Result<Vec<Order>>;

    async fn find_refunded_orders(&self) -> Result<Vec<Order>>;

    /// Move sessions pending for longer than `older_than` to `abandoned`.
    async fn mark_stale_checkout_sessions(&self, older_than: Duration) -> Result<u64>;
}

/// Inbound webhook audit log
#[async_trait]
pub trait WebhookLogStore: Send + Sync {
    async fn find_webhook_log(&self, event_id: &str) -> Result<Option<WebhookLogEntry>>;

    /// Upsert keyed by event id; returns the stored entry.
    async fn record_webhook_event(&self, update: WebhookLogUpdate) -> Result<WebhookLogEntry>;

    async fn count_errored_webhook_logs_since(&self, hours: i64) -> Result<u64>;

    async fn count_pending_webhook_logs_older_than(&self, minutes: i64) -> Result<u64>;
}

pub(crate) fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_RECENT_ORDERS)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod contract;
