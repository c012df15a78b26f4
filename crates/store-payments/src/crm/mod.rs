//! CRM Sync
//!
//! Mirrors completed purchases into the CRM: contact upsert with purchase
//! history custom fields, an optional pipeline opportunity, and workflow
//! enrollment. The caller stores `ghlSyncedAt` on the checkout session
//! after a successful sync so replays skip this module entirely.

pub mod client;
pub mod contacts;
pub mod history;
mod sync;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

pub use client::GhlClient;
pub use sync::sync_with_retry;

use crate::env;
use crate::error::{PaymentError, Result};
use crate::metadata::MetadataBag;
use crate::offer::GhlOfferConfig;

const DEFAULT_BASE_URL: &str = "https://services.leadconnectorhq.com";
const DEFAULT_API_VERSION: &str = "2021-07-28";

/// Statuses the CRM API may answer transiently
pub const RETRYABLE_STATUS_CODES: [u16; 8] = [408, 409, 425, 429, 500, 502, 503, 504];

/// Whole-sync retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for SyncRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl SyncRetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env::parse::<u32>("GHL_SYNC_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            initial_delay: env::parse::<u64>("GHL_SYNC_RETRY_DELAY_MS")
                .map_or(defaults.initial_delay, Duration::from_millis),
        }
    }
}

/// CRM client configuration
#[derive(Clone, Debug)]
pub struct GhlConfig {
    pub base_url: String,
    pub location_id: Option<String>,
    pub token: Option<String>,
    pub api_version: String,
    pub request_timeout: Duration,

    /// Attempts per HTTP request on retryable statuses
    pub request_attempts: u32,
    pub request_base_delay: Duration,

    /// Explicit id or `contact.*` key of the purchase metadata field
    pub purchase_metadata_field: Option<String>,

    /// Explicit id or `contact.*` key of the license keys field
    pub license_keys_field: Option<String>,
    pub affiliate_field_id: Option<String>,
    pub retry: SyncRetryPolicy,
}

impl Default for GhlConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            location_id: None,
            token: None,
            api_version: DEFAULT_API_VERSION.into(),
            request_timeout: Duration::from_secs(10),
            request_attempts: 3,
            request_base_delay: Duration::from_millis(250),
            purchase_metadata_field: None,
            license_keys_field: None,
            affiliate_field_id: None,
            retry: SyncRetryPolicy::default(),
        }
    }
}

impl GhlConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("GHL_API_BASE_URL")
                .map_or_else(|| DEFAULT_BASE_URL.into(), |u| u.trim_end_matches('/').to_string()),
            location_id: env::var("GHL_LOCATION_ID"),
            token: env::first_var(&["GHL_PAT_LOCATION", "GHL_API_TOKEN"]),
            api_version: env::var("GHL_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.into()),
            purchase_metadata_field: env::var("GHL_CUSTOM_FIELD_PURCHASE_METADATA"),
            license_keys_field: env::var("GHL_CUSTOM_FIELD_LICENSE_KEYS_V2"),
            affiliate_field_id: env::var("GHL_AFFILIATE_FIELD_ID"),
            retry: SyncRetryPolicy::from_env(),
            ..Default::default()
        }
    }

    pub const fn is_configured(&self) -> bool {
        self.token.is_some() && self.location_id.is_some()
    }
}

/// Purchase facts handed to the CRM
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncContext {
    pub offer_id: String,
    pub offer_name: String,
    pub customer_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lander_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serply_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_action: Option<String>,
    pub license_entitlements: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_tier: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub license_features: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tos_accepted: Option<bool>,
    #[serde(skip)]
    pub metadata: MetadataBag,
}

impl SyncContext {
    /// Flat key/value view used for custom fields and name templates.
    pub fn template_values(&self) -> Map<String, Value> {
        let mut values = match serde_json::to_value(self) {
            Ok(Value::Object(values)) => values,
            _ => Map::new(),
        };
        for (key, value) in self.metadata.iter() {
            values.insert(key.to_string(), value.clone());
        }

        let (first_name, last_name) = contacts::split_name(self.customer_name.as_deref());
        if let Some(first_name) = first_name {
            values.insert("firstName".into(), first_name.into());
        }
        if let Some(last_name) = last_name {
            values.insert("lastName".into(), last_name.into());
        }
        if let Some(cents) = self.amount_total {
            #[allow(clippy::cast_precision_loss)]
            let amount = cents as f64 / 100.0;
            values.insert("amountDecimal".into(), Value::from(amount));
        }
        values
    }
}

/// What a successful sync touched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub contact_id: String,
    pub opportunity_created: bool,
}

/// CRM seam used by the orchestrator
///
/// `Ok(None)` means the sync was skipped (no offer config, no credentials,
/// no email, or no contact id returned).
#[async_trait]
pub trait CrmSync: Send + Sync {
    async fn sync_order(&self, offer: Option<&GhlOfferConfig>, context: &SyncContext) -> Result<Option<SyncOutcome>>;
}

/// Whether a failed sync is worth another attempt
pub fn is_retryable(error: &PaymentError) -> bool {
    match error {
        PaymentError::Http { status, .. } => RETRYABLE_STATUS_CODES.contains(status),
        PaymentError::Timeout(_) | PaymentError::Network(_) => true,
        _ => false,
    }
}
