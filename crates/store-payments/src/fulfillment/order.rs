//! Provider-neutral fulfillment of a paid order.

use chrono::Utc;
use serde_json::{Map, Value, json};

use super::Fulfillment;
use super::urls::{OrderUrls, format_amount};
use crate::alerts::SaleNotice;
use crate::crm::{SyncContext, SyncOutcome, sync_with_retry};
use crate::entitlements::{EntitlementRequest, GrantContext, GrantOutcome, normalize_entitlements};
use crate::error::Result;
use crate::ledger::{
    CheckoutSessionUpsert, OrderMetadataUpdate, OrderUpsert, PaymentSource, SessionStatus, SessionStatusUpdate,
};
use crate::license::{LicenseRecord, LicenseRequest};
use crate::metadata::MetadataBag;
use crate::offer::OfferConfig;
use crate::support::{SupportContext, SupportSyncResult};

/// License settings carried by the order itself
#[derive(Clone, Debug, Default)]
pub struct LicenseOverrides {
    pub tier: Option<String>,
    pub entitlements: Vec<String>,
    pub features: Option<Map<String, Value>>,
}

impl LicenseOverrides {
    /// Read `licenseTier`, `licenseEntitlements` and `licenseFeatures`.
    pub fn from_metadata(metadata: &MetadataBag) -> Self {
        Self {
            tier: metadata.get_str("licenseTier"),
            entitlements: metadata.get("licenseEntitlements").map(parse_list).unwrap_or_default(),
            features: metadata.get("licenseFeatures").and_then(parse_object),
        }
    }
}

/// Resolved license tier, entitlements and features
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LicenseSettings {
    pub tier: Option<String>,
    pub entitlements: Vec<String>,
    pub features: Map<String, Value>,
}

impl LicenseSettings {
    /// Tier: order override, offer `licenseTier`, offer id. Entitlements:
    /// order overrides, offer `licenseEntitlements`, then the offer id.
    pub fn resolve(offer_id: &str, offer: Option<&OfferConfig>, overrides: &LicenseOverrides) -> Self {
        let tier = overrides
            .tier
            .clone()
            .or_else(|| offer.and_then(|o| o.meta("licenseTier")).map(ToString::to_string))
            .or_else(|| Some(offer_id.to_string()).filter(|id| !id.is_empty()));

        let mut entitlements = overrides.entitlements.clone();
        if let Some(raw) = offer.and_then(|o| o.meta("licenseEntitlements")) {
            entitlements.extend(parse_list(&Value::from(raw)));
        }
        entitlements.push(offer_id.to_string());

        let features = overrides
            .features
            .clone()
            .or_else(|| {
                offer
                    .and_then(|o| o.meta("licenseFeatures"))
                    .and_then(|raw| parse_object(&Value::from(raw)))
            })
            .unwrap_or_default();

        Self {
            tier,
            entitlements: normalize_entitlements(&entitlements),
            features,
        }
    }
}

/// JSON array, JSON array in a string, or a comma list.
fn parse_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(raw) if raw.trim_start().starts_with('[') => serde_json::from_str::<Value>(raw)
            .ok()
            .map(|parsed| parse_list(&parsed))
            .unwrap_or_default(),
        Value::String(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
        _ => Vec::new(),
    }
}

fn parse_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// A paid order in provider-neutral form
#[derive(Clone, Debug)]
pub struct NormalizedOrder {
    pub provider: PaymentSource,
    pub provider_account_alias: Option<String>,

    /// `live` or `test`
    pub provider_mode: Option<String>,

    /// Provider event that produced the order, used as the license event id
    pub event_id: Option<String>,

    /// Ledger session key
    pub session_id: String,
    pub provider_session_id: Option<String>,
    pub provider_payment_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub charge_id: Option<String>,
    pub offer_id: String,
    pub lander_id: Option<String>,
    pub product_slug: Option<String>,
    pub product_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub client_reference_id: Option<String>,
    pub metadata: MetadataBag,

    /// Minor units
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_status: Option<String>,
    pub payment_method: Option<String>,

    /// Resolved from metadata and the offer when absent
    pub urls: Option<OrderUrls>,
    pub license: LicenseOverrides,
    pub tos_accepted: Option<bool>,

    /// Record the order without license, entitlements or sync calls
    pub skip_side_effects: bool,
}

impl NormalizedOrder {
    pub fn new(provider: PaymentSource, session_id: impl Into<String>, offer_id: impl Into<String>) -> Self {
        Self {
            provider,
            provider_account_alias: None,
            provider_mode: None,
            event_id: None,
            session_id: session_id.into(),
            provider_session_id: None,
            provider_payment_id: None,
            payment_intent_id: None,
            subscription_id: None,
            charge_id: None,
            offer_id: offer_id.into(),
            lander_id: None,
            product_slug: None,
            product_name: None,
            customer_email: None,
            customer_name: None,
            customer_phone: None,
            client_reference_id: None,
            metadata: MetadataBag::new(),
            amount_total: None,
            currency: None,
            payment_status: None,
            payment_method: None,
            urls: None,
            license: LicenseOverrides::default(),
            tos_accepted: None,
            skip_side_effects: false,
        }
    }

    fn provider_session_id(&self) -> &str {
        self.provider_session_id.as_deref().unwrap_or(&self.session_id)
    }

    fn provider_payment_id(&self) -> Option<&str> {
        self.provider_payment_id
            .as_deref()
            .or(self.payment_intent_id.as_deref())
    }

    /// Major units
    #[allow(clippy::cast_precision_loss)]
    fn amount_major(&self) -> Option<f64> {
        self.amount_total.map(|cents| cents as f64 / 100.0)
    }
}

/// CRM leg of a fulfillment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrmStatus {
    Synced(SyncOutcome),
    Skipped(&'static str),
    Failed(String),
}

impl CrmStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Synced(_) => "synced",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "error",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// What `process_fulfilled_order` did
#[derive(Clone, Debug)]
pub struct FulfillmentSummary {
    pub checkout_session_id: String,
    pub license: Option<LicenseRecord>,
    pub license_settings: LicenseSettings,
    pub entitlements: Option<GrantOutcome>,
    pub crm: CrmStatus,
    pub support: Option<SupportSyncResult>,
}

impl FulfillmentSummary {
    /// Outcome fields for the webhook log
    pub fn outcome(&self) -> MetadataBag {
        let mut outcome = MetadataBag::new()
            .with("outcome", self.crm.as_str())
            .with("checkoutSessionId", self.checkout_session_id.clone());
        match &self.crm {
            CrmStatus::Synced(synced) => {
                outcome.insert("contactId", synced.contact_id.clone());
                outcome.insert("opportunityCreated", synced.opportunity_created);
            }
            CrmStatus::Skipped(reason) => outcome.insert("skipReason", *reason),
            CrmStatus::Failed(message) => outcome.insert("ghlSyncError", message.clone()),
        }
        outcome.insert_opt("entitlements", self.entitlements.as_ref().map(GrantOutcome::status));
        outcome.insert_opt("support", self.support.as_ref().map(SupportSyncResult::status));
        outcome.insert_opt(
            "licenseId",
            self.license.as_ref().and_then(|l| l.license_id.clone()),
        );
        outcome
    }
}

impl Fulfillment {
    /// Record a paid order and run every fulfillment side effect.
    ///
    /// Only ledger failures are returned as errors. License, entitlement,
    /// CRM and support failures are logged and reported in the summary.
    pub async fn process_fulfilled_order(&self, order: NormalizedOrder) -> Result<FulfillmentSummary> {
        let previous = self
            .ledger
            .find_checkout_session_by_stripe_session_id(&order.session_id)
            .await?;
        let first_completion = previous
            .as_ref()
            .is_none_or(|s| s.status != SessionStatus::Completed);

        let mut metadata = order.metadata.clone();
        let mut defaults = MetadataBag::new();
        defaults.insert_opt("product_slug", order.product_slug.clone());
        defaults.insert_opt("productSlug", order.product_slug.clone());
        defaults.insert_opt("productName", order.product_name.clone());
        defaults.insert("paymentProvider", order.provider.as_str());
        defaults.insert("payment_provider", order.provider.as_str());
        defaults.insert_opt("paymentProviderAccount", order.provider_account_alias.clone());
        defaults.insert_opt("payment_provider_account", order.provider_account_alias.clone());
        defaults.insert("providerSessionId", order.provider_session_id());
        defaults.insert_opt("providerPaymentId", order.provider_payment_id());
        defaults.insert_opt("providerChargeId", order.charge_id.clone());
        defaults.insert_opt("providerMode", order.provider_mode.clone());
        metadata.ensure(&defaults);

        let lander_id = order
            .lander_id
            .clone()
            .or_else(|| order.product_slug.clone())
            .unwrap_or_else(|| order.offer_id.clone());

        let mut session = CheckoutSessionUpsert::new(&order.session_id, SessionStatus::Completed, order.provider);
        session.stripe_payment_intent_id = order.payment_intent_id.clone();
        session.stripe_subscription_id = order.subscription_id.clone();
        session.offer_id = Some(order.offer_id.clone());
        session.lander_id = Some(lander_id.clone());
        session.customer_email = order.customer_email.clone();
        session.metadata = metadata.clone();
        let checkout_session_id = self.ledger.upsert_checkout_session(session).await?;

        let mut row = OrderUpsert::new(order.provider);
        row.checkout_session_id = Some(checkout_session_id.clone());
        row.stripe_session_id = Some(order.session_id.clone());
        row.stripe_payment_intent_id = order.payment_intent_id.clone();
        row.stripe_charge_id = order.charge_id.clone();
        row.amount_total = order.amount_total;
        row.currency = order.currency.clone();
        row.offer_id = Some(order.offer_id.clone());
        row.lander_id = Some(lander_id.clone());
        row.customer_email = order.customer_email.clone();
        row.customer_name = order.customer_name.clone();
        row.metadata = metadata.clone();
        row.payment_status = order.payment_status.clone();
        row.payment_method = order.payment_method.clone();
        self.ledger.upsert_order(row).await?;

        let offer = self.offers.get(&order.offer_id);
        let settings = LicenseSettings::resolve(&order.offer_id, offer.as_ref(), &order.license);

        if order.skip_side_effects {
            return Ok(FulfillmentSummary {
                checkout_session_id,
                license: None,
                license_settings: settings,
                entitlements: None,
                crm: CrmStatus::Skipped("side_effects_disabled"),
                support: None,
            });
        }

        let license = self.issue_license(&order, &settings, &mut metadata).await;
        let entitlements = self.grant_entitlements(&order, &settings, license.as_ref()).await;

        let product_name = order
            .product_name
            .clone()
            .or_else(|| offer.as_ref().map(|o| o.display_name().to_string()))
            .unwrap_or_else(|| order.offer_id.clone());
        let urls = order
            .urls
            .clone()
            .unwrap_or_else(|| OrderUrls::resolve(&metadata, offer.as_ref()));

        let already_synced = previous
            .as_ref()
            .and_then(|s| s.metadata.get_str("ghlSyncedAt"));
        let crm = if let Some(synced_at) = already_synced {
            tracing::debug!(
                offer_id = %order.offer_id,
                session_id = %order.session_id,
                ghl_synced_at = %synced_at,
                "ghl.sync_already_completed"
            );
            CrmStatus::Skipped("already_synced")
        } else {
            self.sync_crm(&order, offer.as_ref(), &settings, license.as_ref(), &metadata, &product_name, &lander_id, &urls)
                .await?
        };

        let support = self
            .support
            .sync_purchase(&SupportContext {
                session_id: order.session_id.clone(),
                offer_id: order.offer_id.clone(),
                product_name: Some(product_name.clone()),
                customer_email: order.customer_email.clone(),
                customer_name: order.customer_name.clone(),
                customer_phone: order.customer_phone.clone(),
                amount_total: order.amount_total,
                currency: order.currency.clone(),
                payment_status: order.payment_status.clone(),
                payment_method: order.payment_method.clone(),
                provider: order.provider.as_str().to_string(),
                provider_mode: order.provider_mode.clone(),
                provider_session_id: Some(order.provider_session_id().to_string()),
                provider_payment_id: order.provider_payment_id().map(ToString::to_string),
                provider_charge_id: order.charge_id.clone(),
                license_id: license.as_ref().and_then(|l| l.license_id.clone()),
                license_key: license.as_ref().and_then(|l| l.license_key.clone()),
                license_tier: settings.tier.clone(),
                license_entitlements: settings.entitlements.clone(),
                urls,
            })
            .await;

        if first_completion {
            self.notifier
                .sales_notification(&SaleNotice {
                    order_id: order.session_id.clone(),
                    customer_email: order.customer_email.clone().unwrap_or_default(),
                    product_name,
                    amount: order.amount_total.unwrap_or_default(),
                    affiliate_id: metadata.get_str("affiliateId"),
                })
                .await;
        }

        Ok(FulfillmentSummary {
            checkout_session_id,
            license,
            license_settings: settings,
            entitlements,
            crm,
            support: Some(support),
        })
    }

    async fn issue_license(
        &self,
        order: &NormalizedOrder,
        settings: &LicenseSettings,
        metadata: &mut MetadataBag,
    ) -> Option<LicenseRecord> {
        let email = order.customer_email.as_deref()?;
        let event_id = order.event_id.clone().unwrap_or_else(|| order.session_id.clone());

        let mut license_metadata = MetadataBag::new()
            .with("orderId", order.session_id.clone())
            .with("stripeSessionId", order.session_id.clone())
            .with("offerId", order.offer_id.clone());
        license_metadata.insert_opt("paymentIntentId", order.payment_intent_id.clone());
        license_metadata.insert_opt("providerAccountAlias", order.provider_account_alias.clone());
        license_metadata.insert_opt("productSlug", order.product_slug.clone());
        license_metadata.insert_opt("productName", order.product_name.clone());
        license_metadata.insert_opt("amount", order.amount_major());
        license_metadata.insert_opt("currency", order.currency.as_deref().map(str::to_lowercase));
        license_metadata.insert_opt("customerName", order.customer_name.clone());
        license_metadata.insert_opt("clientReferenceId", order.client_reference_id.clone());

        let mut raw_event = Map::new();
        raw_event.insert("eventId".into(), order.event_id.clone().into());
        raw_event.insert("checkoutSessionId".into(), order.session_id.clone().into());
        raw_event.insert("paymentIntentId".into(), order.payment_intent_id.clone().into());

        let request = LicenseRequest {
            provider_object_id: Some(
                order
                    .payment_intent_id
                    .clone()
                    .unwrap_or_else(|| order.session_id.clone()),
            ),
            tier: settings.tier.clone(),
            entitlements: settings.entitlements.clone(),
            features: settings.features.clone(),
            metadata: license_metadata,
            status: order.payment_status.clone().unwrap_or_else(|| "completed".into()),
            amount: order.amount_major(),
            currency: order.currency.as_deref().map(str::to_lowercase),
            raw_event,
            ..LicenseRequest::new(event_id.clone(), order.provider.as_str(), email)
        };

        let record = self.license.create_license_for_order(request).await?;

        if let Some(key) = &record.license_key {
            let patch = MetadataBag::new().with(
                "license",
                json!({
                    "action": record.action,
                    "licenseId": record.license_id,
                    "licenseKey": key,
                    "updatedAt": Utc::now().to_rfc3339(),
                }),
            );
            let updated = self
                .ledger
                .update_order_metadata(OrderMetadataUpdate {
                    payment_intent_id: order.payment_intent_id.clone(),
                    stripe_session_id: Some(order.session_id.clone()),
                    metadata: patch,
                })
                .await;
            match updated {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    provider = %order.provider,
                    id = %event_id,
                    session_id = %order.session_id,
                    "license_service.metadata_update_failed"
                ),
                Err(e) => tracing::warn!(
                    provider = %order.provider,
                    id = %event_id,
                    error = %e,
                    "license_service.metadata_update_failed"
                ),
            }
            metadata.insert("licenseKey", key.clone());
        }
        metadata.insert_opt("licenseId", record.license_id.clone());

        Some(record)
    }

    async fn grant_entitlements(
        &self,
        order: &NormalizedOrder,
        settings: &LicenseSettings,
        license: Option<&LicenseRecord>,
    ) -> Option<GrantOutcome> {
        let email = order.customer_email.as_deref()?;

        let mut metadata = MetadataBag::new()
            .with("source", order.provider.as_str())
            .with("offerId", order.offer_id.clone())
            .with("orderId", order.session_id.clone());
        metadata.insert_opt("paymentIntentId", order.payment_intent_id.clone());
        metadata.insert_opt("licenseId", license.and_then(|l| l.license_id.clone()));

        let outcome = self
            .entitlements
            .grant(EntitlementRequest {
                metadata,
                context: GrantContext {
                    provider: Some(order.provider.as_str().to_string()),
                    provider_event_id: order.event_id.clone(),
                    provider_session_id: Some(order.session_id.clone()),
                },
                ..EntitlementRequest::new(email, settings.entitlements.iter().cloned())
            })
            .await;

        if let GrantOutcome::Failed { http_status, error, .. } = &outcome {
            tracing::error!(
                offer_id = %order.offer_id,
                session_id = %order.session_id,
                http_status = ?http_status,
                error = %error,
                "serp_auth.entitlements_grant_failed"
            );
        }
        Some(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_crm(
        &self,
        order: &NormalizedOrder,
        offer: Option<&OfferConfig>,
        settings: &LicenseSettings,
        license: Option<&LicenseRecord>,
        metadata: &MetadataBag,
        product_name: &str,
        lander_id: &str,
        urls: &OrderUrls,
    ) -> Result<CrmStatus> {
        let Some(ghl) = offer.and_then(|o| o.ghl.as_ref()) else {
            tracing::debug!(offer_id = %order.offer_id, reason = "missing_configuration", "ghl.sync_skipped");
            return Ok(CrmStatus::Skipped("missing_configuration"));
        };

        let Some(email) = order.customer_email.clone() else {
            tracing::error!(
                offer_id = %order.offer_id,
                reason = "missing_customer_email",
                payment_intent_id = ?order.payment_intent_id,
                "ghl.sync_failed"
            );
            self.mark_session(&order.session_id, MetadataBag::new().with("ghlSyncError", "missing_customer_email"))
                .await?;
            return Ok(CrmStatus::Failed("Missing customer email; unable to sync to GHL".into()));
        };

        let context = SyncContext {
            offer_id: order.offer_id.clone(),
            offer_name: product_name.to_string(),
            customer_email: email,
            customer_name: order.customer_name.clone(),
            customer_phone: order.customer_phone.clone(),
            stripe_session_id: Some(order.session_id.clone()),
            stripe_payment_intent_id: order.payment_intent_id.clone(),
            amount_total: order.amount_total,
            amount_formatted: format_amount(order.amount_total, order.currency.as_deref()),
            currency: order.currency.clone(),
            lander_id: Some(lander_id.to_string()),
            provider: Some(order.provider.as_str().to_string()),
            product_page_url: urls.product_page_url.clone(),
            purchase_url: urls.purchase_url.clone(),
            serply_link: urls.serply_link.clone(),
            success_url: urls.success_url.clone(),
            cancel_url: urls.cancel_url.clone(),
            license_key: license.and_then(|l| l.license_key.clone()),
            license_id: license.and_then(|l| l.license_id.clone()),
            license_action: license.and_then(|l| l.action.clone()),
            license_entitlements: settings.entitlements.clone(),
            license_tier: settings.tier.clone(),
            license_features: settings.features.clone(),
            tos_accepted: order.tos_accepted,
            metadata: metadata.clone(),
        };

        match sync_with_retry(self.crm.as_ref(), Some(ghl), &context, self.crm_retry).await {
            Ok(Some(outcome)) => {
                let marker = MetadataBag::new()
                    .with("ghlSyncedAt", Utc::now().to_rfc3339())
                    .with("ghlSyncError", "")
                    .with("ghlContactId", outcome.contact_id.clone());
                self.mark_session(&order.session_id, marker).await?;
                Ok(CrmStatus::Synced(outcome))
            }
            Ok(None) => Ok(CrmStatus::Skipped("not_synced")),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    offer_id = %order.offer_id,
                    payment_intent_id = ?order.payment_intent_id,
                    status = ?e.http_status(),
                    error = %message,
                    "ghl.sync_failed"
                );
                self.mark_session(&order.session_id, MetadataBag::new().with("ghlSyncError", message.clone()))
                    .await?;
                Ok(CrmStatus::Failed(message))
            }
        }
    }

    async fn mark_session(&self, session_id: &str, metadata: MetadataBag) -> Result<()> {
        self.ledger
            .update_checkout_session_status(
                session_id,
                SessionStatus::Completed,
                SessionStatusUpdate {
                    metadata,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}
