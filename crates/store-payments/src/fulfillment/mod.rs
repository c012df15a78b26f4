//! Order Fulfillment
//!
//! Reconciles verified provider events against the ledger and fans a
//! completed purchase out to the license authority, the entitlements
//! service, the CRM and the support desk.
//!
//! Session status only moves forward (`pending` -> `completed`/`failed`/
//! `abandoned`, with `completed` sticky), orders dedupe on the payment
//! intent id, and every side effect either carries its own idempotency
//! marker or is idempotent on the remote side. Re-delivering an event is
//! therefore always safe. Downstream failures are logged and reported
//! back to the caller; they never fail the event once the ledger write
//! has landed.

mod lifecycle;
mod order;
mod stripe;
pub mod urls;

#[cfg(test)]
pub(crate) mod fakes;

use std::sync::Arc;

pub use order::{CrmStatus, FulfillmentSummary, LicenseOverrides, LicenseSettings, NormalizedOrder};
pub use urls::{OrderUrls, format_amount};

use crate::alerts::{Notifier, SlackNotifier};
use crate::crm::{CrmSync, GhlClient, SyncRetryPolicy};
use crate::entitlements::{EntitlementGrantor, EntitlementsClient};
use crate::error::Result;
use crate::ledger::CheckoutLedger;
use crate::license::{LicenseIssuer, LicenseServiceClient};
use crate::metadata::MetadataBag;
use crate::offer::OfferCatalog;
use crate::providers::{StripeAccount, StripeGateway, StripeMode, StripeRegistry};
use crate::support::{CrispClient, SupportSync};
use crate::webhook::{EventKind, VerifiedEvent};

/// Where a Stripe event came from
#[derive(Clone, Debug)]
pub struct EventContext {
    pub event_id: String,
    pub event_type: String,
    pub mode: StripeMode,
    pub account_alias: Option<String>,
}

impl EventContext {
    pub fn account(&self) -> StripeAccount {
        StripeAccount {
            mode: self.mode,
            alias: self.account_alias.clone(),
        }
    }
}

impl From<&VerifiedEvent> for EventContext {
    fn from(verified: &VerifiedEvent) -> Self {
        Self {
            event_id: verified.event.id.clone(),
            event_type: verified.event.event_type.clone(),
            mode: verified.mode,
            account_alias: verified.account_alias.clone(),
        }
    }
}

/// What handling an event did, for the webhook log
#[derive(Clone, Debug, Default)]
pub struct EventReport {
    /// `false` when the event type has no handler or carried nothing actionable
    pub handled: bool,
    pub payment_intent_id: Option<String>,
    pub outcome: MetadataBag,

    /// CRM failure that left the purchase otherwise fulfilled
    pub crm_error: Option<String>,
}

impl EventReport {
    pub fn ignored(reason: &str) -> Self {
        Self {
            handled: false,
            outcome: MetadataBag::new().with("outcome", "ignored").with("reason", reason),
            ..Default::default()
        }
    }
}

/// The orchestrator and its collaborators
#[derive(Clone)]
pub struct Fulfillment {
    pub ledger: Arc<dyn CheckoutLedger>,
    pub offers: Arc<dyn OfferCatalog>,
    pub license: Arc<dyn LicenseIssuer>,
    pub entitlements: Arc<dyn EntitlementGrantor>,
    pub crm: Arc<dyn CrmSync>,
    pub crm_retry: SyncRetryPolicy,
    pub support: Arc<dyn SupportSync>,
    pub notifier: Arc<dyn Notifier>,

    /// Only needed for renewal descriptions and product names
    pub stripe: Option<Arc<dyn StripeGateway>>,
}

impl Fulfillment {
    /// Wire the HTTP adapters from the environment around `ledger`.
    pub fn from_env(ledger: Arc<dyn CheckoutLedger>, offers: Arc<dyn OfferCatalog>) -> Self {
        let stripe = StripeRegistry::from_env();
        let stripe: Option<Arc<dyn StripeGateway>> = if stripe.is_configured() {
            Some(Arc::new(stripe))
        } else {
            tracing::warn!("stripe.not_configured");
            None
        };

        Self {
            support: Arc::new(CrispClient::from_env(ledger.clone())),
            ledger,
            offers,
            license: Arc::new(LicenseServiceClient::from_env()),
            entitlements: Arc::new(EntitlementsClient::from_env()),
            crm: Arc::new(GhlClient::from_env()),
            crm_retry: SyncRetryPolicy::from_env(),
            notifier: Arc::new(SlackNotifier::from_env()),
            stripe,
        }
    }

    /// Route a verified Stripe event to its handler.
    pub async fn handle_stripe_event(&self, verified: &VerifiedEvent) -> Result<EventReport> {
        let ctx = EventContext::from(verified);
        let event = &verified.event;

        let report = match event.kind() {
            EventKind::CheckoutSessionCompleted | EventKind::CheckoutSessionAsyncPaymentSucceeded => {
                self.checkout_session_completed(&event.object()?, &ctx).await?
            }
            EventKind::PaymentIntentSucceeded => self.payment_intent_succeeded(&event.object()?, &ctx).await?,
            EventKind::PaymentIntentPaymentFailed | EventKind::PaymentIntentCanceled => {
                self.payment_intent_failed(&event.object()?, &ctx).await?
            }
            EventKind::InvoicePaymentSucceeded => self.invoice_payment_succeeded(&event.object()?, &ctx).await?,
            EventKind::InvoicePaymentFailed => self.invoice_payment_failed(&event.object()?, &ctx).await?,
            EventKind::ChargeRefunded => self.charge_refunded(&event.object()?, &ctx).await?,
            EventKind::ChargeDisputeCreated => self.charge_dispute_created(&event.object()?, &ctx).await?,
            EventKind::ChargeDisputeClosed => self.charge_dispute_closed(&event.object()?, &ctx).await?,
            EventKind::CustomerSubscriptionDeleted => {
                self.customer_subscription_deleted(&event.object()?, &ctx).await?
            }
            EventKind::Unhandled => {
                tracing::debug!(event_id = %ctx.event_id, event_type = %ctx.event_type, "webhook.unhandled_event");
                EventReport::ignored("unhandled_event_type")
            }
        };
        Ok(report)
    }
}
