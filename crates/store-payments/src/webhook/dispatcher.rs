//! Stripe Webhook Dispatch
//!
//! Verify, dedupe against the webhook log, hand the event to the
//! orchestrator, then record the outcome. Log writes are best effort: a
//! failed bookkeeping write is logged and the delivery still succeeds.

use std::sync::Arc;

use crate::error::{PaymentError, Result};
use crate::fulfillment::Fulfillment;
use crate::ledger::WebhookLogStore;
use crate::maintenance::{MaintenanceConfig, spawn_stale_sweep};
use crate::webhook::log::{DeliveryLog, DispatchOutcome};
use crate::webhook::signature::StripeSignatureVerifier;

pub struct StripeWebhookDispatcher {
    verifier: StripeSignatureVerifier,
    fulfillment: Fulfillment,
    log: Arc<dyn WebhookLogStore>,
    maintenance: MaintenanceConfig,
}

impl StripeWebhookDispatcher {
    pub fn new(verifier: StripeSignatureVerifier, fulfillment: Fulfillment, log: Arc<dyn WebhookLogStore>) -> Self {
        Self {
            verifier,
            fulfillment,
            log,
            maintenance: MaintenanceConfig::default(),
        }
    }

    #[must_use]
    pub const fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub const fn fulfillment(&self) -> &Fulfillment {
        &self.fulfillment
    }

    /// Handle one delivery. `Err` means the provider should retry, except for
    /// signature and parse errors which are rejected outright.
    pub async fn dispatch(&self, payload: &str, signature: Option<&str>) -> Result<DispatchOutcome> {
        let header = signature.ok_or_else(|| PaymentError::InvalidSignature("missing stripe-signature header".into()))?;
        let verified = self.verifier.verify(payload, header)?;
        let event = &verified.event;
        let log = DeliveryLog::new(self.log.as_ref(), &event.id, &event.event_type);

        if log.is_processed().await {
            tracing::info!(event_id = %event.id, event_type = %event.event_type, "webhook.duplicate_event");
            return Ok(DispatchOutcome::Duplicate);
        }
        log.pending(event.payment_intent_id()).await;

        let result = self.fulfillment.handle_stripe_event(&verified).await;
        spawn_stale_sweep(self.fulfillment.ledger.clone(), self.maintenance.stale_after());

        match result {
            Ok(report) => {
                let payment_intent_id = report
                    .payment_intent_id
                    .clone()
                    .or_else(|| event.payment_intent_id());
                Ok(log
                    .complete(report, payment_intent_id, self.fulfillment.notifier.as_ref())
                    .await)
            }
            Err(e) => {
                log.failed(event.payment_intent_id(), &e).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fulfillment::fakes::Harness;
    use crate::ledger::{CheckoutLedger, WebhookStatus};
    use crate::offer::{GhlOfferConfig, OfferConfig};
    use crate::providers::StripeMode;
    use crate::webhook::signature::sign;

    const SECRET: &str = "whsec_test_dispatch";

    fn dispatcher(harness: &Harness, offers: Vec<OfferConfig>) -> StripeWebhookDispatcher {
        StripeWebhookDispatcher::new(
            StripeSignatureVerifier::new().with_secret(SECRET, StripeMode::Test, None),
            harness.fulfillment_with_offers(offers),
            harness.ledger.clone(),
        )
    }

    fn offer_with_crm() -> OfferConfig {
        let mut offer = OfferConfig::new("demo-offer");
        offer.ghl = Some(GhlOfferConfig::default());
        offer
    }

    fn checkout_payload() -> String {
        json!({
            "id": "evt_dispatch_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "livemode": false,
            "data": { "object": {
                "id": "cs_dispatch",
                "payment_intent": "pi_dispatch",
                "customer_details": { "email": "buyer@example.com" },
                "amount_total": 9900,
                "currency": "usd",
                "payment_status": "paid",
                "metadata": { "offerId": "demo-offer" }
            }}
        })
        .to_string()
    }

    fn signed(payload: &str) -> String {
        sign(SECRET, payload, chrono::Utc::now().timestamp()).unwrap()
    }

    #[tokio::test]
    async fn test_replayed_event_is_skipped() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness, vec![offer_with_crm()]);
        let payload = checkout_payload();

        let first = dispatcher.dispatch(&payload, Some(&signed(&payload))).await.unwrap();
        assert_eq!(first.as_str(), "processed");

        let replay = dispatcher.dispatch(&payload, Some(&signed(&payload))).await.unwrap();
        assert_eq!(replay.as_str(), "duplicate");

        assert_eq!(harness.ledger.order_count(), 1);
        assert_eq!(harness.crm.calls().len(), 1);
        assert_eq!(harness.license.requests().len(), 1);

        let entry = harness.ledger.find_webhook_log("evt_dispatch_1").await.unwrap().unwrap();
        assert_eq!(entry.status, WebhookStatus::Success);
        assert_eq!(entry.payment_intent_id.as_deref(), Some("pi_dispatch"));
    }

    #[tokio::test]
    async fn test_bad_signature_never_reaches_ledger() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness, vec![offer_with_crm()]);
        let payload = checkout_payload();
        let forged = sign("whsec_other", &payload, chrono::Utc::now().timestamp()).unwrap();

        let err = dispatcher.dispatch(&payload, Some(&forged)).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let missing = dispatcher.dispatch(&payload, None).await.unwrap_err();
        assert_eq!(missing.status_code(), 400);

        assert!(harness.ledger.find_webhook_log("evt_dispatch_1").await.unwrap().is_none());
        assert!(
            harness
                .ledger
                .find_checkout_session_by_stripe_session_id("cs_dispatch")
                .await
                .unwrap()
                .is_none()
        );
        assert!(harness.license.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_secret_is_server_error() {
        let harness = Harness::new();
        let dispatcher = StripeWebhookDispatcher::new(
            StripeSignatureVerifier::new(),
            harness.fulfillment(),
            harness.ledger.clone(),
        );
        let payload = checkout_payload();

        let err = dispatcher.dispatch(&payload, Some("t=1,v1=00")).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_repeated_crm_failure_pages_ops() {
        let harness = Harness::new();
        harness.crm.fail_with_status(422, "duplicate contact");
        let dispatcher = dispatcher(&harness, vec![offer_with_crm()]);
        let payload = checkout_payload();

        for _ in 0..2 {
            let outcome = dispatcher.dispatch(&payload, Some(&signed(&payload))).await.unwrap();
            assert_eq!(outcome.as_str(), "degraded");
        }
        assert!(harness.notifier.alerts().is_empty());

        dispatcher.dispatch(&payload, Some(&signed(&payload))).await.unwrap();

        let alerts = harness.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, "GHL sync failed after multiple attempts");
        assert_eq!(alerts[0].1.get_str("offerId").as_deref(), Some("demo-offer"));
        assert_eq!(alerts[0].1.get_str("paymentIntentId").as_deref(), Some("pi_dispatch"));
        assert_eq!(alerts[0].1.get("attempts"), Some(&json!(3)));

        let entry = harness.ledger.find_webhook_log("evt_dispatch_1").await.unwrap().unwrap();
        assert_eq!(entry.status, WebhookStatus::Error);
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 422: duplicate contact"));
    }

    #[tokio::test]
    async fn test_unhandled_type_is_acknowledged() {
        let harness = Harness::new();
        let dispatcher = dispatcher(&harness, Vec::new());
        let payload = json!({
            "id": "evt_customer",
            "type": "customer.created",
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string();

        let outcome = dispatcher.dispatch(&payload, Some(&signed(&payload))).await.unwrap();
        assert_eq!(outcome.as_str(), "ignored");
        let entry = harness.ledger.find_webhook_log("evt_customer").await.unwrap().unwrap();
        assert_eq!(entry.status, WebhookStatus::Success);
    }
}
