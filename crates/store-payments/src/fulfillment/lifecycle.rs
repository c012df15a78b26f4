//! Post-purchase Stripe events: disputes, cancellations and failed renewals.
//!
//! None of these fulfill anything. They annotate the ledger, take access
//! away when money is gone for good, and tell ops.

use chrono::{DateTime, Utc};

use super::order::{LicenseOverrides, LicenseSettings};
use super::{EventContext, EventReport, Fulfillment};
use crate::entitlements::{EntitlementRequest, GrantContext, GrantOutcome};
use crate::error::Result;
use crate::ledger::{Order, OrderUpsert, PaymentSource, SessionStatus, SessionStatusUpdate};
use crate::metadata::MetadataBag;
use crate::webhook::{DisputeObject, InvoiceObject, SubscriptionObject};

fn rfc3339(unix: Option<i64>) -> String {
    unix.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

impl Fulfillment {
    pub(super) async fn charge_dispute_created(&self, dispute: &DisputeObject, ctx: &EventContext) -> Result<EventReport> {
        let Some(payment_intent_id) = dispute.payment_intent_id() else {
            tracing::warn!(dispute_id = %dispute.id, "webhook.dispute_missing_payment_intent");
            return Ok(EventReport::ignored("missing_payment_intent"));
        };
        let existing = self
            .ledger
            .find_order_by_payment_intent_id(&payment_intent_id)
            .await?;

        let mut patch = MetadataBag::new()
            .with("disputed", true)
            .with("disputeId", dispute.id.clone())
            .with("disputedAt", Utc::now().to_rfc3339());
        patch.insert_opt("disputeStatus", dispute.status.clone());
        patch.insert_opt("disputeReason", dispute.reason.clone());
        patch.insert_opt("disputeAmount", dispute.amount);

        self.record_dispute(&payment_intent_id, dispute, existing.as_ref(), Some("disputed"), patch.clone())
            .await?;

        let context = alert_context(patch, &payment_intent_id, existing.as_ref(), ctx);
        self.notifier.ops_alert("Stripe dispute opened", &context).await;

        tracing::warn!(
            dispute_id = %dispute.id,
            payment_intent_id = %payment_intent_id,
            reason = ?dispute.reason,
            "webhook.dispute_opened"
        );

        Ok(EventReport {
            handled: true,
            payment_intent_id: Some(payment_intent_id),
            outcome: MetadataBag::new()
                .with("outcome", "dispute_opened")
                .with("orderFound", existing.is_some()),
            crm_error: None,
        })
    }

    /// Won disputes restore the order; lost ones revoke the offer's entitlements.
    pub(super) async fn charge_dispute_closed(&self, dispute: &DisputeObject, ctx: &EventContext) -> Result<EventReport> {
        let Some(payment_intent_id) = dispute.payment_intent_id() else {
            tracing::warn!(dispute_id = %dispute.id, "webhook.dispute_missing_payment_intent");
            return Ok(EventReport::ignored("missing_payment_intent"));
        };
        let existing = self
            .ledger
            .find_order_by_payment_intent_id(&payment_intent_id)
            .await?;

        let mut patch = MetadataBag::new()
            .with("disputeId", dispute.id.clone())
            .with("disputeResolvedAt", Utc::now().to_rfc3339());
        patch.insert_opt("disputeStatus", dispute.status.clone());

        let payment_status = if dispute.is_won() {
            Some("succeeded")
        } else if dispute.is_lost() {
            Some("dispute_lost")
        } else {
            None
        };
        self.record_dispute(&payment_intent_id, dispute, existing.as_ref(), payment_status, patch.clone())
            .await?;

        let revoke = match (dispute.is_lost(), existing.as_ref()) {
            (true, Some(order)) => self.revoke_order(order, dispute, ctx).await,
            _ => None,
        };

        let mut context = alert_context(patch, &payment_intent_id, existing.as_ref(), ctx);
        context.insert_opt("revoke", revoke.as_ref().map(GrantOutcome::status));
        self.notifier.ops_alert("Stripe dispute closed", &context).await;

        tracing::info!(
            dispute_id = %dispute.id,
            payment_intent_id = %payment_intent_id,
            status = ?dispute.status,
            "webhook.dispute_closed"
        );

        let mut outcome = MetadataBag::new()
            .with("outcome", "dispute_closed")
            .with("orderFound", existing.is_some());
        outcome.insert_opt("disputeStatus", dispute.status.clone());
        outcome.insert_opt("revoke", revoke.as_ref().map(GrantOutcome::status));

        Ok(EventReport {
            handled: true,
            payment_intent_id: Some(payment_intent_id),
            outcome,
            crm_error: None,
        })
    }

    async fn record_dispute(
        &self,
        payment_intent_id: &str,
        dispute: &DisputeObject,
        existing: Option<&Order>,
        payment_status: Option<&str>,
        metadata: MetadataBag,
    ) -> Result<()> {
        let mut order = OrderUpsert::new(existing.map_or(PaymentSource::Stripe, |o| o.source));
        order.stripe_payment_intent_id = Some(payment_intent_id.to_string());
        order.stripe_charge_id = dispute.charge_id();
        order.payment_status = payment_status.map(String::from);
        order.metadata = metadata;
        self.ledger.upsert_order(order).await?;
        Ok(())
    }

    async fn revoke_order(&self, order: &Order, dispute: &DisputeObject, ctx: &EventContext) -> Option<GrantOutcome> {
        let (Some(email), Some(offer_id)) = (order.customer_email.clone(), order.offer_id.clone()) else {
            tracing::warn!(dispute_id = %dispute.id, "serp_auth.dispute_revoke_skipped");
            return None;
        };
        let overrides = LicenseOverrides::from_metadata(&order.metadata);
        let settings = LicenseSettings::resolve(&offer_id, self.offers.get(&offer_id).as_ref(), &overrides);

        let outcome = self
            .entitlements
            .revoke(EntitlementRequest {
                metadata: MetadataBag::new()
                    .with("source", "stripe")
                    .with("offerId", offer_id)
                    .with("disputeId", dispute.id.clone()),
                context: GrantContext {
                    provider: Some("stripe".into()),
                    provider_event_id: Some(ctx.event_id.clone()),
                    provider_session_id: order.stripe_session_id.clone(),
                },
                ..EntitlementRequest::new(email, settings.entitlements)
            })
            .await;
        Some(outcome)
    }

    /// Cancellation ends access to the subscribed offer.
    pub(super) async fn customer_subscription_deleted(
        &self,
        subscription: &SubscriptionObject,
        ctx: &EventContext,
    ) -> Result<EventReport> {
        let session = self
            .ledger
            .find_checkout_session_by_subscription_id(&subscription.id)
            .await?;

        let offer_id = session
            .as_ref()
            .and_then(|s| s.offer_id.clone())
            .or_else(|| subscription.metadata.get_str("offerId"));
        let email = session
            .as_ref()
            .and_then(|s| s.customer_email.clone())
            .or_else(|| subscription.metadata.get_str("customerEmail"));

        if let Some(session) = &session {
            let mut ended = MetadataBag::new()
                .with("subscriptionStatus", subscription.status.clone().unwrap_or_else(|| "canceled".into()))
                .with("subscriptionCanceledAt", rfc3339(subscription.canceled_at));
            ended.insert_opt("subscriptionCancellationReason", subscription.cancellation_reason());
            self.ledger
                .update_checkout_session_status(
                    &session.stripe_session_id,
                    session.status,
                    SessionStatusUpdate {
                        metadata: ended,
                        ..Default::default()
                    },
                )
                .await?;
        }

        let revoke = match (email, &offer_id) {
            (Some(email), Some(offer_id)) => {
                let overrides = session
                    .as_ref()
                    .map(|s| LicenseOverrides::from_metadata(&s.metadata))
                    .unwrap_or_default();
                let settings = LicenseSettings::resolve(offer_id, self.offers.get(offer_id).as_ref(), &overrides);
                let mut metadata = MetadataBag::new()
                    .with("source", "stripe")
                    .with("offerId", offer_id.clone())
                    .with("subscriptionId", subscription.id.clone());
                metadata.insert_opt("customerId", subscription.customer_id());
                let outcome = self
                    .entitlements
                    .revoke(EntitlementRequest {
                        metadata,
                        context: GrantContext {
                            provider: Some("stripe".into()),
                            provider_event_id: Some(ctx.event_id.clone()),
                            provider_session_id: session.as_ref().map(|s| s.stripe_session_id.clone()),
                        },
                        ..EntitlementRequest::new(email, settings.entitlements)
                    })
                    .await;
                Some(outcome)
            }
            _ => {
                tracing::warn!(subscription_id = %subscription.id, "serp_auth.cancellation_revoke_skipped");
                None
            }
        };

        let mut outcome = MetadataBag::new()
            .with("outcome", "subscription_canceled")
            .with("subscriptionId", subscription.id.clone())
            .with("sessionFound", session.is_some());
        outcome.insert_opt("revoke", revoke.as_ref().map(GrantOutcome::status));

        Ok(EventReport {
            handled: true,
            payment_intent_id: None,
            outcome,
            crm_error: None,
        })
    }

    /// A failed renewal marks the subscription session. Access stays until
    /// Stripe gives up and deletes the subscription.
    pub(super) async fn invoice_payment_failed(&self, invoice: &InvoiceObject, _ctx: &EventContext) -> Result<EventReport> {
        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(EventReport::ignored("not_a_subscription"));
        };
        let session = self
            .ledger
            .find_checkout_session_by_subscription_id(&subscription_id)
            .await?;

        if let Some(session) = &session {
            let mut failure = MetadataBag::new()
                .with("lastInvoiceFailedId", invoice.id.clone())
                .with("lastInvoicePaymentFailedAt", Utc::now().to_rfc3339());
            failure.insert_opt("invoiceAttemptCount", invoice.attempt_count);
            failure.insert_opt(
                "nextPaymentAttemptAt",
                invoice.next_payment_attempt.map(|t| rfc3339(Some(t))),
            );
            self.ledger
                .update_checkout_session_status(
                    &session.stripe_session_id,
                    SessionStatus::Failed,
                    SessionStatusUpdate {
                        payment_intent_id: None,
                        customer_email: None,
                        metadata: failure,
                    },
                )
                .await?;
        } else {
            tracing::warn!(invoice_id = %invoice.id, subscription_id = %subscription_id, "webhook.renewal_failure_without_session");
        }

        let mut outcome = MetadataBag::new()
            .with("outcome", "renewal_failed")
            .with("subscriptionId", subscription_id)
            .with("sessionFound", session.is_some());
        outcome.insert_opt("attemptCount", invoice.attempt_count);

        Ok(EventReport {
            handled: true,
            payment_intent_id: invoice.payment_intent_id(),
            outcome,
            crm_error: None,
        })
    }
}

fn alert_context(mut context: MetadataBag, payment_intent_id: &str, order: Option<&Order>, ctx: &EventContext) -> MetadataBag {
    context.insert("paymentIntentId", payment_intent_id);
    context.insert("providerMode", ctx.mode.as_str());
    context.insert_opt("providerAccount", ctx.account_alias.clone());
    context.insert_opt("offerId", order.and_then(|o| o.offer_id.clone()));
    context.insert_opt("customerEmail", order.and_then(|o| o.customer_email.clone()));
    context
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fulfillment::fakes::{Harness, verified};
    use crate::ledger::{CheckoutLedger, CheckoutSessionUpsert};
    use crate::offer::OfferConfig;
    use crate::webhook::VerifiedEvent;

    fn checkout_completed() -> VerifiedEvent {
        verified(
            "checkout.session.completed",
            json!({
                "id": "cs_dispute",
                "payment_intent": "pi_dispute",
                "customer_details": { "email": "buyer@example.com" },
                "amount_total": 4900,
                "currency": "usd",
                "payment_status": "paid",
                "metadata": { "offerId": "demo-offer" }
            }),
        )
    }

    fn dispute(event_type: &str, status: &str) -> VerifiedEvent {
        verified(
            event_type,
            json!({
                "id": "dp_1",
                "charge": "ch_dispute",
                "payment_intent": "pi_dispute",
                "amount": 4900,
                "currency": "usd",
                "reason": "fraudulent",
                "status": status
            }),
        )
    }

    async fn subscription_session(harness: &Harness) {
        let mut session = CheckoutSessionUpsert::new("cs_sub", SessionStatus::Completed, PaymentSource::Stripe);
        session.stripe_subscription_id = Some("sub_1".into());
        session.offer_id = Some("demo-offer".into());
        session.customer_email = Some("subscriber@example.com".into());
        harness.ledger.upsert_checkout_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispute_opened_marks_order_and_alerts() {
        let harness = Harness::new();
        let fulfillment = harness.fulfillment_with_offers([OfferConfig::new("demo-offer")]);
        fulfillment.handle_stripe_event(&checkout_completed()).await.unwrap();

        let report = fulfillment
            .handle_stripe_event(&dispute("charge.dispute.created", "needs_response"))
            .await
            .unwrap();
        assert_eq!(report.outcome.get_str("outcome").as_deref(), Some("dispute_opened"));

        let order = harness
            .ledger
            .find_order_by_payment_intent_id("pi_dispute")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.payment_status.as_deref(), Some("disputed"));
        assert_eq!(order.metadata.get("disputed"), Some(&json!(true)));
        assert_eq!(order.metadata.get_str("disputeReason").as_deref(), Some("fraudulent"));
        assert_eq!(order.offer_id.as_deref(), Some("demo-offer"));

        let alerts = harness.notifier.alerts();
        let (message, context) = alerts.last().unwrap();
        assert_eq!(message, "Stripe dispute opened");
        assert_eq!(context.get_str("customerEmail").as_deref(), Some("buyer@example.com"));
        assert!(harness.entitlements.revokes().is_empty());
    }

    #[tokio::test]
    async fn test_lost_dispute_revokes_entitlements() {
        let harness = Harness::new();
        let fulfillment = harness.fulfillment_with_offers([OfferConfig::new("demo-offer")]);
        fulfillment.handle_stripe_event(&checkout_completed()).await.unwrap();
        fulfillment
            .handle_stripe_event(&dispute("charge.dispute.created", "needs_response"))
            .await
            .unwrap();

        let report = fulfillment
            .handle_stripe_event(&dispute("charge.dispute.closed", "lost"))
            .await
            .unwrap();
        assert_eq!(report.outcome.get_str("revoke").as_deref(), Some("succeeded"));

        let order = harness
            .ledger
            .find_order_by_payment_intent_id("pi_dispute")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.payment_status.as_deref(), Some("dispute_lost"));
        assert!(order.metadata.contains_key("disputeResolvedAt"));

        let revokes = harness.entitlements.revokes();
        assert_eq!(revokes.len(), 1);
        assert_eq!(revokes[0].email, "buyer@example.com");
        assert_eq!(revokes[0].entitlements, vec!["demo-offer"]);
    }

    #[tokio::test]
    async fn test_won_dispute_restores_order() {
        let harness = Harness::new();
        let fulfillment = harness.fulfillment_with_offers([OfferConfig::new("demo-offer")]);
        fulfillment.handle_stripe_event(&checkout_completed()).await.unwrap();
        fulfillment
            .handle_stripe_event(&dispute("charge.dispute.created", "needs_response"))
            .await
            .unwrap();
        fulfillment
            .handle_stripe_event(&dispute("charge.dispute.closed", "won"))
            .await
            .unwrap();

        let order = harness
            .ledger
            .find_order_by_payment_intent_id("pi_dispute")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.payment_status.as_deref(), Some("succeeded"));
        assert_eq!(order.metadata.get_str("disputeStatus").as_deref(), Some("won"));
        assert!(harness.entitlements.revokes().is_empty());
        assert_eq!(harness.notifier.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_dispute_without_payment_intent_is_ignored() {
        let harness = Harness::new();
        let event = verified("charge.dispute.created", json!({ "id": "dp_2", "charge": "ch_2" }));
        let report = harness.fulfillment().handle_stripe_event(&event).await.unwrap();
        assert!(!report.handled);
        assert_eq!(harness.ledger.order_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_deleted_revokes_offer() {
        let harness = Harness::new();
        subscription_session(&harness).await;

        let event = verified(
            "customer.subscription.deleted",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "canceled",
                "canceled_at": 1_700_000_000,
                "cancellation_details": { "reason": "cancellation_requested" }
            }),
        );
        let report = harness.fulfillment().handle_stripe_event(&event).await.unwrap();
        assert_eq!(report.outcome.get_str("revoke").as_deref(), Some("succeeded"));

        let revokes = harness.entitlements.revokes();
        assert_eq!(revokes.len(), 1);
        assert_eq!(revokes[0].email, "subscriber@example.com");
        assert_eq!(revokes[0].metadata.get_str("subscriptionId").as_deref(), Some("sub_1"));

        let session = harness
            .ledger
            .find_checkout_session_by_stripe_session_id("cs_sub")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.metadata.get_str("subscriptionStatus").as_deref(), Some("canceled"));
        assert_eq!(
            session.metadata.get_str("subscriptionCanceledAt").as_deref(),
            Some("2023-11-14T22:13:20+00:00")
        );
        assert_eq!(
            session.metadata.get_str("subscriptionCancellationReason").as_deref(),
            Some("cancellation_requested")
        );
    }

    #[tokio::test]
    async fn test_unknown_subscription_deleted_skips_revoke() {
        let harness = Harness::new();
        let event = verified("customer.subscription.deleted", json!({ "id": "sub_unknown" }));
        let report = harness.fulfillment().handle_stripe_event(&event).await.unwrap();
        assert!(report.handled);
        assert_eq!(report.outcome.get("sessionFound"), Some(&json!(false)));
        assert!(report.outcome.get("revoke").is_none());
        assert!(harness.entitlements.revokes().is_empty());
    }

    #[tokio::test]
    async fn test_invoice_failure_annotates_subscription() {
        let harness = Harness::new();
        subscription_session(&harness).await;

        let event = verified(
            "invoice.payment_failed",
            json!({
                "id": "in_failed",
                "subscription": "sub_1",
                "payment_intent": "pi_renewal_failed",
                "attempt_count": 2,
                "next_payment_attempt": 1_700_086_400
            }),
        );
        let report = harness.fulfillment().handle_stripe_event(&event).await.unwrap();
        assert_eq!(report.outcome.get_str("outcome").as_deref(), Some("renewal_failed"));
        assert_eq!(report.payment_intent_id.as_deref(), Some("pi_renewal_failed"));

        let session = harness
            .ledger
            .find_checkout_session_by_stripe_session_id("cs_sub")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.metadata.get_str("lastInvoiceFailedId").as_deref(), Some("in_failed"));
        assert_eq!(session.metadata.get("invoiceAttemptCount"), Some(&json!(2)));
        assert!(harness.entitlements.revokes().is_empty());
    }

    #[tokio::test]
    async fn test_one_off_invoice_failure_is_ignored() {
        let harness = Harness::new();
        let event = verified("invoice.payment_failed", json!({ "id": "in_once" }));
        let report = harness.fulfillment().handle_stripe_event(&event).await.unwrap();
        assert!(!report.handled);
    }
}
