//! Stripe event handlers.

use chrono::Utc;
use serde_json::json;

use super::order::{LicenseOverrides, LicenseSettings, NormalizedOrder};
use super::{EventContext, EventReport, Fulfillment};
use crate::entitlements::{EntitlementRequest, GrantContext, GrantOutcome};
use crate::error::Result;
use crate::ledger::{
    CheckoutSession, CheckoutSessionUpsert, OrderUpsert, PaymentSource, SessionStatus,
    SessionStatusUpdate,
};
use crate::license::LicenseRefund;
use crate::metadata::MetadataBag;
use crate::resolve::{ResolverChain, non_empty};
use crate::webhook::{ChargeObject, CheckoutSessionObject, InvoiceLine, InvoiceObject, PaymentIntentObject};

fn offer_id_chain() -> ResolverChain<CheckoutSessionObject, String> {
    ResolverChain::new()
        .then("metadata.offerId", |s| s.metadata.get_str("offerId"))
        .then("metadata.productSlug", |s| s.metadata.get_str("productSlug"))
        .then("client_reference_id", |s| non_empty(s.client_reference_id.as_deref()))
}

/// Inputs of the renewal product-name lookup
struct RenewalSources<'a> {
    session: Option<&'a CheckoutSession>,
    invoice: &'a InvoiceObject,
    line: Option<&'a InvoiceLine>,
}

fn renewal_name_chain<'a>() -> ResolverChain<RenewalSources<'a>, String> {
    ResolverChain::new()
        .then("session.metadata", |s| {
            s.session.and_then(|session| session.metadata.get_str("productName"))
        })
        .then("invoice.metadata", |s| s.invoice.metadata.get_str("productName"))
        .then("line.metadata", |s| s.line.and_then(|l| l.metadata.get_str("productName")))
        .then("line.price.nickname", |s| {
            s.line
                .and_then(|l| l.price.as_ref())
                .and_then(|p| non_empty(p.nickname.as_deref()))
        })
        .then("line.price.product", |s| {
            s.line
                .and_then(|l| l.price.as_ref())
                .and_then(|p| p.product.as_ref())
                .and_then(|product| non_empty(product.name()))
        })
}

fn payment_method(types: &[String]) -> Option<String> {
    types.first().cloned()
}

/// Fields for a session opened from a payment intent with no checkout session
struct IntentSession {
    offer_id: Option<String>,
    lander_id: Option<String>,
    customer_email: Option<String>,
}

impl Fulfillment {
    /// Checkout session referencing `intent`. When none exists a pending one
    /// is opened, keyed by the intent id until a checkout session adopts it.
    /// The flag reports whether the session already existed.
    async fn session_for_intent(
        &self,
        intent: &PaymentIntentObject,
        fields: IntentSession,
    ) -> Result<(Option<CheckoutSession>, bool)> {
        if let Some(session) = self
            .ledger
            .find_checkout_session_by_payment_intent_id(&intent.id)
            .await?
        {
            return Ok((Some(session), true));
        }

        let mut pending = CheckoutSessionUpsert::new(&intent.id, SessionStatus::Pending, PaymentSource::Stripe);
        pending.stripe_payment_intent_id = Some(intent.id.clone());
        pending.offer_id = fields.offer_id;
        pending.lander_id = fields.lander_id;
        pending.customer_email = fields.customer_email;
        pending.metadata = MetadataBag::new()
            .with("providerPaymentId", intent.id.clone())
            .with("openedFrom", "payment_intent");
        self.ledger.upsert_checkout_session(pending).await?;
        tracing::info!(payment_intent_id = %intent.id, "webhook.session_opened_from_payment_intent");

        let session = self
            .ledger
            .find_checkout_session_by_payment_intent_id(&intent.id)
            .await?;
        Ok((session, false))
    }

    pub(super) async fn checkout_session_completed(
        &self,
        session: &CheckoutSessionObject,
        ctx: &EventContext,
    ) -> Result<EventReport> {
        let mut metadata = session.metadata.clone();

        let tos_status = session.consent.as_ref().and_then(|c| c.terms_of_service.clone());
        if let Some(status) = &tos_status {
            metadata.insert("stripeTermsOfService", status.clone());
            if status == "accepted" {
                metadata.insert("tosAccepted", "true");
            }
        }
        metadata.insert_opt(
            "stripeTermsOfServiceRequirement",
            session
                .consent_collection
                .as_ref()
                .and_then(|c| c.terms_of_service.clone()),
        );
        metadata.insert_opt("clientReferenceId", non_empty(session.client_reference_id.as_deref()));

        let Some((offer_source, offer_id)) = offer_id_chain().resolve_named(session) else {
            tracing::error!(
                session_id = %session.id,
                client_reference_id = ?session.client_reference_id,
                "webhook.missing_offer_id"
            );
            return Ok(EventReport::ignored("missing_offer_id"));
        };
        tracing::debug!(session_id = %session.id, offer_id = %offer_id, source = offer_source, "webhook.offer_resolved");

        let payment_intent_id = session.payment_intent_id();

        if !session.is_paid() {
            let mut pending = CheckoutSessionUpsert::new(&session.id, SessionStatus::Pending, PaymentSource::Stripe);
            pending.stripe_payment_intent_id = payment_intent_id.clone();
            pending.stripe_subscription_id = session.subscription_id();
            pending.offer_id = Some(offer_id);
            pending.customer_email = session.email();
            pending.metadata = metadata;
            self.ledger.upsert_checkout_session(pending).await?;

            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "webhook.checkout_awaiting_payment"
            );
            return Ok(EventReport {
                handled: true,
                payment_intent_id,
                outcome: MetadataBag::new().with("outcome", "awaiting_payment"),
                crm_error: None,
            });
        }

        let offer = self.offers.get(&offer_id);
        let tos_accepted = match metadata.get_str("tosAccepted").as_deref() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        };

        let mut order = NormalizedOrder::new(PaymentSource::Stripe, &session.id, &offer_id);
        order.provider_account_alias = ctx.account_alias.clone();
        order.provider_mode = Some(ctx.mode.as_str().to_string());
        order.event_id = Some(ctx.event_id.clone());
        order.payment_intent_id = payment_intent_id.clone();
        order.subscription_id = session.subscription_id();
        order.lander_id = metadata.get_str("landerId");
        order.product_slug = metadata.get_str("productSlug");
        order.product_name = offer
            .as_ref()
            .and_then(|o| o.product_name.clone())
            .or_else(|| metadata.get_str("productName"));
        order.customer_email = session.email();
        order.customer_name = session.customer_name();
        order.customer_phone = session.customer_phone();
        order.client_reference_id = non_empty(session.client_reference_id.as_deref());
        order.amount_total = session.amount_total;
        order.currency = session.currency.clone();
        order.payment_status = session.payment_status.clone();
        order.payment_method = payment_method(&session.payment_method_types);
        order.license = LicenseOverrides::from_metadata(&metadata);
        order.tos_accepted = tos_accepted;
        order.metadata = metadata;

        let summary = self.process_fulfilled_order(order).await?;

        Ok(EventReport {
            handled: true,
            payment_intent_id,
            outcome: summary.outcome().with("offerId", offer_id),
            crm_error: summary.crm.error().map(ToString::to_string),
        })
    }

    pub(super) async fn payment_intent_succeeded(
        &self,
        intent: &PaymentIntentObject,
        ctx: &EventContext,
    ) -> Result<EventReport> {
        let (session, session_found) = self
            .session_for_intent(
                intent,
                IntentSession {
                    offer_id: intent.metadata.get_str("offerId"),
                    lander_id: intent.metadata.get_str("landerId"),
                    customer_email: intent
                        .receipt_email
                        .clone()
                        .or_else(|| intent.metadata.get_str("customerEmail")),
                },
            )
            .await?;
        let charge_id = intent.charge_id();

        let mut metadata = intent.metadata.clone();
        metadata.insert("providerPaymentId", intent.id.clone());
        metadata.insert_opt("providerChargeId", charge_id.clone());
        metadata.insert("providerMode", ctx.mode.as_str());

        let customer_email = session
            .as_ref()
            .and_then(|s| s.customer_email.clone())
            .or_else(|| intent.receipt_email.clone())
            .or_else(|| metadata.get_str("customerEmail"));

        if let Some(session) = &session {
            self.ledger
                .update_checkout_session_status(
                    &session.stripe_session_id,
                    SessionStatus::Completed,
                    SessionStatusUpdate {
                        payment_intent_id: Some(intent.id.clone()),
                        customer_email: customer_email.clone(),
                        metadata: metadata.clone(),
                    },
                )
                .await?;
        }

        let mut order = OrderUpsert::new(session.as_ref().map_or(PaymentSource::Stripe, |s| s.source));
        order.checkout_session_id = session.as_ref().map(|s| s.id.clone());
        order.stripe_session_id = session.as_ref().map(|s| s.stripe_session_id.clone());
        order.stripe_payment_intent_id = Some(intent.id.clone());
        order.stripe_charge_id = charge_id;
        order.offer_id = session
            .as_ref()
            .and_then(|s| s.offer_id.clone())
            .or_else(|| metadata.get_str("offerId"));
        order.lander_id = session
            .as_ref()
            .and_then(|s| s.lander_id.clone())
            .or_else(|| metadata.get_str("landerId"));
        order.customer_email = customer_email;
        order.customer_name = metadata.get_str("customerName");
        order.amount_total = intent.amount_received.or(intent.amount);
        order.currency = intent.currency.clone();
        order.payment_status = Some(intent.status.clone().unwrap_or_else(|| "succeeded".into()));
        order.payment_method = payment_method(&intent.payment_method_types);
        order.metadata = metadata;
        self.ledger.upsert_order(order).await?;

        Ok(EventReport {
            handled: true,
            payment_intent_id: Some(intent.id.clone()),
            outcome: MetadataBag::new()
                .with("outcome", "recorded")
                .with("sessionFound", session_found),
            crm_error: None,
        })
    }

    pub(super) async fn payment_intent_failed(
        &self,
        intent: &PaymentIntentObject,
        ctx: &EventContext,
    ) -> Result<EventReport> {
        let (session, session_found) = self
            .session_for_intent(
                intent,
                IntentSession {
                    offer_id: intent
                        .metadata
                        .get_str("offer_id")
                        .or_else(|| intent.metadata.get_str("offerId")),
                    lander_id: intent.metadata.get_str("lander_id"),
                    customer_email: intent
                        .receipt_email
                        .clone()
                        .or_else(|| intent.metadata.get_str("customer_email")),
                },
            )
            .await?;
        let charge_id = intent.charge_id();

        let mut failure = intent.metadata.clone();
        failure.insert_opt("lastPaymentError", intent.failure_message());
        if let Some(error) = &intent.last_payment_error {
            failure.insert_opt("lastPaymentErrorCode", error.code.clone());
            failure.insert_opt("lastPaymentDeclineCode", error.decline_code.clone());
        }
        failure.insert("providerPaymentId", intent.id.clone());
        failure.insert_opt("providerChargeId", charge_id.clone());
        failure.insert("providerMode", ctx.mode.as_str());

        let offer_id = session
            .as_ref()
            .and_then(|s| s.offer_id.clone())
            .or_else(|| failure.get_str("offer_id"))
            .or_else(|| failure.get_str("offerId"));
        let lander_id = session
            .as_ref()
            .and_then(|s| s.lander_id.clone())
            .or_else(|| failure.get_str("lander_id"));
        let customer_email = session
            .as_ref()
            .and_then(|s| s.customer_email.clone())
            .or_else(|| intent.receipt_email.clone())
            .or_else(|| failure.get_str("customer_email"));

        if let Some(session) = &session {
            self.ledger
                .update_checkout_session_status(
                    &session.stripe_session_id,
                    SessionStatus::Failed,
                    SessionStatusUpdate {
                        payment_intent_id: Some(intent.id.clone()),
                        customer_email: None,
                        metadata: failure.clone(),
                    },
                )
                .await?;
        }

        let mut order = OrderUpsert::new(session.as_ref().map_or(PaymentSource::Stripe, |s| s.source));
        order.checkout_session_id = session.as_ref().map(|s| s.id.clone());
        order.stripe_session_id = session.as_ref().map(|s| s.stripe_session_id.clone());
        order.stripe_payment_intent_id = Some(intent.id.clone());
        order.stripe_charge_id = charge_id;
        order.offer_id = offer_id.clone();
        order.lander_id = lander_id;
        order.customer_email = customer_email.clone();
        order.amount_total = intent.amount;
        order.currency = intent.currency.clone();
        order.payment_status = Some(intent.status.clone().unwrap_or_else(|| "payment_failed".into()));
        order.payment_method = payment_method(&intent.payment_method_types);
        order.metadata = failure;
        self.ledger.upsert_order(order).await?;

        let was_completed = session
            .as_ref()
            .is_some_and(|s| s.status == SessionStatus::Completed);

        let revoke = match (customer_email, offer_id, was_completed) {
            (Some(email), Some(offer_id), false) => {
                let settings = LicenseSettings::resolve(&offer_id, self.offers.get(&offer_id).as_ref(), &LicenseOverrides::default());
                let metadata = MetadataBag::new()
                    .with("source", "stripe")
                    .with("offerId", offer_id)
                    .with(
                        "stripe",
                        json!({
                            "eventType": ctx.event_type,
                            "paymentIntentId": intent.id,
                            "customerId": intent.customer_id(),
                            "invoiceId": intent.invoice_id(),
                        }),
                    );
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
                if !outcome.is_success() {
                    tracing::debug!(
                        payment_intent_id = %intent.id,
                        status = outcome.status(),
                        "serp_auth.entitlements_revoke_on_payment_intent_failure"
                    );
                }
                Some(outcome)
            }
            _ => None,
        };

        let mut outcome = MetadataBag::new()
            .with("outcome", "failed")
            .with("sessionFound", session_found);
        outcome.insert_opt("revoke", revoke.as_ref().map(GrantOutcome::status));

        Ok(EventReport {
            handled: true,
            payment_intent_id: Some(intent.id.clone()),
            outcome,
            crm_error: None,
        })
    }

    pub(super) async fn invoice_payment_succeeded(
        &self,
        invoice: &InvoiceObject,
        ctx: &EventContext,
    ) -> Result<EventReport> {
        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(EventReport::ignored("not_a_subscription"));
        };
        let session = self
            .ledger
            .find_checkout_session_by_subscription_id(&subscription_id)
            .await?;
        let line = invoice.first_line();
        let payment_intent_id = invoice.payment_intent_id();

        let offer_id = session
            .as_ref()
            .and_then(|s| s.offer_id.clone())
            .or_else(|| invoice.metadata.get_str("offerId"))
            .or_else(|| line.and_then(|l| l.metadata.get_str("offerId")));

        let sources = RenewalSources {
            session: session.as_ref(),
            invoice,
            line,
        };
        let mut product_name = renewal_name_chain().resolve(&sources);
        if product_name.is_none() {
            product_name = self.fetch_product_name(line, ctx).await;
        }
        let product_name = product_name
            .or_else(|| line.and_then(|l| non_empty(l.description.as_deref())))
            .or_else(|| offer_id.clone());

        if let (Some(pi), Some(name), Some(stripe)) = (&payment_intent_id, &product_name, &self.stripe) {
            let description = format!("Subscription - {name}");
            if let Err(e) = stripe
                .set_payment_intent_description(pi, &description, &ctx.account())
                .await
            {
                tracing::warn!(payment_intent_id = %pi, error = %e, "stripe.payment_intent_description_failed");
            }
        }

        if let Some(session) = &session {
            let mut renewal = MetadataBag::new()
                .with("lastInvoiceId", invoice.id.clone())
                .with("lastInvoicePaidAt", Utc::now().to_rfc3339());
            renewal.insert_opt("lastInvoiceBillingReason", invoice.billing_reason.clone());
            self.ledger
                .update_checkout_session_status(
                    &session.stripe_session_id,
                    SessionStatus::Completed,
                    SessionStatusUpdate {
                        metadata: renewal,
                        ..Default::default()
                    },
                )
                .await?;
        }

        let email = invoice
            .customer_email
            .clone()
            .or_else(|| session.as_ref().and_then(|s| s.customer_email.clone()));

        let grant = match (email, &offer_id) {
            (Some(email), Some(offer_id)) => {
                let overrides = session
                    .as_ref()
                    .map(|s| LicenseOverrides::from_metadata(&s.metadata))
                    .unwrap_or_default();
                let settings = LicenseSettings::resolve(offer_id, self.offers.get(offer_id).as_ref(), &overrides);
                let mut metadata = MetadataBag::new()
                    .with("source", "stripe")
                    .with("offerId", offer_id.clone())
                    .with("invoiceId", invoice.id.clone())
                    .with("subscriptionId", subscription_id.clone());
                metadata.insert_opt("paymentIntentId", payment_intent_id.clone());
                let outcome = self
                    .entitlements
                    .grant(EntitlementRequest {
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
                tracing::debug!(
                    invoice_id = %invoice.id,
                    subscription_id = %subscription_id,
                    "serp_auth.renewal_grant_skipped"
                );
                None
            }
        };

        let mut outcome = MetadataBag::new()
            .with("outcome", "renewed")
            .with("subscriptionId", subscription_id)
            .with("sessionFound", session.is_some());
        outcome.insert_opt("productName", product_name);
        outcome.insert_opt("entitlements", grant.as_ref().map(GrantOutcome::status));

        Ok(EventReport {
            handled: true,
            payment_intent_id,
            outcome,
            crm_error: None,
        })
    }

    async fn fetch_product_name(&self, line: Option<&InvoiceLine>, ctx: &EventContext) -> Option<String> {
        let stripe = self.stripe.as_ref()?;
        let product = line?.price.as_ref()?.product.as_ref()?;
        match stripe.product_name(product.id(), &ctx.account()).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(product_id = %product.id(), error = %e, "stripe.product_lookup_failed");
                None
            }
        }
    }

    pub(super) async fn charge_refunded(&self, charge: &ChargeObject, ctx: &EventContext) -> Result<EventReport> {
        let Some(payment_intent_id) = charge.payment_intent_id() else {
            tracing::warn!(charge_id = %charge.id, "webhook.refund_missing_payment_intent");
            return Ok(EventReport::ignored("missing_payment_intent"));
        };
        let existing = self
            .ledger
            .find_order_by_payment_intent_id(&payment_intent_id)
            .await?;
        let source = existing.as_ref().map_or(PaymentSource::Stripe, |o| o.source);

        let mut refund = MetadataBag::new()
            .with("refundedAt", Utc::now().to_rfc3339())
            .with("refundChargeId", charge.id.clone())
            .with("refundFull", charge.refunded);
        refund.insert_opt("amountRefunded", charge.amount_refunded);

        let mut order = OrderUpsert::new(source);
        order.stripe_payment_intent_id = Some(payment_intent_id.clone());
        order.stripe_charge_id = Some(charge.id.clone());
        order.customer_email = charge.email();
        order.payment_status = charge.refunded.then(|| "refunded".to_string());
        order.metadata = refund;
        self.ledger.upsert_order(order).await?;

        if !charge.refunded {
            return Ok(EventReport {
                handled: true,
                payment_intent_id: Some(payment_intent_id),
                outcome: MetadataBag::new().with("outcome", "partial_refund"),
                crm_error: None,
            });
        }

        let email = existing
            .as_ref()
            .and_then(|o| o.customer_email.clone())
            .or_else(|| charge.email());
        let offer_id = existing.as_ref().and_then(|o| o.offer_id.clone());

        let (Some(email), Some(offer_id)) = (email, offer_id) else {
            tracing::warn!(payment_intent_id = %payment_intent_id, "license_service.refund_skipped");
            return Ok(EventReport {
                handled: true,
                payment_intent_id: Some(payment_intent_id),
                outcome: MetadataBag::new()
                    .with("outcome", "refunded")
                    .with("skipReason", "missing_order_context"),
                crm_error: None,
            });
        };

        let overrides = existing
            .as_ref()
            .map(|o| LicenseOverrides::from_metadata(&o.metadata))
            .unwrap_or_default();
        let settings = LicenseSettings::resolve(&offer_id, self.offers.get(&offer_id).as_ref(), &overrides);

        #[allow(clippy::cast_precision_loss)]
        let amount = charge.amount_refunded.map(|cents| cents as f64 / 100.0);
        let license = self
            .license
            .mark_license_refunded(LicenseRefund {
                event_id: ctx.event_id.clone(),
                provider: "stripe".into(),
                provider_object_id: Some(payment_intent_id.clone()),
                user_email: email.clone(),
                reason: Some("charge.refunded".into()),
                original_event_id: None,
                tier: settings.tier.clone(),
                entitlements: settings.entitlements.clone(),
                amount,
                currency: charge.currency.as_deref().map(str::to_lowercase),
            })
            .await;

        let revoke = self
            .entitlements
            .revoke(EntitlementRequest {
                metadata: MetadataBag::new()
                    .with("source", "stripe")
                    .with("offerId", offer_id.clone())
                    .with("chargeId", charge.id.clone()),
                context: GrantContext {
                    provider: Some("stripe".into()),
                    provider_event_id: Some(ctx.event_id.clone()),
                    provider_session_id: existing.as_ref().and_then(|o| o.stripe_session_id.clone()),
                },
                ..EntitlementRequest::new(email, settings.entitlements)
            })
            .await;

        tracing::info!(
            payment_intent_id = %payment_intent_id,
            offer_id = %offer_id,
            license_updated = license.is_some(),
            revoke = revoke.status(),
            "webhook.charge_refunded"
        );

        let mut outcome = MetadataBag::new()
            .with("outcome", "refunded")
            .with("revoke", revoke.status());
        outcome.insert_opt("licenseId", license.and_then(|l| l.license_id));

        Ok(EventReport {
            handled: true,
            payment_intent_id: Some(payment_intent_id),
            outcome,
            crm_error: None,
        })
    }
}
