//! Behaviour every ledger backend must share.

use chrono::Duration;
use serde_json::json;

use super::*;

pub async fn run_all<L: CheckoutLedger + WebhookLogStore>(ledger: &L) {
    session_upsert_merges_metadata(ledger).await;
    completed_session_never_regresses(ledger).await;
    session_lookups(ledger).await;
    intent_session_is_adopted(ledger).await;
    orders_dedupe_on_payment_intent(ledger).await;
    orders_without_payment_intent(ledger).await;
    order_metadata_updates(ledger).await;
    recent_and_refunded_orders(ledger).await;
    stale_sessions_are_abandoned(ledger).await;
    webhook_log_attempts(ledger).await;
}

async fn session_upsert_merges_metadata<L: CheckoutLedger>(ledger: &L) {
    let mut first = CheckoutSessionUpsert::new("cs_merge", SessionStatus::Pending, PaymentSource::Stripe);
    first.offer_id = Some("demo-offer".into());
    first.customer_email = Some("buyer@example.com".into());
    first.metadata = MetadataBag::new().with("landerId", "demo").with("shared", "old");
    let id = ledger.upsert_checkout_session(first).await.unwrap();

    let mut second = CheckoutSessionUpsert::new("cs_merge", SessionStatus::Completed, PaymentSource::Stripe);
    second.stripe_payment_intent_id = Some("pi_merge".into());
    second.metadata = MetadataBag::new().with("ghlSyncedAt", "2024-05-01T00:00:00Z").with("shared", "new");
    let id_again = ledger.upsert_checkout_session(second).await.unwrap();
    assert_eq!(id, id_again);

    let session = ledger
        .find_checkout_session_by_stripe_session_id("cs_merge")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.offer_id.as_deref(), Some("demo-offer"));
    assert_eq!(session.customer_email.as_deref(), Some("buyer@example.com"));
    assert_eq!(session.stripe_payment_intent_id.as_deref(), Some("pi_merge"));
    assert_eq!(session.metadata.get_str("landerId").as_deref(), Some("demo"));
    assert_eq!(session.metadata.get_str("ghlSyncedAt").as_deref(), Some("2024-05-01T00:00:00Z"));
    assert_eq!(session.metadata.get_str("shared").as_deref(), Some("new"));
}

async fn completed_session_never_regresses<L: CheckoutLedger>(ledger: &L) {
    let upsert = CheckoutSessionUpsert::new("cs_sticky", SessionStatus::Completed, PaymentSource::Stripe);
    ledger.upsert_checkout_session(upsert).await.unwrap();

    let replay = CheckoutSessionUpsert::new("cs_sticky", SessionStatus::Pending, PaymentSource::Stripe);
    ledger.upsert_checkout_session(replay).await.unwrap();

    let updated = ledger
        .update_checkout_session_status(
            "cs_sticky",
            SessionStatus::Failed,
            SessionStatusUpdate {
                metadata: MetadataBag::new().with("lastPaymentError", "late notice"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated);

    let session = ledger
        .find_checkout_session_by_stripe_session_id("cs_sticky")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.metadata.get_str("lastPaymentError").as_deref(), Some("late notice"));

    let missing = ledger
        .update_checkout_session_status("cs_missing", SessionStatus::Failed, SessionStatusUpdate::default())
        .await
        .unwrap();
    assert!(!missing);
}

async fn session_lookups<L: CheckoutLedger>(ledger: &L) {
    let mut upsert = CheckoutSessionUpsert::new("cs_lookup", SessionStatus::Pending, PaymentSource::Stripe);
    upsert.stripe_payment_intent_id = Some("pi_lookup".into());
    upsert.stripe_subscription_id = Some("sub_lookup".into());
    ledger.upsert_checkout_session(upsert).await.unwrap();

    let by_pi = ledger
        .find_checkout_session_by_payment_intent_id("pi_lookup")
        .await
        .unwrap();
    assert_eq!(by_pi.map(|s| s.stripe_session_id).as_deref(), Some("cs_lookup"));

    let by_sub = ledger
        .find_checkout_session_by_subscription_id("sub_lookup")
        .await
        .unwrap();
    assert_eq!(by_sub.map(|s| s.stripe_session_id).as_deref(), Some("cs_lookup"));

    assert!(ledger
        .find_checkout_session_by_payment_intent_id("pi_unknown")
        .await
        .unwrap()
        .is_none());
}

async fn intent_session_is_adopted<L: CheckoutLedger>(ledger: &L) {
    let mut opened = CheckoutSessionUpsert::new("pi_early", SessionStatus::Completed, PaymentSource::Stripe);
    opened.stripe_payment_intent_id = Some("pi_early".into());
    opened.metadata = MetadataBag::new().with("providerPaymentId", "pi_early");
    let id = ledger.upsert_checkout_session(opened).await.unwrap();

    let mut checkout = CheckoutSessionUpsert::new("cs_late", SessionStatus::Completed, PaymentSource::Stripe);
    checkout.stripe_payment_intent_id = Some("pi_early".into());
    checkout.offer_id = Some("demo-offer".into());
    assert_eq!(ledger.upsert_checkout_session(checkout).await.unwrap(), id);

    let session = ledger
        .find_checkout_session_by_payment_intent_id("pi_early")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.stripe_session_id, "cs_late");
    assert_eq!(session.offer_id.as_deref(), Some("demo-offer"));
    assert_eq!(session.metadata.get_str("providerPaymentId").as_deref(), Some("pi_early"));
    assert!(ledger
        .find_checkout_session_by_stripe_session_id("pi_early")
        .await
        .unwrap()
        .is_none());

    // A real checkout session is never taken over.
    let mut other = CheckoutSessionUpsert::new("cs_other", SessionStatus::Pending, PaymentSource::Stripe);
    other.stripe_payment_intent_id = Some("pi_early".into());
    assert!(ledger.upsert_checkout_session(other).await.is_err());
}

async fn orders_dedupe_on_payment_intent<L: CheckoutLedger>(ledger: &L) {
    let mut order = OrderUpsert::new(PaymentSource::Stripe);
    order.stripe_payment_intent_id = Some("pi_order".into());
    order.amount_total = Some(9900);
    order.currency = Some("usd".into());
    order.customer_email = Some("dedupe@example.com".into());
    order.payment_status = Some("paid".into());
    order.metadata = MetadataBag::new().with("offerId", "demo-offer");
    let first = ledger.upsert_order(order).await.unwrap();

    let mut backfill = OrderUpsert::new(PaymentSource::Stripe);
    backfill.stripe_payment_intent_id = Some("pi_order".into());
    backfill.stripe_charge_id = Some("ch_order".into());
    backfill.metadata = MetadataBag::new().with("receiptNumber", "1234");
    let second = ledger.upsert_order(backfill).await.unwrap();
    assert_eq!(first, second);

    let stored = ledger.find_order_by_payment_intent_id("pi_order").await.unwrap().unwrap();
    assert_eq!(stored.amount_total, Some(9900));
    assert_eq!(stored.payment_status.as_deref(), Some("paid"));
    assert_eq!(stored.stripe_charge_id.as_deref(), Some("ch_order"));
    assert_eq!(stored.metadata.get_str("offerId").as_deref(), Some("demo-offer"));
    assert_eq!(stored.metadata.get_str("receiptNumber").as_deref(), Some("1234"));

    let orders = ledger.find_recent_orders_by_email("dedupe@example.com", 10).await.unwrap();
    assert_eq!(orders.len(), 1);
}

async fn orders_without_payment_intent<L: CheckoutLedger>(ledger: &L) {
    let mut capture = OrderUpsert::new(PaymentSource::Paypal);
    capture.stripe_session_id = Some("paypal_ORDER1".into());
    capture.customer_email = Some("nopi@example.com".into());
    capture.payment_status = Some("COMPLETED".into());
    let first = ledger.upsert_order(capture.clone()).await.unwrap();
    let again = ledger.upsert_order(capture).await.unwrap();
    assert_eq!(first, again);

    let mut with_pi = OrderUpsert::new(PaymentSource::Paypal);
    with_pi.stripe_session_id = Some("paypal_ORDER1".into());
    with_pi.stripe_payment_intent_id = Some("CAPTURE1".into());
    let adopted = ledger.upsert_order(with_pi).await.unwrap();
    assert_eq!(first, adopted);

    let mut anonymous = OrderUpsert::new(PaymentSource::Paypal);
    anonymous.customer_email = Some("nopi@example.com".into());
    ledger.upsert_order(anonymous.clone()).await.unwrap();
    ledger.upsert_order(anonymous).await.unwrap();

    let orders = ledger.find_recent_orders_by_email("nopi@example.com", 10).await.unwrap();
    assert_eq!(orders.len(), 3);
}

async fn order_metadata_updates<L: CheckoutLedger>(ledger: &L) {
    let mut order = OrderUpsert::new(PaymentSource::Stripe);
    order.stripe_payment_intent_id = Some("pi_meta".into());
    order.stripe_session_id = Some("cs_meta".into());
    ledger.upsert_order(order).await.unwrap();

    let by_session = ledger
        .update_order_metadata(OrderMetadataUpdate {
            payment_intent_id: Some("pi_other".into()),
            stripe_session_id: Some("cs_meta".into()),
            metadata: MetadataBag::from_json(json!({ "license": { "licenseKey": "KEY-1" } })),
        })
        .await
        .unwrap();
    assert!(by_session);

    let stored = ledger.find_order_by_payment_intent_id("pi_meta").await.unwrap().unwrap();
    assert_eq!(stored.metadata.get("license"), Some(&json!({ "licenseKey": "KEY-1" })));

    let none = ledger
        .update_order_metadata(OrderMetadataUpdate {
            payment_intent_id: Some("pi_nowhere".into()),
            stripe_session_id: None,
            metadata: MetadataBag::new().with("x", 1),
        })
        .await
        .unwrap();
    assert!(!none);
}

async fn recent_and_refunded_orders<L: CheckoutLedger>(ledger: &L) {
    for i in 0..3 {
        let mut order = OrderUpsert::new(PaymentSource::Stripe);
        order.stripe_payment_intent_id = Some(format!("pi_recent_{i}"));
        order.customer_email = Some("Recent@Example.com".into());
        if i == 1 {
            order.payment_status = Some("refunded".into());
        }
        ledger.upsert_order(order).await.unwrap();
    }

    let limited = ledger.find_recent_orders_by_email("recent@example.com", 2).await.unwrap();
    assert_eq!(limited.len(), 2);

    let at_least_one = ledger.find_recent_orders_by_email("recent@example.com", 0).await.unwrap();
    assert_eq!(at_least_one.len(), 1);

    let refunded = ledger.find_refunded_orders().await.unwrap();
    assert!(refunded
        .iter()
        .any(|o| o.stripe_payment_intent_id.as_deref() == Some("pi_recent_1")));
}

async fn stale_sessions_are_abandoned<L: CheckoutLedger>(ledger: &L) {
    let pending = CheckoutSessionUpsert::new("cs_stale", SessionStatus::Pending, PaymentSource::Stripe);
    ledger.upsert_checkout_session(pending).await.unwrap();

    assert_eq!(ledger.mark_stale_checkout_sessions(Duration::hours(24)).await.unwrap(), 0);

    // A negative window puts the cutoff in the future so every pending row qualifies.
    let changed = ledger
        .mark_stale_checkout_sessions(Duration::seconds(-5))
        .await
        .unwrap();
    assert!(changed >= 1);

    let stale = ledger
        .find_checkout_session_by_stripe_session_id("cs_stale")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale.status, SessionStatus::Abandoned);

    let completed = ledger
        .find_checkout_session_by_stripe_session_id("cs_sticky")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, SessionStatus::Completed);
}

async fn webhook_log_attempts<L: WebhookLogStore>(ledger: &L) {
    let pending = WebhookLogUpdate::new("evt_log", "checkout.session.completed", WebhookStatus::Pending)
        .payment_intent(Some("pi_log".into()));
    let entry = ledger.record_webhook_event(pending).await.unwrap();
    assert_eq!(entry.attempts, 0);
    assert_eq!(entry.status, WebhookStatus::Pending);

    let failed = WebhookLogUpdate::new("evt_log", "checkout.session.completed", WebhookStatus::Error)
        .error("ghl timeout")
        .metadata(MetadataBag::new().with("stage", "crm"));
    let entry = ledger.record_webhook_event(failed.clone()).await.unwrap();
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.last_error.as_deref(), Some("ghl timeout"));
    assert_eq!(entry.payment_intent_id.as_deref(), Some("pi_log"));

    let entry = ledger.record_webhook_event(failed).await.unwrap();
    assert_eq!(entry.attempts, 2);
    assert_eq!(ledger.count_errored_webhook_logs_since(1).await.unwrap(), 1);

    let ok = WebhookLogUpdate::new("evt_log", "checkout.session.completed", WebhookStatus::Success);
    let entry = ledger.record_webhook_event(ok).await.unwrap();
    assert_eq!(entry.attempts, 3);
    assert!(entry.last_error.is_none());
    assert_eq!(entry.metadata.get_str("stage").as_deref(), Some("crm"));

    let found = ledger.find_webhook_log("evt_log").await.unwrap().unwrap();
    assert_eq!(found.status, WebhookStatus::Success);
    assert!(ledger.find_webhook_log("evt_none").await.unwrap().is_none());

    ledger
        .record_webhook_event(WebhookLogUpdate::new("evt_waiting", "payment_intent.succeeded", WebhookStatus::Pending))
        .await
        .unwrap();
    assert_eq!(ledger.count_pending_webhook_logs_older_than(5).await.unwrap(), 0);
    assert_eq!(ledger.count_pending_webhook_logs_older_than(-5).await.unwrap(), 1);
}
