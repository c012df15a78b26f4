//! In-memory ledger (for development and tests)

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{
    clamp_limit, new_id, CheckoutLedger, CheckoutSession, CheckoutSessionUpsert, Order,
    OrderMetadataUpdate, OrderUpsert, SessionStatus, SessionStatusUpdate, WebhookLogEntry,
    WebhookLogStore, WebhookLogUpdate, WebhookStatus,
};
use crate::error::{PaymentError, Result};

#[derive(Default)]
struct LedgerState {
    /// Keyed by provider session id
    sessions: HashMap<String, CheckoutSession>,

    /// Keyed by internal order id
    orders: HashMap<String, Order>,

    /// Keyed by event id
    webhook_logs: HashMap<String, WebhookLogEntry>,
}

/// In-memory ledger
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

fn poisoned<T>(_: PoisonError<T>) -> PaymentError {
    PaymentError::Storage("ledger lock poisoned".into())
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders
    pub fn order_count(&self) -> usize {
        self.state.read().map(|s| s.orders.len()).unwrap_or_default()
    }
}

fn merge_opt(stored: &mut Option<String>, incoming: Option<String>) {
    if incoming.is_some() {
        *stored = incoming;
    }
}

fn merge_order(order: &mut Order, input: OrderUpsert) {
    merge_opt(&mut order.checkout_session_id, input.checkout_session_id);
    merge_opt(&mut order.stripe_session_id, input.stripe_session_id);
    merge_opt(&mut order.stripe_payment_intent_id, input.stripe_payment_intent_id);
    merge_opt(&mut order.stripe_charge_id, input.stripe_charge_id);
    if input.amount_total.is_some() {
        order.amount_total = input.amount_total;
    }
    merge_opt(&mut order.currency, input.currency);
    merge_opt(&mut order.offer_id, input.offer_id);
    merge_opt(&mut order.lander_id, input.lander_id);
    merge_opt(&mut order.customer_email, input.customer_email);
    merge_opt(&mut order.customer_name, input.customer_name);
    merge_opt(&mut order.payment_status, input.payment_status);
    merge_opt(&mut order.payment_method, input.payment_method);
    order.metadata.merge(&input.metadata);
    order.source = input.source;
    order.updated_at = Utc::now();
}

impl LedgerState {
    fn order_id_for(&self, input: &OrderUpsert) -> Option<String> {
        if let Some(pi) = input.stripe_payment_intent_id.as_deref() {
            if let Some(order) = self
                .orders
                .values()
                .find(|o| o.stripe_payment_intent_id.as_deref() == Some(pi))
            {
                return Some(order.id.clone());
            }
        }

        // A row recorded before the payment intent was known is adopted.
        let session_id = input.stripe_session_id.as_deref()?;
        self.orders
            .values()
            .find(|o| {
                o.stripe_payment_intent_id.is_none()
                    && o.source == input.source
                    && o.stripe_session_id.as_deref() == Some(session_id)
            })
            .map(|o| o.id.clone())
    }
}

#[async_trait]
impl CheckoutLedger for MemoryLedger {
    async fn upsert_checkout_session(&self, input: CheckoutSessionUpsert) -> Result<String> {
        let mut state = self.state.write().map_err(poisoned)?;
        let now = Utc::now();

        // A session opened from a payment intent alone is keyed by the intent
        // id; the first checkout session carrying that intent takes it over.
        let placeholder = input.stripe_payment_intent_id.as_deref().filter(|pi| {
            *pi != input.stripe_session_id
                && !state.sessions.contains_key(&input.stripe_session_id)
                && state
                    .sessions
                    .get(*pi)
                    .is_some_and(|s| s.stripe_payment_intent_id.as_deref() == Some(*pi))
        });
        if let Some(mut session) = placeholder.and_then(|pi| state.sessions.remove(pi)) {
            session.stripe_session_id.clone_from(&input.stripe_session_id);
            state.sessions.insert(input.stripe_session_id.clone(), session);
        }

        let pi_taken = input.stripe_payment_intent_id.as_deref().is_some_and(|pi| {
            state.sessions.values().any(|s| {
                s.stripe_payment_intent_id.as_deref() == Some(pi)
                    && s.stripe_session_id != input.stripe_session_id
            })
        });
        if pi_taken {
            return Err(PaymentError::Storage(
                "payment intent already linked to another checkout session".into(),
            ));
        }

        if let Some(session) = state.sessions.get_mut(&input.stripe_session_id) {
            merge_opt(&mut session.stripe_payment_intent_id, input.stripe_payment_intent_id);
            merge_opt(&mut session.stripe_subscription_id, input.stripe_subscription_id);
            merge_opt(&mut session.offer_id, input.offer_id);
            merge_opt(&mut session.lander_id, input.lander_id);
            merge_opt(&mut session.customer_email, input.customer_email);
            session.metadata.merge(&input.metadata);
            session.status = session.status.advance(input.status);
            session.source = input.source;
            session.updated_at = now;
            return Ok(session.id.clone());
        }

        let session = CheckoutSession {
            id: new_id(),
            stripe_session_id: input.stripe_session_id.clone(),
            stripe_payment_intent_id: input.stripe_payment_intent_id,
            stripe_subscription_id: input.stripe_subscription_id,
            offer_id: input.offer_id,
            lander_id: input.lander_id,
            customer_email: input.customer_email,
            metadata: input.metadata,
            status: input.status,
            source: input.source,
            created_at: now,
            updated_at: now,
        };
        let id = session.id.clone();
        state.sessions.insert(input.stripe_session_id, session);
        Ok(id)
    }

    async fn update_checkout_session_status(
        &self,
        stripe_session_id: &str,
        status: SessionStatus,
        update: SessionStatusUpdate,
    ) -> Result<bool> {
        let mut state = self.state.write().map_err(poisoned)?;
        let Some(session) = state.sessions.get_mut(stripe_session_id) else {
            return Ok(false);
        };

        merge_opt(&mut session.stripe_payment_intent_id, update.payment_intent_id);
        merge_opt(&mut session.customer_email, update.customer_email);
        session.metadata.merge(&update.metadata);
        session.status = session.status.advance(status);
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_checkout_session_by_stripe_session_id(
        &self,
        stripe_session_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.sessions.get(stripe_session_id).cloned())
    }

    async fn find_checkout_session_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .sessions
            .values()
            .find(|s| s.stripe_payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn find_checkout_session_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.stripe_subscription_id.as_deref() == Some(subscription_id))
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn upsert_order(&self, input: OrderUpsert) -> Result<String> {
        let mut state = self.state.write().map_err(poisoned)?;

        if let Some(id) = state.order_id_for(&input) {
            if let Some(order) = state.orders.get_mut(&id) {
                merge_order(order, input);
                return Ok(id);
            }
        }

        let now = Utc::now();
        let order = Order {
            id: new_id(),
            checkout_session_id: input.checkout_session_id,
            stripe_session_id: input.stripe_session_id,
            stripe_payment_intent_id: input.stripe_payment_intent_id,
            stripe_charge_id: input.stripe_charge_id,
            amount_total: input.amount_total,
            currency: input.currency,
            offer_id: input.offer_id,
            lander_id: input.lander_id,
            customer_email: input.customer_email,
            customer_name: input.customer_name,
            metadata: input.metadata,
            payment_status: input.payment_status,
            payment_method: input.payment_method,
            source: input.source,
            created_at: now,
            updated_at: now,
        };
        let id = order.id.clone();
        state.orders.insert(id.clone(), order);
        Ok(id)
    }

    async fn update_order_metadata(&self, update: OrderMetadataUpdate) -> Result<bool> {
        let mut state = self.state.write().map_err(poisoned)?;

        let by_pi = update.payment_intent_id.as_deref().and_then(|pi| {
            state
                .orders
                .values()
                .find(|o| o.stripe_payment_intent_id.as_deref() == Some(pi))
                .map(|o| o.id.clone())
        });
        let target = by_pi.or_else(|| {
            let sid = update.stripe_session_id.as_deref()?;
            state
                .orders
                .values()
                .filter(|o| o.stripe_session_id.as_deref() == Some(sid))
                .max_by_key(|o| o.updated_at)
                .map(|o| o.id.clone())
        });

        let Some(id) = target else {
            return Ok(false);
        };
        let Some(order) = state.orders.get_mut(&id) else {
            return Ok(false);
        };
        order.metadata.merge(&update.metadata);
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_order_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Option<Order>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .orders
            .values()
            .find(|o| o.stripe_payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn find_recent_orders_by_email(&self, email: &str, limit: u32) -> Result<Vec<Order>> {
        let state = self.state.read().map_err(poisoned)?;
        let needle = email.trim().to_lowercase();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| {
                o.customer_email
                    .as_deref()
                    .is_some_and(|e| e.trim().to_lowercase() == needle)
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(clamp_limit(limit) as usize);
        Ok(orders)
    }

    async fn find_refunded_orders(&self) -> Result<Vec<Order>> {
        let state = self.state.read().map_err(poisoned)?;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.payment_status.as_deref() == Some("refunded"))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(orders)
    }

    async fn mark_stale_checkout_sessions(&self, older_than: Duration) -> Result<u64> {
        let mut state = self.state.write().map_err(poisoned)?;
        let cutoff = Utc::now() - older_than;
        let mut changed = 0;
        for session in state.sessions.values_mut() {
            if session.status == SessionStatus::Pending && session.created_at < cutoff {
                session.status = SessionStatus::Abandoned;
                session.updated_at = Utc::now();
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl WebhookLogStore for MemoryLedger {
    async fn find_webhook_log(&self, event_id: &str) -> Result<Option<WebhookLogEntry>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.webhook_logs.get(event_id).cloned())
    }

    async fn record_webhook_event(&self, update: WebhookLogUpdate) -> Result<WebhookLogEntry> {
        let mut state = self.state.write().map_err(poisoned)?;
        let now = Utc::now();

        let entry = state
            .webhook_logs
            .entry(update.event_id.clone())
            .or_insert_with(|| WebhookLogEntry {
                event_id: update.event_id.clone(),
                event_type: update.event_type.clone(),
                payment_intent_id: None,
                status: WebhookStatus::Pending,
                attempts: 0,
                last_error: None,
                metadata: crate::metadata::MetadataBag::new(),
                created_at: now,
                updated_at: now,
            });

        entry.event_type = update.event_type;
        merge_opt(&mut entry.payment_intent_id, update.payment_intent_id);
        entry.status = update.status;
        entry.attempts += update.status.attempt_increment();
        match update.status {
            WebhookStatus::Error => entry.last_error = update.error,
            WebhookStatus::Success => entry.last_error = None,
            WebhookStatus::Pending => {}
        }
        entry.metadata.merge(&update.metadata);
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn count_errored_webhook_logs_since(&self, hours: i64) -> Result<u64> {
        let state = self.state.read().map_err(poisoned)?;
        let cutoff = Utc::now() - Duration::hours(hours);
        Ok(state
            .webhook_logs
            .values()
            .filter(|e| e.status == WebhookStatus::Error && e.updated_at >= cutoff)
            .count() as u64)
    }

    async fn count_pending_webhook_logs_older_than(&self, minutes: i64) -> Result<u64> {
        let state = self.state.read().map_err(poisoned)?;
        let cutoff = Utc::now() - Duration::minutes(minutes);
        Ok(state
            .webhook_logs
            .values()
            .filter(|e| e.status == WebhookStatus::Pending && e.updated_at < cutoff)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn test_memory_ledger_contract() {
        let ledger = MemoryLedger::new();
        contract::run_all(&ledger).await;
    }

    #[tokio::test]
    async fn test_order_count() {
        let ledger = MemoryLedger::new();
        let mut order = OrderUpsert::new(super::super::PaymentSource::Stripe);
        order.stripe_payment_intent_id = Some("pi_1".into());
        ledger.upsert_order(order.clone()).await.unwrap();
        ledger.upsert_order(order).await.unwrap();
        assert_eq!(ledger.order_count(), 1);
    }
}
