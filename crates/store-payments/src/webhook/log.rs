//! Per-delivery webhook log bookkeeping shared by both providers.

use crate::alerts::Notifier;
use crate::error::PaymentError;
use crate::fulfillment::EventReport;
use crate::ledger::{WebhookLogEntry, WebhookLogStore, WebhookLogUpdate, WebhookStatus};
use crate::metadata::MetadataBag;

/// CRM failures on the same event before operators are paged
pub const OPS_ALERT_THRESHOLD: i64 = 3;

/// What happened to a delivery
#[derive(Clone, Debug)]
pub enum DispatchOutcome {
    Processed(EventReport),

    /// Fulfilled, but the CRM sync failed
    Degraded(EventReport),

    /// Already processed successfully
    Duplicate,

    /// No handler for the event type, or nothing actionable in it
    Ignored(EventReport),
}

impl DispatchOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processed(_) => "processed",
            Self::Degraded(_) => "degraded",
            Self::Duplicate => "duplicate",
            Self::Ignored(_) => "ignored",
        }
    }

    pub const fn report(&self) -> Option<&EventReport> {
        match self {
            Self::Processed(report) | Self::Degraded(report) | Self::Ignored(report) => Some(report),
            Self::Duplicate => None,
        }
    }
}

/// Log writes for one event. Every write is best effort.
pub(crate) struct DeliveryLog<'a> {
    store: &'a dyn WebhookLogStore,
    event_id: &'a str,
    event_type: &'a str,
}

impl<'a> DeliveryLog<'a> {
    pub(crate) fn new(store: &'a dyn WebhookLogStore, event_id: &'a str, event_type: &'a str) -> Self {
        Self {
            store,
            event_id,
            event_type,
        }
    }

    /// `true` when an earlier delivery already succeeded.
    pub(crate) async fn is_processed(&self) -> bool {
        match self.store.find_webhook_log(self.event_id).await {
            Ok(Some(entry)) => entry.status == WebhookStatus::Success,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(event_id = %self.event_id, error = %e, "webhook.log_lookup_failed");
                false
            }
        }
    }

    pub(crate) async fn pending(&self, payment_intent_id: Option<String>) {
        self.record(self.update(WebhookStatus::Pending).payment_intent(payment_intent_id))
            .await;
    }

    pub(crate) async fn failed(&self, payment_intent_id: Option<String>, error: &PaymentError) {
        tracing::error!(
            event_id = %self.event_id,
            event_type = %self.event_type,
            error = %error,
            "webhook.handler_failed"
        );
        self.record(
            self.update(WebhookStatus::Error)
                .payment_intent(payment_intent_id)
                .error(error.to_string()),
        )
        .await;
    }

    /// Record the handler outcome; page ops once CRM failures pile up.
    pub(crate) async fn complete(
        &self,
        report: EventReport,
        payment_intent_id: Option<String>,
        notifier: &dyn Notifier,
    ) -> DispatchOutcome {
        let Some(message) = report.crm_error.clone() else {
            self.record(
                self.update(WebhookStatus::Success)
                    .payment_intent(payment_intent_id)
                    .metadata(report.outcome.clone()),
            )
            .await;
            tracing::info!(
                event_id = %self.event_id,
                event_type = %self.event_type,
                handled = report.handled,
                "webhook.processed"
            );
            return if report.handled {
                DispatchOutcome::Processed(report)
            } else {
                DispatchOutcome::Ignored(report)
            };
        };

        let entry = self
            .record(
                self.update(WebhookStatus::Error)
                    .payment_intent(payment_intent_id.clone())
                    .error(message.clone())
                    .metadata(report.outcome.clone()),
            )
            .await;

        if let Some(entry) = entry.filter(|e| e.attempts >= OPS_ALERT_THRESHOLD) {
            let mut context = MetadataBag::new()
                .with("eventId", self.event_id)
                .with("attempts", entry.attempts)
                .with("message", message);
            context.insert_opt("offerId", report.outcome.get_str("offerId"));
            context.insert_opt("landerId", report.outcome.get_str("landerId"));
            context.insert_opt("paymentIntentId", payment_intent_id);
            notifier
                .ops_alert("GHL sync failed after multiple attempts", &context)
                .await;
        }
        DispatchOutcome::Degraded(report)
    }

    fn update(&self, status: WebhookStatus) -> WebhookLogUpdate {
        WebhookLogUpdate::new(self.event_id, self.event_type, status)
    }

    async fn record(&self, update: WebhookLogUpdate) -> Option<WebhookLogEntry> {
        let status = update.status;
        match self.store.record_webhook_event(update).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(
                    event_id = %self.event_id,
                    status = status.as_str(),
                    error = %e,
                    "webhook.log_write_failed"
                );
                None
            }
        }
    }
}
