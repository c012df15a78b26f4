//! Application State

use std::sync::Arc;

use store_payments::{PayPalWebhookHandler, StripeWebhookDispatcher};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub stripe: Arc<StripeWebhookDispatcher>,

    /// Unset when the deployment takes no PayPal payments
    pub paypal: Option<Arc<PayPalWebhookHandler>>,
}
