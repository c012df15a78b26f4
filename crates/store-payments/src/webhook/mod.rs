//! Webhook Verifier & Dispatcher
//!
//! Provider deliveries enter here. Signatures are checked before anything
//! touches the ledger, deliveries are deduplicated on the provider event id,
//! and each event type is routed to its fulfillment handler.

mod dispatcher;
mod event;
mod log;
pub mod paypal;
mod signature;

pub use dispatcher::StripeWebhookDispatcher;
pub use event::{
    ChargeObject, CheckoutSessionObject, DisputeObject, EventKind, Expandable, InvoiceLine, InvoiceObject,
    PaymentIntentObject, StripeEvent, SubscriptionObject,
};
pub use log::{DispatchOutcome, OPS_ALERT_THRESHOLD};
pub use paypal::{PayPalEvent, PayPalWebhookHandler, TRANSMISSION_HEADERS, normalize_paypal_event};
pub use crate::providers::paypal::WebhookTransmission;
pub use signature::{TOLERANCE_SECS, StripeSignatureVerifier, VerifiedEvent, sign};
