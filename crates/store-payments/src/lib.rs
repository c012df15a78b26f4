//! # store-payments
//!
//! Payment fulfillment for the store: provider webhooks in, licenses,
//! entitlements, CRM records and support profiles out.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Stripe or    │────▶│  Verify and  │────▶│  Fulfillment │
//! │ PayPal event │     │  dedupe      │     │  orchestrator│
//! └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                                  │
//!        ┌───────────────┬───────────────┬─────────┴─────┬───────────────┐
//!        ▼               ▼               ▼               ▼               ▼
//!   ┌─────────┐    ┌───────────┐   ┌──────────────┐ ┌─────────┐    ┌─────────┐
//!   │ Ledger  │    │  License  │   │ Entitlements │ │   CRM   │    │ Support │
//!   └─────────┘    └───────────┘   └──────────────┘ └─────────┘    └─────────┘
//! ```
//!
//! The ledger write is the only step that can fail a delivery. Every
//! downstream call is best effort and reported back through the webhook
//! log, and repeated CRM failures page operators over Slack.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use store_payments::{Fulfillment, MemoryLedger, StaticOfferCatalog, StripeSignatureVerifier, StripeWebhookDispatcher};
//!
//! let ledger = Arc::new(MemoryLedger::new());
//! let offers = Arc::new(StaticOfferCatalog::from_env()?);
//! let dispatcher = StripeWebhookDispatcher::new(
//!     StripeSignatureVerifier::from_env(),
//!     Fulfillment::from_env(ledger.clone(), offers),
//!     ledger,
//! );
//!
//! let outcome = dispatcher.dispatch(&body, Some(signature_header)).await?;
//! ```

pub mod alerts;
pub mod crm;
pub mod entitlements;
mod env;
mod error;
pub mod fulfillment;
pub mod ledger;
pub mod license;
pub mod maintenance;
pub mod metadata;
pub mod offer;
pub mod providers;
pub mod resolve;
pub mod support;
pub mod webhook;

#[cfg(test)]
mod test_support;

pub use error::{PaymentError, Result};
pub use fulfillment::{EventReport, Fulfillment, NormalizedOrder};
pub use ledger::{CheckoutLedger, MemoryLedger, SqliteLedger, WebhookLogStore};
pub use maintenance::MaintenanceConfig;
pub use metadata::MetadataBag;
pub use offer::{OfferCatalog, OfferConfig, StaticOfferCatalog};
pub use providers::PayPalClient;
pub use webhook::{
    DispatchOutcome, PayPalWebhookHandler, StripeSignatureVerifier, StripeWebhookDispatcher, WebhookTransmission,
};
