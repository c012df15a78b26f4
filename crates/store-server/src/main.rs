//! store-server
//!
//! Receives Stripe and PayPal webhooks and runs them through the
//! fulfillment pipeline.

mod handlers;
mod state;

use std::path::Path;
use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use store_payments::ledger::{CheckoutLedger, WebhookLogStore};
use store_payments::providers::PayPalMode;
use store_payments::providers::paypal::CredentialField;
use store_payments::{
    Fulfillment, MaintenanceConfig, MemoryLedger, PayPalClient, PayPalWebhookHandler, SqliteLedger,
    StaticOfferCatalog, StripeSignatureVerifier, StripeWebhookDispatcher,
};

use crate::state::AppState;

type Ledgers = (Arc<dyn CheckoutLedger>, Arc<dyn WebhookLogStore>);

fn shared<L: CheckoutLedger + WebhookLogStore + 'static>(ledger: L) -> Ledgers {
    let ledger = Arc::new(ledger);
    (ledger.clone(), ledger)
}

/// `DATABASE_URL` selects the SQLite ledger; otherwise state lives in memory.
async fn open_ledger() -> anyhow::Result<Ledgers> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("ledger.in_memory");
        return Ok(shared(MemoryLedger::new()));
    };

    let ledger = if url.starts_with("sqlite:") {
        SqliteLedger::connect(&url).await?
    } else {
        SqliteLedger::open(Path::new(&url)).await?
    };
    Ok(shared(ledger))
}

fn paypal_handler(
    fulfillment: &Fulfillment,
    log: &Arc<dyn WebhookLogStore>,
    maintenance: MaintenanceConfig,
) -> Option<PayPalWebhookHandler> {
    let client = PayPalClient::from_env();
    let credentials = client.credentials();
    let configured = [PayPalMode::Live, PayPalMode::Test]
        .into_iter()
        .any(|mode| credentials.resolve(None, CredentialField::ClientId, mode).is_some());
    if !configured {
        tracing::warn!("paypal.not_configured");
        return None;
    }

    Some(
        PayPalWebhookHandler::from_client(Arc::new(client), fulfillment.clone(), log.clone())
            .with_maintenance(maintenance),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (ledger, webhook_log) = open_ledger().await?;

    let offers = StaticOfferCatalog::from_env()?;
    if offers.is_empty() {
        tracing::warn!("offers.catalog_empty");
    } else {
        tracing::info!(offers = offers.len(), "offers.catalog_loaded");
    }

    let fulfillment = Fulfillment::from_env(ledger, Arc::new(offers));
    let maintenance = MaintenanceConfig::from_env();

    let verifier = StripeSignatureVerifier::from_env();
    if verifier.is_empty() {
        tracing::warn!("stripe.webhook_secret_missing");
    }

    let paypal = paypal_handler(&fulfillment, &webhook_log, maintenance).map(Arc::new);
    let stripe = StripeWebhookDispatcher::new(verifier, fulfillment, webhook_log).with_maintenance(maintenance);

    let state = AppState {
        stripe: Arc::new(stripe),
        paypal,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(%addr, "server.listening");
    tracing::info!("  GET  /health");
    tracing::info!("  POST /webhook/stripe");
    tracing::info!("  POST /webhook/paypal");

    axum::serve(listener, app).await?;

    Ok(())
}
