//! HTTP Handlers

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde::Serialize;

use store_payments::{DispatchOutcome, PaymentError, WebhookTransmission};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub paypal_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ReceivedResponse {
    pub received: bool,
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn reject(error: &PaymentError) -> HandlerError {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (message, code) = match error {
        PaymentError::InvalidSignature(_) => (error.user_message(), "INVALID_SIGNATURE"),
        PaymentError::WebhookParse(_) => (error.user_message(), "INVALID_PAYLOAD"),
        _ => ("Failed to process event", "WEBHOOK_ERROR"),
    };
    if status.is_client_error() {
        tracing::warn!(error = %error, "webhook.rejected");
    } else {
        tracing::error!(error = %error, "webhook.failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code,
        }),
    )
}

fn received(outcome: &DispatchOutcome) -> Json<ReceivedResponse> {
    Json(ReceivedResponse {
        received: true,
        outcome: outcome.as_str(),
    })
}

// ============================================================================
// Routes
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhook/stripe", post(stripe_webhook))
        .route("/webhook/paypal", post(paypal_webhook))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        paypal_enabled: state.paypal.is_some(),
    })
}

/// Stripe webhook endpoint. Signature and payload problems answer 400 so
/// Stripe stops retrying; anything else answers 500 so it retries.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ReceivedResponse>, HandlerError> {
    let signature = headers.get("stripe-signature").and_then(|v| v.to_str().ok());

    let outcome = state
        .stripe
        .dispatch(&body, signature)
        .await
        .map_err(|e| reject(&e))?;

    Ok(received(&outcome))
}

/// PayPal webhook endpoint
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ReceivedResponse>, HandlerError> {
    let handler = state.paypal.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "PayPal not configured".into(),
                code: "PAYPAL_DISABLED",
            }),
        )
    })?;

    let transmission = WebhookTransmission::from_headers(|name| headers.get(name).and_then(|v| v.to_str().ok()));
    let outcome = handler
        .handle(&transmission, &body)
        .await
        .map_err(|e| reject(&e))?;

    Ok(received(&outcome))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use store_payments::ledger::WebhookStatus;
    use store_payments::providers::StripeMode;
    use store_payments::webhook::sign;
    use store_payments::{
        Fulfillment, MemoryLedger, StaticOfferCatalog, StripeSignatureVerifier, StripeWebhookDispatcher,
        WebhookLogStore,
    };
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "whsec_server_test";

    fn app(ledger: &Arc<MemoryLedger>) -> Router {
        let fulfillment = Fulfillment::from_env(ledger.clone(), Arc::new(StaticOfferCatalog::default()));
        let dispatcher = StripeWebhookDispatcher::new(
            StripeSignatureVerifier::new().with_secret(SECRET, StripeMode::Test, None),
            fulfillment,
            ledger.clone(),
        );
        router(AppState {
            stripe: Arc::new(dispatcher),
            paypal: None,
        })
    }

    fn customer_event() -> String {
        json!({
            "id": "evt_server_1",
            "type": "customer.created",
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_signed_delivery_is_acknowledged() {
        let ledger = Arc::new(MemoryLedger::new());
        let payload = customer_event();
        let header = sign(SECRET, &payload, chrono_now()).unwrap();

        let response = app(&ledger)
            .oneshot(
                Request::post("/webhook/stripe")
                    .header("stripe-signature", header)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["received"], json!(true));
        assert_eq!(body["outcome"], json!("ignored"));

        let entry = ledger.find_webhook_log("evt_server_1").await.unwrap().unwrap();
        assert_eq!(entry.status, WebhookStatus::Success);
    }

    #[tokio::test]
    async fn test_unsigned_delivery_is_rejected() {
        let ledger = Arc::new(MemoryLedger::new());

        let response = app(&ledger)
            .oneshot(
                Request::post("/webhook/stripe")
                    .body(Body::from(customer_event()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], json!("INVALID_SIGNATURE"));
        assert!(ledger.find_webhook_log("evt_server_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paypal_route_without_handler() {
        let ledger = Arc::new(MemoryLedger::new());

        let response = app(&ledger)
            .oneshot(
                Request::post("/webhook/paypal")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let ledger = Arc::new(MemoryLedger::new());

        let response = app(&ledger)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["paypal_enabled"], json!(false));
    }

    fn chrono_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .try_into()
            .unwrap()
    }
}
