use async_trait::async_trait;
use serde_json::Value;

use super::client::{ContactUpsert, GhlClient, Opportunity};
use super::contacts::{self, CustomFieldInput};
use super::history;
use super::{CrmSync, SyncContext, SyncOutcome, SyncRetryPolicy, is_retryable};
use crate::error::Result;
use crate::offer::GhlOfferConfig;
use crate::resolve::normalize_email;

const DEFAULT_SOURCE: &str = "Stripe Checkout";

impl GhlClient {
    async fn existing_purchase_metadata(&self, email: &str, field_id: &str) -> Option<Value> {
        let normalized = normalize_email(email)?;
        let found = self.search_contacts(&normalized).await;
        let contact = contacts::select_preferred_contact(&found, &normalized)?;
        contacts::extract_custom_field(contact, field_id)
    }
}

#[async_trait]
impl CrmSync for GhlClient {
    async fn sync_order(&self, offer: Option<&GhlOfferConfig>, context: &SyncContext) -> Result<Option<SyncOutcome>> {
        let Some(offer) = offer else {
            tracing::debug!(offer_id = %context.offer_id, "ghl.skip_no_config");
            return Ok(None);
        };
        if !self.config().is_configured() {
            tracing::warn!(offer_id = %context.offer_id, "ghl.skip_missing_credentials");
            return Ok(None);
        }
        if context.customer_email.trim().is_empty() {
            tracing::warn!(offer_id = %context.offer_id, "ghl.skip_missing_email");
            return Ok(None);
        }

        let mut values = context.template_values();
        let field_ids = self.resolve_contact_field_ids(&offer.contact_custom_field_ids).await;

        let mut purchase_metadata = history::build_purchase_metadata(context);
        if let (Some(latest), Some(field_id)) = (&purchase_metadata, field_ids.get("purchaseMetadataJson")) {
            let existing = self.existing_purchase_metadata(&context.customer_email, field_id).await;
            let merged = history::merge_history(existing.as_ref(), latest);
            if &merged != latest {
                tracing::debug!(
                    offer_id = %context.offer_id,
                    previous_count = existing.as_ref().map_or(0, |v| history::collect_entries(v).len()),
                    "ghl.purchase_metadata_history_appended"
                );
            }
            purchase_metadata = Some(merged);
        }
        if let Some(json) = purchase_metadata {
            values.insert("purchaseMetadataJson".into(), json.into());
        }
        if let Some(json) = history::build_license_keys_payload(context) {
            values.insert("licenseKeysJson".into(), json.into());
        }

        let mut custom_fields = contacts::build_custom_fields(&field_ids, &values);
        if let (Some(field_id), Some(affiliate)) =
            (&self.config().affiliate_field_id, context.metadata.get_str("affiliateId"))
        {
            custom_fields.push(CustomFieldInput {
                id: field_id.clone(),
                value: affiliate.into(),
            });
        }

        let (first_name, last_name) = contacts::split_name(context.customer_name.as_deref());
        let source = offer.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.into());
        let contact_id = self
            .upsert_contact(&ContactUpsert {
                email: context.customer_email.clone(),
                first_name: first_name.clone(),
                last_name: last_name.clone(),
                phone: context.customer_phone.clone(),
                source: Some(source.clone()),
                tags: offer.tag_ids.clone(),
                custom_fields,
            })
            .await?;

        let Some(contact_id) = contact_id else {
            tracing::warn!(
                offer_id = %context.offer_id,
                email = %context.customer_email,
                "ghl.contact_missing_id"
            );
            return Ok(None);
        };

        tracing::info!(
            offer_id = %context.offer_id,
            stripe_payment_intent_id = ?context.stripe_payment_intent_id,
            email = %context.customer_email,
            contact_id = %contact_id,
            "ghl.contact_upserted"
        );

        let opportunity_created = match (&offer.pipeline_id, &offer.stage_id) {
            (Some(pipeline_id), Some(stage_id)) => {
                let mut name_values = values.clone();
                if let Some(first) = &first_name {
                    name_values.insert("contactFirstName".into(), first.clone().into());
                }
                if let Some(last) = &last_name {
                    name_values.insert("contactLastName".into(), last.clone().into());
                }
                let name = contacts::render_template(
                    offer.opportunity_name_template.as_deref(),
                    &name_values,
                    &format!("{} Purchase", context.offer_name),
                );

                let mut opportunity_values = values.clone();
                opportunity_values.insert("contactId".into(), contact_id.clone().into());

                #[allow(clippy::cast_precision_loss)]
                let monetary_value = context.amount_total.map(|cents| (cents as f64 / 100.0).max(0.0));

                self.create_opportunity(&Opportunity {
                    contact_id: contact_id.clone(),
                    pipeline_id: pipeline_id.clone(),
                    stage_id: stage_id.clone(),
                    name,
                    monetary_value,
                    currency: context.currency.clone().unwrap_or_else(|| "USD".into()),
                    status: Some(offer.status.clone().unwrap_or_else(|| "open".into())),
                    source: Some(source),
                    tags: offer.tag_ids.clone(),
                    custom_fields: contacts::build_custom_fields(
                        &offer.opportunity_custom_field_ids,
                        &opportunity_values,
                    ),
                })
                .await?;

                tracing::info!(
                    offer_id = %context.offer_id,
                    contact_id = %contact_id,
                    pipeline_id = %pipeline_id,
                    stage_id = %stage_id,
                    "ghl.opportunity_created"
                );
                true
            }
            _ => {
                tracing::debug!(
                    offer_id = %context.offer_id,
                    reason = "missing_pipeline_or_stage",
                    "ghl.skip_opportunity_creation"
                );
                false
            }
        };

        for workflow_id in offer.workflow_ids.iter().filter(|id| !id.is_empty()) {
            if let Err(e) = self.trigger_workflow(workflow_id, &contact_id).await {
                tracing::error!(
                    workflow_id = %workflow_id,
                    contact_id = %contact_id,
                    error = %e,
                    "ghl.trigger_workflow_failed"
                );
            }
        }

        Ok(Some(SyncOutcome {
            contact_id,
            opportunity_created,
        }))
    }
}

/// Run a full sync, retrying transient failures with doubling delay.
///
/// Non-retryable errors are returned immediately; the last error is
/// returned once `policy.max_attempts` is reached.
pub async fn sync_with_retry(
    sync: &dyn CrmSync,
    offer: Option<&GhlOfferConfig>,
    context: &SyncContext,
    policy: SyncRetryPolicy,
) -> Result<Option<SyncOutcome>> {
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;

    loop {
        match sync.sync_order(offer, context).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    offer_id = %context.offer_id,
                    payment_intent_id = ?context.stripe_payment_intent_id,
                    error = %e,
                    "ghl.sync_retry"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::crm::GhlConfig;
    use crate::error::PaymentError;
    use crate::test_support::serve;

    struct Scripted {
        results: Mutex<Vec<Result<Option<SyncOutcome>>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(results: Vec<Result<Option<SyncOutcome>>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CrmSync for Scripted {
        async fn sync_order(&self, _: Option<&GhlOfferConfig>, _: &SyncContext) -> Result<Option<SyncOutcome>> {
            *self.calls.lock().unwrap() += 1;
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                match &results[0] {
                    Ok(outcome) => Ok(outcome.clone()),
                    Err(PaymentError::Http { status, body }) => Err(PaymentError::Http {
                        status: *status,
                        body: body.clone(),
                    }),
                    Err(e) => Err(PaymentError::Downstream(e.to_string())),
                }
            }
        }
    }

    fn policy() -> SyncRetryPolicy {
        SyncRetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
        }
    }

    fn unavailable() -> PaymentError {
        PaymentError::Http {
            status: 503,
            body: "body".into(),
        }
    }

    fn ctx() -> SyncContext {
        SyncContext {
            offer_id: "demo-offer".into(),
            offer_name: "Demo Offer".into(),
            customer_email: "buyer@example.com".into(),
            stripe_payment_intent_id: Some("pi_test_123".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let outcome = SyncOutcome {
            contact_id: "contact_123".into(),
            opportunity_created: false,
        };
        let sync = Scripted::new(vec![Err(unavailable()), Ok(Some(outcome.clone()))]);
        let result = sync_with_retry(&sync, None, &ctx(), policy()).await.unwrap();
        assert_eq!(result, Some(outcome));
        assert_eq!(sync.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let sync = Scripted::new(vec![Err(PaymentError::Downstream("bad request".into()))]);
        assert!(sync_with_retry(&sync, None, &ctx(), policy()).await.is_err());
        assert_eq!(sync.calls(), 1);
    }

    #[tokio::test]
    async fn test_stops_after_max_attempts() {
        let sync = Scripted::new(vec![Err(unavailable())]);
        let err = sync_with_retry(&sync, None, &ctx(), policy()).await.unwrap_err();
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(sync.calls(), 3);
    }

    #[derive(Default)]
    struct Recorded {
        upserts: Vec<serde_json::Value>,
        opportunities: Vec<serde_json::Value>,
        workflows: Vec<String>,
    }

    type Shared = Arc<Mutex<Recorded>>;

    fn crm_router(state: Shared) -> Router {
        async fn upsert(State(state): State<Shared>, Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            state.lock().unwrap().upserts.push(body);
            Json(json!({ "contact": { "id": "contact_123" } }))
        }
        async fn search() -> Json<serde_json::Value> {
            Json(json!({ "contacts": [{
                "id": "contact_123",
                "email": "buyer@example.com",
                "customFields": [{ "id": "fld_meta", "value": json!({
                    "product": { "id": "older-offer" },
                    "payment": { "stripePaymentIntentId": "pi_old" },
                }).to_string() }],
            }]}))
        }
        async fn opportunity(State(state): State<Shared>, Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            state.lock().unwrap().opportunities.push(body);
            Json(json!({}))
        }
        async fn workflow(
            State(state): State<Shared>,
            axum::extract::Path((_, workflow)): axum::extract::Path<(String, String)>,
        ) -> Json<serde_json::Value> {
            state.lock().unwrap().workflows.push(workflow);
            Json(json!({}))
        }

        Router::new()
            .route("/contacts/upsert", post(upsert))
            .route("/contacts/search", post(search))
            .route("/opportunities/", post(opportunity))
            .route("/contacts/{contact}/workflow/{workflow}", post(workflow))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_sync_order_against_crm() {
        let state = Shared::default();
        let base = serve(crm_router(state.clone())).await;
        let client = GhlClient::new(GhlConfig {
            base_url: base,
            location_id: Some("loc_1".into()),
            token: Some("pat".into()),
            purchase_metadata_field: Some("fld_meta".into()),
            license_keys_field: Some("fld_keys".into()),
            ..Default::default()
        });

        let offer = GhlOfferConfig {
            pipeline_id: Some("pipe_1".into()),
            stage_id: Some("stage_1".into()),
            tag_ids: vec!["buyer".into()],
            workflow_ids: vec!["wf_1".into(), String::new()],
            opportunity_name_template: Some("{{offerName}} for {{contactFirstName}}".into()),
            contact_custom_field_ids: HashMap::from([("offerId".to_string(), "fld_offer".to_string())]),
            ..Default::default()
        };
        let context = SyncContext {
            customer_name: Some("Ada Lovelace".into()),
            amount_total: Some(9900),
            license_key: Some("KEY-1".into()),
            license_entitlements: vec!["demo-offer".into()],
            ..ctx()
        };

        let outcome = client.sync_order(Some(&offer), &context).await.unwrap().unwrap();
        assert_eq!(outcome.contact_id, "contact_123");
        assert!(outcome.opportunity_created);

        let recorded = state.lock().unwrap();
        let upsert = &recorded.upserts[0];
        assert_eq!(upsert["firstName"], "Ada");
        assert_eq!(upsert["source"], "Stripe Checkout");
        assert_eq!(upsert["tags"], json!(["buyer"]));

        let fields = upsert["customFields"].as_array().unwrap();
        let meta = fields.iter().find(|f| f["id"] == "fld_meta").unwrap();
        let meta: serde_json::Value = serde_json::from_str(meta["value"].as_str().unwrap()).unwrap();
        assert_eq!(meta["payment"]["stripePaymentIntentId"], "pi_test_123");
        assert_eq!(meta["previousPurchases"][0]["product"]["id"], "older-offer");
        assert!(fields.iter().any(|f| f["id"] == "fld_keys"));
        assert!(fields.iter().any(|f| f["id"] == "fld_offer" && f["value"] == "demo-offer"));

        let opportunity = &recorded.opportunities[0];
        assert_eq!(opportunity["name"], "Demo Offer for Ada");
        assert_eq!(opportunity["monetaryValue"], 99.0);
        assert_eq!(opportunity["currency"], "USD");
        assert_eq!(opportunity["status"], "open");

        assert_eq!(recorded.workflows, vec!["wf_1".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_skips_without_offer_or_credentials() {
        let client = GhlClient::new(GhlConfig::default());
        assert!(client.sync_order(None, &ctx()).await.unwrap().is_none());
        assert!(
            client
                .sync_order(Some(&GhlOfferConfig::default()), &ctx())
                .await
                .unwrap()
                .is_none()
        );
    }
}
