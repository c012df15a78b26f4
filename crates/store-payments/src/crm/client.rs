//! CRM HTTP client

use std::collections::HashMap;

use reqwest::Method;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use super::contacts::{
    self, CustomFieldInput, DEFAULT_LICENSE_KEYS_FIELD_KEY, DEFAULT_PURCHASE_METADATA_FIELD_KEY,
};
use super::{GhlConfig, RETRYABLE_STATUS_CODES};
use crate::error::{PaymentError, Result};

/// Contact upsert body
#[derive(Clone, Debug, Default)]
pub struct ContactUpsert {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub custom_fields: Vec<CustomFieldInput>,
}

/// Opportunity creation body
#[derive(Clone, Debug, Default)]
pub struct Opportunity {
    pub contact_id: String,
    pub pipeline_id: String,
    pub stage_id: String,
    pub name: String,
    pub monetary_value: Option<f64>,
    pub currency: String,
    pub status: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub custom_fields: Vec<CustomFieldInput>,
}

#[derive(Default)]
struct FieldCatalogue {
    by_key: HashMap<String, String>,
}

/// Location-scoped CRM client
pub struct GhlClient {
    http: reqwest::Client,
    config: GhlConfig,
    fields: RwLock<Option<FieldCatalogue>>,
}

impl GhlClient {
    pub fn new(config: GhlConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            fields: RwLock::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self::new(GhlConfig::from_env())
    }

    pub const fn config(&self) -> &GhlConfig {
        &self.config
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        match (self.config.token.as_deref(), self.config.location_id.as_deref()) {
            (Some(token), Some(location)) => Ok((token, location)),
            _ => Err(PaymentError::Config(
                "GHL credentials are not fully configured. Set GHL_PAT_LOCATION (or GHL_API_TOKEN) and GHL_LOCATION_ID."
                    .into(),
            )),
        }
    }

    /// Send a request, retrying retryable statuses with doubling delay.
    async fn request(&self, method: Method, path: &str, query: &[(&str, &str)], body: Option<&Value>) -> Result<Value> {
        let (token, _) = self.credentials()?;
        let url = format!("{}{path}", self.config.base_url);
        let max_attempts = self.config.request_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(token)
                .header("Version", &self.config.api_version)
                .header("Accept", "application/json")
                .timeout(self.config.request_timeout);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status().as_u16();
            if response.status().is_success() {
                let text = response.text().await?;
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&text).map_err(|e| PaymentError::Downstream(e.to_string()));
            }

            if RETRYABLE_STATUS_CODES.contains(&status) && attempt < max_attempts {
                let delay = self.config.request_base_delay * 2_u32.pow(attempt - 1);
                tracing::warn!(
                    attempt,
                    status,
                    path,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "ghl.request_retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Http { status, body });
        }
    }

    /// Upsert a contact by email and return its id.
    pub async fn upsert_contact(&self, params: &ContactUpsert) -> Result<Option<String>> {
        let (_, location) = self.credentials()?;
        let mut body = json!({ "locationId": location, "email": params.email });
        if let Some(object) = body.as_object_mut() {
            for (key, value) in [
                ("firstName", &params.first_name),
                ("lastName", &params.last_name),
                ("phone", &params.phone),
                ("source", &params.source),
            ] {
                if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                    object.insert(key.into(), value.into());
                }
            }
            if !params.tags.is_empty() {
                object.insert("tags".into(), json!(params.tags));
            }
            if !params.custom_fields.is_empty() {
                object.insert("customFields".into(), json!(params.custom_fields));
            }
        }

        tracing::info!(
            email = %params.email,
            custom_fields = params.custom_fields.len(),
            "ghl.upsert_contact_request"
        );

        let result = self
            .request(Method::POST, "/contacts/upsert", &[], Some(&body))
            .await
            .inspect_err(|e| tracing::error!(email = %params.email, error = %e, "ghl.upsert_contact_failed"))?;

        Ok(result
            .pointer("/contact/id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string))
    }

    pub async fn create_opportunity(&self, params: &Opportunity) -> Result<()> {
        let (_, location) = self.credentials()?;
        let mut body = json!({
            "locationId": location,
            "contactId": params.contact_id,
            "pipelineId": params.pipeline_id,
            "pipelineStageId": params.stage_id,
            "name": params.name,
            "currency": params.currency,
        });
        if let Some(object) = body.as_object_mut() {
            if let Some(value) = params.monetary_value {
                object.insert("monetaryValue".into(), json!(value));
            }
            if let Some(status) = &params.status {
                object.insert("status".into(), status.clone().into());
            }
            if let Some(source) = &params.source {
                object.insert("source".into(), source.clone().into());
            }
            if !params.tags.is_empty() {
                object.insert("tags".into(), json!(params.tags));
            }
            if !params.custom_fields.is_empty() {
                object.insert("customFields".into(), json!(params.custom_fields));
            }
        }

        self.request(Method::POST, "/opportunities/", &[], Some(&body))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    contact_id = %params.contact_id,
                    pipeline_id = %params.pipeline_id,
                    stage_id = %params.stage_id,
                    error = %e,
                    "ghl.create_opportunity_failed"
                );
            })?;
        Ok(())
    }

    /// Enroll a contact in a workflow.
    pub async fn trigger_workflow(&self, workflow_id: &str, contact_id: &str) -> Result<()> {
        let path = format!("/contacts/{contact_id}/workflow/{workflow_id}");
        self.request(Method::POST, &path, &[], Some(&json!({}))).await?;
        Ok(())
    }

    /// Contacts matching an email. Lookup failures yield an empty list.
    pub async fn search_contacts(&self, normalized_email: &str) -> Vec<Value> {
        let Ok((_, location)) = self.credentials() else {
            return Vec::new();
        };

        let body = json!({ "locationId": location, "query": normalized_email, "pageLimit": 50 });
        match self.request(Method::POST, "/contacts/search", &[], Some(&body)).await {
            Ok(payload) => return contacts::normalize_contact_list(payload),
            Err(e) => tracing::debug!(email = normalized_email, error = %e, "ghl.contact_search_post_failed"),
        }

        let query = [("locationId", location), ("query", normalized_email), ("limit", "10")];
        match self.request(Method::GET, "/contacts/", &query, None).await {
            Ok(payload) => contacts::normalize_contact_list(payload),
            Err(e) => {
                tracing::warn!(email = normalized_email, error = %e, "ghl.contact_search_failed");
                Vec::new()
            }
        }
    }

    async fn load_field_catalogue(&self) -> FieldCatalogue {
        let Ok((_, location)) = self.credentials() else {
            return FieldCatalogue::default();
        };
        let path = format!("/locations/{location}/customFields");
        match self.request(Method::GET, &path, &[("model", "contact")], None).await {
            Ok(payload) => {
                let by_key = payload
                    .get("customFields")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|field| {
                        let key = field.get("fieldKey").and_then(Value::as_str).filter(|k| !k.is_empty())?;
                        let id = field.get("id").and_then(Value::as_str).filter(|i| !i.is_empty())?;
                        Some((key.to_string(), id.to_string()))
                    })
                    .collect();
                FieldCatalogue { by_key }
            }
            Err(e) => {
                tracing::warn!(field_type = "contact", location_id = location, error = %e, "ghl.custom_field_fetch_failed");
                FieldCatalogue::default()
            }
        }
    }

    /// Custom field id for a `contact.*` key, loading the catalogue once.
    pub async fn custom_field_id_by_key(&self, field_key: &str) -> Option<String> {
        if field_key.is_empty() {
            return None;
        }
        if let Some(catalogue) = self.fields.read().await.as_ref() {
            return catalogue.by_key.get(field_key).cloned();
        }

        let mut guard = self.fields.write().await;
        if guard.is_none() {
            *guard = Some(self.load_field_catalogue().await);
        }
        guard.as_ref().and_then(|c| c.by_key.get(field_key).cloned())
    }

    /// `contact.*` specifiers are looked up; anything else is already an id.
    async fn resolve_field_specifier(&self, specifier: Option<&str>, fallback_key: Option<&str>) -> Option<String> {
        match specifier.filter(|s| !s.is_empty()) {
            Some(spec) if spec.starts_with("contact.") => {
                let resolved = self.custom_field_id_by_key(spec).await;
                if resolved.is_none() {
                    tracing::warn!(field_key = spec, "ghl.custom_field_lookup_unresolved");
                }
                resolved
            }
            Some(id) => Some(id.to_string()),
            None => match fallback_key {
                Some(key) => self.custom_field_id_by_key(key).await,
                None => None,
            },
        }
    }

    /// Resolve an offer's context-key to field map, adding the purchase
    /// metadata and license keys fields when they can be found.
    pub async fn resolve_contact_field_ids(&self, initial: &HashMap<String, String>) -> HashMap<String, String> {
        let mut resolved = HashMap::new();
        for (context_key, specifier) in initial {
            if let Some(id) = self.resolve_field_specifier(Some(specifier), None).await {
                resolved.insert(context_key.clone(), id);
            }
        }

        let defaults = [
            (
                "purchaseMetadataJson",
                self.config.purchase_metadata_field.as_deref(),
                DEFAULT_PURCHASE_METADATA_FIELD_KEY,
            ),
            (
                "licenseKeysJson",
                self.config.license_keys_field.as_deref(),
                DEFAULT_LICENSE_KEYS_FIELD_KEY,
            ),
        ];
        for (context_key, specifier, fallback) in defaults {
            if resolved.contains_key(context_key) {
                continue;
            }
            if let Some(id) = self.resolve_field_specifier(specifier, Some(fallback)).await {
                resolved.insert(context_key.to_string(), id);
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;
    use crate::test_support::serve;

    fn config(base_url: String) -> GhlConfig {
        GhlConfig {
            base_url,
            location_id: Some("loc_1".into()),
            token: Some("pat".into()),
            request_base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_sends_version_header_and_returns_id() {
        async fn upsert(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
            assert_eq!(headers["version"], "2021-07-28");
            assert_eq!(headers["authorization"], "Bearer pat");
            assert_eq!(body["locationId"], "loc_1");
            assert_eq!(body["customFields"][0]["id"], "fld_1");
            assert!(body.get("phone").is_none());
            (StatusCode::OK, Json(json!({ "contact": { "id": "contact_123" } })))
        }
        let base = serve(Router::new().route("/contacts/upsert", post(upsert))).await;
        let client = GhlClient::new(config(base));

        let id = client
            .upsert_contact(&ContactUpsert {
                email: "buyer@example.com".into(),
                custom_fields: vec![CustomFieldInput {
                    id: "fld_1".into(),
                    value: json!("x"),
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("contact_123"));
    }

    #[tokio::test]
    async fn test_retryable_status_is_retried() {
        async fn flaky(State(calls): State<Arc<AtomicUsize>>) -> (StatusCode, Json<Value>) {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                (StatusCode::TOO_MANY_REQUESTS, Json(json!({})))
            } else {
                (StatusCode::OK, Json(json!({ "contact": { "id": "c1" } })))
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let base = serve(
            Router::new()
                .route("/contacts/upsert", post(flaky))
                .with_state(calls.clone()),
        )
        .await;
        let client = GhlClient::new(config(base));

        let id = client.upsert_contact(&ContactUpsert::default()).await.unwrap();
        assert_eq!(id.as_deref(), Some("c1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_error_carries_status_and_body() {
        let base = serve(Router::new().route(
            "/opportunities/",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad stage") }),
        ))
        .await;
        let client = GhlClient::new(config(base));

        let err = client.create_opportunity(&Opportunity::default()).await.unwrap_err();
        match err {
            PaymentError::Http { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad stage");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_is_config_error() {
        let client = GhlClient::new(GhlConfig::default());
        let err = client.upsert_contact(&ContactUpsert::default()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Config(_)));
    }

    #[tokio::test]
    async fn test_field_catalogue_is_fetched_once() {
        async fn fields(State(calls): State<Arc<AtomicUsize>>) -> Json<Value> {
            calls.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "customFields": [
                { "id": "fld_meta", "fieldKey": "contact.purchase_metadata" },
                { "id": "fld_lic", "fieldKey": "contact.license_keys_v2" },
                { "id": "fld_offer", "fieldKey": "contact.offer" },
            ]}))
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let base = serve(
            Router::new()
                .route("/locations/loc_1/customFields", get(fields))
                .with_state(calls.clone()),
        )
        .await;
        let client = GhlClient::new(config(base));

        let initial = HashMap::from([
            ("offerId".to_string(), "contact.offer".to_string()),
            ("landerId".to_string(), "fld_explicit".to_string()),
            ("unknown".to_string(), "contact.nope".to_string()),
        ]);
        let resolved = client.resolve_contact_field_ids(&initial).await;

        assert_eq!(resolved["offerId"], "fld_offer");
        assert_eq!(resolved["landerId"], "fld_explicit");
        assert_eq!(resolved["purchaseMetadataJson"], "fld_meta");
        assert_eq!(resolved["licenseKeysJson"], "fld_lic");
        assert!(!resolved.contains_key("unknown"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_search_falls_back_to_get() {
        let base = serve(
            Router::new()
                .route("/contacts/search", post(|| async { StatusCode::NOT_FOUND }))
                .route(
                    "/contacts/",
                    get(|| async { Json(json!({ "contacts": [{ "id": "c1", "email": "a@b.co" }] })) }),
                ),
        )
        .await;
        let client = GhlClient::new(config(base));
        let found = client.search_contacts("a@b.co").await;
        assert_eq!(found.len(), 1);
    }
}
