//! Recording adapters for orchestrator tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::Fulfillment;
use crate::alerts::{Notifier, SaleNotice};
use crate::crm::{CrmSync, SyncContext, SyncOutcome, SyncRetryPolicy};
use crate::entitlements::{EntitlementGrantor, EntitlementRequest, GrantOutcome, LookupOutcome};
use crate::error::{PaymentError, Result};
use crate::ledger::MemoryLedger;
use crate::license::{LicenseIssuer, LicenseRecord, LicenseRequest};
use crate::metadata::MetadataBag;
use crate::offer::{GhlOfferConfig, OfferConfig, StaticOfferCatalog};
use crate::providers::{StripeAccount, StripeGateway, StripeMode};
use crate::support::{SupportContext, SupportSync, SupportSyncResult};
use crate::webhook::{StripeEvent, VerifiedEvent};

#[derive(Default)]
pub struct RecordingLicense {
    requests: Mutex<Vec<LicenseRequest>>,
}

impl RecordingLicense {
    pub fn requests(&self) -> Vec<LicenseRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LicenseIssuer for RecordingLicense {
    async fn create_license_for_order(&self, request: LicenseRequest) -> Option<LicenseRecord> {
        let tier = request.tier.clone().unwrap_or_default();
        self.requests.lock().unwrap().push(request);
        Some(LicenseRecord {
            action: Some("created".into()),
            license_id: Some(format!("lic-{tier}")),
            license_key: Some(format!("KEY-{tier}")),
        })
    }

    async fn fetch_license_by_email(&self, _email: &str) -> Option<LicenseRecord> {
        None
    }
}

#[derive(Default)]
pub struct RecordingEntitlements {
    grants: Mutex<Vec<EntitlementRequest>>,
    revokes: Mutex<Vec<EntitlementRequest>>,
}

impl RecordingEntitlements {
    pub fn grants(&self) -> Vec<EntitlementRequest> {
        self.grants.lock().unwrap().clone()
    }

    pub fn revokes(&self) -> Vec<EntitlementRequest> {
        self.revokes.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntitlementGrantor for RecordingEntitlements {
    async fn grant(&self, request: EntitlementRequest) -> GrantOutcome {
        self.grants.lock().unwrap().push(request);
        GrantOutcome::Succeeded {
            http_status: 200,
            attempts: 1,
        }
    }

    async fn revoke(&self, request: EntitlementRequest) -> GrantOutcome {
        self.revokes.lock().unwrap().push(request);
        GrantOutcome::Succeeded {
            http_status: 200,
            attempts: 1,
        }
    }

    async fn lookup_by_email(&self, _email: &str) -> LookupOutcome {
        LookupOutcome::Found {
            entitlements: Vec::new(),
            customer_exists: false,
        }
    }
}

#[derive(Default)]
pub struct RecordingCrm {
    calls: Mutex<Vec<SyncContext>>,
    failure: Mutex<Option<(u16, String)>>,
}

impl RecordingCrm {
    pub fn calls(&self) -> Vec<SyncContext> {
        self.calls.lock().unwrap().clone()
    }

    /// Answer every sync with an HTTP error.
    pub fn fail_with_status(&self, status: u16, body: &str) {
        *self.failure.lock().unwrap() = Some((status, body.to_string()));
    }
}

#[async_trait]
impl CrmSync for RecordingCrm {
    async fn sync_order(&self, _offer: Option<&GhlOfferConfig>, context: &SyncContext) -> Result<Option<SyncOutcome>> {
        self.calls.lock().unwrap().push(context.clone());
        if let Some((status, body)) = self.failure.lock().unwrap().clone() {
            return Err(PaymentError::Http { status, body });
        }
        Ok(Some(SyncOutcome {
            contact_id: "contact-1".into(),
            opportunity_created: false,
        }))
    }
}

#[derive(Default)]
pub struct RecordingSupport {
    calls: Mutex<Vec<SupportContext>>,
}

impl RecordingSupport {
    pub fn calls(&self) -> Vec<SupportContext> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SupportSync for RecordingSupport {
    async fn sync_purchase(&self, context: &SupportContext) -> SupportSyncResult {
        self.calls.lock().unwrap().push(context.clone());
        SupportSyncResult::Synced {
            people_id: "people-1".into(),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(String, MetadataBag)>>,
    sales: Mutex<Vec<SaleNotice>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<(String, MetadataBag)> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn sales(&self) -> Vec<SaleNotice> {
        self.sales.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn ops_alert(&self, message: &str, context: &MetadataBag) {
        self.alerts.lock().unwrap().push((message.to_string(), context.clone()));
    }

    async fn sales_notification(&self, sale: &SaleNotice) {
        self.sales.lock().unwrap().push(sale.clone());
    }
}

#[derive(Default)]
pub struct RecordingStripe {
    products: HashMap<String, String>,
    descriptions: Mutex<Vec<(String, String)>>,
}

impl RecordingStripe {
    pub fn with_product(mut self, id: &str, name: &str) -> Self {
        self.products.insert(id.into(), name.into());
        self
    }

    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.descriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl StripeGateway for RecordingStripe {
    async fn product_name(&self, product_id: &str, _account: &StripeAccount) -> Result<Option<String>> {
        Ok(self.products.get(product_id).cloned())
    }

    async fn set_payment_intent_description(
        &self,
        payment_intent_id: &str,
        description: &str,
        _account: &StripeAccount,
    ) -> Result<()> {
        self.descriptions
            .lock()
            .unwrap()
            .push((payment_intent_id.into(), description.into()));
        Ok(())
    }
}

/// In-memory ledger plus a recording fake for every adapter
pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub license: Arc<RecordingLicense>,
    pub entitlements: Arc<RecordingEntitlements>,
    pub crm: Arc<RecordingCrm>,
    pub support: Arc<RecordingSupport>,
    pub notifier: Arc<RecordingNotifier>,
    pub stripe: Arc<RecordingStripe>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_stripe(RecordingStripe::default())
    }

    pub fn with_stripe(stripe: RecordingStripe) -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            license: Arc::default(),
            entitlements: Arc::default(),
            crm: Arc::default(),
            support: Arc::default(),
            notifier: Arc::default(),
            stripe: Arc::new(stripe),
        }
    }

    pub fn fulfillment(&self) -> Fulfillment {
        self.fulfillment_with_offers(Vec::new())
    }

    pub fn fulfillment_with_offers(&self, offers: impl IntoIterator<Item = OfferConfig>) -> Fulfillment {
        Fulfillment {
            ledger: self.ledger.clone(),
            offers: Arc::new(StaticOfferCatalog::new(offers)),
            license: self.license.clone(),
            entitlements: self.entitlements.clone(),
            crm: self.crm.clone(),
            crm_retry: SyncRetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
            },
            support: self.support.clone(),
            notifier: self.notifier.clone(),
            stripe: Some(self.stripe.clone()),
        }
    }
}

/// A test-mode event of `event_type` wrapping `object`
pub fn verified(event_type: &str, object: Value) -> VerifiedEvent {
    let event = StripeEvent::parse(
        &json!({
            "id": format!("evt_{}", event_type.replace('.', "_")),
            "type": event_type,
            "created": 1_700_000_000,
            "livemode": false,
            "data": { "object": object },
        })
        .to_string(),
    )
    .unwrap();
    VerifiedEvent {
        event,
        mode: StripeMode::Test,
        account_alias: None,
    }
}
