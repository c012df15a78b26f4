//! Offer Catalog
//!
//! Offers are purchasable configurations keyed by offer id. The pipeline
//! only reads them: product naming, landing URLs, entitlements and the
//! CRM pipeline mapping.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};

/// Checkout mode of an offer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferMode {
    #[default]
    Payment,
    Subscription,
}

/// CRM mapping for an offer
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GhlOfferConfig {
    pub pipeline_id: Option<String>,
    pub stage_id: Option<String>,
    pub status: Option<String>,
    pub source: Option<String>,
    pub tag_ids: Vec<String>,
    pub workflow_ids: Vec<String>,
    pub opportunity_name_template: Option<String>,

    /// Context key -> custom field id
    pub contact_custom_field_ids: HashMap<String, String>,

    pub opportunity_custom_field_ids: HashMap<String, String>,
}

/// A purchasable configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferConfig {
    pub id: String,

    #[serde(default)]
    pub stripe_price_id: Option<String>,

    #[serde(default)]
    pub stripe_test_price_id: Option<String>,

    #[serde(default)]
    pub success_url: Option<String>,

    #[serde(default)]
    pub cancel_url: Option<String>,

    #[serde(default)]
    pub mode: OfferMode,

    #[serde(default)]
    pub product_name: Option<String>,

    /// Product metadata (productSlug, productPageUrl, purchaseUrl,
    /// serply_link, licenseEntitlements, licenseTier, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub ghl: Option<GhlOfferConfig>,
}

impl OfferConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stripe_price_id: None,
            stripe_test_price_id: None,
            success_url: None,
            cancel_url: None,
            mode: OfferMode::default(),
            product_name: None,
            metadata: HashMap::new(),
            ghl: None,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Display name: explicit product name, then metadata, then id.
    pub fn display_name(&self) -> &str {
        self.product_name
            .as_deref()
            .or_else(|| self.meta("productName"))
            .unwrap_or(self.id.as_str())
    }
}

/// Offer lookup
pub trait OfferCatalog: Send + Sync {
    fn get(&self, offer_id: &str) -> Option<OfferConfig>;
}

/// Catalog backed by a fixed map
#[derive(Clone, Debug, Default)]
pub struct StaticOfferCatalog {
    offers: HashMap<String, OfferConfig>,
}

impl StaticOfferCatalog {
    pub fn new(offers: impl IntoIterator<Item = OfferConfig>) -> Self {
        Self {
            offers: offers.into_iter().map(|o| (o.id.clone(), o)).collect(),
        }
    }

    /// Parse a JSON array of offers.
    pub fn from_json(raw: &str) -> Result<Self> {
        let offers: Vec<OfferConfig> = serde_json::from_str(raw)
            .map_err(|e| PaymentError::Config(format!("invalid offer catalog: {e}")))?;
        Ok(Self::new(offers))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PaymentError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Load from `OFFERS_PATH`, or an empty catalog when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var("OFFERS_PATH") {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

impl OfferCatalog for StaticOfferCatalog {
    fn get(&self, offer_id: &str) -> Option<OfferConfig> {
        self.offers.get(offer_id).cloned()
    }
}
