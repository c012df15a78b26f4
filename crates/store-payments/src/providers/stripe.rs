//! Stripe Client Registry
//!
//! Resolves live/test secret keys (optionally per account alias), caches one
//! `stripe::Client` per (mode, alias) and exposes the few Stripe calls the
//! pipeline makes outside webhook parsing.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use stripe::{
    Client, CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval, CreateProduct,
    IdOrCreate, ListPrices, ListProducts, Metadata, PaymentIntent, PaymentIntentId, Price, PriceId,
    Product, ProductId, Recurring, RecurringInterval, StripeError, UpdatePaymentIntent,
};

use crate::env;
use crate::error::{PaymentError, Result};
use crate::offer::OfferConfig;

/// Concrete Stripe mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StripeMode {
    Live,
    Test,
}

impl StripeMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
        }
    }

    pub const fn from_livemode(livemode: bool) -> Self {
        if livemode { Self::Live } else { Self::Test }
    }

    /// Accepts the common aliases used in deployment configs.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "live" | "prod" | "production" => Some(Self::Live),
            "test" | "sandbox" | "dev" | "development" | "staging" | "preview" => Some(Self::Test),
            _ => None,
        }
    }
}

impl fmt::Display for StripeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode requested by a caller; `Auto` follows the deployment default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestedMode {
    #[default]
    Auto,
    Live,
    Test,
}

impl From<StripeMode> for RequestedMode {
    fn from(mode: StripeMode) -> Self {
        match mode {
            StripeMode::Live => Self::Live,
            StripeMode::Test => Self::Test,
        }
    }
}

/// Which Stripe account a call belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeAccount {
    pub mode: StripeMode,
    pub alias: Option<String>,
}

impl StripeAccount {
    pub const fn new(mode: StripeMode) -> Self {
        Self { mode, alias: None }
    }
}

/// Resolved key material
#[derive(Clone, Debug, Default)]
pub struct StripeKeys {
    pub live_secret_key: Option<String>,
    pub test_secret_key: Option<String>,

    /// alias -> (live, test)
    pub aliases: HashMap<String, (Option<String>, Option<String>)>,

    pub default_mode: Option<StripeMode>,
}

impl StripeKeys {
    pub fn from_env() -> Self {
        Self::from_lookup(env::var)
    }

    /// Resolve keys through `lookup` so the selection rules are testable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let generic = lookup("STRIPE_SECRET_KEY");
        let live_secret_key = lookup("STRIPE_SECRET_KEY_LIVE")
            .or_else(|| generic.clone().filter(|k| k.starts_with("sk_live_")));
        let test_secret_key = lookup("STRIPE_SECRET_KEY_TEST")
            .or_else(|| lookup("STRIPE_TEST_SECRET_KEY"))
            .or_else(|| generic.filter(|k| k.starts_with("sk_test_")));

        let aliases = lookup("STRIPE_ACCOUNT_ALIASES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(|alias| {
                        let suffix = env::alias_suffix(alias);
                        let live = lookup(&format!("STRIPE_SECRET_KEY_LIVE_{suffix}"));
                        let test = lookup(&format!("STRIPE_SECRET_KEY_TEST_{suffix}"));
                        (alias.to_lowercase(), (live, test))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let default_mode = ["STRIPE_MODE", "STRIPE_ENV", "STRIPE_ENVIRONMENT"]
            .iter()
            .find_map(|name| lookup(name).and_then(|v| StripeMode::parse(&v)))
            .or_else(|| {
                lookup("APP_ENV")
                    .or_else(|| lookup("RUNTIME_ENV"))
                    .and_then(|v| StripeMode::parse(&v))
            });

        Self {
            live_secret_key,
            test_secret_key,
            aliases,
            default_mode,
        }
    }

    /// `Auto` resolves to the explicit/deployment mode, else test.
    pub fn resolve_mode(&self, requested: RequestedMode) -> StripeMode {
        match requested {
            RequestedMode::Live => StripeMode::Live,
            RequestedMode::Test => StripeMode::Test,
            RequestedMode::Auto => self.default_mode.unwrap_or(StripeMode::Test),
        }
    }

    pub fn secret_key(&self, mode: StripeMode, alias: Option<&str>) -> Option<&str> {
        let aliased = alias
            .and_then(|a| self.aliases.get(&a.trim().to_lowercase()))
            .and_then(|(live, test)| match mode {
                StripeMode::Live => live.as_deref(),
                StripeMode::Test => test.as_deref(),
            });
        aliased.or(match mode {
            StripeMode::Live => self.live_secret_key.as_deref(),
            StripeMode::Test => self.test_secret_key.as_deref(),
        })
    }
}

/// Lazily built Stripe clients keyed by (mode, alias)
pub struct StripeRegistry {
    keys: StripeKeys,
    clients: RwLock<HashMap<(StripeMode, Option<String>), Client>>,
}

impl StripeRegistry {
    pub fn new(keys: StripeKeys) -> Self {
        Self {
            keys,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(StripeKeys::from_env())
    }

    pub const fn keys(&self) -> &StripeKeys {
        &self.keys
    }

    pub fn is_configured(&self) -> bool {
        self.keys.live_secret_key.is_some() || self.keys.test_secret_key.is_some()
    }

    /// Get or build the client for a mode/alias.
    pub fn client(&self, requested: RequestedMode, alias: Option<&str>) -> Result<Client> {
        let mode = self.keys.resolve_mode(requested);
        let alias = alias.map(|a| a.trim().to_lowercase()).filter(|a| !a.is_empty());
        let cache_key = (mode, alias.clone());

        if let Some(client) = self
            .clients
            .read()
            .map_err(|_| PaymentError::Stripe("client cache poisoned".into()))?
            .get(&cache_key)
        {
            return Ok(client.clone());
        }

        let secret = self
            .keys
            .secret_key(mode, alias.as_deref())
            .ok_or_else(|| PaymentError::Config(format!("Stripe {mode} secret key not set")))?;
        let client = Client::new(secret);

        self.clients
            .write()
            .map_err(|_| PaymentError::Stripe("client cache poisoned".into()))?
            .entry(cache_key)
            .or_insert_with(|| client.clone());

        tracing::debug!(mode = %mode, alias = ?alias, "Stripe client created");
        Ok(client)
    }

    fn account_client(&self, account: &StripeAccount) -> Result<Client> {
        self.client(account.mode.into(), account.alias.as_deref())
    }

    /// Make sure the offer's price exists in test mode, cloning it (and its
    /// product) from live when missing. Returns the usable test price id.
    ///
    /// Clones are found again through the price `lookup_key`, so repeated
    /// calls never create duplicates.
    pub async fn ensure_test_price(&self, offer: &OfferConfig) -> Result<String> {
        let price_id = offer
            .stripe_test_price_id
            .as_deref()
            .or(offer.stripe_price_id.as_deref())
            .ok_or_else(|| PaymentError::Config(format!("offer {} has no Stripe price", offer.id)))?;
        let price_id: PriceId = price_id
            .parse()
            .map_err(|_| PaymentError::Config(format!("invalid price id {price_id}")))?;

        let test = self.client(RequestedMode::Test, None)?;
        match Price::retrieve(&test, &price_id, &[]).await {
            Ok(price) => return Ok(price.id.to_string()),
            Err(StripeError::Stripe(err)) if err.http_status == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let live = self.client(RequestedMode::Live, None).map_err(|_| {
            PaymentError::Config("STRIPE_SECRET_KEY_LIVE required to clone prices into test mode".into())
        })?;
        let live_price = Price::retrieve(&live, &price_id, &[]).await?;
        let lookup_key = clone_lookup_key(live_price.lookup_key.as_deref(), &offer.id);

        let mut list = ListPrices::new();
        list.lookup_keys = Some(vec![lookup_key.clone()]);
        list.limit = Some(1);
        if let Some(existing) = Price::list(&test, &list).await?.data.into_iter().next() {
            tracing::info!(offer_id = %offer.id, price_id = %existing.id, "Reusing cloned test price");
            return Ok(existing.id.to_string());
        }

        let live_product = match live_price.product.as_ref() {
            Some(product) => Some(Product::retrieve(&live, &product.id(), &[]).await?),
            None => None,
        };
        let product_id = self
            .find_or_create_test_product(&test, offer, live_product.as_ref())
            .await?;

        let currency = live_price
            .currency
            .ok_or_else(|| PaymentError::Stripe(format!("live price {price_id} has no currency")))?;
        let metadata = clone_metadata(
            live_price.metadata.as_ref(),
            [
                ("cloned_from_price", live_price.id.to_string()),
                ("slug", offer.id.clone()),
            ],
        );

        let mut params = CreatePrice::new(currency);
        params.product = Some(IdOrCreate::Id(product_id.as_str()));
        params.unit_amount = live_price.unit_amount;
        params.lookup_key = Some(&lookup_key);
        params.transfer_lookup_key = Some(true);
        params.nickname = live_price.nickname.as_deref();
        params.recurring = live_price.recurring.as_ref().map(recurring_params);
        params.metadata = Some(metadata);

        let created = Price::create(&test, params).await?;
        tracing::info!(
            offer_id = %offer.id,
            live_price = %price_id,
            test_price = %created.id,
            lookup_key = %lookup_key,
            "Cloned live price into test mode"
        );
        Ok(created.id.to_string())
    }

    async fn find_or_create_test_product(
        &self,
        test: &Client,
        offer: &OfferConfig,
        live_product: Option<&Product>,
    ) -> Result<ProductId> {
        let mut list = ListProducts::new();
        list.limit = Some(100);
        list.active = Some(true);
        let existing = Product::list(test, &list).await?.data.into_iter().find(|p| {
            p.metadata
                .as_ref()
                .and_then(|m| m.get("slug"))
                .is_some_and(|slug| slug == &offer.id)
        });
        if let Some(product) = existing {
            return Ok(product.id);
        }

        let name = live_product
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| offer.display_name().to_string());
        let mut params = CreateProduct::new(&name);
        params.description = live_product.and_then(|p| p.description.as_deref());
        params.metadata = Some(clone_metadata(
            live_product.and_then(|p| p.metadata.as_ref()),
            [
                ("slug", offer.id.clone()),
                (
                    "cloned_from_product",
                    live_product.map(|p| p.id.to_string()).unwrap_or_default(),
                ),
            ],
        ));

        Ok(Product::create(test, params).await?.id)
    }
}

/// Lookup key shared by a live price and its test clone.
pub fn clone_lookup_key(live_lookup_key: Option<&str>, offer_id: &str) -> String {
    live_lookup_key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map_or_else(|| format!("slug:{offer_id}"), ToString::to_string)
}

fn clone_metadata<const N: usize>(base: Option<&Metadata>, extra: [(&str, String); N]) -> Metadata {
    let mut metadata = base.cloned().unwrap_or_default();
    for (key, value) in extra {
        if !value.is_empty() {
            metadata.insert(key.to_string(), value);
        }
    }
    metadata
}

fn recurring_params(recurring: &Recurring) -> CreatePriceRecurring {
    CreatePriceRecurring {
        interval: match recurring.interval {
            RecurringInterval::Day => CreatePriceRecurringInterval::Day,
            RecurringInterval::Week => CreatePriceRecurringInterval::Week,
            RecurringInterval::Month => CreatePriceRecurringInterval::Month,
            RecurringInterval::Year => CreatePriceRecurringInterval::Year,
        },
        interval_count: Some(recurring.interval_count),
        trial_period_days: recurring.trial_period_days,
        ..Default::default()
    }
}

/// The Stripe calls the orchestrator needs
#[async_trait]
pub trait StripeGateway: Send + Sync {
    /// Product display name, `None` when the product has no name.
    async fn product_name(&self, product_id: &str, account: &StripeAccount) -> Result<Option<String>>;

    async fn set_payment_intent_description(
        &self,
        payment_intent_id: &str,
        description: &str,
        account: &StripeAccount,
    ) -> Result<()>;
}

#[async_trait]
impl StripeGateway for StripeRegistry {
    async fn product_name(&self, product_id: &str, account: &StripeAccount) -> Result<Option<String>> {
        let client = self.account_client(account)?;
        let id: ProductId = product_id
            .parse()
            .map_err(|_| PaymentError::Stripe(format!("invalid product id {product_id}")))?;
        let product = Product::retrieve(&client, &id, &[]).await?;
        Ok(product.name.filter(|n| !n.trim().is_empty()))
    }

    async fn set_payment_intent_description(
        &self,
        payment_intent_id: &str,
        description: &str,
        account: &StripeAccount,
    ) -> Result<()> {
        let client = self.account_client(account)?;
        let id: PaymentIntentId = payment_intent_id
            .parse()
            .map_err(|_| PaymentError::Stripe(format!("invalid payment intent id {payment_intent_id}")))?;
        let mut params = UpdatePaymentIntent::new();
        params.description = Some(description);
        PaymentIntent::update(&client, &id, params).await?;
        Ok(())
    }
}
