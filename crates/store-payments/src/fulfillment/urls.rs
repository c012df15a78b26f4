//! Product and checkout URLs attached to a purchase.

use serde::Serialize;

use crate::metadata::MetadataBag;
use crate::offer::OfferConfig;
use crate::resolve::ResolverChain;

/// Links handed to the CRM and support desk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUrls {
    pub product_page_url: Option<String>,
    pub purchase_url: Option<String>,
    pub store_product_page_url: Option<String>,
    pub apps_product_page_url: Option<String>,
    pub serply_link: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// Where URLs are looked up
pub struct UrlSources<'a> {
    pub metadata: &'a MetadataBag,
    pub offer: Option<&'a OfferConfig>,
}

impl UrlSources<'_> {
    fn meta(&self, key: &str) -> Option<String> {
        self.metadata.get_str(key)
    }

    fn offer_meta(&self, key: &str) -> Option<String> {
        self.offer.and_then(|o| o.meta(key)).map(ToString::to_string)
    }
}

type UrlChain<'a> = ResolverChain<UrlSources<'a>, String>;

fn product_page_chain<'a>() -> UrlChain<'a> {
    ResolverChain::new()
        .then("offer.productPageUrl", |s| s.offer_meta("productPageUrl"))
        .then("metadata.productPageUrl", |s| s.meta("productPageUrl"))
        .then("metadata.product_page_url", |s| s.meta("product_page_url"))
}

fn purchase_chain<'a>() -> UrlChain<'a> {
    ResolverChain::new()
        .then("metadata.purchaseUrl", |s| s.meta("purchaseUrl"))
        .then("metadata.purchase_url", |s| s.meta("purchase_url"))
        .then("metadata.serply_link", |s| s.meta("serply_link"))
        .then("metadata.serplyLink", |s| s.meta("serplyLink"))
        .then("metadata.checkoutUrl", |s| s.meta("checkoutUrl"))
        .then("metadata.checkout_url", |s| s.meta("checkout_url"))
        .then("offer.purchaseUrl", |s| s.offer_meta("purchaseUrl"))
        .then("offer.serply_link", |s| s.offer_meta("serply_link"))
}

fn success_chain<'a>() -> UrlChain<'a> {
    ResolverChain::new()
        .then("metadata.success_url", |s| s.meta("success_url"))
        .then("metadata.successUrl", |s| s.meta("successUrl"))
        .then("offer.success_url", |s| s.offer_meta("success_url"))
        .then("offer.successUrl", |s| s.offer.and_then(|o| o.success_url.clone()))
}

fn cancel_chain<'a>() -> UrlChain<'a> {
    ResolverChain::new()
        .then("metadata.cancel_url", |s| s.meta("cancel_url"))
        .then("metadata.cancelUrl", |s| s.meta("cancelUrl"))
        .then("offer.cancel_url", |s| s.offer_meta("cancel_url"))
        .then("offer.cancelUrl", |s| s.offer.and_then(|o| o.cancel_url.clone()))
}

impl OrderUrls {
    /// Resolve every URL from session metadata and the offer config.
    pub fn resolve(metadata: &MetadataBag, offer: Option<&OfferConfig>) -> Self {
        let sources = UrlSources { metadata, offer };

        let product_page_url = product_page_chain().resolve(&sources);
        let purchase_url = purchase_chain().resolve(&sources);
        let serply_link = sources
            .meta("serply_link")
            .or_else(|| sources.meta("serplyLink"))
            .or_else(|| purchase_url.clone())
            .or_else(|| sources.offer_meta("serply_link"));
        let store_product_page_url = sources
            .offer_meta("store_serp_co_product_page_url")
            .or_else(|| sources.meta("store_serp_co_product_page_url"))
            .or_else(|| product_page_url.clone());
        let apps_product_page_url = sources
            .offer_meta("apps_serp_co_product_page_url")
            .or_else(|| sources.meta("apps_serp_co_product_page_url"))
            .or_else(|| product_page_url.clone());

        Self {
            product_page_url,
            purchase_url,
            store_product_page_url,
            apps_product_page_url,
            serply_link,
            success_url: success_chain().resolve(&sources),
            cancel_url: cancel_chain().resolve(&sources),
        }
    }
}

/// Rewrite legacy store product links to the apps domain.
pub fn normalize_store_product_url(url: Option<String>) -> Option<String> {
    const LEGACY_PRODUCT: &str = "https://store.serp.co/product-details/product/";
    const LEGACY_STORE: &str = "https://store.serp.co/";
    const APPS: &str = "https://apps.serp.co/";

    url.map(|url| {
        if let Some(rest) = url.strip_prefix(LEGACY_PRODUCT) {
            format!("{APPS}{rest}")
        } else if let Some(rest) = url.strip_prefix(LEGACY_STORE) {
            format!("{APPS}{rest}")
        } else {
            url
        }
    })
}

/// Human readable amount, e.g. `$1,299.00`. `None` for zero or unknown.
pub fn format_amount(minor: Option<i64>, currency: Option<&str>) -> Option<String> {
    let minor = minor.filter(|m| *m != 0)?;
    let code = currency.map(str::trim).filter(|c| c.len() == 3)?.to_ascii_uppercase();

    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    let whole = group_thousands(abs / 100);
    let cents = abs % 100;

    let symbol = match code.as_str() {
        "USD" => "$",
        "EUR" => "€",
        "GBP" => "£",
        "CAD" => "CA$",
        "AUD" => "A$",
        _ => return Some(format!("{sign}{code} {whole}.{cents:02}")),
    };
    Some(format!("{sign}{symbol}{whole}.{cents:02}"))
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Some(9900), Some("usd")).as_deref(), Some("$99.00"));
        assert_eq!(format_amount(Some(129_905), Some("USD")).as_deref(), Some("$1,299.05"));
        assert_eq!(format_amount(Some(500), Some("jpy")).as_deref(), Some("JPY 5.00"));
        assert_eq!(format_amount(Some(0), Some("usd")), None);
        assert_eq!(format_amount(Some(100), None), None);
    }

    #[test]
    fn test_metadata_wins_over_offer_for_purchase_url() {
        let mut offer = OfferConfig::new("demo-offer");
        offer
            .metadata
            .insert("purchaseUrl".into(), "https://offer.example/buy".into());
        offer
            .metadata
            .insert("productPageUrl".into(), "https://apps.serp.co/demo".into());
        offer.success_url = Some("https://offer.example/thanks".into());

        let metadata = MetadataBag::new()
            .with("serply_link", "https://serp.ly/demo")
            .with("productPageUrl", "https://ignored.example");

        let urls = OrderUrls::resolve(&metadata, Some(&offer));
        assert_eq!(urls.purchase_url.as_deref(), Some("https://serp.ly/demo"));
        assert_eq!(urls.serply_link.as_deref(), Some("https://serp.ly/demo"));
        assert_eq!(urls.product_page_url.as_deref(), Some("https://apps.serp.co/demo"));
        assert_eq!(urls.store_product_page_url.as_deref(), Some("https://apps.serp.co/demo"));
        assert_eq!(urls.success_url.as_deref(), Some("https://offer.example/thanks"));
        assert_eq!(urls.cancel_url, None);
    }

    #[test]
    fn test_legacy_store_links_are_rewritten() {
        assert_eq!(
            normalize_store_product_url(Some("https://store.serp.co/product-details/product/demo".into())).as_deref(),
            Some("https://apps.serp.co/demo")
        );
        assert_eq!(
            normalize_store_product_url(Some("https://store.serp.co/demo".into())).as_deref(),
            Some("https://apps.serp.co/demo")
        );
        assert_eq!(
            normalize_store_product_url(Some("https://example.com/demo".into())).as_deref(),
            Some("https://example.com/demo")
        );
    }
}
