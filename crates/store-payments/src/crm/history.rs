//! Purchase History
//!
//! The CRM contact carries one JSON custom field describing the latest
//! purchase. Earlier purchases are folded into its `previousPurchases`
//! array so a repeat customer never loses history when the field is
//! rewritten.

use std::collections::HashSet;

use serde_json::{Map, Value, json};

use super::SyncContext;

/// Upper bound on `previousPurchases`
pub const MAX_PURCHASE_HISTORY_ENTRIES: usize = 25;

/// Flatten whatever the contact currently stores into individual entries.
///
/// Accepts JSON strings, arrays and objects; nested `previousPurchases`
/// and `history` arrays are lifted out of their parent.
pub fn collect_entries(value: &Value) -> Vec<Map<String, Value>> {
    match value {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map(|parsed| collect_entries(&parsed))
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(collect_entries).collect(),
        Value::Object(object) => {
            let mut entry = object.clone();
            let mut nested = Vec::new();
            for key in ["previousPurchases", "history"] {
                if matches!(entry.get(key), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = entry.remove(key) {
                        nested.extend(items);
                    }
                }
            }

            let mut entries = vec![entry];
            entries.extend(nested.iter().flat_map(collect_entries));
            entries
        }
        _ => Vec::new(),
    }
}

fn text<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| value.as_str().map(str::trim).filter(|s| !s.is_empty()))
}

/// Identity of a purchase entry, strongest identifier first.
pub fn entry_key(entry: &Map<String, Value>) -> Option<String> {
    if let Some(Value::Object(payment)) = entry.get("payment") {
        if let Some(intent) = text(payment, &["stripePaymentIntentId", "paymentIntentId", "intentId"]) {
            return Some(format!("intent:{}", intent.to_lowercase()));
        }
        if let Some(session) = text(payment, &["stripeSessionId", "sessionId", "checkoutSessionId"]) {
            return Some(format!("session:{}", session.to_lowercase()));
        }
        if let Some(invoice) = text(payment, &["invoiceId", "invoice_id"]) {
            return Some(format!("invoice:{}", invoice.to_lowercase()));
        }
    }
    if let Some(Value::Object(metadata)) = entry.get("metadata") {
        if let Some(order) = text(metadata, &["orderId", "order_id"]) {
            return Some(format!("metadata-order:{}", order.to_lowercase()));
        }
    }
    if let Some(Value::Object(product)) = entry.get("product") {
        if let Some(id) = text(product, &["id", "offerId", "offer_id"]) {
            return Some(format!("product:{}", id.to_lowercase()));
        }
    }
    None
}

fn fallback_key(entry: &Map<String, Value>) -> String {
    format!("hash:{}", Value::Object(entry.clone()))
}

/// Merge `latest_json` with the existing field value.
///
/// The latest entry keeps its own fields; prior entries that do not share
/// its key are attached as `previousPurchases`, newest first, capped at
/// [`MAX_PURCHASE_HISTORY_ENTRIES`]. Non-object input is returned as is.
pub fn merge_history(existing: Option<&Value>, latest_json: &str) -> String {
    let Ok(Value::Object(mut latest)) = serde_json::from_str::<Value>(latest_json) else {
        return latest_json.to_string();
    };

    let history = existing.map(collect_entries).unwrap_or_default();

    let latest_key = entry_key(&latest);
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(latest_key.clone().unwrap_or_else(|| fallback_key(&latest)));

    let mut deduped = Vec::new();
    for entry in history {
        let key = entry_key(&entry);
        let primary = key.clone().unwrap_or_else(|| fallback_key(&entry));
        if !seen.insert(primary) {
            continue;
        }
        if let Some(key) = key {
            seen.insert(key);
        }
        deduped.push(Value::Object(entry));
    }
    deduped.truncate(MAX_PURCHASE_HISTORY_ENTRIES);

    if deduped.is_empty() {
        latest.remove("previousPurchases");
    } else {
        latest.insert("previousPurchases".into(), Value::Array(deduped));
    }

    serde_json::to_string_pretty(&Value::Object(latest)).unwrap_or_else(|_| latest_json.to_string())
}

/// Drop nulls, empty strings, empty arrays and objects that end up empty.
pub fn compact(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(object) => {
            let compacted: Map<String, Value> = object
                .into_iter()
                .filter_map(|(k, v)| compact(v).map(|v| (k, v)))
                .collect();
            (!compacted.is_empty()).then_some(Value::Object(compacted))
        }
        other => Some(other),
    }
}

fn has_license_data(ctx: &SyncContext) -> bool {
    ctx.license_key.is_some()
        || ctx.license_id.is_some()
        || ctx.license_action.is_some()
        || !ctx.license_entitlements.is_empty()
}

/// Pretty JSON describing this purchase, or `None` when nothing is known.
pub fn build_purchase_metadata(ctx: &SyncContext) -> Option<String> {
    let meta = |key: &str| ctx.metadata.get_str(key);
    let product_page_url = ctx.product_page_url.clone().or_else(|| {
        [
            "productPageUrl",
            "product_page_url",
            "store_serp_co_product_page_url",
            "apps_serp_co_product_page_url",
            "productPageURL",
        ]
        .iter()
        .find_map(|key| meta(key))
    });
    let checkout_url = ctx
        .purchase_url
        .clone()
        .or_else(|| ["purchaseUrl", "purchase_url", "serply_link", "serplyLink"].iter().find_map(|key| meta(key)))
        .or_else(|| ctx.serply_link.clone())
        .or_else(|| ["checkoutUrl", "checkout_url"].iter().find_map(|key| meta(key)));

    let license = has_license_data(ctx).then(|| {
        json!({
            "key": ctx.license_key,
            "id": ctx.license_id,
            "action": ctx.license_action,
            "entitlements": ctx.license_entitlements,
            "tier": ctx.license_tier,
            "features": ctx.license_features,
        })
    });

    #[allow(clippy::cast_precision_loss)]
    let amount = ctx.amount_total.map(|cents| cents as f64 / 100.0);

    let payload = json!({
        "provider": ctx.provider,
        "product": {
            "id": ctx.offer_id,
            "name": ctx.offer_name,
            "pageUrl": product_page_url,
            "purchaseUrl": checkout_url,
            "landerId": ctx.lander_id,
        },
        "customer": {
            "email": ctx.customer_email,
            "name": ctx.customer_name,
            "phone": ctx.customer_phone,
        },
        "payment": {
            "amountCents": ctx.amount_total,
            "amount": amount,
            "amountFormatted": ctx.amount_formatted,
            "currency": ctx.currency,
            "stripeSessionId": ctx.stripe_session_id,
            "stripePaymentIntentId": ctx.stripe_payment_intent_id,
        },
        "consent": ctx.tos_accepted.map(|accepted| json!({ "termsOfServiceAccepted": accepted })),
        "metadata": (!ctx.metadata.is_empty()).then(|| ctx.metadata.to_json()),
        "license": license,
    });

    compact(payload).and_then(|payload| serde_json::to_string_pretty(&payload).ok())
}

/// Pretty JSON for the license keys field.
pub fn build_license_keys_payload(ctx: &SyncContext) -> Option<String> {
    if !has_license_data(ctx) {
        return None;
    }
    let payload = json!({
        "key": ctx.license_key,
        "id": ctx.license_id,
        "action": ctx.license_action,
        "entitlements": ctx.license_entitlements,
        "tier": ctx.license_tier,
    });
    compact(payload).and_then(|payload| serde_json::to_string_pretty(&payload).ok())
}
