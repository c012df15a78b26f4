//! Contact payload helpers
//!
//! Contact search responses come back in several shapes depending on the
//! endpoint and API version, so everything here works on raw JSON.

use std::collections::HashMap;

use chrono::DateTime;
use serde::Serialize;
use serde_json::{Map, Value};

/// Field key used when no explicit purchase metadata field id is configured
pub const DEFAULT_PURCHASE_METADATA_FIELD_KEY: &str = "contact.purchase_metadata";

/// Field key used when no explicit license keys field id is configured
pub const DEFAULT_LICENSE_KEYS_FIELD_KEY: &str = "contact.license_keys_v2";

/// Custom field value sent on upserts
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CustomFieldInput {
    pub id: String,
    pub value: Value,
}

/// Accepts `{contacts: [..]}`, `{contact: {..}}`, `{data: {contacts}}` or a bare array.
pub fn normalize_contact_list(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut object) => {
            if let Some(Value::Array(items)) = object.remove("contacts") {
                return items;
            }
            if let Some(contact @ Value::Object(_)) = object.remove("contact") {
                return vec![contact];
            }
            if let Some(Value::Object(mut data)) = object.remove("data") {
                if let Some(Value::Array(items)) = data.remove("contacts") {
                    return items;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn timestamp(value: Option<&Value>) -> i64 {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or(0, |dt| dt.timestamp_millis())
}

fn last_touched(contact: &Value) -> i64 {
    ["dateUpdated", "updatedAt", "dateAdded", "createdAt"]
        .iter()
        .map(|key| timestamp(contact.get(key)))
        .max()
        .unwrap_or(0)
        .max(0)
}

fn contact_email(contact: &Value) -> Option<String> {
    contact
        .get("email")
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty())
        .map(|e| e.trim().to_lowercase())
}

/// Most recently touched contact, preferring an exact email match, then
/// any contact with an email.
pub fn select_preferred_contact<'a>(contacts: &'a [Value], normalized_email: &str) -> Option<&'a Value> {
    let mut scored: Vec<(&Value, Option<String>, i64)> = contacts
        .iter()
        .map(|contact| (contact, contact_email(contact), last_touched(contact)))
        .collect();
    scored.sort_by(|a, b| b.2.cmp(&a.2));

    scored
        .iter()
        .find(|(_, email, _)| email.as_deref() == Some(normalized_email))
        .or_else(|| scored.iter().find(|(_, email, _)| email.is_some()))
        .or_else(|| scored.first())
        .map(|(contact, _, _)| *contact)
}

fn field_value(entry: &Map<String, Value>) -> Value {
    ["value", "fieldValue", "field_value", "response", "values"]
        .iter()
        .find_map(|key| entry.get(*key).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(Value::Null)
}

fn extract_from_collection(collection: &Value, field_id: &str) -> Option<Value> {
    match collection {
        Value::Array(items) => items.iter().filter_map(Value::as_object).find_map(|entry| {
            let id_match = ["id", "customFieldId", "custom_field_id", "customField", "custom_field"]
                .iter()
                .filter_map(|key| entry.get(*key).and_then(Value::as_str))
                .any(|candidate| candidate.trim() == field_id);
            let key_match = ["fieldKey", "field_key", "key", "customFieldKey"]
                .iter()
                .filter_map(|key| entry.get(*key).and_then(Value::as_str))
                .find(|k| !k.trim().is_empty())
                .is_some_and(|k| k == DEFAULT_PURCHASE_METADATA_FIELD_KEY);
            (id_match || key_match).then(|| field_value(entry))
        }),
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|parsed| extract_from_collection(&parsed, field_id)),
        Value::Object(object) => object
            .get(field_id)
            .or_else(|| object.get(DEFAULT_PURCHASE_METADATA_FIELD_KEY))
            .cloned(),
        _ => None,
    }
}

/// Value of `field_id` on a contact, searching every custom field shape.
pub fn extract_custom_field(contact: &Value, field_id: &str) -> Option<Value> {
    ["customFields", "custom_fields", "fields"]
        .iter()
        .filter_map(|key| contact.get(*key))
        .find_map(|collection| extract_from_collection(collection, field_id))
}

/// Split a display name into first and last name.
pub fn split_name(name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (None, None);
    };
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() => (Some(rest.join(" ")), Some((*last).to_string())),
        _ => (Some(name.to_string()), None),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `{{ key }}` placeholders from `values`. Unknown keys render empty;
/// an empty result yields `fallback`.
pub fn render_template(template: Option<&str>, values: &Map<String, Value>, fallback: &str) -> String {
    let Some(template) = template else {
        return fallback.to_string();
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = after[..end].trim();
        if !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
            out.push_str(&values.get(key).map(render_value).unwrap_or_default());
        } else {
            out.push_str(&rest[start..start + 2 + end + 2]);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    if out.is_empty() { fallback.to_string() } else { out }
}

/// Map context keys to custom field ids, skipping absent values.
pub fn build_custom_fields(map: &HashMap<String, String>, values: &Map<String, Value>) -> Vec<CustomFieldInput> {
    let mut fields: Vec<CustomFieldInput> = map
        .iter()
        .filter(|(_, field_id)| !field_id.is_empty())
        .filter_map(|(key, field_id)| {
            values
                .get(key)
                .filter(|v| !v.is_null())
                .map(|value| CustomFieldInput {
                    id: field_id.clone(),
                    value: value.clone(),
                })
        })
        .collect();
    fields.sort_by(|a, b| a.id.cmp(&b.id));
    fields
}
