//! Reshaping of service payloads for the UI. Everything here is pure.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use shared::{MessagePart, ProviderCatalogEntry, UiProvider, UiProviders};

/// Human-readable text of one conversational turn.
///
/// Only visible text parts count. Assistants supersede partial output with a
/// final part, so the last one wins; for any other role the longest part
/// wins, which drops short echoes in favour of the real input.
pub fn extract_message_text(parts: &[MessagePart], role: Option<&str>) -> String {
    let mut visible = parts
        .iter()
        .filter(|p| p.is_visible_text())
        .map(|p| p.text.as_deref().unwrap_or(""));

    let chosen = if role == Some("assistant") {
        visible.last()
    } else {
        visible.fold(None, |best: Option<&str>, text| match best {
            Some(b) if b.chars().count() >= text.chars().count() => Some(b),
            _ => Some(text),
        })
    };
    chosen.unwrap_or_default().to_string()
}

/// Parse a raw parts array, skipping entries that are not part-shaped.
pub fn parse_parts(raw: &Value) -> Vec<MessagePart> {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Flatten the provider catalog; model ids become `providerID/modelID`.
pub fn to_ui_providers(
    providers: &[ProviderCatalogEntry],
    defaults: &BTreeMap<String, String>,
) -> UiProviders {
    let providers = providers
        .iter()
        .map(|p| UiProvider {
            name: p
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| p.id.clone()),
            models: p
                .models
                .keys()
                .map(|model_id| format!("{}/{}", p.id, model_id))
                .collect(),
        })
        .collect();
    let defaults = defaults
        .iter()
        .map(|(provider_id, model_id)| {
            (provider_id.clone(), format!("{}/{}", provider_id, model_id))
        })
        .collect();
    UiProviders {
        providers,
        defaults,
    }
}

/// Parse a `{ providers, default }` catalog body and flatten it.
pub fn ui_providers_from_catalog(raw: &Value) -> UiProviders {
    let providers: Vec<ProviderCatalogEntry> = raw
        .get("providers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let defaults: BTreeMap<String, String> = raw
        .get("default")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|m| (k.clone(), m.to_string())))
                .collect()
        })
        .unwrap_or_default();
    to_ui_providers(&providers, &defaults)
}

/// One `{ info, parts }` message as `{ id, role, text, createdAt, parts }`.
pub fn normalize_message(raw: &Value) -> Value {
    let info = raw.get("info").unwrap_or(&Value::Null);
    let role = info.get("role").and_then(Value::as_str);
    let parts_raw = raw.get("parts").cloned().unwrap_or_else(|| json!([]));
    let text = extract_message_text(&parse_parts(&parts_raw), role);
    let created_at = info
        .pointer("/time/created")
        .and_then(Value::as_i64)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string());

    json!({
        "id": info.get("id").cloned().unwrap_or(Value::Null),
        "role": role,
        "text": text,
        "createdAt": created_at,
        "parts": parts_raw,
    })
}

pub fn normalize_messages(raw: &Value) -> Value {
    match raw.as_array() {
        Some(items) => Value::Array(items.iter().map(normalize_message).collect()),
        None => json!([]),
    }
}

/// Outgoing parts for a chat turn, always containing a text part.
///
/// Untyped entries are dropped. With no typed entries left the parts are
/// replaced by a text part built from `message`; typed parts without any
/// text entry get one prepended. Returns `None` when no text part exists
/// and `message` is blank.
pub fn build_prompt_parts(message: Option<&str>, parts: &[Value]) -> Option<Vec<Value>> {
    let typed: Vec<Value> = parts
        .iter()
        .filter(|p| {
            p.get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| !t.is_empty())
        })
        .cloned()
        .collect();

    if typed.iter().any(|p| p["type"] == "text") {
        return Some(typed);
    }
    let text = message.filter(|m| !m.trim().is_empty())?;
    let mut out = Vec::with_capacity(typed.len() + 1);
    out.push(json!({ "type": "text", "text": text }));
    out.extend(typed);
    Some(out)
}
