use serde_json::{json, Value as JsonValue};

use crate::catalog::{self, ResolvedModel};

use super::default_safety_settings;

/// Prepare a native Gemini request body for the CodeAssist envelope:
/// default safety settings, the variant's thinking configuration, and
/// Google-Search grounding for `-search` names. Caller-supplied fields
/// win over everything injected here.
pub fn prepare_native_request(
    mut body: JsonValue,
    resolved: &ResolvedModel,
    requested_name: &str,
) -> JsonValue {
    let Some(obj) = body.as_object_mut() else {
        return body;
    };

    if !obj.contains_key("safetySettings") {
        obj.insert(
            "safetySettings".to_string(),
            serde_json::to_value(default_safety_settings()).unwrap_or(JsonValue::Null),
        );
    }

    // Image-generation names take no thinkingConfig even on thinking bases.
    if resolved.base.supports_thinking && !requested_name.contains("-image") {
        if let Some(policy) = catalog::thinking_for(resolved, None) {
            let config = obj
                .entry("generationConfig")
                .or_insert_with(|| json!({}));
            if let Some(config) = config.as_object_mut() {
                let thinking = config
                    .entry("thinkingConfig")
                    .or_insert_with(|| json!({}));
                if let Some(thinking) = thinking.as_object_mut() {
                    thinking.insert(
                        "includeThoughts".to_string(),
                        JsonValue::Bool(policy.include_thoughts),
                    );
                    if !thinking.contains_key("thinkingBudget") {
                        thinking.insert(
                            "thinkingBudget".to_string(),
                            JsonValue::from(policy.thinking_budget),
                        );
                    }
                }
            }
        }
    }

    if resolved.is_search() {
        let tools = obj.entry("tools").or_insert_with(|| json!([]));
        if let Some(tools) = tools.as_array_mut() {
            let already_grounded = tools
                .iter()
                .any(|tool| tool.get("googleSearch").is_some());
            if !already_grounded {
                tools.push(json!({"googleSearch": {}}));
            }
        }
    }

    body
}
