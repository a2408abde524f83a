//! Ollama compatibility: model-list mapping and the static descriptors the
//! Ollama client expects.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

/// Capability descriptor returned by `/api/show`.
pub fn show_response() -> Value {
    json!({
        "model_info": { "general.architecture": "CausalLM" },
        "capabilities": ["chat", "tools", "stop", "reasoning"]
    })
}

pub fn version_response(version: &str) -> Value {
    json!({ "version": version })
}

/// OpenAI `/v1/models` list -> Ollama `/api/tags` list.
pub fn openai_models_to_ollama(v: &Value) -> Value {
    let models: Vec<Value> = v
        .get("data")
        .and_then(Value::as_array)
        .map(|data| {
            data.iter()
                .filter_map(|m| {
                    let id = m.get("id").and_then(Value::as_str)?;
                    let created = m.get("created").and_then(Value::as_i64).unwrap_or(0);
                    Some(json!({
                        "name": id,
                        "model": id,
                        "modified_at": unix_to_rfc3339(created),
                    }))
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "models": models })
}

fn unix_to_rfc3339(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Merge several `/api/tags` bodies, keeping the first entry seen for each
/// model name. Entries without a string name are dropped.
pub fn merge_tags<I>(responses: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for response in responses {
        let Some(models) = response.get("models").and_then(Value::as_array) else {
            continue;
        };
        for model in models {
            let Some(name) = model.get("name").and_then(Value::as_str) else {
                continue;
            };
            if seen.insert(name.to_string()) {
                merged.push(model.clone());
            }
        }
    }
    json!({ "models": merged })
}
