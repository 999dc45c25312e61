use std::path::Path;

use serde_json::{json, Map, Value};

use crate::status::GenerationResult;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

pub fn build_receipt(
    result: &GenerationResult,
    asset_path: Option<&Path>,
    receipt_path: &Path,
    result_metadata: &Map<String, Value>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&json!({
            "request_id": result.request_id,
            "provider": result.provider,
            "model": result.model,
            "kind": result.kind,
            "prompt": result.prompt,
            "parameters": result.parameters,
        })),
    );
    root.insert(
        "result".to_string(),
        sanitize_payload(&json!({
            "asset": result.asset,
            "inline": result.asset.is_inline(),
            "task_id": result.task_id,
            "degraded": result.degraded,
            "completed_at": result.completed_at,
        })),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "asset_path".to_string(),
        asset_path
            .map(|path| Value::String(path.to_string_lossy().to_string()))
            .unwrap_or(Value::Null),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    root.insert(
        "result_metadata".to_string(),
        sanitize_payload(&Value::Object(result_metadata.clone())),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Drops inline media and anything shaped like a credential.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::String(text) if text.starts_with("data:") => {
            Value::String("<omitted>".to_string())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "b64_json" | "base64" | "image_bytes") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                if is_secret_key(&lowered) {
                    out.insert(key.clone(), Value::String("[redacted]".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn is_secret_key(lowered: &str) -> bool {
    ["api_key", "apikey", "token", "secret", "authorization", "credential", "x-key"]
        .iter()
        .any(|needle| lowered.contains(needle))
}
