//! Ordered field-probing over heterogeneous provider payloads.
//!
//! Providers disagree on where they put task ids, status strings and finished
//! assets. Instead of ad hoc `a || b || c` chains, each registry entry lists
//! [`FieldPath`]s and [`AssetRule`]s in priority order and these helpers take
//! the first one that resolves.

use std::fmt;

use serde_json::Value;

use crate::status::AssetLocator;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Dotted path into a JSON document. Numeric segments index arrays, so
/// `data.0.url` reads `payload["data"][0]["url"]`.
#[derive(Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn new(raw: &str) -> Self {
        let segments = raw
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Key(segment.to_string()),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(index), Value::Array(rows)) => rows.get(*index)?,
                // Some providers key objects by stringified indexes.
                (Segment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({})", self.raw)
    }
}

pub fn paths(raw: &[&str]) -> Vec<FieldPath> {
    raw.iter().map(|path| FieldPath::new(path)).collect()
}

/// First path resolving to a non-empty string. Numeric ids are stringified.
pub fn first_string(paths: &[FieldPath], payload: &Value) -> Option<String> {
    paths.iter().find_map(|path| match path.resolve(payload)? {
        Value::String(text) => Some(text.trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetEncoding {
    /// Remote `http(s)` URL, or an already-wrapped `data:` URI.
    Url,
    /// Bare base64 payload that must be wrapped into a `data:` URI.
    Base64 { mime_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRule {
    pub path: FieldPath,
    pub encoding: AssetEncoding,
}

impl AssetRule {
    pub fn url(path: &str) -> Self {
        Self {
            path: FieldPath::new(path),
            encoding: AssetEncoding::Url,
        }
    }

    pub fn base64(path: &str, mime_type: &str) -> Self {
        Self {
            path: FieldPath::new(path),
            encoding: AssetEncoding::Base64 {
                mime_type: mime_type.to_string(),
            },
        }
    }

    pub fn apply(&self, payload: &Value) -> Option<AssetLocator> {
        let raw = self.path.resolve(payload)?.as_str()?.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with("data:") {
            return AssetLocator::from_data_uri(raw);
        }
        match &self.encoding {
            AssetEncoding::Url => AssetLocator::url(raw),
            AssetEncoding::Base64 { mime_type } => AssetLocator::from_base64(mime_type, raw),
        }
    }
}

/// Applies rules in order; a rule whose value is malformed is skipped rather
/// than yielding a partial locator.
pub fn extract_asset(rules: &[AssetRule], payload: &Value) -> Option<AssetLocator> {
    rules.iter().find_map(|rule| rule.apply(payload))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{extract_asset, first_string, paths, AssetRule, FieldPath};
    use crate::status::AssetLocator;

    #[test]
    fn field_path_walks_objects_and_arrays() {
        let payload = json!({"data": [{"url": "https://cdn/a.png"}], "meta": {"0": "zero"}});
        assert_eq!(
            FieldPath::new("data.0.url").resolve(&payload),
            Some(&json!("https://cdn/a.png"))
        );
        assert_eq!(FieldPath::new("meta.0").resolve(&payload), Some(&json!("zero")));
        assert_eq!(FieldPath::new("data.1.url").resolve(&payload), None);
        assert_eq!(FieldPath::new("data.url").resolve(&payload), None);
    }

    #[test]
    fn first_string_respects_priority_and_skips_blanks() {
        let probes = paths(&["id", "task_id", "data.id"]);
        assert_eq!(
            first_string(&probes, &json!({"id": "  ", "task_id": "t-1", "data": {"id": "d-1"}})),
            Some("t-1".to_string())
        );
        assert_eq!(
            first_string(&probes, &json!({"data": {"id": 42}})),
            Some("42".to_string())
        );
        assert_eq!(first_string(&probes, &json!({"status": "queued"})), None);
    }

    #[test]
    fn base64_rule_wraps_into_data_uri() {
        let rules = vec![
            AssetRule::base64("data.0.b64_json", "image/png"),
            AssetRule::url("data.0.url"),
        ];
        let located = extract_asset(&rules, &json!({"data": [{"b64_json": "AQID"}]}));
        assert_eq!(
            located.map(|asset| asset.uri()),
            Some("data:image/png;base64,AQID".to_string())
        );
    }

    #[test]
    fn malformed_candidates_fall_through_to_next_rule() {
        let rules = vec![
            AssetRule::base64("image", "image/png"),
            AssetRule::url("output"),
            AssetRule::url("output.0"),
        ];
        let payload = json!({"image": "not base64 !!", "output": "relative/path.png"});
        assert_eq!(extract_asset(&rules, &payload), None);

        let payload = json!({"output": ["https://cdn/x.png"]});
        assert_eq!(
            extract_asset(&rules, &payload),
            Some(AssetLocator::Url("https://cdn/x.png".to_string()))
        );
    }

    #[test]
    fn url_rule_accepts_prewrapped_data_uri() {
        let rules = vec![AssetRule::url("video")];
        let located = extract_asset(&rules, &json!({"video": "data:video/mp4;base64,AAAA"}));
        assert!(matches!(located, Some(AssetLocator::Inline { ref mime_type, .. }) if mime_type == "video/mp4"));
    }
}
