//! Folds provider responses into canonical statuses and asset locators.

use serde_json::{json, Value};

use crate::error::{scrub_secret, truncate_text, ClassifiedError, DETAIL_BODY_MAX_CHARS};
use crate::extract::{extract_asset, first_string};
use crate::registry::{ProviderSpec, StatusClass};
use crate::status::{AssetLocator, GenerationStatus};

pub const FAILURE_REASON_MAX_CHARS: usize = 200;

pub fn asset_from_payload(spec: &ProviderSpec, payload: &Value) -> Option<AssetLocator> {
    extract_asset(&spec.rules.assets, payload)
}

/// Inline locator for a raw media body (`image/*` or `video/*`).
pub fn asset_from_binary(content_type: Option<&str>, bytes: &[u8]) -> Option<AssetLocator> {
    let mime_type = media_type(content_type?)?;
    AssetLocator::inline_from_bytes(&mime_type, bytes)
}

pub fn media_type(content_type: &str) -> Option<String> {
    let mime_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime_type.starts_with("image/") || mime_type.starts_with("video/") {
        Some(mime_type)
    } else {
        None
    }
}

/// A terminal success must carry a usable asset. Never returns a result with
/// an empty locator.
pub fn require_asset(spec: &ProviderSpec, payload: &Value) -> Result<AssetLocator, ClassifiedError> {
    if let Some(asset) = asset_from_payload(spec, payload) {
        return Ok(asset);
    }
    let excerpt = truncate_text(&payload.to_string(), DETAIL_BODY_MAX_CHARS);
    tracing::warn!(
        provider = %spec.id,
        payload = %excerpt,
        "provider reported success without an asset"
    );
    Err(
        ClassifiedError::protocol("asset_missing", "completed but no asset returned")
            .with_details(json!({ "provider": spec.id, "body": excerpt })),
    )
}

pub fn raw_status(spec: &ProviderSpec, payload: &Value) -> Option<String> {
    first_string(&spec.rules.status, payload)
}

/// Provider-reported failure text, scrubbed of `secret`, collapsed to one
/// line and bounded.
pub fn failure_reason(
    spec: &ProviderSpec,
    payload: &Value,
    fallback: &str,
    secret: Option<&str>,
) -> String {
    let raw = first_string(&spec.rules.error, payload).unwrap_or_else(|| fallback.to_string());
    let scrubbed = scrub_secret(&raw, secret);
    let collapsed = scrubbed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "generation failed".to_string();
    }
    truncate_text(&collapsed, FAILURE_REASON_MAX_CHARS)
}

/// Maps one status payload onto the canonical status.
///
/// A payload without any recognisable status field is still processing
/// unless it already carries an asset.
pub fn status_from_payload(
    spec: &ProviderSpec,
    payload: &Value,
    secret: Option<&str>,
) -> Result<GenerationStatus, ClassifiedError> {
    let Some(raw) = raw_status(spec, payload) else {
        return Ok(match asset_from_payload(spec, payload) {
            Some(asset) => GenerationStatus::Succeeded { asset },
            None => GenerationStatus::Processing,
        });
    };
    match spec.vocabulary.classify(&raw) {
        StatusClass::Succeeded => Ok(GenerationStatus::Succeeded {
            asset: require_asset(spec, payload)?,
        }),
        StatusClass::Failed => Ok(GenerationStatus::Failed {
            reason: failure_reason(spec, payload, &raw, secret),
        }),
        StatusClass::Processing => Ok(GenerationStatus::Processing),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{asset_from_binary, failure_reason, status_from_payload};
    use crate::error::ErrorKind;
    use crate::registry::{ProviderRegistry, ProviderSpec};
    use crate::status::{AssetLocator, GenerationStatus};

    fn provider(id: &str) -> ProviderSpec {
        match ProviderRegistry::new(None).get(id) {
            Some(spec) => spec.clone(),
            None => panic!("{id} missing from catalog"),
        }
    }

    #[test]
    fn replicate_lifecycle_maps_onto_canonical_status() {
        let replicate = provider("replicate");
        let starting =
            status_from_payload(&replicate, &json!({"id": "t1", "status": "starting"}), None);
        assert_eq!(starting.ok(), Some(GenerationStatus::Processing));

        let done = status_from_payload(
            &replicate,
            &json!({"id": "t1", "status": "succeeded", "output": ["https://cdn/x.png"]}),
            None,
        );
        assert_eq!(
            done.ok(),
            Some(GenerationStatus::Succeeded {
                asset: AssetLocator::Url("https://cdn/x.png".to_string())
            })
        );
    }

    #[test]
    fn success_without_asset_is_a_protocol_error() {
        let replicate = provider("replicate");
        let err =
            status_from_payload(&replicate, &json!({"status": "succeeded", "output": null}), None)
                .err();
        let Some(err) = err else {
            panic!("expected asset_missing");
        };
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert_eq!(err.code, "asset_missing");
        assert_eq!(err.message, "completed but no asset returned");
    }

    #[test]
    fn failure_uses_provider_reason_when_present() {
        let luma = provider("luma");
        let status = status_from_payload(
            &luma,
            &json!({"state": "failed", "failure_reason": "prompt\n  was   blocked"}),
            None,
        );
        assert_eq!(
            status.ok(),
            Some(GenerationStatus::Failed {
                reason: "prompt was blocked".to_string()
            })
        );

        let bfl = provider("bfl");
        let status = status_from_payload(&bfl, &json!({"status": "Content Moderated"}), None);
        assert_eq!(
            status.ok(),
            Some(GenerationStatus::Failed {
                reason: "Content Moderated".to_string()
            })
        );
    }

    #[test]
    fn failure_reason_never_echoes_the_key() {
        let luma = provider("luma");
        let status = status_from_payload(
            &luma,
            &json!({"state": "failed", "failure_reason": "auth header luma-SECRET-key rejected"}),
            Some("luma-SECRET-key"),
        );
        assert_eq!(
            status.ok(),
            Some(GenerationStatus::Failed {
                reason: "auth header [redacted] rejected".to_string()
            })
        );
    }

    #[test]
    fn failure_reason_is_bounded() {
        let runway = provider("runway");
        let reason = failure_reason(&runway, &json!({"failure": "x".repeat(500)}), "FAILED", None);
        assert_eq!(reason.chars().count(), 201);
        assert!(reason.ends_with('…'));
    }

    #[test]
    fn missing_status_field_depends_on_asset_presence() {
        let kling = provider("kling");
        assert_eq!(
            status_from_payload(&kling, &json!({"data": {}}), None).ok(),
            Some(GenerationStatus::Processing)
        );
        let with_asset = json!({"data": {"task_result": {"videos": [{"url": "https://cdn/v.mp4"}]}}});
        assert!(matches!(
            status_from_payload(&kling, &with_asset, None),
            Ok(GenerationStatus::Succeeded { .. })
        ));
    }

    #[test]
    fn binary_bodies_become_inline_assets_only_for_media() {
        let asset = asset_from_binary(Some("image/jpeg; charset=binary"), &[0xff, 0xd8]);
        assert!(matches!(asset, Some(AssetLocator::Inline { ref mime_type, .. }) if mime_type == "image/jpeg"));
        assert_eq!(asset_from_binary(Some("text/html"), b"<html>"), None);
        assert_eq!(asset_from_binary(None, b"abc"), None);
        assert_eq!(asset_from_binary(Some("video/mp4"), &[]), None);
    }
}
