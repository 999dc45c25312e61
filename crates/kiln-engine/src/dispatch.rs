use kiln_contracts::error::diagnostic_excerpt;
use kiln_contracts::extract::first_string;
use kiln_contracts::registry::{ProviderSpec, StatusClass};
use kiln_contracts::result::{
    asset_from_binary, asset_from_payload, failure_reason, media_type, raw_status, require_asset,
};
use kiln_contracts::{AssetLocator, ClassifiedError};
use serde_json::json;

use crate::transport::{InboundReply, TransportError};

/// What one submit call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The provider answered with the asset inside the submit response.
    Immediate(AssetLocator),
    /// The provider queued the work under this task id.
    Accepted(String),
}

/// Classifies a submit reply.
///
/// Order: HTTP failure, raw media body, unparseable JSON, reported failure,
/// usable asset, task id. A 2xx with none of those is a protocol error.
pub fn classify_submission(
    spec: &ProviderSpec,
    reply: &InboundReply,
    secret: Option<&str>,
) -> Result<SubmitOutcome, ClassifiedError> {
    if !reply.is_success() {
        return Err(classify_http_failure(spec, reply, secret));
    }

    if reply.content_type.as_deref().and_then(media_type).is_some() {
        return asset_from_binary(reply.content_type.as_deref(), &reply.body)
            .map(SubmitOutcome::Immediate)
            .ok_or_else(|| {
                ClassifiedError::protocol("asset_missing", "completed but no asset returned")
                    .with_details(json!({"provider": spec.id, "reason": "empty media body"}))
            });
    }

    let payload = reply.parse_json().map_err(|_| {
        ClassifiedError::protocol("response_malformed", "Provider returned an unreadable response.")
            .with_details(json!({
                "provider": spec.id,
                "status": reply.status,
                "body": diagnostic_excerpt(&reply.text(), secret),
            }))
    })?;

    let status = raw_status(spec, &payload).map(|raw| (spec.vocabulary.classify(&raw), raw));
    match &status {
        Some((StatusClass::Failed, raw)) => {
            let reason = failure_reason(spec, &payload, raw, secret);
            let mut err = generation_failed(spec, &reason, secret);
            err.details["status"] = json!(raw);
            return Err(err);
        }
        Some((StatusClass::Succeeded, _)) => {
            return require_asset(spec, &payload).map(SubmitOutcome::Immediate);
        }
        Some((StatusClass::Processing, _)) | None => {}
    }

    if status.is_none() {
        if let Some(asset) = asset_from_payload(spec, &payload) {
            return Ok(SubmitOutcome::Immediate(asset));
        }
    }

    if spec.polls() {
        if let Some(task_id) = first_string(&spec.rules.task_id, &payload) {
            return Ok(SubmitOutcome::Accepted(task_id));
        }
        return Err(
            ClassifiedError::protocol("task_id_missing", "no task ID returned").with_details(json!({
                "provider": spec.id,
                "body": diagnostic_excerpt(&payload.to_string(), secret),
            })),
        );
    }

    Err(
        ClassifiedError::protocol("asset_missing", "completed but no asset returned").with_details(
            json!({
                "provider": spec.id,
                "body": diagnostic_excerpt(&payload.to_string(), secret),
            }),
        ),
    )
}

/// The provider ran the job and reported failure. The provider's own text is
/// diagnostic only; callers get a fixed message.
pub fn generation_failed(spec: &ProviderSpec, reason: &str, secret: Option<&str>) -> ClassifiedError {
    ClassifiedError::upstream(
        "generation_failed",
        "The provider could not complete this generation.",
    )
    .with_details(json!({
        "provider": spec.id,
        "reason": diagnostic_excerpt(reason, secret),
    }))
}

/// Non-2xx reply to a classified error. The provider body lands in hidden
/// details only, scrubbed of the caller's key.
pub fn classify_http_failure(
    spec: &ProviderSpec,
    reply: &InboundReply,
    secret: Option<&str>,
) -> ClassifiedError {
    ClassifiedError::from_provider_status(reply.status).with_details(json!({
        "provider": spec.id,
        "status": reply.status,
        "body": diagnostic_excerpt(&reply.text(), secret),
    }))
}

pub fn classify_transport(spec: &ProviderSpec, err: &TransportError) -> ClassifiedError {
    let details = json!({"provider": spec.id, "cause": err.to_string()});
    match err {
        TransportError::Timeout => ClassifiedError::network(
            "provider_timeout",
            format!("{} did not respond in time.", spec.display_name),
        )
        .with_http_status(504),
        TransportError::Connect(_) => ClassifiedError::network(
            "provider_unreachable",
            format!("Could not reach {}.", spec.display_name),
        ),
        TransportError::Other(_) => ClassifiedError::network(
            "transport_failed",
            format!("Request to {} failed.", spec.display_name),
        ),
    }
    .with_details(details)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use kiln_contracts::registry::{ProviderRegistry, ProviderSpec};
    use kiln_contracts::{AssetLocator, ErrorKind};
    use serde_json::json;

    use super::{classify_submission, classify_transport, SubmitOutcome};
    use crate::fallback::allows_soft_fallback;
    use crate::transport::{InboundReply, TransportError};

    fn spec(id: &str) -> ProviderSpec {
        match ProviderRegistry::new(None).get(id) {
            Some(spec) => spec.clone(),
            None => panic!("{id} missing"),
        }
    }

    #[test]
    fn async_provider_returns_task_id() {
        let reply = InboundReply::json(201, &json!({"id": "t1", "status": "starting"}));
        assert_eq!(
            classify_submission(&spec("replicate"), &reply, None),
            Ok(SubmitOutcome::Accepted("t1".to_string()))
        );

        let reply = InboundReply::json(200, &json!({"code": 0, "data": {"task_id": "k-7"}}));
        assert_eq!(
            classify_submission(&spec("kling"), &reply, None),
            Ok(SubmitOutcome::Accepted("k-7".to_string()))
        );
    }

    #[test]
    fn replicate_wait_header_can_finish_synchronously() {
        let reply = InboundReply::json(
            201,
            &json!({"id": "t1", "status": "succeeded", "output": ["https://cdn/x.png"]}),
        );
        assert_eq!(
            classify_submission(&spec("replicate"), &reply, None),
            Ok(SubmitOutcome::Immediate(AssetLocator::Url(
                "https://cdn/x.png".to_string()
            )))
        );
    }

    #[test]
    fn sync_provider_without_asset_is_protocol_error() {
        let reply = InboundReply::json(200, &json!({"data": []}));
        let err = classify_submission(&spec("openai"), &reply, None).err();
        assert_eq!(err.map(|err| (err.kind, err.code)), Some((ErrorKind::Protocol, "asset_missing")));
    }

    #[test]
    fn async_provider_without_task_id_is_protocol_error() {
        let reply = InboundReply::json(200, &json!({"status": "queued"}));
        let err = classify_submission(&spec("luma"), &reply, None).err();
        let Some(err) = err else {
            panic!("expected task_id_missing");
        };
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert_eq!(err.code, "task_id_missing");
        assert_eq!(err.message, "no task ID returned");
    }

    #[test]
    fn binary_image_body_is_wrapped_inline() {
        let reply = InboundReply {
            status: 200,
            content_type: Some("image/jpeg".to_string()),
            body: Bytes::from_static(&[0xff, 0xd8, 0xff]),
        };
        let outcome = classify_submission(&spec("pollinations"), &reply, None);
        assert!(matches!(outcome, Ok(SubmitOutcome::Immediate(AssetLocator::Inline { .. }))));
    }

    #[test]
    fn http_failures_keep_the_key_out_of_details() {
        let reply = InboundReply::json(401, &json!({"detail": "bad key sk-live-99"}));
        let err = classify_submission(&spec("openai"), &reply, Some("sk-live-99")).err();
        let Some(err) = err else {
            panic!("expected auth error");
        };
        assert_eq!(err.kind, ErrorKind::AuthRequired);
        assert!(!err.details.to_string().contains("sk-live-99"));
        assert!(!err.public_body().to_string().contains("sk-live-99"));
    }

    #[test]
    fn immediate_failure_status_is_upstream() {
        let reply = InboundReply::json(
            200,
            &json!({"id": "t1", "status": "failed", "error": "NSFW content detected"}),
        );
        let err = classify_submission(&spec("replicate"), &reply, None).err();
        let Some(err) = err else {
            panic!("expected generation_failed");
        };
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert_eq!(err.code, "generation_failed");
        assert_eq!(err.message, "The provider could not complete this generation.");
        assert_eq!(err.details["reason"], "NSFW content detected");
    }

    #[test]
    fn reported_failure_never_echoes_the_key() {
        let reply = InboundReply::json(
            200,
            &json!({"status": "failed", "error": "Invalid token r8_live_SECRET for account"}),
        );
        let err = classify_submission(&spec("replicate"), &reply, Some("r8_live_SECRET")).err();
        let Some(err) = err else {
            panic!("expected generation_failed");
        };
        assert_eq!(err.code, "generation_failed");
        assert!(!err.public_body().to_string().contains("r8_live_SECRET"));
        assert!(!err.to_string().contains("r8_live_SECRET"));
        assert!(!err.details.to_string().contains("r8_live_SECRET"));
        assert_eq!(err.details["reason"], "Invalid token [redacted] for account");
    }

    #[test]
    fn unparseable_body_is_protocol_error() {
        let reply = InboundReply {
            status: 200,
            content_type: Some("text/html".to_string()),
            body: Bytes::from_static(b"<html>gateway</html>"),
        };
        let err = classify_submission(&spec("openai"), &reply, None).err();
        assert_eq!(err.map(|err| err.code), Some("response_malformed"));
    }

    #[test]
    fn transport_failures_are_network_errors() {
        let replicate = spec("replicate");
        let timed_out = classify_transport(&replicate, &TransportError::Timeout);
        assert_eq!(timed_out.kind, ErrorKind::Network);
        assert_eq!(timed_out.code, "provider_timeout");
        assert_eq!(timed_out.http_status, 504);
        assert!(allows_soft_fallback(&classify_transport(
            &spec("pollinations"),
            &TransportError::Timeout
        )));
        assert_eq!(
            classify_transport(&replicate, &TransportError::Connect("refused".to_string())).kind,
            ErrorKind::Network
        );
    }
}
