//! Provider-specific request shapes. Everything else about a provider is
//! data in its registry entry.

use kiln_contracts::registry::{AuthScheme, HttpMethod, PayloadShape, ProviderSpec};
use kiln_contracts::request::{
    AspectRatio, GenerationParameters, ImageParameters, ImageQuality, VideoParameters,
    VideoQuality,
};
use kiln_contracts::{AssetLocator, ClassifiedError, Credential, GenerationKind, GenerationRequest};
use serde_json::{json, Map, Value};

use crate::transport::OutboundRequest;

pub fn resolved_model(spec: &ProviderSpec, request: &GenerationRequest) -> Option<String> {
    request
        .model
        .clone()
        .or_else(|| spec.route(request.kind).map(|route| route.default_model.clone()))
}

pub fn submit_request(
    spec: &ProviderSpec,
    request: &GenerationRequest,
) -> Result<OutboundRequest, ClassifiedError> {
    let route = spec.route(request.kind).ok_or_else(|| {
        ClassifiedError::validation(
            "kind_unsupported",
            format!("{} does not support {} generation.", spec.display_name, request.kind),
        )
    })?;
    let model = request
        .model
        .as_deref()
        .unwrap_or(route.default_model.as_str());
    let url = format!("{}{}", spec.api_base, route.path.replace("{model}", model));

    let outbound = match (spec.payload, &request.parameters) {
        (PayloadShape::PollinationsQuery, GenerationParameters::Image(params)) => {
            OutboundRequest::get(pollinations_url(&url, &request.prompt, model, params)?)
        }
        (shape, parameters) => {
            let body = submit_body(shape, model, &request.prompt, parameters);
            match route.method {
                HttpMethod::Post => OutboundRequest::post(url, body),
                HttpMethod::Get => OutboundRequest::get(url),
            }
        }
    };

    let mut outbound = with_auth(spec, outbound, request.credential.as_ref())?;
    if spec.payload == PayloadShape::ReplicatePrediction && request.kind == GenerationKind::Image {
        // Fast image models usually finish inside the held connection.
        outbound = outbound.header("Prefer", "wait");
    }
    Ok(outbound)
}

pub fn status_request(
    spec: &ProviderSpec,
    task_id: &str,
    credential: Option<&Credential>,
) -> Result<OutboundRequest, ClassifiedError> {
    let Some(path) = spec.status_path.as_deref() else {
        return Err(ClassifiedError::validation(
            "status_unsupported",
            format!("{} does not expose task status.", spec.display_name),
        ));
    };
    if task_id.is_empty()
        || !task_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
    {
        return Err(ClassifiedError::validation(
            "task_id_invalid",
            "Task ID contains unsupported characters.",
        ));
    }
    let url = format!("{}{}", spec.api_base, path.replace("{id}", task_id));
    with_auth(spec, OutboundRequest::get(url), credential)
}

/// URL the asset will live at without asking the provider, for providers
/// whose output address is a pure function of the request.
pub fn predictable_asset_url(spec: &ProviderSpec, request: &GenerationRequest) -> Option<AssetLocator> {
    if !spec.predictable_url || spec.payload != PayloadShape::PollinationsQuery {
        return None;
    }
    let route = spec.route(request.kind)?;
    let params = request.image_parameters()?;
    let model = request.model.as_deref().unwrap_or(route.default_model.as_str());
    let base = format!("{}{}", spec.api_base, route.path);
    let url = pollinations_url(&base, &request.prompt, model, params).ok()?;
    AssetLocator::url(&url)
}

fn with_auth(
    spec: &ProviderSpec,
    mut outbound: OutboundRequest,
    credential: Option<&Credential>,
) -> Result<OutboundRequest, ClassifiedError> {
    for (name, value) in &spec.extra_headers {
        outbound = outbound.header(name, value);
    }
    if spec.auth == AuthScheme::None {
        return Ok(outbound);
    }
    let Some(credential) = credential else {
        return Err(ClassifiedError::auth_required(
            "credential_missing",
            format!("{} requires an API key.", spec.display_name),
        ));
    };
    let key = credential.expose();
    Ok(match &spec.auth {
        AuthScheme::None => outbound,
        AuthScheme::Bearer => outbound.secret_header("Authorization", &format!("Bearer {key}")),
        AuthScheme::KeyPrefix => outbound.secret_header("Authorization", &format!("Key {key}")),
        AuthScheme::Header(name) => outbound.secret_header(name, key),
    })
}

fn pollinations_url(
    base: &str,
    prompt: &str,
    model: &str,
    params: &ImageParameters,
) -> Result<String, ClassifiedError> {
    let mut url = reqwest::Url::parse(base).map_err(|_| {
        ClassifiedError::protocol("endpoint_invalid", "Provider endpoint is not a valid URL.")
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            ClassifiedError::protocol("endpoint_invalid", "Provider endpoint is not a valid URL.")
        })?
        .push(prompt);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("width", &params.size.width.to_string())
            .append_pair("height", &params.size.height.to_string())
            .append_pair("model", model)
            .append_pair("nologo", "true");
        if let Some(seed) = params.seed {
            query.append_pair("seed", &seed.to_string());
        }
        if let Some(negative) = params.negative_prompt.as_deref() {
            query.append_pair("negative", negative);
        }
    }
    Ok(url.to_string())
}

fn submit_body(shape: PayloadShape, model: &str, prompt: &str, parameters: &GenerationParameters) -> Value {
    match (shape, parameters) {
        (PayloadShape::OpenAiImages, GenerationParameters::Image(params)) => json!({
            "model": model,
            "prompt": prompt,
            "n": 1,
            "size": params.size.to_string(),
            "quality": match params.quality {
                ImageQuality::Standard => "standard",
                ImageQuality::Hd => "hd",
            },
            "response_format": "b64_json",
        }),
        (PayloadShape::StabilityTextToImage, GenerationParameters::Image(params)) => {
            let mut prompts = vec![json!({"text": prompt, "weight": 1.0})];
            if let Some(negative) = params.negative_prompt.as_deref() {
                prompts.push(json!({"text": negative, "weight": -1.0}));
            }
            let mut body = json!({
                "text_prompts": prompts,
                "width": params.size.width,
                "height": params.size.height,
                "samples": 1,
            });
            insert_seed(&mut body, params.seed);
            body
        }
        (PayloadShape::FalRun, GenerationParameters::Image(params)) => {
            let mut body = json!({
                "prompt": prompt,
                "image_size": {"width": params.size.width, "height": params.size.height},
                "num_images": 1,
            });
            insert_optional(&mut body, "negative_prompt", params.negative_prompt.as_deref());
            insert_seed(&mut body, params.seed);
            body
        }
        (PayloadShape::BflFlux, GenerationParameters::Image(params)) => {
            let mut body = json!({
                "prompt": prompt,
                "width": params.size.width,
                "height": params.size.height,
            });
            insert_seed(&mut body, params.seed);
            body
        }
        (PayloadShape::ReplicatePrediction, GenerationParameters::Image(params)) => {
            let mut input = json!({
                "prompt": prompt,
                "width": params.size.width,
                "height": params.size.height,
                "num_outputs": 1,
            });
            insert_optional(&mut input, "negative_prompt", params.negative_prompt.as_deref());
            insert_seed(&mut input, params.seed);
            json!({ "input": input })
        }
        (PayloadShape::ReplicatePrediction, GenerationParameters::Video(params)) => json!({
            "input": {
                "prompt": prompt,
                "duration": params.duration_secs,
                "fps": params.fps,
                "aspect_ratio": params.aspect_ratio.as_str(),
            }
        }),
        (PayloadShape::LumaGeneration, GenerationParameters::Video(params)) => json!({
            "prompt": prompt,
            "model": model,
            "aspect_ratio": params.aspect_ratio.as_str(),
            "duration": format!("{}s", params.duration_secs),
            "resolution": match params.quality {
                VideoQuality::Standard => "540p",
                VideoQuality::High => "720p",
            },
        }),
        (PayloadShape::RunwayTask, GenerationParameters::Video(params)) => json!({
            "promptText": prompt,
            "model": model,
            "ratio": runway_ratio(params.aspect_ratio),
            "duration": params.duration_secs,
        }),
        (PayloadShape::KlingTask, GenerationParameters::Video(params)) => json!({
            "prompt": prompt,
            "model_name": model,
            "duration": params.duration_secs.to_string(),
            "aspect_ratio": params.aspect_ratio.as_str(),
            "mode": kling_mode(params),
        }),
        // Shape/kind mismatches are caught by route lookup; send the bare prompt.
        (_, parameters) => generic_body(model, prompt, parameters),
    }
}

fn generic_body(model: &str, prompt: &str, parameters: &GenerationParameters) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert("prompt".to_string(), Value::String(prompt.to_string()));
    if let Ok(Value::Object(extra)) = serde_json::to_value(parameters) {
        for (key, value) in extra {
            body.entry(key).or_insert(value);
        }
    }
    Value::Object(body)
}

fn runway_ratio(aspect_ratio: AspectRatio) -> &'static str {
    match aspect_ratio {
        AspectRatio::Landscape => "1280:720",
        AspectRatio::Portrait => "720:1280",
        AspectRatio::Square => "960:960",
    }
}

fn kling_mode(params: &VideoParameters) -> &'static str {
    match params.quality {
        VideoQuality::Standard => "std",
        VideoQuality::High => "pro",
    }
}

fn insert_seed(body: &mut Value, seed: Option<i64>) {
    if let (Some(seed), Some(map)) = (seed, body.as_object_mut()) {
        map.insert("seed".to_string(), Value::Number(seed.into()));
    }
}

fn insert_optional(body: &mut Value, key: &str, value: Option<&str>) {
    if let (Some(value), Some(map)) = (value, body.as_object_mut()) {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}
