use indexmap::IndexMap;

use super::spec::{
    AuthScheme, ExtractionRules, HttpMethod, PayloadShape, ProviderSpec, StatusVocabulary,
    SubmitRoute,
};
use crate::extract::AssetRule;
use crate::request::GenerationKind::{self, Image, Video};

fn route(kind: GenerationKind, method: HttpMethod, path: &str, model: &str) -> SubmitRoute {
    SubmitRoute {
        kind,
        method,
        path: path.to_string(),
        default_model: model.to_string(),
    }
}

struct Entry {
    id: &'static str,
    display_name: &'static str,
    auth: AuthScheme,
    api_base: &'static str,
    credential_env: &'static [&'static str],
    payload: PayloadShape,
    routes: Vec<SubmitRoute>,
    status_path: Option<&'static str>,
    extra_headers: &'static [(&'static str, &'static str)],
    rules: ExtractionRules,
    vocabulary: StatusVocabulary,
    predictable_url: bool,
}

impl Entry {
    fn build(self) -> ProviderSpec {
        let mut kinds: Vec<GenerationKind> = Vec::new();
        for route in &self.routes {
            if !kinds.contains(&route.kind) {
                kinds.push(route.kind);
            }
        }
        ProviderSpec {
            id: self.id.to_string(),
            display_name: self.display_name.to_string(),
            kinds,
            requires_key: self.auth != AuthScheme::None,
            auth: self.auth,
            api_base: self.api_base.to_string(),
            api_base_env: Some(format!("{}_API_BASE", self.id.to_ascii_uppercase())),
            credential_env: self
                .credential_env
                .iter()
                .map(|name| name.to_string())
                .collect(),
            payload: self.payload,
            routes: self.routes,
            status_path: self.status_path.map(str::to_string),
            extra_headers: self
                .extra_headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            rules: self.rules,
            vocabulary: self.vocabulary,
            predictable_url: self.predictable_url,
        }
    }
}

pub(super) fn default_providers() -> IndexMap<String, ProviderSpec> {
    let entries = vec![
        Entry {
            id: "openai",
            display_name: "OpenAI Images",
            auth: AuthScheme::Bearer,
            api_base: "https://api.openai.com/v1",
            credential_env: &["OPENAI_API_KEY", "OPENAI_KEY"],
            payload: PayloadShape::OpenAiImages,
            routes: vec![route(Image, HttpMethod::Post, "/images/generations", "dall-e-3")],
            status_path: None,
            extra_headers: &[],
            rules: ExtractionRules::new(vec![
                AssetRule::base64("data.0.b64_json", "image/png"),
                AssetRule::url("data.0.url"),
            ]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
        Entry {
            id: "stability",
            display_name: "Stability AI",
            auth: AuthScheme::Bearer,
            api_base: "https://api.stability.ai",
            credential_env: &["STABILITY_API_KEY"],
            payload: PayloadShape::StabilityTextToImage,
            routes: vec![route(
                Image,
                HttpMethod::Post,
                "/v1/generation/{model}/text-to-image",
                "stable-diffusion-xl-1024-v1-0",
            )],
            status_path: None,
            extra_headers: &[("Accept", "application/json")],
            rules: ExtractionRules::new(vec![
                AssetRule::base64("artifacts.0.base64", "image/png"),
                AssetRule::base64("image", "image/png"),
            ]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
        Entry {
            id: "fal",
            display_name: "fal.ai",
            auth: AuthScheme::KeyPrefix,
            api_base: "https://fal.run",
            credential_env: &["FAL_KEY", "FAL_API_KEY"],
            payload: PayloadShape::FalRun,
            routes: vec![route(Image, HttpMethod::Post, "/{model}", "fal-ai/flux/schnell")],
            status_path: None,
            extra_headers: &[],
            rules: ExtractionRules::new(vec![
                AssetRule::url("images.0.url"),
                AssetRule::url("image.url"),
            ]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
        Entry {
            id: "pollinations",
            display_name: "Pollinations",
            auth: AuthScheme::None,
            api_base: "https://image.pollinations.ai",
            credential_env: &[],
            payload: PayloadShape::PollinationsQuery,
            routes: vec![route(Image, HttpMethod::Get, "/prompt", "flux")],
            status_path: None,
            extra_headers: &[],
            rules: ExtractionRules::new(vec![AssetRule::url("url")]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: true,
        },
        Entry {
            id: "replicate",
            display_name: "Replicate",
            auth: AuthScheme::Bearer,
            api_base: "https://api.replicate.com/v1",
            credential_env: &["REPLICATE_API_TOKEN", "REPLICATE_API_KEY"],
            payload: PayloadShape::ReplicatePrediction,
            routes: vec![
                route(
                    Image,
                    HttpMethod::Post,
                    "/models/{model}/predictions",
                    "black-forest-labs/flux-schnell",
                ),
                route(
                    Video,
                    HttpMethod::Post,
                    "/models/{model}/predictions",
                    "minimax/video-01",
                ),
            ],
            status_path: Some("/predictions/{id}"),
            extra_headers: &[],
            rules: ExtractionRules::new(vec![AssetRule::url("output"), AssetRule::url("output.0")])
                .with_task_id(&["id", "prediction.id"]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
        Entry {
            id: "bfl",
            display_name: "Black Forest Labs",
            auth: AuthScheme::Header("x-key".to_string()),
            api_base: "https://api.bfl.ai",
            credential_env: &["BFL_API_KEY", "FLUX_API_KEY"],
            payload: PayloadShape::BflFlux,
            routes: vec![route(Image, HttpMethod::Post, "/v1/{model}", "flux-pro-1.1")],
            status_path: Some("/v1/get_result?id={id}"),
            extra_headers: &[],
            rules: ExtractionRules::new(vec![AssetRule::url("result.sample")]),
            vocabulary: StatusVocabulary::default().with_failed(&[
                "Request Moderated",
                "Content Moderated",
                "Task not found",
            ]),
            predictable_url: false,
        },
        Entry {
            id: "luma",
            display_name: "Luma Dream Machine",
            auth: AuthScheme::Bearer,
            api_base: "https://api.lumalabs.ai",
            credential_env: &["LUMA_API_KEY", "LUMAAI_API_KEY"],
            payload: PayloadShape::LumaGeneration,
            routes: vec![route(
                Video,
                HttpMethod::Post,
                "/dream-machine/v1/generations",
                "ray-2",
            )],
            status_path: Some("/dream-machine/v1/generations/{id}"),
            extra_headers: &[],
            rules: ExtractionRules::new(vec![AssetRule::url("assets.video")])
                .with_status(&["state", "status"])
                .with_error(&["failure_reason", "error", "message"]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
        Entry {
            id: "runway",
            display_name: "Runway",
            auth: AuthScheme::Bearer,
            api_base: "https://api.dev.runwayml.com",
            credential_env: &["RUNWAY_API_KEY", "RUNWAYML_API_SECRET"],
            payload: PayloadShape::RunwayTask,
            routes: vec![route(Video, HttpMethod::Post, "/v1/text_to_video", "gen4_turbo")],
            status_path: Some("/v1/tasks/{id}"),
            extra_headers: &[("X-Runway-Version", "2024-11-06")],
            rules: ExtractionRules::new(vec![AssetRule::url("output.0")])
                .with_error(&["failure", "failureCode", "error"]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
        Entry {
            id: "kling",
            display_name: "Kling",
            auth: AuthScheme::Bearer,
            api_base: "https://api.klingai.com",
            credential_env: &["KLING_API_KEY"],
            payload: PayloadShape::KlingTask,
            routes: vec![route(Video, HttpMethod::Post, "/v1/videos/text2video", "kling-v1")],
            status_path: Some("/v1/videos/text2video/{id}"),
            extra_headers: &[],
            rules: ExtractionRules::new(vec![AssetRule::url("data.task_result.videos.0.url")])
                .with_task_id(&["data.task_id", "task_id", "id"])
                .with_status(&["data.task_status"])
                .with_error(&["data.task_status_msg", "message"]),
            vocabulary: StatusVocabulary::default(),
            predictable_url: false,
        },
    ];

    entries
        .into_iter()
        .map(|entry| {
            let spec = entry.build();
            (spec.id.clone(), spec)
        })
        .collect()
}
