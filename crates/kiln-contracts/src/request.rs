use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ClassifiedError;
use crate::registry::{ProviderRegistry, ProviderSpec};

pub const IMAGE_PROMPT_MAX_CHARS: usize = 2000;
pub const VIDEO_PROMPT_MAX_CHARS: usize = 1000;
pub const IMAGE_DIMENSION_MIN: u32 = 64;
pub const IMAGE_DIMENSION_MAX: u32 = 4096;
pub const DEFAULT_IMAGE_SIZE: ImageSize = ImageSize {
    width: 1024,
    height: 1024,
};
pub const VIDEO_DURATION_MIN_SECS: u32 = 1;
pub const VIDEO_DURATION_MAX_SECS: u32 = 10;
pub const DEFAULT_VIDEO_DURATION_SECS: u32 = 5;
pub const VIDEO_FPS_MIN: u32 = 8;
pub const VIDEO_FPS_MAX: u32 = 60;
pub const DEFAULT_VIDEO_FPS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Image,
    Video,
}

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    pub fn max_prompt_chars(self) -> usize {
        match self {
            Self::Image => IMAGE_PROMPT_MAX_CHARS,
            Self::Video => VIDEO_PROMPT_MAX_CHARS,
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" | "img" => Ok(Self::Image),
            "video" | "vid" => Ok(Self::Video),
            other => Err(format!("unknown generation kind '{other}'")),
        }
    }
}

/// Opaque provider secret. Never printed, serialized or echoed back.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short digest that lets logs correlate requests without the key.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

fn deserialize_credential<'de, D>(deserializer: D) -> Result<Option<Credential>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(Credential::new))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    /// Parses `WIDTHxHEIGHT`. Anything else, including dimensions outside
    /// the supported range, yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        let (width, height) = lowered.split_once('x')?;
        if width.is_empty()
            || height.is_empty()
            || !width.chars().chain(height.chars()).all(|ch| ch.is_ascii_digit())
        {
            return None;
        }
        let width = width.parse::<u32>().ok()?;
        let height = height.parse::<u32>().ok()?;
        let range = IMAGE_DIMENSION_MIN..=IMAGE_DIMENSION_MAX;
        if !range.contains(&width) || !range.contains(&height) {
            return None;
        }
        Some(Self { width, height })
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Serialize for ImageSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Standard,
    Hd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Standard,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Landscape,
    Portrait,
    Square,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Square => "1:1",
        }
    }
}

impl Serialize for AspectRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageParameters {
    pub size: ImageSize,
    pub quality: ImageQuality,
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoParameters {
    pub duration_secs: u32,
    pub fps: u32,
    pub quality: VideoQuality,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GenerationParameters {
    Image(ImageParameters),
    Video(VideoParameters),
}

/// Untyped caller input as it arrives from a route or the CLI. Every field is
/// optional; [`normalize`] decides what is required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawGenerationRequest {
    pub kind: Option<String>,
    pub prompt: Option<String>,
    pub provider: Option<String>,
    #[serde(
        alias = "apiKey",
        alias = "api_key",
        deserialize_with = "deserialize_credential"
    )]
    pub credential: Option<Credential>,
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    #[serde(alias = "negativePrompt")]
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
    pub duration: Option<Value>,
    pub fps: Option<Value>,
    #[serde(alias = "aspectRatio")]
    pub aspect_ratio: Option<String>,
}

/// Validated request. Created once per user action and never mutated; a
/// fallback step derives a new one via [`GenerationRequest::retarget`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub request_id: Uuid,
    pub kind: GenerationKind,
    pub prompt: String,
    pub provider: String,
    pub model: Option<String>,
    pub credential: Option<Credential>,
    pub parameters: GenerationParameters,
}

impl GenerationRequest {
    pub fn image_parameters(&self) -> Option<&ImageParameters> {
        match &self.parameters {
            GenerationParameters::Image(params) => Some(params),
            GenerationParameters::Video(_) => None,
        }
    }

    pub fn video_parameters(&self) -> Option<&VideoParameters> {
        match &self.parameters {
            GenerationParameters::Video(params) => Some(params),
            GenerationParameters::Image(_) => None,
        }
    }

    /// Same prompt and parameters aimed at another provider. The model
    /// override is dropped because model ids are provider-specific.
    pub fn retarget(
        &self,
        spec: &ProviderSpec,
        credential: Option<Credential>,
    ) -> Result<Self, ClassifiedError> {
        ensure_kind_supported(spec, self.kind)?;
        ensure_credential(spec, credential.as_ref())?;
        Ok(Self {
            request_id: self.request_id,
            kind: self.kind,
            prompt: self.prompt.clone(),
            provider: spec.id.clone(),
            model: None,
            credential,
            parameters: self.parameters.clone(),
        })
    }
}

/// Strips control characters and angle brackets. Whitespace controls become
/// plain spaces so words on separate lines stay separate.
pub fn sanitize_prompt(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter_map(|ch| match ch {
            '<' | '>' => None,
            ch if ch.is_control() && ch.is_whitespace() => Some(' '),
            ch if ch.is_control() => None,
            ch => Some(ch),
        })
        .collect();
    cleaned.trim().to_string()
}

/// Request Normalizer: validates and coerces raw input before any network
/// call. Recoverable oddities (unknown size, out-of-range duration) are
/// corrected in place; missing essentials are rejected.
pub fn normalize(
    raw: RawGenerationRequest,
    registry: &ProviderRegistry,
) -> Result<GenerationRequest, ClassifiedError> {
    let provider_id = raw
        .provider
        .as_deref()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ClassifiedError::validation("provider_missing", "A provider is required."))?;
    let spec = registry.get(&provider_id).ok_or_else(|| {
        ClassifiedError::validation(
            "provider_unknown",
            format!("Unknown provider '{provider_id}'."),
        )
    })?;

    let kind = match raw.kind.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.parse::<GenerationKind>().map_err(|_| {
            ClassifiedError::validation("kind_invalid", "Kind must be 'image' or 'video'.")
        })?,
        None if spec.supports(GenerationKind::Image) => GenerationKind::Image,
        None => spec.kinds.first().copied().unwrap_or(GenerationKind::Image),
    };
    ensure_kind_supported(spec, kind)?;

    let prompt = validate_prompt(raw.prompt.as_deref().unwrap_or_default(), kind)?;

    let parameters = match kind {
        GenerationKind::Image => GenerationParameters::Image(ImageParameters {
            size: raw
                .size
                .as_deref()
                .and_then(ImageSize::parse)
                .unwrap_or(DEFAULT_IMAGE_SIZE),
            quality: match raw.quality.as_deref().map(str::trim) {
                Some(value) if value.eq_ignore_ascii_case("hd") || value.eq_ignore_ascii_case("high") => {
                    ImageQuality::Hd
                }
                _ => ImageQuality::Standard,
            },
            negative_prompt: raw
                .negative_prompt
                .as_deref()
                .map(sanitize_prompt)
                .filter(|value| !value.is_empty())
                .map(|value| value.chars().take(kind.max_prompt_chars()).collect()),
            seed: raw.seed,
        }),
        GenerationKind::Video => GenerationParameters::Video(VideoParameters {
            duration_secs: clamp_numeric(
                raw.duration.as_ref(),
                DEFAULT_VIDEO_DURATION_SECS,
                VIDEO_DURATION_MIN_SECS,
                VIDEO_DURATION_MAX_SECS,
            ),
            fps: clamp_numeric(raw.fps.as_ref(), DEFAULT_VIDEO_FPS, VIDEO_FPS_MIN, VIDEO_FPS_MAX),
            quality: match raw.quality.as_deref().map(str::trim) {
                Some(value) if value.eq_ignore_ascii_case("high") || value.eq_ignore_ascii_case("hd") => {
                    VideoQuality::High
                }
                _ => VideoQuality::Standard,
            },
            aspect_ratio: match raw.aspect_ratio.as_deref().map(str::trim) {
                Some("9:16") => AspectRatio::Portrait,
                Some("1:1") => AspectRatio::Square,
                _ => AspectRatio::Landscape,
            },
        }),
    };

    ensure_credential(spec, raw.credential.as_ref())?;

    Ok(GenerationRequest {
        request_id: Uuid::new_v4(),
        kind,
        prompt,
        provider: spec.id.clone(),
        model: raw
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        credential: raw.credential,
        parameters,
    })
}

fn validate_prompt(raw: &str, kind: GenerationKind) -> Result<String, ClassifiedError> {
    let prompt = sanitize_prompt(raw);
    if prompt.is_empty() {
        return Err(ClassifiedError::validation("prompt_empty", "A prompt is required."));
    }
    let max = kind.max_prompt_chars();
    if prompt.chars().count() > max {
        return Err(ClassifiedError::validation(
            "prompt_too_long",
            format!("Prompts for {kind} generation are limited to {max} characters."),
        ));
    }
    Ok(prompt)
}

fn ensure_kind_supported(spec: &ProviderSpec, kind: GenerationKind) -> Result<(), ClassifiedError> {
    if spec.supports(kind) {
        return Ok(());
    }
    Err(ClassifiedError::validation(
        "kind_unsupported",
        format!("{} does not support {kind} generation.", spec.display_name),
    ))
}

fn ensure_credential(
    spec: &ProviderSpec,
    credential: Option<&Credential>,
) -> Result<(), ClassifiedError> {
    if spec.requires_key && credential.is_none() {
        return Err(ClassifiedError::auth_required(
            "credential_missing",
            format!("{} requires an API key.", spec.display_name),
        ));
    }
    Ok(())
}

fn clamp_numeric(value: Option<&Value>, default: u32, min: u32, max: u32) -> u32 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text
            .trim()
            .trim_end_matches(|ch: char| ch.is_ascii_alphabetic())
            .trim()
            .parse::<f64>()
            .ok(),
        _ => None,
    };
    match parsed.filter(|number| number.is_finite()) {
        Some(number) => number.round().clamp(min as f64, max as f64) as u32,
        None => default,
    }
}
