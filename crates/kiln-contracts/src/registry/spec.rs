use crate::extract::{paths, AssetRule, FieldPath};
use crate::request::GenerationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// How the credential travels to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `Authorization: Key <key>`
    KeyPrefix,
    /// Key sent verbatim in a named header.
    Header(String),
}

/// Which adapter builds the provider-specific submit body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    OpenAiImages,
    StabilityTextToImage,
    FalRun,
    PollinationsQuery,
    ReplicatePrediction,
    BflFlux,
    LumaGeneration,
    RunwayTask,
    KlingTask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRoute {
    pub kind: GenerationKind,
    pub method: HttpMethod,
    /// Relative to the API base; `{model}` is substituted.
    pub path: String,
    pub default_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRules {
    pub task_id: Vec<FieldPath>,
    pub status: Vec<FieldPath>,
    pub assets: Vec<AssetRule>,
    pub error: Vec<FieldPath>,
}

pub const DEFAULT_TASK_ID_PATHS: &[&str] = &["id", "task_id", "data.id", "data.task_id", "prediction.id"];
pub const DEFAULT_ERROR_PATHS: &[&str] = &["error.message", "error", "message", "detail", "failure"];

impl ExtractionRules {
    pub fn new(assets: Vec<AssetRule>) -> Self {
        Self {
            task_id: paths(DEFAULT_TASK_ID_PATHS),
            status: paths(&["status"]),
            assets,
            error: paths(DEFAULT_ERROR_PATHS),
        }
    }

    pub fn with_task_id(mut self, raw: &[&str]) -> Self {
        self.task_id = paths(raw);
        self
    }

    pub fn with_status(mut self, raw: &[&str]) -> Self {
        self.status = paths(raw);
        self
    }

    pub fn with_error(mut self, raw: &[&str]) -> Self {
        self.error = paths(raw);
        self
    }
}

/// Canonical classes a raw provider status string folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Processing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusVocabulary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl Default for StatusVocabulary {
    fn default() -> Self {
        Self {
            succeeded: ["succeeded", "completed", "success", "succeed", "ready"]
                .map(str::to_string)
                .to_vec(),
            failed: ["failed", "fail", "canceled", "cancelled", "error"]
                .map(str::to_string)
                .to_vec(),
        }
    }
}

impl StatusVocabulary {
    pub fn with_failed(mut self, extra: &[&str]) -> Self {
        self.failed.extend(extra.iter().map(|term| term.to_string()));
        self
    }

    /// Case-insensitive lookup; anything unrecognised is still running.
    pub fn classify(&self, raw: &str) -> StatusClass {
        let raw = raw.trim();
        if self.succeeded.iter().any(|term| term.eq_ignore_ascii_case(raw)) {
            return StatusClass::Succeeded;
        }
        if self.failed.iter().any(|term| term.eq_ignore_ascii_case(raw)) {
            return StatusClass::Failed;
        }
        StatusClass::Processing
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: String,
    pub display_name: String,
    pub kinds: Vec<GenerationKind>,
    pub requires_key: bool,
    pub auth: AuthScheme,
    pub api_base: String,
    pub api_base_env: Option<String>,
    pub credential_env: Vec<String>,
    pub payload: PayloadShape,
    pub routes: Vec<SubmitRoute>,
    /// Relative status endpoint with an `{id}` placeholder. `None` means the
    /// provider only ever answers synchronously.
    pub status_path: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub rules: ExtractionRules,
    pub vocabulary: StatusVocabulary,
    /// The asset URL is derivable from the request alone, which makes the
    /// opt-in soft fallback possible.
    pub predictable_url: bool,
}

impl ProviderSpec {
    pub fn supports(&self, kind: GenerationKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn route(&self, kind: GenerationKind) -> Option<&SubmitRoute> {
        self.routes.iter().find(|route| route.kind == kind)
    }

    pub fn polls(&self) -> bool {
        self.status_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{StatusClass, StatusVocabulary};

    #[test]
    fn default_vocabulary_folds_provider_spellings() {
        let vocabulary = StatusVocabulary::default();
        for raw in ["succeeded", "completed", "SUCCESS", "Ready", "succeed"] {
            assert_eq!(vocabulary.classify(raw), StatusClass::Succeeded, "{raw}");
        }
        for raw in ["failed", "canceled", "CANCELLED", "error", "Fail"] {
            assert_eq!(vocabulary.classify(raw), StatusClass::Failed, "{raw}");
        }
        for raw in ["processing", "starting", "queued", "PENDING", "dreaming", ""] {
            assert_eq!(vocabulary.classify(raw), StatusClass::Processing, "{raw}");
        }
    }

    #[test]
    fn extra_failure_terms_extend_the_defaults() {
        let vocabulary = StatusVocabulary::default().with_failed(&["Content Moderated"]);
        assert_eq!(vocabulary.classify("content moderated"), StatusClass::Failed);
        assert_eq!(vocabulary.classify("failed"), StatusClass::Failed);
    }
}
