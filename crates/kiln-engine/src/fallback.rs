use kiln_contracts::{ClassifiedError, Credential, ErrorKind, GenerationResult};
use serde::Serialize;
use thiserror::Error;

/// Errors that would fail identically on every provider.
const CHAIN_STOPPING_CODES: &[&str] = &["prompt_empty", "prompt_too_long", "kind_invalid"];

#[derive(Debug, Clone)]
pub struct FallbackStep {
    pub provider: String,
    pub credential: Option<Credential>,
}

impl FallbackStep {
    pub fn new(provider: impl Into<String>, credential: Option<Credential>) -> Self {
        Self {
            provider: provider.into().trim().to_ascii_lowercase(),
            credential,
        }
    }
}

/// Ordered providers to try after the primary one fails. Nothing is tried
/// unless the caller lists it here.
#[derive(Debug, Clone, Default)]
pub struct FallbackChain {
    steps: Vec<FallbackStep>,
}

impl FallbackChain {
    pub fn new(steps: Vec<FallbackStep>) -> Self {
        let mut unique: Vec<FallbackStep> = Vec::new();
        for step in steps {
            if !step.provider.is_empty() && !unique.iter().any(|seen| seen.provider == step.provider) {
                unique.push(step);
            }
        }
        Self { steps: unique }
    }

    pub fn steps(&self) -> &[FallbackStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub fn continues_chain(err: &ClassifiedError) -> bool {
    !(err.kind == ErrorKind::Validation && CHAIN_STOPPING_CODES.contains(&err.code))
}

/// Soft fallback only papers over transport trouble or provider outages,
/// never caller mistakes.
pub fn allows_soft_fallback(err: &ClassifiedError) -> bool {
    matches!(err.kind, ErrorKind::Network | ErrorKind::Upstream)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackAttempt {
    pub provider: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackReport {
    pub attempts: Vec<FallbackAttempt>,
}

impl FallbackReport {
    pub fn record_success(&mut self, provider: &str) {
        self.attempts.push(FallbackAttempt {
            provider: provider.to_string(),
            succeeded: true,
            error: None,
        });
    }

    pub fn record_failure(&mut self, provider: &str, err: &ClassifiedError) {
        self.attempts.push(FallbackAttempt {
            provider: provider.to_string(),
            succeeded: false,
            error: Some(err.clone()),
        });
    }

    pub fn providers(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .map(|attempt| attempt.provider.as_str())
            .collect()
    }

    pub fn last_error(&self) -> Option<&ClassifiedError> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.error.as_ref())
    }
}

/// A fallback run: the result when some provider delivered, plus every
/// attempt in order.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackOutcome {
    pub result: GenerationResult,
    pub report: FallbackReport,
}

/// Every step failed, or one failed in a way no other provider can fix.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct FallbackExhausted {
    pub error: ClassifiedError,
    pub report: FallbackReport,
}
