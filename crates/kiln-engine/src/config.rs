use std::sync::Arc;
use std::time::Duration;

use kiln_contracts::limits::{FixedWindowCounter, SubmissionCounter, Unlimited};
use kiln_contracts::registry::ProviderRegistry;
use kiln_contracts::GenerationKind;

use crate::poller::PollPolicy;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RATE_LIMIT: u32 = 10;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub image_poll: PollPolicy,
    pub video_poll: PollPolicy,
    pub request_timeout: Duration,
    /// Submissions per caller per window; zero disables the limiter.
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub soft_fallback: bool,
    /// `(provider id, api base)` overrides collected from `<PROVIDER>_API_BASE`.
    pub api_bases: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image_poll: PollPolicy::IMAGE,
            video_poll: PollPolicy::VIDEO,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
            soft_fallback: false,
            api_bases: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env(registry: &ProviderRegistry) -> Self {
        Self::from_lookup(registry, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(registry: &ProviderRegistry, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_u64 = |key: &str| read(key).and_then(|value| value.parse::<u64>().ok());

        let mut config = Self::default();
        let attempts = read_u64("KILN_POLL_MAX_ATTEMPTS").map(|value| value.min(u32::MAX as u64) as u32);
        config.image_poll = PollPolicy::new(
            read_u64("KILN_IMAGE_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(PollPolicy::IMAGE.interval),
            attempts.unwrap_or(PollPolicy::IMAGE.max_attempts),
        );
        config.video_poll = PollPolicy::new(
            read_u64("KILN_VIDEO_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(PollPolicy::VIDEO.interval),
            attempts.unwrap_or(PollPolicy::VIDEO.max_attempts),
        );
        if let Some(secs) = read_u64("KILN_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs.clamp(5, 600));
        }
        if let Some(limit) = read_u64("KILN_RATE_LIMIT") {
            config.rate_limit = limit.min(u32::MAX as u64) as u32;
        }
        if let Some(secs) = read_u64("KILN_RATE_WINDOW_SECS") {
            config.rate_window = Duration::from_secs(secs.max(1));
        }
        config.soft_fallback = read("KILN_SOFT_FALLBACK")
            .map(|value| is_truthy(&value))
            .unwrap_or(false);

        for spec in registry.list() {
            let Some(env_key) = spec.api_base_env.as_deref() else {
                continue;
            };
            if let Some(base) = read(env_key) {
                config.api_bases.push((spec.id.clone(), base));
            }
        }
        config
    }

    pub fn poll_policy(&self, kind: GenerationKind) -> PollPolicy {
        match kind {
            GenerationKind::Image => self.image_poll,
            GenerationKind::Video => self.video_poll,
        }
    }

    pub fn apply_api_bases(&self, registry: &mut ProviderRegistry) {
        for (provider, base) in &self.api_bases {
            if registry.set_api_base(provider, base) {
                tracing::debug!(provider = %provider, "api base overridden");
            }
        }
    }

    pub fn limiter(&self) -> Arc<dyn SubmissionCounter> {
        if self.rate_limit == 0 {
            Arc::new(Unlimited)
        } else {
            Arc::new(FixedWindowCounter::new(self.rate_limit, self.rate_window))
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
