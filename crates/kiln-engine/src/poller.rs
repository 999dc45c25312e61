use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_contracts::registry::ProviderSpec;
use kiln_contracts::result::status_from_payload;
use kiln_contracts::{
    AssetLocator, ClassifiedError, Credential, GenerationKind, GenerationStatus, TaskHandle,
};
use serde_json::json;

use crate::adapters::status_request;
use crate::dispatch::{classify_http_failure, classify_transport};
use crate::transport::Transport;

pub const POLL_INTERVAL_MIN: Duration = Duration::from_millis(200);
pub const POLL_INTERVAL_MAX: Duration = Duration::from_secs(30);
pub const POLL_ATTEMPTS_MAX: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const IMAGE: Self = Self {
        interval: Duration::from_secs(2),
        max_attempts: 60,
    };
    pub const VIDEO: Self = Self {
        interval: Duration::from_secs(5),
        max_attempts: 60,
    };

    pub fn for_kind(kind: GenerationKind) -> Self {
        match kind {
            GenerationKind::Image => Self::IMAGE,
            GenerationKind::Video => Self::VIDEO,
        }
    }

    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval: interval.clamp(POLL_INTERVAL_MIN, POLL_INTERVAL_MAX),
            max_attempts: max_attempts.clamp(1, POLL_ATTEMPTS_MAX),
        }
    }

    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// One status query against a provider task.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, task_id: &str) -> Result<GenerationStatus, ClassifiedError>;
}

pub struct ProviderStatusProbe {
    spec: ProviderSpec,
    transport: Arc<dyn Transport>,
    credential: Option<Credential>,
}

impl ProviderStatusProbe {
    pub fn new(
        spec: ProviderSpec,
        transport: Arc<dyn Transport>,
        credential: Option<Credential>,
    ) -> Self {
        Self {
            spec,
            transport,
            credential,
        }
    }
}

#[async_trait]
impl StatusProbe for ProviderStatusProbe {
    async fn probe(&self, task_id: &str) -> Result<GenerationStatus, ClassifiedError> {
        let secret = self.credential.as_ref().map(Credential::expose);
        let outbound = status_request(&self.spec, task_id, self.credential.as_ref())?;
        let reply = self
            .transport
            .send(outbound)
            .await
            .map_err(|err| classify_transport(&self.spec, &err))?;
        if !reply.is_success() {
            return Err(classify_http_failure(&self.spec, &reply, secret));
        }
        let payload = reply.parse_json().map_err(|_| {
            ClassifiedError::protocol(
                "response_malformed",
                "Provider returned an unreadable status response.",
            )
            .with_details(json!({"provider": self.spec.id, "task_id": task_id}))
        })?;
        status_from_payload(&self.spec, &payload, secret)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded { asset: AssetLocator, ticks: u32 },
    Failed { reason: String, ticks: u32 },
    TimedOut { ticks: u32 },
}

/// Drives one task to a terminal state.
///
/// Waits `interval` before every probe, so a task that needs three probes
/// finishes after three intervals. A probe error ends the loop; re-waiting on
/// a fresh handle for the same task is safe because status reads are
/// idempotent. Dropping the future stops polling.
pub struct TaskPoller<P> {
    probe: P,
    policy: PollPolicy,
}

impl<P: StatusProbe> TaskPoller<P> {
    pub fn new(probe: P, policy: PollPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub async fn run(&self, handle: TaskHandle) -> Result<PollOutcome, ClassifiedError> {
        self.run_observed(handle, |_, _| {}).await
    }

    pub async fn run_observed<F>(
        &self,
        handle: TaskHandle,
        mut on_tick: F,
    ) -> Result<PollOutcome, ClassifiedError>
    where
        F: FnMut(u32, &GenerationStatus) + Send,
    {
        for tick in 1..=self.policy.max_attempts {
            tokio::time::sleep(self.policy.interval).await;
            let status = self.probe.probe(&handle.task_id).await?;
            tracing::debug!(
                provider = %handle.provider,
                task_id = %handle.task_id,
                tick,
                terminal = status.is_terminal(),
                "poll tick"
            );
            on_tick(tick, &status);
            match status {
                GenerationStatus::Processing => continue,
                GenerationStatus::Succeeded { asset } => {
                    return Ok(PollOutcome::Succeeded { asset, ticks: tick });
                }
                GenerationStatus::Failed { reason } => {
                    return Ok(PollOutcome::Failed {
                        reason,
                        ticks: tick,
                    });
                }
            }
        }
        tracing::warn!(
            provider = %handle.provider,
            task_id = %handle.task_id,
            attempts = self.policy.max_attempts,
            "poll attempts exhausted"
        );
        Ok(PollOutcome::TimedOut {
            ticks: self.policy.max_attempts,
        })
    }
}
