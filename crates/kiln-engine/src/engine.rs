use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use kiln_contracts::journal::{GenerationJournal, JournalEvent};
use kiln_contracts::limits::SubmissionCounter;
use kiln_contracts::registry::{ProviderRegistry, ProviderSpec};
use kiln_contracts::request::{normalize, RawGenerationRequest};
use kiln_contracts::{
    AssetLocator, ClassifiedError, Credential, ErrorKind, GenerationKind, GenerationRequest,
    GenerationResult, GenerationStatus, TaskHandle,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::adapters::{predictable_asset_url, resolved_model, submit_request};
use crate::assets::{save_asset, AssetSaveError};
use crate::config::EngineConfig;
use crate::dispatch::{classify_submission, classify_transport, generation_failed, SubmitOutcome};
use crate::fallback::{
    allows_soft_fallback, continues_chain, FallbackChain, FallbackExhausted, FallbackOutcome,
    FallbackReport,
};
use crate::poller::{PollOutcome, ProviderStatusProbe, StatusProbe, TaskPoller};
use crate::transport::{OutboundRequest, ReqwestTransport, Transport, TransportError};

/// Answer to a submission: the asset already, or a task to wait on.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Submission {
    Immediate(GenerationResult),
    Accepted(TaskHandle),
}

pub struct GenerationEngine {
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    limiter: Arc<dyn SubmissionCounter>,
    journal: Option<GenerationJournal>,
    config: EngineConfig,
    active_polls: Mutex<HashSet<String>>,
}

/// Marks a task as being polled; released on drop.
struct PollClaim<'a> {
    polls: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for PollClaim<'_> {
    fn drop(&mut self) {
        lock_recovering(self.polls).remove(&self.key);
    }
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl GenerationEngine {
    pub fn new(registry: ProviderRegistry, config: EngineConfig) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(registry, config, Arc::new(transport)))
    }

    pub fn with_transport(
        mut registry: ProviderRegistry,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        config.apply_api_bases(&mut registry);
        Self {
            registry: Arc::new(registry),
            transport,
            limiter: config.limiter(),
            journal: None,
            config,
            active_polls: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn SubmissionCounter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_journal(mut self, journal: GenerationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn normalize(&self, raw: RawGenerationRequest) -> Result<GenerationRequest, ClassifiedError> {
        normalize(raw, &self.registry)
    }

    /// Exactly one provider call, never retried.
    pub async fn submit(
        &self,
        caller: &str,
        request: &GenerationRequest,
    ) -> Result<Submission, ClassifiedError> {
        let spec = self.spec_for(&request.provider, request.kind)?;
        let outbound = submit_request(spec, request)?;
        if !self.limiter.check_and_increment(caller) {
            tracing::warn!(provider = %spec.id, "caller exceeded submission budget");
            return Err(ClassifiedError::rate_limited(
                "caller_rate_limited",
                "Too many generation requests. Wait a moment and try again.",
            ));
        }

        let fingerprint = request.credential.as_ref().map(Credential::fingerprint);
        tracing::info!(
            provider = %spec.id,
            kind = %request.kind,
            request_id = %request.request_id,
            credential = fingerprint.as_deref().unwrap_or("none"),
            "submitting generation"
        );
        self.record(
            request.request_id,
            JournalEvent::SubmissionStarted {
                provider: spec.id.clone(),
                kind: request.kind,
                model: resolved_model(spec, request),
                credential_fingerprint: fingerprint,
            },
        );

        match self.dispatch(spec, request, outbound).await {
            Ok(SubmitOutcome::Immediate(asset)) => {
                self.record(
                    request.request_id,
                    JournalEvent::SubmissionImmediate {
                        provider: spec.id.clone(),
                        inline: asset.is_inline(),
                    },
                );
                let result = self.build_result(spec, request, asset, None, false);
                self.record_success(&result);
                Ok(Submission::Immediate(result))
            }
            Ok(SubmitOutcome::Accepted(task_id)) => {
                tracing::info!(provider = %spec.id, task_id = %task_id, "task accepted");
                self.record(
                    request.request_id,
                    JournalEvent::TaskAccepted {
                        provider: spec.id.clone(),
                        task_id: task_id.clone(),
                    },
                );
                Ok(Submission::Accepted(TaskHandle::new(
                    spec.id.clone(),
                    task_id,
                    request.kind,
                )))
            }
            Err(err) => {
                self.record_failure(request, &err);
                Err(err)
            }
        }
    }

    /// One status query.
    pub async fn status(
        &self,
        handle: &TaskHandle,
        credential: Option<&Credential>,
    ) -> Result<GenerationStatus, ClassifiedError> {
        let spec = self.spec_for(&handle.provider, handle.kind)?;
        self.probe_for(spec, credential)
            .probe(&handle.task_id)
            .await
            .inspect_err(|err| log_protocol_violation(spec, err))
    }

    /// Polls `handle` to a terminal state and builds the result for
    /// `request`. The handle is consumed.
    pub async fn wait(
        &self,
        handle: TaskHandle,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, ClassifiedError> {
        if handle.provider != request.provider {
            return Err(ClassifiedError::validation(
                "task_provider_mismatch",
                "Task belongs to a different provider than the request.",
            ));
        }
        if handle.kind != request.kind {
            return Err(ClassifiedError::validation(
                "task_kind_mismatch",
                format!(
                    "Task is a {} generation but the request asks for {}.",
                    handle.kind, request.kind
                ),
            ));
        }
        let spec = self.spec_for(&handle.provider, handle.kind)?;
        let task_id = handle.task_id.clone();
        match self
            .poll_to_asset(handle, request.credential.as_ref(), Some(request.request_id))
            .await
        {
            Ok(asset) => {
                let result = self.build_result(spec, request, asset, Some(task_id), false);
                self.record_success(&result);
                Ok(result)
            }
            Err(err) => {
                self.record_failure(request, &err);
                Err(err)
            }
        }
    }

    /// Polls a bare handle, e.g. one resumed from an earlier `submit`.
    pub async fn wait_for_asset(
        &self,
        handle: TaskHandle,
        credential: Option<&Credential>,
    ) -> Result<AssetLocator, ClassifiedError> {
        self.poll_to_asset(handle, credential, None).await
    }

    pub async fn generate(
        &self,
        caller: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, ClassifiedError> {
        match self.submit(caller, request).await {
            Ok(Submission::Immediate(result)) => Ok(result),
            Ok(Submission::Accepted(handle)) => self.wait(handle, request).await,
            Err(err) => self.soft_fallback(request, err),
        }
    }

    /// Tries the request's own provider, then each chain step in order.
    pub async fn generate_with_fallback(
        &self,
        caller: &str,
        request: &GenerationRequest,
        chain: &FallbackChain,
    ) -> Result<FallbackOutcome, FallbackExhausted> {
        let mut report = FallbackReport::default();
        let mut last_error = match self.generate(caller, request).await {
            Ok(result) => {
                report.record_success(&request.provider);
                return Ok(FallbackOutcome { result, report });
            }
            Err(err) => err,
        };
        report.record_failure(&request.provider, &last_error);
        let mut previous = request.provider.clone();

        for step in chain.steps() {
            if !continues_chain(&last_error) {
                break;
            }
            if step.provider == request.provider {
                continue;
            }
            tracing::info!(
                from = %previous,
                to = %step.provider,
                code = last_error.code,
                "falling back to next provider"
            );
            self.record(
                request.request_id,
                JournalEvent::FallbackAttempt {
                    from: previous.clone(),
                    to: step.provider.clone(),
                    code: last_error.code.to_string(),
                },
            );
            previous = step.provider.clone();

            let retargeted = self
                .registry
                .get(&step.provider)
                .ok_or_else(|| {
                    ClassifiedError::validation(
                        "provider_unknown",
                        format!("Unknown provider '{}'.", step.provider),
                    )
                })
                .and_then(|spec| request.retarget(spec, step.credential.clone()));
            let attempt = match retargeted {
                Ok(retargeted) => self.generate(caller, &retargeted).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(result) => {
                    report.record_success(&step.provider);
                    return Ok(FallbackOutcome { result, report });
                }
                Err(err) => {
                    report.record_failure(&step.provider, &err);
                    last_error = err;
                }
            }
        }

        Err(FallbackExhausted {
            error: last_error,
            report,
        })
    }

    pub async fn save_asset(
        &self,
        result: &GenerationResult,
        dir: &Path,
        stem: &str,
    ) -> Result<PathBuf, AssetSaveError> {
        save_asset(self.transport.as_ref(), &result.asset, result.kind, dir, stem).await
    }

    fn spec_for(&self, provider: &str, kind: GenerationKind) -> Result<&ProviderSpec, ClassifiedError> {
        let spec = self.registry.get(provider).ok_or_else(|| {
            ClassifiedError::validation("provider_unknown", format!("Unknown provider '{provider}'."))
        })?;
        if !spec.supports(kind) {
            return Err(ClassifiedError::validation(
                "kind_unsupported",
                format!("{} does not support {kind} generation.", spec.display_name),
            ));
        }
        Ok(spec)
    }

    fn probe_for(&self, spec: &ProviderSpec, credential: Option<&Credential>) -> ProviderStatusProbe {
        ProviderStatusProbe::new(spec.clone(), Arc::clone(&self.transport), credential.cloned())
    }

    async fn dispatch(
        &self,
        spec: &ProviderSpec,
        request: &GenerationRequest,
        outbound: OutboundRequest,
    ) -> Result<SubmitOutcome, ClassifiedError> {
        let secret = request.credential.as_ref().map(Credential::expose);
        let reply = self
            .transport
            .send(outbound)
            .await
            .map_err(|err| classify_transport(spec, &err))?;
        classify_submission(spec, &reply, secret).inspect_err(|err| log_protocol_violation(spec, err))
    }

    fn claim_poll(&self, handle: &TaskHandle) -> Result<PollClaim<'_>, ClassifiedError> {
        let key = handle.poll_key();
        if !lock_recovering(&self.active_polls).insert(key.clone()) {
            return Err(ClassifiedError::validation(
                "task_already_polled",
                "This task is already being polled.",
            )
            .with_http_status(409));
        }
        Ok(PollClaim {
            polls: &self.active_polls,
            key,
        })
    }

    async fn poll_to_asset(
        &self,
        handle: TaskHandle,
        credential: Option<&Credential>,
        request_id: Option<Uuid>,
    ) -> Result<AssetLocator, ClassifiedError> {
        let spec = self.spec_for(&handle.provider, handle.kind)?;
        let _claim = self.claim_poll(&handle)?;
        let policy = self.config.poll_policy(handle.kind);
        let poller = TaskPoller::new(self.probe_for(spec, credential), policy);
        let task_id = handle.task_id.clone();
        let journal = self.journal.clone();
        let provider = spec.id.clone();

        let outcome = poller
            .run_observed(handle, |tick, status| {
                let (Some(journal), Some(request_id)) = (journal.as_ref(), request_id) else {
                    return;
                };
                let event = JournalEvent::PollTick {
                    provider: provider.clone(),
                    task_id: task_id.clone(),
                    tick,
                    status: status_label(status).to_string(),
                };
                if let Err(err) = journal.emit(&request_id, &event) {
                    tracing::warn!(error = %err, "journal write failed");
                }
            })
            .await
            .inspect_err(|err| log_protocol_violation(spec, err))?;

        match outcome {
            PollOutcome::Succeeded { asset, ticks } => {
                tracing::info!(provider = %spec.id, task_id = %task_id, ticks, "task succeeded");
                Ok(asset)
            }
            PollOutcome::Failed { reason, ticks } => {
                tracing::info!(provider = %spec.id, task_id = %task_id, ticks, "task failed");
                let secret = credential.map(Credential::expose);
                let mut err = generation_failed(spec, &reason, secret);
                err.details["task_id"] = json!(task_id);
                err.details["ticks"] = json!(ticks);
                Err(err)
            }
            PollOutcome::TimedOut { ticks } => Err(ClassifiedError::timeout(
                "poll_timeout",
                "Generation did not finish in time. The provider may still complete it.",
            )
            .with_details(json!({
                "provider": spec.id,
                "task_id": task_id,
                "ticks": ticks,
                "budget_ms": policy.budget().as_millis() as u64,
            }))),
        }
    }

    fn soft_fallback(
        &self,
        request: &GenerationRequest,
        err: ClassifiedError,
    ) -> Result<GenerationResult, ClassifiedError> {
        if !self.config.soft_fallback || !allows_soft_fallback(&err) {
            return Err(err);
        }
        let Some(spec) = self.registry.get(&request.provider) else {
            return Err(err);
        };
        let Some(asset) = predictable_asset_url(spec, request) else {
            return Err(err);
        };
        tracing::warn!(
            provider = %spec.id,
            code = err.code,
            "submission failed; returning predicted asset url"
        );
        let result = self.build_result(spec, request, asset, None, true);
        self.record_success(&result);
        Ok(result)
    }

    fn build_result(
        &self,
        spec: &ProviderSpec,
        request: &GenerationRequest,
        asset: AssetLocator,
        task_id: Option<String>,
        degraded: bool,
    ) -> GenerationResult {
        GenerationResult {
            request_id: request.request_id,
            provider: spec.id.clone(),
            model: resolved_model(spec, request),
            kind: request.kind,
            prompt: request.prompt.clone(),
            parameters: request.parameters.clone(),
            asset,
            task_id,
            degraded,
            completed_at: Utc::now(),
        }
    }

    fn record(&self, request_id: Uuid, event: JournalEvent) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.emit(&request_id, &event) {
            tracing::warn!(error = %err, "journal write failed");
        }
    }

    fn record_success(&self, result: &GenerationResult) {
        self.record(
            result.request_id,
            JournalEvent::GenerationSucceeded {
                provider: result.provider.clone(),
                task_id: result.task_id.clone(),
                degraded: result.degraded,
            },
        );
    }

    fn record_failure(&self, request: &GenerationRequest, err: &ClassifiedError) {
        tracing::info!(
            provider = %request.provider,
            kind = %err.kind,
            code = err.code,
            "generation failed"
        );
        self.record(
            request.request_id,
            JournalEvent::GenerationFailed {
                provider: request.provider.clone(),
                error_kind: err.kind,
                code: err.code.to_string(),
                message: err.message.clone(),
            },
        );
    }
}

fn status_label(status: &GenerationStatus) -> &'static str {
    match status {
        GenerationStatus::Processing => "processing",
        GenerationStatus::Succeeded { .. } => "succeeded",
        GenerationStatus::Failed { .. } => "failed",
    }
}

fn log_protocol_violation(spec: &ProviderSpec, err: &ClassifiedError) {
    if err.kind == ErrorKind::Protocol {
        tracing::warn!(
            provider = %spec.id,
            code = err.code,
            details = %err.details,
            "provider contract violation"
        );
    }
}
