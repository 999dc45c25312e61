use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use kiln_contracts::journal::GenerationJournal;
use kiln_contracts::receipts::{build_receipt, write_receipt};
use kiln_contracts::registry::{ProviderRegistry, ProviderSpec};
use kiln_contracts::{
    ClassifiedError, Credential, GenerationKind, GenerationResult, RawGenerationRequest, TaskHandle,
};
use kiln_engine::{
    EngineConfig, FallbackChain, FallbackExhausted, FallbackReport, FallbackStep, GenerationEngine,
};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

const EXIT_CLASSIFIED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Image and video generation across providers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered providers.
    Providers(ProvidersArgs),
    /// Submit once and print the immediate asset or the task handle.
    Submit(SubmitArgs),
    /// Query a task once.
    Status(TaskArgs),
    /// Poll a task until it finishes.
    Wait(TaskArgs),
    /// Submit and wait, optionally across a fallback chain.
    Generate(GenerateArgs),
}

#[derive(Debug, Parser)]
struct ProvidersArgs {
    #[arg(long)]
    kind: Option<GenerationKind>,
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// JSON file holding a raw request; flags override its fields.
    #[arg(long)]
    request: Option<PathBuf>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    quality: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    duration: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    /// Rate-limit key for this invocation.
    #[arg(long, default_value = "cli")]
    caller: String,
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    #[command(flatten)]
    request: RequestArgs,
}

#[derive(Debug, Parser)]
struct TaskArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    task_id: String,
    /// Defaults to the provider's only kind, else image.
    #[arg(long)]
    kind: Option<GenerationKind>,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    request: RequestArgs,
    /// Providers to try in order after the first one fails.
    #[arg(long, value_delimiter = ',')]
    fallback: Vec<String>,
    /// Asset destination; the extension follows the asset's media type.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    receipt: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("kiln error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let registry = ProviderRegistry::new(None);
    if let Command::Providers(args) = &cli.command {
        print_json(&list_providers(&registry, args.kind))?;
        return Ok(0);
    }

    let config = EngineConfig::from_env(&registry);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Providers(_) => Ok(0),
            Command::Submit(args) => run_submit(registry, config, args).await,
            Command::Status(args) => run_status(registry, config, args).await,
            Command::Wait(args) => run_wait(registry, config, args).await,
            Command::Generate(args) => run_generate(registry, config, args).await,
        }
    })
}

fn list_providers(registry: &ProviderRegistry, kind: Option<GenerationKind>) -> Value {
    let specs: Vec<&ProviderSpec> = match kind {
        Some(kind) => registry.by_kind(kind),
        None => registry.list().collect(),
    };
    Value::Array(
        specs
            .into_iter()
            .map(|spec| {
                let models: Map<String, Value> = spec
                    .routes
                    .iter()
                    .map(|route| (route.kind.to_string(), json!(route.default_model)))
                    .collect();
                json!({
                    "id": spec.id,
                    "display_name": spec.display_name,
                    "kinds": spec.kinds,
                    "requires_key": spec.requires_key,
                    "polls": spec.polls(),
                    "default_models": models,
                    "credential_env": spec.credential_env,
                    "api_base_env": spec.api_base_env,
                })
            })
            .collect(),
    )
}

async fn run_submit(registry: ProviderRegistry, config: EngineConfig, args: SubmitArgs) -> Result<i32> {
    let caller = args.request.caller.clone();
    let raw = raw_request(&registry, args.request)?;
    let engine = GenerationEngine::new(registry, config)?;
    let request = match engine.normalize(raw) {
        Ok(request) => request,
        Err(err) => return report_classified(&err),
    };
    match engine.submit(&caller, &request).await {
        Ok(submission) => {
            print_json(&serde_json::to_value(&submission)?)?;
            Ok(0)
        }
        Err(err) => report_classified(&err),
    }
}

async fn run_status(registry: ProviderRegistry, config: EngineConfig, args: TaskArgs) -> Result<i32> {
    let provider = normalize_id(&args.provider);
    let credential = resolve_credential(&registry, &provider, args.api_key.as_deref());
    let kind = task_kind(&registry, &provider, args.kind);
    let handle = TaskHandle::new(provider, args.task_id, kind);
    let engine = GenerationEngine::new(registry, config)?;
    match engine.status(&handle, credential.as_ref()).await {
        Ok(status) => {
            print_json(&json!({
                "provider": handle.provider,
                "task_id": handle.task_id,
                "status": status,
            }))?;
            Ok(0)
        }
        Err(err) => report_classified(&err),
    }
}

async fn run_wait(registry: ProviderRegistry, config: EngineConfig, args: TaskArgs) -> Result<i32> {
    let provider = normalize_id(&args.provider);
    let credential = resolve_credential(&registry, &provider, args.api_key.as_deref());
    let kind = task_kind(&registry, &provider, args.kind);
    let handle = TaskHandle::new(provider, args.task_id, kind);
    let provider = handle.provider.clone();
    let task_id = handle.task_id.clone();
    let engine = GenerationEngine::new(registry, config)?;
    match engine.wait_for_asset(handle, credential.as_ref()).await {
        Ok(asset) => {
            print_json(&json!({
                "provider": provider,
                "task_id": task_id,
                "asset": asset,
            }))?;
            Ok(0)
        }
        Err(err) => report_classified(&err),
    }
}

async fn run_generate(
    registry: ProviderRegistry,
    config: EngineConfig,
    args: GenerateArgs,
) -> Result<i32> {
    let caller = args.request.caller.clone();
    let raw = raw_request(&registry, args.request)?;
    let chain = FallbackChain::new(
        args.fallback
            .iter()
            .map(|provider| {
                let id = normalize_id(provider);
                let credential = resolve_credential(&registry, &id, None);
                FallbackStep::new(id, credential)
            })
            .collect(),
    );

    let mut engine = GenerationEngine::new(registry, config)?;
    if let Some(events) = &args.events {
        engine = engine.with_journal(GenerationJournal::new(events));
    }
    let request = match engine.normalize(raw) {
        Ok(request) => request,
        Err(err) => return report_classified(&err),
    };

    let started = Utc::now();
    let (result, report) = match engine.generate_with_fallback(&caller, &request, &chain).await {
        Ok(outcome) => (outcome.result, outcome.report),
        Err(FallbackExhausted { error, report }) => {
            let mut body = error.public_body();
            body["attempts"] = serde_json::to_value(&report)?;
            print_json(&body)?;
            return Ok(EXIT_CLASSIFIED);
        }
    };

    let asset_path = match &args.out {
        Some(out) => Some(save_to(&engine, &result, out).await?),
        None => None,
    };
    if let Some(receipt_path) = &args.receipt {
        let metadata = receipt_metadata(&report, started, &result);
        let receipt = build_receipt(&result, asset_path.as_deref(), receipt_path, &metadata);
        write_receipt(receipt_path, &receipt)?;
    }

    let mut body = serde_json::to_value(&result)?;
    if let Some(path) = &asset_path {
        body["saved_to"] = json!(path.to_string_lossy());
    }
    if report.attempts.len() > 1 {
        body["attempts"] = serde_json::to_value(&report)?;
    }
    print_json(&body)?;
    Ok(0)
}

async fn save_to(engine: &GenerationEngine, result: &GenerationResult, out: &Path) -> Result<PathBuf> {
    let dir = match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = out
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("kiln-{}", result.request_id));
    engine
        .save_asset(result, &dir, &stem)
        .await
        .with_context(|| format!("failed to save asset to {}", out.display()))
}

fn receipt_metadata(
    report: &FallbackReport,
    started: chrono::DateTime<Utc>,
    result: &GenerationResult,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("started_at".to_string(), json!(started.to_rfc3339()));
    metadata.insert(
        "elapsed_ms".to_string(),
        json!((result.completed_at - started).num_milliseconds().max(0)),
    );
    metadata.insert(
        "attempts".to_string(),
        serde_json::to_value(report).unwrap_or(Value::Null),
    );
    metadata
}

/// File first, then flags. `--api-key` or the provider's env vars win over a
/// key carried in the request file.
fn raw_request(registry: &ProviderRegistry, args: RequestArgs) -> Result<RawGenerationRequest> {
    let mut raw = match &args.request {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<RawGenerationRequest>(&text)
                .with_context(|| format!("{} is not a valid request", path.display()))?
        }
        None => RawGenerationRequest::default(),
    };
    override_with(&mut raw.prompt, args.prompt);
    override_with(&mut raw.provider, args.provider);
    override_with(&mut raw.kind, args.kind);
    override_with(&mut raw.model, args.model);
    override_with(&mut raw.size, args.size);
    override_with(&mut raw.quality, args.quality);
    override_with(&mut raw.negative_prompt, args.negative_prompt);
    override_with(&mut raw.seed, args.seed);
    override_with(&mut raw.duration, args.duration.map(Value::from));
    override_with(&mut raw.fps, args.fps.map(Value::from));
    override_with(&mut raw.aspect_ratio, args.aspect_ratio);

    let provider = raw.provider.as_deref().map(normalize_id).unwrap_or_default();
    raw.credential = resolve_credential(registry, &provider, args.api_key.as_deref())
        .or(raw.credential.take());
    Ok(raw)
}

fn task_kind(
    registry: &ProviderRegistry,
    provider: &str,
    explicit: Option<GenerationKind>,
) -> GenerationKind {
    if let Some(kind) = explicit {
        return kind;
    }
    match registry.get(provider).map(|spec| spec.kinds.as_slice()) {
        Some([only]) => *only,
        _ => GenerationKind::Image,
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn normalize_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn resolve_credential(
    registry: &ProviderRegistry,
    provider: &str,
    explicit: Option<&str>,
) -> Option<Credential> {
    if let Some(credential) = explicit.and_then(Credential::new) {
        return Some(credential);
    }
    let spec = registry.get(provider)?;
    spec.credential_env.iter().find_map(|key| {
        let credential = std::env::var(key).ok().and_then(Credential::new)?;
        tracing::debug!(provider, env = %key, "credential resolved from environment");
        Some(credential)
    })
}

fn report_classified(err: &ClassifiedError) -> Result<i32> {
    print_json(&err.public_body())?;
    Ok(EXIT_CLASSIFIED)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_contracts::registry::ProviderRegistry;
    use kiln_contracts::GenerationKind;
    use serde_json::Value;

    use super::{list_providers, override_with, raw_request, task_kind, RequestArgs};

    fn empty_args() -> RequestArgs {
        RequestArgs {
            request: None,
            prompt: None,
            provider: None,
            kind: None,
            model: None,
            size: None,
            quality: None,
            negative_prompt: None,
            seed: None,
            duration: None,
            fps: None,
            aspect_ratio: None,
            api_key: None,
            caller: "cli".to_string(),
        }
    }

    #[test]
    fn providers_listing_filters_by_kind() {
        let registry = ProviderRegistry::new(None);
        let listed = list_providers(&registry, Some(GenerationKind::Video));
        let ids: Vec<&str> = listed
            .as_array()
            .map(|items| items.iter().filter_map(|item| item["id"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec!["replicate", "luma", "runway", "kling"]);
        assert_eq!(listed[0]["default_models"]["video"], "minimax/video-01");
    }

    #[test]
    fn flags_override_request_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("request.json");
        std::fs::write(
            &path,
            r#"{"provider":"Replicate","prompt":"from file","aspectRatio":"9:16"}"#,
        )?;
        let mut args = empty_args();
        args.request = Some(path);
        args.prompt = Some("from flag".to_string());
        args.duration = Some(7);
        args.api_key = Some("r8-flag".to_string());

        let raw = raw_request(&ProviderRegistry::new(None), args)?;
        assert_eq!(raw.prompt.as_deref(), Some("from flag"));
        assert_eq!(raw.aspect_ratio.as_deref(), Some("9:16"));
        assert_eq!(raw.duration, Some(Value::from(7)));
        assert_eq!(raw.credential.as_ref().map(|key| key.expose()), Some("r8-flag"));
        Ok(())
    }

    #[test]
    fn task_kind_follows_single_kind_providers() {
        let registry = ProviderRegistry::new(None);
        assert_eq!(task_kind(&registry, "luma", None), GenerationKind::Video);
        assert_eq!(task_kind(&registry, "bfl", None), GenerationKind::Image);
        assert_eq!(task_kind(&registry, "replicate", None), GenerationKind::Image);
        assert_eq!(
            task_kind(&registry, "replicate", Some(GenerationKind::Video)),
            GenerationKind::Video
        );
    }

    #[test]
    fn override_keeps_existing_value_when_flag_absent() {
        let mut slot = Some("kept".to_string());
        override_with(&mut slot, None);
        assert_eq!(slot.as_deref(), Some("kept"));
    }
}
