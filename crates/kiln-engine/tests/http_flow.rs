use std::time::Duration;

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use kiln_contracts::registry::ProviderRegistry;
use kiln_contracts::request::RawGenerationRequest;
use kiln_contracts::{AssetLocator, ClassifiedError, Credential, ErrorKind, GenerationRequest};
use kiln_engine::{EngineConfig, GenerationEngine, PollPolicy};

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

fn engine_against(server: &MockServer, provider: &str) -> anyhow::Result<GenerationEngine> {
    let config = EngineConfig {
        image_poll: PollPolicy::new(Duration::from_millis(200), 5),
        request_timeout: Duration::from_secs(10),
        rate_limit: 0,
        api_bases: vec![(provider.to_string(), server.url(""))],
        ..EngineConfig::default()
    };
    Ok(GenerationEngine::new(ProviderRegistry::new(None), config)?)
}

fn image_request(
    engine: &GenerationEngine,
    provider: &str,
    key: &str,
) -> Result<GenerationRequest, ClassifiedError> {
    engine.normalize(RawGenerationRequest {
        kind: Some("image".to_string()),
        prompt: Some("a red fox".to_string()),
        provider: Some(provider.to_string()),
        credential: Credential::new(key),
        ..RawGenerationRequest::default()
    })
}

#[tokio::test]
async fn replicate_prediction_is_submitted_once_and_polled() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let submit = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/models/black-forest-labs/flux-schnell/predictions")
                .header("authorization", "Bearer r8-http-flow")
                .body_includes("a red fox");
            then.status(201)
                .header("content-type", "application/json")
                .body(r#"{"id":"abc123","status":"starting"}"#);
        })
        .await;
    let poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/predictions/abc123");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"abc123","status":"succeeded","output":["https://cdn.example/fox.webp"]}"#);
        })
        .await;

    let engine = engine_against(&server, "replicate")?;
    let request = image_request(&engine, "replicate", "r8-http-flow")?;
    let result = engine.generate("127.0.0.1", &request).await?;

    submit.assert_async().await;
    poll.assert_async().await;
    assert_eq!(
        result.asset,
        AssetLocator::Url("https://cdn.example/fox.webp".to_string())
    );
    assert_eq!(result.task_id.as_deref(), Some("abc123"));
    Ok(())
}

#[tokio::test]
async fn rejected_key_surfaces_auth_error_without_leaking_it() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let submit = server
        .mock_async(|when, then| {
            when.method(POST).path("/images/generations");
            then.status(401)
                .header("content-type", "application/json")
                .body(r#"{"error":{"message":"Incorrect API key provided: sk-leaky-123"}}"#);
        })
        .await;

    let engine = engine_against(&server, "openai")?;
    let request = image_request(&engine, "openai", "sk-leaky-123")?;
    let Some(err) = engine.generate("127.0.0.1", &request).await.err() else {
        anyhow::bail!("expected an auth failure");
    };

    submit.assert_async().await;
    assert_eq!(err.kind, ErrorKind::AuthRequired);
    assert_eq!(err.http_status, 401);
    assert!(!err.to_string().contains("sk-leaky-123"));
    assert!(!err.details.to_string().contains("sk-leaky-123"));
    assert!(!err.public_body().to_string().contains("sk-leaky-123"));
    Ok(())
}

#[tokio::test]
async fn url_assets_download_into_the_output_directory() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let asset_url = server.url("/files/fox");
    let body = format!(r#"{{"created":1,"data":[{{"url":"{asset_url}"}}]}}"#);
    server
        .mock_async(|when, then| {
            when.method(POST).path("/images/generations");
            then.status(200)
                .header("content-type", "application/json")
                .body(body.clone());
        })
        .await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/files/fox");
            then.status(200)
                .header("content-type", "image/jpeg")
                .body(vec![0xff_u8, 0xd8, 0xff, 0xe0]);
        })
        .await;

    let engine = engine_against(&server, "openai")?;
    let request = image_request(&engine, "openai", "sk-ok")?;
    let result = engine.generate("127.0.0.1", &request).await?;
    let temp = tempfile::tempdir()?;
    let path = engine.save_asset(&result, temp.path(), "fox").await?;

    download.assert_async().await;
    assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("jpg"));
    assert_eq!(std::fs::read(&path)?, vec![0xff, 0xd8, 0xff, 0xe0]);
    Ok(())
}

#[tokio::test]
async fn unreachable_provider_is_a_network_error() -> anyhow::Result<()> {
    let port = {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0));
        match listener {
            Ok(listener) => listener.local_addr()?.port(),
            Err(_) => return Ok(()),
        }
    };
    let config = EngineConfig {
        rate_limit: 0,
        request_timeout: Duration::from_secs(5),
        api_bases: vec![("openai".to_string(), format!("http://127.0.0.1:{port}"))],
        ..EngineConfig::default()
    };
    let engine = GenerationEngine::new(ProviderRegistry::new(None), config)?;
    let request = image_request(&engine, "openai", "sk-ok")?;

    let Some(err) = engine.generate("127.0.0.1", &request).await.err() else {
        anyhow::bail!("nothing should be listening");
    };
    assert_eq!(err.kind, ErrorKind::Network);
    assert!(!err.message.contains("127.0.0.1"));
    Ok(())
}
