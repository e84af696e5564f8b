//! Integration tests for the local pipeline provider.
//!
//! CHARACTERIZATION: these tests drive LocalPipelineProvider through a mock
//! loader and verify:
//! - The pipeline is loaded at most once per provider, even under concurrent
//!   first calls
//! - Hardware options are resolved once and frozen with the loaded handle
//! - The new-token budget respects the model's context window
//! - Backend failures propagate unchanged by default
//!
//! What this test intentionally does NOT assert:
//! - Real model loading or generation quality

use instruct_providers::mock::MockPipelineLoader;
use instruct_providers::pipeline::UNBOUNDED_MODEL_MAX_LENGTH;
use instruct_providers::{
    Accelerator, Capabilities, DeviceMap, FailurePolicy, InstructProvider, LocalPipelineConfig,
    LocalPipelineProvider, PipelineOptions, Precision,
};
use std::sync::Arc;

fn provider_with(
    loader: Arc<MockPipelineLoader>,
    config: LocalPipelineConfig,
    capabilities: Capabilities,
) -> LocalPipelineProvider {
    LocalPipelineProvider::with_loader("local.test".to_string(), config, loader, capabilities)
}

fn ampere_with_int8() -> Capabilities {
    Capabilities {
        local_backend: true,
        accelerator: Some(Accelerator {
            name: "NVIDIA A100".to_string(),
            compute_capability: (8, 0),
        }),
        acceleration_runtime: true,
        int8_quantization: true,
    }
}

#[tokio::test]
async fn test_instruct_twice_loads_once() {
    let loader = Arc::new(MockPipelineLoader::new().with_response("Hi!"));
    let provider = provider_with(
        loader.clone(),
        LocalPipelineConfig::default(),
        Capabilities::cpu_only(),
    );

    assert!(!provider.is_loaded().await);
    assert_eq!(provider.instruct("Hello").await.unwrap(), "Hi!");
    assert_eq!(provider.instruct("Hello again").await.unwrap(), "Hi!");

    assert_eq!(loader.load_count(), 1, "pipeline should be reused");
    let calls = loader.last_pipeline().unwrap().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "Hello");
    assert_eq!(calls[1].0, "Hello again");
}

#[tokio::test]
async fn test_concurrent_first_calls_load_once() {
    let loader = Arc::new(MockPipelineLoader::new());
    let provider = Arc::new(provider_with(
        loader.clone(),
        LocalPipelineConfig::default(),
        Capabilities::cpu_only(),
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let provider = Arc::clone(&provider);
        handles.push(tokio::spawn(async move {
            provider.instruct(&format!("prompt {}", i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(loader.load_count(), 1);
}

#[tokio::test]
async fn test_generation_uses_temperature_and_budget() {
    let loader = Arc::new(MockPipelineLoader::new().with_tokenizer_max_length(1024));
    let config = LocalPipelineConfig {
        temperature: 0.2,
        max_tokens: 512,
        ..Default::default()
    };
    let provider = provider_with(loader.clone(), config, Capabilities::cpu_only());

    provider.instruct_with_tokens("Hello", 900).await.unwrap();
    provider.instruct("Hello").await.unwrap();

    let calls = loader.last_pipeline().unwrap().calls();
    assert_eq!(calls[0].1.temperature, 0.2);
    assert_eq!(calls[0].1.max_new_tokens, 124, "remaining room is below the ceiling");
    assert_eq!(calls[1].1.max_new_tokens, 512, "ceiling is below the remaining room");
}

#[tokio::test]
async fn test_generation_max_length_preferred_over_tokenizer() {
    let loader = Arc::new(
        MockPipelineLoader::new()
            .with_generation_max_length(256)
            .with_tokenizer_max_length(8192),
    );
    let provider = provider_with(loader, LocalPipelineConfig::default(), Capabilities::cpu_only());

    assert_eq!(provider.get_max_length().await.unwrap(), 256);
    assert_eq!(provider.get_max_new_tokens(200).await.unwrap(), 56);
}

#[tokio::test]
async fn test_unbounded_tokenizer_defaults_to_4096() {
    let loader = Arc::new(MockPipelineLoader::new().with_tokenizer_max_length(UNBOUNDED_MODEL_MAX_LENGTH));
    let provider = provider_with(loader, LocalPipelineConfig::default(), Capabilities::cpu_only());

    assert_eq!(provider.get_max_length().await.unwrap(), 4096);
    assert_eq!(provider.get_max_new_tokens(4000).await.unwrap(), 96);
    // Input already beyond the window: ceiling unchanged
    assert_eq!(provider.get_max_new_tokens(5000).await.unwrap(), 1024);
}

#[tokio::test]
async fn test_loader_receives_resolved_options() {
    let loader = Arc::new(MockPipelineLoader::new());
    let config = LocalPipelineConfig {
        model_path: "models/starchat.gguf".to_string(),
        auth_token: Some("hf_token".to_string()),
        ..Default::default()
    };
    let provider = provider_with(loader.clone(), config, ampere_with_int8());

    provider.instruct("Hello").await.unwrap();

    let loaded = loader.loaded_with();
    assert_eq!(loaded.len(), 1);
    let (path, options) = &loaded[0];
    assert_eq!(path, "models/starchat.gguf");
    assert_eq!(options.precision, Some(Precision::BFloat16));
    assert_eq!(options.device_map, Some(DeviceMap::Auto));
    assert_eq!(options.load_in_8bit, Some(true));
    assert_eq!(options.auth_token.as_deref(), Some("hf_token"));
    assert!(!options.return_full_text);

    assert_eq!(provider.effective_options().await.as_ref(), Some(options));
}

#[tokio::test]
async fn test_caller_device_is_respected() {
    let loader = Arc::new(MockPipelineLoader::new());
    let config = LocalPipelineConfig {
        options: PipelineOptions {
            device: Some("cpu".to_string()),
            precision: Some(Precision::Float32),
            ..Default::default()
        },
        ..Default::default()
    };
    let provider = provider_with(loader.clone(), config, ampere_with_int8());

    provider.instruct("Hello").await.unwrap();

    let (_, options) = &loader.loaded_with()[0];
    assert_eq!(options.device.as_deref(), Some("cpu"));
    assert_eq!(options.precision, Some(Precision::Float32));
    assert_eq!(options.device_map, None);
    assert_eq!(options.load_in_8bit, None);
}

#[tokio::test]
async fn test_load_failure_propagates_and_is_retried_next_call() {
    let loader = Arc::new(MockPipelineLoader::new().failing_load("CUDA out of memory"));
    let provider = provider_with(loader.clone(), LocalPipelineConfig::default(), Capabilities::cpu_only());

    let err = provider.instruct("Hello").await.unwrap_err();
    assert_eq!(err.to_string(), "CUDA out of memory");
    assert!(!provider.is_loaded().await);

    let _ = provider.instruct("Hello").await;
    assert_eq!(loader.load_count(), 2, "a failed load leaves no handle behind");
}

#[tokio::test]
async fn test_generation_failure_propagates() {
    let loader = Arc::new(MockPipelineLoader::new().failing_generate("invalid generation arguments"));
    let provider = provider_with(loader, LocalPipelineConfig::default(), Capabilities::cpu_only());

    let err = provider.instruct("Hello").await.unwrap_err();
    assert_eq!(err.to_string(), "invalid generation arguments");
}

#[tokio::test]
async fn test_return_as_text_policy_on_local_provider() {
    let loader = Arc::new(MockPipelineLoader::new().failing_generate("tokenizer mismatch"));
    let provider = provider_with(loader, LocalPipelineConfig::default(), Capabilities::cpu_only())
        .with_failure_policy(FailurePolicy::ReturnAsText);

    let text = provider.instruct("Hello").await.unwrap();
    assert_eq!(text, "Pipeline Error: tokenizer mismatch");
}

#[tokio::test]
async fn test_first_candidate_is_returned() {
    let loader = Arc::new(MockPipelineLoader::new().with_candidates(vec!["first", "second"]));
    let provider = provider_with(loader, LocalPipelineConfig::default(), Capabilities::cpu_only());

    assert_eq!(provider.instruct("Hello").await.unwrap(), "first");
}

#[tokio::test]
async fn test_no_candidates_is_an_error() {
    let loader = Arc::new(MockPipelineLoader::new().with_candidates(vec![]));
    let provider = provider_with(loader, LocalPipelineConfig::default(), Capabilities::cpu_only());

    let err = provider.instruct("Hello").await.unwrap_err();
    assert!(err.to_string().contains("no candidates"));
}
