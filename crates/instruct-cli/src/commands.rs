//! Subcommand implementations.

use anyhow::Result;
use instruct_config::Config;
use instruct_providers::{
    default_loader, Capabilities, HardwareProbe, InstructProvider, LocalPipelineConfig, LocalPipelineProvider,
    PipelineLoader, SystemProbe,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::preflight::run_preflight;
use crate::provider_registration::register_providers;

/// Send one prompt through the config's default provider.
///
/// Only the default provider is built, so no other local model is ever
/// constructed.
pub async fn execute_prompt(
    config: &Config,
    prompt: &str,
    input_tokens: u32,
    capabilities: &Capabilities,
    loader: Arc<dyn PipelineLoader>,
) -> Result<String> {
    let selected = vec![config.providers.default_provider.clone()];
    let registry = register_providers(config, &selected, capabilities, loader)?;
    let provider = registry.get(None)?;

    debug!(
        "Sending prompt to {} (model: {}, max_tokens: {}, temperature: {})",
        provider.name(),
        provider.model(),
        provider.max_tokens(),
        provider.temperature()
    );

    provider.instruct_with_tokens(prompt, input_tokens).await
}

pub async fn run_command(
    config_path: Option<&str>,
    prompt: &str,
    provider: Option<String>,
    model: Option<String>,
    input_tokens: u32,
) -> Result<()> {
    let config = Config::load_with_overrides(config_path, provider, model)?;
    let capabilities = SystemProbe.probe();

    let response =
        execute_prompt(&config, prompt, input_tokens, &capabilities, default_loader()).await?;
    println!("{}", response);
    Ok(())
}

pub fn preflight_command(config_path: Option<&str>) -> Result<()> {
    let config = Config::load(config_path)?;
    let capabilities = SystemProbe.probe();
    info!("Detected capability: {}", capabilities.level());

    let mut report = run_preflight(&config, &capabilities);
    report.config_source = match config_path {
        Some(path) => Some(shellexpand::tilde(path).into_owned()),
        None => Config::find_default_path(),
    };
    println!("{}", report.format_report());

    if report.has_errors() {
        anyhow::bail!("Preflight found problems with the configured providers");
    }
    Ok(())
}

/// Load a local pipeline and print one response.
pub async fn smoke_command(model_path: String, prompt: &str) -> Result<()> {
    let capabilities = SystemProbe.probe();
    let response = smoke_test(model_path, prompt, capabilities, default_loader()).await?;
    println!("Test: {}", response);
    Ok(())
}

pub async fn smoke_test(
    model_path: String,
    prompt: &str,
    capabilities: Capabilities,
    loader: Arc<dyn PipelineLoader>,
) -> Result<String> {
    let config = LocalPipelineConfig {
        model_path,
        ..LocalPipelineConfig::default()
    };
    let provider =
        LocalPipelineProvider::with_loader("local.smoke".to_string(), config, loader, capabilities);
    provider.instruct(prompt).await
}
