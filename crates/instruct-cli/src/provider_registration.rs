//! Provider registration from configuration.
//!
//! Builds a [`ProviderRegistry`] holding one provider per selected config
//! entry. Registration never loads a model or touches the network.

use anyhow::{Context, Result};
use instruct_config::{Config, HostedConfig, LocalConfig};
use instruct_providers::pipeline::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use instruct_providers::{
    Capabilities, DeviceMap, HostedProvider, HostedProviderConfig, LocalPipelineConfig,
    LocalPipelineProvider, PipelineLoader, PipelineOptions, Precision, ProviderRegistry,
};
use std::sync::Arc;
use tracing::debug;

/// Checks if a provider reference should be registered.
///
/// A provider is registered if its full reference (e.g. "local.starchat") is
/// in the list, or if the list holds the bare type wildcard (e.g. "local.*").
pub fn should_register(
    providers_to_register: &[String],
    provider_type: &str,
    config_name: &str,
) -> bool {
    let full_ref = format!("{}.{}", provider_type, config_name);
    let wildcard = format!("{}.*", provider_type);
    providers_to_register
        .iter()
        .any(|p| p == &full_ref || p == &wildcard)
}

pub fn hosted_provider_config(config: &HostedConfig) -> HostedProviderConfig {
    HostedProviderConfig {
        api_key: config.resolved_api_key(),
        max_tokens: config.max_tokens,
        model_id: config.model.clone(),
        temperature: config.temperature.map(|t| t as f32),
        extra: config.extra.clone(),
    }
}

pub fn local_pipeline_config(config: &LocalConfig) -> Result<LocalPipelineConfig> {
    let precision = config
        .precision
        .as_deref()
        .map(str::parse::<Precision>)
        .transpose()
        .context("Invalid precision in local provider config")?;

    let device_map = match config.device_map.as_deref() {
        Some(map) => Some(map.parse::<DeviceMap>()?),
        None => None,
    };

    let defaults = LocalPipelineConfig::default();
    Ok(LocalPipelineConfig {
        model_path: config.model_path.clone(),
        temperature: config
            .temperature
            .map(|t| t as f32)
            .unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        model_id: config.model.clone().unwrap_or(defaults.model_id),
        auth_token: config.resolved_auth_token(),
        options: PipelineOptions {
            precision,
            device: config.device.clone(),
            device_map,
            load_in_8bit: config.load_in_8bit,
            passthrough: config.options.clone(),
            ..PipelineOptions::default()
        },
    })
}

/// Registers every configured provider selected by `providers_to_register`
/// and makes the config's default provider the registry default.
pub fn register_providers(
    config: &Config,
    providers_to_register: &[String],
    capabilities: &Capabilities,
    loader: Arc<dyn PipelineLoader>,
) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    register_hosted_providers(config, providers_to_register, &mut registry)?;
    register_local_providers(
        config,
        providers_to_register,
        capabilities,
        loader,
        &mut registry,
    )?;

    debug!(
        "Setting default provider to: {}",
        config.providers.default_provider
    );
    registry.set_default(&config.providers.default_provider)?;

    Ok(registry)
}

fn register_hosted_providers(
    config: &Config,
    providers_to_register: &[String],
    registry: &mut ProviderRegistry,
) -> Result<()> {
    for (name, hosted_config) in &config.providers.hosted {
        if should_register(providers_to_register, "hosted", name) {
            let provider = HostedProvider::new_with_name(
                format!("hosted.{}", name),
                hosted_provider_config(hosted_config),
            )
            .with_context(|| format!("Failed to configure hosted.{}", name))?;
            registry.register(provider);
        }
    }
    Ok(())
}

fn register_local_providers(
    config: &Config,
    providers_to_register: &[String],
    capabilities: &Capabilities,
    loader: Arc<dyn PipelineLoader>,
    registry: &mut ProviderRegistry,
) -> Result<()> {
    for (name, local_config) in &config.providers.local {
        if should_register(providers_to_register, "local", name) {
            let pipeline_config = local_pipeline_config(local_config)
                .with_context(|| format!("Failed to configure local.{}", name))?;
            let provider = LocalPipelineProvider::with_loader(
                format!("local.{}", name),
                pipeline_config,
                loader.clone(),
                capabilities.clone(),
            );
            registry.register(provider);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn local(model_path: &str) -> LocalConfig {
        LocalConfig {
            model_path: model_path.to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
            auth_token: Some("hf_configured".to_string()),
            device: None,
            device_map: Some("auto".to_string()),
            precision: Some("fp16".to_string()),
            load_in_8bit: Some(false),
            options: HashMap::new(),
        }
    }

    #[test]
    fn test_should_register() {
        let selected = vec!["hosted.default".to_string(), "local.*".to_string()];
        assert!(should_register(&selected, "hosted", "default"));
        assert!(!should_register(&selected, "hosted", "other"));
        assert!(should_register(&selected, "local", "anything"));
    }

    #[test]
    fn test_local_pipeline_config_maps_options() {
        let pipeline_config = local_pipeline_config(&local("/models/a.gguf")).unwrap();
        assert_eq!(pipeline_config.model_path, "/models/a.gguf");
        assert_eq!(pipeline_config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(pipeline_config.model_id, "starchat");
        assert_eq!(pipeline_config.auth_token.as_deref(), Some("hf_configured"));
        assert_eq!(pipeline_config.options.precision, Some(Precision::Float16));
        assert_eq!(pipeline_config.options.device_map, Some(DeviceMap::Auto));
        assert_eq!(pipeline_config.options.load_in_8bit, Some(false));
    }

    #[test]
    fn test_local_pipeline_config_rejects_bad_precision() {
        let mut config = local("/models/a.gguf");
        config.precision = Some("int3".to_string());
        assert!(local_pipeline_config(&config).is_err());
    }

    #[test]
    fn test_hosted_provider_config_keeps_configured_key() {
        let config = HostedConfig {
            api_key: "sk-configured".to_string(),
            model: Some("claude-instant-1".to_string()),
            max_tokens: None,
            temperature: Some(0.2),
            extra: HashMap::new(),
        };
        let provider_config = hosted_provider_config(&config);
        assert_eq!(provider_config.api_key, "sk-configured");
        assert_eq!(provider_config.model_id.as_deref(), Some("claude-instant-1"));
        assert_eq!(provider_config.max_tokens, None);
        assert_eq!(provider_config.temperature, Some(0.2_f32));
    }
}
