pub mod capability;
pub mod error;
pub mod hosted;
#[cfg(feature = "llama")]
pub mod llama;
pub mod mock;
pub mod pipeline;

pub use capability::{Accelerator, Capabilities, Capability, HardwareProbe, StaticProbe, SystemProbe};
pub use error::ProviderError;
pub use hosted::{CompletionBackend, HostedProvider, HostedProviderConfig, HttpCompletionBackend};
pub use pipeline::{
    default_loader, DeviceMap, GeneratedText, GenerationParams, LocalPipelineConfig,
    LocalPipelineProvider, PipelineLoader, PipelineOptions, Precision, TextGenerationPipeline,
};

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

static BACKEND_LOGGING: AtomicBool = AtomicBool::new(false);

/// Route native backend logs (llama.cpp) into `tracing` instead of silencing
/// them. Takes effect when the backend is first initialized.
pub fn set_backend_logging(enabled: bool) {
    BACKEND_LOGGING.store(enabled, Ordering::SeqCst);
}

pub fn backend_logging_enabled() -> bool {
    BACKEND_LOGGING.load(Ordering::SeqCst)
}

/// What a provider does with a backend failure at the `instruct` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Convert the failure into a successful response prefixed with the
    /// provider's error marker. The call never fails.
    ReturnAsText,
    /// Hand the failure back to the caller unmodified.
    #[default]
    Propagate,
}

/// Apply a failure policy to the outcome of a backend call.
pub fn apply_failure_policy(
    policy: FailurePolicy,
    marker: &str,
    result: Result<String>,
) -> Result<String> {
    match (policy, result) {
        (_, Ok(text)) => Ok(text),
        (FailurePolicy::ReturnAsText, Err(e)) => Ok(format!("{}{}", marker, e)),
        (FailurePolicy::Propagate, Err(e)) => Err(e),
    }
}

/// Trait for text-generation providers
#[async_trait::async_trait]
pub trait InstructProvider: Send + Sync {
    /// Generate text for a prompt whose caller-side token count is `input_tokens`.
    ///
    /// Providers without a context window to manage ignore `input_tokens`.
    async fn instruct_with_tokens(&self, prompt: &str, input_tokens: u32) -> Result<String>;

    /// Generate text for a prompt
    async fn instruct(&self, prompt: &str) -> Result<String> {
        self.instruct_with_tokens(prompt, 0).await
    }

    /// Get the provider name
    fn name(&self) -> &str;

    /// Get the model name
    fn model(&self) -> &str;

    /// Get the configured generation ceiling
    fn max_tokens(&self) -> u32;

    /// Get the configured temperature
    fn temperature(&self) -> f32;

    /// How backend failures surface from `instruct`
    fn failure_policy(&self) -> FailurePolicy;
}

/// Provider registry for managing multiple providers
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn InstructProvider>>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: String::new(),
        }
    }

    pub fn register<P: InstructProvider + 'static>(&mut self, provider: P) {
        let name = provider.name().to_string();
        self.providers.insert(name.clone(), Box::new(provider));

        if self.default_provider.is_empty() {
            self.default_provider = name;
        }
    }

    pub fn set_default(&mut self, provider_name: &str) -> Result<()> {
        if !self.providers.contains_key(provider_name) {
            anyhow::bail!("Provider '{}' not found", provider_name);
        }
        self.default_provider = provider_name.to_string();
        Ok(())
    }

    pub fn get(&self, provider_name: Option<&str>) -> Result<&dyn InstructProvider> {
        let name = provider_name.unwrap_or(&self.default_provider);
        self.providers
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' not found", name))
    }

    pub fn list_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
