//! Local text-generation pipeline provider.
//!
//! The pipeline is loaded on the first `instruct` call and reused for the
//! lifetime of the provider. Hardware options (precision, device placement,
//! 8-bit weights) are resolved once, from the capabilities probed at startup,
//! and frozen together with the loaded handle.
//!
//! Backend failures propagate to the caller unchanged by default, unlike the
//! hosted provider which reports them as text.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{apply_failure_policy, Capabilities, FailurePolicy, InstructProvider, ProviderError};

pub const DEFAULT_MODEL_PATH: &str = "HuggingFaceH4/starchat-beta";
pub const DEFAULT_MODEL_ID: &str = "starchat";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Placeholder tokenizers report when they declare no input limit (`int(1e30)`).
pub const UNBOUNDED_MODEL_MAX_LENGTH: u128 = 1_000_000_000_000_000_019_884_624_838_656;
/// Context length assumed when the tokenizer declares no limit.
pub const DEFAULT_MAX_LENGTH: u64 = 4096;
/// Prefix used when failures are converted to text.
pub const ERROR_MARKER: &str = "Pipeline Error: ";

/// Floating-point format for model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    BFloat16,
    Float16,
    Float32,
}

impl FromStr for Precision {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bfloat16" | "bf16" => Ok(Precision::BFloat16),
            "float16" | "fp16" | "half" => Ok(Precision::Float16),
            "float32" | "fp32" | "float" => Ok(Precision::Float32),
            other => Err(ProviderError::InvalidConfig(format!(
                "unknown precision '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Precision::BFloat16 => "bfloat16",
            Precision::Float16 => "float16",
            Precision::Float32 => "float32",
        })
    }
}

/// Where model layers are placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMap {
    /// Let the backend spread layers across available devices.
    Auto,
    /// Backend-specific placement description.
    Explicit(String),
}

impl FromStr for DeviceMap {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("auto") {
            DeviceMap::Auto
        } else {
            DeviceMap::Explicit(s.to_string())
        })
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMap::Auto => f.write_str("auto"),
            DeviceMap::Explicit(map) => f.write_str(map),
        }
    }
}

/// Options handed to the [`PipelineLoader`].
#[derive(Clone, Default, PartialEq)]
pub struct PipelineOptions {
    pub precision: Option<Precision>,
    /// Single-device placement, e.g. "cpu" or "cuda:0"
    pub device: Option<String>,
    pub device_map: Option<DeviceMap>,
    pub load_in_8bit: Option<bool>,
    pub auth_token: Option<String>,
    /// Include the prompt in generated text
    pub return_full_text: bool,
    /// Backend-specific options passed through untouched
    pub passthrough: HashMap<String, serde_json::Value>,
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("precision", &self.precision)
            .field("device", &self.device)
            .field("device_map", &self.device_map)
            .field("load_in_8bit", &self.load_in_8bit)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("return_full_text", &self.return_full_text)
            .field("passthrough", &self.passthrough)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalPipelineConfig {
    pub model_path: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub model_id: String,
    pub auth_token: Option<String>,
    pub options: PipelineOptions,
}

impl Default for LocalPipelineConfig {
    fn default() -> Self {
        Self {
            model_path: DEFAULT_MODEL_PATH.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            model_id: DEFAULT_MODEL_ID.to_string(),
            auth_token: None,
            options: PipelineOptions::default(),
        }
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_new_tokens: u32,
}

/// One generated candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub generated_text: String,
}

/// A loaded text-generation pipeline. All calls may block.
pub trait TextGenerationPipeline: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Vec<GeneratedText>>;

    /// Generation-time maximum length, if the model configures one.
    fn generation_max_length(&self) -> Option<u64>;

    /// The tokenizer's declared maximum input length.
    fn tokenizer_max_length(&self) -> u128;
}

/// Constructs pipelines. Loading may block for a long time.
pub trait PipelineLoader: Send + Sync {
    fn load(
        &self,
        model_path: &str,
        options: &PipelineOptions,
    ) -> Result<Arc<dyn TextGenerationPipeline>>;
}

/// Loader used when the build carries no local backend.
#[derive(Debug, Clone, Default)]
pub struct UnavailablePipelineLoader;

impl PipelineLoader for UnavailablePipelineLoader {
    fn load(
        &self,
        model_path: &str,
        _options: &PipelineOptions,
    ) -> Result<Arc<dyn TextGenerationPipeline>> {
        Err(ProviderError::BackendUnavailable(format!(
            "cannot load '{}': built without the `llama` feature",
            model_path
        ))
        .into())
    }
}

/// The loader matching this build's features.
pub fn default_loader() -> Arc<dyn PipelineLoader> {
    #[cfg(feature = "llama")]
    {
        Arc::new(crate::llama::LlamaPipelineLoader::new())
    }
    #[cfg(not(feature = "llama"))]
    {
        Arc::new(UnavailablePipelineLoader)
    }
}

/// Fill in hardware options the caller left unset.
///
/// Nothing is added without an accelerator and its runtime. Precision picks
/// bfloat16 where supported, else float16. Automatic placement (plus 8-bit
/// weights when available) is only requested if the caller chose neither a
/// device nor a device map.
pub fn resolve_hardware_options(
    options: &PipelineOptions,
    capabilities: &Capabilities,
) -> PipelineOptions {
    let mut resolved = options.clone();
    if !capabilities.is_accelerated() {
        return resolved;
    }

    if resolved.precision.is_none() {
        resolved.precision = Some(if capabilities.supports_bf16() {
            Precision::BFloat16
        } else {
            Precision::Float16
        });
    }

    if resolved.device_map.is_none() && resolved.device.is_none() {
        resolved.device_map = Some(DeviceMap::Auto);
        if capabilities.int8_quantization && resolved.load_in_8bit.is_none() {
            resolved.load_in_8bit = Some(true);
        }
    }

    resolved
}

/// Maximum context length of a pipeline.
pub fn resolve_max_length(generation_max_length: Option<u64>, tokenizer_max_length: u128) -> u64 {
    if let Some(max_length) = generation_max_length.filter(|&n| n > 0) {
        return max_length;
    }
    if tokenizer_max_length == UNBOUNDED_MODEL_MAX_LENGTH {
        return DEFAULT_MAX_LENGTH;
    }
    u64::try_from(tokenizer_max_length).unwrap_or(u64::MAX)
}

/// New-token budget that keeps generation inside the context window.
///
/// Returns the room left after `input_length` when it is positive and smaller
/// than `max_tokens`; otherwise `max_tokens` unchanged (including when the
/// input already fills the window).
pub fn max_new_tokens(max_length: u64, input_length: u64, max_tokens: u32) -> u32 {
    let remaining = max_length as i128 - input_length as i128;
    if remaining > 0 && i128::from(max_tokens) > remaining {
        remaining as u32
    } else {
        max_tokens
    }
}

struct LoadedPipeline {
    handle: Arc<dyn TextGenerationPipeline>,
    options: PipelineOptions,
}

pub struct LocalPipelineProvider {
    name: String,
    model_path: String,
    model_id: String,
    temperature: f32,
    max_tokens: u32,
    options: PipelineOptions,
    capabilities: Capabilities,
    failure_policy: FailurePolicy,
    loader: Arc<dyn PipelineLoader>,
    pipeline: Mutex<Option<LoadedPipeline>>,
}

impl LocalPipelineProvider {
    /// Create a provider named "local" using this build's loader.
    pub fn new(config: LocalPipelineConfig, capabilities: Capabilities) -> Self {
        Self::new_with_name("local".to_string(), config, capabilities)
    }

    pub fn new_with_name(
        name: String,
        config: LocalPipelineConfig,
        capabilities: Capabilities,
    ) -> Self {
        Self::with_loader(name, config, default_loader(), capabilities)
    }

    pub fn with_loader(
        name: String,
        config: LocalPipelineConfig,
        loader: Arc<dyn PipelineLoader>,
        capabilities: Capabilities,
    ) -> Self {
        let mut options = config.options;
        if let Some(token) = config.auth_token {
            options.auth_token = Some(token);
        }
        options.return_full_text = false;

        debug!(
            "Configured local provider '{}' for {} (capability: {})",
            name,
            config.model_path,
            capabilities.level()
        );

        Self {
            name,
            model_path: config.model_path,
            model_id: config.model_id,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            options,
            capabilities,
            failure_policy: FailurePolicy::Propagate,
            loader,
            pipeline: Mutex::new(None),
        }
    }

    /// Override how failures surface from `instruct`.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    /// Options as configured, before hardware resolution.
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Options the pipeline would be loaded with on this machine.
    pub fn load_cuda(&self) -> PipelineOptions {
        resolve_hardware_options(&self.options, &self.capabilities)
    }

    /// Options the loaded pipeline was built with, if loaded.
    pub async fn effective_options(&self) -> Option<PipelineOptions> {
        self.pipeline.lock().await.as_ref().map(|p| p.options.clone())
    }

    pub async fn is_loaded(&self) -> bool {
        self.pipeline.lock().await.is_some()
    }

    /// Load the pipeline unless it is already loaded.
    ///
    /// The lock is held across the load so concurrent first calls build the
    /// pipeline once.
    pub async fn load_pipeline(&self) -> Result<Arc<dyn TextGenerationPipeline>> {
        let mut guard = self.pipeline.lock().await;
        if let Some(loaded) = guard.as_ref() {
            return Ok(Arc::clone(&loaded.handle));
        }

        let options = self.load_cuda();
        info!("Loading text-generation pipeline from {}", self.model_path);
        debug!("Pipeline options: {:?}", options);

        let loader = Arc::clone(&self.loader);
        let model_path = self.model_path.clone();
        let load_options = options.clone();
        let handle = tokio::task::spawn_blocking(move || loader.load(&model_path, &load_options))
            .await
            .map_err(ProviderError::from)??;

        *guard = Some(LoadedPipeline {
            handle: Arc::clone(&handle),
            options,
        });
        Ok(handle)
    }

    /// The model's maximum context length.
    pub async fn get_max_length(&self) -> Result<u64> {
        let pipeline = self.load_pipeline().await?;
        Ok(resolve_max_length(
            pipeline.generation_max_length(),
            pipeline.tokenizer_max_length(),
        ))
    }

    /// Token budget for a prompt of `input_length` tokens.
    pub async fn get_max_new_tokens(&self, input_length: u32) -> Result<u32> {
        let max_length = self.get_max_length().await?;
        Ok(max_new_tokens(max_length, u64::from(input_length), self.max_tokens))
    }

    async fn generate(&self, prompt: &str, input_tokens: u32) -> Result<String> {
        let pipeline = self.load_pipeline().await?;
        let params = GenerationParams {
            temperature: self.temperature,
            max_new_tokens: self.get_max_new_tokens(input_tokens).await?,
        };
        debug!(
            "Generating with temperature={}, max_new_tokens={}",
            params.temperature, params.max_new_tokens
        );

        let prompt = prompt.to_string();
        let candidates = tokio::task::spawn_blocking(move || pipeline.generate(&prompt, &params))
            .await
            .map_err(ProviderError::from)??;

        candidates
            .into_iter()
            .next()
            .map(|c| c.generated_text)
            .ok_or_else(|| ProviderError::NoCandidates.into())
    }
}

#[async_trait::async_trait]
impl InstructProvider for LocalPipelineProvider {
    async fn instruct_with_tokens(&self, prompt: &str, input_tokens: u32) -> Result<String> {
        let result = self.generate(prompt, input_tokens).await;
        apply_failure_policy(self.failure_policy, ERROR_MARKER, result)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model_id
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}
