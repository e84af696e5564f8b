//! llama.cpp implementation of [`PipelineLoader`].
//!
//! Loads GGUF models from local paths. Device placement maps onto GPU layer
//! offload; precision and 8-bit flags are informational since GGUF weights
//! carry their own quantization.

use anyhow::Result;
use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::pipeline::{
    DeviceMap, GeneratedText, GenerationParams, PipelineLoader, PipelineOptions,
    TextGenerationPipeline,
};
use crate::ProviderError;

/// Offload every layer; llama.cpp clamps to the model's layer count.
const ALL_LAYERS: u32 = 999;

/// Global llama.cpp backend - can only be initialized once per process
static LLAMA_BACKEND: OnceLock<Arc<LlamaBackend>> = OnceLock::new();

fn get_or_init_backend() -> Result<Arc<LlamaBackend>> {
    if let Some(backend) = LLAMA_BACKEND.get() {
        return Ok(Arc::clone(backend));
    }

    if crate::backend_logging_enabled() {
        llama_cpp_2::send_logs_to_tracing(llama_cpp_2::LogOptions::default());
    } else {
        suppress_llama_logging();
    }

    debug!("Initializing llama.cpp backend...");
    let backend = LlamaBackend::init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize llama.cpp backend: {:?}", e))?;

    // Another thread may have won the race; use whichever got stored.
    let _ = LLAMA_BACKEND.set(Arc::new(backend));
    LLAMA_BACKEND
        .get()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("llama.cpp backend was not stored"))
}

/// Drop everything llama.cpp would print to stderr.
fn suppress_llama_logging() {
    unsafe extern "C" fn void_log(
        _level: std::ffi::c_int,
        _text: *const std::os::raw::c_char,
        _user_data: *mut std::os::raw::c_void,
    ) {
    }

    extern "C" {
        fn llama_log_set(
            log_callback: Option<
                unsafe extern "C" fn(
                    std::ffi::c_int,
                    *const std::os::raw::c_char,
                    *mut std::os::raw::c_void,
                ),
            >,
            user_data: *mut std::os::raw::c_void,
        );
    }

    unsafe {
        llama_log_set(Some(void_log), std::ptr::null_mut());
    }
}

fn passthrough_u32(options: &PipelineOptions, key: &str) -> Option<u32> {
    options
        .passthrough
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
}

/// Number of layers to offload for the given placement options.
fn gpu_layers_for(options: &PipelineOptions) -> u32 {
    if let Some(layers) = passthrough_u32(options, "gpu_layers") {
        return layers;
    }
    match (options.device.as_deref(), options.device_map.as_ref()) {
        (Some(device), _) if device.eq_ignore_ascii_case("cpu") => 0,
        (Some(device), _) if device.starts_with("cuda") => ALL_LAYERS,
        (Some(_), _) => 0,
        (None, Some(DeviceMap::Explicit(map))) if map.eq_ignore_ascii_case("cpu") => 0,
        (None, Some(_)) => ALL_LAYERS,
        (None, None) => 0,
    }
}

fn thread_count(threads: u32) -> Result<i32> {
    i32::try_from(threads).map_err(|_| {
        ProviderError::InvalidConfig(format!("threads must fit in i32, got {}", threads)).into()
    })
}

#[derive(Debug, Clone, Default)]
pub struct LlamaPipelineLoader;

impl LlamaPipelineLoader {
    pub fn new() -> Self {
        Self
    }
}

impl PipelineLoader for LlamaPipelineLoader {
    fn load(
        &self,
        model_path: &str,
        options: &PipelineOptions,
    ) -> Result<Arc<dyn TextGenerationPipeline>> {
        let expanded_path = shellexpand::tilde(model_path);
        let model_path_buf = PathBuf::from(expanded_path.as_ref());

        if !model_path_buf.exists() {
            return Err(ProviderError::BackendUnavailable(format!(
                "model file not found: {} (pass a local GGUF file; hub model ids are not downloaded)",
                model_path_buf.display()
            ))
            .into());
        }

        if let Some(precision) = options.precision {
            debug!("Requested precision {} (GGUF weights keep their own format)", precision);
        }
        if options.load_in_8bit == Some(true) {
            debug!("8-bit loading requested (GGUF weights keep their own quantization)");
        }
        if options.auth_token.is_some() {
            debug!("Auth token unused for local model files");
        }

        let backend = get_or_init_backend()?;

        let n_gpu_layers = gpu_layers_for(options);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        debug!("Using {} GPU layers", n_gpu_layers);

        let model = LlamaModel::load_from_file(&backend, &model_path_buf, &model_params)
            .map_err(|e| anyhow::anyhow!("Failed to load model: {:?}", e))?;

        let context_length = passthrough_u32(options, "context_length");
        debug!(
            "Loaded {} (trained context: {}, configured: {:?})",
            model_path_buf.display(),
            model.n_ctx_train(),
            context_length
        );

        Ok(Arc::new(LlamaPipeline {
            model,
            backend,
            context_length,
            threads: passthrough_u32(options, "threads"),
            return_full_text: options.return_full_text,
        }))
    }
}

pub struct LlamaPipeline {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    context_length: Option<u32>,
    threads: Option<u32>,
    return_full_text: bool,
}

impl TextGenerationPipeline for LlamaPipeline {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Vec<GeneratedText>> {
        let context_length = self.context_length.unwrap_or_else(|| self.model.n_ctx_train());
        let n_ctx = NonZeroU32::new(context_length).unwrap_or(NonZeroU32::MIN);
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(context_length);
        if let Some(n_threads) = self.threads {
            ctx_params = ctx_params.with_n_threads(thread_count(n_threads)?);
        }

        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| anyhow::anyhow!("Failed to create context: {:?}", e))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize: {:?}", e))?;
        if tokens.is_empty() {
            anyhow::bail!("Prompt produced no tokens");
        }
        debug!("Tokenized prompt: {} tokens", tokens.len());

        let mut batch = LlamaBatch::new(std::cmp::max(512, tokens.len()), 1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == tokens.len() - 1)
                .map_err(|e| anyhow::anyhow!("Failed to add token to batch: {:?}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| anyhow::anyhow!("Failed to decode prompt: {:?}", e))?;

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(1234),
        ]);

        let mut generated_text = String::new();
        let mut position = tokens.len() as i32;

        for _ in 0..params.max_new_tokens {
            let new_token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(new_token);

            if self.model.is_eog_token(new_token) {
                break;
            }

            let piece = self
                .model
                .token_to_str(new_token, Special::Tokenize)
                .unwrap_or_default();
            generated_text.push_str(&piece);

            batch.clear();
            batch
                .add(new_token, position, &[0], true)
                .map_err(|e| anyhow::anyhow!("Failed to add token to batch: {:?}", e))?;
            position += 1;

            ctx.decode(&mut batch)
                .map_err(|e| anyhow::anyhow!("Failed to decode: {:?}", e))?;
        }

        let generated_text = if self.return_full_text {
            format!("{}{}", prompt, generated_text)
        } else {
            generated_text
        };

        Ok(vec![GeneratedText { generated_text }])
    }

    fn generation_max_length(&self) -> Option<u64> {
        self.context_length.map(u64::from)
    }

    fn tokenizer_max_length(&self) -> u128 {
        u128::from(self.model.n_ctx_train())
    }
}
