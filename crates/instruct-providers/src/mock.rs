//! Test doubles for providers and their backends.
//!
//! # Example
//!
//! ```rust,ignore
//! use instruct_providers::mock::{MockCompletionBackend, MockPipelineLoader};
//!
//! // Hosted transport that answers once, then fails
//! let backend = MockCompletionBackend::new()
//!     .with_completion("Hello!")
//!     .with_error(ProviderError::Api { status: 529, message: "overloaded".into() });
//!
//! // Local loader reporting a 2048-token context
//! let loader = MockPipelineLoader::new()
//!     .with_response("generated")
//!     .with_tokenizer_max_length(2048);
//! ```

use crate::hosted::{CompleteRequest, CompleteResponse, CompletionBackend};
use crate::pipeline::{
    GeneratedText, GenerationParams, PipelineLoader, PipelineOptions, TextGenerationPipeline,
};
use crate::ProviderError;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Hosted transport answering from a queue and recording every request.
pub struct MockCompletionBackend {
    responses: Mutex<VecDeque<Result<CompleteResponse, ProviderError>>>,
    requests: Mutex<Vec<CompleteRequest>>,
    api_keys: Mutex<Vec<String>>,
}

impl MockCompletionBackend {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            api_keys: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful completion
    pub fn with_completion(self, text: &str) -> Self {
        self.responses.lock().unwrap().push_back(Ok(CompleteResponse {
            completion: text.to_string(),
            stop_reason: Some("stop_sequence".to_string()),
            model: None,
        }));
        self
    }

    /// Queue a failure
    pub fn with_error(self, error: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<CompleteRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// API keys sent with each request
    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys.lock().unwrap().clone()
    }
}

impl Default for MockCompletionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CompletionBackend for MockCompletionBackend {
    async fn complete(&self, api_key: &str, request: &CompleteRequest) -> Result<CompleteResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.api_keys.lock().unwrap().push(api_key.to_string());

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Ok(CompleteResponse {
                completion: "Mock completion (no responses configured)".to_string(),
                stop_reason: None,
                model: None,
            }),
        }
    }
}

/// Pipeline returning a fixed set of candidates.
pub struct MockPipeline {
    candidates: Vec<String>,
    generation_max_length: Option<u64>,
    tokenizer_max_length: u128,
    fail_with: Option<String>,
    calls: Mutex<Vec<(String, GenerationParams)>>,
}

impl MockPipeline {
    /// Prompts and parameters passed to `generate`
    pub fn calls(&self) -> Vec<(String, GenerationParams)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TextGenerationPipeline for MockPipeline {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Vec<GeneratedText>> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), *params));

        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }

        Ok(self
            .candidates
            .iter()
            .map(|text| GeneratedText {
                generated_text: text.clone(),
            })
            .collect())
    }

    fn generation_max_length(&self) -> Option<u64> {
        self.generation_max_length
    }

    fn tokenizer_max_length(&self) -> u128 {
        self.tokenizer_max_length
    }
}

/// Loader building [`MockPipeline`]s and counting how often it is asked to.
pub struct MockPipelineLoader {
    candidates: Vec<String>,
    generation_max_length: Option<u64>,
    tokenizer_max_length: u128,
    generate_error: Option<String>,
    load_error: Option<String>,
    load_count: AtomicUsize,
    loaded_with: Mutex<Vec<(String, PipelineOptions)>>,
    last_pipeline: Mutex<Option<Arc<MockPipeline>>>,
}

impl MockPipelineLoader {
    pub fn new() -> Self {
        Self {
            candidates: vec!["Mock generation".to_string()],
            generation_max_length: None,
            tokenizer_max_length: 2048,
            generate_error: None,
            load_error: None,
            load_count: AtomicUsize::new(0),
            loaded_with: Mutex::new(Vec::new()),
            last_pipeline: Mutex::new(None),
        }
    }

    /// Single candidate returned by every generation
    pub fn with_response(mut self, text: &str) -> Self {
        self.candidates = vec![text.to_string()];
        self
    }

    /// Candidates returned by every generation (may be empty)
    pub fn with_candidates(mut self, candidates: Vec<&str>) -> Self {
        self.candidates = candidates.into_iter().map(String::from).collect();
        self
    }

    pub fn with_generation_max_length(mut self, max_length: u64) -> Self {
        self.generation_max_length = Some(max_length);
        self
    }

    pub fn with_tokenizer_max_length(mut self, max_length: u128) -> Self {
        self.tokenizer_max_length = max_length;
        self
    }

    /// Make every load fail with this message
    pub fn failing_load(mut self, message: &str) -> Self {
        self.load_error = Some(message.to_string());
        self
    }

    /// Make every generation fail with this message
    pub fn failing_generate(mut self, message: &str) -> Self {
        self.generate_error = Some(message.to_string());
        self
    }

    /// Number of times `load` was called
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Model paths and options of every load
    pub fn loaded_with(&self) -> Vec<(String, PipelineOptions)> {
        self.loaded_with.lock().unwrap().clone()
    }

    /// The most recently built pipeline
    pub fn last_pipeline(&self) -> Option<Arc<MockPipeline>> {
        self.last_pipeline.lock().unwrap().clone()
    }
}

impl Default for MockPipelineLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineLoader for MockPipelineLoader {
    fn load(
        &self,
        model_path: &str,
        options: &PipelineOptions,
    ) -> Result<Arc<dyn TextGenerationPipeline>> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.loaded_with
            .lock()
            .unwrap()
            .push((model_path.to_string(), options.clone()));

        if let Some(message) = &self.load_error {
            anyhow::bail!("{}", message);
        }

        let pipeline = Arc::new(MockPipeline {
            candidates: self.candidates.clone(),
            generation_max_length: self.generation_max_length,
            tokenizer_max_length: self.tokenizer_max_length,
            fail_with: self.generate_error.clone(),
            calls: Mutex::new(Vec::new()),
        });
        *self.last_pipeline.lock().unwrap() = Some(Arc::clone(&pipeline));
        Ok(pipeline as Arc<dyn TextGenerationPipeline>)
    }
}
