//! Hosted provider over the legacy Anthropic text-completions API.
//!
//! The prompt is wrapped in a single Human/Assistant turn and sent as one
//! blocking completion request. Failures are returned as text by default:
//! callers see a response starting with [`ERROR_MARKER`] instead of an error.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{apply_failure_policy, FailurePolicy, InstructProvider, ProviderError};

/// Turn delimiter that opens the human side of the conversation.
pub const HUMAN_PROMPT: &str = "\n\nHuman:";
/// Turn delimiter that hands the conversation to the model.
pub const AI_PROMPT: &str = "\n\nAssistant:";
/// Prefix of every failure converted to text.
pub const ERROR_MARKER: &str = "Claude Error: ";

pub const DEFAULT_MAX_TOKENS: u32 = 75000;
/// Model advertised by [`HostedProviderConfig::default`].
pub const DECLARED_DEFAULT_MODEL: &str = "claude-2";
/// Model substituted when the configured model is empty at construction.
///
/// This is not the same model as [`DECLARED_DEFAULT_MODEL`]; both values are
/// kept as found so existing deployments resolve to the same model.
pub const FALLBACK_MODEL: &str = "claude-v1-100k";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct HostedProviderConfig {
    pub api_key: String,
    pub max_tokens: Option<u32>,
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    /// Accepted for forward compatibility and otherwise ignored.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for HostedProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            model_id: Some(DECLARED_DEFAULT_MODEL.to_string()),
            temperature: Some(DEFAULT_TEMPERATURE),
            extra: HashMap::new(),
        }
    }
}

/// Body of a `/v1/complete` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub model: String,
    pub prompt: String,
    pub stop_sequences: Vec<String>,
    pub temperature: f32,
    pub max_tokens_to_sample: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub completion: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Transport for completion requests.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, api_key: &str, request: &CompleteRequest) -> Result<CompleteResponse>;
}

/// [`CompletionBackend`] speaking HTTP to the hosted service.
#[derive(Clone)]
pub struct HttpCompletionBackend {
    client: Client,
    base_url: String,
}

impl HttpCompletionBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for HttpCompletionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(&self, api_key: &str, request: &CompleteRequest) -> Result<CompleteResponse> {
        debug!("Sending completion request: model={}", request.model);

        let response = self
            .client
            .post(format!("{}/v1/complete", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from)?;

        if !status.is_success() {
            return Err(parse_error_body(status.as_u16(), &body).into());
        }

        serde_json::from_str::<CompleteResponse>(&body)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()).into())
    }
}

/// Turn a non-success response body into a [`ProviderError::Api`].
fn parse_error_body(status: u16, body: &str) -> ProviderError {
    let message = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => format!("{}: {}", parsed.error.kind, parsed.error.message),
        Err(_) if body.trim().is_empty() => "Unknown error".to_string(),
        Err(_) => body.trim().to_string(),
    };
    ProviderError::Api { status, message }
}

/// Wrap a prompt in a single Human/Assistant exchange.
pub fn format_prompt(prompt: &str) -> String {
    format!("{}{}{}", HUMAN_PROMPT, prompt, AI_PROMPT)
}

pub struct HostedProvider {
    name: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    failure_policy: FailurePolicy,
    backend: Arc<dyn CompletionBackend>,
}

impl HostedProvider {
    /// Create a provider named "hosted" talking to the public API.
    pub fn new(config: HostedProviderConfig) -> Result<Self> {
        Self::new_with_name("hosted".to_string(), config)
    }

    pub fn new_with_name(name: String, config: HostedProviderConfig) -> Result<Self> {
        Self::with_backend(name, config, Arc::new(HttpCompletionBackend::new()))
    }

    /// Create a provider with an explicit transport.
    pub fn with_backend(
        name: String,
        config: HostedProviderConfig,
        backend: Arc<dyn CompletionBackend>,
    ) -> Result<Self> {
        if !config.extra.is_empty() {
            let mut keys: Vec<&str> = config.extra.keys().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            debug!("Ignoring unrecognized hosted provider options: {:?}", keys);
        }

        // Zero and empty values count as unset.
        let max_tokens = config
            .max_tokens
            .filter(|&t| t > 0)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let model = config
            .model_id
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string());
        let temperature = config
            .temperature
            .filter(|&t| t != 0.0)
            .unwrap_or(DEFAULT_TEMPERATURE);

        if !(0.0..=2.0).contains(&temperature) {
            return Err(ProviderError::InvalidConfig(format!(
                "temperature must be within [0, 2], got {}",
                temperature
            ))
            .into());
        }

        if config.api_key.is_empty() {
            warn!("Hosted provider '{}' has no API key configured", name);
        }

        Ok(Self {
            name,
            api_key: config.api_key,
            model,
            max_tokens,
            temperature,
            failure_policy: FailurePolicy::ReturnAsText,
            backend,
        })
    }

    /// Override how failures surface from `instruct`.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Build the completion request for a prompt.
    pub fn build_request(&self, prompt: &str) -> CompleteRequest {
        CompleteRequest {
            model: self.model.clone(),
            prompt: format_prompt(prompt),
            stop_sequences: vec![HUMAN_PROMPT.to_string()],
            temperature: self.temperature,
            max_tokens_to_sample: self.max_tokens,
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = self.build_request(prompt);
        let response = self.backend.complete(&self.api_key, &request).await?;
        debug!(
            "Completion finished: stop_reason={:?}, {} chars",
            response.stop_reason,
            response.completion.len()
        );
        Ok(response.completion)
    }
}

#[async_trait::async_trait]
impl InstructProvider for HostedProvider {
    async fn instruct_with_tokens(&self, prompt: &str, _input_tokens: u32) -> Result<String> {
        let result = self.complete(prompt).await;
        if let Err(e) = &result {
            warn!("Hosted provider '{}' request failed: {}", self.name, e);
        }
        apply_failure_policy(self.failure_policy, ERROR_MARKER, result)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
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


#[cfg(test)]
mod http_tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn http_provider(base_url: String) -> HostedProvider {
        let config = HostedProviderConfig {
            api_key: "sk-test".to_string(),
            ..HostedProviderConfig::default()
        };
        HostedProvider::with_backend(
            "hosted.http".to_string(),
            config,
            Arc::new(HttpCompletionBackend::with_base_url(base_url)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_sends_legacy_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/complete")
            .match_header("x-api-key", "sk-test")
            .match_header("anthropic-version", "2023-06-01")
            .match_body(Matcher::PartialJson(json!({
                "model": "claude-2",
                "prompt": "\n\nHuman:Yo\n\nAssistant:",
                "stop_sequences": ["\n\nHuman:"],
                "max_tokens_to_sample": 75000
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"completion":" Hey","stop_reason":"stop_sequence","model":"claude-2"}"#)
            .create_async()
            .await;

        let text = http_provider(server.url()).instruct("Yo").await.unwrap();

        assert_eq!(text, " Hey");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_becomes_marked_text() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/complete")
            .with_status(401)
            .with_body(
                r#"{"type":"error","error":{"type":"authentication_error","message":"bad key"}}"#,
            )
            .create_async()
            .await;

        let text = http_provider(server.url()).instruct("Yo").await.unwrap();

        assert_eq!(
            text,
            "Claude Error: API error (401): authentication_error: bad key"
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_becomes_marked_text() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/complete")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let text = http_provider(server.url()).instruct("Yo").await.unwrap();

        assert!(
            text.starts_with("Claude Error: malformed response:"),
            "got: {}",
            text
        );
    }

    #[tokio::test]
    async fn test_refused_connection_becomes_marked_text() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let text = http_provider(format!("http://{}", addr))
            .instruct("Yo")
            .await
            .unwrap();

        assert!(
            text.starts_with("Claude Error: request failed:"),
            "got: {}",
            text
        );
    }

    #[tokio::test]
    async fn test_propagate_surfaces_api_error_kind() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/complete")
            .with_status(529)
            .with_body(r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#)
            .create_async()
            .await;

        let provider = http_provider(server.url()).with_failure_policy(FailurePolicy::Propagate);
        let err = provider.instruct("Yo").await.unwrap_err();

        match err.downcast_ref::<ProviderError>() {
            Some(ProviderError::Api { status, message }) => {
                assert_eq!(*status, 529);
                assert_eq!(message, "overloaded_error: busy");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }
}
