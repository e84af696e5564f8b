use thiserror::Error;

/// Failure kinds originating in a provider or its backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("local backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("pipeline returned no candidates")]
    NoCandidates,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
