//! Provider-facing error type. Kept separate from [`crate::error::CoreError`]
//! so provider adapters do not need to depend on the rest of the crate;
//! callers fold a `ProviderError` into `CoreError::Llm` at the Thread Runner
//! boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error calling provider: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned non-2xx status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("stream ended without a terminal chunk")]
    IncompleteStream,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
