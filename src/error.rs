//! Central error types for the conversation execution core.
//!
//! Grounded: `examples/adolfousier-opencrabs/src/lib.rs` re-exports a single
//! `OpenCrabsError`/`ErrorCode` pair from `error.rs` as the crate-wide error
//! surface; this module follows the same shape, with one variant per error
//! kind named in the component design (context budget, credits, tools,
//! webhooks, triggers, providers, sandbox).

use thiserror::Error;

/// A machine-matchable classification of a [`CoreError`], useful for mapping
/// onto HTTP status codes or stream chunk `status` fields without a second
/// match on the error's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Llm,
    InsufficientCredits,
    CompressionExhausted,
    ToolInvocation,
    WebhookVerificationFailed,
    TriggerSetupFailed,
    AgentOverloaded,
    SandboxCreationFailed,
    NotFound,
    Database,
    Internal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Provider returned non-2xx, timed out, or the stream aborted.
    #[error("llm provider error: {0}")]
    Llm(String),

    /// Credit reservation denied before starting an iteration.
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    /// Tiered compression could not bring the message list under budget
    /// within the configured iteration budget.
    #[error("context compression exhausted after {iterations} iterations, {tokens} tokens over a {budget} budget")]
    CompressionExhausted {
        iterations: u32,
        tokens: usize,
        budget: usize,
    },

    /// A tool invocation failed; callers record this as a `tool` message and
    /// continue the turn rather than propagating it further.
    #[error("tool '{tool}' failed: {message}")]
    ToolInvocation { tool: String, message: String },

    /// Webhook signature verification failed; no state mutation must occur.
    #[error("webhook verification failed: {0}")]
    WebhookVerificationFailed(String),

    /// A trigger provider's `setup_trigger` returned false.
    #[error("trigger setup failed for provider '{provider}': {reason}")]
    TriggerSetupFailed { provider: String, reason: String },

    /// Recognised by substring match on a provider error; triggers failover.
    #[error("provider overloaded: {0}")]
    AgentOverloaded(String),

    /// Sandbox/project creation failed during the execution pipeline.
    #[error("sandbox creation failed: {0}")]
    SandboxCreationFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] deadpool_sqlite::PoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Llm(_) => ErrorCode::Llm,
            CoreError::InsufficientCredits(_) => ErrorCode::InsufficientCredits,
            CoreError::CompressionExhausted { .. } => ErrorCode::CompressionExhausted,
            CoreError::ToolInvocation { .. } => ErrorCode::ToolInvocation,
            CoreError::WebhookVerificationFailed(_) => ErrorCode::WebhookVerificationFailed,
            CoreError::TriggerSetupFailed { .. } => ErrorCode::TriggerSetupFailed,
            CoreError::AgentOverloaded(_) => ErrorCode::AgentOverloaded,
            CoreError::SandboxCreationFailed(_) => ErrorCode::SandboxCreationFailed,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::Database(_) | CoreError::Pool(_) => ErrorCode::Database,
            CoreError::Config(_) | CoreError::Io(_) | CoreError::Serde(_) | CoreError::Other(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// True when the provider error text matches the substring heuristic the
    /// Thread Runner uses to trigger failover (spec §4.6 step 10 / §7
    /// `AgentOverloaded`).
    pub fn is_overloaded(text: &str) -> bool {
        let lower = text.to_ascii_lowercase();
        lower.contains("overloaded")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("capacity")
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_substring_match() {
        assert!(CoreError::is_overloaded("Error: model is overloaded, try again"));
        assert!(CoreError::is_overloaded("429 rate_limit_exceeded"));
        assert!(!CoreError::is_overloaded("invalid api key"));
    }

    #[test]
    fn error_code_mapping() {
        let e = CoreError::InsufficientCredits("balance too low".into());
        assert_eq!(e.code(), ErrorCode::InsufficientCredits);
    }
}
