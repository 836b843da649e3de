//! LLM Provider Adapters (spec §1 non-goal: the provider SDK itself is an
//! external collaborator; only this interface is load-bearing).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/provider/mod.rs`'s
//! module layout (error/trait/types split, provider implementations
//! re-exported alongside a `factory`).

mod anthropic;
mod error;
mod factory;
mod openai_compatible;
#[allow(clippy::module_inception)]
mod r#trait;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, Result};
pub use factory::{create_failover_provider, create_provider};
pub use openai_compatible::OpenAiCompatibleProvider;
pub use r#trait::{Provider, ProviderStream};
pub use types::{ChatMessage, CompletionChunk, CompletionRequest, ProviderToolCall, StopReason};
