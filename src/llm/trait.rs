//! The interface surface named in the design notes: a process-wide provider
//! router is built once at startup from a small trait, and the rest of the
//! core never touches a concrete provider type. The provider SDKs
//! themselves are treated as external collaborators; only this shape is
//! load-bearing.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::error::Result;
use super::types::{CompletionChunk, CompletionRequest};

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier used in failover model-id prefixing and logging.
    fn name(&self) -> &str;

    /// True when `model` belongs to this provider's family (used to route
    /// the first-party tokenizer and to recognise a failover-prefixed id
    /// like `anthropic/claude-3-5-sonnet`).
    fn owns_model(&self, model: &str) -> bool;

    async fn complete(&self, request: CompletionRequest) -> Result<ProviderStream>;
}
