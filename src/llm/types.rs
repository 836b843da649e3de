//! Wire-shape-agnostic request/response types shared by every provider
//! adapter. Each adapter translates these to and from its own protocol.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stop,
    ToolCalls,
    Length,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Stop => "stop",
            StopReason::ToolCalls => "tool_calls",
            StopReason::Length => "length",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// One incremental unit of a streamed completion. Adapters emit a sequence
/// of `Delta` chunks followed by exactly one `Done`.
#[derive(Debug, Clone)]
pub enum CompletionChunk {
    Delta { text: String },
    ToolCall(ProviderToolCall),
    Done {
        stop_reason: StopReason,
        prompt_tokens: u64,
        completion_tokens: u64,
        cache_read_input_tokens: u64,
        cache_creation_input_tokens: u64,
    },
}
