//! Response Processor (spec §4.5).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/agent/service/
//! tool_loop.rs` for parallel-looking-but-ordered tool dispatch, streaming
//! chunk handling, and auto-continue bookkeeping; this module is the
//! standalone, spec-scoped version of that loop's processing half (the
//! Thread Runner in `crate::runner` owns the surrounding iteration).

pub mod xml;

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use uuid::Uuid;

use crate::db::Usage;
use crate::tools::{ToolRegistry, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    XmlToolLimitReached,
}

impl FinishReason {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "tool_calls" => Some(Self::ToolCalls),
            "length" => Some(Self::Length),
            "xml_tool_limit_reached" => Some(Self::XmlToolLimitReached),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkType {
    Status,
    Assistant,
    Tool,
    Content,
}

/// Stream chunk shape (spec §6).
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub kind: ChunkType,
    pub content: Value,
    pub metadata: Value,
}

impl StreamChunk {
    /// A `{type:"status", status, message}` chunk (spec §6, §7 ErrorProcessor
    /// shape `{type:"status", status:"error", message, context}`).
    pub fn status(status: &str, message: &str) -> Self {
        Self {
            kind: ChunkType::Status,
            content: serde_json::json!({"status": status, "message": message}),
            metadata: Value::Null,
        }
    }

    pub fn content_delta(text: &str) -> Self {
        Self {
            kind: ChunkType::Content,
            content: Value::String(text.to_string()),
            metadata: Value::Null,
        }
    }

    pub fn tool_result(tool_name: &str, success: bool, output: &str) -> Self {
        Self {
            kind: ChunkType::Tool,
            content: Value::String(output.to_string()),
            metadata: serde_json::json!({"function_name": tool_name, "success": success}),
        }
    }

    pub fn finish(finish_reason: FinishReason) -> Self {
        let reason = match finish_reason {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::XmlToolLimitReached => "xml_tool_limit_reached",
        };
        Self {
            kind: ChunkType::Assistant,
            content: Value::Null,
            metadata: serde_json::json!({"finish_reason": reason}),
        }
    }
}

/// Receives every chunk a `Thread Runner` iteration produces, in order
/// (spec §4.6/§6). The Background Runner is the publishing side (component
/// K "publishes stream chunks"); delivering them onward to a live client is
/// the frontend's concern and out of scope here (spec §1).
pub trait ChunkSink: Send + Sync {
    fn publish(&self, agent_run_id: Uuid, chunk: StreamChunk);
}

/// Sink used where no chunk consumer is wired up (tests, one-off runs).
pub struct NullChunkSink;

impl ChunkSink for NullChunkSink {
    fn publish(&self, _agent_run_id: Uuid, _chunk: StreamChunk) {}
}

/// A resolved tool invocation, whether it came from the provider's native
/// `tool_calls` field or was scanned out of XML text.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// `auto_continue_state` (spec §4.6): per-run bookkeeping the Thread Runner
/// threads across iterations of the same logical turn.
#[derive(Debug, Clone, Default)]
pub struct AutoContinueState {
    pub count: u32,
    pub active: bool,
    pub accumulated_content: String,
    pub thread_run_id: Option<Uuid>,
}

/// Auto-continue trigger rules (spec §4.5). Applied once per chunk.
pub fn apply_auto_continue_signal(
    state: &mut AutoContinueState,
    finish_reason: Option<FinishReason>,
    tools_executed: bool,
) {
    match finish_reason {
        Some(FinishReason::ToolCalls) => {
            state.active = true;
            state.count += 1;
        }
        Some(FinishReason::Length) => {
            state.active = true;
            state.count += 1;
        }
        Some(FinishReason::XmlToolLimitReached) => {
            state.active = false;
        }
        _ if tools_executed => {
            state.active = true;
            state.count += 1;
        }
        _ => {}
    }
}

/// The streaming consumer drops provider finish chunks that triggered an
/// auto-continue with reason `length` (so the UI doesn't see a false end)
/// but always forwards tool-execution finish chunks.
pub fn should_forward_finish_chunk(finish_reason: Option<FinishReason>, auto_continued: bool) -> bool {
    !(auto_continued && finish_reason == Some(FinishReason::Length))
}

/// `</ask>`/`</complete>` in assistant text, or a status chunk carrying
/// `metadata.agent_should_terminate`, ends the outer loop regardless of
/// finish_reason.
pub fn is_terminating(text: &str, metadata: &Value) -> bool {
    text.contains("</ask>")
        || text.contains("</complete>")
        || metadata.get("agent_should_terminate").and_then(|v| v.as_bool()).unwrap_or(false)
}

pub struct ResponseProcessor {
    registry: Arc<ToolRegistry>,
}

impl ResponseProcessor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Extracts tool calls from an assistant turn: native calls take
    /// priority; XML calls are scanned only when no native calls are
    /// present (the two modes are configured per run, never mixed within
    /// one turn).
    pub fn extract_tool_calls(&self, native: &[ToolCall], assistant_text: &str) -> Vec<ToolCall> {
        if !native.is_empty() {
            return native.to_vec();
        }
        xml::parse(assistant_text)
            .into_iter()
            .map(|c| ToolCall {
                id: None,
                name: c.name,
                arguments: c.arguments,
            })
            .collect()
    }

    /// Executes every call concurrently (`tool_execution_strategy =
    /// parallel`) but returns results in invocation order, since the caller
    /// must append tool messages after the assistant message in that fixed
    /// order regardless of completion order.
    pub async fn execute_tools(&self, calls: Vec<ToolCall>) -> Vec<(ToolCall, ToolResult)> {
        let registry = &self.registry;
        let futures = calls.iter().map(|call| {
            let registry = registry.clone();
            let name = call.name.clone();
            let args = call.arguments.clone();
            async move {
                match registry.get(&name) {
                    Some(tool) => tool
                        .invoke(args)
                        .await
                        .unwrap_or_else(|e| ToolResult::failed(e.to_string())),
                    None => ToolResult::failed(format!("no such tool: {name}")),
                }
            }
        });
        let results = join_all(futures).await;
        calls.into_iter().zip(results).collect()
    }

    pub fn any_terminating(&self, calls: &[ToolCall]) -> bool {
        calls.iter().any(|c| self.registry.is_terminating(&c.name))
    }
}

pub fn build_usage(
    prompt_tokens: u64,
    completion_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
    model: String,
    estimated: bool,
) -> Usage {
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cache_read_input_tokens,
        cache_creation_input_tokens,
        model,
        estimated,
        fallback: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_chunk_matches_credit_denial_shape() {
        let chunk = StreamChunk::status("stopped", "Insufficient credits: insufficient");
        assert_eq!(chunk.kind, ChunkType::Status);
        assert_eq!(
            chunk.content,
            serde_json::json!({"status": "stopped", "message": "Insufficient credits: insufficient"})
        );
    }

    #[test]
    fn tool_calls_finish_reason_starts_auto_continue() {
        let mut state = AutoContinueState::default();
        apply_auto_continue_signal(&mut state, Some(FinishReason::ToolCalls), false);
        assert!(state.active);
        assert_eq!(state.count, 1);
    }

    #[test]
    fn xml_tool_limit_clears_active() {
        let mut state = AutoContinueState {
            active: true,
            count: 2,
            ..Default::default()
        };
        apply_auto_continue_signal(&mut state, Some(FinishReason::XmlToolLimitReached), false);
        assert!(!state.active);
    }

    #[test]
    fn length_finish_chunk_is_dropped_when_it_triggered_continue() {
        assert!(!should_forward_finish_chunk(Some(FinishReason::Length), true));
        assert!(should_forward_finish_chunk(Some(FinishReason::ToolCalls), true));
    }

    #[test]
    fn terminating_tags_detected_in_text() {
        assert!(is_terminating("please wait</ask>", &Value::Null));
        assert!(is_terminating("done</complete>", &Value::Null));
        assert!(!is_terminating("still working", &Value::Null));
    }

    #[test]
    fn terminating_via_metadata_flag() {
        let meta = serde_json::json!({"agent_should_terminate": true});
        assert!(is_terminating("", &meta));
    }

    #[tokio::test]
    async fn execute_tools_preserves_invocation_order_despite_completion_order() {
        use crate::tools::Tool;
        use async_trait::async_trait;

        struct SlowThenFast;
        #[async_trait]
        impl Tool for SlowThenFast {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "slow tool"
            }
            fn parameters_schema(&self) -> Value {
                Value::Null
            }
            async fn invoke(&self, _params: Value) -> crate::error::CoreResult<ToolResult> {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(ToolResult::ok("slow-done"))
            }
        }
        struct Fast;
        #[async_trait]
        impl Tool for Fast {
            fn name(&self) -> &str {
                "fast"
            }
            fn description(&self) -> &str {
                "fast tool"
            }
            fn parameters_schema(&self) -> Value {
                Value::Null
            }
            async fn invoke(&self, _params: Value) -> crate::error::CoreResult<ToolResult> {
                Ok(ToolResult::ok("fast-done"))
            }
        }

        let registry = Arc::new(
            ToolRegistry::new()
                .register(Arc::new(SlowThenFast))
                .register(Arc::new(Fast)),
        );
        let processor = ResponseProcessor::new(registry);
        let calls = vec![
            ToolCall {
                id: None,
                name: "slow".into(),
                arguments: Value::Null,
            },
            ToolCall {
                id: None,
                name: "fast".into(),
                arguments: Value::Null,
            },
        ];
        let results = processor.execute_tools(calls).await;
        assert_eq!(results[0].0.name, "slow");
        assert_eq!(results[0].1.output, "slow-done");
        assert_eq!(results[1].0.name, "fast");
        assert_eq!(results[1].1.output, "fast-done");
    }
}
