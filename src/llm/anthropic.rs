//! Anthropic Messages API adapter.
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/provider/
//! custom_openai_compatible.rs` for the reqwest client construction
//! (shared timeouts, connection pool sizing) and the streaming-response
//! line-by-line parse loop; translated from OpenAI's chat-completions SSE
//! shape to Anthropic's `message_start`/`content_block_delta`/
//! `message_delta`/`message_stop` event shape.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ProviderError, Result};
use super::r#trait::{Provider, ProviderStream};
use super::types::{CompletionChunk, CompletionRequest, StopReason};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()
            .expect("failed to build anthropic http client");
        Self {
            api_key,
            base_url,
            client,
        }
    }

    fn body(&self, req: &CompletionRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": req.stream,
        });
        if let Some(system) = &req.system {
            body["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn owns_model(&self, model: &str) -> bool {
        model.trim_start_matches("anthropic/").starts_with("claude")
    }

    async fn complete(&self, request: CompletionRequest) -> Result<ProviderStream> {
        let body = self.body(&request);
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", self.api_key.trim())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body: text });
        }

        let byte_stream = response.bytes_stream();
        let chunks = parse_sse_events(byte_stream);
        Ok(Box::pin(chunks))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ContentDelta },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDelta, usage: DeltaUsage },
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: StartUsage,
}

#[derive(Debug, Deserialize, Default)]
struct StartUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("tool_use") => StopReason::ToolCalls,
        Some("max_tokens") => StopReason::Length,
        _ => StopReason::Stop,
    }
}

/// Folds raw SSE bytes into `CompletionChunk`s. Anthropic's stream carries
/// usage across two separate events (`message_start` for input tokens,
/// `message_delta` for output tokens and the stop reason), so this keeps a
/// small running total and only emits `Done` once both have arrived.
struct State {
    buf: String,
    prompt_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
}

fn parse_sse_events(
    byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures::Stream<Item = Result<CompletionChunk>> + Send {
    let state = State {
        buf: String::new(),
        prompt_tokens: 0,
        cache_read_input_tokens: 0,
        cache_creation_input_tokens: 0,
    };

    stream::unfold(
        (
            Box::pin(byte_stream),
            state,
            std::collections::VecDeque::<CompletionChunk>::new(),
        ),
        move |(mut src, mut state, mut pending)| async move {
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (src, state, pending)));
                }
                let bytes = match src.next().await {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => return Some((Err(ProviderError::Http(e)), (src, state, pending))),
                    None => return None,
                };
                state.buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(idx) = state.buf.find("\n\n") {
                    let event_block: String = state.buf.drain(..idx + 2).collect();
                    for line in event_block.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(event) = serde_json::from_str::<AnthropicEvent>(data) else {
                            continue;
                        };
                        match event {
                            AnthropicEvent::MessageStart { message } => {
                                state.prompt_tokens = message.usage.input_tokens;
                                state.cache_read_input_tokens = message.usage.cache_read_input_tokens;
                                state.cache_creation_input_tokens =
                                    message.usage.cache_creation_input_tokens;
                            }
                            AnthropicEvent::ContentBlockDelta { delta } => {
                                if let Some(text) = delta.text {
                                    pending.push_back(CompletionChunk::Delta { text });
                                }
                            }
                            AnthropicEvent::MessageDelta { delta, usage } => {
                                pending.push_back(CompletionChunk::Done {
                                    stop_reason: map_stop_reason(delta.stop_reason.as_deref()),
                                    prompt_tokens: state.prompt_tokens,
                                    completion_tokens: usage.output_tokens,
                                    cache_read_input_tokens: state.cache_read_input_tokens,
                                    cache_creation_input_tokens: state.cache_creation_input_tokens,
                                });
                            }
                            AnthropicEvent::Other => {}
                        }
                    }
                }
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (src, state, pending)));
                }
            }
        },
    )
}
