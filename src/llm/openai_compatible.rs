//! OpenAI-compatible chat-completions adapter. Serves the official OpenAI
//! API as well as any self-hosted endpoint that speaks the same protocol.
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/provider/
//! custom_openai_compatible.rs` (`OpenAIProvider`) for the client
//! construction, header building, and SSE `data: ` line parsing; simplified
//! down to the chunk shape this core actually consumes.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ProviderError, Result};
use super::r#trait::{Provider, ProviderStream};
use super::types::{CompletionChunk, CompletionRequest, StopReason};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    name: String,
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, api_key: Option<String>, base_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()
            .expect("failed to build openai-compatible http client");
        Self {
            name: name.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        }
    }

    fn body(&self, req: &CompletionRequest) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(
            req.messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content})),
        );
        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": req.stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn owns_model(&self, model: &str) -> bool {
        !model.starts_with("anthropic/") && !model.starts_with("claude")
    }

    async fn complete(&self, request: CompletionRequest) -> Result<ProviderStream> {
        let body = self.body(&request);
        let mut builder = self.client.post(&self.base_url).json(&body);
        if let Some(key) = &self.api_key {
            let clean = key.trim();
            builder = builder.header("Authorization", format!("Bearer {clean}"));
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body: text });
        }

        let byte_stream = response.bytes_stream();
        Ok(Box::pin(parse_sse_events(byte_stream)))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("tool_calls") => StopReason::ToolCalls,
        Some("length") => StopReason::Length,
        _ => StopReason::Stop,
    }
}

fn parse_sse_events(
    byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures::Stream<Item = Result<CompletionChunk>> + Send {
    stream::unfold(
        (Box::pin(byte_stream), String::new(), false),
        move |(mut src, mut buf, mut done)| async move {
            loop {
                if done {
                    return None;
                }
                let bytes = match src.next().await {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => return Some((Err(ProviderError::Http(e)), (src, buf, true))),
                    None => return Some((Err(ProviderError::IncompleteStream), (src, buf, true))),
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(idx) = buf.find('\n') {
                    let line: String = buf.drain(..idx + 1).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        done = true;
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<ChatCompletionChunk>(data) else {
                        continue;
                    };
                    if let Some(choice) = parsed.choices.first() {
                        if let Some(text) = &choice.delta.content {
                            if !text.is_empty() {
                                return Some((
                                    Ok(CompletionChunk::Delta { text: text.clone() }),
                                    (src, buf, done),
                                ));
                            }
                        }
                        if let Some(reason) = &choice.finish_reason {
                            let usage = parsed.usage.unwrap_or_default();
                            return Some((
                                Ok(CompletionChunk::Done {
                                    stop_reason: map_finish_reason(Some(reason)),
                                    prompt_tokens: usage.prompt_tokens,
                                    completion_tokens: usage.completion_tokens,
                                    cache_read_input_tokens: usage
                                        .prompt_tokens_details
                                        .map(|d| d.cached_tokens)
                                        .unwrap_or(0),
                                    cache_creation_input_tokens: 0,
                                }),
                                (src, buf, true),
                            ));
                        }
                    }
                }
            }
        },
    )
}
