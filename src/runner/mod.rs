//! Thread Runner (spec §4.6).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/agent/service/
//! tool_loop.rs` for the per-turn loop shape (budget check, conditional
//! compression, provider call, streaming relay, auto-continue bookkeeping,
//! exit conditions) this module generalises into a provider-agnostic,
//! spec-scoped runner; `pricing.rs`'s prefix-keyed lookup style for
//! [`context_window_for_model`].

use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use crate::billing::BillingService;
use crate::cache::CacheTransform;
use crate::config::{Config, ContextConfig};
use crate::context::ContextManager;
use crate::db::{AgentRunStatus, Content, Message, MessageMetadata, MessageType, Usage};
use crate::error::{CoreError, CoreResult};
use crate::llm::{create_failover_provider, ChatMessage, CompletionChunk, CompletionRequest, Provider, StopReason};
use crate::messages::MessageStore;
use crate::processor::{
    apply_auto_continue_signal, build_usage, is_terminating, should_forward_finish_chunk, AutoContinueState, ChunkSink, FinishReason,
    ResponseProcessor, StreamChunk, ToolCall,
};
use crate::tokens::TokenCounter;
use crate::tools::ToolRegistry;

use deadpool_sqlite::Pool;

/// Default cap on auto-continue iterations within one `run_thread` call
/// (spec §4.6 step 9 "count >= native_max_auto_continues (default 25)").
const NATIVE_MAX_AUTO_CONTINUES: u32 = 25;

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Context-window size per model family. No teacher/example file names an
/// authoritative table; these mirror each vendor's publicly documented
/// window for the model names this core actually builds requests for.
pub fn context_window_for_model(model: &str) -> usize {
    let m = model.trim_start_matches("anthropic/").trim_start_matches("openrouter/");
    if m.starts_with("claude") {
        200_000
    } else if m.starts_with("gpt-4o") || m.starts_with("o3") || m.starts_with("o1") {
        128_000
    } else {
        128_000
    }
}

pub struct ThreadRunner {
    pool: Pool,
    config: Arc<Config>,
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    billing: Arc<BillingService>,
    tokens: TokenCounter,
    context_cfg: ContextConfig,
}

impl ThreadRunner {
    pub fn new(
        pool: Pool,
        config: Arc<Config>,
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        billing: Arc<BillingService>,
    ) -> Self {
        Self {
            pool,
            config,
            provider,
            registry,
            billing,
            tokens: TokenCounter::new(),
            context_cfg: ContextConfig::default(),
        }
    }

    /// Drives one logical turn to completion, including every auto-continue
    /// iteration, and leaves `agent_runs.status` in a terminal state before
    /// returning. Never bubbles a raw provider/db error past this boundary;
    /// failures end the run with `Failed` and are logged (spec §7: "never
    /// panics/bubbles a raw error out").
    pub async fn run_thread(
        &self,
        thread_id: Uuid,
        agent_run_id: Uuid,
        model_name: String,
        chunks: Arc<dyn ChunkSink>,
    ) -> CoreResult<()> {
        match self.run_thread_inner(thread_id, agent_run_id, model_name, chunks.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(thread_id = %thread_id, agent_run_id = %agent_run_id, error = %e, "thread run ended with error");
                chunks.publish(agent_run_id, StreamChunk::status("error", &e.to_string()));
                let _ = crate::db::set_agent_run_status(&self.pool, agent_run_id, AgentRunStatus::Failed).await;
                Err(e)
            }
        }
    }

    async fn run_thread_inner(&self, thread_id: Uuid, agent_run_id: Uuid, model_name: String, chunks: &dyn ChunkSink) -> CoreResult<()> {
        let thread = crate::db::get_thread(&self.pool, thread_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("thread {thread_id}")))?;
        let store = MessageStore::new(&self.pool);

        let mut model = model_name;
        let mut provider: Arc<dyn Provider> = self.provider.clone();
        let mut auto_continue = AutoContinueState::default();
        let mut cache_needs_rebuild = thread.metadata.cache_needs_rebuild;

        loop {
            let (can_run, reservation_id) = self.billing.check_and_reserve_credits(thread.account_id).await?;
            if !can_run {
                chunks.publish(agent_run_id, StreamChunk::status("stopped", "Insufficient credits: insufficient"));
                crate::db::set_agent_run_status(&self.pool, agent_run_id, AgentRunStatus::Stopped).await?;
                return Ok(());
            }

            let skip_compression = self.fast_budget_check(thread_id, &model, auto_continue.count > 0).await?;

            let mut messages = store.list_llm_messages(thread_id).await?;

            if auto_continue.count > 0 && !auto_continue.accumulated_content.is_empty() {
                let continuation = Message {
                    message_id: Uuid::new_v4(),
                    thread_id,
                    created_at: chrono::Utc::now(),
                    kind: MessageType::Assistant,
                    is_llm_message: true,
                    content: Content::Text(auto_continue.accumulated_content.clone()),
                    metadata: MessageMetadata::default(),
                    agent_id: None,
                    agent_version_id: None,
                };
                store.append(continuation.clone()).await?;
                messages.push(continuation);
            }

            let window = context_window_for_model(&model);
            if !skip_compression {
                let cm = ContextManager::new(&self.pool, &self.tokens, &self.context_cfg);
                let outcome = cm.compress(messages, &model, window, None, None).await?;
                messages = outcome.messages;
                if outcome.db_write_occurred {
                    cache_needs_rebuild = true;
                    crate::db::set_cache_needs_rebuild(&self.pool, thread_id, true).await?;
                }
            }

            if cache_needs_rebuild {
                messages = CacheTransform::enabled().apply(&messages);
                cache_needs_rebuild = false;
                crate::db::set_cache_needs_rebuild(&self.pool, thread_id, false).await?;
            }

            let tool_schemas = self.registry.schemas();
            let tools_json: Vec<serde_json::Value> = tool_schemas
                .iter()
                .map(|s| serde_json::to_value(s).unwrap_or(serde_json::Value::Null))
                .collect();

            let request = CompletionRequest {
                model: model.clone(),
                system: None,
                messages: messages.iter().map(to_chat_message).collect(),
                tools: tools_json,
                max_tokens: DEFAULT_MAX_TOKENS,
                stream: true,
            };

            let stream_result = provider.complete(request).await;
            let mut stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    if CoreError::is_overloaded(&e.to_string()) {
                        if let Some(failover) = create_failover_provider(&self.config, provider.as_ref()) {
                            tracing::warn!(from = provider.name(), to = failover.name(), "provider overloaded, failing over");
                            provider = failover;
                            model = format!("{}/{}", provider.name(), strip_known_prefix(&model));
                            if let Some(rid) = reservation_id {
                                self.billing.release_reservation(rid).await?;
                            }
                            continue;
                        }
                    }
                    if let Some(rid) = reservation_id {
                        self.billing.release_reservation(rid).await?;
                    }
                    chunks.publish(agent_run_id, StreamChunk::status("error", &e.to_string()));
                    crate::db::set_agent_run_status(&self.pool, agent_run_id, AgentRunStatus::Failed).await?;
                    return Err(CoreError::Llm(e.to_string()));
                }
            };

            let mut assistant_text = String::new();
            let mut native_calls: Vec<crate::llm::ProviderToolCall> = Vec::new();
            let mut usage: Option<Usage> = None;
            let mut stop_reason = StopReason::Stop;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(CompletionChunk::Delta { text }) => {
                        chunks.publish(agent_run_id, StreamChunk::content_delta(&text));
                        assistant_text.push_str(&text);
                    }
                    Ok(CompletionChunk::ToolCall(call)) => native_calls.push(call),
                    Ok(CompletionChunk::Done {
                        stop_reason: sr,
                        prompt_tokens,
                        completion_tokens,
                        cache_read_input_tokens,
                        cache_creation_input_tokens,
                    }) => {
                        stop_reason = sr;
                        usage = Some(build_usage(
                            prompt_tokens,
                            completion_tokens,
                            cache_read_input_tokens,
                            cache_creation_input_tokens,
                            model.clone(),
                            false,
                        ));
                    }
                    Err(e) => {
                        if let Some(rid) = reservation_id {
                            self.billing.release_reservation(rid).await?;
                        }
                        chunks.publish(agent_run_id, StreamChunk::status("error", &e.to_string()));
                        crate::db::set_agent_run_status(&self.pool, agent_run_id, AgentRunStatus::Failed).await?;
                        return Err(CoreError::Llm(e.to_string()));
                    }
                }
            }

            let assistant_message_id = Uuid::new_v4();
            let assistant_message = Message {
                message_id: assistant_message_id,
                thread_id,
                created_at: chrono::Utc::now(),
                kind: MessageType::Assistant,
                is_llm_message: true,
                content: Content::Text(assistant_text.clone()),
                metadata: MessageMetadata::default(),
                agent_id: None,
                agent_version_id: None,
            };
            store.append(assistant_message).await?;

            let processor = ResponseProcessor::new(self.registry.clone());
            let native_tool_calls: Vec<ToolCall> = native_calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.name,
                    arguments: c.arguments,
                })
                .collect();
            let calls = processor.extract_tool_calls(&native_tool_calls, &assistant_text);
            let tools_executed = !calls.is_empty();
            let any_terminating = processor.any_terminating(&calls);

            let results = processor.execute_tools(calls).await;
            for (call, result) in &results {
                let mut metadata = MessageMetadata::default();
                metadata.assistant_message_id = Some(assistant_message_id);
                metadata.extra.insert("tool_name".into(), serde_json::Value::String(call.name.clone()));
                metadata.extra.insert("success".into(), serde_json::Value::Bool(result.success));
                let tool_message = Message {
                    message_id: Uuid::new_v4(),
                    thread_id,
                    created_at: chrono::Utc::now(),
                    kind: MessageType::Tool,
                    is_llm_message: true,
                    content: Content::Text(result.output.clone()),
                    metadata,
                    agent_id: None,
                    agent_version_id: None,
                };
                store.append(tool_message).await?;
                chunks.publish(agent_run_id, StreamChunk::tool_result(&call.name, result.success, &result.output));
            }

            if let Some(usage) = usage {
                let end_message = Message {
                    message_id: Uuid::new_v4(),
                    thread_id,
                    created_at: chrono::Utc::now(),
                    kind: MessageType::LlmResponseEnd,
                    is_llm_message: false,
                    content: Content::Text(String::new()),
                    metadata: MessageMetadata {
                        usage: Some(usage.clone()),
                        ..Default::default()
                    },
                    agent_id: None,
                    agent_version_id: None,
                };
                let llm_response_id = store.append(end_message).await?;
                self.billing.deduct(llm_response_id, thread.account_id, &usage).await?;
            }

            let finish_reason = match stop_reason {
                StopReason::Stop => Some(FinishReason::Stop),
                StopReason::ToolCalls => Some(FinishReason::ToolCalls),
                StopReason::Length => Some(FinishReason::Length),
            };
            apply_auto_continue_signal(&mut auto_continue, finish_reason, tools_executed);

            if let Some(reason) = finish_reason {
                if should_forward_finish_chunk(Some(reason), auto_continue.active) {
                    chunks.publish(agent_run_id, StreamChunk::finish(reason));
                }
            }

            let terminal_tags = is_terminating(&assistant_text, &serde_json::Value::Null);
            let exit_no_continue = !auto_continue.active;
            let exit_count_exhausted = auto_continue.count >= NATIVE_MAX_AUTO_CONTINUES;
            let exit_terminating = any_terminating || terminal_tags;

            if exit_no_continue || exit_count_exhausted || exit_terminating {
                crate::db::set_agent_run_status(&self.pool, agent_run_id, AgentRunStatus::Completed).await?;
                return Ok(());
            }

            auto_continue.accumulated_content = assistant_text;
        }
    }

    /// Step 1 of the loop: reuses the last recorded usage instead of
    /// re-measuring the whole thread when the running total is comfortably
    /// under budget.
    async fn fast_budget_check(&self, thread_id: Uuid, model: &str, is_auto_continue: bool) -> CoreResult<bool> {
        let store = MessageStore::new(&self.pool);
        let Some(last) = store.latest_of_type(thread_id, MessageType::LlmResponseEnd).await? else {
            return Ok(false);
        };
        let Some(usage) = last.metadata.usage else {
            return Ok(false);
        };
        if strip_known_prefix(&usage.model) != strip_known_prefix(model) {
            return Ok(false);
        }

        let extra_tokens = if is_auto_continue {
            0
        } else if let Some(latest_user) = store.latest_of_type(thread_id, MessageType::User).await? {
            latest_user.content.as_text().map(|t| self.tokens.estimate_text(t)).unwrap_or(0)
        } else {
            0
        };

        let estimated = usage.total_tokens as usize + extra_tokens;
        Ok(estimated < crate::context::budget::budget(context_window_for_model(model)))
    }
}

fn strip_known_prefix(model: &str) -> &str {
    model
        .trim_start_matches("anthropic/")
        .trim_start_matches("openrouter/")
        .trim_start_matches("openai/")
}

fn to_chat_message(m: &Message) -> ChatMessage {
    let role = match m.kind {
        MessageType::User => "user",
        MessageType::Assistant => "assistant",
        MessageType::Tool => "tool",
        _ => "system",
    };
    ChatMessage {
        role: role.to_string(),
        content: m.content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_recognises_claude_family() {
        assert_eq!(context_window_for_model("claude-sonnet-4-6"), 200_000);
        assert_eq!(context_window_for_model("anthropic/claude-3-5-sonnet"), 200_000);
    }

    #[test]
    fn context_window_falls_back_for_unknown_family() {
        assert_eq!(context_window_for_model("some-new-model"), 128_000);
    }

    #[test]
    fn strip_known_prefix_removes_failover_prefixes() {
        assert_eq!(strip_known_prefix("openrouter/claude-3-5-sonnet"), "claude-3-5-sonnet");
        assert_eq!(strip_known_prefix("claude-3-5-sonnet"), "claude-3-5-sonnet");
    }

    use crate::billing::BillingService;
    use crate::config::{BillingConfig, Config};
    use crate::llm::{CompletionRequest, Provider, ProviderStream};
    use crate::processor::{ChunkSink, ChunkType, StreamChunk};
    use crate::tools::ToolRegistry;
    use std::sync::Mutex;

    struct UncallableProvider;

    #[async_trait::async_trait]
    impl Provider for UncallableProvider {
        fn name(&self) -> &str {
            "uncallable"
        }
        fn owns_model(&self, _model: &str) -> bool {
            true
        }
        async fn complete(&self, _request: CompletionRequest) -> crate::llm::Result<ProviderStream> {
            panic!("provider should never be called when credit reservation is denied");
        }
    }

    struct CollectingSink {
        chunks: Mutex<Vec<(Uuid, StreamChunk)>>,
    }

    impl ChunkSink for CollectingSink {
        fn publish(&self, agent_run_id: Uuid, chunk: StreamChunk) {
            self.chunks.lock().unwrap().push((agent_run_id, chunk));
        }
    }

    async fn test_pool() -> Pool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        crate::db::open(&path).await.unwrap()
    }

    /// Seed scenario 4: credit denial emits exactly one stopped chunk and
    /// leaves the run `stopped`, with the provider never invoked.
    #[tokio::test]
    async fn credit_denial_emits_stopped_chunk_and_no_provider_call() {
        let pool = test_pool().await;
        let account_id = Uuid::new_v4();
        let thread = crate::db::create_thread(&pool, account_id, None).await.unwrap();
        let agent_run = crate::db::create_running_agent_run(&pool, thread.thread_id, "claude-sonnet-4-6".into())
            .await
            .unwrap();

        let billing = Arc::new(BillingService::new(pool.clone(), &BillingConfig { dev_mode: false, pricing_path: None }));
        let runner = ThreadRunner::new(
            pool.clone(),
            Arc::new(Config::default()),
            Arc::new(UncallableProvider),
            Arc::new(ToolRegistry::new()),
            billing,
        );

        let sink = Arc::new(CollectingSink { chunks: Mutex::new(Vec::new()) });
        runner
            .run_thread(thread.thread_id, agent_run.id, "claude-sonnet-4-6".into(), sink.clone())
            .await
            .unwrap();

        let recorded = sink.chunks.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1.kind, ChunkType::Status);
        assert_eq!(
            recorded[0].1.content,
            serde_json::json!({"status": "stopped", "message": "Insufficient credits: insufficient"})
        );

        let status = crate::db::get_agent_run_status(&pool, agent_run.id).await.unwrap();
        assert_eq!(status, Some(AgentRunStatus::Stopped));
    }
}
