//! Tiered compression pipeline (spec §4.4).
//!
//! Grounded: `original_source/backend/core/agentpress/context_manager.py`
//! for the exact tier ordering, thresholds, and the middle-out/omission
//! fallback; `examples/adolfousier-opencrabs/src/brain/agent/service/
//! context.rs` and `tool_loop.rs` for the idiomatic Rust shape (tracing
//! calls, async DB writes, recompute-then-recheck loops).
//!
//! Compression is a pure function of its inputs: the same message list
//! produces the same truncation bytes every time, which is what lets the
//! Prompt-Cache Layer treat the compressed prefix as stable across turns.

use deadpool_sqlite::Pool;
use uuid::Uuid;

use crate::db::{Content, Message, MessageMetadata, MessageType};
use crate::error::CoreResult;
use crate::tokens::TokenCounter;

use super::budget::{budget, target};
use super::sentinel::{safe_truncate_middle, tool_output_removed, truncated_with_reference};

const SECONDARY_THRESHOLD_TOKENS: usize = 500;
const OMISSION_BATCH: usize = 10;
const LONG_CONTENT_CHARS: usize = 3000;
const LONG_TRUNCATION_CHARS: usize = 1500;
const SHORT_TRUNCATION_CHARS: usize = 500;

pub struct ContextManager<'a> {
    pool: &'a Pool,
    tokens: &'a TokenCounter,
    cfg: &'a crate::config::ContextConfig,
}

/// Outcome of a compression pass: the (possibly unchanged) message list the
/// caller should send to the LLM, and whether any DB row was mutated (which
/// drives the `cache_needs_rebuild` flag, spec §4.4 step 10).
pub struct CompressionOutcome {
    pub messages: Vec<Message>,
    pub db_write_occurred: bool,
}

impl<'a> ContextManager<'a> {
    pub fn new(pool: &'a Pool, tokens: &'a TokenCounter, cfg: &'a crate::config::ContextConfig) -> Self {
        Self { pool, tokens, cfg }
    }

    pub async fn compress(
        &self,
        messages: Vec<Message>,
        model: &str,
        context_window: usize,
        actual_total_tokens: Option<usize>,
        system_prompt: Option<&str>,
    ) -> CoreResult<CompressionOutcome> {
        if messages.is_empty() {
            return Ok(CompressionOutcome {
                messages,
                db_write_occurred: false,
            });
        }

        let budget = budget(context_window);
        let target = target(budget);

        // Step 1: strip tool_execution.arguments noise (in-memory only).
        let mut working: Vec<Message> = messages.into_iter().map(strip_tool_execution_arguments).collect();

        // Step 2: measure.
        let mut tokens = match actual_total_tokens {
            Some(n) => n,
            None => self.tokens.count(model, &working, system_prompt, true),
        };

        let mut db_write_occurred = false;

        // Step 3: fast path.
        if tokens <= budget {
            let working = middle_out_cap(working, self.cfg.max_messages);
            return Ok(CompressionOutcome {
                messages: working,
                db_write_occurred,
            });
        }

        // Step 4: Tier 1 — old tool outputs.
        if tokens > budget {
            let wrote = self
                .compress_tool_outputs(&mut working, self.cfg.keep_tool_results)
                .await?;
            db_write_occurred |= wrote;
            tokens = self.tokens.count(model, &working, system_prompt, true);
        }

        // Step 5: Tier 2 — old user messages.
        if tokens > target {
            let wrote = self
                .compress_text_messages(&mut working, MessageType::User, self.cfg.keep_user_messages)
                .await?;
            db_write_occurred |= wrote;
            tokens = self.tokens.count(model, &working, system_prompt, true);
        }

        // Step 6: Tier 3 — old assistant messages.
        if tokens > target {
            let wrote = self
                .compress_text_messages(&mut working, MessageType::Assistant, self.cfg.keep_assistant_messages)
                .await?;
            db_write_occurred |= wrote;
            tokens = self.tokens.count(model, &working, system_prompt, true);
        }

        // Step 8 (independent of budget): middle-out cap, applied before
        // secondary compression/omission so those steps operate on an
        // already length-capped list.
        working = middle_out_cap(working, self.cfg.max_messages);
        tokens = self.tokens.count(model, &working, system_prompt, true);

        // Step 7 & 9: secondary compression, recursion, and message omission.
        let mut threshold = SECONDARY_THRESHOLD_TOKENS;
        let mut iterations_left = self.cfg.max_iterations;
        while tokens > target && iterations_left > 0 {
            self.secondary_compress(&mut working, threshold, budget);
            tokens = self.tokens.count(model, &working, system_prompt, true);
            threshold /= 2;
            iterations_left -= 1;
        }

        if tokens > budget {
            working = self.omit_messages(working, model, system_prompt, budget);
        }

        Ok(CompressionOutcome {
            messages: working,
            db_write_occurred,
        })
    }

    async fn compress_tool_outputs(&self, messages: &mut [Message], keep: usize) -> CoreResult<bool> {
        let tool_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == MessageType::Tool && !m.metadata.compressed)
            .map(|(i, _)| i)
            .collect();
        if tool_indices.len() <= keep {
            return Ok(false);
        }
        let compress_count = tool_indices.len() - keep;
        let mut wrote = false;
        for &idx in &tool_indices[..compress_count] {
            let msg = &mut messages[idx];
            let sentinel = tool_output_removed(msg.message_id);
            msg.metadata.compressed = true;
            msg.metadata.compressed_content = Some(sentinel.clone());
            msg.content = Content::Text(sentinel);
            crate::db::update_message(self.pool, messages_id(messages, idx), None, Some(messages_metadata(messages, idx)))
                .await?;
            wrote = true;
        }
        Ok(wrote)
    }

    async fn compress_text_messages(&self, messages: &mut [Message], kind: MessageType, keep: usize) -> CoreResult<bool> {
        let indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == kind && !m.metadata.compressed && m.content.as_text().is_some())
            .map(|(i, _)| i)
            .collect();
        if indices.len() <= keep {
            return Ok(false);
        }
        let compress_count = indices.len() - keep;
        let mut wrote = false;
        for &idx in &indices[..compress_count] {
            let msg = &mut messages[idx];
            let Some(text) = msg.content.as_text() else { continue };
            let limit = if text.len() > LONG_CONTENT_CHARS {
                LONG_TRUNCATION_CHARS
            } else {
                SHORT_TRUNCATION_CHARS
            };
            let truncated: String = text.chars().take(limit).collect();
            let sentinel = truncated_with_reference(msg.message_id, &truncated);
            msg.metadata.compressed = true;
            msg.metadata.compressed_content = Some(sentinel.clone());
            msg.content = Content::Text(sentinel);
            crate::db::update_message(self.pool, messages_id(messages, idx), None, Some(messages_metadata(messages, idx)))
                .await?;
            wrote = true;
        }
        Ok(wrote)
    }

    /// Step 7: deterministic per-message compression against `target` using
    /// a shrinking per-message token threshold. Messages past the tier
    /// keep-windows that still individually exceed `threshold` are truncated
    /// hard; messages within the keep-windows are safe-middle-truncated
    /// instead so recent context stays legible.
    fn secondary_compress(&self, messages: &mut [Message], threshold: usize, budget: usize) {
        let len = messages.len();
        let recent_cutoff = len.saturating_sub(self.cfg.keep_tool_results.max(self.cfg.keep_user_messages));
        for (idx, msg) in messages.iter_mut().enumerate() {
            if !matches!(msg.kind, MessageType::Tool | MessageType::User | MessageType::Assistant) {
                continue;
            }
            let Content::Text(text) = &msg.content else { continue };
            if self.tokens.estimate_text(text) <= threshold {
                continue;
            }
            let is_old = idx < recent_cutoff;
            let new_text = if is_old {
                let limit = threshold * 3;
                text.chars().take(limit).collect::<String>()
            } else {
                safe_truncate_middle(text, budget * 2)
            };
            msg.content = Content::Text(new_text);
        }
    }

    /// Step 9 fallback: iteratively remove a batch of messages from the
    /// middle (or the front when the list is short) until the list fits or
    /// fewer than `min_keep` remain.
    fn omit_messages(&self, mut messages: Vec<Message>, model: &str, system_prompt: Option<&str>, budget: usize) -> Vec<Message> {
        loop {
            let tokens = self.tokens.count(model, &messages, system_prompt, true);
            if tokens <= budget || messages.len() <= self.cfg.min_keep {
                break;
            }
            let remove = OMISSION_BATCH.min(messages.len().saturating_sub(self.cfg.min_keep));
            if remove == 0 {
                break;
            }
            if messages.len() > remove * 4 {
                let mid = messages.len() / 2;
                let start = mid.saturating_sub(remove / 2);
                messages.drain(start..start + remove);
            } else {
                messages.drain(0..remove);
            }
        }
        messages
    }
}

fn messages_id(messages: &[Message], idx: usize) -> Uuid {
    messages[idx].message_id
}

fn messages_metadata(messages: &[Message], idx: usize) -> MessageMetadata {
    messages[idx].metadata.clone()
}

fn strip_tool_execution_arguments(mut msg: Message) -> Message {
    if let Content::Object(v) = &mut msg.content {
        if let Some(exec) = v.get_mut("tool_execution").and_then(|e| e.as_object_mut()) {
            exec.remove("arguments");
        }
    }
    msg
}

/// Middle-out cap (spec §4.4 step 8): independent of token budget, bound the
/// list length by keeping the first and last halves of the allowed maximum.
fn middle_out_cap(messages: Vec<Message>, max_messages: usize) -> Vec<Message> {
    if messages.len() <= max_messages {
        return messages;
    }
    let half = max_messages / 2;
    let mut out: Vec<Message> = messages[..half].to_vec();
    out.extend_from_slice(&messages[messages.len() - half..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::db::{MessageMetadata, MessageType};
    use crate::tokens::TokenCounter;
    use uuid::Uuid;

    fn msg(kind: MessageType, text: &str) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            kind,
            is_llm_message: true,
            content: Content::Text(text.to_string()),
            metadata: MessageMetadata::default(),
            agent_id: None,
            agent_version_id: None,
        }
    }

    async fn pool() -> Pool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.db");
        std::mem::forget(dir);
        crate::db::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn empty_thread_is_unchanged() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);
        let out = cm.compress(vec![], "claude-sonnet", 200_000, None, None).await.unwrap();
        assert!(out.messages.is_empty());
        assert!(!out.db_write_occurred);
    }

    #[tokio::test]
    async fn fast_path_skips_compression_under_budget() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);
        let messages = vec![msg(MessageType::User, "hello")];
        let out = cm
            .compress(messages, "claude-sonnet", 200_000, Some(100), None)
            .await
            .unwrap();
        assert_eq!(out.messages.len(), 1);
        assert!(!out.db_write_occurred);
        assert!(!out.messages[0].metadata.compressed);
    }

    #[tokio::test]
    async fn five_tool_results_under_threshold_stay_uncompressed() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);

        // Actual tokens forced above budget so tier-1 runs even though the
        // tool-result count itself (5) sits at the keep threshold.
        let mut messages: Vec<Message> = (0..5).map(|i| msg(MessageType::Tool, &format!("result {i}"))).collect();
        for m in messages.iter_mut() {
            crate::db::append_message(&pool, m.clone()).await.unwrap();
        }
        let out = cm
            .compress(messages, "claude-sonnet", 200_000, Some(300_000), None)
            .await
            .unwrap();
        assert!(out.messages.iter().all(|m| !m.metadata.compressed));
    }

    #[tokio::test]
    async fn six_tool_results_compress_exactly_the_oldest() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);

        let mut messages: Vec<Message> = (0..6).map(|i| msg(MessageType::Tool, &format!("result {i}"))).collect();
        for m in messages.iter_mut() {
            crate::db::append_message(&pool, m.clone()).await.unwrap();
        }
        let out = cm
            .compress(messages, "claude-sonnet", 200_000, Some(300_000), None)
            .await
            .unwrap();
        let compressed_count = out.messages.iter().filter(|m| m.metadata.compressed).count();
        assert_eq!(compressed_count, 1);
        assert!(out.messages[0].metadata.compressed);
        assert!(!out.messages[5].metadata.compressed);
    }

    #[tokio::test]
    async fn tier_one_only_scenario_keeps_last_five_uncompressed() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);

        let big_text = "x ".repeat(4000);
        let mut messages: Vec<Message> = (0..20).map(|i| msg(MessageType::Tool, &format!("{big_text} #{i}"))).collect();
        for m in messages.iter_mut() {
            crate::db::append_message(&pool, m.clone()).await.unwrap();
        }
        let out = cm.compress(messages, "claude-sonnet", 72_000, None, None).await.unwrap();
        let compressed_count = out.messages.iter().filter(|m| m.metadata.compressed).count();
        assert_eq!(compressed_count, 15);
        for m in out.messages[15..].iter() {
            assert!(!m.metadata.compressed);
        }
        assert!(out.db_write_occurred);
    }

    #[tokio::test]
    async fn middle_out_cap_leaves_exactly_320() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);

        let messages: Vec<Message> = (0..321).map(|i| msg(MessageType::User, &format!("m{i}"))).collect();
        let out = cm
            .compress(messages, "claude-sonnet", 1_000_000_000, Some(10), None)
            .await
            .unwrap();
        assert_eq!(out.messages.len(), 320);
    }

    #[tokio::test]
    async fn single_oversized_message_is_safe_truncated_to_fit() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);

        let thread = crate::db::create_thread(&pool, Uuid::new_v4(), None).await.unwrap();
        let huge = "word ".repeat(200_000);
        let big_msg = Message {
            message_id: Uuid::new_v4(),
            thread_id: thread.thread_id,
            created_at: chrono::Utc::now(),
            kind: MessageType::User,
            is_llm_message: true,
            content: Content::Text(huge),
            metadata: MessageMetadata::default(),
            agent_id: None,
            agent_version_id: None,
        };
        crate::db::append_message(&pool, big_msg.clone()).await.unwrap();

        let out = cm
            .compress(vec![big_msg], "claude-sonnet", 50_000, None, None)
            .await
            .unwrap();
        assert_eq!(out.messages.len(), 1);
        let final_tokens = tokens.count("claude-sonnet", &out.messages, None, true);
        assert!(final_tokens <= budget(50_000));
    }

    #[tokio::test]
    async fn compression_is_idempotent_on_already_compressed_input() {
        let pool = pool().await;
        let tokens = TokenCounter::new();
        let cfg = ContextConfig::default();
        let cm = ContextManager::new(&pool, &tokens, &cfg);

        let big_text = "x ".repeat(4000);
        let mut messages: Vec<Message> = (0..20).map(|i| msg(MessageType::Tool, &format!("{big_text} #{i}"))).collect();
        for m in messages.iter_mut() {
            crate::db::append_message(&pool, m.clone()).await.unwrap();
        }
        let first = cm.compress(messages, "claude-sonnet", 72_000, None, None).await.unwrap();
        let second = cm
            .compress(first.messages.clone(), "claude-sonnet", 72_000, None, None)
            .await
            .unwrap();
        let first_texts: Vec<String> = first.messages.iter().map(|m| m.content.to_string()).collect();
        let second_texts: Vec<String> = second.messages.iter().map(|m| m.content.to_string()).collect();
        assert_eq!(first_texts, second_texts);
    }
}
