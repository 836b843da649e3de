//! Token Counter (spec §4.1).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/agent/service/
//! tool_loop.rs` estimates tokens with `tiktoken-rs` whenever a provider
//! doesn't report real usage ("tiktoken-estimate fallback when provider
//! reports 0 input tokens") and tracks API-vs-estimate drift; this module
//! generalises that into the standalone counter the rest of the core calls.

use once_cell::sync::Lazy;
use serde_json::Value;
use tiktoken_rs::CoreBPE;

use crate::cache::CacheTransform;
use crate::db::{Content, Message};

/// Rough byte-per-token ratio used only if even the generic tokenizer
/// fails to load (never expected in practice, but counts must never be a
/// hard error per spec §4.1 "counts are advisory").
const FALLBACK_CHARS_PER_TOKEN: usize = 4;

static GENERIC_BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| tiktoken_rs::cl100k_base().ok());

/// A first-party tokenizer for a model family. Anthropic doesn't publish a
/// local equivalent of OpenAI's BPE files, so "first-party" here means
/// "count via the family's own message-shape conventions" (role/content
/// framing, not just concatenated text) rather than an exact vendored
/// vocabulary — still advisory per the contract.
pub trait FirstPartyTokenizer: Send + Sync {
    fn family_prefix(&self) -> &str;
    fn count(&self, system: Option<&str>, messages: &[(String, String)]) -> Option<usize>;
}

pub struct AnthropicTokenizer;

impl FirstPartyTokenizer for AnthropicTokenizer {
    fn family_prefix(&self) -> &str {
        "anthropic/"
    }

    fn count(&self, system: Option<&str>, messages: &[(String, String)]) -> Option<usize> {
        // No official offline Anthropic tokenizer is vendored; approximate
        // using the generic BPE over the same {role, content} framing the
        // provider would see, which keeps relative budget comparisons sound
        // even though the absolute count is approximate.
        let bpe = GENERIC_BPE.as_ref()?;
        let mut total = 0usize;
        if let Some(s) = system {
            total += bpe.encode_ordinary(s).len();
        }
        for (role, content) in messages {
            total += bpe.encode_ordinary(role).len() + bpe.encode_ordinary(content).len() + 4;
        }
        Some(total)
    }
}

pub struct TokenCounter {
    first_party: Vec<Box<dyn FirstPartyTokenizer>>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self {
            first_party: vec![Box::new(AnthropicTokenizer)],
        }
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count(model, messages, system, apply_caching)` per spec §4.1.
    pub fn count(&self, model: &str, messages: &[Message], system: Option<&str>, apply_caching: bool) -> usize {
        let transformed: Vec<Message>;
        let messages = if apply_caching && is_anthropic_family(model) {
            transformed = CacheTransform::default().apply(messages);
            &transformed
        } else {
            messages
        };

        let flattened: Vec<(String, String)> = messages
            .iter()
            .map(|m| (role_of(m), content_text(&m.content)))
            .collect();

        if let Some(prefix) = self.first_party.iter().find(|t| model.starts_with(t.family_prefix())) {
            if let Some(n) = prefix.count(system, &flattened) {
                return n;
            }
            tracing::warn!(model, "first-party tokenizer failed, falling back to generic counter");
        }

        self.generic_count(system, &flattened)
    }

    fn generic_count(&self, system: Option<&str>, messages: &[(String, String)]) -> usize {
        match GENERIC_BPE.as_ref() {
            Some(bpe) => {
                let mut total = 0usize;
                if let Some(s) = system {
                    total += bpe.encode_ordinary(s).len();
                }
                for (role, content) in messages {
                    total += bpe.encode_ordinary(role).len() + bpe.encode_ordinary(content).len() + 4;
                }
                total
            }
            None => {
                let mut chars = system.map(|s| s.len()).unwrap_or(0);
                for (role, content) in messages {
                    chars += role.len() + content.len();
                }
                chars.div_ceil(FALLBACK_CHARS_PER_TOKEN)
            }
        }
    }

    /// Cheap single-string estimate, used where the caller only has text
    /// (e.g. sizing a truncation sentinel) rather than a full message list.
    pub fn estimate_text(&self, text: &str) -> usize {
        match GENERIC_BPE.as_ref() {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => text.len().div_ceil(FALLBACK_CHARS_PER_TOKEN),
        }
    }
}

pub fn is_anthropic_family(model: &str) -> bool {
    model.starts_with("anthropic/") || model.starts_with("claude-")
}

fn role_of(m: &Message) -> String {
    match m.kind {
        crate::db::MessageType::User => "user",
        crate::db::MessageType::Assistant => "assistant",
        crate::db::MessageType::Tool => "tool",
        _ => "system",
    }
    .to_string()
}

fn content_text(content: &Content) -> String {
    match content {
        Content::Text(s) => s.clone(),
        Content::Object(v) => flatten_value(v),
    }
}

fn flatten_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Content, MessageMetadata, MessageType};
    use uuid::Uuid;

    fn msg(text: &str) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            kind: MessageType::User,
            is_llm_message: true,
            content: Content::Text(text.to_string()),
            metadata: MessageMetadata::default(),
            agent_id: None,
            agent_version_id: None,
        }
    }

    #[test]
    fn counting_is_monotonic_in_message_count() {
        let counter = TokenCounter::new();
        let one = counter.count("claude-sonnet-4", &[msg("hello there")], None, false);
        let two = counter.count("claude-sonnet-4", &[msg("hello there"), msg("hello there")], None, false);
        assert!(two > one);
    }

    #[test]
    fn empty_messages_count_to_zero_or_near_zero() {
        let counter = TokenCounter::new();
        let n = counter.count("claude-sonnet-4", &[], None, false);
        assert_eq!(n, 0);
    }

    #[test]
    fn anthropic_family_detection() {
        assert!(is_anthropic_family("anthropic/claude-sonnet-4"));
        assert!(is_anthropic_family("claude-opus-4"));
        assert!(!is_anthropic_family("gpt-4o"));
    }
}
