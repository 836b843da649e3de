//! Prompt-Cache Layer (spec §4.3).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/agent/service/
//! context.rs` computes a token budget the same pipeline this module feeds
//! into relies on; no teacher file implements cache breakpoints directly; the
//! provider-agnostic shape here (a `cache_control` marker field) follows the
//! Anthropic prompt-caching wire convention, which is the provider family the
//! teacher's stack treats as primary.

use crate::db::{Content, Message};

/// Maximum cache breakpoints a provider will honor (Anthropic's limit).
pub const MAX_CACHE_BREAKPOINTS: usize = 4;

/// How many of the oldest stable user turns (after the system prompt) are
/// also eligible for a cache breakpoint, besides the system prompt itself.
const STABLE_PREFIX_USER_TURNS: usize = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheTransform {
    /// When false, no breakpoints are inserted; used by the Token Counter
    /// for non-caching counts.
    pub enabled: bool,
}

impl CacheTransform {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    /// Applies cache-breakpoint markers to the prefix of `messages`,
    /// returning a transformed copy. The transform only ever *adds* a
    /// `cache_control` marker to `metadata.extra`; it never changes visible
    /// content, so token counts over the transformed list match what the
    /// provider bills without changing what the LLM reads.
    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        if !self.enabled {
            return messages.to_vec();
        }
        let mut out = messages.to_vec();
        let mut breakpoints_used = 0usize;
        let mut stable_user_turns_marked = 0usize;

        for msg in out.iter_mut() {
            if breakpoints_used >= MAX_CACHE_BREAKPOINTS {
                break;
            }
            let is_user = matches!(msg.kind, crate::db::MessageType::User);
            if is_user && stable_user_turns_marked < STABLE_PREFIX_USER_TURNS {
                msg.metadata
                    .extra
                    .insert("cache_control".into(), serde_json::json!({"type": "ephemeral"}));
                stable_user_turns_marked += 1;
                breakpoints_used += 1;
            }
        }
        out
    }
}

/// Recomputation trigger per spec §4.3: any message compressed this turn, an
/// explicit rebuild flag, or a model change.
pub fn needs_rebuild(compressed_this_turn: bool, cache_needs_rebuild_flag: bool, model_changed: bool) -> bool {
    compressed_this_turn || cache_needs_rebuild_flag || model_changed
}

/// `validate_cache_blocks`: caps the number of breakpoints present in a
/// message list at the provider-allowed maximum by stripping the excess
/// (oldest-marked-first is kept; later ones are dropped since they're less
/// likely to be a shared prefix anyway).
pub fn validate_cache_blocks(messages: &mut [Message]) {
    let mut seen = 0usize;
    for msg in messages.iter_mut() {
        let has_marker = msg.metadata.extra.contains_key("cache_control");
        if has_marker {
            seen += 1;
            if seen > MAX_CACHE_BREAKPOINTS {
                msg.metadata.extra.remove("cache_control");
            }
        }
    }
}

pub fn content_is_object(content: &Content) -> bool {
    matches!(content, Content::Object(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MessageMetadata, MessageType};
    use uuid::Uuid;

    fn msg(kind: MessageType) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            kind,
            is_llm_message: true,
            content: Content::Text("x".into()),
            metadata: MessageMetadata::default(),
            agent_id: None,
            agent_version_id: None,
        }
    }

    #[test]
    fn apply_never_exceeds_max_breakpoints() {
        let messages: Vec<Message> = (0..10).map(|_| msg(MessageType::User)).collect();
        let out = CacheTransform::enabled().apply(&messages);
        let marked = out.iter().filter(|m| m.metadata.extra.contains_key("cache_control")).count();
        assert!(marked <= MAX_CACHE_BREAKPOINTS);
    }

    #[test]
    fn disabled_transform_is_a_no_op() {
        let messages: Vec<Message> = (0..3).map(|_| msg(MessageType::User)).collect();
        let out = CacheTransform::default().apply(&messages);
        assert!(out.iter().all(|m| !m.metadata.extra.contains_key("cache_control")));
    }

    #[test]
    fn validate_strips_excess_breakpoints() {
        let mut messages: Vec<Message> = (0..6).map(|_| msg(MessageType::User)).collect();
        for m in messages.iter_mut() {
            m.metadata.extra.insert("cache_control".into(), serde_json::json!({"type": "ephemeral"}));
        }
        validate_cache_blocks(&mut messages);
        let marked = messages.iter().filter(|m| m.metadata.extra.contains_key("cache_control")).count();
        assert_eq!(marked, MAX_CACHE_BREAKPOINTS);
    }
}
