//! Message Store (spec §4.2).
//!
//! Thin rehydration layer over [`crate::db::repository`]: the repository
//! persists rows verbatim, this module applies the compressed-content
//! substitution rule LLM consumers must see.

use deadpool_sqlite::Pool;
use uuid::Uuid;

use crate::db::{self, Content, Message, MessageMetadata, MessageType};
use crate::error::CoreResult;

pub struct MessageStore<'a> {
    pool: &'a Pool,
}

impl<'a> MessageStore<'a> {
    pub fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, msg: Message) -> CoreResult<Uuid> {
        db::append_message(self.pool, msg).await
    }

    pub async fn update_message(
        &self,
        message_id: Uuid,
        content: Option<Content>,
        metadata: Option<MessageMetadata>,
    ) -> CoreResult<()> {
        db::update_message(self.pool, message_id, content, metadata).await
    }

    pub async fn latest_of_type(&self, thread_id: Uuid, kind: MessageType) -> CoreResult<Option<Message>> {
        db::latest_of_type(self.pool, thread_id, kind).await
    }

    /// `list_llm_messages`: fetches the rows whose `is_llm_message` flag is
    /// set (internally batched by the repository) and rehydrates compressed
    /// rows for LLM consumption. Bookkeeping rows (`status`,
    /// `llm_response_end`) never reach the provider through this path.
    pub async fn list_llm_messages(&self, thread_id: Uuid) -> CoreResult<Vec<Message>> {
        let rows = db::list_llm_messages(self.pool, thread_id).await?;
        Ok(rows.into_iter().map(rehydrate).collect())
    }
}

/// Rehydration rule (spec §4.2): when `metadata.compressed` and
/// `compressed_content` are set, the LLM view's `content` becomes the
/// compressed summary; the full content is left untouched in the returned
/// struct's `metadata.extra` is not mutated — callers needing the original
/// must go to the store directly, this is the LLM-facing view only.
fn rehydrate(mut msg: Message) -> Message {
    if msg.metadata.compressed {
        if let Some(summary) = msg.metadata.compressed_content.clone() {
            msg.content = parse_compressed(&summary);
        }
    }
    msg
}

/// If stored content is a JSON string, parse it; if parsing fails and the
/// message is marked compressed, wrap as `{role: 'user', content: <string>}`
/// since compressed summaries are plain strings by design (spec §4.2).
fn parse_compressed(summary: &str) -> Content {
    match serde_json::from_str::<serde_json::Value>(summary) {
        Ok(v) => Content::Object(v),
        Err(_) => Content::Text(summary.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compressed_falls_back_to_text() {
        let c = parse_compressed("plain text summary");
        assert_eq!(c.as_text(), Some("plain text summary"));
    }

    #[test]
    fn parse_compressed_accepts_json_object() {
        let c = parse_compressed(r#"{"a": 1}"#);
        assert!(matches!(c, Content::Object(_)));
    }
}
