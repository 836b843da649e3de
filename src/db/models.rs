//! Persisted data model (spec §3).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/db/mod.rs` re-exports
//! `models::*`/`repository::*` from a sibling file this crate's retrieval
//! pack does not include the body of; the shapes below are original to this
//! domain but follow the same "plain serde struct + `FromSql`-friendly
//! primitive fields" convention the teacher's `rusqlite` stack implies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Design note §9: content is sometimes a bare string, sometimes a JSON
/// object; represented as a tagged variant rather than `serde_json::Value`
/// everywhere so callers pattern-match instead of re-checking `is_string`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Object(Value),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Object(_) => None,
        }
    }

    pub fn len_hint(&self) -> usize {
        match self {
            Content::Text(s) => s.len(),
            Content::Object(v) => v.to_string().len(),
        }
    }
}

impl std::fmt::Display for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Text(s) => f.write_str(s),
            Content::Object(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: Uuid,
    pub account_id: Uuid,
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: ThreadMetadata,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThreadMetadata {
    #[serde(default)]
    pub cache_needs_rebuild: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    Tool,
    Status,
    LlmResponseEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub is_llm_message: bool,
    pub content: Content,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub agent_id: Option<Uuid>,
    pub agent_version_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageMetadata {
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub compressed_content: Option<String>,
    #[serde(default)]
    pub assistant_message_id: Option<Uuid>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    pub model: String,
    #[serde(default)]
    pub estimated: bool,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Stopped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub status: AgentRunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub model_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Schedule,
    Webhook,
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: Uuid,
    pub agent_id: Uuid,
    pub provider_id: String,
    pub trigger_type: TriggerType,
    pub name: String,
    pub is_active: bool,
    pub config: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// DB-side persisted record of a scheduled trigger's cron registration
/// (spec §4.8/§6). `name` is always `trigger_<trigger_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub name: String,
    pub trigger_id: Uuid,
    pub schedule: String,
    pub url: String,
    pub headers: Value,
    pub body: Value,
    pub timeout_secs: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: Uuid,
    pub balance: rust_decimal::Decimal,
    pub tier: String,
    pub billing_cycle_anchor: chrono::DateTime<chrono::Utc>,
    pub next_credit_grant: chrono::DateTime<chrono::Utc>,
    pub last_grant_date: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_untagged_round_trips_string_and_object() {
        let text = Content::Text("hello".into());
        let json = serde_json::to_string(&text).unwrap();
        assert_eq!(json, "\"hello\"");
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(back, text);

        let obj = Content::Object(serde_json::json!({"role": "user"}));
        let json = serde_json::to_string(&obj).unwrap();
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obj);
    }
}
