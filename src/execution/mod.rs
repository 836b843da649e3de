//! Execution Service (spec §4.9).
//!
//! Grounded: `original_source/backend/core/triggers/execution_service.py`'s
//! `ExecutionService`/`SessionManager` for the pipeline shape (verify ->
//! match -> materialise a thread -> reserve credits -> register a run ->
//! enqueue, always answering 200) and
//! `original_source/backend/core/composio_integration/api.py`'s webhook
//! route for the verify-then-parse surface; sandbox/project materialisation
//! themselves are external-collaborator concerns (spec §1) so this only
//! creates the thread + seed message + `agent_runs` row that the Background
//! Runner needs.

pub mod server;
pub mod verify;

use std::sync::Arc;

use deadpool_sqlite::Pool;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::background::{EnqueuedRun, RunQueue};
use crate::billing::BillingService;
use crate::config::Config;
use crate::db::{Content, Message, MessageMetadata, MessageType};
use crate::error::CoreResult;
use crate::triggers::TriggerService;

pub struct ExecutionService {
    pool: Pool,
    config: Arc<Config>,
    triggers: Arc<TriggerService>,
    billing: Arc<BillingService>,
    queue: RunQueue,
}

/// Always returned with HTTP 200 (spec §4.9 "always-200 response"); a
/// matched-but-unexecutable trigger is not a server error.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub matched_triggers: u32,
    pub executed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
}

impl ExecutionService {
    pub fn new(pool: Pool, config: Arc<Config>, triggers: Arc<TriggerService>, billing: Arc<BillingService>, queue: RunQueue) -> Self {
        Self { pool, config, triggers, billing, queue }
    }

    fn default_model(&self) -> String {
        self.config
            .providers
            .anthropic
            .as_ref()
            .and_then(|p| p.default_model.clone())
            .or_else(|| self.config.providers.openai_compatible.as_ref().and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| "claude-sonnet-4-6".to_string())
    }

    /// Runs the full ingress pipeline for one matched trigger: parses the
    /// event, materialises a thread and seed message, reserves credits,
    /// registers an `agent_runs` row, and enqueues the run. `webhook_id` is
    /// the transport-level `webhook-id` header of the inbound delivery, used
    /// only for `{{webhook_id}}` seed-message substitution.
    pub async fn execute_trigger(&self, trigger_id: Uuid, raw_body: &[u8], webhook_id: Option<&str>) -> CoreResult<ExecutionOutcome> {
        let Some(trigger) = self.triggers.get(trigger_id).await? else {
            return Ok(ExecutionOutcome {
                success: true,
                matched_triggers: 0,
                executed: 0,
                ..Default::default()
            });
        };

        let result = self.triggers.process_event(trigger_id, raw_body).await?;
        if !result.should_execute {
            return Ok(ExecutionOutcome {
                success: true,
                matched_triggers: 1,
                executed: 0,
                error: result.error_message,
                ..Default::default()
            });
        }

        let Some(prompt) = result.agent_prompt else {
            tracing::info!(trigger_id = %trigger_id, "matched trigger has no agent prompt (workflow execution is not supported); skipping");
            return Ok(ExecutionOutcome {
                success: true,
                matched_triggers: 1,
                executed: 0,
                error: Some("workflow execution is not supported".into()),
                ..Default::default()
            });
        };

        let owner_id = trigger.agent_id;
        let (can_run, _reservation_id) = self.billing.check_and_reserve_credits(owner_id).await?;
        if !can_run {
            return Ok(ExecutionOutcome {
                success: true,
                matched_triggers: 1,
                executed: 0,
                error: Some("insufficient credits".into()),
                ..Default::default()
            });
        }

        let payload: Value = serde_json::from_slice(raw_body).unwrap_or(Value::Null);
        let trigger_slug = result.execution_variables.get("trigger_slug").and_then(|v| v.as_str());
        let rendered_prompt = render_seed_message(&prompt, &payload, trigger_slug, webhook_id);

        let thread = crate::db::create_thread(&self.pool, owner_id, None).await?;
        let seed_message = Message {
            message_id: Uuid::new_v4(),
            thread_id: thread.thread_id,
            created_at: chrono::Utc::now(),
            kind: MessageType::User,
            is_llm_message: true,
            content: Content::Text(rendered_prompt),
            metadata: MessageMetadata::default(),
            agent_id: Some(trigger.agent_id),
            agent_version_id: None,
        };
        crate::db::append_message(&self.pool, seed_message).await?;

        let model_name = self.default_model();
        let agent_run = crate::db::create_running_agent_run(&self.pool, thread.thread_id, model_name.clone()).await?;

        self.queue
            .send(EnqueuedRun {
                agent_run_id: agent_run.id,
                thread_id: thread.thread_id,
                model_name,
            })
            .map_err(|_| crate::error::CoreError::Config("background run queue is closed".into()))?;

        Ok(ExecutionOutcome {
            success: true,
            matched_triggers: 1,
            executed: 1,
            error: None,
            thread_id: Some(thread.thread_id),
        })
    }
}

/// Renders the seed message content (spec §4.9 step 4): substitutes
/// `{{payload}}`/`{{trigger_slug}}`/`{{webhook_id}}` wherever the adapter's
/// prompt literally contains them, then always appends a fenced `Context`
/// JSON block carrying the same three values, regardless of whether any
/// placeholder was present.
fn render_seed_message(prompt: &str, payload: &Value, trigger_slug: Option<&str>, webhook_id: Option<&str>) -> String {
    let mut rendered = prompt.to_string();
    if rendered.contains("{{payload}}") {
        let payload_json = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
        rendered = rendered.replace("{{payload}}", &payload_json);
    }
    if rendered.contains("{{trigger_slug}}") {
        rendered = rendered.replace("{{trigger_slug}}", trigger_slug.unwrap_or(""));
    }
    if rendered.contains("{{webhook_id}}") {
        rendered = rendered.replace("{{webhook_id}}", webhook_id.unwrap_or(""));
    }

    let context = serde_json::json!({
        "payload": payload,
        "trigger_slug": trigger_slug,
        "webhook_id": webhook_id,
    });
    let context_json = serde_json::to_string_pretty(&context).unwrap_or_else(|_| context.to_string());
    format!("{rendered}\n\nContext\n```json\n{context_json}\n```")
}

#[cfg(test)]
mod render_tests {
    use super::*;

    #[test]
    fn substitutes_only_placeholders_present_and_always_appends_context() {
        let payload = serde_json::json!({"k": "v"});
        let rendered = render_seed_message("saw {{trigger_slug}} with id {{webhook_id}}", &payload, Some("gmail_new_message"), Some("msg_123"));
        assert!(rendered.contains("saw gmail_new_message with id msg_123"));
        assert!(rendered.contains("```json"));
        assert!(rendered.contains("\"trigger_slug\": \"gmail_new_message\""));
        assert!(rendered.contains("\"webhook_id\": \"msg_123\""));
    }

    #[test]
    fn leaves_prompt_untouched_when_no_placeholders_but_still_appends_context() {
        let payload = serde_json::json!({"hello": "world"});
        let rendered = render_seed_message("Process webhook data: {}", &payload, None, None);
        assert!(rendered.starts_with("Process webhook data: {}"));
        assert!(rendered.contains("Context\n```json"));
        assert!(rendered.contains("\"payload\": {\n    \"hello\": \"world\"\n  }"));
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::config::BillingConfig;

    async fn test_pool() -> Pool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        crate::db::open(&path).await.unwrap()
    }

    /// End-to-end on the event-adapter path: a templated `agent_prompt`
    /// referencing `{{trigger_slug}}`/`{{webhook_id}}` must come out of the
    /// persisted seed message with both substituted and a Context block
    /// appended (spec §4.9 step 4).
    #[tokio::test]
    async fn seed_message_substitutes_trigger_slug_and_webhook_id() {
        let pool = test_pool().await;
        let triggers = Arc::new(TriggerService::new(pool.clone(), "http://localhost:8787".into(), None));
        let agent_id = Uuid::new_v4();
        let trigger = triggers
            .create(
                agent_id,
                "composio",
                "gmail-watch".into(),
                serde_json::json!({
                    "composio_trigger_id": "ct_1",
                    "execution_type": "agent",
                    "agent_prompt": "event {{trigger_slug}} delivered as {{webhook_id}}: {{payload}}",
                }),
            )
            .await
            .unwrap();

        let billing = Arc::new(BillingService::new(pool.clone(), &BillingConfig { dev_mode: true, pricing_path: None }));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let service = ExecutionService::new(pool.clone(), Arc::new(Config::default()), triggers, billing, tx);

        let raw = br#"{"triggerSlug":"GMAIL_NEW_MESSAGE","eventId":"evt_1"}"#;
        let outcome = service.execute_trigger(trigger.trigger_id, raw, Some("wh_123")).await.unwrap();
        assert_eq!(outcome.executed, 1);

        let thread_id = outcome.thread_id.expect("a thread is created on the executed path");
        let messages = crate::messages::MessageStore::new(&pool).list_llm_messages(thread_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        let rendered = messages[0].content.as_text().unwrap();
        assert!(rendered.contains("event GMAIL_NEW_MESSAGE delivered as wh_123"));
        assert!(rendered.contains("```json"));
        assert!(rendered.contains("\"trigger_slug\": \"GMAIL_NEW_MESSAGE\""));
        assert!(rendered.contains("\"webhook_id\": \"wh_123\""));
    }
}
