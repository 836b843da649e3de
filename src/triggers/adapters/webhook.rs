//! Webhook adapter (spec §4.8). Grounded: `original_source/backend/core/
//! triggers/provider_service.py`'s `WebhookProvider` — stateless setup and
//! teardown, `process_event` wraps the raw body into an agent prompt.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::db::Trigger;
use crate::error::CoreResult;

use super::{ProviderAdapter, TriggerResult};

#[derive(Default)]
pub struct WebhookAdapter;

#[async_trait]
impl ProviderAdapter for WebhookAdapter {
    fn provider_id(&self) -> &'static str {
        "webhook"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "webhook_secret": {"type": "string", "description": "Secret for webhook validation"}
            },
            "required": []
        })
    }

    fn validate_config(&self, _config: &Value) -> CoreResult<()> {
        Ok(())
    }

    async fn setup_trigger(&self, _trigger: &Trigger) -> CoreResult<bool> {
        Ok(true)
    }

    async fn teardown_trigger(&self, _trigger: &Trigger) -> CoreResult<()> {
        Ok(())
    }

    async fn process_event(&self, trigger: &Trigger, raw_data: &[u8]) -> CoreResult<TriggerResult> {
        let body_text = String::from_utf8_lossy(raw_data).into_owned();
        let execution_variables = json!({
            "webhook_data": body_text,
            "trigger_id": trigger.trigger_id,
            "agent_id": trigger.agent_id,
        });
        Ok(TriggerResult {
            should_execute: true,
            agent_prompt: Some(format!("Process webhook data: {body_text}")),
            execution_variables,
            error_message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn dummy_trigger() -> Trigger {
        Trigger {
            trigger_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            provider_id: "webhook".into(),
            trigger_type: crate::db::TriggerType::Webhook,
            name: "t".into(),
            is_active: true,
            config: Value::Null,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn process_event_always_executes_with_wrapped_prompt() {
        let adapter = WebhookAdapter;
        let result = adapter.process_event(&dummy_trigger(), br#"{"x":1}"#).await.unwrap();
        assert!(result.should_execute);
        assert!(result.agent_prompt.unwrap().contains("x"));
    }
}
