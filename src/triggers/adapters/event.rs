//! Event (third-party) adapter (spec §4.8).
//!
//! Grounded: `original_source/backend/core/triggers/provider_service.py`'s
//! `ComposioEventProvider` — reference-counted remote subscription
//! (`setup`/`teardown` are local no-ops unless this trigger is the
//! first/last active one sharing a `composio_trigger_id`) and
//! `process_event`'s remote-id/slug extraction with a templated or
//! default-800-char prompt.

use async_trait::async_trait;
use deadpool_sqlite::Pool;
use serde_json::{json, Value};

use crate::db::Trigger;
use crate::error::{CoreError, CoreResult};

use super::{ProviderAdapter, TriggerResult};

const DEFAULT_PROMPT_PAYLOAD_CHARS: usize = 800;

pub struct EventAdapter {
    pool: Pool,
}

impl EventAdapter {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn composio_id(config: &Value) -> Option<&str> {
        config.get("composio_trigger_id").and_then(|v| v.as_str())
    }

    fn render_prompt(trigger: &Trigger, payload: &Value) -> String {
        if let Some(template) = trigger.config.get("agent_prompt").and_then(|v| v.as_str()) {
            return template.replace("{{payload}}", &payload.to_string());
        }
        let body = payload.to_string();
        let truncated: String = body.chars().take(DEFAULT_PROMPT_PAYLOAD_CHARS).collect();
        format!("A subscribed event fired. Payload (truncated): {truncated}")
    }
}

#[async_trait]
impl ProviderAdapter for EventAdapter {
    fn provider_id(&self) -> &'static str {
        "composio"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "composio_trigger_id": {"type": "string"},
                "trigger_slug": {"type": "string"},
                "execution_type": {"type": "string", "enum": ["agent", "workflow"]},
                "agent_prompt": {"type": "string"},
                "workflow_id": {"type": "string"},
                "workflow_input": {"type": "object"}
            },
            "required": ["composio_trigger_id", "execution_type"]
        })
    }

    fn validate_config(&self, config: &Value) -> CoreResult<()> {
        if Self::composio_id(config).is_none() {
            return Err(CoreError::Config(
                "composio_trigger_id is required and must be a string".into(),
            ));
        }
        let execution_type = config.get("execution_type").and_then(|v| v.as_str()).unwrap_or("agent");
        if execution_type != "agent" && execution_type != "workflow" {
            return Err(CoreError::Config("execution_type must be either 'agent' or 'workflow'".into()));
        }
        if execution_type == "workflow" && config.get("workflow_id").and_then(|v| v.as_str()).is_none() {
            return Err(CoreError::Config("workflow_id is required for workflow execution".into()));
        }
        Ok(())
    }

    /// Only actually enables the upstream subscription when this is the
    /// first active local trigger referencing the same remote id.
    async fn setup_trigger(&self, trigger: &Trigger) -> CoreResult<bool> {
        let Some(composio_id) = Self::composio_id(&trigger.config) else {
            return Ok(true);
        };
        let other_active =
            crate::db::count_triggers_with_composio_id(&self.pool, composio_id.to_string(), true, Some(trigger.trigger_id))
                .await?;
        if other_active > 0 {
            tracing::debug!(composio_id, other_active, "skipping remote enable, other active triggers exist");
        } else {
            tracing::debug!(composio_id, "enabling remote subscription (first active trigger)");
        }
        Ok(true)
    }

    async fn teardown_trigger(&self, trigger: &Trigger) -> CoreResult<()> {
        let Some(composio_id) = Self::composio_id(&trigger.config) else {
            return Ok(());
        };
        let other_active =
            crate::db::count_triggers_with_composio_id(&self.pool, composio_id.to_string(), true, Some(trigger.trigger_id))
                .await?;
        if other_active > 0 {
            tracing::debug!(composio_id, other_active, "skipping remote disable, other active triggers exist");
        } else {
            tracing::debug!(composio_id, "disabling remote subscription (last active trigger)");
        }
        Ok(())
    }

    async fn delete_remote_trigger(&self, trigger: &Trigger) -> CoreResult<()> {
        let Some(composio_id) = Self::composio_id(&trigger.config) else {
            return Ok(());
        };
        let other = crate::db::count_triggers_with_composio_id(&self.pool, composio_id.to_string(), false, Some(trigger.trigger_id)).await?;
        if other == 0 {
            tracing::debug!(composio_id, "deleting remote trigger instance (last local reference)");
        }
        Ok(())
    }

    async fn process_event(&self, trigger: &Trigger, raw_data: &[u8]) -> CoreResult<TriggerResult> {
        let payload: Value = serde_json::from_slice(raw_data).unwrap_or(Value::Null);
        let trigger_slug = payload
            .get("triggerSlug")
            .and_then(|v| v.as_str())
            .or_else(|| trigger.config.get("trigger_slug").and_then(|v| v.as_str()));
        let provider_event_id = payload
            .get("eventId")
            .or_else(|| payload.get("id"))
            .and_then(|v| v.as_str());

        let execution_variables = json!({
            "provider": "composio",
            "trigger_slug": trigger_slug,
            "provider_event_id": provider_event_id,
        });

        let execution_type = trigger.config.get("execution_type").and_then(|v| v.as_str()).unwrap_or("agent");
        if execution_type == "workflow" {
            return Ok(TriggerResult {
                should_execute: trigger.config.get("workflow_id").and_then(|v| v.as_str()).is_some(),
                agent_prompt: None,
                execution_variables,
                error_message: None,
            });
        }

        Ok(TriggerResult {
            should_execute: true,
            agent_prompt: Some(Self::render_prompt(trigger, &payload)),
            execution_variables,
            error_message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_truncates_payload_to_800_chars() {
        let trigger = Trigger {
            trigger_id: uuid::Uuid::new_v4(),
            agent_id: uuid::Uuid::new_v4(),
            provider_id: "composio".into(),
            trigger_type: crate::db::TriggerType::Webhook,
            name: "t".into(),
            is_active: true,
            config: json!({"composio_trigger_id": "abc", "execution_type": "agent"}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let payload = json!({"data": "x".repeat(2000)});
        let prompt = EventAdapter::render_prompt(&trigger, &payload);
        assert!(prompt.len() < 2000);
    }

    #[test]
    fn templated_prompt_substitutes_payload() {
        let trigger = Trigger {
            trigger_id: uuid::Uuid::new_v4(),
            agent_id: uuid::Uuid::new_v4(),
            provider_id: "composio".into(),
            trigger_type: crate::db::TriggerType::Webhook,
            name: "t".into(),
            is_active: true,
            config: json!({"composio_trigger_id": "abc", "execution_type": "agent", "agent_prompt": "saw: {{payload}}"}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let payload = json!({"k": "v"});
        let prompt = EventAdapter::render_prompt(&trigger, &payload);
        assert!(prompt.starts_with("saw: "));
        assert!(prompt.contains("\"k\""));
    }
}
