//! Trigger Service (spec §4.7).
//!
//! Grounded: `original_source/backend/core/triggers/trigger_service.py`'s
//! `TriggerService` for the CRUD + state-machine shape (`create_trigger`
//! validates via the provider, then persists; `update_trigger` diffs
//! `previous_is_active` against the new value to decide which provider
//! transition to call).

pub mod adapters;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use deadpool_sqlite::Pool;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{Trigger, TriggerType};
use crate::error::{CoreError, CoreResult};

use adapters::{EventAdapter, ProviderAdapter, ScheduleAdapter, TriggerResult, WebhookAdapter};

pub struct TriggerService {
    pool: Pool,
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl TriggerService {
    pub fn new(pool: Pool, webhook_base_url: String, shared_secret: Option<crate::config::SecretString>) -> Self {
        let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
        let schedule = Arc::new(ScheduleAdapter::new(pool.clone(), webhook_base_url, shared_secret));
        let webhook = Arc::new(WebhookAdapter);
        let event = Arc::new(EventAdapter::new(pool.clone()));
        adapters.insert(schedule.provider_id(), schedule);
        adapters.insert(webhook.provider_id(), webhook);
        adapters.insert(event.provider_id(), event);
        Self { pool, adapters }
    }

    fn adapter(&self, provider_id: &str) -> CoreResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::Config(format!("unknown trigger provider: {provider_id}")))
    }

    fn trigger_type_for(provider_id: &str) -> TriggerType {
        match provider_id {
            "schedule" => TriggerType::Schedule,
            "webhook" => TriggerType::Webhook,
            _ => TriggerType::Event,
        }
    }

    /// `nonexistent -> active` (spec §4.7 state machine). `setup_trigger`
    /// runs before the row exists, matching the source's "validate, setup,
    /// then persist" ordering; a `false`/error result means no row is
    /// written.
    pub async fn create(&self, agent_id: Uuid, provider_id: &str, name: String, config: Value) -> CoreResult<Trigger> {
        let adapter = self.adapter(provider_id)?;
        adapter.validate_config(&config)?;

        let now = Utc::now();
        let trigger = Trigger {
            trigger_id: Uuid::new_v4(),
            agent_id,
            provider_id: provider_id.to_string(),
            trigger_type: Self::trigger_type_for(provider_id),
            name,
            is_active: true,
            config,
            created_at: now,
            updated_at: now,
        };

        let ok = adapter.setup_trigger(&trigger).await?;
        if !ok {
            return Err(CoreError::TriggerSetupFailed {
                provider: provider_id.to_string(),
                reason: "provider setup returned false".into(),
            });
        }
        crate::db::insert_trigger(&self.pool, trigger.clone()).await?;
        Ok(trigger)
    }

    pub async fn get(&self, trigger_id: Uuid) -> CoreResult<Option<Trigger>> {
        crate::db::get_trigger(&self.pool, trigger_id).await
    }

    pub async fn list_by_agent(&self, agent_id: Uuid) -> CoreResult<Vec<Trigger>> {
        crate::db::list_triggers_by_agent(&self.pool, agent_id).await
    }

    /// `active <-> inactive` and config updates (spec §4.7). Reconciles the
    /// provider only for the transition that actually changed:
    /// `false -> true` calls `setup`, `true -> false` calls `teardown`, and
    /// a config edit while active does `teardown` then `setup` (rolling
    /// back to the previous config on failure).
    ///
    /// The DB row is written **before** any teardown call (spec §5: trigger
    /// transitions hold no in-process lock, so a reference-counted provider
    /// like the event adapter must see the authoritative post-update state
    /// when it queries for other active triggers sharing the same remote
    /// id). A failed setup rolls the row back to the previous state.
    pub async fn update(
        &self,
        trigger_id: Uuid,
        config: Option<Value>,
        name: Option<String>,
        is_active: Option<bool>,
    ) -> CoreResult<Trigger> {
        let existing = crate::db::get_trigger(&self.pool, trigger_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trigger {trigger_id}")))?;
        let adapter = self.adapter(&existing.provider_id)?;

        if let Some(cfg) = &config {
            adapter.validate_config(cfg)?;
        }

        let previous_active = existing.is_active;
        let next_active = is_active.unwrap_or(previous_active);
        let config_changed = config.is_some();

        let mut reconciled = existing.clone();
        if let Some(cfg) = config.clone() {
            reconciled.config = cfg;
        }
        reconciled.is_active = next_active;
        if let Some(n) = &name {
            reconciled.name = n.clone();
        }

        crate::db::update_trigger(&self.pool, trigger_id, is_active, config.clone(), name).await?;

        let rollback = || async {
            crate::db::update_trigger(
                &self.pool,
                trigger_id,
                Some(previous_active),
                Some(existing.config.clone()),
                Some(existing.name.clone()),
            )
            .await
        };

        match (previous_active, next_active) {
            (false, true) => {
                let ok = adapter.setup_trigger(&reconciled).await?;
                if !ok {
                    rollback().await?;
                    return Err(CoreError::TriggerSetupFailed {
                        provider: existing.provider_id.clone(),
                        reason: "provider setup returned false".into(),
                    });
                }
            }
            (true, false) => {
                adapter.teardown_trigger(&reconciled).await?;
            }
            (true, true) if config_changed => {
                adapter.teardown_trigger(&existing).await?;
                let ok = adapter.setup_trigger(&reconciled).await?;
                if !ok {
                    rollback().await?;
                    return Err(CoreError::TriggerSetupFailed {
                        provider: existing.provider_id.clone(),
                        reason: "provider re-setup returned false after config change".into(),
                    });
                }
            }
            _ => {}
        }

        Ok(reconciled)
    }

    /// `active|inactive -> tombstone`. Removes the DB row first so the
    /// provider observes the authoritative (already-deleted) state, then
    /// tears down best-effort (spec §4.7: failures logged, not rethrown).
    pub async fn delete(&self, trigger_id: Uuid) -> CoreResult<()> {
        let Some(trigger) = crate::db::get_trigger(&self.pool, trigger_id).await? else {
            return Ok(());
        };
        let adapter = self.adapter(&trigger.provider_id)?;
        crate::db::delete_trigger(&self.pool, trigger_id).await?;

        if let Err(e) = adapter.teardown_trigger(&trigger).await {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "best-effort teardown failed after delete");
        }
        if let Err(e) = adapter.delete_remote_trigger(&trigger).await {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "best-effort remote delete failed after delete");
        }
        Ok(())
    }

    pub async fn process_event(&self, trigger_id: Uuid, raw_data: &[u8]) -> CoreResult<TriggerResult> {
        let trigger = crate::db::get_trigger(&self.pool, trigger_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trigger {trigger_id}")))?;
        let adapter = self.adapter(&trigger.provider_id)?;
        let result = adapter.process_event(&trigger, raw_data).await?;

        let result_json = serde_json::json!({
            "should_execute": result.should_execute,
            "agent_prompt": result.agent_prompt,
            "execution_variables": result.execution_variables,
            "error_message": result.error_message,
        });
        crate::db::log_trigger_event(&self.pool, trigger_id, raw_data, &result_json).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> Pool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        crate::db::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let pool = test_pool().await;
        let service = TriggerService::new(pool, "http://localhost:8787".into(), None);
        let agent_id = Uuid::new_v4();
        let trigger = service
            .create(agent_id, "webhook", "my-hook".into(), json!({}))
            .await
            .unwrap();
        let fetched = service.get(trigger.trigger_id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "my-hook");
        assert!(fetched.is_active);
    }

    #[tokio::test]
    async fn deactivating_then_reactivating_round_trips() {
        let pool = test_pool().await;
        let service = TriggerService::new(pool, "http://localhost:8787".into(), None);
        let agent_id = Uuid::new_v4();
        let trigger = service.create(agent_id, "webhook", "h".into(), json!({})).await.unwrap();

        let inactive = service.update(trigger.trigger_id, None, None, Some(false)).await.unwrap();
        assert!(!inactive.is_active);

        let active = service.update(trigger.trigger_id, None, None, Some(true)).await.unwrap();
        assert!(active.is_active);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let pool = test_pool().await;
        let service = TriggerService::new(pool, "http://localhost:8787".into(), None);
        let agent_id = Uuid::new_v4();
        let trigger = service.create(agent_id, "webhook", "h".into(), json!({})).await.unwrap();
        service.delete(trigger.trigger_id).await.unwrap();
        assert!(service.get(trigger.trigger_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn process_event_logs_and_returns_result() {
        let pool = test_pool().await;
        let service = TriggerService::new(pool, "http://localhost:8787".into(), None);
        let agent_id = Uuid::new_v4();
        let trigger = service.create(agent_id, "webhook", "h".into(), json!({})).await.unwrap();
        let result = service.process_event(trigger.trigger_id, br#"{"hello":"world"}"#).await.unwrap();
        assert!(result.should_execute);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let pool = test_pool().await;
        let service = TriggerService::new(pool, "http://localhost:8787".into(), None);
        let result = service.create(Uuid::new_v4(), "carrier-pigeon", "h".into(), json!({})).await;
        assert!(result.is_err());
    }
}
