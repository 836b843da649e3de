//! Provider Adapters (spec §4.8). Every adapter implements the same narrow
//! capability set; the Trigger Service dispatches to one by `provider_id`.

mod event;
mod schedule;
mod webhook;

pub use event::EventAdapter;
pub use schedule::ScheduleAdapter;
pub use webhook::WebhookAdapter;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::Trigger;
use crate::error::CoreResult;

/// What a single `process_event` call decided to do with an inbound event.
#[derive(Debug, Clone, Default)]
pub struct TriggerResult {
    pub should_execute: bool,
    pub agent_prompt: Option<String>,
    pub execution_variables: Value,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &'static str;

    fn config_schema(&self) -> Value;

    fn validate_config(&self, config: &Value) -> CoreResult<()>;

    /// Returns `false` to abort the `inactive -> active` transition (spec
    /// §4.7: "rollback if it returns false").
    async fn setup_trigger(&self, trigger: &Trigger) -> CoreResult<bool>;

    async fn teardown_trigger(&self, trigger: &Trigger) -> CoreResult<()>;

    async fn process_event(&self, trigger: &Trigger, raw_data: &[u8]) -> CoreResult<TriggerResult>;

    /// Best-effort remote cleanup called after the local row is already
    /// gone (spec §4.7 "delete"). Default no-op for stateless adapters.
    async fn delete_remote_trigger(&self, _trigger: &Trigger) -> CoreResult<()> {
        Ok(())
    }
}
