//! Schedule adapter (spec §4.8).
//!
//! Grounded: `original_source/backend/core/triggers/provider_service.py`'s
//! `ScheduleProvider`, most directly `_convert_cron_to_utc` — ported as-is,
//! including its narrow scope: only a cron expression with both a literal
//! minute and a literal hour field gets timezone-shifted, everything with a
//! `*` or `*/N` field passes through untouched (spec's resolved open
//! question, confirmed against this source).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde_json::{json, Value};

use deadpool_sqlite::Pool;

use crate::config::SecretString;
use crate::db::{CronJob, Trigger};
use crate::error::{CoreError, CoreResult};

use super::{ProviderAdapter, TriggerResult};

/// Cron RPC calls (`schedule_trigger_http`/`unschedule_job_by_name`) have no
/// external scheduler counterpart here; the `cron_jobs` table is that
/// scheduler's persisted state (spec §4.8/§6).
const CRON_JOB_TIMEOUT_SECS: u32 = 8;

pub struct ScheduleAdapter {
    webhook_base_url: String,
    shared_secret: Option<SecretString>,
    pool: Pool,
}

impl ScheduleAdapter {
    pub fn new(pool: Pool, webhook_base_url: String, shared_secret: Option<SecretString>) -> Self {
        Self { webhook_base_url, shared_secret, pool }
    }

    pub fn webhook_url(&self, trigger_id: uuid::Uuid) -> String {
        format!("{}/triggers/{}/webhook", self.webhook_base_url.trim_end_matches('/'), trigger_id)
    }

    /// Named `trigger_<trigger_id>` so repeated setup calls reconcile a
    /// stable job rather than accumulating duplicates.
    pub fn job_name(trigger_id: uuid::Uuid) -> String {
        format!("trigger_{trigger_id}")
    }

    fn shared_secret_header(&self) -> Option<String> {
        self.shared_secret.as_ref().map(|s| s.expose_secret().to_string())
    }
}

/// Shifts only cron expressions whose minute and hour fields are both plain
/// literals; `*`, `*/N`, lists, and ranges are left untouched.
pub fn convert_cron_to_utc(cron_expression: &str, user_timezone: &str) -> String {
    let parts: Vec<&str> = cron_expression.split_whitespace().collect();
    if parts.len() != 5 {
        return cron_expression.to_string();
    }
    let (minute, hour, day, month, weekday) = (parts[0], parts[1], parts[2], parts[3], parts[4]);

    if minute == "*" || hour == "*" {
        return cron_expression.to_string();
    }
    let (Ok(minute_n), Ok(hour_n)) = (minute.parse::<u32>(), hour.parse::<u32>()) else {
        return cron_expression.to_string();
    };
    let Ok(tz): Result<Tz, _> = user_timezone.parse() else {
        return cron_expression.to_string();
    };

    let now = Utc::now().with_timezone(&tz);
    let Some(local) = tz
        .with_ymd_and_hms(now.year(), now.month(), now.day(), hour_n, minute_n, 0)
        .single()
    else {
        return cron_expression.to_string();
    };
    let utc = local.with_timezone(&Utc);
    format!("{} {} {day} {month} {weekday}", utc.format("%M"), utc.format("%H"))
}

#[async_trait]
impl ProviderAdapter for ScheduleAdapter {
    fn provider_id(&self) -> &'static str {
        "schedule"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cron_expression": {"type": "string"},
                "execution_type": {"type": "string", "enum": ["agent", "workflow"]},
                "agent_prompt": {"type": "string"},
                "workflow_id": {"type": "string"},
                "workflow_input": {"type": "object"},
                "timezone": {"type": "string"}
            },
            "required": ["cron_expression", "execution_type"]
        })
    }

    fn validate_config(&self, config: &Value) -> CoreResult<()> {
        let cron_expr = config
            .get("cron_expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Config("cron_expression is required for scheduled triggers".into()))?;
        // `cron`'s Schedule parser expects a leading seconds field; prepend
        // one so a standard 5-field expression validates.
        Schedule::from_str(&format!("0 {cron_expr}"))
            .map_err(|e| CoreError::Config(format!("invalid cron expression: {e}")))?;

        let execution_type = config.get("execution_type").and_then(|v| v.as_str()).unwrap_or("agent");
        if execution_type != "agent" && execution_type != "workflow" {
            return Err(CoreError::Config("execution_type must be either 'agent' or 'workflow'".into()));
        }
        if execution_type == "agent" && config.get("agent_prompt").and_then(|v| v.as_str()).is_none() {
            return Err(CoreError::Config("agent_prompt is required for agent execution".into()));
        }
        if execution_type == "workflow" && config.get("workflow_id").and_then(|v| v.as_str()).is_none() {
            return Err(CoreError::Config("workflow_id is required for workflow execution".into()));
        }
        if let Some(tz) = config.get("timezone").and_then(|v| v.as_str()) {
            if tz != "UTC" && tz.parse::<Tz>().is_err() {
                return Err(CoreError::Config(format!("invalid timezone: {tz}")));
            }
        }
        Ok(())
    }

    async fn setup_trigger(&self, trigger: &Trigger) -> CoreResult<bool> {
        let cron_expr = trigger
            .config
            .get("cron_expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::TriggerSetupFailed {
                provider: self.provider_id().into(),
                reason: "missing cron_expression".into(),
            })?;
        let timezone = trigger.config.get("timezone").and_then(|v| v.as_str()).unwrap_or("UTC");
        let cron_expr = if timezone != "UTC" {
            convert_cron_to_utc(cron_expr, timezone)
        } else {
            cron_expr.to_string()
        };

        let mut headers = json!({"Content-Type": "application/json", "X-Trigger-Source": "schedule"});
        if let Some(secret) = self.shared_secret_header() {
            headers["X-Trigger-Secret"] = Value::String(secret);
        }
        let body = json!({
            "trigger_id": trigger.trigger_id,
            "agent_id": trigger.agent_id,
            "execution_type": trigger.config.get("execution_type"),
            "agent_prompt": trigger.config.get("agent_prompt"),
            "workflow_id": trigger.config.get("workflow_id"),
            "workflow_input": trigger.config.get("workflow_input"),
        });
        let now = Utc::now();
        let job = CronJob {
            name: Self::job_name(trigger.trigger_id),
            trigger_id: trigger.trigger_id,
            schedule: cron_expr.clone(),
            url: self.webhook_url(trigger.trigger_id),
            headers,
            body,
            timeout_secs: CRON_JOB_TIMEOUT_SECS,
            created_at: now,
            updated_at: now,
        };

        tracing::debug!(job = %job.name, cron = %cron_expr, url = %job.url, "registering schedule job");
        crate::db::upsert_cron_job(&self.pool, job).await?;
        Ok(true)
    }

    async fn teardown_trigger(&self, trigger: &Trigger) -> CoreResult<()> {
        let name = Self::job_name(trigger.trigger_id);
        tracing::debug!(job = %name, "unscheduling job");
        crate::db::delete_cron_job(&self.pool, name).await
    }

    async fn process_event(&self, trigger: &Trigger, raw_data: &[u8]) -> CoreResult<TriggerResult> {
        let raw: Value = serde_json::from_slice(raw_data).unwrap_or(Value::Null);
        let execution_type = raw.get("execution_type").and_then(|v| v.as_str()).unwrap_or("agent");
        let execution_variables = json!({
            "scheduled_time": raw.get("timestamp"),
            "trigger_id": trigger.trigger_id,
            "agent_id": trigger.agent_id,
        });

        if execution_type == "workflow" {
            return Ok(TriggerResult {
                should_execute: raw.get("workflow_id").and_then(|v| v.as_str()).is_some(),
                agent_prompt: None,
                execution_variables,
                error_message: None,
            });
        }

        let Some(agent_prompt) = raw.get("agent_prompt").and_then(|v| v.as_str()) else {
            return Ok(TriggerResult {
                should_execute: false,
                agent_prompt: None,
                execution_variables,
                error_message: Some("agent_prompt is required for agent execution".into()),
            });
        };
        Ok(TriggerResult {
            should_execute: true,
            agent_prompt: Some(agent_prompt.to_string()),
            execution_variables,
            error_message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretString;
    use crate::db::Trigger as DbTrigger;
    use crate::db::TriggerType;

    async fn test_pool() -> Pool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        crate::db::open(&path).await.unwrap()
    }

    fn test_trigger(config: Value) -> DbTrigger {
        let now = Utc::now();
        DbTrigger {
            trigger_id: uuid::Uuid::new_v4(),
            agent_id: uuid::Uuid::new_v4(),
            provider_id: "schedule".into(),
            trigger_type: TriggerType::Schedule,
            name: "nightly".into(),
            is_active: true,
            config,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn wildcard_hour_is_never_shifted() {
        assert_eq!(convert_cron_to_utc("*/15 * * * *", "America/New_York"), "*/15 * * * *");
        assert_eq!(convert_cron_to_utc("0 * * * *", "America/New_York"), "0 * * * *");
    }

    #[test]
    fn fixed_time_expression_is_shifted_for_non_utc_zone() {
        let shifted = convert_cron_to_utc("30 9 * * *", "America/New_York");
        assert_ne!(shifted, "30 9 * * *");
        let parts: Vec<&str> = shifted.split_whitespace().collect();
        assert_eq!(parts.len(), 5);
    }

    #[test]
    fn job_name_is_stable_per_trigger_id() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(ScheduleAdapter::job_name(id), format!("trigger_{id}"));
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let pool = test_pool().await;
        let adapter = ScheduleAdapter::new(pool, "http://localhost:8787".into(), None);
        let config = json!({"cron_expression": "not a cron", "execution_type": "agent", "agent_prompt": "hi"});
        assert!(adapter.validate_config(&config).is_err());
    }

    #[tokio::test]
    async fn setup_trigger_persists_a_cron_job_with_shared_secret_header() {
        let pool = test_pool().await;
        let adapter = ScheduleAdapter::new(
            pool.clone(),
            "http://localhost:8787".into(),
            Some(SecretString::new("sssh".into())),
        );
        let trigger = test_trigger(json!({
            "cron_expression": "0 9 * * *",
            "execution_type": "agent",
            "agent_prompt": "say hi",
        }));

        let ok = adapter.setup_trigger(&trigger).await.unwrap();
        assert!(ok);

        let job = crate::db::get_cron_job(&pool, ScheduleAdapter::job_name(trigger.trigger_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.trigger_id, trigger.trigger_id);
        assert_eq!(job.url, adapter.webhook_url(trigger.trigger_id));
        assert_eq!(job.timeout_secs, CRON_JOB_TIMEOUT_SECS);
        assert_eq!(job.headers.get("X-Trigger-Secret").and_then(|v| v.as_str()), Some("sssh"));
        assert_eq!(job.body.get("agent_prompt").and_then(|v| v.as_str()), Some("say hi"));
    }

    #[tokio::test]
    async fn teardown_trigger_removes_the_persisted_cron_job() {
        let pool = test_pool().await;
        let adapter = ScheduleAdapter::new(pool.clone(), "http://localhost:8787".into(), None);
        let trigger = test_trigger(json!({
            "cron_expression": "0 9 * * *",
            "execution_type": "agent",
            "agent_prompt": "say hi",
        }));

        adapter.setup_trigger(&trigger).await.unwrap();
        adapter.teardown_trigger(&trigger).await.unwrap();

        assert!(crate::db::get_cron_job(&pool, ScheduleAdapter::job_name(trigger.trigger_id))
            .await
            .unwrap()
            .is_none());
    }
}
