//! Repository functions over the sqlite pool.
//!
//! Each function runs one `interact()` closure so a single blocking-safe
//! rusqlite call crosses the pool boundary, matching the
//! `deadpool_sqlite::Connection::interact` pattern the teacher's stack is
//! built around.

use chrono::Utc;
use deadpool_sqlite::Pool;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

use super::models::{
    AgentRun, AgentRunStatus, CronJob, Message, MessageMetadata, MessageType, Thread, ThreadMetadata, Trigger, TriggerType,
};

const MESSAGE_PAGE_SIZE: i64 = 1000;

async fn interact<F, T>(pool: &Pool, f: F) -> CoreResult<T>
where
    F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = pool
        .get()
        .await
        .map_err(|e| CoreError::Config(format!("acquiring connection: {e}")))?;
    conn.interact(f)
        .await
        .map_err(|e| CoreError::Config(format!("db task panicked: {e}")))?
        .map_err(CoreError::Database)
}

// ---- threads ----

pub async fn create_thread(pool: &Pool, account_id: Uuid, project_id: Option<Uuid>) -> CoreResult<Thread> {
    let thread = Thread {
        thread_id: Uuid::new_v4(),
        account_id,
        project_id,
        metadata: ThreadMetadata::default(),
        created_at: Utc::now(),
    };
    let row = thread.clone();
    interact(pool, move |conn| {
        conn.execute(
            "insert into threads (thread_id, account_id, project_id, metadata, created_at) values (?1, ?2, ?3, ?4, ?5)",
            params![
                row.thread_id.to_string(),
                row.account_id.to_string(),
                row.project_id.map(|p| p.to_string()),
                serde_json::to_string(&row.metadata).unwrap(),
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await?;
    Ok(thread)
}

pub async fn get_thread(pool: &Pool, thread_id: Uuid) -> CoreResult<Option<Thread>> {
    interact(pool, move |conn| {
        conn.query_row(
            "select thread_id, account_id, project_id, metadata, created_at from threads where thread_id = ?1",
            params![thread_id.to_string()],
            row_to_thread,
        )
        .optional()
    })
    .await
}

/// Single-writer flag per thread (spec §5): only the active Thread Runner
/// sets this, and only the Context Manager's compression writes clear it by
/// way of setting it true again next turn.
pub async fn set_cache_needs_rebuild(pool: &Pool, thread_id: Uuid, value: bool) -> CoreResult<()> {
    interact(pool, move |conn| {
        let metadata: String = conn.query_row(
            "select metadata from threads where thread_id = ?1",
            params![thread_id.to_string()],
            |row| row.get(0),
        )?;
        let mut meta: ThreadMetadata = serde_json::from_str(&metadata).unwrap_or_default();
        meta.cache_needs_rebuild = value;
        conn.execute(
            "update threads set metadata = ?1 where thread_id = ?2",
            params![serde_json::to_string(&meta).unwrap(), thread_id.to_string()],
        )?;
        Ok(())
    })
    .await
}

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    let thread_id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let project_id: Option<String> = row.get(2)?;
    let metadata: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(Thread {
        thread_id: Uuid::parse_str(&thread_id).unwrap(),
        account_id: Uuid::parse_str(&account_id).unwrap(),
        project_id: project_id.map(|s| Uuid::parse_str(&s).unwrap()),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
    })
}

// ---- messages ----

pub async fn append_message(pool: &Pool, msg: Message) -> CoreResult<Uuid> {
    let id = msg.message_id;
    interact(pool, move |conn| {
        let seq: i64 = conn.query_row(
            "select coalesce(max(seq), 0) + 1 from messages where thread_id = ?1",
            params![msg.thread_id.to_string()],
            |row| row.get(0),
        )?;
        conn.execute(
            "insert into messages (message_id, thread_id, created_at, seq, type, is_llm_message, content, metadata, agent_id, agent_version_id)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.message_id.to_string(),
                msg.thread_id.to_string(),
                msg.created_at.to_rfc3339(),
                seq,
                message_type_str(msg.kind),
                msg.is_llm_message as i64,
                serde_json::to_string(&msg.content).unwrap(),
                serde_json::to_string(&msg.metadata).unwrap(),
                msg.agent_id.map(|u| u.to_string()),
                msg.agent_version_id.map(|u| u.to_string()),
            ],
        )?;
        Ok(())
    })
    .await?;
    Ok(id)
}

/// Fetches every message for a thread, walking the table in
/// `MESSAGE_PAGE_SIZE`-row pages (spec §4.2) in creation order.
/// `list_llm_messages`: rows this thread's `is_llm_message` flag marks as
/// part of the provider-facing conversation, in creation order. Paginated
/// internally in 1000-row batches.
pub async fn list_llm_messages(pool: &Pool, thread_id: Uuid) -> CoreResult<Vec<Message>> {
    let mut out = Vec::new();
    let mut offset: i64 = 0;
    loop {
        let batch = interact(pool, move |conn| {
            let mut stmt = conn.prepare(
                "select message_id, thread_id, created_at, type, is_llm_message, content, metadata, agent_id, agent_version_id
                 from messages where thread_id = ?1 and is_llm_message = 1 order by seq asc limit ?2 offset ?3",
            )?;
            let rows = stmt
                .query_map(params![thread_id.to_string(), MESSAGE_PAGE_SIZE, offset], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?;
        let n = batch.len();
        out.extend(batch);
        if (n as i64) < MESSAGE_PAGE_SIZE {
            break;
        }
        offset += MESSAGE_PAGE_SIZE;
    }
    Ok(out)
}

pub async fn update_message(
    pool: &Pool,
    message_id: Uuid,
    content: Option<super::models::Content>,
    metadata: Option<MessageMetadata>,
) -> CoreResult<()> {
    interact(pool, move |conn| {
        if let Some(content) = &content {
            conn.execute(
                "update messages set content = ?1 where message_id = ?2",
                params![serde_json::to_string(content).unwrap(), message_id.to_string()],
            )?;
        }
        if let Some(metadata) = &metadata {
            conn.execute(
                "update messages set metadata = ?1 where message_id = ?2",
                params![serde_json::to_string(metadata).unwrap(), message_id.to_string()],
            )?;
        }
        Ok(())
    })
    .await
}

/// Looks up a single message by its id, independent of thread — used by the
/// `expand-message` tool, which only ever receives a `message_id`.
pub async fn find_message_by_id(pool: &Pool, message_id: Uuid) -> CoreResult<Option<Message>> {
    interact(pool, move |conn| {
        conn.query_row(
            "select message_id, thread_id, created_at, type, is_llm_message, content, metadata, agent_id, agent_version_id
             from messages where message_id = ?1",
            params![message_id.to_string()],
            row_to_message,
        )
        .optional()
    })
    .await
}

pub async fn latest_of_type(pool: &Pool, thread_id: Uuid, kind: MessageType) -> CoreResult<Option<Message>> {
    interact(pool, move |conn| {
        conn.query_row(
            "select message_id, thread_id, created_at, type, is_llm_message, content, metadata, agent_id, agent_version_id
             from messages where thread_id = ?1 and type = ?2 order by seq desc limit 1",
            params![thread_id.to_string(), message_type_str(kind)],
            row_to_message,
        )
        .optional()
    })
    .await
}

fn message_type_str(kind: MessageType) -> &'static str {
    match kind {
        MessageType::User => "user",
        MessageType::Assistant => "assistant",
        MessageType::Tool => "tool",
        MessageType::Status => "status",
        MessageType::LlmResponseEnd => "llm_response_end",
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let message_id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let is_llm_message: i64 = row.get(4)?;
    let content: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let agent_id: Option<String> = row.get(7)?;
    let agent_version_id: Option<String> = row.get(8)?;
    Ok(Message {
        message_id: Uuid::parse_str(&message_id).unwrap(),
        thread_id: Uuid::parse_str(&thread_id).unwrap(),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        kind: match kind.as_str() {
            "user" => MessageType::User,
            "assistant" => MessageType::Assistant,
            "tool" => MessageType::Tool,
            "status" => MessageType::Status,
            _ => MessageType::LlmResponseEnd,
        },
        is_llm_message: is_llm_message != 0,
        content: serde_json::from_str(&content).unwrap_or(super::models::Content::Text(content)),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        agent_id: agent_id.map(|s| Uuid::parse_str(&s).unwrap()),
        agent_version_id: agent_version_id.map(|s| Uuid::parse_str(&s).unwrap()),
    })
}

// ---- agent runs ----

/// Inserts a `running` row. The partial unique index on `(thread_id) where
/// status='running'` makes this the atomic check-and-set spec §5 requires:
/// a second concurrent insert for the same thread fails with a constraint
/// violation instead of racing.
pub async fn create_running_agent_run(pool: &Pool, thread_id: Uuid, model_name: String) -> CoreResult<AgentRun> {
    let run = AgentRun {
        id: Uuid::new_v4(),
        thread_id,
        status: AgentRunStatus::Running,
        started_at: Utc::now(),
        ended_at: None,
        model_name,
    };
    let row = run.clone();
    let result = interact(pool, move |conn| {
        conn.execute(
            "insert into agent_runs (id, thread_id, status, started_at, ended_at, model_name) values (?1, ?2, 'running', ?3, null, ?4)",
            params![row.id.to_string(), row.thread_id.to_string(), row.started_at.to_rfc3339(), row.model_name],
        )
    })
    .await;
    match result {
        Ok(_) => Ok(run),
        Err(CoreError::Database(rusqlite::Error::SqliteFailure(e, _)))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(CoreError::Config(format!(
                "thread {thread_id} already has a running agent run"
            )))
        }
        Err(e) => Err(e),
    }
}

pub async fn set_agent_run_status(pool: &Pool, id: Uuid, status: AgentRunStatus) -> CoreResult<()> {
    let status_str = match status {
        AgentRunStatus::Running => "running",
        AgentRunStatus::Stopped => "stopped",
        AgentRunStatus::Completed => "completed",
        AgentRunStatus::Failed => "failed",
    };
    interact(pool, move |conn| {
        conn.execute(
            "update agent_runs set status = ?1, ended_at = case when ?1 != 'running' then ?2 else ended_at end where id = ?3",
            params![status_str, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    })
    .await
}

pub async fn get_agent_run_status(pool: &Pool, id: Uuid) -> CoreResult<Option<AgentRunStatus>> {
    interact(pool, move |conn| {
        conn.query_row("select status from agent_runs where id = ?1", params![id.to_string()], |row| {
            let s: String = row.get(0)?;
            Ok(s)
        })
        .optional()
    })
    .await
    .map(|opt| {
        opt.map(|s| match s.as_str() {
            "running" => AgentRunStatus::Running,
            "stopped" => AgentRunStatus::Stopped,
            "completed" => AgentRunStatus::Completed,
            _ => AgentRunStatus::Failed,
        })
    })
}

// ---- triggers ----

pub async fn insert_trigger(pool: &Pool, trigger: Trigger) -> CoreResult<()> {
    interact(pool, move |conn| {
        conn.execute(
            "insert into triggers (trigger_id, agent_id, provider_id, trigger_type, name, is_active, config, created_at, updated_at)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trigger.trigger_id.to_string(),
                trigger.agent_id.to_string(),
                trigger.provider_id,
                trigger_type_str(trigger.trigger_type),
                trigger.name,
                trigger.is_active as i64,
                serde_json::to_string(&trigger.config).unwrap(),
                trigger.created_at.to_rfc3339(),
                trigger.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

pub async fn get_trigger(pool: &Pool, trigger_id: Uuid) -> CoreResult<Option<Trigger>> {
    interact(pool, move |conn| {
        conn.query_row(
            "select trigger_id, agent_id, provider_id, trigger_type, name, is_active, config, created_at, updated_at
             from triggers where trigger_id = ?1",
            params![trigger_id.to_string()],
            row_to_trigger,
        )
        .optional()
    })
    .await
}

pub async fn list_triggers_by_agent(pool: &Pool, agent_id: Uuid) -> CoreResult<Vec<Trigger>> {
    interact(pool, move |conn| {
        let mut stmt = conn.prepare(
            "select trigger_id, agent_id, provider_id, trigger_type, name, is_active, config, created_at, updated_at
             from triggers where agent_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![agent_id.to_string()], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await
}

/// Count of triggers whose `config.composio_trigger_id` matches, optionally
/// restricted to active ones — backs the reference-counted event provider
/// (spec §4.7 "reference-counted trigger").
pub async fn count_triggers_with_composio_id(
    pool: &Pool,
    composio_trigger_id: String,
    active_only: bool,
    exclude: Option<Uuid>,
) -> CoreResult<i64> {
    interact(pool, move |conn| {
        let mut stmt = conn.prepare(
            "select trigger_id, config, is_active from triggers where provider_id = 'composio'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let config: String = row.get(1)?;
                let active: i64 = row.get(2)?;
                Ok((id, config, active != 0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let count = rows
            .into_iter()
            .filter(|(id, config, active)| {
                if active_only && !active {
                    return false;
                }
                if let Some(excl) = exclude {
                    if *id == excl.to_string() {
                        return false;
                    }
                }
                serde_json::from_str::<serde_json::Value>(config)
                    .ok()
                    .and_then(|v| v.get("composio_trigger_id").and_then(|x| x.as_str()).map(|s| s.to_string()))
                    .map(|v| v == composio_trigger_id)
                    .unwrap_or(false)
            })
            .count();
        Ok(count as i64)
    })
    .await
}

pub async fn update_trigger(
    pool: &Pool,
    trigger_id: Uuid,
    is_active: Option<bool>,
    config: Option<serde_json::Value>,
    name: Option<String>,
) -> CoreResult<()> {
    interact(pool, move |conn| {
        if let Some(active) = is_active {
            conn.execute(
                "update triggers set is_active = ?1, updated_at = ?2 where trigger_id = ?3",
                params![active as i64, Utc::now().to_rfc3339(), trigger_id.to_string()],
            )?;
        }
        if let Some(cfg) = &config {
            conn.execute(
                "update triggers set config = ?1, updated_at = ?2 where trigger_id = ?3",
                params![serde_json::to_string(cfg).unwrap(), Utc::now().to_rfc3339(), trigger_id.to_string()],
            )?;
        }
        if let Some(n) = &name {
            conn.execute(
                "update triggers set name = ?1, updated_at = ?2 where trigger_id = ?3",
                params![n, Utc::now().to_rfc3339(), trigger_id.to_string()],
            )?;
        }
        Ok(())
    })
    .await
}

pub async fn delete_trigger(pool: &Pool, trigger_id: Uuid) -> CoreResult<()> {
    interact(pool, move |conn| {
        conn.execute("delete from triggers where trigger_id = ?1", params![trigger_id.to_string()])?;
        Ok(())
    })
    .await
}

pub async fn log_trigger_event(
    pool: &Pool,
    trigger_id: Uuid,
    raw_data: &[u8],
    result: &serde_json::Value,
) -> CoreResult<()> {
    // Serializability-safe encoding (spec §4.7): lossy bytes -> utf8.
    let raw_text = String::from_utf8_lossy(raw_data).into_owned();
    let result = result.clone();
    interact(pool, move |conn| {
        conn.execute(
            "insert into trigger_event_log (id, trigger_id, raw_data, result, created_at) values (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                trigger_id.to_string(),
                raw_text,
                serde_json::to_string(&result).unwrap(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

// ---- cron jobs ----

/// Reconciles the row keyed by `job.name` (spec §4.8: repeated setup calls
/// reconcile a stable job rather than accumulating duplicates).
pub async fn upsert_cron_job(pool: &Pool, job: CronJob) -> CoreResult<()> {
    interact(pool, move |conn| {
        conn.execute(
            "insert into cron_jobs (name, trigger_id, schedule, url, headers, body, timeout_secs, created_at, updated_at)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             on conflict(name) do update set
                trigger_id = excluded.trigger_id,
                schedule = excluded.schedule,
                url = excluded.url,
                headers = excluded.headers,
                body = excluded.body,
                timeout_secs = excluded.timeout_secs,
                updated_at = excluded.updated_at",
            params![
                job.name,
                job.trigger_id.to_string(),
                job.schedule,
                job.url,
                serde_json::to_string(&job.headers).unwrap(),
                serde_json::to_string(&job.body).unwrap(),
                job.timeout_secs,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

pub async fn get_cron_job(pool: &Pool, name: String) -> CoreResult<Option<CronJob>> {
    interact(pool, move |conn| {
        conn.query_row(
            "select name, trigger_id, schedule, url, headers, body, timeout_secs, created_at, updated_at
             from cron_jobs where name = ?1",
            params![name],
            row_to_cron_job,
        )
        .optional()
    })
    .await
}

pub async fn delete_cron_job(pool: &Pool, name: String) -> CoreResult<()> {
    interact(pool, move |conn| {
        conn.execute("delete from cron_jobs where name = ?1", params![name])?;
        Ok(())
    })
    .await
}

fn row_to_cron_job(row: &rusqlite::Row) -> rusqlite::Result<CronJob> {
    let name: String = row.get(0)?;
    let trigger_id: String = row.get(1)?;
    let schedule: String = row.get(2)?;
    let url: String = row.get(3)?;
    let headers: String = row.get(4)?;
    let body: String = row.get(5)?;
    let timeout_secs: u32 = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(CronJob {
        name,
        trigger_id: Uuid::parse_str(&trigger_id).unwrap(),
        schedule,
        url,
        headers: serde_json::from_str(&headers).unwrap_or(serde_json::Value::Null),
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
        timeout_secs,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
    })
}

fn trigger_type_str(kind: TriggerType) -> &'static str {
    match kind {
        TriggerType::Schedule => "SCHEDULE",
        TriggerType::Webhook => "WEBHOOK",
        TriggerType::Event => "EVENT",
    }
}

fn row_to_trigger(row: &rusqlite::Row) -> rusqlite::Result<Trigger> {
    let trigger_id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let provider_id: String = row.get(2)?;
    let trigger_type: String = row.get(3)?;
    let name: String = row.get(4)?;
    let is_active: i64 = row.get(5)?;
    let config: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(Trigger {
        trigger_id: Uuid::parse_str(&trigger_id).unwrap(),
        agent_id: Uuid::parse_str(&agent_id).unwrap(),
        provider_id,
        trigger_type: match trigger_type.as_str() {
            "SCHEDULE" => TriggerType::Schedule,
            "WEBHOOK" => TriggerType::Webhook,
            _ => TriggerType::Event,
        },
        name,
        is_active: is_active != 0,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
    })
}

// ---- credits ----

use rust_decimal::Decimal;
use std::str::FromStr;

use super::models::CreditAccount;

pub async fn get_credit_account(pool: &Pool, user_id: Uuid) -> CoreResult<Option<CreditAccount>> {
    interact(pool, move |conn| {
        conn.query_row(
            "select user_id, balance, tier, billing_cycle_anchor, next_credit_grant, last_grant_date
             from credit_accounts where user_id = ?1",
            params![user_id.to_string()],
            row_to_credit_account,
        )
        .optional()
    })
    .await
}

fn row_to_credit_account(row: &rusqlite::Row) -> rusqlite::Result<CreditAccount> {
    let user_id: String = row.get(0)?;
    let balance: String = row.get(1)?;
    let tier: String = row.get(2)?;
    let billing_cycle_anchor: String = row.get(3)?;
    let next_credit_grant: String = row.get(4)?;
    let last_grant_date: Option<String> = row.get(5)?;
    Ok(CreditAccount {
        user_id: Uuid::parse_str(&user_id).unwrap(),
        balance: Decimal::from_str(&balance).unwrap_or_default(),
        tier,
        billing_cycle_anchor: chrono::DateTime::parse_from_rfc3339(&billing_cycle_anchor)
            .unwrap()
            .with_timezone(&Utc),
        next_credit_grant: chrono::DateTime::parse_from_rfc3339(&next_credit_grant)
            .unwrap()
            .with_timezone(&Utc),
        last_grant_date: last_grant_date
            .map(|s| chrono::DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
    })
}

/// Records an in-flight reservation (spec §4.6 "credit reservation").
/// Actual balance mutation happens at deduction time; the reservation row
/// exists purely so a crashed run's credit hold can be audited/released.
pub async fn insert_reservation(pool: &Pool, user_id: Uuid) -> CoreResult<Uuid> {
    let reservation_id = Uuid::new_v4();
    interact(pool, move |conn| {
        conn.execute(
            "insert into credit_reservations (reservation_id, user_id, created_at, released) values (?1, ?2, ?3, 0)",
            params![reservation_id.to_string(), user_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
    .await?;
    Ok(reservation_id)
}

pub async fn release_reservation(pool: &Pool, reservation_id: Uuid) -> CoreResult<()> {
    interact(pool, move |conn| {
        conn.execute(
            "update credit_reservations set released = 1 where reservation_id = ?1",
            params![reservation_id.to_string()],
        )?;
        Ok(())
    })
    .await
}

/// Deducts `amount` from `user_id`'s balance keyed by `llm_response_id`
/// (spec §8 invariant 7: idempotent). Returns `true` if this call performed
/// the deduction, `false` if `llm_response_id` was already recorded.
pub async fn record_deduction(
    pool: &Pool,
    llm_response_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
) -> CoreResult<bool> {
    interact(pool, move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "insert or ignore into credit_deductions (llm_response_id, user_id, amount, created_at) values (?1, ?2, ?3, ?4)",
            params![
                llm_response_id.to_string(),
                user_id.to_string(),
                amount.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 1 {
            let current: String = tx.query_row(
                "select balance from credit_accounts where user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            let current = Decimal::from_str(&current).unwrap_or_default();
            let updated = current - amount;
            tx.execute(
                "update credit_accounts set balance = ?1 where user_id = ?2",
                params![updated.to_string(), user_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(changed == 1)
    })
    .await
}

// ---- webhook idempotence ----

/// Reserves a `webhook-id`. Returns `true` if this call performed the
/// reservation (first delivery), `false` if it was already reserved
/// (a replay) — spec §8 round-trip law "at-most-one agent run".
pub async fn try_reserve_webhook_id(pool: &Pool, webhook_id: String) -> CoreResult<bool> {
    interact(pool, move |conn| {
        let changed = conn.execute(
            "insert or ignore into webhook_receipts (webhook_id, received_at) values (?1, ?2)",
            params![webhook_id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed == 1)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Content, MessageMetadata};

    async fn test_pool() -> Pool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::mem::forget(dir);
        super::super::pool::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn append_and_list_messages_preserves_order() {
        let pool = test_pool().await;
        let thread = create_thread(&pool, Uuid::new_v4(), None).await.unwrap();
        for i in 0..5 {
            let msg = Message {
                message_id: Uuid::new_v4(),
                thread_id: thread.thread_id,
                created_at: Utc::now(),
                kind: MessageType::User,
                is_llm_message: true,
                content: Content::Text(format!("msg {i}")),
                metadata: MessageMetadata::default(),
                agent_id: None,
                agent_version_id: None,
            };
            append_message(&pool, msg).await.unwrap();
        }
        let msgs = list_llm_messages(&pool, thread.thread_id).await.unwrap();
        assert_eq!(msgs.len(), 5);
        for (i, m) in msgs.iter().enumerate() {
            assert_eq!(m.content.as_text().unwrap(), format!("msg {i}"));
        }
    }

    #[tokio::test]
    async fn list_llm_messages_excludes_non_llm_rows() {
        let pool = test_pool().await;
        let thread = create_thread(&pool, Uuid::new_v4(), None).await.unwrap();
        let user_msg = Message {
            message_id: Uuid::new_v4(),
            thread_id: thread.thread_id,
            created_at: Utc::now(),
            kind: MessageType::User,
            is_llm_message: true,
            content: Content::Text("hello".into()),
            metadata: MessageMetadata::default(),
            agent_id: None,
            agent_version_id: None,
        };
        let status_msg = Message {
            message_id: Uuid::new_v4(),
            thread_id: thread.thread_id,
            created_at: Utc::now(),
            kind: MessageType::Status,
            is_llm_message: false,
            content: Content::Text("stopped".into()),
            metadata: MessageMetadata::default(),
            agent_id: None,
            agent_version_id: None,
        };
        append_message(&pool, user_msg).await.unwrap();
        append_message(&pool, status_msg).await.unwrap();

        let msgs = list_llm_messages(&pool, thread.thread_id).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content.as_text().unwrap(), "hello");
    }

    #[tokio::test]
    async fn second_running_agent_run_is_rejected() {
        let pool = test_pool().await;
        let thread = create_thread(&pool, Uuid::new_v4(), None).await.unwrap();
        create_running_agent_run(&pool, thread.thread_id, "claude-sonnet".into())
            .await
            .unwrap();
        let second = create_running_agent_run(&pool, thread.thread_id, "claude-sonnet".into()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn webhook_id_reservation_is_idempotent() {
        let pool = test_pool().await;
        let id = "wh_123".to_string();
        assert!(try_reserve_webhook_id(&pool, id.clone()).await.unwrap());
        assert!(!try_reserve_webhook_id(&pool, id).await.unwrap());
    }

    async fn insert_test_account(pool: &Pool, user_id: Uuid, balance: &str) {
        interact(pool, {
            let balance = balance.to_string();
            move |conn| {
                conn.execute(
                    "insert into credit_accounts (user_id, balance, tier, billing_cycle_anchor, next_credit_grant, last_grant_date)
                     values (?1, ?2, 'free', ?3, ?3, null)",
                    params![user_id.to_string(), balance, Utc::now().to_rfc3339()],
                )
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn deduction_is_idempotent_and_updates_balance() {
        let pool = test_pool().await;
        let user_id = Uuid::new_v4();
        insert_test_account(&pool, user_id, "100").await;
        let llm_response_id = Uuid::new_v4();
        let amount = Decimal::from_str("12.5").unwrap();

        let first = record_deduction(&pool, llm_response_id, user_id, amount).await.unwrap();
        assert!(first);
        let second = record_deduction(&pool, llm_response_id, user_id, amount).await.unwrap();
        assert!(!second);

        let account = get_credit_account(&pool, user_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from_str("87.5").unwrap());
    }
}
