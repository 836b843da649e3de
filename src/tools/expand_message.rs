//! `expand-message` tool (SPEC_FULL.md supplemented feature).
//!
//! Every truncation sentinel the Context Manager writes references this
//! tool by name; it returns the original, uncompressed `content` of the
//! named message from the Message Store.

use async_trait::async_trait;
use deadpool_sqlite::Pool;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

use super::{Tool, ToolResult};

pub struct ExpandMessageTool {
    pool: Pool,
}

impl ExpandMessageTool {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Tool for ExpandMessageTool {
    fn name(&self) -> &str {
        "expand-message"
    }

    fn description(&self) -> &str {
        "Returns the full, uncompressed content of a message that was truncated for token management."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message_id": {"type": "string", "description": "The message_id referenced in a truncation sentinel"}
            },
            "required": ["message_id"],
        })
    }

    async fn invoke(&self, params: Value) -> CoreResult<ToolResult> {
        let message_id = params
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ToolInvocation {
                tool: self.name().to_string(),
                message: "missing message_id".into(),
            })?;
        let message_id = Uuid::parse_str(message_id).map_err(|e| CoreError::ToolInvocation {
            tool: self.name().to_string(),
            message: format!("invalid message_id: {e}"),
        })?;

        match crate::db::find_message_by_id(&self.pool, message_id).await? {
            Some(msg) => Ok(ToolResult::ok(msg.content.to_string())),
            None => Ok(ToolResult::failed(format!("no message found with id {message_id}"))),
        }
    }
}
