//! Webhook ingress HTTP surface (spec §4.9, §6).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/a2a/server.rs` for the
//! axum `Router`/`State`/`build_router`/`start_server` shape; the handlers
//! themselves are original to this domain (that file has no webhook
//! ingress).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use uuid::Uuid;

use crate::config::ServerConfig;

use super::{verify::verify_webhook_signature, ExecutionOutcome, ExecutionService};

#[derive(Clone)]
pub struct ExecutionState {
    pub service: Arc<ExecutionService>,
    pub webhook_secret: Option<crate::config::SecretString>,
    pub skew_secs: i64,
}

pub fn build_router(state: ExecutionState) -> Router {
    Router::new()
        .route("/triggers/{trigger_id}/webhook", post(handle_trigger_webhook))
        .route("/api/composio/webhook", post(handle_composio_webhook))
        .with_state(state)
}

pub async fn start_server(state: ExecutionState, server: &ServerConfig) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", server.bind, server.port).parse()?;
    tracing::info!("execution service webhook ingress starting on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verifies the webhook-standard headers when a secret is configured; a
/// missing secret means verification is not enforced (local/dev mode). A
/// present-but-failing signature always rejects.
fn verify_if_configured(state: &ExecutionState, headers: &HeaderMap, body: &[u8]) -> Result<(), String> {
    let Some(secret) = &state.webhook_secret else {
        return Ok(());
    };
    let id = header_str(headers, "webhook-id").unwrap_or_default();
    let ts = header_str(headers, "webhook-timestamp").unwrap_or_default();
    let sig = header_str(headers, "webhook-signature").unwrap_or_default();
    verify_webhook_signature(secret, id, ts, body, sig, state.skew_secs)
}

/// `POST /triggers/<trigger_id>/webhook`. Never 500s on a matched-but-
/// unexecutable trigger (spec §7); only a signature failure yields 401.
async fn handle_trigger_webhook(
    State(state): State<ExecutionState>,
    Path(trigger_id): Path<Uuid>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    if let Err(reason) = verify_if_configured(&state, &headers, &body) {
        tracing::warn!(trigger_id = %trigger_id, reason, "webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, Json(ExecutionOutcome {
            success: false,
            matched_triggers: 0,
            executed: 0,
            error: Some(reason),
            ..Default::default()
        }))
            .into_response();
    }

    let webhook_id = header_str(&headers, "webhook-id");
    match state.service.execute_trigger(trigger_id, &body, webhook_id).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            tracing::error!(trigger_id = %trigger_id, error = %e, "execution pipeline error");
            (
                StatusCode::OK,
                Json(ExecutionOutcome {
                    success: false,
                    matched_triggers: 0,
                    executed: 0,
                    error: Some(e.to_string()),
                    ..Default::default()
                }),
            )
                .into_response()
        }
    }
}

/// `POST /api/composio/webhook`. The trigger id travels inside the payload
/// rather than the path for this provider; resolved the same way
/// `EventAdapter::process_event` expects (`triggerSlug`/`eventId`).
async fn handle_composio_webhook(State(state): State<ExecutionState>, headers: HeaderMap, body: axum::body::Bytes) -> axum::response::Response {
    if let Err(reason) = verify_if_configured(&state, &headers, &body) {
        tracing::warn!(reason, "composio webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, Json(ExecutionOutcome {
            success: false,
            matched_triggers: 0,
            executed: 0,
            error: Some(reason),
            ..Default::default()
        }))
            .into_response();
    }

    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    let Some(trigger_id) = payload
        .get("trigger_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return (
            StatusCode::OK,
            Json(ExecutionOutcome {
                success: false,
                matched_triggers: 0,
                executed: 0,
                error: Some("payload did not carry a resolvable trigger_id".into()),
                ..Default::default()
            }),
        )
            .into_response();
    };

    let webhook_id = header_str(&headers, "webhook-id");
    match state.service.execute_trigger(trigger_id, &body, webhook_id).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => (
            StatusCode::OK,
            Json(ExecutionOutcome {
                success: false,
                matched_triggers: 0,
                executed: 0,
                error: Some(e.to_string()),
                ..Default::default()
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> ExecutionState {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.db");
        std::mem::forget(dir);
        let pool = crate::db::open(&path).await.unwrap();
        let config = Arc::new(crate::config::Config::default());
        let triggers = Arc::new(crate::triggers::TriggerService::new(pool.clone(), "http://localhost:8787".into(), None));
        let billing = Arc::new(crate::billing::BillingService::new(
            pool.clone(),
            &crate::config::BillingConfig { dev_mode: true, pricing_path: None },
        ));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let service = Arc::new(ExecutionService::new(pool, config, triggers, billing, tx));
        ExecutionState {
            service,
            webhook_secret: None,
            skew_secs: 300,
        }
    }

    #[tokio::test]
    async fn unknown_trigger_returns_200_with_zero_matches() {
        let app = build_router(test_state().await);
        let req = Request::builder()
            .method("POST")
            .uri(format!("/triggers/{}/webhook", Uuid::new_v4()))
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
