//! Process entry point: loads configuration, opens the database, wires the
//! provider, and starts the webhook ingress server and background runner.
//!
//! Grounded: `examples/adolfousier-opencrabs/src/a2a/server.rs::start_server`
//! for the "build state, build router, bind, serve" shape this generalises
//! to the whole process rather than one gateway.

use std::sync::Arc;

use convexec::background::{BackgroundRunner, EnqueuedRun};
use convexec::billing::BillingService;
use convexec::config::Config;
use convexec::execution::server::{start_server, ExecutionState};
use convexec::execution::ExecutionService;
use convexec::llm::create_provider;
use convexec::runner::ThreadRunner;
use convexec::tools::{ExpandMessageTool, ToolRegistry};
use convexec::triggers::TriggerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load(None)?;
    let _log_guard = convexec::logging::init(&config.logging);

    tracing::info!(version = convexec::VERSION, "starting conversation execution core");

    let pool = convexec::db::open(&config.database.path).await?;
    let config = Arc::new(config);

    let provider = create_provider(&config)?;
    let registry = Arc::new(ToolRegistry::new().register(Arc::new(ExpandMessageTool::new(pool.clone()))));
    let billing = Arc::new(BillingService::new(pool.clone(), &config.billing));

    let webhook_base_url = format!("http://{}:{}", config.server.bind, config.server.port);
    let triggers = Arc::new(TriggerService::new(
        pool.clone(),
        webhook_base_url,
        config.triggers.webhook_secret.clone(),
    ));

    let runner = Arc::new(ThreadRunner::new(pool.clone(), config.clone(), provider, registry, billing.clone()));
    let background = Arc::new(BackgroundRunner::new(runner));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<EnqueuedRun>();
    background.spawn_workers(rx, 4);

    let execution = Arc::new(ExecutionService::new(pool, config.clone(), triggers, billing, tx));
    let state = ExecutionState {
        service: execution,
        webhook_secret: config.triggers.webhook_secret.clone(),
        skew_secs: config.triggers.skew_secs,
    };

    start_server(state, &config.server).await?;
    Ok(())
}
