//! Tracing subscriber setup.
//!
//! Grounded: the teacher (`opencrabs`) depends on `tracing` +
//! `tracing-subscriber` (env-filter, json) + `tracing-appender` but ships no
//! `logging.rs` in the retrieval pack; this follows the conventional layered
//! setup those crates are built for — an `EnvFilter` plus a human layer on
//! stderr and an optional JSON layer on a daily-rotated file.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber. Call once at process start.
///
/// Returns the file-appender guard; drop it only at shutdown or buffered log
/// lines are lost.
pub fn init(cfg: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    match &cfg.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "convexec.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let json_layer = fmt::layer().json().with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(json_layer)
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
