/// Logging and event export.
///
/// Logs go to stderr, or to a daily-rotated `escalate.log` under `log_dir`
/// when one is configured. Panics are routed through `tracing` so they land
/// in the same place. Per-path escalation events can additionally be shipped
/// to a Sumo Logic HTTP source.
use crate::{
    engine::{EscalationEvent, EventSink},
    http,
};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "escalate=debug" } else { "escalate=info" }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let guard = match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Could not create log directory {}: {}", dir.display(), e);
            }
            let file_appender = tracing_appender::rolling::daily(dir, "escalate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false) // log files should not contain ANSI colour codes
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    install_panic_hook();
    guard
}

/// Log panics through tracing before the process dies.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        tracing::error!("PANIC at {}: {}", location, message);
    }));
}

// ---------------------------------------------------------------------------
// Sumo Logic
// ---------------------------------------------------------------------------

pub struct SumoLogicSink {
    agent:    ureq::Agent,
    endpoint: String,
}

impl SumoLogicSink {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self { agent: http::agent(timeout), endpoint }
    }
}

#[async_trait]
impl EventSink for SumoLogicSink {
    async fn record(&self, event: &EscalationEvent) {
        let body = match serde_json::to_value(event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Could not serialise escalation event: {}", e);
                return;
            }
        };
        let agent    = self.agent.clone();
        let endpoint = self.endpoint.clone();

        let sent = tokio::task::spawn_blocking(move || http::post_json(&agent, &endpoint, None, &body)).await;
        match sent {
            Ok(Ok(_))  => tracing::debug!("Shipped escalation event for {}", event.issue_key),
            Ok(Err(e)) => tracing::error!("Sumo Logic rejected escalation event: {}", e),
            Err(e)     => tracing::error!("Sumo Logic task failed: {}", e),
        }
    }
}
