//! Netpulse - network metrics aggregation and alerting daemon
//!
//! Accepts metric samples over HTTP, maintains anomaly baselines and flow
//! correlations, evaluates alert rules and delivers notifications.

use anyhow::{Context, Result};
use engine_lib::{
    alerting::{read_rule_file, RuleFileWatcher, WatcherHandle},
    dispatch::{LogChannel, NotificationChannel, WebhookChannel},
    EngineHandle, MetricsEngine,
};
use netpulse::{
    api,
    config::{EngineSettings, LogFormat},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let settings = EngineSettings::load()?;
    init_tracing(settings.log_format);

    info!(instance = %settings.instance, "Starting netpulse");

    let channel = notification_channel(&settings)?;
    let engine = Arc::new(MetricsEngine::new(settings.engine_config(), channel));
    let logger = engine.logger().clone();

    let rules_loaded = load_initial_rules(&engine, &settings);

    let handle = EngineHandle::start(engine.clone()).await;
    logger.log_startup(ENGINE_VERSION, rules_loaded);

    let _watcher = start_rule_watcher(&engine, &settings, &handle)?;

    let state = Arc::new(
        api::AppState::new(engine.clone()).with_sample_sender(handle.sample_sender()),
    );
    let api_handle = tokio::spawn(api::serve(
        settings.api_port,
        state,
        handle.subscribe_shutdown(),
    ));

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    info!("Shutting down");

    handle.shutdown(settings.shutdown_grace()).await;
    match tokio::time::timeout(Duration::from_secs(5), api_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "API server exited with error"),
        Ok(Err(e)) => warn!(error = %e, "API server task failed"),
        Err(_) => warn!("API server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

fn notification_channel(settings: &EngineSettings) -> Result<Arc<dyn NotificationChannel>> {
    match &settings.webhook_url {
        Some(url) => {
            let channel = WebhookChannel::new(url.clone(), settings.webhook_timeout())
                .context("Failed to build webhook client")?;
            info!(url = %url, "Delivering notifications to webhook");
            Ok(Arc::new(channel))
        }
        None => {
            info!("No webhook configured, notifications go to the log");
            Ok(Arc::new(LogChannel))
        }
    }
}

/// Startup load keeps every valid rule; unreadable files start the engine empty
fn load_initial_rules(engine: &MetricsEngine, settings: &EngineSettings) -> usize {
    let Some(path) = &settings.rules_path else {
        info!("No rule file configured");
        return 0;
    };

    match read_rule_file(path) {
        Ok(defs) => {
            // Rejected definitions are logged by the rule engine
            engine.load_rules(&defs);
            engine.rule_engine().rules().len()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read rule file, starting without rules");
            0
        }
    }
}

fn start_rule_watcher(
    engine: &Arc<MetricsEngine>,
    settings: &EngineSettings,
    handle: &EngineHandle,
) -> Result<Option<WatcherHandle>> {
    let Some(path) = settings.rules_path.clone().filter(|_| settings.watch_rules) else {
        return Ok(None);
    };

    let engine = engine.clone();
    let watcher = RuleFileWatcher::new(path).start(
        move |changed| {
            // Rejections are logged and counted by the engine
            if engine.reload_rules_from_file().is_ok() {
                info!(path = %changed.display(), "Rule file reloaded");
            }
        },
        handle.subscribe_shutdown(),
    )?;
    Ok(Some(watcher))
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = term.recv() => "SIGTERM received",
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}
