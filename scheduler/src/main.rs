// Scheduler binary entry point

use anyhow::Context;
use common::config::Settings;
use common::notification::NotificationDispatcher;
use common::scheduler::ScheduleManager;
use common::store::JsonFileStore;
use common::telemetry;
use common::worker::ProcessLauncher;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Register for Ctrl+C and SIGTERM. The returned future resolves with
/// whichever arrives first.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ShutdownSignal>> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => ShutdownSignal::Interrupt,
            _ = terminate => ShutdownSignal::Terminate,
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        store_path = %settings.scheduler.store_path,
        worker = %settings.worker.program,
        "Starting migration scheduler"
    );

    let store = Arc::new(JsonFileStore::new(&settings.scheduler.store_path));
    let launcher = Arc::new(ProcessLauncher::new(
        &settings.worker,
        &settings.scheduler.log_dir,
    ));
    let notifier = Arc::new(
        NotificationDispatcher::from_config(&settings.notification)
            .context("Failed to set up notifications")?,
    );

    let manager = ScheduleManager::load(store, launcher, notifier)
        .await
        .context("Failed to load job store")?;
    let shutdown = shutdown_signal().context("Failed to install signal handlers")?;
    manager.start_all().await;
    info!(armed = manager.armed_jobs().await.len(), "Scheduler running");

    let signal = shutdown.await;
    info!(signal = ?signal, "Shutdown signal received");

    manager.shutdown().await;
    telemetry::shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let shutdown = shutdown_signal().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Terminate);
    }
}
