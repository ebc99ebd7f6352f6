// Approval workflow server
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use wps_approval::api;
use wps_approval::collaborators::{InMemoryDirectory, LoggingCallback};
use wps_approval::config::EngineConfig;
use wps_approval::escalation::EscalationWatcher;
use wps_approval::logging::{LoggingConfig, init_logging};
use wps_approval::notify::{LogTransport, NotificationDispatcher};
use wps_approval::service::ApprovalService;

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    let logging = if config.log_json {
        LoggingConfig::production()
    } else {
        LoggingConfig::default()
    };
    init_logging(&logging);

    let directory = match &config.directory_file {
        Some(path) => InMemoryDirectory::from_json_file(path)?,
        None => {
            tracing::warn!("APPROVAL_DIRECTORY_FILE not set, company directory is empty");
            InMemoryDirectory::new()
        }
    };

    let db = Arc::new(
        sled::open(&config.db_path)
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let (dispatcher, dispatch_handle) = NotificationDispatcher::spawn(Arc::new(LogTransport), config.retry);
    let service = Arc::new(
        ApprovalService::new(
            db.clone(),
            Arc::new(directory),
            Arc::new(dispatcher),
            Arc::new(LoggingCallback),
        )
        .context("Failed to open approval storage")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let watcher = Arc::new(EscalationWatcher::new(service.clone(), config.escalation.clone())?);
    let watcher_handle = tokio::spawn(watcher.run(config.sweep_interval, stopped(shutdown_rx.clone())));

    let app = api::router(service.clone());
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, db = %config.db_path.display(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(stopped(shutdown_rx))
        .await
        .context("Server error")?;

    watcher_handle.await.ok();
    // queued notifications are best effort once the server is down
    dispatch_handle.abort();
    db.flush_async().await.context("Failed to flush database")?;
    tracing::info!("Shut down");
    Ok(())
}
