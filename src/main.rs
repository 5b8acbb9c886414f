use hotgate::config::Config;
use hotgate::listener::Listener;
use hotgate::server::{Server, SyncTask};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hotgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hotgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    info!(
        name = %config.server.name,
        router_dir = %config.server.router_dir,
        handler_dir = %config.server.handler_dir,
        vhosts = config.vhosts.len(),
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let server = Arc::new(Server::from_config(&config)?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_task = SyncTask::new(
        Arc::clone(&server),
        config.server.sync_interval(),
        shutdown_rx.clone(),
    );
    let sync_handle = tokio::spawn(sync_task.run());

    let listener = Listener::bind(&config.server.listen_addr(), Arc::clone(&server), shutdown_rx).await?;
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!(error = %e, "Listener error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP forces a sync sweep
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, syncing caches...");
                    let server = Arc::clone(&server);
                    match tokio::task::spawn_blocking(move || server.sync_once()).await {
                        Ok((routers, handles)) => info!(?routers, ?handles, "Caches synced"),
                        Err(e) => error!(error = %e, "Cache sync failed"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    let _ = listener_handle.await;
    let _ = sync_handle.await;

    server.shutdown();
    info!("Shutdown complete");

    Ok(())
}
