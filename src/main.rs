//! Shroud Stealth Reverse Proxy - Entry Point
//!
//! Starts the proxy server and the statistics server with graceful shutdown
//! support.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shroud::proxy::{HttpTransport, Proxy, ProxyOptions, StealthTransport, Transport};
use shroud::stats::{StatsCollector, StatsServer};
use shroud::{tls, Config};

#[tokio::main]
async fn main() -> shroud::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shroud=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Shroud");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    let mut targets = config.targets();
    if targets.is_empty() {
        error!("No targets configured; set SHROUD_TARGETS (prefix=origin,...)");
        return Err(shroud::ShroudError::InvalidConfig(
            "no targets configured".into(),
        ));
    }

    // Register statistics hooks before proxy construction
    let collector = StatsCollector::new(Duration::from_secs(config.stats.window_secs));
    if config.stats.enabled {
        for target in &mut targets {
            collector.register(target);
        }
    }

    let transport: Arc<dyn Transport> = Arc::new(StealthTransport::over(
        HttpTransport::new(),
        config.stealth_config(),
    ));

    let tls_identity = if config.proxy.tls_enabled {
        info!("Generating self-signed certificate for {:?}", config.proxy.tls_hosts);
        Some(tls::generate_identity(&config.proxy.tls_hosts)?)
    } else {
        None
    };

    let proxy = Proxy::new(
        targets,
        ProxyOptions {
            port: config.proxy.port,
            transport: Some(transport),
            tls: tls_identity,
        },
    )?;
    proxy.bind().await?;
    info!("Proxy bound on {}", proxy.addr());

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    let proxy_task = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            if let Err(e) = proxy.serve().await {
                error!("Proxy server error: {}", e);
            }
        })
    };

    let stats_task = if config.stats.enabled {
        let stats_server = StatsServer::new(Arc::clone(&collector), config.stats.port);
        let stats_shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = stats_server.run(stats_shutdown).await {
                error!("Stats server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    proxy.shutdown(Duration::from_secs(10)).await;

    let _ = proxy_task.await;
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    info!("Shroud stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
