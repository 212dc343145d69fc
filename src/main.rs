use dockerproxy::admin::{AdminServer, SiteRegistry, PKG_NAME, VERSION};
use dockerproxy::config::Config;
use dockerproxy::docker::DockerConnector;
use dockerproxy::manager::Manager;
use dockerproxy::nginx::NginxUpdater;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockerproxy=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("nginxproxy.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let connector = Arc::new(DockerConnector::new(config.docker.tls_material()));
    let mut manager = Manager::new(config.clone(), connector).await.map_err(|e| {
        error!(host = %config.docker.leader, error = %e, "Leader endpoint unreachable");
        e
    })?;

    manager.register(Arc::new(NginxUpdater::from_config(&config.nginx)?));

    let admin_handle = match &config.admin.socket {
        Some(socket) => {
            let registry = Arc::new(SiteRegistry::new());
            manager.register(registry.clone());
            let admin_server = AdminServer::new(socket, registry, shutdown_rx.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = admin_server.run().await {
                    error!(error = %e, "Admin socket error");
                }
            }))
        }
        None => None,
    };

    let handles = manager.start(shutdown_rx)?;

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or manual refresh (SIGHUP)
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
                    info!("Received SIGHUP, scheduling update");
                    manager.trigger();
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

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting nginx proxy updater");
    info!(
        leader = %config.docker.leader,
        followers = ?config.docker.followers,
        tls = config.docker.tls,
        "Docker endpoints"
    );
    info!(
        config = %config.nginx.config.display(),
        certs = %config.nginx.certs.display(),
        reload = ?config.nginx.reload,
        htpasswd = ?config.nginx.htpasswd,
        syslog = ?config.nginx.syslog,
        "nginx settings"
    );
    info!(
        poll_interval_secs = config.manager.poll_interval_secs,
        debounce_ms = config.manager.debounce_ms,
        ping_interval_secs = config.manager.ping_interval_secs,
        stale_listener_secs = config.manager.stale_listener_secs,
        "Update timing"
    );
    if let Some(socket) = &config.admin.socket {
        info!(path = %socket.display(), "Admin socket enabled");
    }
}
