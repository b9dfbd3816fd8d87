use auth_proxy::config::{Config, ConfigError, ProcessEnv, CONFIG_PATH_VAR};
use auth_proxy::credentials::Credentials;
use auth_proxy::health::{probe, HealthPolicy, PROBE_TIMEOUT};
use auth_proxy::proxy::ProxyServer;
use auth_proxy::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit status for configuration failures detected before listening
const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("auth_proxy=info".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("probe") {
        return run_probe(args.next()).await;
    }

    let config_path = first
        .map(PathBuf::from)
        .or_else(|| std::env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from));

    match run(config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!(error = %e, "Invalid configuration");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref(), &ProcessEnv)?;
    if let Some(path) = &config_path {
        info!(path = %path.display(), "Configuration file loaded");
    }

    let credentials = Arc::new(Credentials::load(&ProcessEnv)?);

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(&config, credentials, shutdown_rx)?;

    // Bind before waiting on signals so a port conflict fails startup
    let listener = tokio::net::TcpListener::bind(server.bind_addr())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", server.bind_addr(), e))?;

    let mut server_handle = tokio::spawn(server.serve(listener));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server_handle => {
            // Server stopped on its own; that's only ever an error
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Proxy server task failed: {}", e)),
            };
        }
    }

    let _ = shutdown_tx.send(true);

    // The server drains its own connections within the grace period
    let deadline = config.shutdown_grace_period() + Duration::from_secs(1);
    match tokio::time::timeout(deadline, server_handle).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => warn!(error = %e, "Proxy server task failed during shutdown"),
        Err(_) => warn!("Proxy server did not stop in time"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// `auth-proxy probe [url]`: exit 0 when the health endpoint answers a healthy status.
///
/// Without a url, the port and health path come from `AUTH_PROXY_CONFIG` and the environment.
async fn run_probe(url: Option<String>) -> ExitCode {
    let url = match url {
        Some(url) => url,
        None => {
            let config_path = std::env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from);
            match Config::load_unvalidated(config_path.as_deref(), &ProcessEnv) {
                Ok(config) => config.local_health_url(),
                Err(e) => {
                    error!(error = %e, "Invalid configuration");
                    return ExitCode::from(EXIT_CONFIG_ERROR);
                }
            }
        }
    };

    let policy = HealthPolicy::default();
    match probe(&url, PROBE_TIMEOUT).await {
        Ok(status) if policy.is_healthy(status) => {
            info!(url, status = status.as_u16(), "Healthy");
            ExitCode::SUCCESS
        }
        Ok(status) => {
            warn!(url, status = status.as_u16(), "Unhealthy status");
            ExitCode::FAILURE
        }
        Err(e) => {
            warn!(url, error = %e, "Probe failed");
            ExitCode::FAILURE
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting auth proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        health_path = %config.server.health_path,
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Server configuration"
    );
    info!(
        backend = ?config.backend.address,
        connect_timeout_secs = config.backend.connect_timeout_secs,
        response_timeout_secs = config.backend.response_timeout_secs,
        max_concurrent = config.backend.max_concurrent,
        "Backend settings"
    );
    info!(
        pool_max_idle = config.backend.pool_max_idle,
        pool_idle_timeout_secs = config.backend.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(realm = %config.auth.realm, credentials = "configured", "Authentication settings");
}
