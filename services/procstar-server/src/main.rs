use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = env::var("PROCSTAR_CONFIG")
        .unwrap_or_else(|_| "/etc/procstar/server.toml".to_owned());
    let config = procstar_server::config::load_config_from_path(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| panic!("loading config '{config_path}': {e}"));

    let server = procstar_server::Server::new(config);
    let addr = server
        .serve()
        .await
        .unwrap_or_else(|e| panic!("failed to start server: {e}"));
    info!(%addr, "procstar server started");

    shutdown_signal().await;
    info!("shutting down");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
