//! Ties together the TCP accept loop, TLS termination, and per-socket
//! handler spawning.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::handler;
use crate::registry::ConnectionRegistry;
use crate::tls;
use crate::tracker::ProcessTracker;

/// A running server instance: the registry, tracker, and dispatcher, plus
/// the bound address once `serve` has started listening.
pub struct Server {
    pub config: Arc<ServerConfig>,
    pub dispatcher: Dispatcher,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let registry = ConnectionRegistry::new();
        let tracker = Arc::new(ProcessTracker::new());
        let dispatcher = Dispatcher::new(registry, tracker, &config);
        Self { config, dispatcher }
    }

    /// Binds `config.bind_addr()`, wraps it in TLS, and drives the accept
    /// loop until the process is killed. Returns the bound address (useful
    /// in tests that bind to port 0).
    pub async fn serve(&self) -> std::io::Result<std::net::SocketAddr> {
        let acceptor = tls::build_acceptor(&self.config.tls_cert, &self.config.tls_key)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "procstar server listening");

        let registry = self.dispatcher.registry().clone();
        let tracker = self.dispatcher.tracker_handle();
        let config = Arc::clone(&self.config);

        tokio::spawn(accept_loop(listener, acceptor, registry, tracker, config));
        Ok(local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: ConnectionRegistry,
    tracker: Arc<ProcessTracker>,
    config: Arc<ServerConfig>,
) {
    loop {
        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let registry = registry.clone();
        let tracker = Arc::clone(&tracker);
        let config = Arc::clone(&config);

        tokio::spawn(async move {
            match acceptor.accept(tcp_stream).await {
                Ok(tls_stream) => {
                    handler::handle_connection(tls_stream, peer_addr, registry, tracker, config)
                        .await;
                }
                Err(e) => {
                    warn!(%peer_addr, error = %e, "TLS handshake failed");
                }
            }
        });
    }
}
