//! Builds the `TlsAcceptor` the accept loop wraps every inbound TCP socket
//! in before handing it to the WebSocket handshake.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::ConfigError;

pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::InvalidValue(format!("building TLS server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ConfigError::Io(format!("reading TLS cert '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidValue(format!("parsing TLS cert '{path}': {e}")))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ConfigError::Io(format!("reading TLS key '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::InvalidValue(format!("parsing TLS key '{path}': {e}")))?
        .ok_or_else(|| ConfigError::InvalidValue(format!("no private key found in '{path}'")))
}
