//! Server configuration loading.
//!
//! TOML is the sole config source, plus `RUST_LOG` for the log filter.
//! Default config path: `/etc/procstar/server.toml`.
//!
//! # Token resolution
//! `[auth] token_file` (a path to a file containing the raw token, trimmed)
//! takes precedence over `[auth] token` (inline). Neither set means auth is
//! disabled.

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

/// Validated, defaulted server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub access_token: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub login_timeout_s: u64,
    pub dispatch_retry_max: u32,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    tls: Option<RawTlsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    login_timeout_s: Option<u64>,
    dispatch_retry_max: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token: Option<String>,
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTlsConfig {
    cert_path: Option<String>,
    key_path: Option<String>,
}

/// Loads config from the default path `/etc/procstar/server.toml`.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/procstar/server.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_server = raw.server.unwrap_or(RawServerConfig {
        host: None,
        port: None,
        login_timeout_s: None,
        dispatch_retry_max: None,
    });
    let host = raw_server.host.unwrap_or_else(|| "0.0.0.0".to_owned());
    let port = raw_server
        .port
        .unwrap_or(procstar_protocol::DEFAULT_PORT);
    let login_timeout_s = raw_server.login_timeout_s.unwrap_or(60);
    let dispatch_retry_max = raw_server.dispatch_retry_max.unwrap_or(3);

    let access_token = match raw.auth {
        Some(RawAuthConfig {
            token_file: Some(path),
            ..
        }) => read_token_file(&path)?,
        Some(RawAuthConfig {
            token: Some(token), ..
        }) => token,
        _ => String::new(),
    };

    let raw_tls = raw
        .tls
        .ok_or_else(|| ConfigError::MissingField("tls".to_owned()))?;
    let tls_cert = raw_tls
        .cert_path
        .ok_or_else(|| ConfigError::MissingField("tls.cert_path".to_owned()))?;
    let tls_key = raw_tls
        .key_path
        .ok_or_else(|| ConfigError::MissingField("tls.key_path".to_owned()))?;

    Ok(ServerConfig {
        host,
        port,
        access_token,
        tls_cert,
        tls_key,
        login_timeout_s,
        dispatch_retry_max,
    })
}

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}
