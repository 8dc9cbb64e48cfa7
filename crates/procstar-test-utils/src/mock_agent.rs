//! A minimal WebSocket client that speaks the agent side of the procstar
//! protocol, for driving the server in tests without spawning a real
//! `procstar` binary.
//!
//! Mirrors `rt-test-utils::mock_ws_client::MockWsClient`'s shape
//! (`connect` / `send_message` / `recv_message`), swapped to binary
//! MessagePack framing and the procstar message set.

use std::path::Path;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use procstar_protocol::{
    codec, ConnectionInfo, Message, ProcessInfo, Register, WireFrame,
};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct MockAgent {
    write: futures_util::stream::SplitSink<WsStream, WsMessage>,
    read: futures_util::stream::SplitStream<WsStream>,
}

/// Identity fields a real procstar instance would report at registration.
/// Tests only care about a handful of these; the rest are filled with
/// plausible placeholders.
pub struct AgentIdentity {
    pub conn_id: String,
    pub group_id: String,
    pub pid: u32,
}

impl AgentIdentity {
    pub fn new(conn_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            group_id: group_id.into(),
            pid: 1,
        }
    }
}

impl MockAgent {
    /// Connects to `wss://{host}:{port}`, trusting `server_cert_path` (the
    /// server's own self-signed certificate, as used by the integration test
    /// fixtures) as the sole root.
    pub async fn connect(
        host: &str,
        port: u16,
        server_cert_path: &Path,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let connector = build_connector(server_cert_path)?;
        let url = format!("wss://{host}:{port}/");
        let (ws_stream, _response) =
            tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
                .await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connects and immediately performs the `Register` handshake, returning
    /// once `Registered` is received.
    pub async fn connect_and_register(
        host: &str,
        port: u16,
        server_cert_path: &Path,
        identity: &AgentIdentity,
        access_token: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut agent = Self::connect(host, port, server_cert_path).await?;
        agent
            .send(&Message::Register(Register {
                conn: ConnectionInfo {
                    conn_id: identity.conn_id.clone(),
                    group_id: identity.group_id.clone(),
                    restricted_exe: None,
                },
                proc: ProcessInfo {
                    pid: identity.pid,
                    ppid: 0,
                    uid: 1000,
                    euid: 1000,
                    username: "test".to_owned(),
                    gid: 1000,
                    egid: 1000,
                    groupname: "test".to_owned(),
                    hostname: "mock-agent".to_owned(),
                },
                access_token: access_token.to_owned(),
            }))
            .await?;
        match agent.recv().await? {
            Message::Registered(_) => Ok(agent),
            other => Err(format!("expected Registered, got {other:?}").into()),
        }
    }

    pub async fn send(
        &mut self,
        msg: &Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bytes = codec::encode(msg)?;
        self.write.send(WsMessage::Binary(bytes.into())).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.read.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let (_, msg) = codec::decode(WireFrame::Binary(&data))?;
                    return Ok(msg);
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Sends a raw text frame, which the protocol treats as a violation.
    pub async fn send_text(
        &mut self,
        text: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write.send(WsMessage::Text(text.to_owned().into())).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write.send(WsMessage::Close(None)).await?;
        Ok(())
    }
}

fn build_connector(
    server_cert_path: &Path,
) -> Result<Connector, Box<dyn std::error::Error + Send + Sync>> {
    let cert_pem = std::fs::read(server_cert_path)?;
    let mut reader = std::io::Cursor::new(cert_pem);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}
