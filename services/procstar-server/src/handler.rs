//! Connection Handler: the per-socket state machine
//! `AwaitRegister -> Registered -> Reading -> Closed`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use procstar_protocol::{codec, Message, ProtocolError, Registered, WireFrame};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::registry::{Connection, ConnectionRegistry};
use crate::tracker::ProcessTracker;
use crate::transport::ServerStream;

/// Drives one accepted TLS socket through registration and its receive loop.
/// Never panics on a malformed frame or misbehaving peer — every failure
/// mode closes this socket and returns.
pub async fn handle_connection(
    tls_stream: ServerStream,
    peer_addr: SocketAddr,
    registry: ConnectionRegistry,
    tracker: Arc<ProcessTracker>,
    config: Arc<ServerConfig>,
) {
    let ws = match tokio_tungstenite::accept_async(tls_stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (write, mut read) = ws.split();

    let login_timeout = Duration::from_secs(config.login_timeout_s);
    let register = match tokio::time::timeout(login_timeout, read.next()).await {
        Err(_) => {
            warn!(%peer_addr, "login timed out waiting for Register");
            return;
        }
        Ok(None) => {
            warn!(%peer_addr, "socket closed before Register");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!(%peer_addr, error = %e, "transport error awaiting Register");
            return;
        }
        Ok(Some(Ok(WsMessage::Text(_)))) => {
            warn!(%peer_addr, "text frame sent as first message, protocol violation");
            return;
        }
        Ok(Some(Ok(WsMessage::Binary(data)))) => match codec::decode(WireFrame::Binary(&data)) {
            Ok((_, Message::Register(reg))) => reg,
            Ok((tag, _)) => {
                warn!(%peer_addr, tag, "expected Register as first message");
                return;
            }
            Err(e) => {
                warn!(%peer_addr, error = %e, "codec error awaiting Register");
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            warn!(%peer_addr, "non-binary control frame sent as first message");
            return;
        }
    };

    if !config.access_token.is_empty() && register.access_token != config.access_token {
        warn!(%peer_addr, conn_id = %register.conn.conn_id, "access token mismatch");
        return;
    }

    let conn_id = register.conn.conn_id.clone();
    let existing = registry.get(&conn_id).await;
    let (conn, generation) = match existing {
        None => {
            let conn = Connection::new(
                conn_id.clone(),
                register.conn.group_id.clone(),
                peer_addr,
                register.proc.clone(),
                register.conn.restricted_exe.clone(),
                write,
            );
            registry.add(Arc::clone(&conn)).await;
            info!(%peer_addr, conn_id = %conn_id, group_id = %conn.group_id, "connection registered");
            (conn, 0)
        }
        Some(conn) => {
            if conn.group_id != register.conn.group_id {
                error!(
                    %peer_addr, conn_id = %conn_id,
                    stored_group = %conn.group_id, requested_group = %register.conn.group_id,
                    "rejecting reconnect with mismatched group_id"
                );
                let mut write = write;
                use futures_util::SinkExt;
                let _ = write.close().await;
                return;
            }

            let prior_snapshot = conn.snapshot().await;
            if prior_snapshot.info != peer_addr {
                warn!(
                    %peer_addr, conn_id = %conn_id,
                    prior_addr = %prior_snapshot.info,
                    "agent reconnected from a different address"
                );
            }
            if conn.is_open().await {
                warn!(conn_id = %conn_id, "existing socket still open on rebind, closing it");
            }

            let (old_socket, generation) = conn
                .rebind(
                    peer_addr,
                    register.proc.clone(),
                    register.conn.restricted_exe.clone(),
                    write,
                )
                .await;
            if let Some(mut old) = old_socket {
                use futures_util::SinkExt;
                let _ = old.close().await;
            }
            info!(%peer_addr, conn_id = %conn_id, "connection rebound");
            (conn, generation)
        }
    };

    if let Err(e) = conn.send(&Message::Registered(Registered {})).await {
        warn!(conn_id = %conn_id, error = %e, "failed to send Registered ack");
    }

    loop {
        match read.next().await {
            Some(Ok(WsMessage::Binary(data))) => match codec::decode(WireFrame::Binary(&data)) {
                Ok((tag, msg)) => {
                    if let Message::ProcidList(ref list) = msg {
                        conn.record_list(list.proc_ids.clone());
                    }
                    tracker.on_message(&conn_id, &tag, msg).await;
                }
                Err(ProtocolError::WrongFrameType) => unreachable!("binary frame can't be WrongFrameType"),
                Err(e) => warn!(conn_id = %conn_id, error = %e, "codec error, continuing"),
            },
            Some(Ok(WsMessage::Text(_))) => {
                warn!(conn_id = %conn_id, "text frame in receive loop, ignoring");
            }
            Some(Ok(WsMessage::Close(_))) => {
                info!(conn_id = %conn_id, "peer sent Close");
                break;
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Frame(_))) => {}
            Some(Err(e)) => {
                warn!(conn_id = %conn_id, error = %e, "transport error, closing");
                break;
            }
            None => {
                info!(conn_id = %conn_id, "connection stream ended");
                break;
            }
        }
    }

    conn.close_if_current(generation).await;
}
