//! Shared transport type aliases: TLS-terminated TCP wrapped in a WebSocket.

use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

pub type ServerStream = TlsStream<TcpStream>;
pub type ServerWs = WebSocketStream<ServerStream>;
pub type WsSink = SplitSink<ServerWs, WsMessage>;
