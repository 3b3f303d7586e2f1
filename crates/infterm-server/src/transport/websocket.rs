//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the upgrade handshake, and captures the
//! request path, query and `Origin` header so the server can authorize the
//! connection. Upgrades for any path other than the configured one get 404.

use futures_util::{SinkExt, StreamExt};
use infterm_core::{BridgeError, BridgeResult, ServerMessage};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Text frames larger than this are dropped.
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Connection parameters from the upgrade URL query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectQuery {
    pub runspace: Option<String>,
    pub session_id: Option<String>,
    pub token: Option<String>,
}

impl ConnectQuery {
    /// Parse `runspace`, `sessionId` and `token`. Empty values count as absent.
    pub fn parse(query: Option<&str>) -> Self {
        let mut parsed = Self::default();
        let Some(query) = query else {
            return parsed;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "runspace" => parsed.runspace = Some(value.into_owned()),
                "sessionId" => parsed.session_id = Some(value.into_owned()),
                "token" => parsed.token = Some(value.into_owned()),
                _ => {}
            }
        }
        parsed
    }
}

/// What the client asked for in the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub query: ConnectQuery,
    pub origin: Option<String>,
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub request: UpgradeRequest,
}

/// Bind and start accepting upgrades on `path`.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    path: String,
) -> BridgeResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BridgeError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, &path).await {
                            Ok((ws_stream, request)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    request,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
    path: &str,
) -> BridgeResult<(WebSocketStream<TcpStream>, UpgradeRequest)> {
    let mut captured = UpgradeRequest::default();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let uri = req.uri();
        if uri.path() != path {
            let mut not_found = ErrorResponse::new(Some("Not found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        captured.query = ConnectQuery::parse(uri.query());
        captured.origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| BridgeError::Transport(format!("WS upgrade failed: {e}")))?;
    Ok((ws_stream, captured))
}

/// Send a protocol message as a text frame.
pub async fn ws_send_message(
    ws: &mut WebSocketStream<TcpStream>,
    msg: &ServerMessage,
) -> BridgeResult<()> {
    let json = msg.to_json()?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| BridgeError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame, ignoring failures.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    let _ = ws.close(None).await;
}

/// Receive the next text frame.
///
/// Returns `None` when the peer closes. Pings are answered; binary frames
/// and oversized text frames are skipped.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> BridgeResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    warn!(len = text.len(), "dropping oversized text frame");
                    continue;
                }
                return Ok(Some(text));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(BridgeError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_query() {
        let q = ConnectQuery::parse(Some("runspace=r1&sessionId=abc&token=t%2B1&x=y"));
        assert_eq!(q.runspace.as_deref(), Some("r1"));
        assert_eq!(q.session_id.as_deref(), Some("abc"));
        assert_eq!(q.token.as_deref(), Some("t+1"));
    }

    #[test]
    fn empty_and_missing_values_are_absent() {
        assert_eq!(ConnectQuery::parse(None), ConnectQuery::default());
        let q = ConnectQuery::parse(Some("runspace=&sessionId"));
        assert_eq!(q, ConnectQuery::default());
    }
}
