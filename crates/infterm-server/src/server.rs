//! Core server: accepts WebSocket connections and binds them to sessions.
//!
//! Owns the session registry, the connection gate, and the command filter.
//! Each connection is admitted, attached to a new or existing session, and
//! then relays frames in both directions until either side goes away.

use crate::auth::ConnectionGate;
use crate::config::ServerConfig;
use crate::events::{BridgeEvent, EventSink};
use crate::runspace::RunspaceResolver;
use crate::session::registry::default_shell;
use crate::session::{
    Binding, Outbound, PtyBackend, RegistrySettings, SessionRegistry, TerminateReason,
};
use crate::transport::websocket::{self, WebSocketConnection};
use infterm_core::{
    BridgeResult, ClientMessage, CommandFilter, OriginPolicy, ServerMessage, TokenManager,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How often expired tokens and rate-limit entries are swept. Shortened to a
/// quarter of the token TTL so the bootstrap token is rotated in time.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

/// The terminal bridge server.
pub struct TerminalServer {
    config: ServerConfig,
    registry: SessionRegistry,
    gate: ConnectionGate,
    filter: CommandFilter,
}

impl TerminalServer {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn PtyBackend>,
        resolver: Arc<dyn RunspaceResolver>,
        events: Arc<dyn EventSink>,
    ) -> BridgeResult<Self> {
        let filter = CommandFilter::with_extra_patterns(&config.extra_deny_patterns)?;
        let tokens = Arc::new(TokenManager::new(config.token_ttl));

        let settings = RegistrySettings {
            max_sessions: config.max_sessions,
            idle_timeout: config.idle_timeout,
            scrollback_bytes: config.scrollback_bytes,
            default_shell: config.shell.clone().unwrap_or_else(default_shell),
            allow_default_shell: config.allow_default_shell,
            cols: config.default_cols,
            rows: config.default_rows,
        };
        let registry = SessionRegistry::new(settings, backend, resolver, tokens.clone(), events);

        let gate = ConnectionGate::new(
            OriginPolicy::new(&config.allowed_origins),
            tokens,
            config.require_token,
            config.max_connects_per_minute,
        );

        info!(
            deny_rules = filter.rule_count(),
            require_token = config.require_token,
            max_sessions = config.max_sessions,
            "terminal server configured"
        );

        Ok(Self {
            config,
            registry,
            gate,
            filter,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The bootstrap token operators hand to a first client, once serving.
    pub fn bootstrap_token(&self) -> Option<String> {
        self.gate.bootstrap_token()
    }

    /// Bind the configured address.
    pub async fn listen(
        &self,
    ) -> BridgeResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        websocket::start_listener(addr, self.config.path.clone()).await
    }

    /// Bind and serve until the listener stops.
    pub async fn run(self: Arc<Self>) -> BridgeResult<()> {
        let (addr, rx) = self.listen().await?;
        info!(
            addr = %addr,
            path = %self.config.path,
            "infterm-server ready"
        );
        self.serve(rx).await;
        Ok(())
    }

    /// Handle connections from `rx` until it closes.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<WebSocketConnection>) {
        let maintenance = self.clone();
        let period = MAINTENANCE_INTERVAL
            .min(self.config.token_ttl / 4)
            .max(MIN_MAINTENANCE_INTERVAL);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                maintenance.gate.refresh_bootstrap();
                maintenance.gate.sweep();
                for session in maintenance.registry.list().await {
                    debug!(
                        session_id = %session.id,
                        runspace_id = %session.runspace_id,
                        state = session.state.as_str(),
                        age_secs = session.age_secs,
                        idle_secs = session.idle_secs,
                        scrollback_bytes = session.scrollback_bytes,
                        "session status"
                    );
                }
            }
        });

        while let Some(conn) = rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_websocket(conn).await {
                    warn!(error = %e, "WebSocket connection error");
                }
            });
        }

        sweeper.abort();
        info!("listener closed");
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) -> BridgeResult<()> {
        let WebSocketConnection {
            mut ws_stream,
            remote_addr: remote,
            request,
        } = conn;
        let query = request.query;

        if let Err(e) = self.gate.admit(
            remote.ip(),
            request.origin.as_deref(),
            query.token.as_deref(),
        ) {
            warn!(remote = %remote, origin = ?request.origin, error = %e, "connection refused");
            refuse(&mut ws_stream, &e.client_message()).await;
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bound = match query.session_id.as_deref() {
            Some(session_id) => self.registry.attach(session_id, tx).await,
            None => {
                self.registry
                    .create_session(query.runspace.as_deref(), tx)
                    .await
            }
        };
        let binding = match bound {
            Ok(binding) => binding,
            Err(e) => {
                warn!(
                    remote = %remote,
                    runspace = ?query.runspace,
                    session_id = ?query.session_id,
                    error = %e,
                    "could not bind session"
                );
                refuse(&mut ws_stream, &e.client_message()).await;
                return Ok(());
            }
        };

        info!(
            remote = %remote,
            session_id = %binding.session_id,
            restored = binding.restored,
            "WebSocket session bound"
        );

        let hello = ServerMessage::Session {
            session_id: binding.session_id.clone(),
            restored: binding.restored,
            token: binding.token.clone(),
        };
        let result = match websocket::ws_send_message(&mut ws_stream, &hello).await {
            Ok(()) => self.session_loop(&mut ws_stream, &binding, &mut rx).await,
            Err(e) => Err(e),
        };

        // No-op if the session already terminated.
        self.registry
            .detach(&binding.session_id, binding.attachment_id)
            .await;
        result
    }

    async fn session_loop(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        binding: &Binding,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> BridgeResult<()> {
        let mut replayed = false;

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(Outbound::Message(msg)) => {
                            websocket::ws_send_message(ws, &msg).await?;
                        }
                        Some(Outbound::Close) | None => {
                            websocket::ws_close(ws).await;
                            break;
                        }
                    }
                }

                incoming = websocket::ws_recv_text(ws) => {
                    match incoming {
                        Ok(Some(text)) => {
                            if let Some(reply) = self.dispatch(&text, binding, &mut replayed).await {
                                websocket::ws_send_message(ws, &reply).await?;
                            }
                        }
                        Ok(None) => {
                            debug!(session_id = %binding.session_id, "WebSocket closed by peer");
                            break;
                        }
                        Err(e) => {
                            debug!(session_id = %binding.session_id, error = %e, "WebSocket ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply one client frame. Returns a reply for this socket, if any.
    async fn dispatch(
        &self,
        text: &str,
        binding: &Binding,
        replayed: &mut bool,
    ) -> Option<ServerMessage> {
        let session_id = binding.session_id.as_str();
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(session_id, error = %e, "ignoring malformed message");
                return None;
            }
        };

        let result = match msg {
            ClientMessage::Input { data } => {
                self.registry.write_input(session_id, data.as_bytes()).await
            }
            ClientMessage::Resize { cols, rows } => {
                self.registry.resize(session_id, cols, rows).await
            }
            ClientMessage::Execute { command } => {
                let verdict = self.filter.check(&command);
                if verdict.blocked {
                    let reason = verdict
                        .reason
                        .unwrap_or_else(|| "matched deny list".to_string());
                    self.registry.emit(BridgeEvent::CommandBlocked {
                        session_id: session_id.to_string(),
                        reason: reason.clone(),
                    });
                    return Some(ServerMessage::security_notice(&reason));
                }
                let mut line = command;
                line.push('\n');
                self.registry.write_input(session_id, line.as_bytes()).await
            }
            ClientMessage::Ready => {
                if *replayed {
                    Ok(())
                } else {
                    *replayed = true;
                    self.registry
                        .replay(session_id, binding.attachment_id)
                        .await
                        .map(|bytes| debug!(session_id, bytes, "replayed scrollback"))
                }
            }
            ClientMessage::Close => {
                self.registry
                    .terminate(session_id, TerminateReason::ClientClosed)
                    .await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(session_id, error = %e, "failed to apply client message");
        }
        None
    }
}

/// Send an error frame and close.
async fn refuse(ws: &mut WebSocketStream<TcpStream>, reason: &str) {
    let _ = websocket::ws_send_message(ws, &ServerMessage::error(reason)).await;
    websocket::ws_close(ws).await;
}
