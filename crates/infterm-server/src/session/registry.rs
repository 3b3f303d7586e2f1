//! Session lifecycle management.
//!
//! Tracks all live sessions and moves them between attached and detached.
//! Termination has four causes: the shell exiting, the idle timer firing,
//! an explicit client close, or server shutdown.
//!
//! Each session owns its PTY control handle and scrollback. A per-session
//! pump task drains the PTY event channel in order, appending to scrollback
//! and forwarding to the attached connection under the registry lock, so the
//! live stream and later snapshots agree on ordering.

use super::pty::{
    ExitStatus, OutputDecoder, PtyBackend, PtyControl, PtyEvent, SpawnRequest, HANGUP_SIGNAL,
};
use super::scrollback::Scrollback;
use crate::events::{BridgeEvent, EventSink};
use crate::runspace::{Runspace, RunspaceResolver};
use infterm_core::{generate_hex_id, BridgeError, BridgeResult, ServerMessage, TokenManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Frames queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Send a close frame and stop.
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Attached,
    Detached,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Attached => "attached",
            SessionState::Detached => "detached",
            SessionState::Terminated => "terminated",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    ProcessExited(ExitStatus),
    IdleTimeout,
    ClientClosed,
    Shutdown,
}

impl TerminateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminateReason::ProcessExited(_) => "process_exited",
            TerminateReason::IdleTimeout => "idle_timeout",
            TerminateReason::ClientClosed => "client_closed",
            TerminateReason::Shutdown => "shutdown",
        }
    }

    /// Status reported in the `exit` frame.
    fn exit_status(&self) -> ExitStatus {
        match self {
            TerminateReason::ProcessExited(status) => *status,
            _ => ExitStatus {
                code: 0,
                signal: HANGUP_SIGNAL,
            },
        }
    }
}

/// The connection currently bound to a session.
struct Attachment {
    id: u64,
    tx: OutboundTx,
}

/// One logical terminal.
struct Session {
    runspace_id: String,
    /// `None` only once terminated.
    pty: Option<Arc<dyn PtyControl>>,
    scrollback: Scrollback,
    state: SessionState,
    attachment: Option<Attachment>,
    /// Set iff `state == Detached`.
    cleanup_timer: Option<AbortHandle>,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    fn control(&self, session_id: &str) -> BridgeResult<Arc<dyn PtyControl>> {
        self.pty
            .clone()
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }
}

/// Information returned when listing sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub runspace_id: String,
    pub state: SessionState,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub scrollback_bytes: usize,
}

/// Result of binding a connection to a session.
#[derive(Debug, Clone)]
pub struct Binding {
    pub session_id: String,
    pub token: String,
    pub attachment_id: u64,
    pub restored: bool,
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub scrollback_bytes: usize,
    /// Shell for runspaces that do not name one.
    pub default_shell: String,
    /// Fall back to the home-directory context when no runspace resolves.
    pub allow_default_shell: bool,
    pub cols: u16,
    pub rows: u16,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            idle_timeout: Duration::from_secs(300),
            scrollback_bytes: 100 * 1024,
            default_shell: default_shell(),
            allow_default_shell: true,
            cols: 80,
            rows: 24,
        }
    }
}

/// The user's login shell, or `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

struct Inner {
    sessions: RwLock<HashMap<String, Session>>,
    backend: Arc<dyn PtyBackend>,
    resolver: Arc<dyn RunspaceResolver>,
    tokens: Arc<TokenManager>,
    events: Arc<dyn EventSink>,
    settings: RegistrySettings,
    next_attachment: AtomicU64,
}

/// Owns every live session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(
        settings: RegistrySettings,
        backend: Arc<dyn PtyBackend>,
        resolver: Arc<dyn RunspaceResolver>,
        tokens: Arc<TokenManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                backend,
                resolver,
                tokens,
                events,
                settings,
                next_attachment: AtomicU64::new(1),
            }),
        }
    }

    /// Create a session for `runspace_id` and bind `tx` to it.
    ///
    /// Without a runspace id the active runspace is used, then the default
    /// shell context if allowed. Nothing is registered on failure.
    pub async fn create_session(
        &self,
        runspace_id: Option<&str>,
        tx: OutboundTx,
    ) -> BridgeResult<Binding> {
        let runspace = self.resolve(runspace_id).await?;
        let settings = &self.inner.settings;
        let request = SpawnRequest {
            shell: runspace
                .shell
                .clone()
                .unwrap_or_else(|| settings.default_shell.clone()),
            cwd: runspace.path.clone(),
            env: runspace.env.clone(),
            cols: settings.cols,
            rows: settings.rows,
        };

        // Spawn and insert under one guard: no other creation can interleave.
        let mut sessions = self.inner.sessions.write().await;
        if sessions.len() >= settings.max_sessions {
            return Err(BridgeError::SessionLimitReached(settings.max_sessions));
        }
        let spawned = self.inner.backend.spawn(&request)?;

        let mut session_id = generate_hex_id();
        while sessions.contains_key(&session_id) {
            session_id = generate_hex_id();
        }
        let token = self.inner.tokens.issue(&session_id);
        let attachment_id = self.next_attachment_id();
        let now = Instant::now();
        sessions.insert(
            session_id.clone(),
            Session {
                runspace_id: runspace.id.clone(),
                pty: Some(spawned.control),
                scrollback: Scrollback::new(settings.scrollback_bytes),
                state: SessionState::Attached,
                attachment: Some(Attachment {
                    id: attachment_id,
                    tx,
                }),
                cleanup_timer: None,
                created_at: now,
                last_activity: now,
            },
        );
        drop(sessions);

        tokio::spawn(self.clone().pump(session_id.clone(), spawned.events));

        info!(
            session_id = %session_id,
            runspace_id = %runspace.id,
            pid = spawned.pid.unwrap_or(0),
            "session created"
        );
        self.emit(BridgeEvent::SessionCreated {
            session_id: session_id.clone(),
            runspace_id: runspace.id,
        });

        Ok(Binding {
            session_id,
            token,
            attachment_id,
            restored: false,
        })
    }

    async fn resolve(&self, runspace_id: Option<&str>) -> BridgeResult<Runspace> {
        match runspace_id {
            Some(id) => self
                .inner
                .resolver
                .get_runspace(id)
                .await
                .ok_or_else(|| BridgeError::RunspaceNotFound(id.to_string())),
            None => match self.inner.resolver.get_active_runspace().await {
                Some(runspace) => Ok(runspace),
                None if self.inner.settings.allow_default_shell => Ok(Runspace::default_context()),
                None => Err(BridgeError::RunspaceNotFound("no active runspace".into())),
            },
        }
    }

    /// Bind `tx` to an existing session, cancelling its cleanup timer.
    pub async fn attach(&self, session_id: &str, tx: OutboundTx) -> BridgeResult<Binding> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        if session.attachment.is_some() {
            return Err(BridgeError::SessionBusy(session_id.to_string()));
        }

        if let Some(timer) = session.cleanup_timer.take() {
            timer.abort();
        }
        let attachment_id = self.next_attachment_id();
        session.attachment = Some(Attachment {
            id: attachment_id,
            tx,
        });
        session.state = SessionState::Attached;
        session.last_activity = Instant::now();
        drop(sessions);

        let token = self.inner.tokens.issue(session_id);
        info!(session_id, attachment_id, "client attached");
        self.emit(BridgeEvent::SessionAttached {
            session_id: session_id.to_string(),
        });

        Ok(Binding {
            session_id: session_id.to_string(),
            token,
            attachment_id,
            restored: true,
        })
    }

    /// Unbind a connection and start the idle timer. The PTY keeps running.
    ///
    /// Ignored unless `attachment_id` is the current attachment.
    pub async fn detach(&self, session_id: &str, attachment_id: u64) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if !matches!(&session.attachment, Some(a) if a.id == attachment_id) {
            return false;
        }

        session.attachment = None;
        session.state = SessionState::Detached;
        session.last_activity = Instant::now();

        let registry = self.clone();
        let id = session_id.to_string();
        let idle = self.inner.settings.idle_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            registry.expire_idle(&id).await;
        });
        session.cleanup_timer = Some(timer.abort_handle());
        drop(sessions);

        info!(session_id, idle_timeout_secs = idle.as_secs(), "client detached");
        self.emit(BridgeEvent::SessionDetached {
            session_id: session_id.to_string(),
        });
        true
    }

    async fn expire_idle(&self, session_id: &str) {
        let expired = {
            let mut sessions = self.inner.sessions.write().await;
            let detached = matches!(
                sessions.get(session_id),
                Some(session) if session.state == SessionState::Detached
            );
            if detached {
                sessions.remove(session_id).map(|mut session| {
                    // This task is the timer; drop the handle instead of aborting it.
                    session.cleanup_timer = None;
                    session
                })
            } else {
                None
            }
        };
        if let Some(session) = expired {
            self.finish(session_id, session, TerminateReason::IdleTimeout);
        }
    }

    /// End a session now. Returns `false` if it was already gone.
    pub async fn terminate(&self, session_id: &str, reason: TerminateReason) -> bool {
        let removed = self.inner.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                self.finish(session_id, session, reason);
                true
            }
            None => false,
        }
    }

    /// Release everything a removed session owns.
    fn finish(&self, session_id: &str, mut session: Session, reason: TerminateReason) {
        if let Some(timer) = session.cleanup_timer.take() {
            timer.abort();
        }
        session.state = SessionState::Terminated;

        if let Some(pty) = session.pty.take() {
            if !matches!(reason, TerminateReason::ProcessExited(_)) {
                if let Err(e) = pty.kill() {
                    warn!(session_id, error = %e, "failed to kill PTY");
                }
            }
        }

        if let Some(attachment) = session.attachment.take() {
            let status = reason.exit_status();
            let _ = attachment.tx.send(Outbound::Message(ServerMessage::Exit {
                exit_code: status.code,
                signal: status.signal,
            }));
            let _ = attachment.tx.send(Outbound::Close);
        }

        info!(
            session_id,
            reason = reason.as_str(),
            age_secs = session.created_at.elapsed().as_secs(),
            "session terminated"
        );
        self.emit(BridgeEvent::SessionTerminated {
            session_id: session_id.to_string(),
            reason: reason.as_str().to_string(),
        });
    }

    /// Drain one session's PTY events until the shell exits.
    async fn pump(self, session_id: String, mut events: mpsc::UnboundedReceiver<PtyEvent>) {
        let mut decoder = OutputDecoder::default();
        let mut status = ExitStatus { code: -1, signal: 0 };

        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Data(chunk) => {
                    let mut sessions = self.inner.sessions.write().await;
                    let Some(session) = sessions.get_mut(&session_id) else {
                        break;
                    };
                    session.scrollback.append(&chunk);
                    let text = decoder.decode(&chunk);
                    if let Some(attachment) = &session.attachment {
                        if !text.is_empty() {
                            let _ = attachment
                                .tx
                                .send(Outbound::Message(ServerMessage::output(text)));
                        }
                    }
                }
                PtyEvent::Exit(exit) => {
                    status = exit;
                    break;
                }
            }
        }

        if self
            .terminate(&session_id, TerminateReason::ProcessExited(status))
            .await
        {
            debug!(session_id = %session_id, code = status.code, "shell exited");
        }
    }

    /// Write raw bytes to the session's PTY.
    ///
    /// The registry lock is released before the write, which runs on the
    /// blocking pool so a shell that stops reading stalls only this caller.
    pub async fn write_input(&self, session_id: &str, data: &[u8]) -> BridgeResult<()> {
        let pty = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
            session.last_activity = Instant::now();
            session.control(session_id)?
        };
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || pty.write(&data))
            .await
            .map_err(|e| BridgeError::Pty(format!("PTY write task failed: {e}")))?
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> BridgeResult<()> {
        let pty = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .get(session_id)
                .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?
                .control(session_id)?
        };
        pty.resize(cols, rows)
    }

    /// Current scrollback as text.
    pub async fn snapshot(&self, session_id: &str) -> BridgeResult<String> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.scrollback.snapshot_text())
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }

    /// Queue the scrollback snapshot to the attached connection.
    ///
    /// Queued under the lock so it cannot overtake later live output.
    /// Returns the number of bytes replayed.
    pub async fn replay(&self, session_id: &str, attachment_id: u64) -> BridgeResult<usize> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        let Some(attachment) = session.attachment.as_ref().filter(|a| a.id == attachment_id)
        else {
            return Ok(0);
        };
        let snapshot = session.scrollback.snapshot_text();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let len = snapshot.len();
        let _ = attachment
            .tx
            .send(Outbound::Message(ServerMessage::output(snapshot)));
        Ok(len)
    }

    /// Snapshot of all sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: id.clone(),
                runspace_id: s.runspace_id.clone(),
                state: s.state,
                age_secs: s.created_at.elapsed().as_secs(),
                idle_secs: s.last_activity.elapsed().as_secs(),
                scrollback_bytes: s.scrollback.len(),
            })
            .collect()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(session_id)
    }

    pub async fn count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Terminate every session. Returns how many were ended.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(String, Session)> =
            self.inner.sessions.write().await.drain().collect();
        let count = drained.len();
        for (id, session) in drained {
            self.finish(&id, session, TerminateReason::Shutdown);
        }
        count
    }

    pub fn emit(&self, event: BridgeEvent) {
        self.inner.events.emit(event);
    }

    fn next_attachment_id(&self) -> u64 {
        self.inner.next_attachment.fetch_add(1, Ordering::Relaxed)
    }
}
