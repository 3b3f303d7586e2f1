//! PTY process adapter.
//!
//! A [`PtyBackend`] spawns one pseudo-terminal per session and hands back a
//! [`PtyControl`] for synchronous write/resize/kill plus an ordered event
//! channel. Every `Data` chunk precedes the single final `Exit`.

use infterm_core::{BridgeError, BridgeResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Signal reported when the bridge itself ends a shell (SIGHUP).
pub const HANGUP_SIGNAL: i32 = 1;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Input writes queued per PTY before `write` reports a backlog.
const INPUT_QUEUE_DEPTH: usize = 64;

/// Chunk size for writes to the PTY master.
const WRITE_CHUNK_SIZE: usize = 4 * 1024;

/// How the shell ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: i32,
}

/// Asynchronous notifications from a PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit(ExitStatus),
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Shell command line, split on whitespace.
    pub shell: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Synchronous control surface of a running PTY.
///
/// `write` must not block on the shell draining its input.
pub trait PtyControl: Send + Sync {
    fn write(&self, data: &[u8]) -> BridgeResult<()>;
    fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()>;
    fn kill(&self) -> BridgeResult<()>;
}

/// A freshly spawned PTY.
pub struct SpawnedPty {
    pub control: Arc<dyn PtyControl>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
    pub pid: Option<u32>,
}

/// Spawns PTY processes.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> BridgeResult<SpawnedPty>;
}

/// OS pseudo-terminals via `portable-pty`.
#[derive(Debug, Default)]
pub struct NativePtyBackend;

struct NativePty {
    /// Feeds the writer thread; the master may block while the shell is not reading.
    input: SyncSender<Vec<u8>>,
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PtyControl for NativePty {
    fn write(&self, data: &[u8]) -> BridgeResult<()> {
        match self.input.try_send(data.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::Pty("input backlog full".into())),
            Err(TrySendError::Disconnected(_)) => Err(BridgeError::Pty("PTY writer closed".into())),
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        lock(&self.master)
            .resize(pty_size(cols, rows))
            .map_err(|e| BridgeError::Pty(format!("resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> BridgeResult<()> {
        lock(&self.killer)
            .kill()
            .map_err(|e| BridgeError::Pty(format!("kill failed: {e}")))
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(2),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn command_for(request: &SpawnRequest) -> BridgeResult<CommandBuilder> {
    let mut parts = request.shell.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| BridgeError::PtySpawn("empty shell command".into()))?;
    let mut cmd = CommandBuilder::new(program);
    cmd.args(parts);
    cmd.cwd(&request.cwd);
    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    Ok(cmd)
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> BridgeResult<SpawnedPty> {
        let spawn_err = |what: &str, e: &dyn std::fmt::Display| {
            BridgeError::PtySpawn(format!("{what}: {e}"))
        };

        let pair = native_pty_system()
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| spawn_err("failed to open PTY", &e))?;

        let cmd = command_for(request)?;
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err("failed to spawn shell", &e))?;
        // Keep only the master side so EOF is seen once the shell exits.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();
        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (mut reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(spawn_err("failed to open PTY streams", &e));
            }
        };

        let (input, input_rx) = sync_channel(INPUT_QUEUE_DEPTH);
        let writer_thread = std::thread::Builder::new()
            .name(format!("pty-writer-{}", pid.unwrap_or(0)))
            .spawn(move || drain_input(writer, input_rx));
        if let Err(e) = writer_thread {
            let _ = killer.kill();
            return Err(spawn_err("failed to start PTY writer", &e));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or(0)))
            .spawn(move || {
                let mut buf = vec![0u8; READ_BUF_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        // EIO once the slave side is closed.
                        Err(_) => break,
                    }
                }
                let status = match child.wait() {
                    Ok(status) => ExitStatus {
                        code: status.exit_code().try_into().unwrap_or(-1),
                        signal: 0,
                    },
                    Err(e) => {
                        warn!(error = %e, "waiting for PTY child failed");
                        ExitStatus { code: -1, signal: 0 }
                    }
                };
                info!(code = status.code, "PTY child exited");
                let _ = tx.send(PtyEvent::Exit(status));
            });
        if let Err(e) = thread {
            let _ = killer.kill();
            return Err(spawn_err("failed to start PTY reader", &e));
        }

        info!(
            pid = pid.unwrap_or(0),
            cols = request.cols,
            rows = request.rows,
            cwd = %request.cwd.display(),
            "PTY spawned"
        );

        Ok(SpawnedPty {
            control: Arc::new(NativePty {
                input,
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
            }),
            events: rx,
            pid,
        })
    }
}

/// Writer thread body: copy queued input into the PTY master in order.
fn drain_input(mut writer: Box<dyn Write + Send>, input: Receiver<Vec<u8>>) {
    while let Ok(data) = input.recv() {
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            if let Err(e) = writer.write_all(chunk).and_then(|()| writer.flush()) {
                debug!(error = %e, "PTY writer stopped");
                return;
            }
        }
    }
}

/// Turns PTY byte chunks into text without splitting UTF-8 sequences.
///
/// An incomplete trailing sequence is held back until the next chunk;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted PTY backend for deterministic tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Condvar;

    /// A fake shell that echoes writes back as output.
    pub struct ScriptedPty {
        pub request: SpawnRequest,
        tx: mpsc::UnboundedSender<PtyEvent>,
        writes: Mutex<Vec<u8>>,
        size: Mutex<(u16, u16)>,
        killed: AtomicBool,
        stalled: Mutex<bool>,
        unstalled: Condvar,
    }

    impl ScriptedPty {
        /// Emit output as if the shell printed it.
        pub fn emit(&self, data: &[u8]) {
            let _ = self.tx.send(PtyEvent::Data(data.to_vec()));
        }

        /// Make the shell exit on its own.
        pub fn exit(&self, code: i32, signal: i32) {
            let _ = self.tx.send(PtyEvent::Exit(ExitStatus { code, signal }));
        }

        pub fn written(&self) -> String {
            String::from_utf8_lossy(&lock(&self.writes)).into_owned()
        }

        pub fn size(&self) -> (u16, u16) {
            *lock(&self.size)
        }

        pub fn killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }

        /// Make writes block, like a raw-mode shell that stopped reading.
        pub fn stall_writes(&self) {
            *lock(&self.stalled) = true;
        }

        pub fn resume_writes(&self) {
            *lock(&self.stalled) = false;
            self.unstalled.notify_all();
        }
    }

    struct ScriptedControl(Arc<ScriptedPty>);

    impl PtyControl for ScriptedControl {
        fn write(&self, data: &[u8]) -> BridgeResult<()> {
            let mut stalled = lock(&self.0.stalled);
            while *stalled {
                stalled = self
                    .0
                    .unstalled
                    .wait(stalled)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            drop(stalled);
            lock(&self.0.writes).extend_from_slice(data);
            self.0.emit(data);
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
            *lock(&self.0.size) = (cols, rows);
            Ok(())
        }

        fn kill(&self) -> BridgeResult<()> {
            if !self.0.killed.swap(true, Ordering::SeqCst) {
                self.0.exit(0, HANGUP_SIGNAL);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct ScriptedBackend {
        spawned: Mutex<Vec<Arc<ScriptedPty>>>,
        fail: AtomicBool,
    }

    impl ScriptedBackend {
        pub fn failing() -> Self {
            let backend = Self::default();
            backend.fail.store(true, Ordering::SeqCst);
            backend
        }

        pub fn spawned(&self) -> Vec<Arc<ScriptedPty>> {
            lock(&self.spawned).clone()
        }

        pub fn last(&self) -> Arc<ScriptedPty> {
            lock(&self.spawned).last().cloned().expect("no PTY spawned")
        }
    }

    impl PtyBackend for ScriptedBackend {
        fn spawn(&self, request: &SpawnRequest) -> BridgeResult<SpawnedPty> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::PtySpawn("scripted failure".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let pty = Arc::new(ScriptedPty {
                request: request.clone(),
                tx,
                writes: Mutex::new(Vec::new()),
                size: Mutex::new((request.cols, request.rows)),
                killed: AtomicBool::new(false),
                stalled: Mutex::new(false),
                unstalled: Condvar::new(),
            });
            lock(&self.spawned).push(pty.clone());
            Ok(SpawnedPty {
                control: Arc::new(ScriptedControl(pty)),
                events: rx,
                pid: None,
            })
        }
    }
}
