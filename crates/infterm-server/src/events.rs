//! Operational event sink.
//!
//! The registry and connection handler report session lifecycle changes and
//! blocked commands as [`BridgeEvent`]s. [`TracingSink`] logs them;
//! [`JournalSink`] appends them to a file as newline-delimited JSON so the
//! host dashboard can tail it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    SessionCreated {
        session_id: String,
        runspace_id: String,
    },
    SessionAttached {
        session_id: String,
    },
    SessionDetached {
        session_id: String,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
    },
    CommandBlocked {
        session_id: String,
        reason: String,
    },
}

/// Receives operational events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BridgeEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::CommandBlocked { session_id, reason } => {
                warn!(session_id = %session_id, reason = %reason, "command blocked");
            }
            other => debug!(event = ?other, "bridge event"),
        }
    }
}

/// A single timestamped line in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub event: BridgeEvent,
}

/// Appends events to a JSON-lines file from a background task.
///
/// Writes are best-effort: failures are logged and never reach the session.
pub struct JournalSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl JournalSink {
    /// Start the writer task. Must be called inside a Tokio runtime.
    ///
    /// The file is opened once, in append mode, when the task starts.
    pub fn start(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();
        let writer_path = path.clone();
        tokio::spawn(async move {
            let mut file = match open_journal(&writer_path).await {
                Ok(file) => file,
                Err(e) => {
                    error!(path = %writer_path.display(), error = %e, "failed to open journal");
                    return;
                }
            };
            while let Some(entry) = rx.recv().await {
                match serde_json::to_string(&entry) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Err(e) = append_line(&mut file, &line).await {
                            error!(path = %writer_path.display(), error = %e, "failed to write journal");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to serialize journal entry"),
                }
            }
            debug!(path = %writer_path.display(), "journal writer stopped");
        });
        info!(path = %path.display(), "event journal enabled");
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JournalSink {
    fn emit(&self, event: BridgeEvent) {
        let entry = JournalEntry {
            timestamp_ms: now_ms(),
            event,
        };
        let _ = self.tx.send(entry);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn open_journal(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn append_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects events in memory.
    #[derive(Debug, Default)]
    pub struct CollectingSink {
        events: Mutex<Vec<BridgeEvent>>,
    }

    impl CollectingSink {
        pub fn events(&self) -> Vec<BridgeEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for CollectingSink {
        fn emit(&self, event: BridgeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Load a journal file, skipping malformed lines.
    pub async fn load_journal(path: &Path) -> std::io::Result<Vec<JournalEntry>> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping malformed journal line"),
            }
        }
        Ok(entries)
    }
}
