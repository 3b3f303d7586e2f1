//! Runspace resolution.
//!
//! A runspace is an external working-directory context a shell is rooted in.
//! The bridge only consumes the [`RunspaceResolver`] interface; the bundled
//! [`StaticRunspaces`] serves the `[[runspaces]]` table from the config file.

use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

/// Runspace id used when no runspace is named and none is active.
pub const DEFAULT_RUNSPACE_ID: &str = "default";

/// `[[runspaces]]` entry in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunspaceEntry {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A resolved working-directory context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runspace {
    pub id: String,
    pub path: PathBuf,
    /// Shell command line; `None` uses the server default.
    pub shell: Option<String>,
    pub env: HashMap<String, String>,
}

impl Runspace {
    /// Home-directory shell context used when nothing else resolves.
    pub fn default_context() -> Self {
        let path = dirs::home_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            id: DEFAULT_RUNSPACE_ID.to_string(),
            path,
            shell: None,
            env: HashMap::new(),
        }
    }
}

impl From<RunspaceEntry> for Runspace {
    fn from(entry: RunspaceEntry) -> Self {
        Self {
            id: entry.id,
            path: PathBuf::from(entry.path),
            shell: entry.shell,
            env: entry.env,
        }
    }
}

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Option<Runspace>> + Send + 'a>>;

/// Maps runspace ids to working directories and shell environments.
pub trait RunspaceResolver: Send + Sync {
    /// Look up a runspace by id.
    fn get_runspace<'a>(&'a self, id: &'a str) -> ResolveFuture<'a>;

    /// The runspace currently selected in the dashboard, if any.
    fn get_active_runspace(&self) -> ResolveFuture<'_>;
}

/// Fixed runspace table.
#[derive(Debug, Default)]
pub struct StaticRunspaces {
    runspaces: HashMap<String, Runspace>,
    active: Option<String>,
}

impl StaticRunspaces {
    pub fn new(entries: Vec<RunspaceEntry>, active: Option<String>) -> Self {
        let runspaces = entries
            .into_iter()
            .map(|entry| (entry.id.clone(), Runspace::from(entry)))
            .collect();
        Self { runspaces, active }
    }

    pub fn len(&self) -> usize {
        self.runspaces.len()
    }
}

impl RunspaceResolver for StaticRunspaces {
    fn get_runspace<'a>(&'a self, id: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move { self.runspaces.get(id).cloned() })
    }

    fn get_active_runspace(&self) -> ResolveFuture<'_> {
        Box::pin(async move {
            self.active
                .as_deref()
                .and_then(|id| self.runspaces.get(id))
                .cloned()
        })
    }
}
