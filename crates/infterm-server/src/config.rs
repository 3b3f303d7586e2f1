//! Server configuration: TOML file + CLI overrides.

use crate::runspace::RunspaceEntry;
use infterm_core::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Runspace used when a connection names none.
    #[serde(default)]
    pub active_runspace: Option<String>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub runspaces: Vec<RunspaceEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    /// Shell for runspaces that do not name one. Falls back to `$SHELL`.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_true")]
    pub allow_default_shell: bool,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Append operational events as JSON lines to this file.
    #[serde(default)]
    pub journal: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
            scrollback_bytes: default_scrollback_bytes(),
            shell: None,
            allow_default_shell: true,
            default_cols: default_cols(),
            default_rows: default_rows(),
            journal: None,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub require_token: bool,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_max_connects")]
    pub max_connects_per_minute: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            require_token: false,
            allowed_origins: default_allowed_origins(),
            token_ttl_secs: default_token_ttl(),
            max_connects_per_minute: default_max_connects(),
        }
    }
}

/// `[security]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub extra_deny_patterns: Vec<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_port() -> u16 {
    7681
}
fn default_path() -> String {
    "/terminal".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_scrollback_bytes() -> usize {
    100 * 1024
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_allowed_origins() -> Vec<String> {
    vec!["localhost".into(), "127.0.0.1".into(), "[::1]".into()]
}
fn default_token_ttl() -> u64 {
    600
}
fn default_max_connects() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub require_token: bool,
    pub allowed_origins: Vec<String>,
    pub journal: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub path: String,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub scrollback_bytes: usize,
    pub shell: Option<String>,
    pub allow_default_shell: bool,
    pub default_cols: u16,
    pub default_rows: u16,
    pub journal: Option<PathBuf>,
    pub require_token: bool,
    pub allowed_origins: Vec<String>,
    pub token_ttl: Duration,
    pub max_connects_per_minute: u32,
    pub extra_deny_patterns: Vec<String>,
    pub active_runspace: Option<String>,
    pub runspaces: Vec<RunspaceEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &CliOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> BridgeResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, cli))
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> Self {
        let allowed_origins = if cli.allowed_origins.is_empty() {
            file.auth.allowed_origins
        } else {
            cli.allowed_origins.clone()
        };
        let journal = cli.journal.clone().or(file.server.journal);

        Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            path: file.server.path,
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout_secs.unwrap_or(file.server.idle_timeout_secs),
            ),
            scrollback_bytes: file.server.scrollback_bytes,
            shell: file.server.shell,
            allow_default_shell: file.server.allow_default_shell,
            default_cols: file.server.default_cols,
            default_rows: file.server.default_rows,
            journal: journal.as_deref().map(expand_tilde_str),
            require_token: cli.require_token || file.auth.require_token,
            allowed_origins,
            token_ttl: Duration::from_secs(file.auth.token_ttl_secs),
            max_connects_per_minute: file.auth.max_connects_per_minute,
            extra_deny_patterns: file.security.extra_deny_patterns,
            active_runspace: file.active_runspace,
            runspaces: file
                .runspaces
                .into_iter()
                .map(|mut entry| {
                    entry.path = expand_tilde_str(&entry.path).to_string_lossy().into_owned();
                    entry
                })
                .collect(),
        }
    }
}

fn parse(content: &str) -> BridgeResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
