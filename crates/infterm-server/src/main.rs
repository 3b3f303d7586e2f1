//! infterm-server: persistent terminal sessions over WebSocket.
//!
//! Spawns one PTY-backed shell per session, rooted in a runspace, and keeps
//! it alive across browser reconnects until the shell exits or the session
//! sits detached past its idle timeout.

mod auth;
mod config;
mod events;
mod runspace;
mod server;
mod session;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use events::{EventSink, JournalSink, TracingSink};
use runspace::StaticRunspaces;
use server::TerminalServer;
use session::NativePtyBackend;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// infterm-server command line
#[derive(Parser, Debug)]
#[command(name = "infterm-server", version, about = "Browser terminal bridge")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.infterm/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Idle timeout in seconds (detached sessions)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Require a token on every connection
    #[arg(long)]
    require_token: bool,

    /// Allowed Origin (repeatable; "*" allows any)
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,

    /// Append session events to this JSON-lines file
    #[arg(long)]
    journal: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting infterm-server");

    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
        idle_timeout_secs: cli.idle_timeout,
        require_token: cli.require_token,
        allowed_origins: cli.allow_origins.clone(),
        journal: cli.journal.clone(),
    };
    let config_path = PathBuf::from(&cli.config);
    let config =
        ServerConfig::load(Some(&config_path), &overrides).context("failed to load config")?;

    let resolver = Arc::new(StaticRunspaces::new(
        config.runspaces.clone(),
        config.active_runspace.clone(),
    ));
    info!(
        runspaces = resolver.len(),
        active = config.active_runspace.as_deref().unwrap_or("-"),
        "runspaces loaded"
    );

    let events: Arc<dyn EventSink> = match &config.journal {
        Some(path) => Arc::new(JournalSink::start(path.clone())),
        None => Arc::new(TracingSink),
    };

    let server = Arc::new(
        TerminalServer::new(config, Arc::new(NativePtyBackend), resolver, events)
            .context("failed to create server")?,
    );

    tokio::select! {
        result = server.clone().run() => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let ended = server.registry().shutdown().await;
    info!(sessions = ended, "infterm-server stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_repeatable_origins() {
        let cli = Cli::parse_from([
            "infterm-server",
            "--port",
            "9000",
            "--allow-origin",
            "localhost",
            "--allow-origin",
            "https://dash.example",
            "--require-token",
        ]);
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.allow_origins.len(), 2);
        assert!(cli.require_token);
        assert_eq!(cli.config, "~/.infterm/config.toml");
    }
}
