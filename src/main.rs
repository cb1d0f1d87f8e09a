// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

mod cli;
mod token;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use conductor_driver::{SessionLimits, ShellCommand, ShellDriverFactory};
use conductor_process::ProcessManager;
use conductor_rpc::{AppState, ServerInfo};
use conductor_store::SessionStore;
use conductor_watch::WatcherHub;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use cli::{Cli, Commands, TokenCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
        Some(Commands::ShowConfig { config }) => show_config(config.as_deref()),
        Some(Commands::Token { command: TokenCommands::Regenerate { config } }) => {
            regenerate_token(config.as_deref())
        }
        Some(Commands::Serve { config }) | None => {
            let cfg = conductor_config::load(config.as_deref())?;
            run_serve(cfg).await
        }
    }
}

fn show_config(config: Option<&std::path::Path>) -> anyhow::Result<()> {
    let cfg = conductor_config::load(config)?;
    println!("{}", serde_yaml::to_string(&cfg)?);
    Ok(())
}

fn regenerate_token(config: Option<&std::path::Path>) -> anyhow::Result<()> {
    let cfg = conductor_config::load(config)?;
    let path = token_path(&cfg);
    let raw = token::regenerate(&path)?;
    println!("New bearer token (save it now — it won't be shown again):");
    println!("  {raw}");
    Ok(())
}

/// The file-backed token path, independent of whether `server.token` is
/// also set inline in config. `token regenerate` always operates on this
/// file; an inline `server.token` takes priority at `serve` time and makes
/// the file irrelevant for that run.
fn token_path(_cfg: &conductor_config::Config) -> PathBuf {
    token::default_token_path()
}

async fn run_serve(cfg: conductor_config::Config) -> anyhow::Result<()> {
    let token = match &cfg.server.token {
        Some(t) => conductor_config::StoredToken::from_raw(t),
        None => {
            let (hash, generated) = token::load_or_generate(&token_path(&cfg))?;
            if let Some(raw) = generated {
                token::announce(&raw);
            }
            hash
        }
    };

    let agent_command = cfg
        .server
        .agent_command
        .clone()
        .context("server.agent_command is not set; configure the argv of the per-turn agent CLI before running `conductor serve`")?;
    let (program, args) = agent_command
        .split_first()
        .context("server.agent_command must contain at least a program name")?;

    let store = Arc::new(SessionStore::new(cfg.server.resolved_data_dir()));

    let driver_factory = Arc::new(ShellDriverFactory::new(
        ShellCommand { program: program.clone(), args: args.to_vec() },
        cfg.server.line_buffer_bytes,
    ));

    let (disconnect_tx, disconnect_rx) = mpsc::channel(64);
    let limits = SessionLimits {
        stderr_capture_bytes: cfg.server.stderr_capture_bytes,
        stderr_drain_timeout: Duration::from_secs(cfg.server.stderr_drain_timeout_secs),
    };

    let root_cancel = CancellationToken::new();
    spawn_shutdown_listener(root_cancel.clone());

    let process = ProcessManager::new(
        driver_factory,
        store.clone(),
        disconnect_tx,
        root_cancel,
        limits,
        Duration::from_secs(cfg.server.idle_timeout_secs),
    );

    let session_list_hub = Arc::new(WatcherHub::new());

    let server_info = ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        app_title: "conductor".to_string(),
        agent_type: program.clone(),
        default_workdir: None,
    };

    let app = Arc::new(AppState {
        store,
        process,
        session_list_hub,
        token,
        auth_timeout: Duration::from_secs(cfg.server.auth_timeout_secs),
        server_info,
    });

    conductor_rpc::serve(&cfg.server.bind, app, disconnect_rx).await
}

/// Cancels `root_cancel` on SIGTERM/SIGINT (Ctrl-C), so every
/// `CancellationToken` derived from it — AgentSessions, fan-out tasks, the
/// idle reaper — observes shutdown per §5.
fn spawn_shutdown_listener(root_cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received, cancelling root context");
        root_cancel.cancel();
    });
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
