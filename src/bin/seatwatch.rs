//! seatwatch - inspect and drive the logind session from the command line
//!
//! # Usage
//!
//! ```bash
//! # Show the session path and its locked hint
//! seatwatch status
//!
//! # Tell logind the session is now locked
//! seatwatch set-locked true
//!
//! # Print Lock / Unlock / LockedHint changes until interrupted
//! seatwatch watch-lock
//!
//! # Hold a delay inhibitor, releasing it whenever the system goes to sleep
//! seatwatch inhibit-sleep
//!
//! # Lock Secret Service collections
//! seatwatch lock-secrets collection/login
//!
//! # Enable debug logging
//! RUST_LOG=seatwatch_session=debug seatwatch watch-lock
//! ```
//!
//! The session defaults to `XDG_SESSION_ID`; `--session` overrides it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use seatwatch_core::Config;
use seatwatch_session::{InhibitLock, Inhibitor, SecretService, SessionLock};
use seatwatch_zbus::ZbusConnection;

/// seatwatch - logind session lock, sleep inhibition and secret locking
#[derive(Parser, Debug)]
#[command(name = "seatwatch", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/seatwatch/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// logind session id (default: $XDG_SESSION_ID)
    #[arg(short, long, global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the session path and whether it is locked
    Status,
    /// Set the session's locked hint
    SetLocked {
        #[arg(action = clap::ArgAction::Set)]
        locked: bool,
    },
    /// Print lock signals until interrupted
    WatchLock,
    /// Hold a sleep inhibitor, releasing it for each suspend
    InhibitSleep,
    /// Lock Secret Service collections, relative to /org/freedesktop/secrets/
    LockSecrets {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("seatwatch=info".parse()?)
                .add_directive("seatwatch_core=info".parse()?)
                .add_directive("seatwatch_session=info".parse()?)
                .add_directive("seatwatch_zbus=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;
    run(args.command, config)
}

fn load_config(args: &Args) -> Result<Config> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => Config::default_path(),
    };

    let config = match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let mut config = config.with_env();
    if let Some(session) = &args.session {
        config.session_id = Some(session.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn run(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Status => status(&config).await,
        Command::SetLocked { locked } => set_locked(&config, locked).await,
        Command::WatchLock => watch_lock(&config).await,
        Command::InhibitSleep => inhibit_sleep(&config).await,
        Command::LockSecrets { paths } => lock_secrets(&paths).await,
    }
}

// ============================================================================
// Session Lock
// ============================================================================

async fn open_session(config: &Config) -> Result<SessionLock> {
    let Some(session_id) = config.session_id.as_deref() else {
        bail!("No session id: set XDG_SESSION_ID or pass --session");
    };

    let bus = ZbusConnection::system()
        .await
        .context("Failed to connect to the system bus")?;
    let lock = SessionLock::new(Arc::new(bus), session_id)
        .await
        .with_context(|| format!("Failed to open session {session_id}"))?;
    Ok(lock)
}

async fn status(config: &Config) -> Result<()> {
    let session = open_session(config).await?;
    let locked = session.locked().await?;

    println!("Session: {}", session.path());
    println!("Locked:  {}", if locked { "yes" } else { "no" });

    session.close().await?;
    Ok(())
}

async fn set_locked(config: &Config, locked: bool) -> Result<()> {
    let session = open_session(config).await?;
    session.set_locked(locked).await?;
    println!("Locked hint set to {locked}");

    session.close().await?;
    Ok(())
}

async fn watch_lock(config: &Config) -> Result<()> {
    let session = open_session(config).await?;
    let buffer = config.subscriber_buffer.max(1);

    let (lock_tx, mut lock_rx) = mpsc::channel(buffer);
    let (unlock_tx, mut unlock_rx) = mpsc::channel(buffer);
    let (locked_tx, mut locked_rx) = mpsc::channel(buffer);
    session.add_lock_signal(lock_tx).await?;
    session.add_unlock_signal(unlock_tx).await?;
    session.add_locked_signal(locked_tx).await?;

    let shutdown = spawn_shutdown_listener();
    info!(path = %session.path(), "Watching session lock");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(()) = lock_rx.recv() => println!("lock requested"),
            Some(()) = unlock_rx.recv() => println!("unlock requested"),
            Some(locked) = locked_rx.recv() => println!("locked hint: {locked}"),
            else => break,
        }
    }

    if let Some(fault) = session.fault() {
        error!(%fault, "Signal reader stopped");
    }
    session.close().await?;
    Ok(())
}

// ============================================================================
// Sleep Inhibition
// ============================================================================

async fn inhibit_sleep(config: &Config) -> Result<()> {
    let bus = ZbusConnection::system()
        .await
        .context("Failed to connect to the system bus")?;
    let inhibitor = Inhibitor::new(Arc::new(bus));
    let settings = &config.inhibit;

    let take_lock = || inhibitor.inhibit(&settings.who, &settings.why, settings.mode, &settings.what);

    let (sleep_tx, mut sleep_rx) = mpsc::channel(config.subscriber_buffer.max(1));
    inhibitor.add_prepare_for_sleep(sleep_tx).await?;

    let mut held: Option<InhibitLock> = Some(take_lock().await?);
    println!("Inhibitor held ({})", seatwatch_core::join_what(&settings.what));

    let shutdown = spawn_shutdown_listener();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = sleep_rx.recv() => match event {
                Some(true) => {
                    println!("Preparing for sleep, releasing inhibitor");
                    if let Some(lock) = held.take() {
                        if let Err(e) = lock.release() {
                            warn!(error = %e, "Failed to release inhibitor");
                        }
                    }
                }
                Some(false) => {
                    println!("Resumed, taking inhibitor again");
                    if held.is_none() {
                        held = Some(take_lock().await?);
                    }
                }
                None => break,
            },
        }
    }

    if let Some(fault) = inhibitor.fault() {
        error!(%fault, "Signal reader stopped");
    }
    drop(held);
    inhibitor.close().await?;
    Ok(())
}

// ============================================================================
// Secret Service
// ============================================================================

async fn lock_secrets(paths: &[String]) -> Result<()> {
    let bus = ZbusConnection::session()
        .await
        .context("Failed to connect to the session bus")?;
    let service = SecretService::new(Arc::new(bus));

    let outcome = service.lock(paths).await?;
    for path in &outcome.locked {
        println!("locked {path}");
    }
    if let Some(prompt) = outcome.prompt {
        println!("prompt required: {prompt}");
    }
    Ok(())
}

// ============================================================================
// Signals
// ============================================================================

/// Cancels the returned token on SIGTERM or SIGINT.
fn spawn_shutdown_listener() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });
    token
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
