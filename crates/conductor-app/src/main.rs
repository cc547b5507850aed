//! conductor: runs CLI-agent sessions in pseudo-terminals.
//!
//! Requests arrive as JSON lines on stdin; replies and session events leave
//! as JSON lines on stdout. Logs go to stderr.

mod commands;
mod config;
mod dispatch;
mod ipc;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use conductor_pty::{LifecycleController, SessionEvent, ShutdownReport};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use config::{HostConfig, Overrides};
use dispatch::Dispatcher;
use ipc::Frame;

/// How long to keep forwarding events after shutdown while reader threads
/// report their exits.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// conductor: CLI-agent session manager
#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Run CLI-agent sessions in pseudo-terminals")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.conductor/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Command name to resolve and run in each session
    #[arg(long)]
    command: Option<String>,

    /// Explicit executable, skipping resolution
    #[arg(long)]
    executable: Option<std::path::PathBuf>,

    /// Reuse the live session for a working directory instead of spawning another
    #[arg(long)]
    coalesce: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            max_sessions: self.max_sessions,
            command: self.command.clone(),
            executable: self.executable.clone(),
            coalesce: self.coalesce,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = HostConfig::load(&cli.config, cli.overrides())?;

    // RUST_LOG wins over the configured level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .target(env_logger::Target::Stderr)
        .init();

    match &config.source {
        Some(path) => log::info!("loaded config from {}", path.display()),
        None => log::info!("no config file at {}, using defaults", cli.config),
    }
    log::info!(
        "conductor starting (max {} sessions, coalesce {})",
        config.manager.max_sessions,
        config.manager.coalesce_by_path
    );

    run(config).await
}

async fn run(config: HostConfig) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(config.manager.event_capacity);
    let controller = Arc::new(LifecycleController::new(config.manager, event_tx));

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(256);
    let writer = tokio::spawn(write_frames(frame_rx, tokio::io::stdout()));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&controller), frame_tx.clone()));

    let forwarder = {
        let frame_tx = frame_tx.clone();
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let SessionEvent::Exit { session_id, .. } = &event {
                    dispatcher.close_lane(*session_id);
                }
                if frame_tx.send(Frame::Event(event)).await.is_err() {
                    break;
                }
            }
        })
    };

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let reason = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatcher.handle_line(&line).await,
                Ok(None) => break "stdin closed",
                Err(e) => {
                    log::warn!("failed to read request: {e}");
                    break "stdin error";
                }
            },
            _ = &mut signal => break "signal received",
        }
    };

    shut_down(&controller, reason).await?;

    drop(dispatcher);
    drop(controller);
    drop(frame_tx);
    if tokio::time::timeout(FLUSH_GRACE, forwarder).await.is_err() {
        log::warn!("event forwarder did not finish");
    }
    match tokio::time::timeout(FLUSH_GRACE, writer).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(e).context("frame writer panicked"),
        Err(_) => {
            log::warn!("frame writer did not finish");
            Ok(())
        }
    }
}

/// Terminate every session, then give reader threads `FLUSH_GRACE` to
/// report their exits.
async fn shut_down(controller: &LifecycleController, reason: &str) -> anyhow::Result<ShutdownReport> {
    log::info!("{reason}, shutting down");
    let shutdown = controller.shutdown_coordinator();
    let report = {
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || shutdown.shutdown())
            .await
            .context("shutdown task failed")?
    };
    log::info!("terminated {} session(s)", report.terminated);

    let deadline = Instant::now() + FLUSH_GRACE;
    while controller.pending_streams() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Quitting after the window closed: nothing left to do by now.
    shutdown.shutdown();
    Ok(report)
}

/// Serialize frames to `out`, one JSON object per line.
async fn write_frames<W>(mut frames: mpsc::Receiver<Frame>, mut out: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        out.write_all(&line).await.context("output closed")?;
        out.flush().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
