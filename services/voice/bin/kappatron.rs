//! Main Entrypoint for the KappaTron voice client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Opening the speaker and wiring the microphone and agent connector.
//! 3. Running the session controller.
//! 4. Reading `start`, `stop`, `status` and `quit` commands from stdin until
//!    told to quit or interrupted.

use anyhow::Context;
use clap::Parser;
use kappatron_core::{SessionSnapshot, SessionState};
use kappatron_voice::{
    agent::ElevenLabsConnector,
    config::Config,
    controller::{SessionController, SessionHandle},
    microphone::CpalMicrophone,
    playback,
};
use std::{io::Write, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Talk to an ElevenLabs conversational agent from the terminal.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Agent to talk to; overrides ELEVENLABS_AGENT_ID.
    #[arg(long)]
    agent_id: Option<String>,
    /// Wait for `start` instead of connecting right away.
    #[arg(long)]
    no_autostart: bool,
    /// Do not play the agent's voice.
    #[arg(long)]
    no_playback: bool,
    /// Draw the microphone level while connected.
    #[arg(long)]
    meter: bool,
    /// Capture from this input device instead of the default.
    #[arg(long)]
    input_device: Option<String>,
}

/// Listens for the `Ctrl+C` signal to shut down gracefully.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C.");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn print_status(snapshot: &SessionSnapshot) {
    match serde_json::to_string_pretty(snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "Failed to render status."),
    }
}

/// Prints user-facing messages whenever the published state changes.
async fn report_changes(handle: SessionHandle) {
    let mut updates = handle.subscribe();
    let mut last = updates.borrow().clone();
    while updates.changed().await.is_ok() {
        let current = updates.borrow_and_update().clone();
        if current.state != last.state || current.error_message != last.error_message {
            match (&current.state, &current.error_message) {
                (SessionState::Connected, _) => println!("Connected. Start talking."),
                (SessionState::Disconnected, _) => println!("The agent ended the conversation."),
                (_, Some(message)) => println!("{message}"),
                (SessionState::Idle, None) => println!("Stopped."),
                _ => {}
            }
        }
        if current.last_message != last.last_message {
            if let Some(message) = &current.last_message {
                println!("[{:?}] {}", message.source, message.text);
            }
        }
        last = current;
    }
}

async fn draw_meter(handle: SessionHandle) {
    let level = handle.level();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        if handle.snapshot().state != SessionState::Connected {
            continue;
        }
        let filled = (*level.borrow() * 30.0).round() as usize;
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "\rmic [{:<30}]", "#".repeat(filled.min(30)));
        let _ = stderr.flush();
    }
}

/// Reads stdin on a plain thread so a pending read never holds up
/// runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(agent_id) = cli.agent_id {
        config.agent_id = agent_id;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(agent_id = %config.agent_id, "Configuration loaded.");

    // --- 3. Initialize Devices and Connector ---
    let playback = if cli.no_playback {
        None
    } else {
        Some(
            tokio::task::spawn_blocking(playback::start)
                .await
                .context("Playback initialisation panicked")?
                .context("Failed to open the speaker")?,
        )
    };
    let microphone = match cli.input_device {
        Some(name) => CpalMicrophone::with_device(name),
        None => CpalMicrophone::new(),
    };
    let connector = ElevenLabsConnector::new(config.realtime_config(), config.sample_rate);

    // --- 4. Start the Session Controller ---
    let (controller, handle) = SessionController::new(
        config.session_settings(),
        Arc::new(microphone),
        Arc::new(connector),
        playback,
    );
    let controller_task = controller.spawn();
    tokio::spawn(report_changes(handle.clone()));
    if cli.meter {
        tokio::spawn(draw_meter(handle.clone()));
    }
    if !cli.no_autostart {
        handle.start().await?;
    }
    println!("Commands: start, stop, status, quit");

    // --- 5. Command Loop ---
    let mut lines = spawn_stdin_reader();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "start" => handle.start().await?,
                    "stop" => handle.stop().await?,
                    "status" => print_status(&handle.snapshot()),
                    "quit" | "exit" => break,
                    other => println!("Unknown command '{other}'. Try start, stop, status or quit."),
                }
            }
        }
    }

    handle.shutdown().await?;
    controller_task
        .await
        .context("Session controller panicked")?;
    info!("KappaTron has shut down.");
    Ok(())
}
