//! safetravel - talk to the road-safety assistant from the terminal.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use safetravel::config::Config;
use safetravel::voice::gemini_live::build_setup_message;

#[derive(Parser)]
#[command(name = "safetravel", about = "SafeTravel voice hazard assistant", version)]
struct Cli {
    /// Config file (default: ~/.safetravel/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a live voice session with the microphone and speaker.
    Voice,
    /// Print the session setup sent to the backend (persona and tools).
    Tools,
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "safetravel=debug"
    } else {
        "safetravel=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Voice => run_voice(config).await,
        Commands::Tools => {
            let setup = build_setup_message(&config.voice);
            println!("{}", serde_json::to_string_pretty(&setup)?);
            Ok(())
        }
        Commands::Config => {
            let mut shown = config.clone();
            if shown.voice.api_key.is_some() {
                shown.voice.api_key = Some("***".to_string());
            }
            print!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

#[cfg(feature = "device-audio")]
async fn run_voice(config: Config) -> Result<()> {
    use safetravel::hazards::{HazardStore, HazardToolHandler};
    use safetravel::voice::device::{DeviceMicrophone, DeviceSpeaker};
    use safetravel::voice::{ConnectionStatus, GeminiLiveTransport, StatusCallback, VoiceSessionManager};
    use std::sync::Arc;

    let api_key = config.voice.api_key.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "No API key. Set {} or voice.api_key in the config file",
            safetravel::config::API_KEY_ENV
        )
    })?;

    let manager = VoiceSessionManager::new(
        config.voice.clone(),
        Arc::new(GeminiLiveTransport::new(api_key, &config.voice)),
        Arc::new(DeviceMicrophone::new(config.voice.capture_block_frames)),
        Arc::new(DeviceSpeaker::new()),
    );
    let store = HazardStore::new();
    let handler = Arc::new(HazardToolHandler::new(store.clone(), config.location));

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    let on_status: StatusCallback = Arc::new(move |status| {
        let _ = status_tx.send(status);
    });

    manager.connect(handler, on_status).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping voice session...");
                break;
            }
            status = status_rx.recv() => match status {
                Some(status) => {
                    println!("Status: {status}");
                    if status == ConnectionStatus::Connected {
                        println!("Speak to report a hazard. Ctrl+C to stop.");
                    }
                    if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    manager.disconnect().await;

    let reports = store.snapshot();
    if reports.is_empty() {
        println!("No hazards reported.");
    } else {
        println!("Hazards reported this session:");
        for hazard in reports {
            println!(
                "  [{}] {}: {}",
                hazard.severity,
                hazard.hazard_type.label(),
                hazard.description
            );
        }
    }
    Ok(())
}

#[cfg(not(feature = "device-audio"))]
async fn run_voice(_config: Config) -> Result<()> {
    anyhow::bail!(
        "this build has no audio device support; rebuild with `--features device-audio`"
    )
}
