mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sur_proto::config::Config;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sur", version, about = "Separate a track into stems on a remote service")]
struct Cli {
    /// Base URL of the separation service (overrides SUR_API_URL and config)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the service once
    Health,
    /// Upload a file, follow the job and export its stems
    Separate {
        /// Audio file (.mp3, .wav, .flac, .m4a, .ogg)
        file: PathBuf,
        /// Output directory (default: <downloads_dir>/<job_id>)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Stop after listing the stems
        #[arg(long)]
        no_export: bool,
    },
    /// Follow an existing job to completion or failure
    Status { job_id: String },
    /// Download every stem of a completed job
    Export {
        job_id: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Preview one stem of a completed job through mpv
    Play { job_id: String, stem: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = sur_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("sur.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // Allow RUST_LOG override; keep connection-level DEBUG from the HTTP
    // client internals out of the log.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        "info,sur=debug,sur_client=debug,hyper_util=warn,reqwest=warn".to_string()
    });
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    // Print log path to stderr so the operator can tail it immediately.
    eprintln!("sur log: {}", log_path.display());
    tracing::info!("sur starting…");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config: {:#}, using defaults", e);
            Config::default()
        }
    }
    .with_overrides(cli.server.as_deref());
    tracing::info!("service: {}", config.server.base_url);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted");
                cancel.cancel();
            }
        });
    }

    let app = app::App::new(config, cancel)?;
    let result = match cli.command {
        Command::Health => app.health().await,
        Command::Separate {
            file,
            out,
            no_export,
        } => app.separate(&file, out, !no_export).await,
        Command::Status { job_id } => app.status(&job_id).await,
        Command::Export { job_id, out } => app.export(&job_id, out).await,
        Command::Play { job_id, stem } => app.play(&job_id, &stem).await,
    };

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
