use clap::Parser;
use gallery_downloader::config::{ConfigOverlay, RunConfig};
use gallery_downloader::error::DownloaderError;
use gallery_downloader::logging;
use gallery_downloader::orchestrator::{
    Orchestrator, PresetDecision, RetryDecision, RunMode, StdinPrompt,
};
use gallery_downloader::session::SavedPageSession;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "gallery_downloader")]
#[command(about = "Parallel gallery lightbox downloader with EXIF tagging and a resumable CSV log")]
#[command(version = "0.1.0")]
struct Cli {
    /// Saved gallery page to extract media URLs from
    #[arg(long)]
    page: Option<PathBuf>,

    /// Output directory for images
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// CSV log file (audit log and retry source of truth)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// GPS latitude to embed
    #[arg(long)]
    lat: Option<f64>,

    /// GPS longitude to embed
    #[arg(long)]
    lon: Option<f64>,

    /// Number of parallel download workers
    #[arg(long)]
    workers: Option<usize>,

    /// Per-file attempt ceiling for transient failures
    #[arg(long)]
    max_tries: Option<u32>,

    /// Only keep media URLs on this host
    #[arg(long)]
    media_host: Option<String>,

    /// Retry failed URLs from a previous log instead of extracting
    #[arg(long)]
    retry_failed: bool,

    /// Do not write EXIF date/GPS
    #[arg(long)]
    skip_exif: bool,

    /// Skip the interactive retry prompt at the end
    #[arg(long)]
    no_prompt: bool,

    /// Optional config.toml with defaults (CLI flags override it)
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

fn build_config(cli: &Cli) -> Result<RunConfig, DownloaderError> {
    let overlay = ConfigOverlay::load(&cli.config)?;
    let mut config = RunConfig::default().apply_overlay(overlay);
    if let Some(v) = &cli.page {
        config.page_file = v.clone();
    }
    if let Some(v) = &cli.out_dir {
        config.out_dir = v.clone();
    }
    if let Some(v) = &cli.log_file {
        config.log_file = v.clone();
    }
    if let Some(v) = cli.lat {
        config.latitude = v;
    }
    if let Some(v) = cli.lon {
        config.longitude = v;
    }
    if let Some(v) = cli.workers {
        config.workers = v.max(1);
    }
    if let Some(v) = cli.max_tries {
        config.max_tries = v.max(1);
    }
    if cli.media_host.is_some() {
        config.media_host = cli.media_host.clone();
    }
    config.skip_exif = cli.skip_exif;
    config.no_prompt = cli.no_prompt;
    Ok(config)
}

#[tokio::main]
async fn main() {
    logging::init_logging();

    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let session = Box::new(SavedPageSession::new(
        config.page_file.clone(),
        config.img_selector.clone(),
        config.media_host.clone(),
    ));
    let decider: Box<dyn RetryDecision> = if config.no_prompt {
        Box::new(PresetDecision(false))
    } else {
        Box::new(StdinPrompt)
    };
    let mode = if cli.retry_failed {
        RunMode::RetryFailed
    } else {
        RunMode::Fresh
    };

    // Ctrl-C stops issuing new transfers; in-flight temp files never reach
    // a final name, so the ledger stays resumable.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight items only");
                eprintln!("\n⏹  Interrupt received; stopping new transfers...");
                cancel.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::new(config, session, decider);
    match orchestrator.run(mode, cancel).await {
        Ok(stats) => {
            info!(
                "Run complete: {} saved, {} failed, {} cancelled",
                stats.saved, stats.failed, stats.cancelled
            );
            // Per-item failures are reported, not fatal.
            std::process::exit(0);
        }
        Err(DownloaderError::Precondition(message)) => {
            error!("Precondition failed: {}", message);
            eprintln!("❌ {}", message);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Run failed: {}", e);
            eprintln!("❌ Run failed: {}", e);
            std::process::exit(1);
        }
    }
}
