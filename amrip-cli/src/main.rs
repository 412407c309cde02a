mod input;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use amrip_engine::{
    AcquisitionOrchestrator, Codec, Collaborators, FfmpegVerifier, Fmp4Inspector, FsOutputSink,
    HttpCatalog, HttpMediaFetcher, PassthroughEncapsulator, TrackState,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::input::{parse_input, RipTarget};
use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about = "Protected-stream acquisition pipeline", long_about = None)]
struct Args {
    /// Path to the JSON settings file
    #[arg(long, default_value = "amrip.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,

    /// Only log errors
    #[arg(long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a song, album, playlist, or artist URL
    Download {
        /// A music.apple.com URL
        url: String,

        /// Requested codec (alac, ec3, ac3, aac, aac-binaural, aac-downmix)
        #[arg(long, default_value = "alac")]
        codec: String,

        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match args.command {
        Command::Download { url, codec, force } => download(&args.config, &url, &codec, force).await,
    }
}

async fn download(config: &PathBuf, url: &str, codec: &str, force: bool) -> anyhow::Result<()> {
    let codec: Codec = codec.parse()?;
    let target = parse_input(url)?;
    let settings = Settings::load(config)
        .await
        .with_context(|| format!("loading settings from {}", config.display()))?;

    let scheduler = settings.build_scheduler();
    info!(
        devices = scheduler.links().len(),
        output = %settings.output_dir.display(),
        "fleet ready"
    );

    let catalog = HttpCatalog::connect(settings.media_user_token.as_deref())
        .await
        .context("connecting to the catalog")?;
    let parts = Collaborators {
        catalog: Arc::new(catalog),
        fetcher: Arc::new(HttpMediaFetcher::default()),
        inspector: Arc::new(Fmp4Inspector),
        encapsulator: Arc::new(PassthroughEncapsulator),
        verifier: Arc::new(FfmpegVerifier::default()),
        sink: Arc::new(FsOutputSink::new(settings.output_dir.clone())),
        stream_override: None,
    };
    let orchestrator = AcquisitionOrchestrator::new(settings.rip_config(), scheduler, parts);

    match target {
        RipTarget::Song(track) => {
            let report = orchestrator.acquire_track(&track, codec, force).await;
            match report.state {
                TrackState::Failed => anyhow::bail!(
                    "track {} failed: {}",
                    report.track,
                    report.error.unwrap_or_default()
                ),
                state => info!(track = %report.track, state = %state, "finished"),
            }
        }
        RipTarget::Collection(collection) => {
            let report = orchestrator.rip_collection(&collection, codec, force).await?;
            if !report.all_succeeded() {
                anyhow::bail!(
                    "{} of {} tracks failed",
                    report.count(TrackState::Failed),
                    report.reports.len()
                );
            }
        }
    }
    Ok(())
}
