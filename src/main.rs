//! WSI Tiler - tissue patches and composites from Whole Slide Images.
//!
//! This binary parses the CLI, wires the slide opener into the batch driver
//! and runs the requested pipeline over every discovered slide.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_tiler::{
    batch::BatchDriver,
    config::{Cli, Command, ComposeArgs, ExtractArgs},
    shutdown::ShutdownSignal,
    slide::TiffSlideOpener,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.command.verbose());

    if let Err(e) = cli.command.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = ShutdownSignal::new();
    spawn_shutdown_listener(shutdown.clone());

    match cli.command {
        Command::Extract(args) => run_extract(args, shutdown).await,
        Command::Compose(args) => run_compose(args, shutdown).await,
    }
}

// =============================================================================
// Extract Command
// =============================================================================

async fn run_extract(args: ExtractArgs, shutdown: ShutdownSignal) -> ExitCode {
    let batch = args.batch_config();
    let extract = args.extract_config();

    info!("Configuration:");
    info!("  Input: {} ({:?})", batch.input.display(), batch.discovery);
    info!("  Output: {}", batch.output.display());
    info!(
        "  Chunk: {}x{}, minimum patch {}",
        extract.chunk_size.width, extract.chunk_size.height, extract.min_patch_size
    );
    info!(
        "  Workers: {} across {} slide job(s)",
        extract.workers, batch.slide_jobs
    );

    let driver = BatchDriver::new(batch).with_shutdown(shutdown);
    match driver
        .run_extraction(Arc::new(TiffSlideOpener::new()), extract)
        .await
    {
        Ok(report) => {
            let saved: usize = report
                .slides
                .iter()
                .filter_map(|s| s.report.as_ref())
                .map(|r| r.saved)
                .sum();
            info!(
                "{} patch(es) saved from {} slide(s)",
                saved, report.succeeded
            );
            exit_code(report.cancelled)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Compose Command
// =============================================================================

async fn run_compose(args: ComposeArgs, shutdown: ShutdownSignal) -> ExitCode {
    let batch = args.batch_config();
    let composite = args.composite_config();

    info!("Configuration:");
    info!("  Input: {} ({:?})", batch.input.display(), batch.discovery);
    info!("  Output: {}", batch.output.display());
    info!(
        "  Target: {}x{}, chunk {}x{}",
        composite.target.0,
        composite.target.1,
        composite.chunk_size.width,
        composite.chunk_size.height
    );

    let driver = BatchDriver::new(batch).with_shutdown(shutdown);
    match driver
        .run_composite(Arc::new(TiffSlideOpener::new()), composite)
        .await
    {
        Ok(report) => {
            info!("{} composite(s) written", report.succeeded);
            exit_code(report.cancelled)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn exit_code(cancelled: bool) -> ExitCode {
    if cancelled {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}

/// Trigger `shutdown` on Ctrl-C. In-flight decodes finish; nothing new starts.
fn spawn_shutdown_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            shutdown.trigger();
        }
    });
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_tiler=debug"
    } else {
        "wsi_tiler=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
