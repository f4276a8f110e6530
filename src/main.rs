//! # civic_scraper
//!
//! Command-line entry point: scrape meeting assets from one or more
//! agenda-publishing sites, optionally download them, and export metadata.
//!
//! ## Usage
//!
//! ```sh
//! civic_scraper scrape --url https://go.boarddocs.com/pa/keyc/Board.nsf --download
//! ```

use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;

use civic_scraper::cache::Cache;
use civic_scraper::runner::Runner;
use civic_scraper::transport::{HttpTransport, Transport};
use civic_scraper::utils::ensure_writable_dir;
use cli::{Cli, Command};

/// Per-request timeout for the shared HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("civic_scraper starting up");

    let Command::Scrape(args) = Cli::parse().command;
    debug!(?args, "Parsed CLI arguments");

    let request = args.run_request()?;
    info!(sites = request.sites.len(), "Loaded site configurations");

    let cache = Cache::new(args.cache_dir.clone());
    if let Err(e) = ensure_writable_dir(cache.path()).await {
        error!(
            path = %cache.path().display(),
            error = %e,
            "Cache directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(REQUEST_TIMEOUT)?);
    let runner = Runner::new(cache, transport);
    let report = runner.scrape(&request).await?;

    for failure in &report.failures {
        warn!(site = %failure.url, error = %failure.message, "Site was skipped");
    }
    if request.download {
        info!(
            downloaded = report.downloaded(),
            failed = report.download_failures(),
            "Download summary"
        );
    }

    let elapsed = start_time.elapsed();
    info!(
        assets = report.assets.len(),
        failed_sites = report.failures.len(),
        metadata = %report.metadata_path.display(),
        ?elapsed,
        "Execution complete"
    );

    Ok(())
}
