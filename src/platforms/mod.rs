//! Site adapters for the meeting-publishing platforms.
//!
//! Every adapter implements [`Site`]: given a [`ScrapeOptions`] it produces an
//! [`AssetCollection`] of normalized records. Platform-specific parsing stays
//! inside each module so a markup change only touches one adapter.
//!
//! # Supported Platforms
//!
//! | Platform | Module | Source | Date defaults | Metadata probe |
//! |----------|--------|--------|---------------|----------------|
//! | CivicPlus | [`civicplus`] | Agenda Center search page (HTML) | both today | always |
//! | Granicus | [`granicus`] | iqm2 RSS feed | unbounded | when size filtering |
//! | Granicus ViewPublisher | [`granicus_publisher`] | Published meetings table (HTML) | both today | always |
//! | BoardDocs | [`boarddocs`] | Public page + meetings JSON | unbounded | when size filtering |
//! | Legistar | [`legistar`] | Calendar grid, paginated by postback | start today | when size filtering |
//! | PrimeGov | [`primegov`] | Public portal JSON | both today | when size filtering |
//!
//! # Common Patterns
//!
//! - Listing pages are parsed synchronously into owned rows; `scraper::Html`
//!   never lives across an `.await`
//! - Rows that fail to parse or validate are logged and skipped
//! - A failed primary listing request fails the whole adapter
//! - Downloads requested through [`ScrapeOptions`] are best-effort
//! - Assets without a meeting date are excluded
//! - Links are deduplicated by URL, first occurrence wins

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::{AssetError, ScrapeError};
use crate::models::{Asset, AssetCollection, AssetType, DownloadFilter, DownloadOutcome};
use crate::transport::Transport;
use crate::utils::truncate_for_log;

pub mod boarddocs;
pub mod civicplus;
pub mod granicus;
pub mod granicus_publisher;
pub mod legistar;
pub mod pagination;
pub mod primegov;

/// Concurrent HEAD requests per site.
const PROBE_CONCURRENCY: usize = 4;

/// The platform family a site URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    CivicPlus,
    Granicus,
    GranicusPublisher,
    BoardDocs,
    Legistar,
    PrimeGov,
}

impl Platform {
    /// Select a platform from recognizable host or path fragments.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.contains("civicplus.com") || lower.contains("/agendacenter") {
            Some(Platform::CivicPlus)
        } else if lower.contains("granicus.com") && lower.contains("viewpublisher") {
            Some(Platform::GranicusPublisher)
        } else if lower.contains("iqm2.com") || (lower.contains("granicus.com") && lower.contains("rss")) {
            Some(Platform::Granicus)
        } else if lower.contains("boarddocs.com") {
            Some(Platform::BoardDocs)
        } else if lower.contains("legistar.com") {
            Some(Platform::Legistar)
        } else if lower.contains("primegov.com") {
            Some(Platform::PrimeGov)
        } else {
            None
        }
    }

    /// Prefix used in `meeting_id`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::CivicPlus => "civicplus",
            Platform::Granicus | Platform::GranicusPublisher => "granicus",
            Platform::BoardDocs => "boarddocs",
            Platform::Legistar => "legistar",
            Platform::PrimeGov => "primegov",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call scrape parameters. Built fresh for each invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeOptions {
    /// Inclusive lower bound; `None` uses the adapter's default.
    pub start_date: Option<NaiveDate>,
    /// Inclusive upper bound; `None` uses the adapter's default.
    pub end_date: Option<NaiveDate>,
    /// Download permitted assets into the cache's assets bucket.
    pub download: bool,
    /// Write listing pages into the cache's artifacts bucket.
    pub cache: bool,
    /// Maximum download size in MB.
    pub file_size: Option<f64>,
    /// Allow-list of asset types to download.
    pub asset_types: Option<Vec<AssetType>>,
}

impl ScrapeOptions {
    /// Resolve the date window against an adapter's defaults.
    pub fn date_range(&self, default_start: Option<NaiveDate>, default_end: Option<NaiveDate>) -> DateRange {
        DateRange {
            start: self.start_date.or(default_start),
            end: self.end_date.or(default_end),
        }
    }

    pub fn download_filter(&self) -> DownloadFilter {
        DownloadFilter::new(self.file_size, self.asset_types.clone())
    }
}

/// Inclusive calendar-date window; a missing bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|s| date >= s) && self.end.is_none_or(|e| date <= e)
    }
}

/// Uniform adapter contract.
#[async_trait]
pub trait Site: Send + Sync + fmt::Debug {
    fn platform(&self) -> Platform;

    /// The site URL this adapter was configured with.
    fn url(&self) -> &str;

    /// Scrape meeting assets for the configured site.
    ///
    /// # Errors
    ///
    /// Fails when the primary listing cannot be fetched or has no recognizable
    /// structure. Individual bad rows are skipped, never fatal.
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError>;
}

/// Construct the adapter for a configured site.
pub fn build_site(
    config: SiteConfig,
    transport: Arc<dyn Transport>,
    cache: Cache,
) -> Result<Box<dyn Site>, ScrapeError> {
    config.validate()?;
    let platform =
        Platform::from_url(&config.url).ok_or_else(|| ScrapeError::UnrecognizedSite(config.url.clone()))?;
    debug!(url = %config.url, %platform, "Selected adapter");

    Ok(match platform {
        Platform::CivicPlus => Box::new(civicplus::CivicPlusSite::new(config, transport, cache)?),
        Platform::Granicus => Box::new(granicus::GranicusSite::new(config, transport, cache)?),
        Platform::GranicusPublisher => {
            Box::new(granicus_publisher::GranicusPublisherSite::new(config, transport, cache)?)
        }
        Platform::BoardDocs => Box::new(boarddocs::BoardDocsSite::new(config, transport, cache)?),
        Platform::Legistar => Box::new(legistar::LegistarSite::new(config, transport, cache)?),
        Platform::PrimeGov => Box::new(primegov::PrimeGovSite::new(config, transport, cache)?),
    })
}

/// `{platform}_{instance}_{native-id}`
pub fn meeting_id(platform: Platform, instance: &str, native_id: &str) -> String {
    format!("{platform}_{instance}_{native_id}")
}

/// Keep a built asset, or log why the record was dropped.
pub(crate) fn keep_valid(site: &str, built: Result<Asset, AssetError>) -> Option<Asset> {
    match built {
        Ok(asset) => Some(asset),
        Err(e) => {
            warn!(site, error = %e, "Skipping invalid asset record");
            None
        }
    }
}

/// Order-preserving deduplication by asset URL.
pub(crate) fn dedup_by_url(assets: impl IntoIterator<Item = Asset>) -> AssetCollection {
    assets
        .into_iter()
        .unique_by(|asset| asset.url().to_string())
        .collect()
}

/// Decode a JSON array one record at a time.
///
/// A body that is not a JSON array fails the listing. Rows that do not fit
/// `T` are logged and skipped.
pub(crate) fn parse_records<T: DeserializeOwned>(site: &str, body: &str) -> Result<Vec<T>, ScrapeError> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(body).inspect_err(|e| {
        warn!(site, error = %e, response_preview = %truncate_for_log(body, 300), "Listing is not a JSON array");
    })?;
    let total = rows.len();
    let records: Vec<T> = rows
        .into_iter()
        .enumerate()
        .filter_map(|(row, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(site, row, error = %e, "Skipping malformed listing row");
                None
            }
        })
        .collect();
    if records.len() < total {
        debug!(site, kept = records.len(), total, "Dropped malformed rows");
    }
    Ok(records)
}

/// Best-effort HEAD probe filling `content_type`/`content_length`.
pub(crate) async fn probe_metadata(transport: &dyn Transport, assets: &mut AssetCollection) {
    let pending = std::mem::take(assets);
    let total = pending.len();
    let probed: Vec<(Asset, bool)> = stream::iter(pending)
        .map(|mut asset| async move {
            let filled = match transport.head(asset.url()).await {
                Ok(resp) if resp.is_success() => {
                    asset.set_content_info(resp.content_type(), resp.content_length());
                    true
                }
                Ok(resp) => {
                    debug!(url = %asset.url(), status = resp.status, "Metadata probe was not successful");
                    false
                }
                Err(e) => {
                    warn!(url = %asset.url(), error = %e, "Metadata probe failed");
                    false
                }
            };
            (asset, filled)
        })
        .buffered(PROBE_CONCURRENCY)
        .collect()
        .await;

    let filled = probed.iter().filter(|(_, ok)| *ok).count();
    *assets = probed.into_iter().map(|(asset, _)| asset).collect();
    debug!(probed = filled, total, "Metadata probe complete");
}

/// Shared tail of every adapter: optional probe, then optional download.
///
/// Download failures are logged and the metadata is returned regardless.
pub(crate) async fn finish(
    site: &str,
    mut assets: AssetCollection,
    opts: &ScrapeOptions,
    probe_always: bool,
    transport: &dyn Transport,
    cache: &Cache,
) -> Result<AssetCollection, ScrapeError> {
    if probe_always || opts.file_size.is_some() {
        probe_metadata(transport, &mut assets).await;
    }
    if opts.download {
        let outcomes = assets
            .download_best_effort(&cache.assets_path(), &opts.download_filter(), Some(transport))
            .await;
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Failed { .. }))
            .count();
        if failed > 0 {
            warn!(site, failed, "Some downloads failed");
        }
    }
    info!(site, count = assets.len(), "Scraped site");
    Ok(assets)
}

/// Cache a listing page in the artifacts bucket when requested.
pub(crate) async fn cache_listing(cache: &Cache, opts: &ScrapeOptions, response_url: &str, body: &str) {
    if !opts.cache {
        return;
    }
    let name = crate::utils::cache_page_name(response_url);
    match cache.write_artifact(&name, body).await {
        Ok(path) => info!(path = %path.display(), "Cached listing page"),
        Err(e) => warn!(url = response_url, error = %e, "Could not cache listing page"),
    }
}
