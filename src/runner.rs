//! Multi-site orchestration.
//!
//! A run scrapes every configured site, merges the results into one
//! collection, optionally downloads the assets, and always writes a metadata
//! CSV. A failing site or download is recorded in the [`RunReport`] and never
//! aborts the run.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{AssetCollection, AssetType};
pub use crate::models::DownloadOutcome;
use crate::platforms::{ScrapeOptions, build_site};
use crate::transport::Transport;

/// Sites scraped at once.
pub const DEFAULT_SITE_CONCURRENCY: usize = 4;

/// Everything one run needs besides the cache and transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub sites: Vec<SiteConfig>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Keep listing pages in the artifacts bucket.
    pub cache: bool,
    /// Download permitted assets after scraping.
    pub download: bool,
    /// Maximum download size in MB.
    pub file_size: Option<f64>,
    /// Allow-list of asset types to download.
    pub asset_types: Option<Vec<AssetType>>,
}

impl RunRequest {
    fn scrape_options(&self) -> ScrapeOptions {
        ScrapeOptions {
            start_date: self.start_date,
            end_date: self.end_date,
            download: false,
            cache: self.cache,
            file_size: self.file_size,
            asset_types: self.asset_types.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteFailure {
    pub url: String,
    pub message: String,
}

/// Result of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub assets: AssetCollection,
    pub metadata_path: PathBuf,
    pub failures: Vec<SiteFailure>,
    /// One entry per asset, in collection order; empty without `download`.
    pub downloads: Vec<DownloadOutcome>,
}

impl RunReport {
    pub fn downloaded(&self) -> usize {
        self.downloads
            .iter()
            .filter(|d| matches!(d, DownloadOutcome::Written { .. }))
            .count()
    }

    pub fn download_failures(&self) -> usize {
        self.downloads
            .iter()
            .filter(|d| matches!(d, DownloadOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    cache: Cache,
    transport: Arc<dyn Transport>,
    site_concurrency: usize,
}

impl Runner {
    pub fn new(cache: Cache, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache,
            transport,
            site_concurrency: DEFAULT_SITE_CONCURRENCY,
        }
    }

    pub fn with_site_concurrency(mut self, n: usize) -> Self {
        self.site_concurrency = n.max(1);
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Scrape, optionally download, then export metadata.
    ///
    /// # Errors
    ///
    /// Only a failure to write the metadata CSV is fatal.
    #[instrument(level = "info", skip_all, fields(sites = request.sites.len()))]
    pub async fn scrape(&self, request: &RunRequest) -> Result<RunReport, ScrapeError> {
        let opts = request.scrape_options();
        let opts = &opts;

        let results: Vec<(String, Result<AssetCollection, ScrapeError>)> = stream::iter(request.sites.iter().cloned())
            .map(|config| async move {
                let url = config.url.clone();
                let result = match build_site(config, self.transport.clone(), self.cache.clone()) {
                    Ok(site) => site.scrape(opts).await,
                    Err(e) => Err(e),
                };
                (url, result)
            })
            .buffered(self.site_concurrency)
            .collect()
            .await;

        let mut assets = AssetCollection::new();
        let mut failures = Vec::new();
        for (url, result) in results {
            match result {
                Ok(found) => assets.extend(found),
                Err(e) => {
                    error!(site = %url, error = %e, "Site scrape failed");
                    failures.push(SiteFailure {
                        url,
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(assets = assets.len(), failed_sites = failures.len(), "Scraping complete");

        let downloads = if request.download {
            self.download_all(&mut assets, opts).await
        } else {
            Vec::new()
        };

        let metadata_path = assets.to_csv(&self.cache.metadata_files_path()).await?;
        info!(path = %metadata_path.display(), "Wrote asset metadata");

        Ok(RunReport {
            assets,
            metadata_path,
            failures,
            downloads,
        })
    }

    /// Best-effort bulk download; every asset gets an outcome.
    async fn download_all(&self, assets: &mut AssetCollection, opts: &ScrapeOptions) -> Vec<DownloadOutcome> {
        assets
            .download_best_effort(
                &self.cache.assets_path(),
                &opts.download_filter(),
                Some(self.transport.as_ref()),
            )
            .await
    }
}
