//! Command-line interface definitions for civic_scraper.
//!
//! Arguments are parsed with `clap` derive. The cache directory can also come
//! from the `CIVIC_SCRAPER_DIR` environment variable.

use chrono::NaiveDate;
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

use civic_scraper::config::{SiteConfig, load_sites_yaml, load_urls_csv};
use civic_scraper::error::ScrapeError;
use civic_scraper::models::AssetType;
use civic_scraper::runner::RunRequest;

/// Command-line arguments for civic_scraper.
///
/// # Examples
///
/// ```sh
/// # Metadata for one site over a date window
/// civic_scraper scrape --url http://nc-nashcounty.civicplus.com/AgendaCenter \
///     --start-date 2020-05-01 --end-date 2020-05-31
///
/// # Download agendas under 20 MB for every site in a CSV
/// civic_scraper scrape --urls-file sites.csv --download --file-size 20 --asset-type agenda
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scrape meeting asset metadata and optionally download the files
    Scrape(ScrapeArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["url", "urls_file", "sites_config"])))]
pub struct ScrapeArgs {
    /// A single site URL
    #[arg(long)]
    pub url: Option<String>,

    /// CSV file with a `url` column (and optional place, state_or_province, ...)
    #[arg(long)]
    pub urls_file: Option<PathBuf>,

    /// YAML list of site configurations
    #[arg(long)]
    pub sites_config: Option<PathBuf>,

    /// First meeting date to include (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub start_date: Option<NaiveDate>,

    /// Last meeting date to include (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub end_date: Option<NaiveDate>,

    /// Download assets into the cache
    #[arg(long)]
    pub download: bool,

    /// Keep fetched listing pages in the cache
    #[arg(long)]
    pub cache: bool,

    /// Maximum download size in MB
    #[arg(long)]
    pub file_size: Option<f64>,

    /// Asset type to download; repeat for several
    #[arg(long = "asset-type", value_parser = parse_asset_type)]
    pub asset_types: Vec<AssetType>,

    /// Cache directory
    #[arg(long, env = "CIVIC_SCRAPER_DIR")]
    pub cache_dir: Option<PathBuf>,
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_asset_type(raw: &str) -> Result<AssetType, String> {
    raw.parse::<AssetType>().map_err(|e| e.to_string())
}

impl ScrapeArgs {
    /// Site configurations from whichever source was given.
    pub fn sites(&self) -> Result<Vec<SiteConfig>, ScrapeError> {
        if let Some(url) = &self.url {
            Ok(vec![SiteConfig::new(url.trim())])
        } else if let Some(path) = &self.urls_file {
            load_urls_csv(path)
        } else if let Some(path) = &self.sites_config {
            load_sites_yaml(path)
        } else {
            Err(ScrapeError::Config("no site source given".to_string()))
        }
    }

    pub fn run_request(&self) -> Result<RunRequest, ScrapeError> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ScrapeError::Config(format!("start date {start} is after end date {end}")));
            }
        }
        Ok(RunRequest {
            sites: self.sites()?,
            start_date: self.start_date,
            end_date: self.end_date,
            cache: self.cache,
            download: self.download,
            file_size: self.file_size,
            asset_types: (!self.asset_types.is_empty()).then(|| self.asset_types.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrape_args(cli: Cli) -> ScrapeArgs {
        match cli.command {
            Command::Scrape(args) => args,
        }
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "civic_scraper",
            "scrape",
            "--url",
            "http://nc-nashcounty.civicplus.com/AgendaCenter",
            "--start-date",
            "2020-05-01",
            "--end-date",
            "2020-05-31",
            "--download",
            "--file-size",
            "20",
            "--asset-type",
            "agenda",
            "--asset-type",
            "minutes",
        ]);
        let args = scrape_args(cli);

        assert_eq!(args.url.as_deref(), Some("http://nc-nashcounty.civicplus.com/AgendaCenter"));
        assert_eq!(args.start_date, NaiveDate::from_ymd_opt(2020, 5, 1));
        assert!(args.download);
        assert!(!args.cache);
        assert_eq!(args.file_size, Some(20.0));
        assert_eq!(args.asset_types, vec![AssetType::Agenda, AssetType::Minutes]);

        let request = args.run_request().unwrap();
        assert_eq!(request.sites.len(), 1);
        assert_eq!(request.asset_types, Some(vec![AssetType::Agenda, AssetType::Minutes]));
    }

    #[test]
    fn test_site_source_is_required() {
        assert!(Cli::try_parse_from(["civic_scraper", "scrape"]).is_err());
        assert!(
            Cli::try_parse_from([
                "civic_scraper",
                "scrape",
                "--url",
                "https://a.legistar.com/Calendar.aspx",
                "--sites-config",
                "sites.yaml",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(
            Cli::try_parse_from(["civic_scraper", "scrape", "--url", "https://x", "--start-date", "05/01/2020"])
                .is_err()
        );
        assert!(
            Cli::try_parse_from(["civic_scraper", "scrape", "--url", "https://x", "--asset-type", "Not A Type"])
                .is_err()
        );
    }

    #[test]
    fn test_inverted_dates_are_rejected() {
        let args = scrape_args(Cli::parse_from([
            "civic_scraper",
            "scrape",
            "--url",
            "https://x.primegov.com",
            "--start-date",
            "2021-02-01",
            "--end-date",
            "2021-01-01",
        ]));
        assert!(matches!(args.run_request(), Err(ScrapeError::Config(_))));
    }

    #[test]
    fn test_empty_asset_types_means_all() {
        let args = scrape_args(Cli::parse_from(["civic_scraper", "scrape", "--url", "https://x.primegov.com"]));
        assert_eq!(args.run_request().unwrap().asset_types, None);
    }
}
