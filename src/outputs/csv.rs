//! Metadata CSV export.
//!
//! Every run writes a fresh file named after the UTC time it was produced,
//! so earlier snapshots are never overwritten:
//!
//! ```text
//! civic_scraper_assets_meta_20201225T101500123z.csv
//! ```
//!
//! The header row is always written, even for an empty collection.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection};

/// Column order of the metadata export.
pub const HEADERS: [&str; 13] = [
    "place",
    "place_name",
    "state_or_province",
    "meeting_date",
    "meeting_time",
    "committee_name",
    "meeting_id",
    "asset_name",
    "asset_type",
    "url",
    "scraped_by",
    "content_type",
    "content_length",
];

/// One CSV row; field order matches [`HEADERS`].
#[derive(Debug, Serialize)]
struct Row<'a> {
    place: Option<&'a str>,
    place_name: Option<&'a str>,
    state_or_province: Option<&'a str>,
    meeting_date: Option<String>,
    meeting_time: Option<String>,
    committee_name: Option<&'a str>,
    meeting_id: Option<&'a str>,
    asset_name: Option<&'a str>,
    asset_type: &'a str,
    url: &'a str,
    scraped_by: Option<&'a str>,
    content_type: Option<&'a str>,
    content_length: Option<u64>,
}

impl<'a> From<&'a Asset> for Row<'a> {
    fn from(asset: &'a Asset) -> Self {
        Row {
            place: asset.place(),
            place_name: asset.place_name(),
            state_or_province: asset.state_or_province(),
            meeting_date: asset.meeting_date().map(|d| d.format("%Y-%m-%d").to_string()),
            meeting_time: asset.meeting_time().map(|t| t.to_string()),
            committee_name: asset.committee_name(),
            meeting_id: asset.meeting_id(),
            asset_name: asset.asset_name(),
            asset_type: asset.asset_type().as_str(),
            url: asset.url(),
            scraped_by: asset.scraped_by(),
            content_type: asset.content_type(),
            content_length: asset.content_length(),
        }
    }
}

/// File name for an export produced at `at`.
pub fn file_name_for(at: DateTime<Utc>) -> String {
    format!("civic_scraper_assets_meta_{}z.csv", at.format("%Y%m%dT%H%M%S%3f"))
}

/// Serialize the collection to CSV bytes, header first.
pub fn render(assets: &AssetCollection) -> Result<Vec<u8>, ScrapeError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(HEADERS)?;
    for asset in assets {
        writer.serialize(Row::from(asset))?;
    }
    writer
        .into_inner()
        .map_err(|e| ScrapeError::Io(e.into_error()))
}

/// Write the metadata CSV for `assets` into `target_dir`, stamped with the current time.
pub async fn write_assets(assets: &AssetCollection, target_dir: &Path) -> Result<PathBuf, ScrapeError> {
    write_assets_at(assets, target_dir, Utc::now()).await
}

/// Write the metadata CSV stamped with `at`.
///
/// The file is created with create-new semantics. If a file with the same
/// stamp already exists the stamp is advanced by one millisecond until a
/// free name is found.
#[instrument(level = "info", skip_all, fields(target_dir = %target_dir.display(), count = assets.len()))]
pub async fn write_assets_at(
    assets: &AssetCollection,
    target_dir: &Path,
    at: DateTime<Utc>,
) -> Result<PathBuf, ScrapeError> {
    fs::create_dir_all(target_dir).await?;
    let bytes = render(assets)?;

    let mut stamp = at;
    loop {
        let path = target_dir.join(file_name_for(stamp));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(&bytes).await?;
                file.flush().await?;
                info!(path = %path.display(), rows = assets.len(), "Wrote asset metadata CSV");
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Metadata file exists; advancing timestamp");
                stamp += Duration::milliseconds(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
