//! Data models for meeting assets and collections of them.
//!
//! This module defines the core data structures used throughout the crate:
//! - [`Asset`]: one downloadable artifact (agenda, minutes, media) tied to one meeting
//! - [`AssetType`]: the fixed set of asset tags plus platform-defined free-form tags
//! - [`MeetingTime`]: time of day with an optional fixed UTC offset
//! - [`AssetCollection`]: ordered list of assets with bulk download and CSV export
//! - [`DownloadFilter`]: the size/type policy applied to bulk downloads
//! - [`DownloadOutcome`]: per-asset result of a best-effort bulk download
//!
//! Assets are validated at construction through [`AssetBuilder`] and are
//! immutable afterwards, except for `content_type`/`content_length`, which
//! may be back-filled by a metadata probe or a download.

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{AssetError, ScrapeError};
use crate::transport::{HttpTransport, Transport};
use crate::utils::{extension_for_content_type, mb_to_bytes};

/// Provenance tag written to every asset's `scraped_by`.
pub const SCRAPED_BY: &str = concat!("civic-scraper_", env!("CARGO_PKG_VERSION"));

/// Kind of artifact an asset points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetType {
    Agenda,
    Minutes,
    Audio,
    Video,
    AgendaPacket,
    Captions,
    /// Platform-defined tag such as `meeting`. Always a lowercase word.
    Other(String),
}

impl AssetType {
    pub fn as_str(&self) -> &str {
        match self {
            AssetType::Agenda => "agenda",
            AssetType::Minutes => "minutes",
            AssetType::Audio => "audio",
            AssetType::Video => "video",
            AssetType::AgendaPacket => "agenda_packet",
            AssetType::Captions => "captions",
            AssetType::Other(tag) => tag,
        }
    }

    /// The free-form `meeting` tag used for meeting detail pages.
    pub fn meeting() -> Self {
        AssetType::Other("meeting".to_string())
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Ok(match tag.as_str() {
            "agenda" => AssetType::Agenda,
            "minutes" => AssetType::Minutes,
            "audio" => AssetType::Audio,
            "video" => AssetType::Video,
            "agenda_packet" => AssetType::AgendaPacket,
            "captions" => AssetType::Captions,
            _ => {
                let valid = !tag.is_empty()
                    && tag
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
                if !valid {
                    return Err(AssetError::InvalidAssetType(s.to_string()));
                }
                AssetType::Other(tag)
            }
        })
    }
}

/// Time of day a meeting starts, optionally anchored to a UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeetingTime {
    pub time: NaiveTime,
    pub offset: Option<FixedOffset>,
}

impl MeetingTime {
    pub fn naive(time: NaiveTime) -> Self {
        Self { time, offset: None }
    }

    pub fn with_offset(time: NaiveTime, offset: Option<FixedOffset>) -> Self {
        Self { time, offset }
    }
}

impl fmt::Display for MeetingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.time.format("%H:%M:%S"))?;
        if let Some(offset) = self.offset {
            write!(f, "{offset}")?;
        }
        Ok(())
    }
}

/// One retrievable artifact tied to one government meeting.
///
/// Build with [`Asset::builder`]; read through the accessor methods.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    url: String,
    asset_name: Option<String>,
    committee_name: Option<String>,
    place: Option<String>,
    place_name: Option<String>,
    state_or_province: Option<String>,
    asset_type: AssetType,
    meeting_date: Option<NaiveDate>,
    meeting_time: Option<MeetingTime>,
    meeting_id: Option<String>,
    scraped_by: Option<String>,
    content_type: Option<String>,
    content_length: Option<u64>,
}

/// Validating builder for [`Asset`].
#[derive(Debug, Clone)]
pub struct AssetBuilder {
    url: String,
    asset_name: Option<String>,
    committee_name: Option<String>,
    place: Option<String>,
    place_name: Option<String>,
    state_or_province: Option<String>,
    asset_type: Option<AssetType>,
    meeting_date: Option<NaiveDate>,
    meeting_time: Option<MeetingTime>,
    meeting_id: Option<String>,
    scraped_by: Option<String>,
    content_type: Option<String>,
    content_length: Option<u64>,
}

impl AssetBuilder {
    pub fn asset_name(mut self, v: impl Into<String>) -> Self {
        self.asset_name = Some(v.into());
        self
    }

    pub fn committee_name(mut self, v: Option<impl Into<String>>) -> Self {
        self.committee_name = v.map(Into::into);
        self
    }

    pub fn place(mut self, v: Option<impl Into<String>>) -> Self {
        self.place = v.map(Into::into);
        self
    }

    pub fn place_name(mut self, v: Option<impl Into<String>>) -> Self {
        self.place_name = v.map(Into::into);
        self
    }

    pub fn state_or_province(mut self, v: Option<impl Into<String>>) -> Self {
        self.state_or_province = v.map(Into::into);
        self
    }

    pub fn asset_type(mut self, v: AssetType) -> Self {
        self.asset_type = Some(v);
        self
    }

    pub fn meeting_date(mut self, v: Option<NaiveDate>) -> Self {
        self.meeting_date = v;
        self
    }

    pub fn meeting_time(mut self, v: Option<MeetingTime>) -> Self {
        self.meeting_time = v;
        self
    }

    pub fn meeting_id(mut self, v: impl Into<String>) -> Self {
        self.meeting_id = Some(v.into());
        self
    }

    pub fn scraped_by(mut self, v: impl Into<String>) -> Self {
        self.scraped_by = Some(v.into());
        self
    }

    pub fn content_type(mut self, v: Option<impl Into<String>>) -> Self {
        self.content_type = v.map(Into::into);
        self
    }

    pub fn content_length(mut self, v: Option<u64>) -> Self {
        self.content_length = v;
        self
    }

    /// Validate and construct.
    ///
    /// # Errors
    ///
    /// - [`AssetError::EmptyUrl`] / [`AssetError::UnsupportedScheme`] for a bad URL
    /// - [`AssetError::InvalidStateCode`] when a state code is not two letters
    pub fn build(self) -> Result<Asset, AssetError> {
        if self.url.trim().is_empty() {
            return Err(AssetError::EmptyUrl);
        }
        match Url::parse(&self.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(AssetError::UnsupportedScheme(self.url)),
        }

        let state_or_province = match self.state_or_province {
            Some(code) => {
                let code = code.trim();
                if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(AssetError::InvalidStateCode(code.to_string()));
                }
                Some(code.to_ascii_lowercase())
            }
            None => None,
        };

        Ok(Asset {
            url: self.url,
            asset_name: self.asset_name,
            committee_name: self.committee_name,
            place: self.place,
            place_name: self.place_name,
            state_or_province,
            asset_type: self.asset_type.unwrap_or_else(AssetType::meeting),
            meeting_date: self.meeting_date,
            meeting_time: self.meeting_time,
            meeting_id: self.meeting_id,
            scraped_by: self.scraped_by,
            content_type: self.content_type,
            content_length: self.content_length,
        })
    }
}

impl Asset {
    /// Start building an asset for `url`.
    pub fn builder(url: impl Into<String>) -> AssetBuilder {
        AssetBuilder {
            url: url.into(),
            asset_name: None,
            committee_name: None,
            place: None,
            place_name: None,
            state_or_province: None,
            asset_type: None,
            meeting_date: None,
            meeting_time: None,
            meeting_id: None,
            scraped_by: None,
            content_type: None,
            content_length: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn asset_name(&self) -> Option<&str> {
        self.asset_name.as_deref()
    }

    pub fn committee_name(&self) -> Option<&str> {
        self.committee_name.as_deref()
    }

    pub fn place(&self) -> Option<&str> {
        self.place.as_deref()
    }

    pub fn place_name(&self) -> Option<&str> {
        self.place_name.as_deref()
    }

    pub fn state_or_province(&self) -> Option<&str> {
        self.state_or_province.as_deref()
    }

    pub fn asset_type(&self) -> &AssetType {
        &self.asset_type
    }

    pub fn meeting_date(&self) -> Option<NaiveDate> {
        self.meeting_date
    }

    pub fn meeting_time(&self) -> Option<MeetingTime> {
        self.meeting_time
    }

    pub fn meeting_id(&self) -> Option<&str> {
        self.meeting_id.as_deref()
    }

    pub fn scraped_by(&self) -> Option<&str> {
        self.scraped_by.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Back-fill HTTP-derived descriptors. Existing values are only replaced
    /// by present ones.
    pub fn set_content_info(&mut self, content_type: Option<&str>, content_length: Option<u64>) {
        if let Some(ct) = content_type {
            self.content_type = Some(ct.to_string());
        }
        if let Some(len) = content_length {
            self.content_length = Some(len);
        }
    }

    /// `{meeting_id}_{asset_type}`, the file name without its extension.
    ///
    /// Assets without a meeting id fall back to the last URL path segment.
    pub fn file_stem(&self) -> String {
        let base = match &self.meeting_id {
            Some(id) => id.clone(),
            None => self
                .url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("asset")
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                .collect(),
        };
        format!("{}_{}", base, self.asset_type)
    }

    /// Deterministic download file name: `{meeting_id}_{asset_type}{ext}`.
    pub fn file_name(&self) -> String {
        self.numbered_file_name(None)
    }

    /// File name for the `copy`-th asset sharing a stem: `{stem}_{copy}{ext}`.
    pub fn numbered_file_name(&self, copy: Option<usize>) -> String {
        let ext = extension_for_content_type(self.content_type.as_deref());
        match copy {
            Some(n) => format!("{}_{n}{ext}", self.file_stem()),
            None => format!("{}{ext}", self.file_stem()),
        }
    }

    /// Download the asset into `target_dir` and return the written path.
    ///
    /// Creates `target_dir` if missing. Uses `transport` when given (connection
    /// reuse, custom headers), otherwise a one-off default client. Missing
    /// `content_type`/`content_length` are back-filled from the response
    /// before the file name is resolved.
    ///
    /// # Errors
    ///
    /// Network, non-2xx and file system failures propagate to the caller.
    pub async fn download(
        &mut self,
        target_dir: &Path,
        transport: Option<&dyn Transport>,
    ) -> Result<PathBuf, ScrapeError> {
        self.download_numbered(target_dir, transport, None).await
    }

    /// [`Asset::download`] under [`Asset::numbered_file_name`].
    ///
    /// The body streams into a hidden `.part` file that is renamed once the
    /// final name is known, so a failed transfer never leaves a named file.
    #[instrument(level = "info", skip_all, fields(url = %self.url, copy = ?copy))]
    pub async fn download_numbered(
        &mut self,
        target_dir: &Path,
        transport: Option<&dyn Transport>,
        copy: Option<usize>,
    ) -> Result<PathBuf, ScrapeError> {
        fs::create_dir_all(target_dir).await?;

        let fallback;
        let transport: &dyn Transport = match transport {
            Some(t) => t,
            None => {
                fallback = HttpTransport::new(std::time::Duration::from_secs(60))?;
                &fallback
            }
        };

        let partial = target_dir.join(format!(".{}.part", self.numbered_file_name(copy)));
        let (head, written) = match transport.download_to(&self.url, &partial).await {
            Ok(done) => done,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    debug!(path = %partial.display(), error = %cleanup, "No partial file to remove");
                }
                return Err(e);
            }
        };

        if self.content_type.is_none() {
            self.content_type = head.content_type().map(str::to_string);
        }
        if self.content_length.is_none() {
            self.content_length = Some(head.content_length().unwrap_or(written));
        }

        let path = target_dir.join(self.numbered_file_name(copy));
        fs::rename(&partial, &path).await?;
        info!(path = %path.display(), bytes = written, "Downloaded asset");
        Ok(path)
    }
}

/// Which assets a bulk download should fetch.
///
/// Metadata scraping is never filtered; this applies only to downloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadFilter {
    /// Maximum size in megabytes. Assets of unknown size pass.
    pub max_size_mb: Option<f64>,
    /// Allow-list of asset types. `None` allows every type.
    pub asset_types: Option<Vec<AssetType>>,
}

impl DownloadFilter {
    pub fn new(max_size_mb: Option<f64>, asset_types: Option<Vec<AssetType>>) -> Self {
        Self {
            max_size_mb,
            asset_types,
        }
    }

    /// True when the asset should be downloaded.
    pub fn permits(&self, asset: &Asset) -> bool {
        if let Some(types) = &self.asset_types {
            if !types.contains(asset.asset_type()) {
                return false;
            }
        }
        if let (Some(max_mb), Some(len)) = (self.max_size_mb, asset.content_length()) {
            if len as f64 > mb_to_bytes(max_mb) {
                return false;
            }
        }
        true
    }

    /// True when size information is needed to apply this filter.
    pub fn needs_size(&self) -> bool {
        self.max_size_mb.is_some()
    }
}

/// What happened to one asset in a best-effort bulk download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Written { url: String, path: PathBuf },
    /// Excluded by the download filter.
    Skipped { url: String },
    Failed { url: String, message: String },
}

/// Ordered container of assets in discovery order.
///
/// No uniqueness is enforced here; adapters deduplicate before pushing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetCollection {
    assets: Vec<Asset>,
}

impl AssetCollection {
    /// Number of concurrent downloads in [`AssetCollection::download`].
    pub const PARALLEL_DOWNLOADS: usize = 4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, asset: Asset) {
        self.assets.push(asset);
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Asset> {
        self.assets.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Asset> {
        self.assets.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Asset> {
        self.assets.get(index)
    }

    pub fn as_slice(&self) -> &[Asset] {
        &self.assets
    }

    /// Copy numbers for assets whose file stem repeats: `None` for the first
    /// holder of a stem, then `Some(2)`, `Some(3)`... in collection order.
    fn copy_numbers(&self) -> Vec<Option<usize>> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        self.assets
            .iter()
            .map(|asset| {
                let n = seen.entry(asset.file_stem()).or_insert(0);
                *n += 1;
                (*n > 1).then_some(*n)
            })
            .collect()
    }

    /// Download every permitted asset, keeping each result in input order.
    async fn download_each(
        &mut self,
        target_dir: &Path,
        filter: &DownloadFilter,
        transport: Option<&dyn Transport>,
    ) -> Vec<Result<Option<PathBuf>, ScrapeError>> {
        let copies = self.copy_numbers();
        let pending = std::mem::take(&mut self.assets);

        let done: Vec<(Asset, Result<Option<PathBuf>, ScrapeError>)> =
            stream::iter(pending.into_iter().zip(copies))
                .map(|(mut asset, copy)| async move {
                    if !filter.permits(&asset) {
                        debug!(url = %asset.url(), asset_type = %asset.asset_type(), "Skipping download");
                        return (asset, Ok(None));
                    }
                    let result = asset.download_numbered(target_dir, transport, copy).await.map(Some);
                    (asset, result)
                })
                .buffered(Self::PARALLEL_DOWNLOADS)
                .collect()
                .await;

        let (assets, results): (Vec<Asset>, Vec<_>) = done.into_iter().unzip();
        self.assets = assets;
        results
    }

    /// Download every asset the filter permits into `target_dir`.
    ///
    /// Returns one entry per asset, in input order: the written path, or
    /// `None` for assets skipped by the filter. Assets sharing a file stem get
    /// numbered names, so no two downloads write the same path. Every
    /// permitted asset is attempted; the first failure is then returned.
    #[instrument(level = "info", skip_all, fields(target_dir = %target_dir.display(), count = self.assets.len()))]
    pub async fn download(
        &mut self,
        target_dir: &Path,
        filter: &DownloadFilter,
        transport: Option<&dyn Transport>,
    ) -> Result<Vec<Option<PathBuf>>, ScrapeError> {
        let results = self.download_each(target_dir, filter, transport).await;
        let paths = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        let written = paths.iter().filter(|p| p.is_some()).count();
        if written < paths.len() {
            warn!(skipped = paths.len() - written, "Some assets were filtered out of the download");
        }
        info!(written, "Bulk download complete");
        Ok(paths)
    }

    /// Like [`AssetCollection::download`], but a failed asset is logged and
    /// recorded instead of failing the batch.
    #[instrument(level = "info", skip_all, fields(target_dir = %target_dir.display(), count = self.assets.len()))]
    pub async fn download_best_effort(
        &mut self,
        target_dir: &Path,
        filter: &DownloadFilter,
        transport: Option<&dyn Transport>,
    ) -> Vec<DownloadOutcome> {
        let results = self.download_each(target_dir, filter, transport).await;
        let outcomes: Vec<DownloadOutcome> = self
            .assets
            .iter()
            .zip(results)
            .map(|(asset, result)| {
                let url = asset.url().to_string();
                match result {
                    Ok(Some(path)) => DownloadOutcome::Written { url, path },
                    Ok(None) => DownloadOutcome::Skipped { url },
                    Err(e) => {
                        warn!(%url, error = %e, "Download failed");
                        DownloadOutcome::Failed {
                            url,
                            message: e.to_string(),
                        }
                    }
                }
            })
            .collect();

        let written = outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Written { .. }))
            .count();
        info!(written, total = outcomes.len(), "Downloads complete");
        outcomes
    }

    /// Write a metadata CSV into `target_dir`; see [`crate::outputs::csv`].
    pub async fn to_csv(&self, target_dir: &Path) -> Result<PathBuf, ScrapeError> {
        crate::outputs::csv::write_assets(self, target_dir).await
    }
}

impl Extend<Asset> for AssetCollection {
    fn extend<I: IntoIterator<Item = Asset>>(&mut self, iter: I) {
        self.assets.extend(iter);
    }
}

impl FromIterator<Asset> for AssetCollection {
    fn from_iter<I: IntoIterator<Item = Asset>>(iter: I) -> Self {
        Self {
            assets: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for AssetCollection {
    type Item = Asset;
    type IntoIter = std::vec::IntoIter<Asset>;

    fn into_iter(self) -> Self::IntoIter {
        self.assets.into_iter()
    }
}

impl<'a> IntoIterator for &'a AssetCollection {
    type Item = &'a Asset;
    type IntoIter = std::slice::Iter<'a, Asset>;

    fn into_iter(self) -> Self::IntoIter {
        self.assets.iter()
    }
}
