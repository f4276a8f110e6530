//! BoardDocs scraper.
//!
//! BoardDocs sites are addressed as `https://go.boarddocs.com/{state}/{place}/Board.nsf`.
//! Meetings are listed per committee by a form POST:
//!
//! ```text
//! POST {base}/BD-GetMeetingsList?open
//!      current_committee_id=A4EP6J588C05
//!
//! [{"unique": "CJ5QBD6B5B8E", "name": "Regular Meeting", "numberdate": "20230612"}, ...]
//! ```
//!
//! When no committee is configured, the first option of the committee
//! selector on `{base}/Public` is used.

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{
    DateRange, Platform, ScrapeOptions, Site, cache_listing, dedup_by_url, finish, keep_valid, meeting_id,
    parse_records,
};
use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection, SCRAPED_BY};
use crate::transport::Transport;
use crate::utils::squash_whitespace;

static COMMITTEE_OPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse("select[name='committeeid'] option").unwrap());
static SITE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://go\.boarddocs\.com/([^/]+)/([^/]+)/Board\.nsf").unwrap());

/// One entry of the meetings list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MeetingEntry {
    #[serde(default)]
    pub unique: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `YYYYMMDD`
    #[serde(default)]
    pub numberdate: Option<String>,
}

impl MeetingEntry {
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.numberdate.as_deref()?.trim(), "%Y%m%d").ok()
    }
}

/// Normalize any BoardDocs URL to end at `Board.nsf`.
///
/// ```ignore
/// assert_eq!(
///     normalize_url("go.boarddocs.com/pa/keyc/Board.nsf/Public"),
///     "https://go.boarddocs.com/pa/keyc/Board.nsf"
/// );
/// ```
pub fn normalize_url(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/').to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }
    if let Some(idx) = url.find("Board.nsf") {
        url.truncate(idx + "Board.nsf".len());
    }
    url
}

/// First committee option on the public page: `(id, label)`.
pub fn parse_committee(html: &str) -> Option<(String, Option<String>)> {
    let document = Html::parse_document(html);
    let option = document.select(&COMMITTEE_OPTION).next()?;
    let id = option.value().attr("value")?.trim().to_string();
    if id.is_empty() {
        return None;
    }
    let label = squash_whitespace(&option.text().collect::<String>());
    Some((id, (!label.is_empty()).then_some(label)))
}

/// BoardDocs adapter. Dates are unbounded unless given.
#[derive(Debug)]
pub struct BoardDocsSite {
    config: SiteConfig,
    base: String,
    state_or_province: Option<String>,
    place: Option<String>,
    transport: Arc<dyn Transport>,
    cache: Cache,
}

impl BoardDocsSite {
    pub fn new(config: SiteConfig, transport: Arc<dyn Transport>, cache: Cache) -> Result<Self, ScrapeError> {
        let base = normalize_url(&config.url);
        let (url_state, url_place) = match SITE_PATH.captures(&base) {
            Some(caps) => (Some(caps[1].to_ascii_lowercase()), Some(caps[2].to_string())),
            None => {
                warn!(url = %base, "BoardDocs URL does not encode state and place");
                (None, None)
            }
        };
        let url_state = url_state.filter(|s| s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()));

        Ok(Self {
            state_or_province: config.state_or_province.clone().or(url_state),
            place: config.place.clone().or(url_place),
            config,
            base,
            transport,
            cache,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Configured committee, else the first one listed on the public page.
    #[instrument(level = "debug", skip(self))]
    async fn committee(&self) -> Result<(String, Option<String>), ScrapeError> {
        if let Some(id) = &self.config.committee_id {
            return Ok((id.clone(), None));
        }
        let public = format!("{}/Public", self.base);
        let response = self.transport.get(&public).await?.error_for_status()?;
        let found = parse_committee(&response.text())
            .ok_or_else(|| ScrapeError::parse(&public, "no committee selector on public page"))?;
        info!(committee_id = %found.0, "Detected BoardDocs committee");
        Ok(found)
    }

    fn instance(&self) -> String {
        match (&self.state_or_province, &self.place) {
            (Some(state), Some(place)) => format!("{state}-{place}"),
            (None, Some(place)) => place.clone(),
            _ => crate::utils::subdomain(&self.base).unwrap_or_else(|| "boarddocs".to_string()),
        }
    }

    fn build_asset(&self, entry: &MeetingEntry, date: NaiveDate, committee: Option<&str>) -> Option<Asset> {
        keep_valid(
            &self.config.url,
            Asset::builder(format!("{}/goto?open&id={}", self.base, entry.unique))
                .asset_name(entry.name.clone().unwrap_or_else(|| "Meeting".to_string()))
                .committee_name(committee)
                .place(self.place.as_deref())
                .place_name(self.config.place_name.as_deref())
                .state_or_province(self.state_or_province.as_deref())
                .meeting_date(Some(date))
                .meeting_id(meeting_id(Platform::BoardDocs, &self.instance(), &entry.unique))
                .scraped_by(SCRAPED_BY)
                .build(),
        )
    }

    fn collect(&self, entries: &[MeetingEntry], range: DateRange, committee: Option<&str>) -> AssetCollection {
        dedup_by_url(entries.iter().filter_map(|entry| {
            if entry.unique.trim().is_empty() {
                debug!("Meeting entry without id; skipping");
                return None;
            }
            let Some(date) = entry.date() else {
                warn!(unique = %entry.unique, "Meeting entry has no usable date; skipping");
                return None;
            };
            if !range.contains(date) {
                return None;
            }
            self.build_asset(entry, date, committee)
        }))
    }
}

#[async_trait]
impl Site for BoardDocsSite {
    fn platform(&self) -> Platform {
        Platform::BoardDocs
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    #[instrument(level = "info", skip_all, fields(site = %self.base))]
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError> {
        let range = opts.date_range(None, None);
        let (committee_id, committee_name) = self.committee().await?;

        let endpoint = format!("{}/BD-GetMeetingsList?open", self.base);
        let form = vec![("current_committee_id".to_string(), committee_id.clone())];
        let response = self
            .transport
            .post_form(&endpoint, &form)
            .await?
            .error_for_status()?;
        let body = response.text();
        cache_listing(&self.cache, opts, &format!("{endpoint}&committee={committee_id}"), &body).await;

        let entries: Vec<MeetingEntry> = parse_records(&self.base, &body)?;
        info!(meetings = entries.len(), %committee_id, "Fetched meetings list");

        let assets = self.collect(&entries, range, committee_name.as_deref());
        finish(&self.base, assets, opts, false, self.transport.as_ref(), &self.cache).await
    }
}
