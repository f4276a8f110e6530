//! Granicus ViewPublisher scraper.
//!
//! Granicus media portals publish their archive as an HTML table at
//! `https://{instance}.granicus.com/ViewPublisher.php?view_id=N`:
//!
//! ```text
//! tr.listingRow
//! ├── td[headers^="Name"]       City Council Regular Meeting
//! ├── td[headers^="Date"]       Jun 12, 2023  (or 06/12/23)
//! ├── td[headers^="Duration"]   01h 35m
//! ├── a "Agenda"                //x.granicus.com/AgendaViewer.php?view_id=1&clip_id=812
//! ├── a "Minutes"               //x.granicus.com/MinutesViewer.php?view_id=1&clip_id=812
//! ├── a "Video"                 onclick="window.open('//x.granicus.com/MediaPlayer.php?...')"
//! ├── a "MP3 Audio" / "MP4 Video"
//! ├── a "Captions"
//! └── a "Agenda Packet"
//! ```
//!
//! Some portals keep their meetings under another view id; when the
//! configured view answers "Page not found." views 1, 2 and 33 are tried.

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DateRange, Platform, ScrapeOptions, Site, cache_listing, dedup_by_url, finish, keep_valid, meeting_id};
use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection, AssetType, SCRAPED_BY};
use crate::transport::Transport;
use crate::utils::{query_param, squash_whitespace, subdomain, today_local};

static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").unwrap());

static LONG_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Z][a-z]{2,8})\.?\s+(\d{1,2}),\s+(\d{4})").unwrap());
static SHORT_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4}|\d{2})\b").unwrap());
static POPUP: Lazy<Regex> = Lazy::new(|| Regex::new(r#"window\.open\(\s*['"]([^'"]+)['"]"#).unwrap());
static VIEW_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)view_id=\d*").unwrap());

const PAGE_NOT_FOUND: &str = "Page not found.";
const FALLBACK_VIEWS: [u32; 3] = [1, 2, 33];

/// One row of the published meetings table.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMeeting {
    pub name: String,
    pub date: NaiveDate,
    pub duration: Option<String>,
    pub native_id: String,
    pub documents: Vec<(AssetType, String)>,
}

/// Asset type of a row link, from its label and then its URL.
fn link_type(label: &str, url: &str) -> Option<AssetType> {
    let label = label.to_ascii_lowercase();
    let url = url.to_ascii_lowercase();
    if label.contains("packet") {
        Some(AssetType::AgendaPacket)
    } else if label.contains("caption") {
        Some(AssetType::Captions)
    } else if label.contains("mp3") || url.ends_with(".mp3") {
        Some(AssetType::Audio)
    } else if label.contains("mp4") || label == "video" || url.ends_with(".mp4") || url.contains("mediaplayer.php") {
        Some(AssetType::Video)
    } else if label.contains("minutes") || url.contains("minutesviewer.php") {
        Some(AssetType::Minutes)
    } else if label == "agenda" || url.contains("agendaviewer.php") {
        Some(AssetType::Agenda)
    } else {
        None
    }
}

/// Target of a link: its href, or the URL its `onclick` popup opens.
fn link_target(anchor: ElementRef<'_>, base: &Url) -> Option<String> {
    let el = anchor.value();
    let raw = match el.attr("href").map(str::trim) {
        Some(href) if !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript") => {
            href.to_string()
        }
        _ => POPUP.captures(el.attr("onclick")?)?[1].to_string(),
    };
    base.join(&raw).ok().map(|u| u.to_string())
}

/// `Jun 12, 2023`, `June 12, 2023` or `06/12/23`.
pub fn parse_listing_date(text: &str) -> Option<NaiveDate> {
    if let Some(caps) = LONG_DATE.captures(text) {
        let month: String = caps[1].chars().take(3).collect();
        return NaiveDate::parse_from_str(&format!("{month} {} {}", &caps[2], &caps[3]), "%b %d %Y").ok();
    }
    let caps = SHORT_DATE.captures(text)?;
    let year: i32 = caps[3].parse().ok()?;
    let year = if caps[3].len() == 2 { 2000 + year } else { year };
    NaiveDate::from_ymd_opt(year, caps[1].parse().ok()?, caps[2].parse().ok()?)
}

/// Stable row id: the clip or event id of any link, else date and name.
fn native_id(name: &str, date: NaiveDate, documents: &[(AssetType, String)]) -> String {
    documents
        .iter()
        .find_map(|(_, url)| query_param(url, "clip_id").or_else(|| query_param(url, "event_id")))
        .unwrap_or_else(|| {
            let slug: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect();
            format!("{}-{}", date.format("%Y%m%d"), slug.trim_matches('-'))
        })
}

fn parse_row(row: ElementRef<'_>, base: &Url) -> Option<PublishedMeeting> {
    let mut name = None;
    let mut date_text = None;
    let mut duration = None;
    let mut documents = Vec::new();

    for cell in row.select(&CELL) {
        let text = squash_whitespace(&cell.text().collect::<String>());
        match cell.value().attr("headers").and_then(|h| h.split_whitespace().next()) {
            Some("Name") => name = Some(text),
            Some("Date") => date_text = Some(text),
            Some("Duration") => duration = Some(text).filter(|d| !d.is_empty()),
            _ => {
                for anchor in cell.select(&ANCHOR) {
                    let label = squash_whitespace(&anchor.text().collect::<String>());
                    let Some(url) = link_target(anchor, base) else {
                        continue;
                    };
                    if let Some(kind) = link_type(&label, &url) {
                        documents.push((kind, url));
                    }
                }
            }
        }
    }

    let name = name.filter(|n| !n.is_empty())?;
    let Some(date) = date_text.as_deref().and_then(parse_listing_date) else {
        warn!(meeting = %name, "Published meeting has no usable date; skipping");
        return None;
    };
    Some(PublishedMeeting {
        native_id: native_id(&name, date, &documents),
        name,
        date,
        duration,
        documents,
    })
}

/// Parse every meeting row of a ViewPublisher page.
pub fn parse_publisher_page(html: &str, page_url: &str) -> Result<Vec<PublishedMeeting>, ScrapeError> {
    let base = Url::parse(page_url)?;
    let document = Html::parse_document(html);
    Ok(document.select(&ROW).filter_map(|row| parse_row(row, &base)).collect())
}

/// The configured URL, then the same page under each fallback view id.
fn view_candidates(url: &str) -> Vec<String> {
    let mut candidates = vec![url.to_string()];
    if VIEW_ID.is_match(url) {
        for view in FALLBACK_VIEWS {
            let candidate = VIEW_ID.replace(url, format!("view_id={view}")).into_owned();
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Granicus ViewPublisher adapter. Both dates default to today.
#[derive(Debug)]
pub struct GranicusPublisherSite {
    config: SiteConfig,
    instance: String,
    transport: Arc<dyn Transport>,
    cache: Cache,
}

impl GranicusPublisherSite {
    pub fn new(config: SiteConfig, transport: Arc<dyn Transport>, cache: Cache) -> Result<Self, ScrapeError> {
        let instance = subdomain(config.url.trim())
            .ok_or_else(|| ScrapeError::Config(format!("no host in {}", config.url)))?;
        Ok(Self {
            config,
            instance,
            transport,
            cache,
        })
    }

    /// First view that serves a meetings page: `(response url, body)`.
    async fn listing(&self) -> Result<(String, String), ScrapeError> {
        let mut failure = None;
        for candidate in view_candidates(self.config.url.trim()) {
            let response = self.transport.get(&candidate).await?;
            let body = response.text();
            if response.is_success() && body.trim() != PAGE_NOT_FOUND {
                return Ok((response.url, body));
            }
            debug!(url = %candidate, status = response.status, "No published meetings under this view");
            failure = Some(if response.is_success() {
                ScrapeError::parse(&candidate, "page not found")
            } else {
                ScrapeError::Status {
                    url: response.url,
                    status: response.status,
                }
            });
        }
        Err(failure.unwrap_or_else(|| ScrapeError::Config(format!("no view to fetch for {}", self.config.url))))
    }

    fn assets_for(&self, meeting: PublishedMeeting) -> Vec<Asset> {
        let id = meeting_id(Platform::GranicusPublisher, &self.instance, &meeting.native_id);
        meeting
            .documents
            .into_iter()
            .filter_map(|(kind, url)| {
                keep_valid(
                    &self.config.url,
                    Asset::builder(url)
                        .asset_name(meeting.name.clone())
                        .committee_name(Some(meeting.name.as_str()))
                        .place(self.config.place.as_deref())
                        .place_name(self.config.place_name.as_deref())
                        .state_or_province(self.config.state_or_province.as_deref())
                        .asset_type(kind)
                        .meeting_date(Some(meeting.date))
                        .meeting_id(id.clone())
                        .scraped_by(SCRAPED_BY)
                        .build(),
                )
            })
            .collect()
    }

    fn collect(&self, meetings: Vec<PublishedMeeting>, range: DateRange) -> AssetCollection {
        dedup_by_url(
            meetings
                .into_iter()
                .filter(|m| range.contains(m.date))
                .flat_map(|m| self.assets_for(m)),
        )
    }
}

#[async_trait]
impl Site for GranicusPublisherSite {
    fn platform(&self) -> Platform {
        Platform::GranicusPublisher
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    #[instrument(level = "info", skip_all, fields(site = %self.config.url))]
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError> {
        let today = today_local();
        let range = opts.date_range(Some(today), Some(today));
        let (page_url, body) = self.listing().await?;
        cache_listing(&self.cache, opts, &page_url, &body).await;

        let meetings = parse_publisher_page(&body, &page_url)?;
        info!(meetings = meetings.len(), "Parsed published meetings");

        let assets = self.collect(meetings, range);
        finish(&self.config.url, assets, opts, true, self.transport.as_ref(), &self.cache).await
    }
}
