//! Granicus (iqm2) RSS calendar scraper.
//!
//! iqm2 portals publish their meeting calendar as RSS
//! (`https://{instance}.iqm2.com/Services/RSS.aspx?Feed=Calendar`). Each item
//! describes one meeting:
//!
//! ```text
//! <item>
//!   <title>Board of Supervisors - Regular Meeting - Jan 12, 2021 9:00 AM</title>
//!   <link>https://x.iqm2.com/Citizens/Detail_Meeting.aspx?ID=2341</link>
//!   <category>Board of Supervisors</category>
//!   <description>Meeting Date: 1/12/2021&lt;br&gt;Meeting Time: 9:00 AM ...</description>
//!   <pubDate>Mon, 04 Jan 2021 17:00:00 GMT</pubDate>
//! </item>
//! ```
//!
//! Every item yields a `meeting` asset for the detail page, plus one asset per
//! agenda/minutes/packet/media link embedded in the description.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DateRange, Platform, ScrapeOptions, Site, cache_listing, dedup_by_url, finish, keep_valid, meeting_id};
use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection, AssetType, MeetingTime, SCRAPED_BY};
use crate::transport::Transport;
use crate::utils::{query_param, squash_whitespace, subdomain};

static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static MEETING_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Meeting\s+Date:\s*(\d{1,2}/\d{1,2}/\d{4})").unwrap());
static MEETING_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Meeting\s+Time:\s*(\d{1,2}:\d{2}\s*[AP]M)").unwrap());
static TITLE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Z][a-z]{2}\s+\d{1,2},\s+\d{4})").unwrap());
static TITLE_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d{1,2}:\d{2}\s*[AP]M)").unwrap());

/// One RSS `<item>`, fields as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub category: String,
    pub description: String,
    pub pub_date: String,
}

/// Read every `<item>` of an RSS document.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, ScrapeError> {
    let mut reader = Reader::from_str(xml);

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut field: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if name == "item" {
                    current = Some(FeedItem::default());
                } else if current.is_some() && field.is_none() {
                    field = Some(name);
                    text.clear();
                }
            }
            Event::Text(t) => {
                if field.is_some() {
                    let raw = utf8(&t)?;
                    match quick_xml::escape::unescape(&raw) {
                        Ok(resolved) => text.push_str(&resolved),
                        Err(_) => text.push_str(&raw),
                    }
                }
            }
            Event::CData(c) => {
                if field.is_some() {
                    text.push_str(&utf8(&c)?);
                }
            }
            Event::GeneralRef(r) => {
                if field.is_some() {
                    let entity = format!("&{};", utf8(&r)?);
                    match quick_xml::escape::unescape(&entity) {
                        Ok(resolved) => text.push_str(&resolved),
                        Err(_) => text.push_str(&entity),
                    }
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if name == "item" {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                    field = None;
                } else if field.as_deref() == Some(name.as_str()) {
                    if let Some(item) = current.as_mut() {
                        let value = text.trim().to_string();
                        match name.as_str() {
                            "title" => item.title = value,
                            "link" => item.link = value,
                            "category" => item.category = value,
                            "description" => item.description = value,
                            "pubdate" => item.pub_date = value,
                            _ => {}
                        }
                    }
                    field = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    debug!(count = items.len(), "Parsed RSS items");
    Ok(items)
}

fn utf8(bytes: &[u8]) -> Result<String, ScrapeError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| ScrapeError::parse("rss", format!("invalid UTF-8 in feed: {e}")))
}

/// Meeting date: the description's `Meeting Date:` line, else a date in the title.
fn meeting_date(item: &FeedItem) -> Option<NaiveDate> {
    if let Some(caps) = MEETING_DATE.captures(&item.description) {
        return NaiveDate::parse_from_str(&caps[1], "%m/%d/%Y").ok();
    }
    let caps = TITLE_DATE.captures(&item.title)?;
    NaiveDate::parse_from_str(&squash_whitespace(&caps[1]), "%b %d, %Y").ok()
}

fn meeting_time(item: &FeedItem) -> Option<NaiveTime> {
    let raw = MEETING_TIME
        .captures(&item.description)
        .or_else(|| TITLE_TIME.captures(&item.title))
        .map(|caps| caps[1].to_ascii_uppercase())?;
    let normalized = squash_whitespace(&raw.replace("AM", " AM").replace("PM", " PM"));
    NaiveTime::parse_from_str(&normalized, "%I:%M %p").ok()
}

/// Classify an embedded link by its anchor text.
fn link_type(label: &str) -> Option<AssetType> {
    let label = label.to_ascii_lowercase();
    if label.contains("packet") {
        Some(AssetType::AgendaPacket)
    } else if label.contains("agenda") {
        Some(AssetType::Agenda)
    } else if label.contains("minutes") {
        Some(AssetType::Minutes)
    } else if label.contains("caption") {
        Some(AssetType::Captions)
    } else if label.contains("video") || label.contains("mp4") {
        Some(AssetType::Video)
    } else if label.contains("audio") || label.contains("mp3") {
        Some(AssetType::Audio)
    } else {
        None
    }
}

/// Document links embedded in an item's HTML description.
fn description_links(description: &str, base: &str) -> Vec<(AssetType, String)> {
    let fragment = Html::parse_fragment(description);
    let base = Url::parse(base).ok();
    fragment
        .select(&LINK)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let label: String = a.text().collect();
            let kind = link_type(&label)?;
            let url = match &base {
                Some(base) => base.join(href).ok()?.to_string(),
                None => href.to_string(),
            };
            Some((kind, url))
        })
        .collect()
}

/// A meeting ready to become assets.
#[derive(Debug, Clone, PartialEq)]
struct Meeting {
    native_id: String,
    title: String,
    committee: Option<String>,
    detail_url: String,
    date: NaiveDate,
    time: Option<NaiveTime>,
    documents: Vec<(AssetType, String)>,
}

fn meeting_from_item(item: &FeedItem) -> Option<Meeting> {
    let Some(native_id) = query_param(&item.link, "ID") else {
        warn!(link = %item.link, "RSS item link has no ID; skipping");
        return None;
    };
    let Some(date) = meeting_date(item) else {
        warn!(title = %item.title, "RSS item has no meeting date; skipping");
        return None;
    };
    let committee = if item.category.is_empty() {
        item.title.split(" - ").next().map(str::trim).map(str::to_string)
    } else {
        Some(item.category.clone())
    };
    Some(Meeting {
        native_id,
        title: item.title.clone(),
        committee,
        detail_url: item.link.clone(),
        date,
        time: meeting_time(item),
        documents: description_links(&item.description, &item.link),
    })
}

/// Granicus iqm2 RSS adapter. Dates are unbounded unless given.
#[derive(Debug)]
pub struct GranicusSite {
    config: SiteConfig,
    instance: String,
    offset: Option<FixedOffset>,
    transport: Arc<dyn Transport>,
    cache: Cache,
}

impl GranicusSite {
    pub fn new(config: SiteConfig, transport: Arc<dyn Transport>, cache: Cache) -> Result<Self, ScrapeError> {
        let instance = subdomain(config.url.trim())
            .ok_or_else(|| ScrapeError::Config(format!("no host in {}", config.url)))?;
        let offset = config.offset()?;
        Ok(Self {
            config,
            instance,
            offset,
            transport,
            cache,
        })
    }

    fn assets_for(&self, meeting: Meeting) -> Vec<Asset> {
        let id = meeting_id(Platform::Granicus, &self.instance, &meeting.native_id);
        let time = meeting.time.map(|t| MeetingTime::with_offset(t, self.offset));
        let build = |url: &str, kind: AssetType| {
            keep_valid(
                &self.config.url,
                Asset::builder(url)
                    .asset_name(meeting.title.clone())
                    .committee_name(meeting.committee.clone())
                    .place(self.config.place.as_deref())
                    .place_name(self.config.place_name.as_deref())
                    .state_or_province(self.config.state_or_province.as_deref())
                    .asset_type(kind)
                    .meeting_date(Some(meeting.date))
                    .meeting_time(time)
                    .meeting_id(id.clone())
                    .scraped_by(SCRAPED_BY)
                    .build(),
            )
        };

        std::iter::once((AssetType::meeting(), meeting.detail_url.clone()))
            .chain(meeting.documents.iter().cloned())
            .filter_map(|(kind, url)| build(&url, kind))
            .collect()
    }

    fn collect(&self, items: &[FeedItem], range: DateRange) -> AssetCollection {
        if let Some(published) = items
            .iter()
            .filter_map(|i| DateTime::parse_from_rfc2822(&i.pub_date).ok())
            .max()
        {
            debug!(latest_published = %published, "Feed freshness");
        }
        dedup_by_url(
            items
                .iter()
                .filter_map(meeting_from_item)
                .filter(|m| range.contains(m.date))
                .flat_map(|m| self.assets_for(m)),
        )
    }
}

#[async_trait]
impl Site for GranicusSite {
    fn platform(&self) -> Platform {
        Platform::Granicus
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    #[instrument(level = "info", skip_all, fields(site = %self.config.url))]
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError> {
        let range = opts.date_range(None, None);
        let response = self.transport.get(self.config.url.trim()).await?.error_for_status()?;
        let body = response.text();
        cache_listing(&self.cache, opts, &response.url, &body).await;

        let items = parse_feed(&body)?;
        info!(items = items.len(), "Parsed RSS feed");

        let assets = self.collect(&items, range);
        finish(&self.config.url, assets, opts, false, self.transport.as_ref(), &self.cache).await
    }
}
