//! Legistar calendar scraper.
//!
//! The public calendar (`https://{instance}.legistar.com/Calendar.aspx`) is an
//! ASP.NET RadGrid. Each data row is one meeting:
//!
//! ```text
//! tr.rgRow | tr.rgAltRow
//! ├── td  committee name
//! ├── td  1/12/2021
//! ├── td  6:00 PM
//! ├── a[href*="MeetingDetail.aspx?ID=771"]   native id
//! ├── a[href*="View.ashx?M=A&ID=..."]        agenda
//! └── a[href*="View.ashx?M=M&ID=..."]        minutes
//! ```
//!
//! The landing page shows a default period. When it carries the `lstYears`
//! list, each year of the window is selected by posting the form back with
//! that field as the event target, and the grid is walked once per year.
//!
//! Further pages are requested by posting the form back with its hidden
//! state fields and the grid's next-page button. The grid keeps serving the
//! last page once the end is reached, so the walk ends on a repeated page.

use async_trait::async_trait;
use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::pagination::{Continuation, DEFAULT_MAX_PAGES, Page, PageSource, paginate};
use super::{DateRange, Platform, ScrapeOptions, Site, cache_listing, dedup_by_url, finish, keep_valid, meeting_id};
use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection, AssetType, MeetingTime, SCRAPED_BY};
use crate::transport::{RetryTransport, Transport};
use crate::utils::{query_param, squash_whitespace, subdomain, today_local};

static DATA_ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr.rgRow, tr.rgAltRow").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static HIDDEN: Lazy<Selector> = Lazy::new(|| Selector::parse("input[type='hidden'][name]").unwrap());
static NEXT_BUTTON: Lazy<Selector> = Lazy::new(|| Selector::parse("input.rgPageNext[name]").unwrap());
static YEAR_LIST: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[name$='lstYears'], select[name$='lstYears']").unwrap());

static DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{4})\b").unwrap());
static TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2}:\d{2})\s*([AP]M)\b").unwrap());

/// Retries for postback requests.
const POSTBACK_RETRIES: usize = 3;

/// One meeting row of the calendar grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub committee_name: String,
    pub native_id: String,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub documents: Vec<(AssetType, String)>,
}

/// Document type of a `View.ashx` link, from its `M` parameter or label.
fn document_type(url: &str, label: &str) -> Option<AssetType> {
    let lower_label = label.to_ascii_lowercase();
    if url.contains("Video.aspx") || lower_label.contains("video") {
        return Some(AssetType::Video);
    }
    if !url.contains("View.ashx") {
        return None;
    }
    if lower_label.contains("packet") {
        return Some(AssetType::AgendaPacket);
    }
    match query_param(url, "M")?.to_ascii_uppercase().as_str() {
        "A" => Some(AssetType::Agenda),
        "M" => Some(AssetType::Minutes),
        "AO" => Some(AssetType::AgendaPacket),
        _ => None,
    }
}

fn parse_row(row: ElementRef<'_>, base: &Url) -> Option<GridRow> {
    let text = squash_whitespace(&row.text().collect::<Vec<_>>().join(" "));
    let committee_name = row
        .select(&CELL)
        .next()
        .map(|cell| squash_whitespace(&cell.text().collect::<String>()))
        .unwrap_or_default();

    let links: Vec<(String, String)> = row
        .select(&LINK)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let url = base.join(href).ok()?;
            Some((url.to_string(), squash_whitespace(&a.text().collect::<String>())))
        })
        .collect();

    let Some(native_id) = links
        .iter()
        .filter(|(url, _)| url.contains("MeetingDetail.aspx"))
        .find_map(|(url, _)| query_param(url, "ID"))
    else {
        warn!(committee = %committee_name, "Calendar row has no meeting detail link; skipping");
        return None;
    };
    let Some(date) = DATE
        .captures(&text)
        .and_then(|caps| NaiveDate::parse_from_str(&caps[1], "%m/%d/%Y").ok())
    else {
        warn!(%native_id, "Calendar row has no meeting date; skipping");
        return None;
    };
    let time = TIME.captures(&text).and_then(|caps| {
        NaiveTime::parse_from_str(&format!("{} {}", &caps[1], caps[2].to_ascii_uppercase()), "%I:%M %p").ok()
    });

    let documents = links
        .iter()
        .filter_map(|(url, label)| document_type(url, label).map(|kind| (kind, url.clone())))
        .collect();

    Some(GridRow {
        committee_name,
        native_id,
        date,
        time,
        documents,
    })
}

fn hidden_fields(document: &Html) -> Vec<(String, String)> {
    document
        .select(&HIDDEN)
        .filter_map(|input| {
            let el = input.value();
            Some((el.attr("name")?.to_string(), el.attr("value").unwrap_or_default().to_string()))
        })
        .collect()
}

/// Replace a form field's value, or append the field.
fn set_field(form: &mut Vec<(String, String)>, name: &str, value: &str) {
    match form.iter_mut().find(|(k, _)| k == name) {
        Some(field) => field.1 = value.to_string(),
        None => form.push((name.to_string(), value.to_string())),
    }
}

/// Hidden form state plus the next-page button, if the grid offers one.
fn continuation(document: &Html) -> Option<Continuation> {
    let button = document.select(&NEXT_BUTTON).next()?;
    if button
        .value()
        .attr("onclick")
        .is_some_and(|js| js.contains("return false"))
    {
        return None;
    }
    let mut form = hidden_fields(document);
    let name = button.value().attr("name")?.to_string();
    form.push((name, button.value().attr("value").unwrap_or(" ").to_string()));
    Some(Continuation { form })
}

fn grid_page(document: &Html, base: &Url) -> Page<GridRow> {
    let items: Vec<GridRow> = document
        .select(&DATA_ROW)
        .filter_map(|row| parse_row(row, base))
        .collect();
    let keys = items.iter().map(|r| r.native_id.clone()).collect();
    let next = continuation(document);
    debug!(rows = items.len(), has_next = next.is_some(), "Parsed calendar page");
    Page { items, keys, next }
}

/// Parse one calendar page into rows and the token for the next one.
pub fn parse_calendar_page(html: &str, page_url: &str) -> Result<Page<GridRow>, ScrapeError> {
    let base = Url::parse(page_url)?;
    let document = Html::parse_document(html);
    Ok(grid_page(&document, &base))
}

/// The calendar's year list and the form state needed to post a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearFilter {
    pub field: String,
    pub form: Vec<(String, String)>,
}

impl YearFilter {
    /// Form body selecting `year`.
    pub fn select(&self, year: i32) -> Vec<(String, String)> {
        let mut form = self.form.clone();
        set_field(&mut form, "__EVENTTARGET", &self.field);
        set_field(&mut form, "__EVENTARGUMENT", "");
        set_field(&mut form, &self.field, &year.to_string());
        form
    }
}

/// Parse the landing page: its grid, plus the year list when there is one.
pub fn parse_landing(html: &str, page_url: &str) -> Result<(Page<GridRow>, Option<YearFilter>), ScrapeError> {
    let base = Url::parse(page_url)?;
    let document = Html::parse_document(html);
    let filter = document
        .select(&YEAR_LIST)
        .next()
        .and_then(|el| el.value().attr("name"))
        .map(|field| YearFilter {
            field: field.to_string(),
            form: hidden_fields(&document),
        });
    Ok((grid_page(&document, &base), filter))
}

/// Calendar years touched by `range`. An open end stops at the current year.
fn years(range: DateRange) -> Vec<i32> {
    let this_year = today_local().year();
    let first = range.start.map_or(this_year, |d| d.year());
    let last = range.end.map_or(this_year.max(first), |d| d.year());
    (first..=last).collect()
}

/// Legistar calendar adapter. Start defaults to today; the end is open.
#[derive(Debug)]
pub struct LegistarSite {
    config: SiteConfig,
    instance: String,
    offset: Option<FixedOffset>,
    transport: Arc<dyn Transport>,
    postback: RetryTransport,
    cache: Cache,
    max_pages: usize,
}

impl LegistarSite {
    pub fn new(config: SiteConfig, transport: Arc<dyn Transport>, cache: Cache) -> Result<Self, ScrapeError> {
        let instance = subdomain(config.url.trim())
            .ok_or_else(|| ScrapeError::Config(format!("no host in {}", config.url)))?;
        let offset = config.offset()?;
        let postback = RetryTransport::new(transport.clone(), POSTBACK_RETRIES, Duration::from_secs(1));
        Ok(Self {
            config,
            instance,
            offset,
            transport,
            postback,
            cache,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    fn assets_for(&self, row: GridRow) -> Vec<Asset> {
        let id = meeting_id(Platform::Legistar, &self.instance, &row.native_id);
        let time = row.time.map(|t| MeetingTime::with_offset(t, self.offset));
        row.documents
            .into_iter()
            .filter_map(|(kind, url)| {
                keep_valid(
                    &self.config.url,
                    Asset::builder(url)
                        .asset_name(format!("{} {}", row.committee_name, row.date.format("%Y-%m-%d")))
                        .committee_name(Some(row.committee_name.as_str()))
                        .place(self.config.place.as_deref())
                        .place_name(self.config.place_name.as_deref())
                        .state_or_province(self.config.state_or_province.as_deref())
                        .asset_type(kind)
                        .meeting_date(Some(row.date))
                        .meeting_time(time)
                        .meeting_id(id.clone())
                        .scraped_by(SCRAPED_BY)
                        .build(),
                )
            })
            .collect()
    }

    fn pages(&self, start: Start) -> CalendarPages {
        CalendarPages {
            url: self.config.url.trim().to_string(),
            postback: self.postback.clone(),
            start,
        }
    }

    fn collect(&self, rows: Vec<GridRow>, range: DateRange) -> AssetCollection {
        dedup_by_url(
            rows.into_iter()
                .filter(|row| range.contains(row.date))
                .flat_map(|row| self.assets_for(row)),
        )
    }
}

/// Where a walk of the calendar grid starts.
#[derive(Debug, Clone)]
enum Start {
    /// The already fetched landing page.
    Landing(Page<GridRow>),
    /// A year selection posted back to the calendar.
    Year(Vec<(String, String)>),
}

/// One walk per year of the window, or a single walk of the landing page
/// when the calendar has no year list.
fn starts(landing: Page<GridRow>, filter: Option<YearFilter>, range: DateRange) -> Vec<(Option<i32>, Start)> {
    match filter {
        Some(filter) => years(range)
            .into_iter()
            .map(|year| (Some(year), Start::Year(filter.select(year))))
            .collect(),
        None => {
            debug!("Calendar has no year list; walking the default period");
            vec![(None, Start::Landing(landing))]
        }
    }
}

/// The calendar grid as a page source.
struct CalendarPages {
    url: String,
    postback: RetryTransport,
    start: Start,
}

impl CalendarPages {
    async fn post(&self, form: &[(String, String)]) -> Result<Page<GridRow>, ScrapeError> {
        let response = self.postback.post_form(&self.url, form).await?.error_for_status()?;
        parse_calendar_page(&response.text(), &response.url)
    }
}

#[async_trait]
impl PageSource for CalendarPages {
    type Item = GridRow;

    async fn first_page(&self) -> Result<Page<GridRow>, ScrapeError> {
        match &self.start {
            Start::Landing(page) => Ok(page.clone()),
            Start::Year(form) => self.post(form).await,
        }
    }

    async fn next_page(&self, token: &Continuation) -> Result<Page<GridRow>, ScrapeError> {
        self.post(&token.form).await
    }
}

#[async_trait]
impl Site for LegistarSite {
    fn platform(&self) -> Platform {
        Platform::Legistar
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    #[instrument(level = "info", skip_all, fields(site = %self.config.url))]
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError> {
        let range = opts.date_range(Some(today_local()), None);
        let response = self.transport.get(self.config.url.trim()).await?.error_for_status()?;
        let body = response.text();
        cache_listing(&self.cache, opts, &response.url, &body).await;
        let (landing, year_filter) = parse_landing(&body, &response.url)?;

        let mut rows = Vec::new();
        for (year, start) in starts(landing, year_filter, range) {
            let pages = self.pages(start);
            let found = paginate(&pages, &self.config.url, self.max_pages).await?;
            debug!(?year, rows = found.len(), "Walked calendar grid");
            rows.extend(found);
        }
        info!(rows = rows.len(), "Collected calendar rows");

        let assets = self.collect(rows, range);
        finish(&self.config.url, assets, opts, false, self.transport.as_ref(), &self.cache).await
    }
}
