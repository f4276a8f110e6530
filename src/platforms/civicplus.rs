//! CivicPlus Agenda Center scraper.
//!
//! Agenda Center sites live at `http://{state}-{place}.civicplus.com/AgendaCenter`
//! (or a custom domain with the same `/AgendaCenter` path). The adapter issues
//! one search request for the date window and parses the results page:
//!
//! ```text
//! div#cat12                       one board or committee
//! ├── h2  "Board of Commissioners<span>▼</span>"
//! └── table > tbody > tr          one meeting
//!     ├── a[name="_05052020-382"] native id and date (MMDDYYYY)
//!     ├── p                       meeting title
//!     └── a[href^="/AgendaCenter/ViewFile/..."]  agenda, minutes, packet
//! ```
//!
//! Each document link appears both under the meeting title (with a `title`
//! attribute) and in the download menu; only untitled links are taken and
//! every href is kept once.

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DateRange, Platform, ScrapeOptions, Site, cache_listing, dedup_by_url, finish, keep_valid, meeting_id};
use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection, AssetType, SCRAPED_BY};
use crate::transport::Transport;
use crate::utils::{squash_whitespace, subdomain, today_local};

static BOARD_DIV: Lazy<Selector> = Lazy::new(|| Selector::parse("div[id^='cat']").unwrap());
static H2: Lazy<Selector> = Lazy::new(|| Selector::parse("h2").unwrap());
static H3: Lazy<Selector> = Lazy::new(|| Selector::parse("h3").unwrap());
static SPAN: Lazy<Selector> = Lazy::new(|| Selector::parse("span").unwrap());
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tbody tr").unwrap());
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").unwrap());
static FILE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href^='/AgendaCenter/ViewFile']").unwrap());

static BOARD_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^cat\d+$").unwrap());
static NATIVE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^_(\d{2})(\d{2})(\d{4})").unwrap());

/// One document link found on the search results page.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRow {
    pub committee_name: String,
    pub meeting_title: String,
    pub native_id: String,
    pub meeting_date: NaiveDate,
    pub href: String,
    pub asset_type: AssetType,
}

/// Parse the Agenda Center search results page.
///
/// Rows without a parseable anchor name are skipped; so are links whose
/// document type is not one of the known asset types.
pub fn parse_search_page(html: &str) -> Vec<ListingRow> {
    let document = Html::parse_document(html);
    let mut seen: HashSet<String> = HashSet::new();
    let mut rows = Vec::new();

    for board in document.select(&BOARD_DIV) {
        if !board.value().id().is_some_and(|id| BOARD_ID.is_match(id)) {
            continue;
        }
        let committee_name = committee_name(board);

        for row in board.select(&ROW) {
            let Some(native_id) = row
                .select(&ANCHOR)
                .next()
                .and_then(|a| a.value().attr("name"))
                .map(str::to_string)
            else {
                warn!(committee = %committee_name, "Meeting row has no named anchor; skipping");
                continue;
            };
            let Some(meeting_date) = date_from_native_id(&native_id) else {
                warn!(%native_id, "Unparseable meeting id; skipping row");
                continue;
            };
            let meeting_title = row
                .select(&PARAGRAPH)
                .next()
                .map(|p| squash_whitespace(&p.text().collect::<String>()))
                .unwrap_or_default();

            for link in row.select(&FILE_LINK) {
                let element = link.value();
                if element.attr("title").is_some() {
                    continue;
                }
                let Some(href) = element.attr("href") else {
                    continue;
                };
                if href.contains("PreviousVersions") || !seen.insert(href.to_string()) {
                    continue;
                }
                let Some(asset_type) = asset_type_for(href) else {
                    warn!(href, "Unexpected document type; skipping link");
                    continue;
                };
                rows.push(ListingRow {
                    committee_name: committee_name.clone(),
                    meeting_title: meeting_title.clone(),
                    native_id: native_id.clone(),
                    meeting_date,
                    href: href.to_string(),
                    asset_type,
                });
            }
        }
    }
    debug!(count = rows.len(), "Parsed Agenda Center rows");
    rows
}

/// Board header text without the toggle arrow span.
fn committee_name(board: ElementRef<'_>) -> String {
    if let Some(h2) = board.select(&H2).next() {
        let mut text: String = h2.text().collect();
        for span in h2.select(&SPAN) {
            let span_text: String = span.text().collect();
            if !span_text.is_empty() {
                text = text.replacen(&span_text, "", 1);
            }
        }
        return squash_whitespace(&text);
    }
    board
        .select(&H3)
        .next()
        .map(|h3| squash_whitespace(&h3.text().collect::<String>()))
        .unwrap_or_default()
}

/// `_05052020-382` → 2020-05-05
fn date_from_native_id(native_id: &str) -> Option<NaiveDate> {
    let caps = NATIVE_ID.captures(native_id)?;
    let month = caps[1].parse().ok()?;
    let day = caps[2].parse().ok()?;
    let year = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `packet=true` marks the agenda packet; otherwise the path segment after `ViewFile`.
fn asset_type_for(href: &str) -> Option<AssetType> {
    if href.ends_with("packet=true") {
        return Some(AssetType::AgendaPacket);
    }
    let segment = href.split('/').nth(3)?;
    match segment.parse::<AssetType>().ok()? {
        AssetType::Other(_) => None,
        known => Some(known),
    }
}

/// CivicPlus Agenda Center adapter. Dates default to today on both ends.
#[derive(Debug)]
pub struct CivicPlusSite {
    config: SiteConfig,
    base: Url,
    subdomain: String,
    state_or_province: Option<String>,
    place: Option<String>,
    transport: Arc<dyn Transport>,
    cache: Cache,
}

impl CivicPlusSite {
    pub fn new(config: SiteConfig, transport: Arc<dyn Transport>, cache: Cache) -> Result<Self, ScrapeError> {
        let base = Url::parse(config.url.trim())?;
        let subdomain = subdomain(base.as_str())
            .ok_or_else(|| ScrapeError::Config(format!("no host in {}", config.url)))?;

        // `nc-nashcounty` → state `nc`, place `nashcounty`
        let (url_state, url_place) = match subdomain.split_once('-') {
            Some((state, place)) if state.len() == 2 && state.chars().all(|c| c.is_ascii_alphabetic()) => {
                (Some(state.to_string()), Some(place.to_string()))
            }
            _ => (None, None),
        };

        Ok(Self {
            state_or_province: config.state_or_province.clone().or(url_state),
            place: config.place.clone().or(url_place),
            config,
            base,
            subdomain,
            transport,
            cache,
        })
    }

    /// `{site}/Search/?term=&CIDs=all&startDate=MM/DD/YYYY&endDate=MM/DD/YYYY&dateRange=&dateSelector=`
    pub fn search_url(&self, start: NaiveDate, end: NaiveDate) -> String {
        let fmt = |d: NaiveDate| urlencoding::encode(&d.format("%m/%d/%Y").to_string()).into_owned();
        format!(
            "{}/Search/?term=&CIDs=all&startDate={}&endDate={}&dateRange=&dateSelector=",
            self.config.url.trim().trim_end_matches('/'),
            fmt(start),
            fmt(end)
        )
    }

    fn build_asset(&self, row: ListingRow) -> Option<Asset> {
        let url = match self.base.join(&row.href) {
            Ok(url) => url,
            Err(e) => {
                warn!(href = %row.href, error = %e, "Could not resolve document link");
                return None;
            }
        };
        let native = row.native_id.trim_start_matches('_');
        keep_valid(
            &self.config.url,
            Asset::builder(url.as_str())
                .asset_name(row.meeting_title)
                .committee_name(Some(row.committee_name))
                .place(self.place.as_deref())
                .place_name(self.config.place_name.as_deref())
                .state_or_province(self.state_or_province.as_deref())
                .asset_type(row.asset_type)
                .meeting_date(Some(row.meeting_date))
                .meeting_id(meeting_id(Platform::CivicPlus, &self.subdomain, native))
                .scraped_by(SCRAPED_BY)
                .build(),
        )
    }

    fn collect(&self, rows: Vec<ListingRow>, range: DateRange) -> AssetCollection {
        dedup_by_url(
            rows.into_iter()
                .filter(|row| range.contains(row.meeting_date))
                .filter_map(|row| self.build_asset(row)),
        )
    }
}

#[async_trait]
impl Site for CivicPlusSite {
    fn platform(&self) -> Platform {
        Platform::CivicPlus
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    #[instrument(level = "info", skip_all, fields(site = %self.config.url))]
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError> {
        let today = today_local();
        let range = opts.date_range(Some(today), Some(today));
        let (start, end) = (range.start.unwrap_or(today), range.end.unwrap_or(today));

        let search_url = self.search_url(start, end);
        let response = self.transport.get(&search_url).await?.error_for_status()?;
        let body = response.text();
        cache_listing(&self.cache, opts, &response.url, &body).await;

        let rows = parse_search_page(&body);
        info!(rows = rows.len(), %start, %end, "Parsed search results");

        let assets = self.collect(rows, range);
        finish(&self.config.url, assets, opts, true, self.transport.as_ref(), &self.cache).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::transport::testing::Method;

    const SITE: &str = "http://nc-nashcounty.civicplus.com/AgendaCenter";

    const TWO_MEETINGS: &str = r#"
<html><body><div id="AgendaCenterContent">
<div id="cat4" class="listing">
  <h2>Board of Commissioners <span class="toggle">▼</span></h2>
  <table><tbody>
    <tr class="catAgendaRow">
      <td>
        <h3><strong><a name="_05052020-382"></a></strong></h3>
        <p><a href="/AgendaCenter/ViewFile/Agenda/_05052020-382" title="View Agenda">May 5, 2020 Regular Meeting</a></p>
      </td>
      <td class="downloads">
        <ol>
          <li><a href="/AgendaCenter/ViewFile/Agenda/_05052020-382">Download</a></li>
          <li><a href="/AgendaCenter/ViewFile/Agenda/_05052020-382">PDF</a></li>
          <li><a href="/AgendaCenter/PreviousVersions/_05052020-382">Previous Versions</a></li>
        </ol>
      </td>
      <td class="minutes"><a href="/AgendaCenter/ViewFile/Minutes/_05052020-382">Minutes</a></td>
    </tr>
  </tbody></table>
</div>
<div id="cat7" class="listing">
  <h3>Planning Board</h3>
  <table><tbody>
    <tr class="catAgendaRow">
      <td>
        <h4><a name="_05042020-381"></a></h4>
        <p>May 4, 2020 Work Session</p>
      </td>
      <td class="downloads"><a href="/AgendaCenter/ViewFile/Agenda/_05042020-381">Agenda</a></td>
      <td class="minutes"><a href="/AgendaCenter/ViewFile/Minutes/_05042020-381">Minutes</a></td>
    </tr>
  </tbody></table>
</div>
</div></body></html>"#;

    fn four_days() -> String {
        let row = |mmdd: &str, n: u32| {
            format!(
                r#"<tr><td><a name="_{mmdd}2020-{n}"></a><p>Meeting {n}</p></td>
                <td><a href="/AgendaCenter/ViewFile/Agenda/_{mmdd}2020-{n}">Agenda</a></td></tr>"#
            )
        };
        format!(
            r#"<div id="cat1"><h2>Town Council</h2><table><tbody>{}{}{}{}</tbody></table></div>"#,
            row("0503", 1),
            row("0504", 2),
            row("0505", 3),
            row("0506", 4)
        )
    }

    fn site(h: &Harness) -> CivicPlusSite {
        CivicPlusSite::new(SiteConfig::new(SITE), h.transport(), h.cache.clone()).unwrap()
    }

    #[test]
    fn test_search_url() {
        let h = Harness::new();
        assert_eq!(
            site(&h).search_url(date(2020, 5, 3), date(2020, 5, 6)),
            "http://nc-nashcounty.civicplus.com/AgendaCenter/Search/?term=&CIDs=all&startDate=05%2F03%2F2020&endDate=05%2F06%2F2020&dateRange=&dateSelector="
        );
    }

    #[test]
    fn test_parse_dedups_and_skips_titled_links() {
        let rows = parse_search_page(TWO_MEETINGS);
        let hrefs: Vec<&str> = rows.iter().map(|r| r.href.as_str()).collect();
        assert_eq!(
            hrefs,
            vec![
                "/AgendaCenter/ViewFile/Agenda/_05052020-382",
                "/AgendaCenter/ViewFile/Minutes/_05052020-382",
                "/AgendaCenter/ViewFile/Agenda/_05042020-381",
                "/AgendaCenter/ViewFile/Minutes/_05042020-381",
            ]
        );
        assert_eq!(rows[0].committee_name, "Board of Commissioners");
        assert_eq!(rows[0].meeting_title, "May 5, 2020 Regular Meeting");
        assert_eq!(rows[2].committee_name, "Planning Board");
    }

    #[test]
    fn test_asset_type_for() {
        assert_eq!(asset_type_for("/AgendaCenter/ViewFile/Agenda/_1"), Some(AssetType::Agenda));
        assert_eq!(asset_type_for("/AgendaCenter/ViewFile/Minutes/_1"), Some(AssetType::Minutes));
        assert_eq!(
            asset_type_for("/AgendaCenter/ViewFile/Agenda/_1?packet=true"),
            Some(AssetType::AgendaPacket)
        );
        assert_eq!(asset_type_for("/AgendaCenter/ViewFile/Item/_1"), None);
    }

    #[tokio::test]
    async fn test_scrape_two_meetings() {
        let h = Harness::new();
        let site = site(&h);
        h.fixtures
            .html(&site.search_url(date(2020, 5, 3), date(2020, 5, 6)), TWO_MEETINGS);

        let assets = site.scrape(&between(date(2020, 5, 3), date(2020, 5, 6))).await.unwrap();
        assert_eq!(assets.len(), 4);

        let first = assets.get(0).unwrap();
        assert_eq!(first.committee_name(), Some("Board of Commissioners"));
        assert_eq!(first.asset_type(), &AssetType::Agenda);
        assert_eq!(first.meeting_date(), Some(date(2020, 5, 5)));
        assert_eq!(first.meeting_id(), Some("civicplus_nc-nashcounty_05052020-382"));
        assert_eq!(
            first.url(),
            "http://nc-nashcounty.civicplus.com/AgendaCenter/ViewFile/Agenda/_05052020-382"
        );
        assert_eq!(first.state_or_province(), Some("nc"));
        assert_eq!(first.place(), Some("nashcounty"));
        assert_eq!(first.scraped_by(), Some(SCRAPED_BY));
    }

    #[tokio::test]
    async fn test_scrape_probes_every_asset() {
        let h = Harness::new();
        let site = site(&h);
        h.fixtures
            .html(&site.search_url(date(2020, 5, 3), date(2020, 5, 6)), TWO_MEETINGS);
        let agenda = "http://nc-nashcounty.civicplus.com/AgendaCenter/ViewFile/Agenda/_05052020-382";
        h.fixtures.head_ok(agenda, "application/pdf", 19_536);

        let assets = site.scrape(&between(date(2020, 5, 3), date(2020, 5, 6))).await.unwrap();
        assert_eq!(h.fixtures.count(Method::Head, agenda), 1);
        assert_eq!(assets.get(0).unwrap().content_length(), Some(19_536));
        assert_eq!(assets.get(0).unwrap().content_type(), Some("application/pdf"));
        assert_eq!(assets.get(1).unwrap().content_length(), None);
    }

    #[tokio::test]
    async fn test_failed_download_keeps_metadata() {
        let h = Harness::new();
        let site = site(&h);
        h.fixtures
            .html(&site.search_url(date(2020, 5, 3), date(2020, 5, 6)), TWO_MEETINGS);
        let agenda = "http://nc-nashcounty.civicplus.com/AgendaCenter/ViewFile/Agenda/_05052020-382";
        h.fixtures.route(
            Method::Get,
            agenda,
            crate::transport::testing::ok(agenda, "application/pdf", "%PDF-1.4"),
        );

        let mut opts = between(date(2020, 5, 3), date(2020, 5, 6));
        opts.download = true;
        let assets = site.scrape(&opts).await.unwrap();

        assert_eq!(assets.len(), 4);
        let written = h
            .cache
            .assets_path()
            .join("civicplus_nc-nashcounty_05052020-382_agenda.pdf");
        assert_eq!(std::fs::read(written).unwrap(), b"%PDF-1.4");
        // the minutes GETs answered 404
        let minutes = "http://nc-nashcounty.civicplus.com/AgendaCenter/ViewFile/Minutes/_05052020-382";
        assert_eq!(h.fixtures.count(Method::Get, minutes), 1);
    }

    #[tokio::test]
    async fn test_scrape_filters_by_date() {
        let h = Harness::new();
        let site = site(&h);
        h.fixtures
            .html(&site.search_url(date(2020, 5, 4), date(2020, 5, 5)), &four_days());

        let assets = site.scrape(&between(date(2020, 5, 4), date(2020, 5, 5))).await.unwrap();
        let dates: Vec<NaiveDate> = assets.iter().filter_map(Asset::meeting_date).collect();
        assert_eq!(dates, vec![date(2020, 5, 4), date(2020, 5, 5)]);
    }

    #[tokio::test]
    async fn test_scrape_caches_search_page() {
        let h = Harness::new();
        let site = site(&h);
        let url = site.search_url(date(2020, 5, 3), date(2020, 5, 6));
        h.fixtures.html(&url, TWO_MEETINGS);

        let mut opts = between(date(2020, 5, 3), date(2020, 5, 6));
        opts.cache = true;
        site.scrape(&opts).await.unwrap();

        let cached = h.cache.artifacts_path().join(crate::utils::cache_page_name(&url));
        assert_eq!(std::fs::read_to_string(cached).unwrap(), TWO_MEETINGS);
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let h = Harness::new();
        let err = site(&h)
            .scrape(&between(date(2020, 5, 3), date(2020, 5, 6)))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_place_name_override() {
        let h = Harness::new();
        let mut config = SiteConfig::new(SITE);
        config.place_name = Some("Nash County".into());
        let site = CivicPlusSite::new(config, h.transport(), h.cache.clone()).unwrap();
        h.fixtures
            .html(&site.search_url(date(2020, 5, 3), date(2020, 5, 6)), TWO_MEETINGS);
        let assets = site.scrape(&between(date(2020, 5, 3), date(2020, 5, 6))).await.unwrap();
        assert!(assets.iter().all(|a| a.place_name() == Some("Nash County")));
    }
}
