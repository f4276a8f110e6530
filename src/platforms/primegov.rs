//! PrimeGov public portal scraper.
//!
//! The portal exposes its calendar as JSON:
//!
//! ```text
//! GET {origin}/api/v2/PublicPortal/ListArchivedMeetings?year=2023
//! GET {origin}/api/v2/PublicPortal/ListUpcomingMeetings
//!
//! [{"id": 4213, "title": "City Council", "date": "06/12/2023", "time": "10:00 AM",
//!   "dateTime": "2023-06-12T10:00:00", "videoUrl": "...",
//!   "templates": [{"id": 9981, "title": "Agenda",
//!                  "compiledMeetingDocumentFiles": [{"id": 31, "compileOutputType": 1}]}]}]
//! ```
//!
//! Output type 1 is a compiled PDF, 3 the HTML preview. The PDF is preferred.

use async_trait::async_trait;
use chrono::{Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

use super::{
    DateRange, Platform, ScrapeOptions, Site, cache_listing, dedup_by_url, finish, keep_valid, meeting_id,
    parse_records,
};
use crate::cache::Cache;
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::models::{Asset, AssetCollection, AssetType, MeetingTime, SCRAPED_BY};
use crate::transport::Transport;
use crate::utils::{subdomain, today_local};

const API_PATH: &str = "/api/v2/PublicPortal";
const OUTPUT_PDF: u8 = 1;
const OUTPUT_HTML: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledDocument {
    pub id: u64,
    #[serde(default)]
    pub compile_output_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub compiled_meeting_document_files: Option<Vec<CompiledDocument>>,
}

/// One meeting from either listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    /// `MM/DD/YYYY`
    #[serde(default)]
    pub date: Option<String>,
    /// `hh:mm AM`
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub date_time: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub templates: Option<Vec<Template>>,
}

impl Meeting {
    fn parsed_date_time(&self) -> Option<NaiveDateTime> {
        let raw = self.date_time.as_deref()?.trim();
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
    }

    pub fn meeting_date(&self) -> Option<NaiveDate> {
        self.parsed_date_time().map(|dt| dt.date()).or_else(|| {
            NaiveDate::parse_from_str(self.date.as_deref()?.trim(), "%m/%d/%Y").ok()
        })
    }

    pub fn meeting_time(&self) -> Option<NaiveTime> {
        self.time
            .as_deref()
            .and_then(|t| NaiveTime::parse_from_str(&t.trim().to_ascii_uppercase(), "%I:%M %p").ok())
            .or_else(|| self.parsed_date_time().map(|dt| dt.time()))
    }
}

/// Asset type of a compiled template, by its title.
pub fn template_type(title: &str) -> Option<AssetType> {
    let title = title.to_ascii_lowercase();
    if title.contains("packet") {
        Some(AssetType::AgendaPacket)
    } else if title.contains("minutes") {
        Some(AssetType::Minutes)
    } else if title.contains("agenda") {
        Some(AssetType::Agenda)
    } else {
        None
    }
}

/// Years whose archive must be listed to cover the window.
fn years(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Vec<i32> {
    let this_year = today_local().year();
    let first = start.map_or(this_year, |d| d.year());
    let last = end.map_or(this_year, |d| d.year());
    (first..=last).collect()
}

/// PrimeGov adapter. Both dates default to today.
#[derive(Debug)]
pub struct PrimeGovSite {
    config: SiteConfig,
    origin: String,
    instance: String,
    offset: Option<FixedOffset>,
    transport: Arc<dyn Transport>,
    cache: Cache,
}

impl PrimeGovSite {
    pub fn new(config: SiteConfig, transport: Arc<dyn Transport>, cache: Cache) -> Result<Self, ScrapeError> {
        let parsed = Url::parse(config.url.trim())?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ScrapeError::Config(format!("no host in {}", config.url)))?;
        let origin = format!("{}://{}", parsed.scheme(), host);
        let instance = subdomain(config.url.trim()).unwrap_or_else(|| host.to_string());
        let offset = config.offset()?;
        Ok(Self {
            config,
            origin,
            instance,
            offset,
            transport,
            cache,
        })
    }

    async fn list(&self, endpoint: &str, opts: &ScrapeOptions) -> Result<Vec<Meeting>, ScrapeError> {
        let url = format!("{}{API_PATH}/{endpoint}", self.origin);
        let response = self.transport.get(&url).await?.error_for_status()?;
        let body = response.text();
        cache_listing(&self.cache, opts, &response.url, &body).await;
        let meetings: Vec<Meeting> = parse_records(&url, &body)?;
        debug!(endpoint, meetings = meetings.len(), "Fetched meeting list");
        Ok(meetings)
    }

    /// One asset per compiled template, PDF over HTML, plus the video.
    fn documents(&self, meeting: &Meeting) -> Vec<(AssetType, String, String)> {
        let mut out = Vec::new();
        for template in meeting.templates.iter().flatten() {
            let title = template.title.as_deref().unwrap_or_default();
            let Some(kind) = template_type(title) else {
                debug!(template = title, "Skipping unrecognized template");
                continue;
            };
            let files = template.compiled_meeting_document_files.as_deref().unwrap_or_default();
            let url = if files.iter().any(|f| f.compile_output_type == OUTPUT_PDF) {
                format!(
                    "{}/Public/CompiledDocument?meetingTemplateId={}&compileOutputType={OUTPUT_PDF}",
                    self.origin, template.id
                )
            } else if let Some(doc) = files.iter().find(|f| f.compile_output_type == OUTPUT_HTML) {
                format!(
                    "{}/Portal/MeetingPreview?compiledMeetingDocumentFileId={}",
                    self.origin, doc.id
                )
            } else {
                continue;
            };
            out.push((kind, url, title.to_string()));
        }
        if let Some(video) = meeting.video_url.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            out.push((AssetType::Video, video.to_string(), "Video".to_string()));
        }
        out
    }

    fn assets_for(&self, meeting: &Meeting, date: NaiveDate) -> Vec<Asset> {
        let id = meeting_id(Platform::PrimeGov, &self.instance, &meeting.id.to_string());
        let time = meeting.meeting_time().map(|t| MeetingTime::with_offset(t, self.offset));
        let committee = meeting.title.as_deref().map(str::trim).filter(|t| !t.is_empty());

        self.documents(meeting)
            .into_iter()
            .filter_map(|(kind, url, label)| {
                let name = match committee {
                    Some(c) => format!("{c} - {label}"),
                    None => label,
                };
                keep_valid(
                    &self.config.url,
                    Asset::builder(url)
                        .asset_name(name)
                        .committee_name(committee)
                        .place(self.config.place.as_deref())
                        .place_name(self.config.place_name.as_deref())
                        .state_or_province(self.config.state_or_province.as_deref())
                        .asset_type(kind)
                        .meeting_date(Some(date))
                        .meeting_time(time)
                        .meeting_id(id.clone())
                        .scraped_by(SCRAPED_BY)
                        .build(),
                )
            })
            .collect()
    }

    /// Merge the listings by meeting id, first occurrence wins.
    fn collect(&self, meetings: Vec<Meeting>, range: DateRange) -> AssetCollection {
        let mut seen = HashSet::new();
        let unique: Vec<Meeting> = meetings.into_iter().filter(|m| seen.insert(m.id)).collect();
        info!(meetings = unique.len(), "Merged meeting lists");

        dedup_by_url(unique.iter().flat_map(|meeting| match meeting.meeting_date() {
            Some(date) if range.contains(date) => self.assets_for(meeting, date),
            Some(_) => Vec::new(),
            None => {
                debug!(id = meeting.id, "Meeting has no usable date; skipping");
                Vec::new()
            }
        }))
    }
}

#[async_trait]
impl Site for PrimeGovSite {
    fn platform(&self) -> Platform {
        Platform::PrimeGov
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    #[instrument(level = "info", skip_all, fields(site = %self.config.url))]
    async fn scrape(&self, opts: &ScrapeOptions) -> Result<AssetCollection, ScrapeError> {
        let today = today_local();
        let range = opts.date_range(Some(today), Some(today));

        let mut meetings = Vec::new();
        for year in years(range.start, range.end) {
            meetings.extend(self.list(&format!("ListArchivedMeetings?year={year}"), opts).await?);
        }
        meetings.extend(self.list("ListUpcomingMeetings", opts).await?);

        let assets = self.collect(meetings, range);
        finish(&self.config.url, assets, opts, false, self.transport.as_ref(), &self.cache).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::transport::testing::{Method, ok};

    const SITE: &str = "https://cityofy.primegov.com/public/portal";
    const ARCHIVED_2023: &str = "https://cityofy.primegov.com/api/v2/PublicPortal/ListArchivedMeetings?year=2023";
    const UPCOMING: &str = "https://cityofy.primegov.com/api/v2/PublicPortal/ListUpcomingMeetings";

    const ARCHIVED: &str = r#"[
      {"id": 4213, "title": "City Council", "date": "06/12/2023", "time": "10:00 AM",
       "dateTime": "2023-06-12T10:00:00", "videoUrl": "https://video.example.com/4213.mp4",
       "templates": [
         {"id": 9981, "title": "Agenda", "compiledMeetingDocumentFiles": [
           {"id": 31, "compileOutputType": 3}, {"id": 32, "compileOutputType": 1}]},
         {"id": 9982, "title": "Minutes", "compiledMeetingDocumentFiles": [
           {"id": 33, "compileOutputType": 3}]},
         {"id": 9983, "title": "Speaker Cards", "compiledMeetingDocumentFiles": [
           {"id": 34, "compileOutputType": 1}]}
       ]},
      {"id": 4300, "title": "Planning Commission", "date": "01/05/2023", "time": "6:30 PM",
       "dateTime": "2023-01-05T18:30:00", "videoUrl": null, "templates": null}
    ]"#;

    const UPCOMING_BODY: &str = r#"[
      {"id": 4213, "title": "City Council", "date": "06/12/2023", "time": "10:00 AM",
       "dateTime": "2023-06-12T10:00:00", "videoUrl": "", "templates": []},
      {"id": 4400, "title": "Parks Board", "date": "06/20/2023", "time": "",
       "dateTime": "2023-06-20T17:00:00", "videoUrl": "",
       "templates": [{"id": 9990, "title": "Agenda Packet", "compiledMeetingDocumentFiles": [
         {"id": 40, "compileOutputType": 1}]}]}
    ]"#;

    fn harness() -> Harness {
        let h = Harness::new();
        h.fixtures.route(Method::Get, ARCHIVED_2023, ok(ARCHIVED_2023, "application/json", ARCHIVED));
        h.fixtures.route(Method::Get, UPCOMING, ok(UPCOMING, "application/json", UPCOMING_BODY));
        h
    }

    #[test]
    fn test_template_type() {
        assert_eq!(template_type("Agenda"), Some(AssetType::Agenda));
        assert_eq!(template_type("Agenda Packet"), Some(AssetType::AgendaPacket));
        assert_eq!(template_type("Action Minutes"), Some(AssetType::Minutes));
        assert_eq!(template_type("Speaker Cards"), None);
    }

    #[test]
    fn test_meeting_date_and_time() {
        let meetings: Vec<Meeting> = serde_json::from_str(UPCOMING_BODY).unwrap();
        assert_eq!(meetings[1].meeting_date(), Some(date(2023, 6, 20)));
        // blank time falls back to dateTime
        assert_eq!(meetings[1].meeting_time(), NaiveTime::from_hms_opt(17, 0, 0));
    }

    #[tokio::test]
    async fn test_scrape_merges_lists() {
        let h = harness();
        let mut config = SiteConfig::new(SITE);
        config.state_or_province = Some("CA".into());
        config.timezone = Some("-07:00".into());
        let site = PrimeGovSite::new(config, h.transport(), h.cache.clone()).unwrap();

        let assets = site
            .scrape(&between(date(2023, 6, 1), date(2023, 6, 30)))
            .await
            .unwrap();

        let urls: Vec<&str> = assets.iter().map(Asset::url).collect();
        assert_eq!(
            urls,
            vec![
                "https://cityofy.primegov.com/Public/CompiledDocument?meetingTemplateId=9981&compileOutputType=1",
                "https://cityofy.primegov.com/Portal/MeetingPreview?compiledMeetingDocumentFileId=33",
                "https://video.example.com/4213.mp4",
                "https://cityofy.primegov.com/Public/CompiledDocument?meetingTemplateId=9990&compileOutputType=1",
            ]
        );
        let agenda = assets.get(0).unwrap();
        assert_eq!(agenda.meeting_id(), Some("primegov_cityofy_4213"));
        assert_eq!(agenda.asset_type(), &AssetType::Agenda);
        assert_eq!(agenda.state_or_province(), Some("ca"));
        assert_eq!(agenda.meeting_time().unwrap().to_string(), "10:00:00-07:00");
        assert_eq!(assets.get(2).unwrap().asset_type(), &AssetType::Video);
        assert_eq!(assets.get(3).unwrap().asset_type(), &AssetType::AgendaPacket);

        assert_eq!(h.fixtures.count(Method::Get, ARCHIVED_2023), 1);
        assert_eq!(h.fixtures.count(Method::Get, UPCOMING), 1);
    }

    #[tokio::test]
    async fn test_scrape_lists_each_year() {
        let h = harness();
        let archived_2022 = "https://cityofy.primegov.com/api/v2/PublicPortal/ListArchivedMeetings?year=2022";
        h.fixtures.route(Method::Get, archived_2022, ok(archived_2022, "application/json", "[]"));
        let site = PrimeGovSite::new(SiteConfig::new(SITE), h.transport(), h.cache.clone()).unwrap();

        let assets = site
            .scrape(&between(date(2022, 12, 1), date(2023, 1, 31)))
            .await
            .unwrap();
        // the January meeting has no templates and no video
        assert!(assets.is_empty());
        assert_eq!(h.fixtures.count(Method::Get, archived_2022), 1);
        assert_eq!(h.fixtures.count(Method::Get, ARCHIVED_2023), 1);
    }

    #[tokio::test]
    async fn test_malformed_meeting_is_skipped() {
        let h = Harness::new();
        let body = r#"[
          {"id": "abc", "title": "Broken", "dateTime": "2023-06-05T10:00:00"},
          {"id": 4213, "title": "City Council", "dateTime": "2023-06-12T10:00:00",
           "videoUrl": "https://video.example.com/4213.mp4"}
        ]"#;
        h.fixtures.route(Method::Get, ARCHIVED_2023, ok(ARCHIVED_2023, "application/json", body));
        h.fixtures.route(Method::Get, UPCOMING, ok(UPCOMING, "application/json", "[]"));
        let site = PrimeGovSite::new(SiteConfig::new(SITE), h.transport(), h.cache.clone()).unwrap();

        let assets = site
            .scrape(&between(date(2023, 6, 1), date(2023, 6, 30)))
            .await
            .unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets.get(0).unwrap().url(), "https://video.example.com/4213.mp4");
    }

    #[tokio::test]
    async fn test_same_type_templates_download_to_distinct_files() {
        let h = Harness::new();
        let body = r#"[
          {"id": 4500, "title": "City Council", "dateTime": "2023-06-12T10:00:00",
           "templates": [
             {"id": 1, "title": "Agenda", "compiledMeetingDocumentFiles": [{"id": 11, "compileOutputType": 1}]},
             {"id": 2, "title": "Supplemental Agenda", "compiledMeetingDocumentFiles": [{"id": 12, "compileOutputType": 1}]}
           ]}
        ]"#;
        h.fixtures.route(Method::Get, ARCHIVED_2023, ok(ARCHIVED_2023, "application/json", body));
        h.fixtures.route(Method::Get, UPCOMING, ok(UPCOMING, "application/json", "[]"));
        for id in [1, 2] {
            let url = format!(
                "https://cityofy.primegov.com/Public/CompiledDocument?meetingTemplateId={id}&compileOutputType=1"
            );
            h.fixtures.route(Method::Get, &url, ok(&url, "application/pdf", &format!("agenda {id}")));
        }
        let site = PrimeGovSite::new(SiteConfig::new(SITE), h.transport(), h.cache.clone()).unwrap();

        let mut opts = between(date(2023, 6, 1), date(2023, 6, 30));
        opts.download = true;
        let assets = site.scrape(&opts).await.unwrap();
        assert_eq!(assets.len(), 2);

        let dir = h.cache.assets_path();
        assert_eq!(
            std::fs::read_to_string(dir.join("primegov_cityofy_4500_agenda.pdf")).unwrap(),
            "agenda 1"
        );
        assert_eq!(
            std::fs::read_to_string(dir.join("primegov_cityofy_4500_agenda_2.pdf")).unwrap(),
            "agenda 2"
        );
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let h = Harness::new();
        let site = PrimeGovSite::new(SiteConfig::new(SITE), h.transport(), h.cache.clone()).unwrap();
        let err = site
            .scrape(&between(date(2023, 6, 1), date(2023, 6, 30)))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Status { status: 404, .. }));
    }
}
