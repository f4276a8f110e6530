//! Per-site configuration.
//!
//! A run is driven by a list of [`SiteConfig`]s, loaded from one of:
//!
//! - a single `--url` on the command line
//! - a CSV file with a `url` column (other columns optional)
//! - a YAML file holding a list of site entries
//!
//! ```yaml
//! - url: https://go.boarddocs.com/pa/keyc/Board.nsf
//!   committee_id: A4EP6J588C05
//! - url: https://cityofx.legistar.com/Calendar.aspx
//!   place: cityofx
//!   state_or_province: ca
//!   timezone: "-08:00"
//! ```

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::ScrapeError;

/// Identity and overrides for one site to scrape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub url: String,
    /// Machine-friendly place slug, for platforms whose URL does not encode it.
    #[serde(default)]
    pub place: Option<String>,
    /// Human-readable place name written to every asset.
    #[serde(default)]
    pub place_name: Option<String>,
    /// Two-letter state or province code.
    #[serde(default)]
    pub state_or_province: Option<String>,
    /// BoardDocs committee; auto-detected when absent.
    #[serde(default)]
    pub committee_id: Option<String>,
    /// Fixed UTC offset applied to meeting times, e.g. `-05:00`.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl SiteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Check the URL and the optional overrides before any network work.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        let parsed = Url::parse(self.url.trim())?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ScrapeError::Config(format!(
                "site url must be http(s): {}",
                self.url
            )));
        }
        if let Some(code) = &self.state_or_province {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ScrapeError::Config(format!(
                    "state_or_province must be two letters, got {code:?} for {}",
                    self.url
                )));
            }
        }
        self.offset()?;
        Ok(())
    }

    /// Parse [`SiteConfig::timezone`] as a fixed offset.
    pub fn offset(&self) -> Result<Option<FixedOffset>, ScrapeError> {
        match self.timezone.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => parse_offset(raw)
                .map(Some)
                .ok_or_else(|| ScrapeError::Config(format!("invalid UTC offset {raw:?}"))),
        }
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Load site entries from a YAML list.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_sites_yaml(path: &Path) -> Result<Vec<SiteConfig>, ScrapeError> {
    let content = std::fs::read_to_string(path)?;
    let sites: Vec<SiteConfig> = serde_yaml::from_str(&content)?;
    info!(count = sites.len(), "Loaded site configuration");
    Ok(sites)
}

/// Load site entries from a CSV file with a `url` header.
///
/// Extra columns matching [`SiteConfig`] fields are honoured; blank URLs are skipped.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_urls_csv(path: &Path) -> Result<Vec<SiteConfig>, ScrapeError> {
    let mut reader = csv::Reader::from_path(path)?;
    let has_url = reader.headers()?.iter().any(|h| h.trim() == "url");
    if !has_url {
        return Err(ScrapeError::Config(format!(
            "{} has no `url` column",
            path.display()
        )));
    }

    let mut sites = Vec::new();
    for (line, record) in reader.deserialize::<SiteConfig>().enumerate() {
        let mut site = record?;
        site.url = site.url.trim().to_string();
        if site.url.is_empty() {
            warn!(line = line + 2, "Skipping row with empty url");
            continue;
        }
        debug!(url = %site.url, "Queued site");
        sites.push(site);
    }
    info!(count = sites.len(), "Loaded site URLs");
    Ok(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("-05:00"), FixedOffset::west_opt(5 * 3600));
        assert_eq!(parse_offset("+0530"), FixedOffset::east_opt(5 * 3600 + 1800));
        assert_eq!(parse_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("America/Chicago"), None);
        assert_eq!(parse_offset("+25:00"), None);
    }

    #[test]
    fn test_validate() {
        assert!(SiteConfig::new("https://x.legistar.com/Calendar.aspx").validate().is_ok());
        assert!(SiteConfig::new("ftp://x.org").validate().is_err());
        assert!(SiteConfig::new("not a url").validate().is_err());

        let mut bad_state = SiteConfig::new("https://x.org");
        bad_state.state_or_province = Some("cal".into());
        assert!(matches!(bad_state.validate(), Err(ScrapeError::Config(_))));

        let mut bad_tz = SiteConfig::new("https://x.org");
        bad_tz.timezone = Some("PST".into());
        assert!(bad_tz.validate().is_err());
    }

    #[test]
    fn test_load_urls_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "url,place_name,notes").unwrap();
        writeln!(file, "http://nc-nashcounty.civicplus.com/AgendaCenter,Nash County,first").unwrap();
        writeln!(file, ",,blank").unwrap();
        writeln!(file, " https://go.boarddocs.com/pa/keyc/Board.nsf ,,").unwrap();

        let sites = load_urls_csv(file.path()).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].place_name.as_deref(), Some("Nash County"));
        assert_eq!(sites[1].url, "https://go.boarddocs.com/pa/keyc/Board.nsf");
        assert_eq!(sites[1].place_name, None);
    }

    #[test]
    fn test_load_urls_csv_requires_url_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "site").unwrap();
        writeln!(file, "https://x.org").unwrap();
        assert!(matches!(load_urls_csv(file.path()), Err(ScrapeError::Config(_))));
    }

    #[test]
    fn test_load_sites_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "- url: https://go.boarddocs.com/pa/keyc/Board.nsf\n  committee_id: A4EP6J588C05\n- url: https://cityofx.legistar.com/Calendar.aspx\n  timezone: \"-08:00\"\n"
        )
        .unwrap();
        let sites = load_sites_yaml(file.path()).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].committee_id.as_deref(), Some("A4EP6J588C05"));
        assert_eq!(sites[1].offset().unwrap(), FixedOffset::west_opt(8 * 3600));
    }
}
