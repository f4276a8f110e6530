//! Small helpers shared by the adapters, the asset model and the runner.
//!
//! - Calendar helpers for "today" defaults
//! - Content-type to file-extension mapping for downloads
//! - Artifact file naming for cached listing pages
//! - URL fragments (subdomain, query parameters)
//! - Log truncation

use chrono::{Local, NaiveDate};
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Bytes in one megabyte, as used by the `file_size` download filter.
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// Extension used when the content type is unknown or absent.
pub const FALLBACK_EXTENSION: &str = ".bin";

/// Today's date in the local time zone.
pub fn today_local() -> NaiveDate {
    Local::now().date_naive()
}

/// Convert a size in megabytes to bytes.
pub fn mb_to_bytes(size_mb: f64) -> f64 {
    size_mb * BYTES_PER_MB
}

/// Guess a file extension (with leading dot) from an HTTP `Content-Type`.
///
/// Parameters such as `; charset=utf-8` are ignored. Unknown or missing types
/// map to [`FALLBACK_EXTENSION`].
///
/// # Examples
///
/// ```ignore
/// assert_eq!(extension_for_content_type(Some("application/pdf")), ".pdf");
/// assert_eq!(extension_for_content_type(None), ".bin");
/// ```
pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let Some(raw) = content_type else {
        return FALLBACK_EXTENSION;
    };
    let essence = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/pdf" => ".pdf",
        "text/html" | "application/xhtml+xml" => ".html",
        "text/plain" | "txt" => ".txt",
        "text/csv" => ".csv",
        "text/vtt" => ".vtt",
        "application/x-subrip" => ".srt",
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/mp4" | "audio/x-m4a" => ".m4a",
        "audio/wav" | "audio/x-wav" => ".wav",
        "video/mp4" => ".mp4",
        "application/msword" => ".doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "application/vnd.ms-excel" => ".xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
        "application/vnd.ms-powerpoint" => ".ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => ".pptx",
        "application/json" => ".json",
        "application/xml" | "text/xml" | "application/rss+xml" => ".xml",
        "application/zip" => ".zip",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        _ => FALLBACK_EXTENSION,
    }
}

/// File name for a cached listing page, derived from the URL it was served from.
///
/// `http://a.com/Search/?x=1` becomes `http__a.com__Search__QUERYx=1`.
pub fn cache_page_name(response_url: &str) -> String {
    response_url
        .replace(':', "")
        .replace("//", "__")
        .replace('/', "__")
        .replace('?', "QUERY")
}

/// First DNS label of the URL's host, e.g. `nc-nashcounty` for
/// `http://nc-nashcounty.civicplus.com/AgendaCenter`.
pub fn subdomain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    host.split('.').next().map(str::to_string)
}

/// Value of a query parameter, matched case-insensitively on the key.
pub fn query_param(url: &str, key: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.into_owned())
}

/// Collapse runs of whitespace and trim.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to `max` bytes (on a char boundary) with an ellipsis
/// and byte count appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory (and parents) and performs a probe write.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path).await?;
    let probe = path.join("..__probe_write__");
    fs::write(&probe, b"").await?;
    let _ = fs::remove_file(&probe).await;
    info!("Directory is writable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_for_known_types() {
        assert_eq!(extension_for_content_type(Some("application/pdf")), ".pdf");
        assert_eq!(
            extension_for_content_type(Some("text/html; charset=utf-8")),
            ".html"
        );
        assert_eq!(extension_for_content_type(Some("Video/MP4")), ".mp4");
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(extension_for_content_type(None), ".bin");
        assert_eq!(
            extension_for_content_type(Some("application/x-unknown")),
            ".bin"
        );
    }

    #[test]
    fn test_cache_page_name() {
        let url = "http://nc-nashcounty.civicplus.com/AgendaCenter/Search/?term=&CIDs=all&startDate=05%2F03%2F2020";
        assert_eq!(
            cache_page_name(url),
            "http__nc-nashcounty.civicplus.com__AgendaCenter__Search__QUERYterm=&CIDs=all&startDate=05%2F03%2F2020"
        );
    }

    #[test]
    fn test_subdomain() {
        assert_eq!(
            subdomain("http://nc-nashcounty.civicplus.com/AgendaCenter").as_deref(),
            Some("nc-nashcounty")
        );
        assert_eq!(subdomain("not a url"), None);
    }

    #[test]
    fn test_query_param_case_insensitive() {
        let url = "https://x.legistar.com/MeetingDetail.aspx?id=771&GUID=ABC";
        assert_eq!(query_param(url, "ID").as_deref(), Some("771"));
        assert_eq!(query_param(url, "missing"), None);
    }

    #[test]
    fn test_mb_to_bytes() {
        assert_eq!(mb_to_bytes(1.0), 1_048_576.0);
        assert_eq!(mb_to_bytes(0.5), 524_288.0);
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 100), "short");
        let long = "a".repeat(500);
        let result = truncate_for_log(&long, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_squash_whitespace() {
        assert_eq!(squash_whitespace("  Board \n of\tCommissioners "), "Board of Commissioners");
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_writable_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert!(!nested.join("..__probe_write__").exists());
    }
}
