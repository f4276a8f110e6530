//! Error types shared by the asset model, the transport and every platform adapter.
//!
//! Two layers exist:
//! - [`AssetError`]: construction-time validation of a single [`Asset`](crate::models::Asset).
//!   Adapters catch these per record and skip the offending row.
//! - [`ScrapeError`]: anything that can go wrong while talking to a site,
//!   parsing its listing, or writing results to disk.

use thiserror::Error;

/// Validation failure raised while building an [`Asset`](crate::models::Asset).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// The URL was empty.
    #[error("asset url is empty")]
    EmptyUrl,

    /// The URL did not parse or used a scheme other than http(s).
    #[error("asset url has no supported scheme: {0}")]
    UnsupportedScheme(String),

    /// `state_or_province` was not exactly two letters.
    #[error("state_or_province must be a two-letter code, got {0:?}")]
    InvalidStateCode(String),

    /// Free-form asset type was empty or not a lowercase word.
    #[error("unsupported asset type: {0:?}")]
    InvalidAssetType(String),
}

/// Failure while scraping, downloading or exporting.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Transport-level failure (DNS, TLS, connection reset, timeout).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON body did not match the expected shape.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// RSS/XML body was malformed.
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// CSV read or write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// YAML configuration failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A record failed validation.
    #[error(transparent)]
    Asset(#[from] AssetError),

    /// The listing page as a whole did not have the expected structure.
    #[error("could not parse listing from {url}: {reason}")]
    Parse { url: String, reason: String },

    /// A paginated listing never produced a repeated or empty page.
    #[error("pagination for {url} exceeded {limit} pages")]
    PaginationLimit { url: String, limit: usize },

    /// No adapter is registered for the URL.
    #[error("no scraper recognises site url {0}")]
    UnrecognizedSite(String),

    /// Invalid user-supplied configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ScrapeError {
    pub(crate) fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        ScrapeError::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
