//! Cache directory policy.
//!
//! A [`Cache`] is a root directory with three named buckets:
//!
//! ```text
//! <root>/
//! ├── assets/     # downloaded files
//! ├── artifacts/  # cached listing pages
//! └── metadata/   # CSV exports
//! ```
//!
//! The root is resolved once per session: explicit path, else the
//! `CIVIC_SCRAPER_DIR` environment variable, else `~/.civic-scraper`.
//! Nothing is created on construction; writers create directories lazily.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

use crate::error::ScrapeError;

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "CIVIC_SCRAPER_DIR";

/// Directory name used under the user's home when nothing else is configured.
pub const DEFAULT_DIR_NAME: &str = ".civic-scraper";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Resolve the root from an explicit path, the environment, or the default.
    pub fn new(path: Option<PathBuf>) -> Self {
        let from_env = std::env::var_os(CACHE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::resolve(path, from_env, home_dir())
    }

    /// Pure resolution order: explicit, env override, `<home>/.civic-scraper`.
    pub fn resolve(explicit: Option<PathBuf>, from_env: Option<PathBuf>, home: Option<PathBuf>) -> Self {
        let root = explicit
            .or(from_env)
            .unwrap_or_else(|| home.unwrap_or_else(|| PathBuf::from(".")).join(DEFAULT_DIR_NAME));
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn assets_path(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn metadata_files_path(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// Write text to `<root>/<relative_name>`, creating parents. Returns the full path.
    #[instrument(level = "debug", skip(self, content), fields(root = %self.root.display()))]
    pub async fn write(&self, relative_name: &str, content: &str) -> Result<PathBuf, ScrapeError> {
        let out = self.root.join(relative_name);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&out, content).await?;
        debug!(path = %out.display(), bytes = content.len(), "Cached file");
        Ok(out)
    }

    /// Write a listing page into the artifacts bucket.
    pub async fn write_artifact(&self, name: &str, content: &str) -> Result<PathBuf, ScrapeError> {
        self.write(&format!("artifacts/{name}"), content).await
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(None)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
