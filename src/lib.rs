//! # civic_scraper
//!
//! Collects public meeting documents (agendas, minutes, packets, audio and
//! video) from the agenda-publishing platforms local governments use, and
//! normalizes them into one asset model.
//!
//! ## Platforms
//!
//! - CivicPlus Agenda Center (HTML search page)
//! - Granicus / iqm2 (RSS feed) and Granicus ViewPublisher (HTML table)
//! - BoardDocs (HTML + JSON meeting list)
//! - Legistar (paginated ASP.NET calendar grid)
//! - PrimeGov (JSON portal API)
//!
//! ## Architecture
//!
//! 1. **Configure**: one [`config::SiteConfig`] per site
//! 2. **Scrape**: [`platforms::build_site`] picks the adapter for a URL; each
//!    adapter returns an [`models::AssetCollection`]
//! 3. **Download**: optional, filtered by size and asset type
//! 4. **Export**: a timestamped metadata CSV in the [`cache::Cache`]
//!
//! [`runner::Runner`] drives all four steps over many sites.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod outputs;
pub mod platforms;
pub mod runner;
pub mod transport;
pub mod utils;
