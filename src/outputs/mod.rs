//! Output generation for scraped metadata.
//!
//! # Submodules
//!
//! - [`csv`]: Writes an [`AssetCollection`](crate::models::AssetCollection) to a
//!   timestamped metadata CSV
//!
//! # Output Structure
//!
//! ```text
//! <cache root>/
//! ├── assets/      # downloaded agendas, minutes, media
//! ├── artifacts/   # cached listing pages (HTML/JSON/RSS)
//! └── metadata/
//!     ├── civic_scraper_assets_meta_20201225T101500123z.csv
//!     └── civic_scraper_assets_meta_20201226T080000456z.csv
//! ```

pub mod csv;
