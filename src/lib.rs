//! Local, queryable mirror of the NVD CPE dictionary and CVE feeds.
//!
//! [`CveDb`] and [`CpeDb`] each own one SQLite file. `update()` brings a store
//! up to date with the remote feeds, downloading only what changed; every
//! other method is a read-only query.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod utils;

pub use config::MirrorConfig;
pub use db::cpe_db::CpeDb;
pub use db::cve_db::CveDb;
pub use db::store::{FileOutcome, UpdateReport};
pub use error::{MirrorError, Result};
pub use models::cpe::{cpe22_to_cpe23, detect_dialect, Cpe, Dialect};
pub use models::cve::{Cve, CveName, QueryTerm};
pub use repositories::cpe_repo::CpeQuery;
