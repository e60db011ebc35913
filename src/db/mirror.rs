use log::{error, info};

use crate::db::cpe_db::CpeDb;
use crate::db::cve_db::CveDb;
use crate::db::store::{FileOutcome, UpdateReport};
use crate::error::Result;

/// Outcome of refreshing both stores. Each side succeeds or fails on its own.
#[derive(Debug)]
pub struct MirrorUpdate {
	pub cve: Result<UpdateReport>,
	pub cpe: Result<FileOutcome>,
}

impl MirrorUpdate {
	pub fn is_ok(&self) -> bool {
		self.cve.is_ok() && self.cpe.is_ok()
	}

	pub fn log(&self) {
		match &self.cve {
			Ok(report) => info!(
				"CVE database: {} files loaded, {} records processed",
				report.loaded(),
				report.records()
			),
			Err(e) => error!("CVE update failed: {}", e),
		}
		match &self.cpe {
			Ok(FileOutcome::UpToDate) => info!("CPE dictionary already up-to-date"),
			Ok(FileOutcome::Loaded(stats)) => info!(
				"CPE dictionary: {} items added, {} replaced, {} skipped",
				stats.inserted, stats.updated, stats.skipped
			),
			Err(e) => error!("CPE update failed: {}", e),
		}
	}
}

/// Updates the CVE store, then the dictionary. A failing CVE feed does not
/// keep the dictionary from being refreshed.
pub fn update_all(cve_db: &CveDb, cpe_db: &CpeDb) -> MirrorUpdate {
	MirrorUpdate {
		cve: cve_db.update(),
		cpe: cpe_db.update(),
	}
}
