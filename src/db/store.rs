use std::path::Path;

use log::{debug, info};
use rusqlite::{Connection, Transaction};

use crate::db::connection::{establish_pool_with_path, SqlitePool};
use crate::db::guard::UnitGuard;
use crate::error::Result;
use crate::repositories::cve_repo::{IngestStats, UpsertOutcome};
use crate::utils::feed_sync::FeedSynchronizer;
use crate::utils::xml_stream::FeedRecord;

/// What happened to one feed file during an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
	UpToDate,
	Loaded(IngestStats),
}

impl FileOutcome {
	pub fn is_loaded(&self) -> bool {
		matches!(self, FileOutcome::Loaded(_))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
	pub files: Vec<(String, FileOutcome)>,
}

impl UpdateReport {
	pub fn push(&mut self, filename: &str, outcome: FileOutcome) {
		self.files.push((filename.to_string(), outcome));
	}

	/// Number of files that were actually loaded.
	pub fn loaded(&self) -> usize {
		self.files.iter().filter(|(_, outcome)| outcome.is_loaded()).count()
	}

	pub fn records(&self) -> usize {
		self.files
			.iter()
			.map(|(_, outcome)| match outcome {
				FileOutcome::Loaded(stats) => stats.total(),
				FileOutcome::UpToDate => 0,
			})
			.sum()
	}
}

/// A pooled SQLite file plus the guard that serializes units of work on it.
pub struct Store {
	pool: SqlitePool,
	guard: UnitGuard,
	is_new: bool,
}

impl Store {
	/// Opens (creating if needed) the database at `path` and makes sure its
	/// schema exists.
	pub fn open(path: &Path, pool_size: u32, create_schema: fn(&Connection) -> Result<()>) -> Result<Self> {
		let is_new = !path.exists();
		let pool = establish_pool_with_path(path, pool_size)?;

		{
			let conn = pool.get()?;
			create_schema(&conn)?;
		}
		info!("Database tables initialized successfully");

		Ok(Self {
			pool,
			guard: UnitGuard::new(),
			is_new,
		})
	}

	/// True when the database file did not exist before this handle opened it.
	pub fn is_new(&self) -> bool {
		self.is_new
	}

	/// Runs `work` as one atomic unit: committed if it returns `Ok`, rolled
	/// back otherwise. Calling back into the same store from inside `work`
	/// fails with `StoreBusy`.
	pub fn transaction<T, F>(&self, work: F) -> Result<T>
	where
		F: FnOnce(&Transaction<'_>) -> Result<T>,
	{
		let _unit = self.guard.enter()?;
		let mut conn = self.pool.get()?;
		let tx = conn.transaction()?;

		match work(&tx) {
			Ok(value) => {
				tx.commit()?;
				Ok(value)
			}
			Err(e) => {
				debug!("Rolling back: {}", e);
				tx.rollback()?;
				Err(e)
			}
		}
	}

	/// Synchronizes one feed file and loads it, all in a single unit of work.
	/// A failure anywhere leaves both the records and the freshness stamp as
	/// they were.
	pub fn load_feed<T, F>(&self, sync: &FeedSynchronizer, base_url: &str, filename: &str, mut upsert: F) -> Result<FileOutcome>
	where
		T: FeedRecord,
		F: FnMut(&Connection, T) -> Result<UpsertOutcome>,
	{
		self.transaction(|tx| {
			let conn: &Connection = tx;
			let file = match sync.sync(conn, base_url, filename)? {
				Some(file) => file,
				None => return Ok(FileOutcome::UpToDate),
			};

			let mut stats = IngestStats::default();
			file.ingest(|record: T| {
				stats.record(upsert(conn, record)?);
				Ok(())
			})?;

			info!(
				"Loaded {}: {} inserted, {} updated, {} deleted, {} skipped",
				filename, stats.inserted, stats.updated, stats.deleted, stats.skipped
			);
			Ok(FileOutcome::Loaded(stats))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::schema;
	use crate::error::MirrorError;
	use crate::models::feed::FileStamp;
	use crate::repositories::freshness_repo;

	#[test]
	fn test_commit_and_rollback() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("store.db");
		let store = Store::open(&path, 2, schema::create_cve_tables).unwrap();
		assert!(store.is_new());

		store
			.transaction(|tx| freshness_repo::set_stamp(tx, &FileStamp::new("a.xml", 1, "one".to_string())))
			.unwrap();

		let err = store
			.transaction(|tx| {
				freshness_repo::set_stamp(tx, &FileStamp::new("b.xml", 2, "two".to_string()))?;
				Err::<(), _>(MirrorError::NotFound("b.xml".to_string()))
			})
			.unwrap_err();
		assert!(matches!(err, MirrorError::NotFound(_)));

		let (a, b) = store
			.transaction(|tx| Ok((freshness_repo::get_stamp(tx, "a.xml")?, freshness_repo::get_stamp(tx, "b.xml")?)))
			.unwrap();
		assert!(a.is_some());
		assert!(b.is_none());

		drop(store);
		let reopened = Store::open(&path, 2, schema::create_cve_tables).unwrap();
		assert!(!reopened.is_new());
	}

	#[test]
	fn test_nested_unit_is_busy() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(&dir.path().join("store.db"), 2, schema::create_cve_tables).unwrap();

		let inner = store
			.transaction(|_| Ok(store.transaction(|_| Ok(()))))
			.unwrap();
		assert!(matches!(inner, Err(MirrorError::StoreBusy)));

		// The outer unit released the handle.
		assert!(store.transaction(|_| Ok(())).is_ok());
	}
}
