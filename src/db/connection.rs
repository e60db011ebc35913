use std::path::Path;

use log::info;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{MirrorError, Result};

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Establishes a connection pool on the given database file.
///
/// Every connection handed out by the pool has foreign keys enabled, which the
/// cascading deletes of rejected records rely on.
pub fn establish_pool_with_path(path: &Path, max_size: u32) -> Result<SqlitePool> {
	info!("SQLite database will be located at: {:?}", path);

	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
		}
	}

	let manager = SqliteConnectionManager::file(path)
		.with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

	let pool = Pool::builder().max_size(max_size.max(1)).build(manager)?;

	info!("SQLite connection pool established successfully");
	Ok(pool)
}
