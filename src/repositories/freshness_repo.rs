// src/repositories/freshness_repo.rs

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::feed::FileStamp;

pub fn get_stamp(conn: &Connection, filename: &str) -> Result<Option<FileStamp>> {
	let stamp = conn
		.query_row(
			"SELECT filename, last_modified, last_modified_string FROM files
			 WHERE filename = ?1 LIMIT 1",
			[filename],
			|row| {
				Ok(FileStamp {
					filename: row.get(0)?,
					last_modified: row.get(1)?,
					last_modified_string: row.get(2)?,
				})
			},
		)
		.optional()?;

	Ok(stamp)
}

/// Replaces the stamp for `stamp.filename`; the filename column is unique.
pub fn set_stamp(conn: &Connection, stamp: &FileStamp) -> Result<()> {
	conn.execute(
		"INSERT INTO files (filename, last_modified, last_modified_string) VALUES (?1, ?2, ?3)",
		params![stamp.filename, stamp.last_modified, stamp.last_modified_string],
	)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::schema;

	#[test]
	fn test_set_replaces_by_filename() {
		let conn = Connection::open_in_memory().unwrap();
		schema::create_cve_tables(&conn).unwrap();

		assert_eq!(get_stamp(&conn, "feed.xml").unwrap(), None);

		let first = FileStamp::new("feed.xml", 100, "first".to_string());
		set_stamp(&conn, &first).unwrap();
		assert_eq!(get_stamp(&conn, "feed.xml").unwrap(), Some(first));

		let second = FileStamp::new("feed.xml", 200, "second".to_string());
		set_stamp(&conn, &second).unwrap();
		assert_eq!(get_stamp(&conn, "feed.xml").unwrap(), Some(second));

		let rows: i64 = conn
			.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
			.unwrap();
		assert_eq!(rows, 1);
	}
}
