use rusqlite::Connection;

use crate::error::Result;
use crate::models::cpe::FIELD_NAMES;

const FILES_TABLE: &str = "
	CREATE TABLE IF NOT EXISTS files (
		filename TEXT NOT NULL UNIQUE ON CONFLICT REPLACE,
		last_modified INTEGER NOT NULL,
		last_modified_string TEXT NOT NULL
	);
";

pub fn create_cve_tables(conn: &Connection) -> Result<()> {
	conn.execute_batch(FILES_TABLE)?;
	conn.execute_batch(
		"
		CREATE TABLE IF NOT EXISTS cve (
			rowid INTEGER PRIMARY KEY,
			year INTEGER NOT NULL,
			number INTEGER NOT NULL,
			cvss_score REAL,
			cvss_access_vector TEXT,
			cvss_access_complexity TEXT,
			cvss_authentication TEXT,
			cvss_confidentiality_impact TEXT,
			cvss_integrity_impact TEXT,
			cvss_availability_impact TEXT,
			cwe TEXT,
			summary TEXT,
			published TEXT,
			UNIQUE (year, number)
		);
		CREATE INDEX IF NOT EXISTS cve_year ON cve(year);
		CREATE INDEX IF NOT EXISTS cve_cvss_score ON cve(cvss_score);
		CREATE INDEX IF NOT EXISTS cve_cwe ON cve(cwe);

		CREATE TABLE IF NOT EXISTS cve_cpe_names (
			rowid INTEGER PRIMARY KEY,
			cpe_name TEXT NOT NULL UNIQUE
		);

		CREATE TABLE IF NOT EXISTS cve_cpe (
			id_cve INTEGER NOT NULL,
			id_cpe INTEGER NOT NULL,
			FOREIGN KEY(id_cve) REFERENCES cve(rowid) ON DELETE CASCADE,
			FOREIGN KEY(id_cpe) REFERENCES cve_cpe_names(rowid) ON DELETE CASCADE,
			UNIQUE (id_cve, id_cpe) ON CONFLICT IGNORE
		);
		CREATE INDEX IF NOT EXISTS cve_cpe_id_cpe ON cve_cpe(id_cpe);

		CREATE TABLE IF NOT EXISTS cve_ref_urls (
			rowid INTEGER PRIMARY KEY,
			url TEXT NOT NULL UNIQUE
		);

		CREATE TABLE IF NOT EXISTS cve_references (
			id_cve INTEGER NOT NULL,
			id_ref INTEGER NOT NULL,
			FOREIGN KEY(id_cve) REFERENCES cve(rowid) ON DELETE CASCADE,
			FOREIGN KEY(id_ref) REFERENCES cve_ref_urls(rowid) ON DELETE CASCADE,
			UNIQUE (id_cve, id_ref) ON CONFLICT IGNORE
		);
		CREATE INDEX IF NOT EXISTS cve_references_id_ref ON cve_references(id_ref);

		-- Absent contributor/organization are stored as '' so the key stays unique.
		CREATE TABLE IF NOT EXISTS cve_vendor_statements (
			id_cve INTEGER NOT NULL,
			contributor TEXT NOT NULL DEFAULT '',
			organization TEXT NOT NULL DEFAULT '',
			statement TEXT NOT NULL,
			FOREIGN KEY(id_cve) REFERENCES cve(rowid) ON DELETE CASCADE,
			UNIQUE (id_cve, contributor, organization) ON CONFLICT REPLACE
		);
		",
	)?;

	Ok(())
}

pub fn create_cpe_tables(conn: &Connection) -> Result<()> {
	conn.execute_batch(FILES_TABLE)?;

	let columns = FIELD_NAMES
		.iter()
		.map(|name| format!("\"{}\" TEXT NOT NULL DEFAULT '*'", name))
		.collect::<Vec<_>>()
		.join(",\n\t\t\t");
	let indexes = FIELD_NAMES
		.iter()
		.map(|name| format!("CREATE INDEX IF NOT EXISTS cpe_{0} ON cpe(\"{0}\");", name))
		.collect::<Vec<_>>()
		.join("\n\t\t");

	conn.execute_batch(&format!(
		"
		CREATE TABLE IF NOT EXISTS cpe (
			rowid INTEGER PRIMARY KEY,
			name23 TEXT NOT NULL UNIQUE,
			name22 TEXT NOT NULL,
			title TEXT,
			deprecated INTEGER NOT NULL DEFAULT 0,
			{}
		);
		CREATE INDEX IF NOT EXISTS cpe_name22 ON cpe(name22);
		CREATE INDEX IF NOT EXISTS cpe_title ON cpe(title);
		{}
		",
		columns, indexes
	))?;

	Ok(())
}
