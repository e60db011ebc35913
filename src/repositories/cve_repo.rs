// src/repositories/cve_repo.rs
//
// Row-level operations on the CVE store. Every function works on a borrowed
// connection, which in practice is the transaction of the current unit of work.

use log::{info, warn};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params};

use crate::error::{MirrorError, Result};
use crate::models::cpe::Cpe;
use crate::models::cve::{Cve, CveName, CvssMetrics, VendorStatement, VendorStatementEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
	Inserted,
	Updated,
	Deleted,
	Skipped,
}

/// Per-file ingestion tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
	pub inserted: usize,
	pub updated: usize,
	pub deleted: usize,
	pub skipped: usize,
}

impl IngestStats {
	pub fn record(&mut self, outcome: UpsertOutcome) {
		match outcome {
			UpsertOutcome::Inserted => self.inserted += 1,
			UpsertOutcome::Updated => self.updated += 1,
			UpsertOutcome::Deleted => self.deleted += 1,
			UpsertOutcome::Skipped => self.skipped += 1,
		}
	}

	pub fn total(&self) -> usize {
		self.inserted + self.updated + self.deleted + self.skipped
	}
}

/// Row counts of every CVE table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
	pub cves: i64,
	pub cpe_names: i64,
	pub cpe_links: i64,
	pub ref_urls: i64,
	pub ref_links: i64,
	pub vendor_statements: i64,
}

pub fn find_cve_rowid(conn: &Connection, name: CveName) -> Result<Option<i64>> {
	let rowid = conn
		.query_row(
			"SELECT rowid FROM cve WHERE year = ?1 AND number = ?2 LIMIT 1",
			params![name.year, name.number],
			|row| row.get(0),
		)
		.optional()?;
	Ok(rowid)
}

/// Inserts, updates or withdraws one record together with its links.
pub fn upsert_cve(conn: &Connection, cve: &Cve) -> Result<UpsertOutcome> {
	let existing = find_cve_rowid(conn, cve.name)?;

	if cve.is_rejected() {
		return match existing {
			Some(rowid) => {
				info!("Deleting {}...", cve.name);
				conn.execute("DELETE FROM cve WHERE rowid = ?1", [rowid])?;
				Ok(UpsertOutcome::Deleted)
			}
			None => Ok(UpsertOutcome::Skipped),
		};
	}

	let m = &cve.cvss;
	let (rowid, outcome) = match existing {
		Some(rowid) => {
			conn.execute(
				"UPDATE cve SET
					cvss_score = ?1,
					cvss_access_vector = ?2,
					cvss_access_complexity = ?3,
					cvss_authentication = ?4,
					cvss_confidentiality_impact = ?5,
					cvss_integrity_impact = ?6,
					cvss_availability_impact = ?7,
					cwe = ?8,
					summary = ?9,
					published = ?10
				 WHERE rowid = ?11",
				params![
					m.score,
					m.access_vector,
					m.access_complexity,
					m.authentication,
					m.confidentiality_impact,
					m.integrity_impact,
					m.availability_impact,
					cve.cwe,
					cve.summary,
					cve.published,
					rowid,
				],
			)?;
			(rowid, UpsertOutcome::Updated)
		}
		None => {
			conn.execute(
				"INSERT INTO cve (
					year, number,
					cvss_score, cvss_access_vector, cvss_access_complexity, cvss_authentication,
					cvss_confidentiality_impact, cvss_integrity_impact, cvss_availability_impact,
					cwe, summary, published
				 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
				params![
					cve.name.year,
					cve.name.number,
					m.score,
					m.access_vector,
					m.access_complexity,
					m.authentication,
					m.confidentiality_impact,
					m.integrity_impact,
					m.availability_impact,
					cve.cwe,
					cve.summary,
					cve.published,
				],
			)?;
			(conn.last_insert_rowid(), UpsertOutcome::Inserted)
		}
	};

	for url in &cve.references {
		let ref_id = intern(conn, "cve_ref_urls", "url", url)?;
		conn.execute(
			"INSERT INTO cve_references (id_cve, id_ref) VALUES (?1, ?2)",
			params![rowid, ref_id],
		)?;
	}

	for product in &cve.products {
		let cpe_id = intern(conn, "cve_cpe_names", "cpe_name", &canonical_cpe(product))?;
		conn.execute(
			"INSERT INTO cve_cpe (id_cve, id_cpe) VALUES (?1, ?2)",
			params![rowid, cpe_id],
		)?;
	}

	for statement in &cve.vendor_statements {
		insert_statement(conn, rowid, statement)?;
	}

	Ok(outcome)
}

/// Attaches a vendor statement to an already stored record. Statements for
/// unknown records are skipped.
pub fn upsert_vendor_statement(conn: &Connection, entry: &VendorStatementEntry) -> Result<UpsertOutcome> {
	match find_cve_rowid(conn, entry.cve)? {
		Some(rowid) => {
			insert_statement(conn, rowid, &entry.statement)?;
			Ok(UpsertOutcome::Updated)
		}
		None => {
			warn!("Vendor statement for {} which is not in the database", entry.cve);
			Ok(UpsertOutcome::Skipped)
		}
	}
}

// The table's unique key replaces on conflict, so a newer statement from the
// same contributor and organization overwrites the older one.
fn insert_statement(conn: &Connection, rowid: i64, statement: &VendorStatement) -> Result<()> {
	conn.execute(
		"INSERT INTO cve_vendor_statements (id_cve, contributor, organization, statement)
		 VALUES (?1, ?2, ?3, ?4)",
		params![
			rowid,
			statement.contributor.as_deref().unwrap_or(""),
			statement.organization.as_deref().unwrap_or(""),
			statement.statement,
		],
	)?;
	Ok(())
}

/// Returns the surrogate key of `value` in a dedup table, inserting it first
/// if needed.
fn intern(conn: &Connection, table: &str, column: &str, value: &str) -> Result<i64> {
	let existing: Option<i64> = conn
		.query_row(
			&format!("SELECT rowid FROM {} WHERE {} = ?1 LIMIT 1", table, column),
			[value],
			|row| row.get(0),
		)
		.optional()?;

	match existing {
		Some(id) => Ok(id),
		None => {
			conn.execute(&format!("INSERT INTO {} ({}) VALUES (?1)", table, column), [value])?;
			Ok(conn.last_insert_rowid())
		}
	}
}

/// Product names are linked by their `cpe:2.3:` form so both dialects land on
/// the same row. Names that do not parse are kept verbatim.
fn canonical_cpe(name: &str) -> String {
	match Cpe::parse(name) {
		Ok(cpe) => cpe.to_cpe23(),
		Err(e) => {
			warn!("Keeping unparsable product name as is: {}", e);
			name.to_string()
		}
	}
}

pub fn get_cve(conn: &Connection, name: CveName) -> Result<Cve> {
	let row = conn
		.query_row(
			"SELECT rowid,
				cvss_score, cvss_access_vector, cvss_access_complexity, cvss_authentication,
				cvss_confidentiality_impact, cvss_integrity_impact, cvss_availability_impact,
				cwe, summary, published
			 FROM cve WHERE year = ?1 AND number = ?2 LIMIT 1",
			params![name.year, name.number],
			|row| {
				let rowid: i64 = row.get(0)?;
				let cve = Cve {
					name,
					cvss: CvssMetrics {
						score: row.get(1)?,
						access_vector: row.get(2)?,
						access_complexity: row.get(3)?,
						authentication: row.get(4)?,
						confidentiality_impact: row.get(5)?,
						integrity_impact: row.get(6)?,
						availability_impact: row.get(7)?,
					},
					cwe: row.get(8)?,
					summary: row.get(9)?,
					published: row.get(10)?,
					products: Vec::new(),
					references: Vec::new(),
					vendor_statements: Vec::new(),
				};
				Ok((rowid, cve))
			},
		)
		.optional()?;

	let (rowid, mut cve) = row.ok_or_else(|| MirrorError::NotFound(name.to_string()))?;

	cve.products = query_strings(
		conn,
		"SELECT n.cpe_name FROM cve_cpe_names n
		 JOIN cve_cpe l ON l.id_cpe = n.rowid
		 WHERE l.id_cve = ?1
		 ORDER BY n.cpe_name",
		[rowid],
	)?;

	cve.references = query_strings(
		conn,
		"SELECT u.url FROM cve_ref_urls u
		 JOIN cve_references r ON r.id_ref = u.rowid
		 WHERE r.id_cve = ?1
		 ORDER BY u.rowid",
		[rowid],
	)?;

	let mut stmt = conn.prepare(
		"SELECT NULLIF(contributor, ''), NULLIF(organization, ''), statement
		 FROM cve_vendor_statements WHERE id_cve = ?1
		 ORDER BY contributor, organization",
	)?;
	cve.vendor_statements = stmt
		.query_map([rowid], |row| {
			Ok(VendorStatement {
				contributor: row.get(0)?,
				organization: row.get(1)?,
				statement: row.get(2)?,
			})
		})?
		.collect::<rusqlite::Result<Vec<_>>>()?;

	Ok(cve)
}

pub fn names_by_year(conn: &Connection, year: i32) -> Result<Vec<String>> {
	query_names(
		conn,
		"SELECT year, number FROM cve WHERE year = ?1 ORDER BY number",
		[year],
	)
}

pub fn names_by_cwe(conn: &Connection, cwe: &str) -> Result<Vec<String>> {
	query_names(
		conn,
		"SELECT year, number FROM cve WHERE cwe = ?1 ORDER BY year, number",
		[cwe],
	)
}

pub fn names_by_cvss_score(conn: &Connection, score: f64) -> Result<Vec<String>> {
	query_names(
		conn,
		"SELECT year, number FROM cve WHERE cvss_score = ?1 ORDER BY year, number",
		[score],
	)
}

/// Records linked to a product name, given in either dialect.
pub fn names_by_cpe(conn: &Connection, cpe: &str) -> Result<Vec<String>> {
	query_names(
		conn,
		"SELECT DISTINCT c.year, c.number FROM cve c
		 JOIN cve_cpe l ON l.id_cve = c.rowid
		 JOIN cve_cpe_names n ON n.rowid = l.id_cpe
		 WHERE n.cpe_name = ?1
		 ORDER BY c.year, c.number",
		[canonical_cpe(cpe)],
	)
}

pub fn names_by_reference(conn: &Connection, url: &str) -> Result<Vec<String>> {
	query_names(
		conn,
		"SELECT DISTINCT c.year, c.number FROM cve c
		 JOIN cve_references r ON r.id_cve = c.rowid
		 JOIN cve_ref_urls u ON u.rowid = r.id_ref
		 WHERE u.url = ?1
		 ORDER BY c.year, c.number",
		[url],
	)
}

/// Records whose summary contains every word, case-sensitively. No words, no
/// results.
pub fn search_summaries(conn: &Connection, words: &[&str]) -> Result<Vec<String>> {
	if words.is_empty() {
		return Ok(Vec::new());
	}

	let predicate = (1..=words.len())
		.map(|i| format!("instr(summary, ?{}) > 0", i))
		.collect::<Vec<_>>()
		.join(" AND ");
	let sql = format!(
		"SELECT year, number FROM cve WHERE summary IS NOT NULL AND {} ORDER BY year, number",
		predicate
	);

	query_names(conn, &sql, params_from_iter(words.iter()))
}

pub fn counts(conn: &Connection) -> Result<TableCounts> {
	let count = |table: &str| -> Result<i64> {
		Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
	};

	Ok(TableCounts {
		cves: count("cve")?,
		cpe_names: count("cve_cpe_names")?,
		cpe_links: count("cve_cpe")?,
		ref_urls: count("cve_ref_urls")?,
		ref_links: count("cve_references")?,
		vendor_statements: count("cve_vendor_statements")?,
	})
}

fn query_names<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<String>> {
	let mut stmt = conn.prepare(sql)?;
	let names = stmt
		.query_map(params, |row| Ok(CveName::new(row.get(0)?, row.get(1)?).to_string()))?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	Ok(names)
}

fn query_strings<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<String>> {
	let mut stmt = conn.prepare(sql)?;
	let values = stmt
		.query_map(params, |row| row.get(0))?
		.collect::<rusqlite::Result<Vec<String>>>()?;
	Ok(values)
}
