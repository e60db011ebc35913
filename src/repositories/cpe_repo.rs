// src/repositories/cpe_repo.rs

use std::collections::BTreeSet;

use log::warn;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::error::{MirrorError, Result};
use crate::models::cpe::{detect_dialect, Cpe, CpeItem, FIELD_NAMES, WILDCARD};
use crate::repositories::cve_repo::UpsertOutcome;

/// Substring filters for [`search`]. Wildcard and absent fields impose no
/// constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpeQuery {
	title: Option<String>,
	fields: Vec<(&'static str, String)>,
}

impl CpeQuery {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn title(mut self, title: &str) -> Self {
		self.title = Some(title.to_string());
		self
	}

	pub fn field(mut self, name: &str, value: &str) -> Result<Self> {
		let column = FIELD_NAMES
			.iter()
			.find(|column| **column == name)
			.copied()
			.ok_or_else(|| MirrorError::InvalidIdentifier(format!("unknown CPE field: {}", name)))?;
		if value != WILDCARD {
			self.fields.push((column, value.to_string()));
		}
		Ok(self)
	}

	fn predicates(&self) -> Vec<(String, String)> {
		let mut out = Vec::new();
		if let Some(title) = &self.title {
			out.push(("title".to_string(), title.clone()));
		}
		for (column, value) in &self.fields {
			out.push((format!("\"{}\"", column), value.clone()));
		}
		out
	}
}

/// Stores one dictionary item, replacing any previous row with the same
/// `cpe:2.3:` name. Items whose name cannot be decoded are skipped.
pub fn upsert_cpe_item(conn: &Connection, item: &CpeItem) -> Result<UpsertOutcome> {
	let cpe = match Cpe::parse(&item.name23) {
		Ok(cpe) => cpe,
		Err(e) => {
			warn!("Skipping dictionary item {}: {}", item.name22, e);
			return Ok(UpsertOutcome::Skipped);
		}
	};

	let existing: Option<i64> = conn
		.query_row("SELECT rowid FROM cpe WHERE name23 = ?1", [&item.name23], |row| row.get(0))
		.optional()?;

	let columns = FIELD_NAMES
		.iter()
		.map(|name| format!("\"{}\"", name))
		.collect::<Vec<_>>()
		.join(", ");
	let placeholders = (1..=4 + FIELD_NAMES.len())
		.map(|i| format!("?{}", i))
		.collect::<Vec<_>>()
		.join(", ");
	let sql = format!(
		"INSERT OR REPLACE INTO cpe (name23, name22, title, deprecated, {}) VALUES ({})",
		columns, placeholders
	);

	let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
		Box::new(item.name23.clone()),
		Box::new(item.name22.clone()),
		Box::new(item.title.clone()),
		Box::new(item.deprecated),
	];
	for field in cpe.fields() {
		values.push(Box::new(field.clone()));
	}

	conn.execute(&sql, params_from_iter(values.iter()))?;
	Ok(if existing.is_some() {
		UpsertOutcome::Updated
	} else {
		UpsertOutcome::Inserted
	})
}

/// Expands a possibly-wildcarded name into the stored names it matches,
/// written in the same dialect as the query.
pub fn resolve(conn: &Connection, name: &str, include_deprecated: bool) -> Result<BTreeSet<String>> {
	let dialect = detect_dialect(name)?;
	let cpe = Cpe::parse(name)?;

	if cpe.is_all_wildcards() {
		return Ok(BTreeSet::from([name.to_string()]));
	}

	let column = dialect.name_column();
	let constraints = cpe.constraints();
	let fields = constraints
		.iter()
		.map(|(field, _)| format!("\"{}\" = ?", field))
		.collect::<Vec<_>>()
		.join(" AND ");

	let mut sql = format!("SELECT {} FROM cpe WHERE ", column);
	if !include_deprecated {
		sql.push_str("deprecated = 0 AND ");
	}
	sql.push_str(&format!("({} = ? OR ({}))", column, fields));

	let mut values = vec![name];
	values.extend(constraints.iter().map(|(_, value)| *value));

	let mut stmt = conn.prepare(&sql)?;
	let names = stmt
		.query_map(params_from_iter(values.iter()), |row| row.get(0))?
		.collect::<rusqlite::Result<BTreeSet<String>>>()?;
	Ok(names)
}

/// Title of an exact name, in either dialect.
pub fn get_title(conn: &Connection, name: &str) -> Result<Option<String>> {
	let column = detect_dialect(name)?.name_column();
	let title = conn
		.query_row(
			&format!("SELECT title FROM cpe WHERE {} = ?1 LIMIT 1", column),
			[name],
			|row| row.get::<_, Option<String>>(0),
		)
		.optional()?;

	title.ok_or_else(|| MirrorError::NotFound(name.to_string()))
}

pub fn search(conn: &Connection, query: &CpeQuery) -> Result<BTreeSet<String>> {
	let predicates = query.predicates();
	if predicates.is_empty() {
		return Ok(BTreeSet::new());
	}

	let clause = predicates
		.iter()
		.map(|(column, _)| format!("{} LIKE ? ESCAPE '\\'", column))
		.collect::<Vec<_>>()
		.join(" AND ");
	let patterns: Vec<String> = predicates
		.iter()
		.map(|(_, value)| format!("%{}%", escape_like(value)))
		.collect();

	let mut stmt = conn.prepare(&format!("SELECT name23 FROM cpe WHERE {}", clause))?;
	let names = stmt
		.query_map(params_from_iter(patterns.iter()), |row| row.get(0))?
		.collect::<rusqlite::Result<BTreeSet<String>>>()?;
	Ok(names)
}

pub fn count(conn: &Connection) -> Result<i64> {
	Ok(conn.query_row("SELECT COUNT(*) FROM cpe", [], |row| row.get(0))?)
}

fn escape_like(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for c in value.chars() {
		if matches!(c, '\\' | '%' | '_') {
			out.push('\\');
		}
		out.push(c);
	}
	out
}
