// src/models/cve.rs

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Summary prefix the upstream feeds use to withdraw a record.
pub const REJECT_MARKER: &str = "** REJECT **";

lazy_static! {
	static ref CVE_NAME: Regex = Regex::new(r"^CVE-(\d{4})-(\d{4,})$").unwrap();
}

/// `(year, number)` key of a CVE, printed as `CVE-YYYY-NNNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CveName {
	pub year: i32,
	pub number: i64,
}

impl CveName {
	pub fn new(year: i32, number: i64) -> Self {
		Self { year, number }
	}

	pub fn parse(name: &str) -> Result<Self> {
		let invalid = || MirrorError::InvalidCveName(name.to_string());
		let caps = CVE_NAME.captures(name.trim()).ok_or_else(invalid)?;
		let year = caps[1].parse().map_err(|_| invalid())?;
		let number = caps[2].parse().map_err(|_| invalid())?;
		Ok(Self { year, number })
	}
}

impl FromStr for CveName {
	type Err = MirrorError;

	fn from_str(s: &str) -> Result<Self> {
		CveName::parse(s)
	}
}

impl fmt::Display for CveName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CVE-{:04}-{:04}", self.year, self.number)
	}
}

/// How one free-form lookup token is read by [`crate::CveDb::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTerm {
	Name(CveName),
	Cwe(String),
	Product(String),
	Reference(String),
	Year(i32),
	Score(f64),
	Words(Vec<String>),
}

impl QueryTerm {
	/// Checked in order: CVE name, `CWE-` id, CPE name in either dialect,
	/// http(s) URL, four-digit year, CVSS score. Anything else is a summary
	/// search for every word in the token.
	pub fn classify(token: &str) -> Result<Self> {
		let token = token.trim();
		if token.starts_with("CVE-") {
			return Ok(QueryTerm::Name(CveName::parse(token)?));
		}
		if token.starts_with("CWE-") {
			return Ok(QueryTerm::Cwe(token.to_string()));
		}
		if token.starts_with("cpe:") {
			return Ok(QueryTerm::Product(token.to_string()));
		}
		if token.starts_with("http://") || token.starts_with("https://") {
			return Ok(QueryTerm::Reference(token.to_string()));
		}
		if token.len() == 4 && token.bytes().all(|b| b.is_ascii_digit()) {
			if let Ok(year) = token.parse() {
				return Ok(QueryTerm::Year(year));
			}
		}
		if let Ok(score) = token.parse::<f64>() {
			if score.is_finite() {
				return Ok(QueryTerm::Score(score));
			}
		}
		Ok(QueryTerm::Words(token.split_whitespace().map(str::to_string).collect()))
	}
}

/// CVSS v2 base metrics as published in the feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CvssMetrics {
	pub score: Option<f64>,
	pub access_vector: Option<String>,
	pub access_complexity: Option<String>,
	pub authentication: Option<String>,
	pub confidentiality_impact: Option<String>,
	pub integrity_impact: Option<String>,
	pub availability_impact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorStatement {
	pub contributor: Option<String>,
	pub organization: Option<String>,
	pub statement: String,
}

/// A vendor statement as read from the statements feed, before it is
/// attached to a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorStatementEntry {
	pub cve: CveName,
	pub statement: VendorStatement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cve {
	pub name: CveName,
	pub cvss: CvssMetrics,
	pub cwe: Option<String>,
	pub summary: Option<String>,
	pub published: Option<String>,
	pub products: Vec<String>,
	pub references: Vec<String>,
	pub vendor_statements: Vec<VendorStatement>,
}

impl Cve {
	pub fn new(name: CveName) -> Self {
		Self {
			name,
			cvss: CvssMetrics::default(),
			cwe: None,
			summary: None,
			published: None,
			products: Vec::new(),
			references: Vec::new(),
			vendor_statements: Vec::new(),
		}
	}

	pub fn is_rejected(&self) -> bool {
		self.summary
			.as_deref()
			.map_or(false, |summary| summary.starts_with(REJECT_MARKER))
	}
}

fn push_section(lines: &mut Vec<String>, title: &str) {
	if lines.last().map_or(false, |line| !line.is_empty()) {
		lines.push(String::new());
	}
	lines.push(title.to_string());
	lines.push("-".repeat(title.len()));
	lines.push(String::new());
}

impl fmt::Display for Cve {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = self.name.to_string();
		let mut lines = vec![name.clone(), "=".repeat(name.len()), String::new()];

		let score = self.cvss.score.map(|s| format!("{:.1}", s));
		let fields = [
			("CVSS Base Score:", score.as_deref()),
			("CVSS Access Vector:", self.cvss.access_vector.as_deref()),
			("CVSS Access Complexity:", self.cvss.access_complexity.as_deref()),
			("CVSS Authentication:", self.cvss.authentication.as_deref()),
			("CVSS Confidentiality Impact:", self.cvss.confidentiality_impact.as_deref()),
			("CVSS Integrity Impact:", self.cvss.integrity_impact.as_deref()),
			("CVSS Availability Impact:", self.cvss.availability_impact.as_deref()),
			("CWE ID:", self.cwe.as_deref()),
		];
		for (label, value) in fields {
			if let Some(value) = value {
				lines.push(label.to_string());
				lines.push(format!("  {}", value));
			}
		}

		if let Some(summary) = &self.summary {
			push_section(&mut lines, "Summary");
			if summary.contains('\n') {
				lines.push("::".to_string());
				lines.extend(summary.split('\n').map(|line| format!("  {}", line)));
			} else {
				lines.push(summary.trim().to_string());
			}
		}

		if !self.products.is_empty() {
			push_section(&mut lines, "Vulnerable products");
			lines.extend(self.products.iter().map(|cpe| format!("- {}", cpe)));
		}

		if !self.references.is_empty() {
			push_section(&mut lines, "References");
			lines.extend(self.references.iter().map(|url| format!("- {}", url)));
		}

		if !self.vendor_statements.is_empty() {
			push_section(&mut lines, "Vendor Statements");
			lines.pop();
			for vs in &self.vendor_statements {
				lines.push(String::new());
				match (&vs.contributor, &vs.organization) {
					(Some(c), Some(o)) => lines.push(format!("*{} from {}:*", c, o)),
					(Some(who), None) | (None, Some(who)) => lines.push(format!("*{}:*", who)),
					(None, None) => {}
				}
				lines.extend(vs.statement.split('\n').map(|line| format!("  {}", line)));
			}
		}

		write!(f, "{}", lines.join("\n"))
	}
}
