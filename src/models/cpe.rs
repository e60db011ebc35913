// src/models/cpe.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

pub const CPE22_PREFIX: &str = "cpe:/";
pub const CPE23_PREFIX: &str = "cpe:2.3:";
pub const WILDCARD: &str = "*";
pub const FIELD_COUNT: usize = 11;

/// Column names of the decomposed fields, in CPE order.
pub const FIELD_NAMES: [&str; FIELD_COUNT] = [
	"part",
	"vendor",
	"product",
	"version",
	"update",
	"edition",
	"language",
	"sw_edition",
	"target_sw",
	"target_hw",
	"other",
];

/// Textual encoding of a CPE name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
	/// `cpe:/` URI binding, percent-escaped, up to 11 fields.
	Cpe22,
	/// `cpe:2.3:` formatted string, backslash-escaped, exactly 11 fields.
	Cpe23,
}

impl Dialect {
	pub fn prefix(self) -> &'static str {
		match self {
			Dialect::Cpe22 => CPE22_PREFIX,
			Dialect::Cpe23 => CPE23_PREFIX,
		}
	}

	/// Dictionary column holding names written in this dialect.
	pub fn name_column(self) -> &'static str {
		match self {
			Dialect::Cpe22 => "name22",
			Dialect::Cpe23 => "name23",
		}
	}
}

impl fmt::Display for Dialect {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Dialect::Cpe22 => write!(f, "2.2"),
			Dialect::Cpe23 => write!(f, "2.3"),
		}
	}
}

pub fn detect_dialect(name: &str) -> Result<Dialect> {
	if name.starts_with(CPE22_PREFIX) {
		Ok(Dialect::Cpe22)
	} else if name.starts_with(CPE23_PREFIX) {
		Ok(Dialect::Cpe23)
	} else {
		Err(MirrorError::InvalidIdentifier(name.to_string()))
	}
}

/// A decomposed CPE name. Always exactly 11 fields, each a literal or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cpe {
	fields: [String; FIELD_COUNT],
}

impl Cpe {
	/// Decodes a name in either dialect.
	pub fn parse(name: &str) -> Result<Self> {
		let raw: Vec<String> = match detect_dialect(name)? {
			Dialect::Cpe22 => name[CPE22_PREFIX.len()..]
				.split(':')
				.map(|field| cpe22_unquote(field.trim()))
				.collect::<Result<_>>()?,
			Dialect::Cpe23 => {
				let raw: Vec<String> = split_unescaped_colons(&name[CPE23_PREFIX.len()..])
					.into_iter()
					.map(|field| field.trim().to_string())
					.collect();
				if raw.len() != FIELD_COUNT {
					return Err(MirrorError::InvalidIdentifier(name.to_string()));
				}
				raw
			}
		};

		if raw.len() > FIELD_COUNT {
			return Err(MirrorError::InvalidIdentifier(name.to_string()));
		}

		let mut fields: [String; FIELD_COUNT] = Default::default();
		for (slot, value) in fields.iter_mut().zip(raw) {
			*slot = value;
		}
		for slot in fields.iter_mut() {
			if slot.is_empty() {
				*slot = WILDCARD.to_string();
			}
		}

		Ok(Self { fields })
	}

	pub fn from_fields(fields: [String; FIELD_COUNT]) -> Self {
		let fields = fields.map(|field| if field.is_empty() { WILDCARD.to_string() } else { field });
		Self { fields }
	}

	pub fn fields(&self) -> &[String; FIELD_COUNT] {
		&self.fields
	}

	pub fn part(&self) -> &str {
		&self.fields[0]
	}

	pub fn vendor(&self) -> &str {
		&self.fields[1]
	}

	pub fn product(&self) -> &str {
		&self.fields[2]
	}

	pub fn version(&self) -> &str {
		&self.fields[3]
	}

	pub fn is_all_wildcards(&self) -> bool {
		self.fields.iter().all(|field| field == WILDCARD)
	}

	/// Column/value pairs for every field that is not a wildcard.
	pub fn constraints(&self) -> Vec<(&'static str, &str)> {
		FIELD_NAMES
			.iter()
			.zip(self.fields.iter())
			.filter(|(_, value)| value.as_str() != WILDCARD)
			.map(|(column, value)| (*column, value.as_str()))
			.collect()
	}

	/// Canonical `cpe:2.3:` form, used for storage.
	pub fn to_cpe23(&self) -> String {
		let joined = self
			.fields
			.iter()
			.map(|field| escape_colons(field))
			.collect::<Vec<_>>()
			.join(":");
		format!("{}{}", CPE23_PREFIX, joined)
	}
}

impl FromStr for Cpe {
	type Err = MirrorError;

	fn from_str(s: &str) -> Result<Self> {
		Cpe::parse(s)
	}
}

impl fmt::Display for Cpe {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_cpe23())
	}
}

/// Normalizes a name in either dialect to the `cpe:2.3:` form.
pub fn cpe22_to_cpe23(name: &str) -> Result<String> {
	Ok(Cpe::parse(name)?.to_cpe23())
}

/// One entry of the official product dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpeItem {
	pub name23: String,
	pub name22: String,
	pub title: Option<String>,
	pub deprecated: bool,
}

/// Percent-decoding of a 2.2 field into the backslash-escaped 2.3 form.
///
/// An ASCII `%xy` becomes `\` followed by the decoded byte. A run of escapes
/// above `0x7f` is decoded as UTF-8 and written unescaped. `%%` collapses to
/// `%`, and a `%` without two hex digits after it is kept as is.
fn cpe22_unquote(field: &str) -> Result<String> {
	let chars: Vec<char> = field.chars().collect();
	let mut out = String::with_capacity(field.len());
	let mut pending = Vec::new();

	let mut i = 0;
	while i < chars.len() {
		let c = chars[i];
		if c == '%' {
			if let (Some(high), Some(low)) = (hex_value(chars.get(i + 1)), hex_value(chars.get(i + 2))) {
				let byte = (high * 16 + low) as u8;
				if byte.is_ascii() {
					flush_utf8(&mut pending, &mut out, field)?;
					out.push('\\');
					out.push(char::from(byte));
				} else {
					pending.push(byte);
				}
				i += 3;
				continue;
			}
		}

		flush_utf8(&mut pending, &mut out, field)?;
		match c {
			'\\' => out.push_str("\\\\"),
			'%' if chars.get(i + 1) == Some(&'%') => {
				out.push('%');
				i += 1;
			}
			_ => out.push(c),
		}
		i += 1;
	}
	flush_utf8(&mut pending, &mut out, field)?;

	Ok(out)
}

fn flush_utf8(pending: &mut Vec<u8>, out: &mut String, field: &str) -> Result<()> {
	if pending.is_empty() {
		return Ok(());
	}
	let text = String::from_utf8(std::mem::take(pending))
		.map_err(|_| MirrorError::InvalidIdentifier(format!("invalid UTF-8 escape in {}", field)))?;
	out.push_str(&text);
	Ok(())
}

fn hex_value(c: Option<&char>) -> Option<u32> {
	c.and_then(|c| c.to_digit(16))
}

/// Whether a colon after `backslashes` consecutive backslashes is escaped.
/// `\\` is one escaped backslash, so only an odd run escapes the colon.
fn escapes_colon(backslashes: usize) -> bool {
	backslashes % 2 == 1
}

fn split_unescaped_colons(s: &str) -> Vec<&str> {
	let mut parts = Vec::new();
	let mut start = 0;
	let mut backslashes = 0;

	for (i, c) in s.char_indices() {
		if c == ':' && !escapes_colon(backslashes) {
			parts.push(&s[start..i]);
			start = i + 1;
		}
		backslashes = if c == '\\' { backslashes + 1 } else { 0 };
	}
	parts.push(&s[start..]);

	parts
}

fn escape_colons(field: &str) -> String {
	let mut out = String::with_capacity(field.len());
	let mut backslashes = 0;

	for c in field.chars() {
		if c == ':' && !escapes_colon(backslashes) {
			out.push('\\');
		}
		out.push(c);
		backslashes = if c == '\\' { backslashes + 1 } else { 0 };
	}

	out
}
