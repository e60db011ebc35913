// src/models/feed.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Freshness record for one feed file.
///
/// `last_modified` is comparable (seconds since the epoch); `last_modified_string`
/// is the header value sent back as `If-Modified-Since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
	pub filename: String,
	pub last_modified: i64,
	pub last_modified_string: String,
}

impl FileStamp {
	pub fn new(filename: &str, last_modified: i64, last_modified_string: String) -> Self {
		Self {
			filename: filename.to_string(),
			last_modified,
			last_modified_string,
		}
	}

	/// Stamp for a point in time we produced ourselves (file mtime or "now").
	pub fn at(filename: &str, time: DateTime<Utc>) -> Self {
		Self::new(filename, time.timestamp(), format_http_date(time))
	}

	/// Stamp from a server's `Last-Modified` header, falling back to `now`
	/// when the server sent none.
	pub fn from_header(filename: &str, header: Option<&str>, now: DateTime<Utc>) -> Self {
		match header {
			Some(value) => {
				let seconds = parse_http_date(value).map_or(now.timestamp(), |t| t.timestamp());
				Self::new(filename, seconds, value.to_string())
			}
			None => Self::at(filename, now),
		}
	}
}

pub fn format_http_date(time: DateTime<Utc>) -> String {
	time.format(HTTP_DATE_FORMAT).to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
	DateTime::parse_from_rfc2822(value.trim())
		.ok()
		.map(|t| t.with_timezone(&Utc))
}
