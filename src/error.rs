// src/error.rs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Everything the mirror can fail with.
///
/// `NotModified` is not in here on purpose: an unchanged remote feed is a
/// normal outcome of synchronization and comes back as `Ok(None)`.
#[derive(Debug, Error)]
pub enum MirrorError {
	#[error("not a valid CPE name: {0}")]
	InvalidIdentifier(String),

	#[error("not a valid CVE name: {0}")]
	InvalidCveName(String),

	#[error("transport failure fetching {url}: {reason}")]
	TransportFailure { url: String, reason: String },

	#[error("the database is busy")]
	StoreBusy,

	#[error("not found: {0}")]
	NotFound(String),

	#[error("malformed local cache file {path}: {reason}")]
	MalformedLocalCache { path: String, reason: String },

	#[error("malformed feed {source_name}: {reason}")]
	MalformedFeed { source_name: String, reason: String },

	#[error("config error: {0}")]
	Config(String),

	#[error("io error: {path}: {source}")]
	Io {
		path: String,
		source: std::io::Error,
	},

	#[error(transparent)]
	Database(#[from] rusqlite::Error),

	#[error(transparent)]
	Pool(#[from] r2d2::Error),
}

impl MirrorError {
	pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
		MirrorError::Io {
			path: path.as_ref().display().to_string(),
			source,
		}
	}

	pub(crate) fn transport(url: &str, reason: impl ToString) -> Self {
		MirrorError::TransportFailure {
			url: url.to_string(),
			reason: reason.to_string(),
		}
	}
}
