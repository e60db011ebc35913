//! Keeps feed files current against their remote source.
//!
//! A file is fetched only when the server has something newer than the
//! freshness stamp recorded in the store. A file already sitting in the
//! working directory wins over the network when it is newer than the stamp.
//! All stamp writes happen on the caller's transaction, so a unit of work
//! that fails afterwards also forgets it ever saw the file.

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use reqwest::StatusCode;
use rusqlite::Connection;

use crate::error::{MirrorError, Result};
use crate::models::feed::FileStamp;
use crate::repositories::freshness_repo;
use crate::utils::xml_stream::{probe_document, FeedRecord, Records};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
	NotModified,
	Fetched { last_modified: Option<String> },
}

/// Conditional GET of one document into `dest`.
pub trait FeedTransport: Send + Sync {
	fn fetch(&self, url: &str, if_modified_since: Option<&str>, dest: &mut dyn Write) -> Result<FetchOutcome>;
}

pub struct HttpTransport {
	client: Client,
}

impl HttpTransport {
	pub fn new(user_agent: &str) -> Result<Self> {
		let mut headers = HeaderMap::new();
		let agent = HeaderValue::from_str(user_agent)
			.map_err(|e| MirrorError::Config(format!("invalid user agent {:?}: {}", user_agent, e)))?;
		headers.insert(USER_AGENT, agent);

		let client = Client::builder()
			.default_headers(headers)
			.build()
			.map_err(|e| MirrorError::Config(format!("failed to create HTTP client: {}", e)))?;

		Ok(Self { client })
	}
}

impl FeedTransport for HttpTransport {
	fn fetch(&self, url: &str, if_modified_since: Option<&str>, dest: &mut dyn Write) -> Result<FetchOutcome> {
		let mut request = self.client.get(url);
		if let Some(stamp) = if_modified_since {
			request = request.header(IF_MODIFIED_SINCE, stamp);
		}

		let mut response = request.send().map_err(|e| MirrorError::transport(url, e))?;

		if response.status() == StatusCode::NOT_MODIFIED {
			return Ok(FetchOutcome::NotModified);
		}
		if !response.status().is_success() {
			return Err(MirrorError::transport(url, format!("HTTP {}", response.status())));
		}

		let last_modified = response
			.headers()
			.get(LAST_MODIFIED)
			.and_then(|value| value.to_str().ok())
			.map(str::to_string);

		let bytes = response.copy_to(dest).map_err(|e| MirrorError::transport(url, e))?;
		debug!("Received {} bytes from {}", bytes, url);

		Ok(FetchOutcome::Fetched { last_modified })
	}
}

/// A feed document waiting in the working directory to be loaded.
#[derive(Debug)]
pub struct FeedFile {
	path: PathBuf,
}

impl FeedFile {
	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn records<T: FeedRecord>(&self) -> Result<Records<BufReader<File>, T>> {
		Records::from_path(&self.path)
	}

	/// Feeds every record to `sink`. The file is deleted once it has been
	/// read to the end, and also when it turns out to be malformed so the
	/// next run fetches it again. Other failures leave it in place.
	pub fn ingest<T, F>(self, mut sink: F) -> Result<usize>
	where
		T: FeedRecord,
		F: FnMut(T) -> Result<()>,
	{
		info!("Loading file: {}", self.path.display());

		let mut count = 0;
		let result = self.records::<T>().and_then(|records| {
			for record in records {
				sink(record?)?;
				count += 1;
			}
			Ok(())
		});

		match result {
			Ok(()) => {
				self.remove();
				Ok(count)
			}
			Err(e @ MirrorError::MalformedFeed { .. }) => {
				self.remove();
				Err(e)
			}
			Err(e) => Err(e),
		}
	}

	fn remove(&self) {
		match fs::remove_file(&self.path) {
			Ok(()) => info!("Deleted file: {}", self.path.display()),
			Err(e) => warn!("Could not delete {}: {}", self.path.display(), e),
		}
	}
}

pub struct FeedSynchronizer {
	transport: Box<dyn FeedTransport>,
	work_dir: PathBuf,
}

impl FeedSynchronizer {
	pub fn new(transport: Box<dyn FeedTransport>, work_dir: PathBuf) -> Self {
		Self { transport, work_dir }
	}

	pub fn work_dir(&self) -> &Path {
		&self.work_dir
	}

	/// Returns the file to load, or `None` when the store is already current.
	pub fn sync(&self, conn: &Connection, base_url: &str, filename: &str) -> Result<Option<FeedFile>> {
		fs::create_dir_all(&self.work_dir).map_err(|e| MirrorError::io(&self.work_dir, e))?;

		let stamp = freshness_repo::get_stamp(conn, filename)?;
		let path = self.work_dir.join(filename);

		if let Some(local_time) = local_copy_time(&path) {
			let newer = stamp.as_ref().map_or(true, |s| local_time.timestamp() > s.last_modified);
			if newer {
				info!("Found local file: {}", path.display());
				freshness_repo::set_stamp(conn, &FileStamp::at(filename, local_time))?;
				return Ok(Some(FeedFile { path }));
			}
		}

		let url = join_url(base_url, filename);
		let since = stamp.as_ref().map(|s| s.last_modified_string.as_str());
		let partial = self.work_dir.join(format!("{}.part", filename));

		let outcome = match self.download(&url, since, &partial) {
			Ok(outcome) => outcome,
			Err(e) => {
				let _ = fs::remove_file(&partial);
				return Err(e);
			}
		};

		match outcome {
			FetchOutcome::NotModified => {
				let _ = fs::remove_file(&partial);
				if stamp.is_none() {
					return Err(MirrorError::transport(&url, "not modified, but nothing was ever loaded"));
				}
				info!("Already up-to-date: {}", filename);
				Ok(None)
			}
			FetchOutcome::Fetched { last_modified } => {
				fs::rename(&partial, &path).map_err(|e| {
					let _ = fs::remove_file(&partial);
					MirrorError::io(&path, e)
				})?;
				let stamp = FileStamp::from_header(filename, last_modified.as_deref(), Utc::now());
				freshness_repo::set_stamp(conn, &stamp)?;
				Ok(Some(FeedFile { path }))
			}
		}
	}

	fn download(&self, url: &str, since: Option<&str>, partial: &Path) -> Result<FetchOutcome> {
		info!("Downloading from: {}", url);
		let mut file = File::create(partial).map_err(|e| MirrorError::io(partial, e))?;
		let outcome = self.transport.fetch(url, since, &mut file)?;
		file.flush().map_err(|e| MirrorError::io(partial, e))?;
		Ok(outcome)
	}
}

/// Modification time of a usable local copy. A copy that does not parse is
/// deleted and reported as absent.
fn local_copy_time(path: &Path) -> Option<DateTime<Utc>> {
	if !path.exists() {
		return None;
	}

	if let Err(e) = probe_document(path) {
		warn!("{}; deleting it", e);
		let _ = fs::remove_file(path);
		return None;
	}

	fs::metadata(path)
		.and_then(|meta| meta.modified())
		.map(DateTime::<Utc>::from)
		.ok()
}

fn join_url(base_url: &str, filename: &str) -> String {
	format!("{}/{}", base_url.trim_end_matches('/'), filename)
}


#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::testing::MemoryTransport;
	use super::*;
	use crate::db::schema;
	use crate::models::cve::Cve;

	const LAST_MODIFIED: &str = "Mon, 07 Apr 2014 17:38:02 GMT";
	const FEED: &str = r#"<nvd><entry id="CVE-2014-0160"><summary>leak</summary></entry></nvd>"#;

	fn setup() -> (tempfile::TempDir, Connection, Arc<MemoryTransport>, FeedSynchronizer) {
		let dir = tempfile::tempdir().unwrap();
		let conn = Connection::open_in_memory().unwrap();
		schema::create_cve_tables(&conn).unwrap();
		let transport = Arc::new(MemoryTransport::new(Some(LAST_MODIFIED)));
		let sync = FeedSynchronizer::new(Box::new(transport.clone()), dir.path().join("work"));
		(dir, conn, transport, sync)
	}

	#[test]
	fn test_fetch_then_not_modified() {
		let (_dir, conn, transport, sync) = setup();
		transport.serve("feed.xml", FEED);

		let file = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap().unwrap();
		let stamp = freshness_repo::get_stamp(&conn, "feed.xml").unwrap().unwrap();
		assert_eq!(stamp.last_modified, 1396892282);
		assert_eq!(stamp.last_modified_string, LAST_MODIFIED);
		assert!(!sync.work_dir().join("feed.xml.part").exists());

		let path = file.path().to_path_buf();
		let mut names = Vec::new();
		let count = file.ingest(|cve: Cve| {
			names.push(cve.name.to_string());
			Ok(())
		})
		.unwrap();
		assert_eq!(count, 1);
		assert_eq!(names, vec!["CVE-2014-0160"]);
		assert!(!path.exists());

		assert!(sync.sync(&conn, "http://feeds.test", "feed.xml").unwrap().is_none());

		let requests = transport.requests.lock().unwrap();
		assert_eq!(requests[0], ("http://feeds.test/feed.xml".to_string(), None));
		assert_eq!(requests[1].1.as_deref(), Some(LAST_MODIFIED));
	}

	#[test]
	fn test_transport_failure_keeps_stamp() {
		let (_dir, conn, _transport, sync) = setup();
		let old = FileStamp::new("feed.xml", 100, "Thu, 01 Jan 1970 00:01:40 GMT".to_string());
		freshness_repo::set_stamp(&conn, &old).unwrap();

		let err = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap_err();
		assert!(matches!(err, MirrorError::TransportFailure { .. }));
		assert_eq!(freshness_repo::get_stamp(&conn, "feed.xml").unwrap(), Some(old));
		assert!(!sync.work_dir().join("feed.xml.part").exists());
		assert!(!sync.work_dir().join("feed.xml").exists());
	}

	#[test]
	fn test_failure_mid_body_leaves_no_partial_file() {
		let (dir, conn, _transport, _sync) = setup();
		let old = FileStamp::new("feed.xml", 100, "Thu, 01 Jan 1970 00:01:40 GMT".to_string());
		freshness_repo::set_stamp(&conn, &old).unwrap();

		// Connection dropped after part of the body arrived.
		struct ResetAfterHead;
		impl FeedTransport for ResetAfterHead {
			fn fetch(&self, url: &str, _: Option<&str>, dest: &mut dyn Write) -> Result<FetchOutcome> {
				dest.write_all(&FEED.as_bytes()[..20]).unwrap();
				Err(MirrorError::transport(url, "connection reset"))
			}
		}
		let sync = FeedSynchronizer::new(Box::new(ResetAfterHead), dir.path().join("work"));

		let err = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap_err();
		assert!(matches!(err, MirrorError::TransportFailure { .. }));
		assert!(!sync.work_dir().join("feed.xml.part").exists());
		assert!(!sync.work_dir().join("feed.xml").exists());
		assert_eq!(freshness_repo::get_stamp(&conn, "feed.xml").unwrap(), Some(old));

		// The next run starts over with the old stamp.
		let err = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap_err();
		assert!(matches!(err, MirrorError::TransportFailure { .. }));
		assert!(!sync.work_dir().join("feed.xml").exists());
	}

	#[test]
	fn test_not_modified_without_stamp_is_an_error() {
		let (dir, conn, _transport, _sync) = setup();

		// Server answering 304 to an unconditional request.
		struct AlwaysNotModified;
		impl FeedTransport for AlwaysNotModified {
			fn fetch(&self, _: &str, _: Option<&str>, _: &mut dyn Write) -> Result<FetchOutcome> {
				Ok(FetchOutcome::NotModified)
			}
		}
		let sync = FeedSynchronizer::new(Box::new(AlwaysNotModified), dir.path().join("work"));
		assert!(matches!(
			sync.sync(&conn, "http://feeds.test/", "feed.xml"),
			Err(MirrorError::TransportFailure { .. })
		));
	}

	#[test]
	fn test_local_file_wins_over_network() {
		let (_dir, conn, transport, sync) = setup();
		fs::create_dir_all(sync.work_dir()).unwrap();
		fs::write(sync.work_dir().join("feed.xml"), FEED).unwrap();

		let file = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap();
		assert!(file.is_some());
		assert!(transport.requests.lock().unwrap().is_empty());
		assert!(freshness_repo::get_stamp(&conn, "feed.xml").unwrap().is_some());
	}

	#[test]
	fn test_malformed_local_file_is_replaced() {
		let (_dir, conn, transport, sync) = setup();
		transport.serve("feed.xml", FEED);
		fs::create_dir_all(sync.work_dir()).unwrap();
		fs::write(sync.work_dir().join("feed.xml"), "").unwrap();

		let file = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap().unwrap();
		assert_eq!(transport.requests.lock().unwrap().len(), 1);
		assert_eq!(fs::read_to_string(file.path()).unwrap(), FEED);
	}

	#[test]
	fn test_malformed_feed_is_deleted() {
		let (_dir, conn, transport, sync) = setup();
		transport.serve("feed.xml", r#"<nvd><entry id="CVE-2014-0160"><summary>cut"#);

		let file = sync.sync(&conn, "http://feeds.test/", "feed.xml").unwrap().unwrap();
		let path = file.path().to_path_buf();
		let err = file.ingest(|_: Cve| Ok(())).unwrap_err();
		assert!(matches!(err, MirrorError::MalformedFeed { .. }));
		assert!(!path.exists());
	}
}
