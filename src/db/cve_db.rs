use chrono::{Datelike, Utc};
use log::info;
use rusqlite::Transaction;

use crate::config::{MirrorConfig, VENDOR_FEED_FILE};
use crate::db::schema;
use crate::db::store::{Store, UpdateReport};
use crate::error::Result;
use crate::models::cve::{Cve, CveName, QueryTerm, VendorStatementEntry};
use crate::repositories::cve_repo::{self, TableCounts};
use crate::utils::feed_sync::{FeedSynchronizer, FeedTransport, HttpTransport};

/// Local mirror of the NVD vulnerability feeds.
pub struct CveDb {
	store: Store,
	sync: FeedSynchronizer,
	cve_base_url: String,
	vendor_base_url: String,
	feed_files: Vec<String>,
}

impl CveDb {
	pub fn open(config: &MirrorConfig) -> Result<Self> {
		let transport = HttpTransport::new(&config.user_agent)?;
		Self::open_with(config, Box::new(transport))
	}

	/// Opens the store fetching feeds through `transport`. Nothing is
	/// downloaded until [`CveDb::update`] is called.
	pub fn open_with(config: &MirrorConfig, transport: Box<dyn FeedTransport>) -> Result<Self> {
		let store = Store::open(&config.cve_db_path(), config.pool_size, schema::create_cve_tables)?;
		if store.is_new() {
			info!("Created empty CVE database, run an update to populate it");
		}

		Ok(Self {
			store,
			sync: FeedSynchronizer::new(transport, config.work_dir()),
			cve_base_url: config.cve_base_url.clone(),
			vendor_base_url: config.vendor_base_url.clone(),
			feed_files: config.cve_feed_files(Utc::now().year()),
		})
	}

	pub fn is_new(&self) -> bool {
		self.store.is_new()
	}

	/// Brings every feed file up to date, oldest first, then the vendor
	/// statements. Each file is its own unit of work: an error stops the
	/// update but keeps the files already loaded.
	pub fn update(&self) -> Result<UpdateReport> {
		let mut report = UpdateReport::default();

		for filename in &self.feed_files {
			let outcome = self
				.store
				.load_feed(&self.sync, &self.cve_base_url, filename, |conn, cve: Cve| {
					cve_repo::upsert_cve(conn, &cve)
				})?;
			report.push(filename, outcome);
		}

		let outcome = self.store.load_feed(
			&self.sync,
			&self.vendor_base_url,
			VENDOR_FEED_FILE,
			|conn, entry: VendorStatementEntry| cve_repo::upsert_vendor_statement(conn, &entry),
		)?;
		report.push(VENDOR_FEED_FILE, outcome);

		info!(
			"Update finished: {} of {} files loaded, {} records processed",
			report.loaded(),
			report.files.len(),
			report.records()
		);
		Ok(report)
	}

	/// Runs several reads against one consistent snapshot.
	pub fn transaction<T, F>(&self, work: F) -> Result<T>
	where
		F: FnOnce(&Transaction<'_>) -> Result<T>,
	{
		self.store.transaction(work)
	}

	pub fn get(&self, name: &str) -> Result<Cve> {
		let name = CveName::parse(name)?;
		self.store.transaction(|tx| cve_repo::get_cve(tx, name))
	}

	pub fn by_year(&self, year: i32) -> Result<Vec<String>> {
		self.store.transaction(|tx| cve_repo::names_by_year(tx, year))
	}

	pub fn by_cwe(&self, cwe: &str) -> Result<Vec<String>> {
		self.store.transaction(|tx| cve_repo::names_by_cwe(tx, cwe))
	}

	/// Records linked to a product, given in either dialect.
	pub fn by_cpe(&self, cpe: &str) -> Result<Vec<String>> {
		self.store.transaction(|tx| cve_repo::names_by_cpe(tx, cpe))
	}

	pub fn by_reference(&self, url: &str) -> Result<Vec<String>> {
		self.store.transaction(|tx| cve_repo::names_by_reference(tx, url))
	}

	pub fn by_cvss_score(&self, score: f64) -> Result<Vec<String>> {
		self.store.transaction(|tx| cve_repo::names_by_cvss_score(tx, score))
	}

	pub fn search(&self, words: &[&str]) -> Result<Vec<String>> {
		self.store.transaction(|tx| cve_repo::search_summaries(tx, words))
	}

	/// Names matched by each token in turn, read as described on
	/// [`QueryTerm::classify`]. Results keep token order without repeats. A
	/// CVE name token is passed through whether or not it is stored.
	pub fn query(&self, tokens: &[&str]) -> Result<Vec<String>> {
		let terms = tokens
			.iter()
			.filter(|token| !token.trim().is_empty())
			.map(|token| QueryTerm::classify(token))
			.collect::<Result<Vec<_>>>()?;

		self.store.transaction(|tx| {
			let mut names: Vec<String> = Vec::new();
			for term in &terms {
				let found = match term {
					QueryTerm::Name(name) => vec![name.to_string()],
					QueryTerm::Cwe(cwe) => cve_repo::names_by_cwe(tx, cwe)?,
					QueryTerm::Product(cpe) => cve_repo::names_by_cpe(tx, cpe)?,
					QueryTerm::Reference(url) => cve_repo::names_by_reference(tx, url)?,
					QueryTerm::Year(year) => cve_repo::names_by_year(tx, *year)?,
					QueryTerm::Score(score) => cve_repo::names_by_cvss_score(tx, *score)?,
					QueryTerm::Words(words) => {
						let words: Vec<&str> = words.iter().map(String::as_str).collect();
						cve_repo::search_summaries(tx, &words)?
					}
				};
				for name in found {
					if !names.contains(&name) {
						names.push(name);
					}
				}
			}
			Ok(names)
		})
	}

	pub fn counts(&self) -> Result<TableCounts> {
		self.store.transaction(|tx| cve_repo::counts(tx))
	}
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::sync::Arc;

	use super::*;
	use crate::db::store::FileOutcome;
	use crate::error::MirrorError;
	use crate::utils::feed_sync::testing::MemoryTransport;

	const YEAR_FEED: &str = r#"<?xml version="1.0"?>
<nvd xmlns:vuln="http://scap.nist.gov/schema/vulnerability/0.4" xmlns:cvss="http://scap.nist.gov/schema/cvss-v2/0.2">
  <entry id="CVE-2014-0160">
    <vuln:vulnerable-software-list>
      <vuln:product>cpe:/a:openssl:openssl:1.0.1</vuln:product>
      <vuln:product>cpe:/a:openssl:openssl:1.0.1a</vuln:product>
    </vuln:vulnerable-software-list>
    <vuln:cvss><cvss:base_metrics><cvss:score>5.0</cvss:score></cvss:base_metrics></vuln:cvss>
    <vuln:cwe id="CWE-119"/>
    <vuln:references><vuln:reference href="http://heartbleed.com/">Heartbleed</vuln:reference></vuln:references>
    <vuln:summary>Heap memory over-read in the heartbeat extension.</vuln:summary>
  </entry>
  <entry id="CVE-2014-0224">
    <vuln:vulnerable-software-list>
      <vuln:product>cpe:/a:openssl:openssl:1.0.1</vuln:product>
    </vuln:vulnerable-software-list>
    <vuln:references><vuln:reference href="http://ccsinjection.lepidum.co.jp/">CCS</vuln:reference></vuln:references>
    <vuln:summary>ChangeCipherSpec heap overflow handling flaw.</vuln:summary>
  </entry>
</nvd>"#;

	const EMPTY_FEED: &str = r#"<?xml version="1.0"?><nvd/>"#;

	const REJECT_FEED: &str = r#"<?xml version="1.0"?>
<nvd xmlns:vuln="http://scap.nist.gov/schema/vulnerability/0.4">
  <entry id="CVE-2014-0224">
    <vuln:summary>** REJECT **  DO NOT USE THIS CANDIDATE NUMBER.</vuln:summary>
  </entry>
</nvd>"#;

	const VENDOR_FEED: &str = r#"<?xml version="1.0"?>
<statements>
  <statement cvename="CVE-2014-0160" contributor="Joe" organization="Acme">Fixed in 1.0.1g.</statement>
  <statement cvename="CVE-1999-0001" organization="Acme">Unknown record.</statement>
</statements>"#;

	fn config(dir: &tempfile::TempDir) -> MirrorConfig {
		MirrorConfig {
			data_dir: dir.path().to_path_buf(),
			first_year: Utc::now().year(),
			..MirrorConfig::default()
		}
	}

	fn serve_all(transport: &MemoryTransport, config: &MirrorConfig, year_feed: &str) {
		for (i, filename) in config.cve_feed_files(Utc::now().year()).iter().enumerate() {
			transport.serve(filename, if i == 0 { year_feed } else { EMPTY_FEED });
		}
		transport.serve(VENDOR_FEED_FILE, VENDOR_FEED);
	}

	#[test]
	fn test_update_loads_everything_once() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(Some("Mon, 07 Apr 2014 17:38:02 GMT")));
		serve_all(&transport, &config, YEAR_FEED);

		let db = CveDb::open_with(&config, Box::new(transport.clone())).unwrap();
		assert!(db.is_new());

		let report = db.update().unwrap();
		assert_eq!(report.loaded(), 4);

		let cve = db.get("CVE-2014-0160").unwrap();
		assert_eq!(cve.cvss.score, Some(5.0));
		assert_eq!(cve.cwe.as_deref(), Some("CWE-119"));
		assert_eq!(cve.products.len(), 2);
		assert_eq!(cve.references, vec!["http://heartbleed.com/"]);
		assert_eq!(cve.vendor_statements.len(), 1);
		assert_eq!(cve.vendor_statements[0].statement, "Fixed in 1.0.1g.");

		let counts = db.counts().unwrap();
		assert_eq!(counts.cves, 2);
		assert_eq!(counts.cpe_names, 2);
		assert_eq!(counts.cpe_links, 3);
		assert_eq!(counts.vendor_statements, 1);

		// Everything answers 304 now.
		let report = db.update().unwrap();
		assert_eq!(report.loaded(), 0);
		assert!(report.files.iter().all(|(_, outcome)| *outcome == FileOutcome::UpToDate));
		assert_eq!(db.counts().unwrap(), counts);

		// Downloads are gone once loaded.
		assert!(fs::read_dir(config.work_dir()).unwrap().next().is_none());
	}

	#[test]
	fn test_reloading_same_content_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(None));
		serve_all(&transport, &config, YEAR_FEED);

		let db = CveDb::open_with(&config, Box::new(transport.clone())).unwrap();
		db.update().unwrap();
		let before = db.counts().unwrap();

		let report = db.update().unwrap();
		assert_eq!(report.loaded(), 4);
		assert_eq!(db.counts().unwrap(), before);
	}

	#[test]
	fn test_rejected_record_is_removed() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(None));
		serve_all(&transport, &config, YEAR_FEED);

		let db = CveDb::open_with(&config, Box::new(transport.clone())).unwrap();
		db.update().unwrap();
		assert_eq!(db.by_cpe("cpe:/a:openssl:openssl:1.0.1").unwrap().len(), 2);

		transport.serve("nvdcve-2.0-modified.xml", REJECT_FEED);
		db.update().unwrap();

		assert!(matches!(db.get("CVE-2014-0224"), Err(MirrorError::NotFound(_))));
		assert_eq!(db.by_cpe("cpe:/a:openssl:openssl:1.0.1").unwrap(), vec!["CVE-2014-0160"]);
		assert!(db.by_reference("http://ccsinjection.lepidum.co.jp/").unwrap().is_empty());
		assert_eq!(db.counts().unwrap().cves, 1);
	}

	#[test]
	fn test_queries() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(None));
		serve_all(&transport, &config, YEAR_FEED);
		let db = CveDb::open_with(&config, Box::new(transport)).unwrap();
		db.update().unwrap();

		assert_eq!(db.by_year(2014).unwrap(), vec!["CVE-2014-0160", "CVE-2014-0224"]);
		assert_eq!(db.by_cwe("CWE-119").unwrap(), vec!["CVE-2014-0160"]);
		assert_eq!(db.by_cvss_score(5.0).unwrap(), vec!["CVE-2014-0160"]);
		assert_eq!(
			db.by_cpe("cpe:2.3:a:openssl:openssl:1.0.1a:*:*:*:*:*:*:*").unwrap(),
			vec!["CVE-2014-0160"]
		);
		assert_eq!(db.search(&["heap", "overflow"]).unwrap(), vec!["CVE-2014-0224"]);
		assert!(db.search(&[]).unwrap().is_empty());
		assert!(matches!(db.get("CVE-14-1"), Err(MirrorError::InvalidCveName(_))));
	}

	#[test]
	fn test_query_dispatches_each_token() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(None));
		serve_all(&transport, &config, YEAR_FEED);
		let db = CveDb::open_with(&config, Box::new(transport)).unwrap();
		db.update().unwrap();

		assert_eq!(db.query(&["CWE-119"]).unwrap(), vec!["CVE-2014-0160"]);
		assert_eq!(db.query(&["5.0"]).unwrap(), vec!["CVE-2014-0160"]);
		assert_eq!(db.query(&["http://ccsinjection.lepidum.co.jp/"]).unwrap(), vec!["CVE-2014-0224"]);
		assert_eq!(db.query(&["cpe:/a:openssl:openssl:1.0.1a"]).unwrap(), vec!["CVE-2014-0160"]);
		assert_eq!(db.query(&["ChangeCipherSpec"]).unwrap(), vec!["CVE-2014-0224"]);
		assert_eq!(db.query(&["CVE-2020-0001"]).unwrap(), vec!["CVE-2020-0001"]);

		// Results of several tokens are joined in order, each name once.
		assert_eq!(
			db.query(&["CWE-119", "2014", " "]).unwrap(),
			vec!["CVE-2014-0160", "CVE-2014-0224"]
		);
		assert!(db.query(&["1999"]).unwrap().is_empty());
		assert!(matches!(db.query(&["CVE-14-1"]), Err(MirrorError::InvalidCveName(_))));
	}

	#[test]
	fn test_failed_file_keeps_earlier_units() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(None));
		for filename in config.cve_feed_files(Utc::now().year()) {
			transport.serve(&filename, YEAR_FEED);
		}

		let db = CveDb::open_with(&config, Box::new(transport)).unwrap();
		let err = db.update().unwrap_err();
		assert!(matches!(err, MirrorError::TransportFailure { .. }));
		assert_eq!(db.counts().unwrap().cves, 2);
		assert_eq!(db.counts().unwrap().vendor_statements, 0);
	}

	#[test]
	fn test_local_feed_files_are_loaded() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let transport = Arc::new(MemoryTransport::new(Some("Mon, 07 Apr 2014 17:38:02 GMT")));
		serve_all(&transport, &config, EMPTY_FEED);

		fs::create_dir_all(config.work_dir()).unwrap();
		let first = &config.cve_feed_files(Utc::now().year())[0];
		fs::write(config.work_dir().join(first), YEAR_FEED).unwrap();

		let db = CveDb::open_with(&config, Box::new(transport.clone())).unwrap();
		db.update().unwrap();

		assert_eq!(db.counts().unwrap().cves, 2);
		let requested: Vec<String> = transport.requests.lock().unwrap().iter().map(|(url, _)| url.clone()).collect();
		assert!(!requested.iter().any(|url| url.ends_with(first.as_str())));
		assert!(!config.work_dir().join(first).exists());
	}

	#[test]
	fn test_nested_call_is_busy() {
		let dir = tempfile::tempdir().unwrap();
		let config = config(&dir);
		let db = CveDb::open_with(&config, Box::new(MemoryTransport::new(None))).unwrap();

		let inner = db.transaction(|_| Ok(db.by_year(2014))).unwrap();
		assert!(matches!(inner, Err(MirrorError::StoreBusy)));
		assert!(db.by_year(2014).unwrap().is_empty());
	}
}
