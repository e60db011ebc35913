use std::collections::BTreeSet;

use log::info;

use crate::config::{MirrorConfig, CPE_FEED_FILE};
use crate::db::schema;
use crate::db::store::{FileOutcome, Store};
use crate::error::Result;
use crate::models::cpe::CpeItem;
use crate::repositories::cpe_repo::{self, CpeQuery};
use crate::utils::feed_sync::{FeedSynchronizer, FeedTransport, HttpTransport};

/// Local copy of the official CPE dictionary.
pub struct CpeDb {
	store: Store,
	sync: FeedSynchronizer,
	base_url: String,
}

impl CpeDb {
	pub fn open(config: &MirrorConfig) -> Result<Self> {
		let transport = HttpTransport::new(&config.user_agent)?;
		Self::open_with(config, Box::new(transport))
	}

	pub fn open_with(config: &MirrorConfig, transport: Box<dyn FeedTransport>) -> Result<Self> {
		let store = Store::open(&config.cpe_db_path(), config.pool_size, schema::create_cpe_tables)?;
		if store.is_new() {
			info!("Created empty CPE database, run an update to populate it");
		}

		Ok(Self {
			store,
			sync: FeedSynchronizer::new(transport, config.work_dir()),
			base_url: config.cpe_base_url.clone(),
		})
	}

	pub fn is_new(&self) -> bool {
		self.store.is_new()
	}

	pub fn update(&self) -> Result<FileOutcome> {
		self.store
			.load_feed(&self.sync, &self.base_url, CPE_FEED_FILE, |conn, item: CpeItem| {
				cpe_repo::upsert_cpe_item(conn, &item)
			})
	}

	/// Every dictionary name matched by `name`, in the dialect of `name`.
	pub fn resolve(&self, name: &str, include_deprecated: bool) -> Result<BTreeSet<String>> {
		self.store.transaction(|tx| cpe_repo::resolve(tx, name, include_deprecated))
	}

	/// Title of the exact dictionary entry `name`; `NotFound` if there is none.
	pub fn get_title(&self, name: &str) -> Result<Option<String>> {
		self.store.transaction(|tx| cpe_repo::get_title(tx, name))
	}

	pub fn search(&self, query: &CpeQuery) -> Result<BTreeSet<String>> {
		self.store.transaction(|tx| cpe_repo::search(tx, query))
	}

	pub fn count(&self) -> Result<i64> {
		self.store.transaction(|tx| cpe_repo::count(tx))
	}
}
