use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;

use crate::error::{MirrorError, Result};

pub const HOME_ENV: &str = "VULN_MIRROR_HOME";

pub const CVE_DB_FILE: &str = "nvdcve-2.0.db";
pub const CPE_DB_FILE: &str = "official-cpe-dictionary_v2.3.db";
pub const CPE_FEED_FILE: &str = "official-cpe-dictionary_v2.3.xml";
pub const VENDOR_FEED_FILE: &str = "vendorstatements.xml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
	pub data_dir: PathBuf,
	/// Where feed files are downloaded to before loading. Defaults to
	/// `<data_dir>/feeds`.
	pub work_dir: Option<PathBuf>,
	pub cve_base_url: String,
	pub cpe_base_url: String,
	pub vendor_base_url: String,
	pub first_year: i32,
	pub pool_size: u32,
	pub update_interval_secs: u64,
	pub user_agent: String,
}

impl Default for MirrorConfig {
	fn default() -> Self {
		Self {
			data_dir: default_data_dir(),
			work_dir: None,
			cve_base_url: "https://static.nvd.nist.gov/feeds/xml/cve/".to_string(),
			cpe_base_url: "https://static.nvd.nist.gov/feeds/xml/cpe/dictionary/".to_string(),
			vendor_base_url: "https://nvd.nist.gov/download/".to_string(),
			first_year: 2002,
			pool_size: 4,
			update_interval_secs: 3600,
			user_agent: concat!("vuln-mirror/", env!("CARGO_PKG_VERSION")).to_string(),
		}
	}
}

fn default_data_dir() -> PathBuf {
	dirs::data_dir()
		.map(|dir| dir.join("vuln-mirror"))
		.unwrap_or_else(|| PathBuf::from("database"))
}

impl MirrorConfig {
	/// Defaults, overlaid with `path` if given, then with the environment.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let mut config = match path {
			Some(path) => {
				let text = fs::read_to_string(path).map_err(|e| MirrorError::io(path, e))?;
				let config: MirrorConfig = serde_json::from_str(&text)
					.map_err(|e| MirrorError::Config(format!("{}: {}", path.display(), e)))?;
				info!("Loaded configuration from {}", path.display());
				config
			}
			None => MirrorConfig::default(),
		};

		if let Some(home) = std::env::var_os(HOME_ENV) {
			config.data_dir = PathBuf::from(home);
		}

		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.pool_size == 0 {
			return Err(MirrorError::Config("pool_size must be at least 1".to_string()));
		}
		if self.update_interval_secs == 0 {
			return Err(MirrorError::Config("update_interval_secs must be positive".to_string()));
		}
		Ok(())
	}

	pub fn work_dir(&self) -> PathBuf {
		self.work_dir.clone().unwrap_or_else(|| self.data_dir.join("feeds"))
	}

	pub fn cve_db_path(&self) -> PathBuf {
		self.data_dir.join(CVE_DB_FILE)
	}

	pub fn cpe_db_path(&self) -> PathBuf {
		self.data_dir.join(CPE_DB_FILE)
	}

	/// CVE feed files in load order: one per year, then the rolling
	/// `modified` and `recent` feeds which carry the newest data.
	pub fn cve_feed_files(&self, current_year: i32) -> Vec<String> {
		let mut files: Vec<String> = (self.first_year..=current_year)
			.map(|year| format!("nvdcve-2.0-{}.xml", year))
			.collect();
		files.push("nvdcve-2.0-modified.xml".to_string());
		files.push("nvdcve-2.0-recent.xml".to_string());
		files
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_feed_file_order() {
		let config = MirrorConfig {
			first_year: 2002,
			..MirrorConfig::default()
		};
		let files = config.cve_feed_files(2004);
		assert_eq!(
			files,
			vec![
				"nvdcve-2.0-2002.xml",
				"nvdcve-2.0-2003.xml",
				"nvdcve-2.0-2004.xml",
				"nvdcve-2.0-modified.xml",
				"nvdcve-2.0-recent.xml",
			]
		);
	}

	#[test]
	fn test_partial_file_keeps_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mirror.json");
		fs::write(&path, r#"{ "data_dir": "/srv/mirror", "pool_size": 2 }"#).unwrap();

		let config = MirrorConfig::load(Some(&path)).unwrap();
		if std::env::var_os(HOME_ENV).is_none() {
			assert_eq!(config.data_dir, PathBuf::from("/srv/mirror"));
			assert_eq!(config.work_dir(), PathBuf::from("/srv/mirror/feeds"));
		}
		assert_eq!(config.pool_size, 2);
		assert_eq!(config.first_year, 2002);
		assert_eq!(config.vendor_base_url, "https://nvd.nist.gov/download/");
	}

	#[test]
	fn test_rejects_bad_values() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mirror.json");
		fs::write(&path, r#"{ "pool_size": 0 }"#).unwrap();
		assert!(matches!(MirrorConfig::load(Some(&path)), Err(MirrorError::Config(_))));

		fs::write(&path, "not json").unwrap();
		assert!(matches!(MirrorConfig::load(Some(&path)), Err(MirrorError::Config(_))));
	}
}
