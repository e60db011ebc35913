// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::signal;
use tokio::task;
use tokio::time::{sleep, Duration};

use vulnerability_mirror_db::utils::logger;
use vulnerability_mirror_db::db::mirror;
use vulnerability_mirror_db::{CpeDb, CveDb, MirrorConfig, MirrorError};

#[derive(Parser)]
#[command(name = "vuln-mirror", version, about = "Local mirror of the NVD CVE feeds and CPE dictionary")]
struct Cli {
	/// JSON configuration file
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Download and load whatever changed upstream
	Update {
		/// Leave the CPE dictionary alone
		#[arg(long)]
		cve_only: bool,
	},
	/// Update now and then on every interval until Ctrl+C
	Watch,
	/// Print one CVE record
	Show { name: String },
	/// CVE records whose summary contains every word
	Search {
		#[arg(required = true)]
		words: Vec<String>,
	},
	/// Print every CVE record matched by the tokens: CVE names, CWE ids,
	/// CPE names, reference URLs, years, CVSS scores or summary words
	Query {
		#[arg(required = true)]
		tokens: Vec<String>,
	},
	/// Expand a CPE name with wildcards into dictionary entries
	Resolve {
		name: String,
		#[arg(long)]
		include_deprecated: bool,
	},
	/// Print the dictionary title of a CPE name
	Title { name: String },
}

struct App {
	config: MirrorConfig,
	cve_db: Arc<CveDb>,
	cpe_db: Arc<CpeDb>,
	shutdown_signal: tokio::sync::broadcast::Sender<()>,
}

impl App {
	async fn new(config: MirrorConfig) -> Result<Self> {
		info!("Opening vulnerability mirror in {}", config.data_dir.display());

		let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

		let opened = {
			let config = config.clone();
			task::spawn_blocking(move || -> Result<(CveDb, CpeDb)> {
				let cve_db = CveDb::open(&config).context("Failed to open CVE database")?;
				let cpe_db = CpeDb::open(&config).context("Failed to open CPE database")?;
				Ok((cve_db, cpe_db))
			})
			.await
			.context("Database open task panicked")??
		};

		Ok(App {
			config,
			cve_db: Arc::new(opened.0),
			cpe_db: Arc::new(opened.1),
			shutdown_signal: shutdown_tx,
		})
	}

	async fn update(&self, cve_only: bool) -> Result<()> {
		let cve_db = self.cve_db.clone();
		if cve_only {
			let report = task::spawn_blocking(move || cve_db.update())
				.await
				.context("CVE update task panicked")?
				.context("Failed to update CVE database")?;
			info!(
				"CVE database: {} files loaded, {} records processed",
				report.loaded(),
				report.records()
			);
			return Ok(());
		}

		let cpe_db = self.cpe_db.clone();
		let update = task::spawn_blocking(move || mirror::update_all(&cve_db, &cpe_db))
			.await
			.context("Update task panicked")?;
		update.log();
		update.cve.context("Failed to update CVE database")?;
		update.cpe.context("Failed to update CPE dictionary")?;
		Ok(())
	}

	async fn start_update_scheduler(&self) -> Result<()> {
		let cve_db = self.cve_db.clone();
		let cpe_db = self.cpe_db.clone();
		let interval = Duration::from_secs(self.config.update_interval_secs);
		let mut shutdown_rx = self.shutdown_signal.subscribe();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = sleep(interval) => {
						let cve_db = cve_db.clone();
						let cpe_db = cpe_db.clone();
						match task::spawn_blocking(move || mirror::update_all(&cve_db, &cpe_db)).await {
							Ok(update) => {
								update.log();
								if update.is_ok() {
									info!("Scheduled update completed");
								}
							}
							Err(e) => error!("Scheduled update task panicked: {}", e),
						}
					}
					_ = shutdown_rx.recv() => {
						info!("Update scheduler received shutdown signal");
						break;
					}
				}
			}
		});

		Ok(())
	}

	async fn watch(&self) -> Result<()> {
		if let Err(e) = self.update(false).await {
			error!("Initial update failed: {:#}", e);
		}
		self.start_update_scheduler().await?;

		let mut shutdown_rx = self.shutdown_signal.subscribe();

		let shutdown_signal = self.shutdown_signal.clone();
		tokio::spawn(async move {
			match signal::ctrl_c().await {
				Ok(()) => {
					info!("Received Ctrl+C signal");
					let _ = shutdown_signal.send(());
				}
				Err(err) => {
					error!("Failed to listen for ctrl-c signal: {}", err);
				}
			}
		});

		let _ = shutdown_rx.recv().await;
		info!("Received shutdown signal, closing application");
		self.cleanup().await;
		Ok(())
	}

	async fn show(&self, name: String) -> Result<()> {
		let cve_db = self.cve_db.clone();
		let cve = task::spawn_blocking(move || cve_db.get(&name))
			.await
			.context("Query task panicked")??;
		println!("{}", cve);
		Ok(())
	}

	async fn search(&self, words: Vec<String>) -> Result<()> {
		let cve_db = self.cve_db.clone();
		let names = task::spawn_blocking(move || {
			let words: Vec<&str> = words.iter().map(String::as_str).collect();
			cve_db.search(&words)
		})
		.await
		.context("Query task panicked")??;
		for name in names {
			println!("{}", name);
		}
		Ok(())
	}

	async fn query(&self, tokens: Vec<String>) -> Result<()> {
		let cve_db = self.cve_db.clone();
		let records = task::spawn_blocking(move || -> Result<Vec<String>> {
			let tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();
			let mut records = Vec::new();
			for name in cve_db.query(&tokens)? {
				match cve_db.get(&name) {
					Ok(cve) => records.push(cve.to_string()),
					Err(MirrorError::NotFound(_)) => warn!("{} is not in the database", name),
					Err(e) => return Err(e.into()),
				}
			}
			Ok(records)
		})
		.await
		.context("Query task panicked")??;
		println!("{}", records.join("\n\n----\n\n"));
		Ok(())
	}

	async fn resolve(&self, name: String, include_deprecated: bool) -> Result<()> {
		let cpe_db = self.cpe_db.clone();
		let names = task::spawn_blocking(move || cpe_db.resolve(&name, include_deprecated))
			.await
			.context("Query task panicked")??;
		for name in names {
			println!("{}", name);
		}
		Ok(())
	}

	async fn title(&self, name: String) -> Result<()> {
		let cpe_db = self.cpe_db.clone();
		let title = task::spawn_blocking(move || cpe_db.get_title(&name))
			.await
			.context("Query task panicked")??;
		println!("{}", title.unwrap_or_default());
		Ok(())
	}

	async fn cleanup(&self) {
		info!("Cleaning up resources and stopping background tasks...");
		let _ = self.shutdown_signal.send(());
		sleep(Duration::from_secs(1)).await;
		info!("Cleanup completed");
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logger::init();

	let config = MirrorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
	let app = App::new(config).await?;

	match cli.command {
		Command::Update { cve_only } => app.update(cve_only).await,
		Command::Watch => app.watch().await,
		Command::Show { name } => app.show(name).await,
		Command::Search { words } => app.search(words).await,
		Command::Query { tokens } => app.query(tokens).await,
		Command::Resolve { name, include_deprecated } => app.resolve(name, include_deprecated).await,
		Command::Title { name } => app.title(name).await,
	}
}
