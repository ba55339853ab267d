//! Node configuration
//!
//! A versioned `hawser.json` in the data directory, loaded at startup and
//! immutable for the process lifetime. The `mode` field decides whether this
//! node is the shore master or a ship replica.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Replication role of this node, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
	/// Authoritative shore instance.
	Master,
	/// Intermittently connected ship instance.
	Replica,
}

impl NodeMode {
	pub fn is_master(&self) -> bool {
		matches!(self, NodeMode::Master)
	}

	pub fn is_replica(&self) -> bool {
		matches!(self, NodeMode::Replica)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			NodeMode::Master => "master",
			NodeMode::Replica => "replica",
		}
	}
}

/// Peer id used by the master on the wire.
pub const MASTER_PEER_ID: &str = "master";

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
	/// Config schema version
	pub version: u32,

	/// master | replica
	pub mode: NodeMode,

	/// Stable peer identifier; `"master"` in master mode
	pub ship_id: String,

	/// Data directory (sqlite db, config, logs)
	pub data_dir: PathBuf,

	/// Logging configuration
	#[serde(default)]
	pub logging: LoggingConfig,

	/// Message bus configuration
	pub bus: BusConfig,

	/// Sync engine tunables
	#[serde(default)]
	pub sync: SyncConfig,

	/// Content-type allow-list; empty means all types participate
	#[serde(default)]
	pub content_types: Vec<String>,

	/// Media mirror configuration
	#[serde(default)]
	pub media: MediaConfig,

	/// Management HTTP surface
	#[serde(default)]
	pub api: ApiConfig,
}

/// RUST_LOG-style filters for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
	/// Main filter applied to stdout and `hawser.log`
	pub main_filter: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			main_filter: "hawser_core=info".to_string(),
		}
	}
}

/// Message bus connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
	/// Broker addresses, `host:port`
	pub brokers: Vec<String>,

	/// Consumer group id; defaults to `hawser-<ship_id>`
	#[serde(default)]
	pub group_id: Option<String>,

	/// Whether to negotiate TLS with the brokers
	#[serde(default)]
	pub tls: bool,

	/// Optional SASL credentials
	#[serde(default)]
	pub auth: Option<BusAuth>,

	/// Topic names
	#[serde(default)]
	pub topics: TopicSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusAuth {
	pub username: String,
	pub password: String,
}

/// The two logical topics of the deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSet {
	/// Produced by the master, consumed by every replica
	pub master_updates: String,
	/// Produced by replicas, consumed by the master
	pub ship_updates: String,
}

impl Default for TopicSet {
	fn default() -> Self {
		Self {
			master_updates: "master-updates".to_string(),
			ship_updates: "ship-updates".to_string(),
		}
	}
}

/// Conflict auto-merge strategy used by the manual resolution path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
	/// Field-wise union, local wins on overlap
	#[default]
	Shallow,
	/// Whole-payload pick by `updatedAt`
	LastWriterWins,
}

/// Sync engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Max queue entries drained per push
	pub batch_size: u64,

	/// Failed sends retried this many times before a row goes `failed`
	pub retry_attempts: i32,

	/// Delay between send retries (ms)
	pub retry_delay_ms: u64,

	/// Connectivity probe interval (ms)
	pub connectivity_check_interval_ms: u64,

	/// Quiet window before a triggered push runs (ms)
	pub debounce_ms: u64,

	/// Background queue drain interval (ms)
	pub auto_push_interval_ms: u64,

	/// Replica heartbeat interval (ms)
	pub heartbeat_interval_ms: u64,

	/// Master janitor interval (ms)
	pub janitor_interval_ms: u64,

	/// Wait after a reconnect before the first push (ms)
	pub reconnect_stabilization_ms: u64,

	/// Peer considered offline after this much silence (s)
	pub online_threshold_secs: i64,

	/// `sent` queue rows pruned after this many days
	pub queue_retention_days: i64,

	/// Processed-message ledger pruned after this many days
	pub dedup_retention_days: i64,

	/// Resolved dead letters pruned after this many days
	pub dead_letter_retention_days: i64,

	/// Strategy used when a conflict is resolved with `merge` and no
	/// explicit payload is supplied
	#[serde(default)]
	pub merge_strategy: MergeStrategy,

	/// Optional master health endpoint probed alongside the bus (replica)
	#[serde(default)]
	pub master_health_url: Option<String>,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			batch_size: 50,
			retry_attempts: 3,
			retry_delay_ms: 5_000,
			connectivity_check_interval_ms: 30_000,
			debounce_ms: 1_000,
			auto_push_interval_ms: 30_000,
			heartbeat_interval_ms: 60_000,
			janitor_interval_ms: 300_000,
			reconnect_stabilization_ms: 3_000,
			online_threshold_secs: 300,
			queue_retention_days: 7,
			dedup_retention_days: 7,
			dead_letter_retention_days: 30,
			merge_strategy: MergeStrategy::default(),
			master_health_url: None,
		}
	}
}

/// Media mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaConfig {
	/// Whether binary media is mirrored at all
	pub enabled: bool,

	/// Shore-side store (read-only from a replica's perspective)
	pub master_store: Option<MediaStoreConfig>,

	/// Ship-side store (read-write)
	pub local_store: Option<MediaStoreConfig>,

	/// Rewrite in-payload URLs between the two stores
	#[serde(default = "default_true")]
	pub transform_urls: bool,

	/// Cap on objects copied per message; 0 means unlimited
	#[serde(default)]
	pub max_files_per_sync: usize,

	/// Skip the bulk catch-up scan and only mirror on demand
	#[serde(default)]
	pub disable_full_sync: bool,
}

fn default_true() -> bool {
	true
}

/// One S3-compatible endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaStoreConfig {
	pub endpoint: String,
	pub access_key_id: String,
	pub secret_access_key: String,
	#[serde(default)]
	pub region: Option<String>,
	pub bucket: String,

	/// Public base URL as it appears inside content payloads
	pub base_url: String,

	/// Key prefix carried by this store's objects (e.g. `uploads`);
	/// empty or absent for flat buckets
	#[serde(default)]
	pub upload_path: Option<String>,
}

/// Management HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
	pub enabled: bool,
	pub listen_addr: String,
}

impl Default for ApiConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			listen_addr: "127.0.0.1:1590".to_string(),
		}
	}
}

impl AppConfig {
	const FILE_NAME: &'static str = "hawser.json";

	fn target_version() -> u32 {
		2
	}

	/// Load configuration from a data directory, creating a default file
	/// when none exists yet.
	pub fn load_from(data_dir: &PathBuf) -> Result<Self> {
		let config_path = data_dir.join(Self::FILE_NAME);

		if config_path.exists() {
			info!("Loading config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)?;
			let mut config: AppConfig = serde_json::from_str(&json)?;

			if config.data_dir != *data_dir {
				info!(
					"Updating config data_dir from {:?} to {:?}",
					config.data_dir, data_dir
				);
				config.data_dir = data_dir.clone();
				config.save()?;
			}

			if config.version < Self::target_version() {
				info!(
					"Migrating config from v{} to v{}",
					config.version,
					Self::target_version()
				);
				config.migrate()?;
				config.save()?;
			}

			config.validate()?;
			Ok(config)
		} else {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir.clone());
			config.save()?;
			Ok(config)
		}
	}

	/// Default replica configuration rooted at `data_dir`.
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			mode: NodeMode::Replica,
			ship_id: "ship-unnamed".to_string(),
			data_dir,
			logging: LoggingConfig::default(),
			bus: BusConfig {
				brokers: vec!["localhost:9092".to_string()],
				group_id: None,
				tls: false,
				auth: None,
				topics: TopicSet::default(),
			},
			sync: SyncConfig::default(),
			content_types: Vec::new(),
			media: MediaConfig::default(),
			api: ApiConfig::default(),
		}
	}

	/// Save configuration to disk
	pub fn save(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;

		let config_path = self.data_dir.join(Self::FILE_NAME);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	/// Reject configurations the engine cannot run with.
	pub fn validate(&self) -> Result<()> {
		if self.bus.brokers.is_empty() {
			bail!("bus.brokers must not be empty");
		}
		match self.mode {
			NodeMode::Master => {
				if self.ship_id != MASTER_PEER_ID {
					bail!("master mode requires ship_id = \"{MASTER_PEER_ID}\"");
				}
			}
			NodeMode::Replica => {
				if self.ship_id.trim().is_empty() || self.ship_id == MASTER_PEER_ID {
					bail!("replica mode requires a ship_id distinct from \"{MASTER_PEER_ID}\"");
				}
			}
		}
		if self.media.enabled {
			if self.media.master_store.is_none() || self.media.local_store.is_none() {
				bail!("media.enabled requires both master_store and local_store");
			}
		}
		if self.sync.batch_size == 0 {
			bail!("sync.batch_size must be at least 1");
		}
		Ok(())
	}

	/// Consumer group id for the bus consumer.
	pub fn consumer_group(&self) -> String {
		self.bus
			.group_id
			.clone()
			.unwrap_or_else(|| format!("hawser-{}", self.ship_id))
	}

	/// Topic this node consumes (the opposite direction's topic).
	pub fn consume_topic(&self) -> &str {
		match self.mode {
			NodeMode::Master => &self.bus.topics.ship_updates,
			NodeMode::Replica => &self.bus.topics.master_updates,
		}
	}

	/// Path of the sync database.
	pub fn db_path(&self) -> PathBuf {
		self.data_dir.join("sync.db")
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			1 => {
				// v1 -> v2: management API section added
				self.api = ApiConfig::default();
				self.version = 2;
				Ok(())
			}
			2 => Ok(()),
			v => Err(anyhow!("Unknown config version: {}", v)),
		}
	}
}
