//! Shared harness for sync integration tests
//!
//! Builds master and replica nodes over one in-memory bus, with in-memory
//! content stores and scratch sqlite databases, wired exactly like the
//! daemon wires a real deployment.

#![allow(dead_code)]

use hawser_core::cms::MemoryContentStore;
use hawser_core::config::{AppConfig, NodeMode, MASTER_PEER_ID};
use hawser_core::infra::bus::MemoryBus;
use hawser_core::infra::db::Database;
use hawser_core::service::media::MediaStores;
use hawser_core::service::sync::{SyncContext, SyncService};
use hawser_core::service::Service;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const ARTICLE: &str = "api::article.article";
pub const PAGE: &str = "api::page.page";

pub struct TestNode {
	pub service: Arc<SyncService>,
	pub cms: Arc<MemoryContentStore>,
	_temp: TempDir,
}

impl TestNode {
	pub fn ctx(&self) -> &Arc<SyncContext> {
		self.service.ctx()
	}

	pub async fn start(&self) {
		self.service.start().await.expect("service start");
	}

	pub async fn stop(&self) {
		self.service.stop().await.expect("service stop");
	}
}

pub fn init_test_tracing() {
	use tracing_subscriber::EnvFilter;
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("hawser_core=debug")),
		)
		.with_test_writer()
		.try_init();
}

fn test_config(mode: NodeMode, ship_id: &str, data_dir: std::path::PathBuf) -> AppConfig {
	let mut config = AppConfig::default_with_dir(data_dir);
	config.mode = mode;
	config.ship_id = ship_id.to_string();
	config.content_types = vec![ARTICLE.to_string(), PAGE.to_string()];

	// Tight intervals so scenarios settle in well under a second each
	config.sync.retry_delay_ms = 100;
	config.sync.connectivity_check_interval_ms = 50;
	config.sync.debounce_ms = 50;
	config.sync.auto_push_interval_ms = 300;
	config.sync.heartbeat_interval_ms = 200;
	config.sync.janitor_interval_ms = 60_000;
	config.sync.reconnect_stabilization_ms = 250;
	config
}

pub async fn build_node(
	bus: &MemoryBus,
	mode: NodeMode,
	ship_id: &str,
	media: Option<MediaStores>,
) -> TestNode {
	build_node_custom(bus, mode, ship_id, media, |_| {}).await
}

pub async fn build_node_custom(
	bus: &MemoryBus,
	mode: NodeMode,
	ship_id: &str,
	media: Option<MediaStores>,
	tweak: impl FnOnce(&mut AppConfig),
) -> TestNode {
	let temp = TempDir::new().expect("tempdir");
	let mut config = test_config(mode, ship_id, temp.path().to_path_buf());
	tweak(&mut config);

	let db = Database::open(&config.db_path()).await.expect("open db");
	db.migrate().await.expect("migrate");

	let cms = MemoryContentStore::new(config.content_types.iter().cloned());
	let service = Arc::new(
		SyncService::new(config, &db, cms.clone(), Arc::new(bus.clone()), media)
			.expect("build service"),
	);
	cms.set_hook(service.ctx().interceptor.clone()).await;

	TestNode {
		service,
		cms,
		_temp: temp,
	}
}

pub async fn master_node(bus: &MemoryBus) -> TestNode {
	build_node(bus, NodeMode::Master, MASTER_PEER_ID, None).await
}

pub async fn replica_node(bus: &MemoryBus, ship_id: &str) -> TestNode {
	build_node(bus, NodeMode::Replica, ship_id, None).await
}

/// Poll `cond` until it holds or `timeout_ms` elapses.
pub async fn wait_until<F, Fut>(what: &str, timeout_ms: u64, mut cond: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
	loop {
		if cond().await {
			return;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("timed out waiting for: {what}");
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}
