use anyhow::Result;
use clap::Parser;
use futures::FutureExt;
use hawser_core::cms::MemoryContentStore;
use hawser_core::config::AppConfig;
use hawser_core::infra::bus::{BusTransport, KafkaBus};
use hawser_core::infra::db::Database;
use hawser_core::service::media::{MediaStores, S3ObjectStore, StoreLocation};
use hawser_core::service::sync::SyncService;
use hawser_core::service::Service;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hawser", about = "Offline-first CMS replication daemon")]
struct Args {
	/// Path to the hawser data directory
	#[arg(long, default_value = "./hawser-data")]
	data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	let config = AppConfig::load_from(&args.data_dir)?;

	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new(config.logging.main_filter.clone())),
		)
		.init();

	info!(
		mode = config.mode.as_str(),
		ship_id = %config.ship_id,
		data_dir = %args.data_dir.display(),
		"Starting hawser"
	);

	let db = Database::open(&config.db_path()).await?;
	db.migrate().await?;

	// The demo deployment runs against the in-memory content store; a real
	// deployment implements ContentStore against its CMS and registers the
	// interceptor the same way.
	let cms = MemoryContentStore::new(config.content_types.iter().cloned());

	let transport: Arc<dyn BusTransport> = Arc::new(KafkaBus::new(config.bus.clone()));

	let media_stores = match (
		config.media.enabled,
		&config.media.master_store,
		&config.media.local_store,
	) {
		(true, Some(master_cfg), Some(local_cfg)) => Some(MediaStores {
			master: Arc::new(S3ObjectStore::new(master_cfg)),
			master_location: StoreLocation::from_config(master_cfg),
			local: Arc::new(S3ObjectStore::new(local_cfg)),
			local_location: StoreLocation::from_config(local_cfg),
		}),
		_ => None,
	};

	let api_config = config.api.clone();
	let service = Arc::new(SyncService::new(
		config,
		&db,
		cms.clone(),
		transport,
		media_stores,
	)?);

	// Break the store -> interceptor cycle at the registry, not in the types
	cms.set_hook(service.ctx().interceptor.clone()).await;

	let metrics_ctx = service.ctx().clone();
	service
		.register_cleanup("log-final-metrics", move || {
			let ctx = metrics_ctx.clone();
			async move {
				let snapshot = ctx.metrics.snapshot();
				info!(?snapshot, "Final engine counters");
			}
			.boxed()
		})
		.await;

	service.start().await?;

	let mut api_shutdown = None;
	if api_config.enabled {
		let (tx, rx) = tokio::sync::broadcast::channel(1);
		let ctx = service.ctx().clone();
		let addr = api_config.listen_addr.clone();
		tokio::spawn(async move {
			if let Err(e) = hawser_core::service::api::serve(ctx, &addr, rx).await {
				error!(error = %e, "Management API failed");
			}
		});
		api_shutdown = Some(tx);
	}

	wait_for_signal().await;
	info!("Shutdown signal received");

	if let Some(tx) = api_shutdown {
		let _ = tx.send(());
	}
	service.stop().await?;

	info!("Bye");
	Ok(())
}

async fn wait_for_signal() {
	let ctrl_c = tokio::signal::ctrl_c();

	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {}
			_ = sigterm.recv() => {}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
