//! Sync service
//!
//! Wires the whole engine together for one node and runs its worker set:
//! the bus consumer loop, the timer family (connectivity probe, heartbeat,
//! auto-push, janitor), and the replica's debounced push worker. Everything
//! shares one shutdown broadcast; every sleep is cancellable, so stop()
//! never waits out an interval.

pub mod apply;
pub mod connectivity;
pub mod consumer;
pub mod dead_letter;
pub mod dedup;
pub mod interceptor;
pub mod liveness;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod version;

use crate::cms::{ContentStore, Operation};
use crate::config::{AppConfig, NodeMode};
use crate::infra::bus::BusTransport;
use crate::infra::db::Database;
use crate::infra::event_bus::{SyncEvent, SyncEventBus};
use crate::service::media::{MediaMirror, MediaStores};
use crate::service::Service;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

pub use apply::{ApplyEngine, ApplyOutcome, ConflictStore, Resolution};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use consumer::BusConsumer;
pub use dead_letter::DeadLetterStore;
pub use dedup::MessageDeduplicator;
pub use interceptor::DocumentInterceptor;
pub use liveness::{PeerLivenessTracker, SyncOutcome};
pub use message::{BusEnvelope, HeartbeatMessage, SyncMessage};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use producer::BusProducer;
pub use queue::{BroadcastQueue, NewQueueEntry, OutboundQueue, QueueStatus};
pub use version::{ConflictKind, SyncStatus, VersionTracker};

/// Background retry cadence once the initial connect backoff is exhausted.
const BACKGROUND_RETRY: Duration = Duration::from_secs(30);

/// Everything a worker or the management API needs a handle on.
pub struct SyncContext {
	pub config: AppConfig,
	pub db: Arc<DatabaseConnection>,
	pub cms: Arc<dyn ContentStore>,
	pub events: Arc<SyncEventBus>,
	pub metrics: Arc<SyncMetrics>,
	pub versions: Arc<VersionTracker>,
	pub outbound: Arc<OutboundQueue>,
	pub broadcast: Arc<BroadcastQueue>,
	pub dedup: Arc<MessageDeduplicator>,
	pub dead_letters: Arc<DeadLetterStore>,
	pub liveness: Arc<PeerLivenessTracker>,
	pub producer: Arc<BusProducer>,
	pub engine: Arc<ApplyEngine>,
	pub media: Option<Arc<MediaMirror>>,
	pub connectivity: Arc<ConnectivityMonitor>,
	pub interceptor: Arc<DocumentInterceptor>,
	push_trigger: Arc<Notify>,
	/// One push pass at a time; the debounce worker, the auto-push timer and
	/// the reconnect callback all funnel through here.
	push_lock: Mutex<()>,
}

impl SyncContext {
	/// Drain the replica's outbound queue in one batch. Returns
	/// (sent, failed).
	pub async fn push_pending(&self) -> (usize, usize) {
		let _guard = self.push_lock.lock().await;
		let batch = match self.outbound.get_pending(self.config.sync.batch_size).await {
			Ok(batch) => batch,
			Err(e) => {
				error!(error = %e, "Could not read outbound queue");
				return (0, 0);
			}
		};
		if batch.is_empty() {
			return (0, 0);
		}

		info!(entries = batch.len(), "Pushing pending changes");
		let mut sent = 0;
		let mut failed = 0;

		for entry in batch {
			let operation = match Operation::from_str(&entry.operation) {
				Ok(operation) => operation,
				Err(e) => {
					warn!(id = entry.id, error = %e, "Unparseable queue entry");
					let _ = self.outbound.mark_failed(entry.id, &e).await;
					failed += 1;
					continue;
				}
			};

			let mut data = entry.data.clone();
			let mut file_records = None;
			if let (Some(media), Some(payload)) = (&self.media, data.as_ref()) {
				let (rewritten, records) = media.prepare_for_push(payload).await;
				data = Some(rewritten);
				if !records.is_empty() {
					file_records = Some(records);
				}
			}

			let now = Utc::now();
			let msg = SyncMessage {
				message_id: SyncMessage::compose_id(&entry.ship_id, now, &entry.content_id),
				ship_id: entry.ship_id.clone(),
				timestamp: now,
				operation,
				content_type: entry.content_type.clone(),
				content_id: entry.content_id.clone(),
				version: entry.local_version,
				data,
				locale: entry.locale.clone(),
				file_records,
			};

			match self.producer.send_to_master(&msg).await {
				Ok(()) => {
					if let Err(e) = self.outbound.mark_synced(entry.id).await {
						warn!(id = entry.id, error = %e, "Could not mark entry sent");
					}
					if operation != Operation::Delete {
						let _ = self
							.versions
							.mark_synced(
								&entry.content_type,
								&entry.content_id,
								entry.local_version,
								None,
							)
							.await;
					}
					sent += 1;
				}
				Err(e) => {
					warn!(id = entry.id, error = %e, "Push failed");
					let _ = self.outbound.mark_failed(entry.id, &e.to_string()).await;
					self.metrics.push_failures.increment();
					failed += 1;
					if !self.producer.is_connected() {
						debug!("Bus went down mid-batch, stopping push pass");
						break;
					}
				}
			}
		}

		let pending = self.outbound.pending_count().await.unwrap_or(0);
		self.events.emit(SyncEvent::PushCompleted { sent, failed });
		self.events.emit(SyncEvent::QueueChanged { pending });
		(sent, failed)
	}

	/// Drain the master's buffered broadcasts, batch by batch, until the
	/// queue is empty or the bus drops again.
	pub async fn drain_broadcast_queue(&self) -> (usize, usize) {
		let _guard = self.push_lock.lock().await;
		let mut sent = 0;
		let mut failed = 0;

		loop {
			let batch = match self.broadcast.get_pending(self.config.sync.batch_size).await {
				Ok(batch) => batch,
				Err(e) => {
					error!(error = %e, "Could not read broadcast queue");
					break;
				}
			};
			if batch.is_empty() {
				break;
			}

			info!(entries = batch.len(), "Draining broadcast queue");
			for entry in batch {
				let operation = match Operation::from_str(&entry.operation) {
					Ok(operation) => operation,
					Err(e) => {
						let _ = self.broadcast.mark_failed(entry.id, &e).await;
						failed += 1;
						continue;
					}
				};

				let now = Utc::now();
				let msg = SyncMessage {
					message_id: SyncMessage::compose_id(&entry.ship_id, now, &entry.content_id),
					ship_id: entry.ship_id.clone(),
					timestamp: now,
					operation,
					content_type: entry.content_type.clone(),
					content_id: entry.content_id.clone(),
					version: entry.local_version,
					data: entry.data.clone(),
					locale: entry.locale.clone(),
					file_records: None,
				};

				match self.producer.send_to_ships(&msg).await {
					Ok(()) => {
						let _ = self.broadcast.mark_synced(entry.id).await;
						if operation != Operation::Delete {
							let _ = self
								.versions
								.mark_synced(
									&entry.content_type,
									&entry.content_id,
									entry.local_version,
									None,
								)
								.await;
						}
						sent += 1;
					}
					Err(e) => {
						warn!(id = entry.id, error = %e, "Broadcast drain failed");
						let _ = self.broadcast.mark_failed(entry.id, &e.to_string()).await;
						failed += 1;
						if !self.producer.is_connected() {
							return (sent, failed);
						}
					}
				}
			}
		}

		if sent > 0 || failed > 0 {
			let pending = self.broadcast.pending_count().await.unwrap_or(0);
			self.events.emit(SyncEvent::QueueChanged { pending });
		}
		(sent, failed)
	}

	/// One janitor pass: stale peers offline, ledgers and queues pruned.
	pub async fn run_janitor_pass(&self) {
		let sync = &self.config.sync;

		if self.config.mode.is_master() {
			if let Err(e) = self.liveness.mark_offline_peers().await {
				warn!(error = %e, "Offline-peer sweep failed");
			}
			if let Err(e) = self.broadcast.prune_sent(sync.queue_retention_days).await {
				warn!(error = %e, "Broadcast queue prune failed");
			}
		} else if let Err(e) = self.outbound.prune_sent(sync.queue_retention_days).await {
			warn!(error = %e, "Outbound queue prune failed");
		}

		if let Err(e) = self.dedup.prune(sync.dedup_retention_days).await {
			warn!(error = %e, "Ledger prune failed");
		}
		if let Err(e) = self.dead_letters.prune(sync.dead_letter_retention_days).await {
			warn!(error = %e, "Dead-letter prune failed");
		}
	}

	/// Snapshot for the status endpoint.
	pub async fn status(&self) -> StatusReport {
		let queue_size = match self.config.mode {
			NodeMode::Master => self.broadcast.pending_count().await.unwrap_or(0),
			NodeMode::Replica => self.outbound.pending_count().await.unwrap_or(0),
		};
		let pending_conflicts = self.engine.conflicts().pending_count().await.unwrap_or(0);
		let last_sync = self.versions.latest_sync_time().await.unwrap_or(None);

		let (peers, connectivity) = match self.config.mode {
			NodeMode::Master => {
				let peers = self
					.liveness
					.list()
					.await
					.unwrap_or_default()
					.into_iter()
					.map(|session| PeerStatus {
						peer_id: session.peer_id,
						is_online: session.is_online,
						last_seen_at: session.last_seen_at,
						last_sync_at: session.last_sync_at,
						last_sync_status: session.last_sync_status,
						total_syncs: session.total_syncs,
					})
					.collect();
				(Some(peers), None)
			}
			NodeMode::Replica => (None, Some(self.connectivity.state().await)),
		};

		StatusReport {
			mode: self.config.mode.as_str().to_string(),
			ship_id: self.config.ship_id.clone(),
			queue_size,
			last_sync,
			is_online: self.producer.is_connected(),
			pending_conflicts,
			peers,
			connectivity,
			metrics: self.metrics.snapshot(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
	pub peer_id: String,
	pub is_online: bool,
	pub last_seen_at: DateTime<Utc>,
	pub last_sync_at: Option<DateTime<Utc>>,
	pub last_sync_status: Option<String>,
	pub total_syncs: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
	pub mode: String,
	pub ship_id: String,
	pub queue_size: u64,
	pub last_sync: Option<DateTime<Utc>>,
	pub is_online: bool,
	pub pending_conflicts: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub peers: Option<Vec<PeerStatus>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub connectivity: Option<ConnectivityState>,
	pub metrics: MetricsSnapshot,
}

type Cleanup = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The node's sync engine as a startable service.
pub struct SyncService {
	ctx: Arc<SyncContext>,
	consumer: Arc<BusConsumer>,
	is_running: Arc<AtomicBool>,
	shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
	cleanups: Mutex<Vec<(&'static str, Cleanup)>>,
}

impl SyncService {
	/// Build the engine with explicit dependency edges. The caller still has
	/// to register `ctx().interceptor` as the CMS document hook - the store
	/// holds a handle to the interceptor, never the other way around.
	pub fn new(
		config: AppConfig,
		db: &Database,
		cms: Arc<dyn ContentStore>,
		transport: Arc<dyn BusTransport>,
		media_stores: Option<MediaStores>,
	) -> Result<Self> {
		config.validate()?;

		let conn = Arc::new(db.conn().clone());
		let events = Arc::new(SyncEventBus::new());
		let metrics = Arc::new(SyncMetrics::default());

		let media = media_stores.map(|stores| {
			Arc::new(MediaMirror::new(
				config.mode,
				stores.master,
				stores.master_location,
				stores.local,
				stores.local_location,
				cms.clone(),
				&config.media,
				metrics.clone(),
			))
		});

		let versions = Arc::new(VersionTracker::new(conn.clone()));
		let outbound = Arc::new(OutboundQueue::new(conn.clone(), config.sync.retry_attempts));
		let broadcast = Arc::new(BroadcastQueue::new(conn.clone(), config.sync.retry_attempts));
		let conflicts = Arc::new(ConflictStore::new(conn.clone()));
		let dedup = Arc::new(MessageDeduplicator::new(conn.clone()));
		let dead_letters = Arc::new(DeadLetterStore::new(conn.clone()));
		let liveness = Arc::new(PeerLivenessTracker::new(
			conn.clone(),
			events.clone(),
			config.sync.online_threshold_secs,
		));

		let producer = Arc::new(BusProducer::new(
			transport.clone(),
			config.bus.topics.clone(),
			config.ship_id.clone(),
			metrics.clone(),
		));

		let engine = Arc::new(ApplyEngine::new(
			cms.clone(),
			versions.clone(),
			conflicts,
			media.clone(),
			events.clone(),
			metrics.clone(),
			config.sync.merge_strategy,
		));

		let connectivity = Arc::new(ConnectivityMonitor::new(
			transport.clone(),
			config.sync.master_health_url.clone(),
			events.clone(),
		));

		let push_trigger = Arc::new(Notify::new());
		let interceptor = Arc::new(DocumentInterceptor::new(
			config.mode,
			config.ship_id.clone(),
			config.content_types.clone(),
			versions.clone(),
			outbound.clone(),
			broadcast.clone(),
			producer.clone(),
			events.clone(),
			push_trigger.clone(),
		));

		let consumer = Arc::new(BusConsumer::new(
			transport,
			config.consume_topic().to_string(),
			config.consumer_group(),
			config.ship_id.clone(),
			engine.clone(),
			dedup.clone(),
			dead_letters.clone(),
			config.mode.is_master().then(|| liveness.clone()),
			metrics.clone(),
		));

		let ctx = Arc::new(SyncContext {
			config,
			db: conn,
			cms,
			events,
			metrics,
			versions,
			outbound,
			broadcast,
			dedup,
			dead_letters,
			liveness,
			producer,
			engine,
			media,
			connectivity,
			interceptor,
			push_trigger,
			push_lock: Mutex::new(()),
		});

		Ok(Self {
			ctx,
			consumer,
			is_running: Arc::new(AtomicBool::new(false)),
			shutdown_tx: Mutex::new(None),
			cleanups: Mutex::new(Vec::new()),
		})
	}

	pub fn ctx(&self) -> &Arc<SyncContext> {
		&self.ctx
	}

	/// Register a cleanup run (in registration order) during stop().
	pub async fn register_cleanup<F>(&self, name: &'static str, cleanup: F)
	where
		F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
	{
		self.cleanups.lock().await.push((name, Box::new(cleanup)));
	}

	/// Initial connect with backoff, then a slow background retry loop that
	/// only shutdown terminates.
	async fn run_connect_chain(ctx: Arc<SyncContext>, mut rx: broadcast::Receiver<()>) {
		if ctx.producer.connect_with_backoff(&mut rx).await {
			return;
		}

		warn!("Initial bus connect exhausted its attempts, retrying in background");
		loop {
			tokio::select! {
				_ = tokio::time::sleep(BACKGROUND_RETRY) => {
					if ctx.producer.transport().connect().await.is_ok() {
						info!("Background retry connected the bus");
						return;
					}
				}
				_ = rx.recv() => return,
			}
		}
	}

	/// Replica: trailing-edge debounce between an edit and the push.
	async fn run_debounced_pusher(ctx: Arc<SyncContext>, mut shutdown: broadcast::Receiver<()>) {
		let debounce = Duration::from_millis(ctx.config.sync.debounce_ms);
		loop {
			tokio::select! {
				_ = ctx.push_trigger.notified() => {}
				_ = shutdown.recv() => return,
			}
			tokio::select! {
				_ = tokio::time::sleep(debounce) => {}
				_ = shutdown.recv() => return,
			}
			if ctx.producer.is_connected() {
				ctx.push_pending().await;
			}
		}
	}

	async fn run_auto_push(ctx: Arc<SyncContext>, mut shutdown: broadcast::Receiver<()>) {
		let interval = Duration::from_millis(ctx.config.sync.auto_push_interval_ms);
		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => {}
				_ = shutdown.recv() => return,
			}
			if !ctx.producer.is_connected() {
				continue;
			}
			match ctx.config.mode {
				NodeMode::Replica => {
					ctx.push_pending().await;
				}
				NodeMode::Master => {
					ctx.drain_broadcast_queue().await;
				}
			}
		}
	}

	async fn run_heartbeat(ctx: Arc<SyncContext>, mut shutdown: broadcast::Receiver<()>) {
		let interval = Duration::from_millis(ctx.config.sync.heartbeat_interval_ms);
		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => {}
				_ = shutdown.recv() => return,
			}
			if !ctx.producer.is_connected() {
				continue;
			}
			let queue_size = ctx.outbound.pending_count().await.ok();
			if let Err(e) = ctx.producer.send_heartbeat(queue_size).await {
				debug!(error = %e, "Heartbeat failed");
			}
		}
	}

	async fn run_janitor(ctx: Arc<SyncContext>, mut shutdown: broadcast::Receiver<()>) {
		let interval = Duration::from_millis(ctx.config.sync.janitor_interval_ms);
		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => {}
				_ = shutdown.recv() => return,
			}
			ctx.run_janitor_pass().await;
		}
	}
}

#[async_trait]
impl Service for SyncService {
	fn name(&self) -> &'static str {
		"sync_service"
	}

	fn is_running(&self) -> bool {
		self.is_running.load(Ordering::SeqCst)
	}

	async fn start(&self) -> Result<()> {
		if self.is_running.swap(true, Ordering::SeqCst) {
			warn!("Sync service already running");
			return Ok(());
		}

		let ctx = self.ctx.clone();
		info!(
			mode = ctx.config.mode.as_str(),
			ship_id = %ctx.config.ship_id,
			"Starting sync service"
		);

		if let Some(media) = &ctx.media {
			if let Err(e) = media.ensure_local_bucket().await {
				warn!(error = %e, "Could not ensure local media bucket");
			}
		}

		let (shutdown_tx, _) = broadcast::channel(8);
		*self.shutdown_tx.lock().await = Some(shutdown_tx.clone());

		// Producer connect chain
		tokio::spawn(Self::run_connect_chain(ctx.clone(), shutdown_tx.subscribe()));

		// Consumer loop for the opposite direction's topic
		tokio::spawn(self.consumer.clone().run(shutdown_tx.subscribe()));

		// Connectivity probe; the producer's is_connected feeds off it
		tokio::spawn(ctx.connectivity.clone().run(
			Duration::from_millis(ctx.config.sync.connectivity_check_interval_ms),
			shutdown_tx.subscribe(),
		));

		if ctx.config.mode.is_replica() {
			// Reconnect: wait out the stabilization window so in-flight
			// master broadcasts drain first, re-verify, then push.
			let reconnect_ctx = ctx.clone();
			ctx.connectivity
				.on_reconnect(move || {
					let ctx = reconnect_ctx.clone();
					Box::pin(async move {
						let wait =
							Duration::from_millis(ctx.config.sync.reconnect_stabilization_ms);
						info!(wait_ms = wait.as_millis() as u64, "Reconnected, stabilizing");
						tokio::time::sleep(wait).await;
						if ctx.producer.transport().probe().await {
							ctx.push_pending().await;
						} else {
							debug!("Connectivity flapped during stabilization");
						}
					})
				})
				.await;

			tokio::spawn(Self::run_debounced_pusher(
				ctx.clone(),
				shutdown_tx.subscribe(),
			));
			tokio::spawn(Self::run_heartbeat(ctx.clone(), shutdown_tx.subscribe()));
		}

		tokio::spawn(Self::run_auto_push(ctx.clone(), shutdown_tx.subscribe()));
		tokio::spawn(Self::run_janitor(ctx.clone(), shutdown_tx.subscribe()));

		info!("Sync service started");
		Ok(())
	}

	async fn stop(&self) -> Result<()> {
		if !self.is_running.load(Ordering::SeqCst) {
			return Ok(());
		}

		info!("Stopping sync service");

		if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
			let _ = shutdown_tx.send(());
		}

		// Registered cleanups run in registration order
		let cleanups = self.cleanups.lock().await;
		for (name, cleanup) in cleanups.iter() {
			debug!(cleanup = %name, "Running cleanup");
			cleanup().await;
		}

		self.is_running.store(false, Ordering::SeqCst);
		info!("Sync service stopped");
		Ok(())
	}
}
