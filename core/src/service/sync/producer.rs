//! Bus producer
//!
//! Thin role-aware wrapper over the transport: replicas publish to
//! ship-updates, the master to master-updates, heartbeats ride the replica
//! direction keyed by peer id. Connecting is lazy with exponential backoff;
//! the backoff sleep is cancellable so shutdown never waits it out.

use crate::config::TopicSet;
use crate::infra::bus::{BusError, BusTransport};
use crate::service::sync::message::{HeartbeatMessage, SyncMessage};
use crate::service::sync::metrics::SyncMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Backoff schedule for the initial connect
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const BACKOFF_MAX_ATTEMPTS: u32 = 10;

pub struct BusProducer {
	transport: Arc<dyn BusTransport>,
	topics: TopicSet,
	ship_id: String,
	metrics: Arc<SyncMetrics>,
}

impl BusProducer {
	pub fn new(
		transport: Arc<dyn BusTransport>,
		topics: TopicSet,
		ship_id: impl Into<String>,
		metrics: Arc<SyncMetrics>,
	) -> Self {
		Self {
			transport,
			topics,
			ship_id: ship_id.into(),
			metrics,
		}
	}

	pub fn transport(&self) -> &Arc<dyn BusTransport> {
		&self.transport
	}

	/// Last known connectivity, non-blocking.
	pub fn is_connected(&self) -> bool {
		self.transport.is_connected()
	}

	/// Connect with exponential backoff (2s, x1.5, capped at 30s, ten
	/// attempts). Returns false when the attempts are exhausted or shutdown
	/// fired; the caller decides whether to keep a slow background retry
	/// running.
	pub async fn connect_with_backoff(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
		let mut delay = BACKOFF_INITIAL;
		for attempt in 1..=BACKOFF_MAX_ATTEMPTS {
			match self.transport.connect().await {
				Ok(()) => {
					info!(attempt, transport = self.transport.transport_name(), "Bus connected");
					return true;
				}
				Err(e) => {
					warn!(
						attempt,
						max_attempts = BACKOFF_MAX_ATTEMPTS,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"Bus connect failed"
					);
				}
			}

			if attempt == BACKOFF_MAX_ATTEMPTS {
				break;
			}

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = shutdown.recv() => {
					debug!("Connect backoff interrupted by shutdown");
					return false;
				}
			}

			let next = delay.as_secs_f64() * BACKOFF_MULTIPLIER;
			delay = Duration::from_secs_f64(next.min(BACKOFF_CAP.as_secs_f64()));
		}
		false
	}

	/// Publish a master edit to every replica.
	pub async fn send_to_ships(&self, msg: &SyncMessage) -> Result<(), BusError> {
		self.publish(&self.topics.master_updates, &msg.content_id, msg)
			.await
	}

	/// Push a replica edit to the master.
	pub async fn send_to_master(&self, msg: &SyncMessage) -> Result<(), BusError> {
		self.publish(&self.topics.ship_updates, &msg.content_id, msg)
			.await
	}

	/// Publish the liveness heartbeat, keyed by peer id.
	pub async fn send_heartbeat(&self, queue_size: Option<u64>) -> Result<(), BusError> {
		let heartbeat = HeartbeatMessage::new(self.ship_id.clone(), queue_size);
		let payload = serde_json::to_vec(&heartbeat)?;
		self.transport
			.publish(&self.topics.ship_updates, &self.ship_id, &payload)
			.await
	}

	async fn publish(
		&self,
		topic: &str,
		key: &str,
		msg: &SyncMessage,
	) -> Result<(), BusError> {
		let payload = serde_json::to_vec(msg)?;
		self.transport.publish(topic, key, &payload).await?;
		self.metrics.messages_sent.increment();
		debug!(
			topic,
			message_id = %msg.message_id,
			operation = %msg.operation,
			"Sync message published"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cms::Operation;
	use crate::infra::bus::{BusSubscription, MemoryBus};
	use chrono::Utc;
	use serde_json::json;

	fn sample_message() -> SyncMessage {
		let now = Utc::now();
		SyncMessage {
			message_id: SyncMessage::compose_id("ship-aurora", now, "a1"),
			ship_id: "ship-aurora".to_string(),
			timestamp: now,
			operation: Operation::Create,
			content_type: "api::article.article".to_string(),
			content_id: "a1".to_string(),
			version: 1,
			data: Some(json!({"title": "x"})),
			locale: None,
			file_records: None,
		}
	}

	#[tokio::test]
	async fn messages_land_on_the_right_topic() {
		let bus = MemoryBus::new();
		bus.connect().await.unwrap();
		let producer = BusProducer::new(
			Arc::new(bus.clone()),
			TopicSet::default(),
			"ship-aurora",
			Arc::new(SyncMetrics::default()),
		);

		let mut ship_updates = bus.subscribe("ship-updates", "g").await.unwrap();
		producer.send_to_master(&sample_message()).await.unwrap();

		let delivered = ship_updates.recv().await.unwrap();
		assert_eq!(delivered.key.as_deref(), Some("a1"));
		let decoded: SyncMessage = serde_json::from_slice(&delivered.payload).unwrap();
		assert_eq!(decoded.content_id, "a1");
	}

	#[tokio::test]
	async fn heartbeats_are_keyed_by_peer() {
		let bus = MemoryBus::new();
		bus.connect().await.unwrap();
		let producer = BusProducer::new(
			Arc::new(bus.clone()),
			TopicSet::default(),
			"ship-aurora",
			Arc::new(SyncMetrics::default()),
		);

		let mut ship_updates = bus.subscribe("ship-updates", "g").await.unwrap();
		producer.send_heartbeat(Some(4)).await.unwrap();

		let delivered = ship_updates.recv().await.unwrap();
		assert_eq!(delivered.key.as_deref(), Some("ship-aurora"));
		let decoded: HeartbeatMessage = serde_json::from_slice(&delivered.payload).unwrap();
		assert_eq!(decoded.queue_size, Some(4));
	}

	#[tokio::test]
	async fn backoff_gives_up_against_a_dead_bus() {
		let bus = MemoryBus::new();
		bus.set_online(false);
		let producer = BusProducer::new(
			Arc::new(bus),
			TopicSet::default(),
			"ship-aurora",
			Arc::new(SyncMetrics::default()),
		);

		let (tx, mut rx) = broadcast::channel(1);
		// Shutdown immediately so the test does not sit out the backoff
		tx.send(()).unwrap();
		assert!(!producer.connect_with_backoff(&mut rx).await);
	}
}
