//! Bus consumer
//!
//! One loop per consumed topic: the master drains ship-updates, replicas
//! drain master-updates. Per message: validate the envelope, consult the
//! processed-message ledger, apply with a per-message remote origin, then
//! record the id and acknowledge. Terminal failures go to the dead-letter
//! store and are still acknowledged; transient failures leave the message
//! unacknowledged so the bus re-delivers it.

use crate::cms::ChangeOrigin;
use crate::infra::bus::{BusMessage, BusTransport};
use crate::service::sync::apply::{ApplyEngine, ApplyOutcome};
use crate::service::sync::dead_letter::DeadLetterStore;
use crate::service::sync::dedup::MessageDeduplicator;
use crate::service::sync::liveness::{PeerLivenessTracker, SyncOutcome};
use crate::service::sync::message::{BusEnvelope, SyncMessage};
use crate::service::sync::metrics::SyncMetrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Pause before re-subscribing after a transport failure.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

pub struct BusConsumer {
	transport: Arc<dyn BusTransport>,
	topic: String,
	group: String,
	ship_id: String,
	engine: Arc<ApplyEngine>,
	dedup: Arc<MessageDeduplicator>,
	dead_letters: Arc<DeadLetterStore>,
	/// Present on the master, which tracks its ships
	liveness: Option<Arc<PeerLivenessTracker>>,
	metrics: Arc<SyncMetrics>,
}

impl BusConsumer {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		transport: Arc<dyn BusTransport>,
		topic: impl Into<String>,
		group: impl Into<String>,
		ship_id: impl Into<String>,
		engine: Arc<ApplyEngine>,
		dedup: Arc<MessageDeduplicator>,
		dead_letters: Arc<DeadLetterStore>,
		liveness: Option<Arc<PeerLivenessTracker>>,
		metrics: Arc<SyncMetrics>,
	) -> Self {
		Self {
			transport,
			topic: topic.into(),
			group: group.into(),
			ship_id: ship_id.into(),
			engine,
			dedup,
			dead_letters,
			liveness,
			metrics,
		}
	}

	/// Consume until shutdown. Subscription failures back off and retry;
	/// per-message failures never kill the loop.
	pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
		info!(topic = %self.topic, group = %self.group, "Consumer loop starting");

		loop {
			let mut subscription = match self.transport.subscribe(&self.topic, &self.group).await
			{
				Ok(subscription) => subscription,
				Err(e) => {
					warn!(topic = %self.topic, error = %e, "Subscribe failed, retrying");
					tokio::select! {
						_ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
						_ = shutdown.recv() => break,
					}
				}
			};

			loop {
				let message = tokio::select! {
					received = subscription.recv() => received,
					_ = shutdown.recv() => {
						info!(topic = %self.topic, "Consumer loop stopped");
						return;
					}
				};

				match message {
					Ok(message) => {
						if self.handle(&message).await {
							if let Err(e) = subscription.ack(&message).await {
								warn!(topic = %self.topic, error = %e, "Ack failed");
							}
						}
					}
					Err(e) => {
						warn!(topic = %self.topic, error = %e, "Receive failed, resubscribing");
						break;
					}
				}
			}

			tokio::select! {
				_ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
				_ = shutdown.recv() => break,
			}
		}

		info!(topic = %self.topic, "Consumer loop stopped");
	}

	/// Process one record; returns whether to acknowledge it.
	pub async fn handle(&self, message: &BusMessage) -> bool {
		let envelope = match BusEnvelope::decode(&message.payload) {
			Ok(envelope) => envelope,
			Err(e) => {
				// A payload that does not parse will never parse; quarantine
				// under a synthetic id derived from its bus position.
				let synthetic_id =
					format!("{}-{}-{}", message.topic, message.partition, message.offset);
				let payload = Value::String(String::from_utf8_lossy(&message.payload).into_owned());
				if let Err(store_err) = self
					.dead_letters
					.quarantine(&synthetic_id, payload, &e.to_string())
					.await
				{
					error!(error = %store_err, "Dead-letter store unavailable");
					return false;
				}
				self.metrics.dead_letters.increment();
				return true;
			}
		};

		match envelope {
			BusEnvelope::Heartbeat(heartbeat) => {
				debug!(peer = %heartbeat.ship_id, "Heartbeat");
				if let Some(liveness) = &self.liveness {
					let metadata = heartbeat
						.queue_size
						.map(|size| serde_json::json!({ "queueSize": size }));
					if let Err(e) = liveness.record_activity(&heartbeat.ship_id, metadata).await {
						warn!(peer = %heartbeat.ship_id, error = %e, "Liveness update failed");
					}
				}
				true
			}
			BusEnvelope::Sync(msg) => self.handle_sync(msg).await,
		}
	}

	async fn handle_sync(&self, msg: SyncMessage) -> bool {
		if let Err(e) = msg.validate() {
			warn!(message_id = %msg.message_id, error = %e, "Invalid envelope");
			let payload = serde_json::to_value(&msg).unwrap_or(Value::Null);
			if self
				.dead_letters
				.quarantine(&msg.message_id, payload, &e.to_string())
				.await
				.is_err()
			{
				return false;
			}
			self.metrics.dead_letters.increment();
			return true;
		}

		// An echo of our own edit must not re-enter the apply path.
		if msg.ship_id == self.ship_id {
			debug!(message_id = %msg.message_id, "Skipping own message");
			return true;
		}

		match self.dedup.seen(&msg.message_id).await {
			Ok(true) => {
				debug!(message_id = %msg.message_id, "Duplicate delivery dropped");
				self.metrics.duplicates_dropped.increment();
				return true;
			}
			Ok(false) => {}
			Err(e) => {
				error!(message_id = %msg.message_id, error = %e, "Ledger unavailable");
				return false;
			}
		}

		// The origin is scoped to this one apply; concurrent applies each
		// carry their own.
		let origin = ChangeOrigin::Remote {
			peer: msg.ship_id.clone(),
		};

		match self.engine.apply(&msg, &origin).await {
			Ok(outcome) => {
				let sync_outcome = match &outcome {
					ApplyOutcome::Applied => Some(SyncOutcome::Success),
					ApplyOutcome::ConflictRecorded { .. } => Some(SyncOutcome::Partial),
					ApplyOutcome::Dropped(reason) => {
						debug!(message_id = %msg.message_id, reason, "Message dropped");
						None
					}
					ApplyOutcome::Quarantine(reason) => {
						let payload = serde_json::to_value(&msg).unwrap_or(Value::Null);
						if self
							.dead_letters
							.quarantine(&msg.message_id, payload, reason)
							.await
							.is_err()
						{
							return false;
						}
						self.metrics.dead_letters.increment();
						None
					}
				};

				if let (Some(liveness), Some(outcome)) = (&self.liveness, sync_outcome) {
					if let Err(e) = liveness
						.update_sync_status(&msg.ship_id, outcome, Some(1))
						.await
					{
						warn!(peer = %msg.ship_id, error = %e, "Liveness update failed");
					}
				}

				if let Err(e) = self.dedup.record(&msg.message_id).await {
					// The apply went through; without a ledger row a
					// redelivery would re-apply. Leave unacknowledged and
					// let the idempotent apply path absorb the retry.
					error!(message_id = %msg.message_id, error = %e, "Ledger record failed");
					return false;
				}
				true
			}
			Err(e) => {
				// Transient: leave unacknowledged for redelivery.
				error!(message_id = %msg.message_id, error = %e, "Apply failed, will retry");
				false
			}
		}
	}
}
