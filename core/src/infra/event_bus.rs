//! Dedicated event bus for sync coordination
//!
//! Engine components publish here so the scheduler, the management API and
//! tests can observe the engine without polling its tables. Events are
//! advisory; dropping one never loses data.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Engine-internal events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
	/// The outbound (or broadcast) queue gained or lost pending work
	QueueChanged { pending: u64 },

	/// A remote message was applied to the local CMS
	MessageApplied {
		content_type: String,
		content_id: String,
		operation: String,
	},

	/// A remote apply was parked as a conflict
	ConflictDetected {
		content_type: String,
		entity_id: String,
	},

	/// The connectivity monitor observed a transition
	ConnectivityChanged { online: bool },

	/// A peer session flipped online
	PeerOnline { peer_id: String },

	/// A peer session flipped offline
	PeerOffline { peer_id: String },

	/// A push pass finished
	PushCompleted { sent: usize, failed: usize },
}

impl SyncEvent {
	pub fn event_type(&self) -> &'static str {
		match self {
			SyncEvent::QueueChanged { .. } => "QueueChanged",
			SyncEvent::MessageApplied { .. } => "MessageApplied",
			SyncEvent::ConflictDetected { .. } => "ConflictDetected",
			SyncEvent::ConnectivityChanged { .. } => "ConnectivityChanged",
			SyncEvent::PeerOnline { .. } => "PeerOnline",
			SyncEvent::PeerOffline { .. } => "PeerOffline",
			SyncEvent::PushCompleted { .. } => "PushCompleted",
		}
	}
}

/// Broadcast bus carrying [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct SyncEventBus {
	sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(2_048);
		Self { sender }
	}

	/// Emit an event to all subscribers; returns how many received it.
	pub fn emit(&self, event: SyncEvent) -> usize {
		let event_type = event.event_type();
		match self.sender.send(event) {
			Ok(count) => count,
			Err(_) => {
				// No subscribers yet - normal during startup and shutdown
				debug!(event_type, "Sync event emitted with no subscribers");
				0
			}
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.sender.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for SyncEventBus {
	fn default() -> Self {
		Self::new()
	}
}
