//! In-memory bus for tests and demos
//!
//! Topics are broadcast channels inside one process. The bus can be switched
//! offline to simulate a ship losing its uplink; publishes fail and probes
//! report down until it is switched back.

use super::{BusError, BusMessage, BusSubscription, BusTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

struct Topic {
	sender: broadcast::Sender<BusMessage>,
	next_offset: AtomicI64,
}

#[derive(Clone)]
pub struct MemoryBus {
	topics: Arc<Mutex<HashMap<String, Arc<Topic>>>>,
	online: Arc<AtomicBool>,
	connected: Arc<AtomicBool>,
}

impl MemoryBus {
	pub fn new() -> Self {
		Self {
			topics: Arc::new(Mutex::new(HashMap::new())),
			online: Arc::new(AtomicBool::new(true)),
			connected: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Simulate losing or regaining the uplink.
	pub fn set_online(&self, online: bool) {
		self.online.store(online, Ordering::SeqCst);
		if !online {
			self.connected.store(false, Ordering::SeqCst);
		}
	}

	async fn topic(&self, name: &str) -> Arc<Topic> {
		let mut topics = self.topics.lock().await;
		topics
			.entry(name.to_string())
			.or_insert_with(|| {
				let (sender, _) = broadcast::channel(4_096);
				Arc::new(Topic {
					sender,
					next_offset: AtomicI64::new(0),
				})
			})
			.clone()
	}
}

impl Default for MemoryBus {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl BusTransport for MemoryBus {
	fn transport_name(&self) -> &'static str {
		"memory"
	}

	async fn connect(&self) -> Result<(), BusError> {
		if self.online.load(Ordering::SeqCst) {
			self.connected.store(true, Ordering::SeqCst);
			Ok(())
		} else {
			Err(BusError::Disconnected)
		}
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	async fn probe(&self) -> bool {
		let up = self.online.load(Ordering::SeqCst);
		self.connected.store(up, Ordering::SeqCst);
		up
	}

	async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
		if !self.online.load(Ordering::SeqCst) {
			return Err(BusError::Disconnected);
		}

		let topic_handle = self.topic(topic).await;
		let offset = topic_handle.next_offset.fetch_add(1, Ordering::SeqCst);
		let message = BusMessage {
			topic: topic.to_string(),
			key: Some(key.to_string()),
			payload: payload.to_vec(),
			partition: 0,
			offset,
		};

		// No subscribers is fine; topic retention is not simulated.
		let _ = topic_handle.sender.send(message);
		debug!(topic, key, offset, "Published to memory bus");
		Ok(())
	}

	async fn subscribe(
		&self,
		topic: &str,
		_group: &str,
	) -> Result<Box<dyn BusSubscription>, BusError> {
		let topic_handle = self.topic(topic).await;
		Ok(Box::new(MemorySubscription {
			receiver: topic_handle.sender.subscribe(),
		}))
	}
}

struct MemorySubscription {
	receiver: broadcast::Receiver<BusMessage>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
	async fn recv(&mut self) -> Result<BusMessage, BusError> {
		loop {
			match self.receiver.recv().await {
				Ok(message) => return Ok(message),
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					tracing::warn!(skipped, "Memory bus subscription lagged");
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => {
					return Err(BusError::Disconnected);
				}
			}
		}
	}

	async fn ack(&mut self, _message: &BusMessage) -> Result<(), BusError> {
		Ok(())
	}
}
