//! Message-bus seam
//!
//! The engine talks to the bus through [`BusTransport`] so the production
//! Kafka client and the in-memory test bus are interchangeable. Delivery is
//! at-least-once: a subscription re-delivers anything not acknowledged, and
//! the consumer's processed-message ledger upgrades that to effectively-once.

use async_trait::async_trait;
use thiserror::Error;

pub mod kafka;
pub mod memory;

pub use kafka::KafkaBus;
pub use memory::MemoryBus;

/// Errors surfaced by a bus transport
#[derive(Debug, Error)]
pub enum BusError {
	#[error("bus is not connected")]
	Disconnected,

	#[error("bus operation timed out")]
	Timeout,

	#[error("transport error: {0}")]
	Transport(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// One delivered record
#[derive(Debug, Clone)]
pub struct BusMessage {
	pub topic: String,
	pub key: Option<String>,
	pub payload: Vec<u8>,
	pub partition: i32,
	pub offset: i64,
}

/// A topic consumer position; messages are re-delivered until acknowledged.
#[async_trait]
pub trait BusSubscription: Send {
	/// Await the next record. Errors are transport-level; the caller decides
	/// whether to retry or tear the subscription down.
	async fn recv(&mut self) -> Result<BusMessage, BusError>;

	/// Acknowledge a record as fully handled.
	async fn ack(&mut self, message: &BusMessage) -> Result<(), BusError>;
}

/// Pluggable bus client
#[async_trait]
pub trait BusTransport: Send + Sync {
	fn transport_name(&self) -> &'static str;

	/// Establish (or re-verify) broker connectivity. Bounded internally;
	/// callers wrap this in their own backoff.
	async fn connect(&self) -> Result<(), BusError>;

	/// Last known connectivity, non-blocking.
	fn is_connected(&self) -> bool;

	/// Active health probe with a bounded timeout. Updates the state
	/// reported by [`is_connected`](Self::is_connected).
	async fn probe(&self) -> bool;

	/// Publish one record.
	async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;

	/// Open a subscription on `topic` for `group`.
	async fn subscribe(
		&self,
		topic: &str,
		group: &str,
	) -> Result<Box<dyn BusSubscription>, BusError>;
}
