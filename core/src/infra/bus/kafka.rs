//! Kafka-backed bus transport
//!
//! Producer and consumer are built from the same broker settings. Offsets
//! are committed manually on ack so an unacknowledged message is re-served
//! after a restart (at-least-once).

use super::{BusError, BusMessage, BusSubscription, BusTransport};
use crate::config::BusConfig;
use async_trait::async_trait;
use rdkafka::{
	config::ClientConfig,
	consumer::{CommitMode, Consumer, StreamConsumer},
	producer::{FutureProducer, FutureRecord, Producer},
	Message, Offset, TopicPartitionList,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Broker connect / metadata timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Health probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-publish delivery timeout
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KafkaBus {
	config: BusConfig,
	producer: RwLock<Option<FutureProducer>>,
	connected: Arc<AtomicBool>,
}

impl KafkaBus {
	pub fn new(config: BusConfig) -> Self {
		Self {
			config,
			producer: RwLock::new(None),
			connected: Arc::new(AtomicBool::new(false)),
		}
	}

	fn client_config(&self) -> ClientConfig {
		let mut cc = ClientConfig::new();
		cc.set("bootstrap.servers", self.config.brokers.join(","));
		if self.config.tls {
			cc.set(
				"security.protocol",
				if self.config.auth.is_some() {
					"sasl_ssl"
				} else {
					"ssl"
				},
			);
		} else if self.config.auth.is_some() {
			cc.set("security.protocol", "sasl_plaintext");
		}
		if let Some(auth) = &self.config.auth {
			cc.set("sasl.mechanism", "SCRAM-SHA-256");
			cc.set("sasl.username", &auth.username);
			cc.set("sasl.password", &auth.password);
		}
		cc
	}

	/// Blocking metadata fetch moved off the async workers.
	async fn fetch_metadata(&self, producer: FutureProducer, timeout: Duration) -> bool {
		let handle = tokio::task::spawn_blocking(move || {
			producer.client().fetch_metadata(None, timeout).is_ok()
		});
		matches!(handle.await, Ok(true))
	}
}

#[async_trait]
impl BusTransport for KafkaBus {
	fn transport_name(&self) -> &'static str {
		"kafka"
	}

	async fn connect(&self) -> Result<(), BusError> {
		let producer: FutureProducer = self
			.client_config()
			.set("message.timeout.ms", "30000")
			.create()
			.map_err(|e| BusError::Transport(e.to_string()))?;

		if !self.fetch_metadata(producer.clone(), CONNECT_TIMEOUT).await {
			self.connected.store(false, Ordering::SeqCst);
			return Err(BusError::Transport(
				"could not fetch broker metadata".to_string(),
			));
		}

		*self.producer.write().await = Some(producer);
		self.connected.store(true, Ordering::SeqCst);
		info!(brokers = %self.config.brokers.join(","), "Kafka producer connected");
		Ok(())
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	async fn probe(&self) -> bool {
		let producer = { self.producer.read().await.clone() };
		let up = match producer {
			Some(producer) => self.fetch_metadata(producer, PROBE_TIMEOUT).await,
			None => false,
		};
		let was_up = self.connected.swap(up, Ordering::SeqCst);
		if was_up != up {
			info!(online = up, "Kafka connectivity changed");
		}
		up
	}

	async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
		let producer = {
			let guard = self.producer.read().await;
			guard.clone().ok_or(BusError::Disconnected)?
		};

		let record = FutureRecord::to(topic).key(key).payload(payload);
		match producer.send(record, SEND_TIMEOUT).await {
			Ok((partition, offset)) => {
				debug!(topic, key, partition, offset, "Published record");
				Ok(())
			}
			Err((err, _)) => {
				warn!(topic, key, error = %err, "Publish failed");
				self.connected.store(false, Ordering::SeqCst);
				Err(BusError::Transport(err.to_string()))
			}
		}
	}

	async fn subscribe(
		&self,
		topic: &str,
		group: &str,
	) -> Result<Box<dyn BusSubscription>, BusError> {
		let consumer: StreamConsumer = self
			.client_config()
			.set("group.id", group)
			.set("enable.auto.commit", "false")
			.set("auto.offset.reset", "earliest")
			.set("session.timeout.ms", "60000")
			.create()
			.map_err(|e| BusError::Transport(e.to_string()))?;

		consumer
			.subscribe(&[topic])
			.map_err(|e| BusError::Transport(e.to_string()))?;

		info!(topic, group, "Kafka consumer subscribed");
		Ok(Box::new(KafkaSubscription { consumer }))
	}
}

struct KafkaSubscription {
	consumer: StreamConsumer,
}

#[async_trait]
impl BusSubscription for KafkaSubscription {
	async fn recv(&mut self) -> Result<BusMessage, BusError> {
		let message = self
			.consumer
			.recv()
			.await
			.map_err(|e| BusError::Transport(e.to_string()))?;

		Ok(BusMessage {
			topic: message.topic().to_string(),
			key: message
				.key()
				.map(|k| String::from_utf8_lossy(k).into_owned()),
			payload: message.payload().unwrap_or_default().to_vec(),
			partition: message.partition(),
			offset: message.offset(),
		})
	}

	async fn ack(&mut self, message: &BusMessage) -> Result<(), BusError> {
		let mut tpl = TopicPartitionList::new();
		tpl.add_partition_offset(
			&message.topic,
			message.partition,
			Offset::Offset(message.offset + 1),
		)
		.map_err(|e| BusError::Transport(e.to_string()))?;

		self.consumer
			.commit(&tpl, CommitMode::Async)
			.map_err(|e| BusError::Transport(e.to_string()))
	}
}
