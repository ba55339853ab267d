//! Wire format
//!
//! The JSON envelope exchanged on the two topics, plus the heartbeat record
//! replicas publish for liveness. Envelopes are validated before anything
//! else touches them; the producer strips sensitive fields before building
//! one.

use crate::cms::{FileRecord, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The sync envelope (§ wire contract of the deployment).
///
/// `message_id` is globally unique, formed as
/// `<peerId>-<ms-timestamp>-<contentId>`. `version` is 0 and `data` is null
/// for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
	pub message_id: String,
	pub ship_id: String,
	pub timestamp: DateTime<Utc>,
	pub operation: Operation,
	pub content_type: String,
	pub content_id: String,
	pub version: i64,
	pub data: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub locale: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_records: Option<Vec<FileRecord>>,
}

impl SyncMessage {
	/// Compose the globally unique message id.
	pub fn compose_id(ship_id: &str, timestamp: DateTime<Utc>, content_id: &str) -> String {
		format!("{}-{}-{}", ship_id, timestamp.timestamp_millis(), content_id)
	}

	/// Structural checks beyond what serde enforces.
	pub fn validate(&self) -> Result<(), EnvelopeError> {
		if self.message_id.trim().is_empty() {
			return Err(EnvelopeError::MissingField("messageId"));
		}
		if self.ship_id.trim().is_empty() {
			return Err(EnvelopeError::MissingField("shipId"));
		}
		if self.content_type.trim().is_empty() {
			return Err(EnvelopeError::MissingField("contentType"));
		}
		if self.content_id.trim().is_empty() {
			return Err(EnvelopeError::MissingField("contentId"));
		}
		match self.operation {
			Operation::Delete => Ok(()),
			_ if self.data.is_none() => Err(EnvelopeError::MissingData(self.operation)),
			_ => Ok(()),
		}
	}
}

/// Small liveness record, published on the ship-updates topic keyed by the
/// peer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
	pub ship_id: String,
	pub timestamp: DateTime<Utc>,
	pub heartbeat: bool,
	/// Pending outbound entries on the replica, for shore-side dashboards
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub queue_size: Option<u64>,
}

impl HeartbeatMessage {
	pub fn new(ship_id: impl Into<String>, queue_size: Option<u64>) -> Self {
		Self {
			ship_id: ship_id.into(),
			timestamp: Utc::now(),
			heartbeat: true,
			queue_size,
		}
	}
}

/// Everything that can arrive on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusEnvelope {
	Sync(SyncMessage),
	Heartbeat(HeartbeatMessage),
}

impl BusEnvelope {
	pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
		serde_json::from_slice(payload).map_err(EnvelopeError::Malformed)
	}
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
	#[error("malformed envelope: {0}")]
	Malformed(#[from] serde_json::Error),

	#[error("envelope is missing required field {0}")]
	MissingField(&'static str),

	#[error("{0} message carries no data")]
	MissingData(Operation),
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn sample() -> SyncMessage {
		let now = Utc::now();
		SyncMessage {
			message_id: SyncMessage::compose_id("ship-aurora", now, "doc-1"),
			ship_id: "ship-aurora".to_string(),
			timestamp: now,
			operation: Operation::Update,
			content_type: "api::article.article".to_string(),
			content_id: "doc-1".to_string(),
			version: 4,
			data: Some(json!({"title": "t"})),
			locale: None,
			file_records: None,
		}
	}

	#[test]
	fn envelope_uses_camel_case_on_the_wire() {
		let value = serde_json::to_value(sample()).unwrap();
		assert!(value.get("messageId").is_some());
		assert!(value.get("shipId").is_some());
		assert!(value.get("contentType").is_some());
		assert_eq!(value["operation"], "update");
		// Optional fields are omitted entirely, not serialized as null
		assert!(value.get("locale").is_none());
		assert!(value.get("fileRecords").is_none());
	}

	#[test]
	fn validation_requires_data_except_for_deletes() {
		let mut msg = sample();
		msg.data = None;
		assert!(msg.validate().is_err());

		msg.operation = Operation::Delete;
		msg.version = 0;
		assert!(msg.validate().is_ok());
	}

	#[test]
	fn heartbeat_and_sync_decode_from_the_same_topic() {
		let sync_bytes = serde_json::to_vec(&sample()).unwrap();
		assert!(matches!(
			BusEnvelope::decode(&sync_bytes).unwrap(),
			BusEnvelope::Sync(_)
		));

		let hb = HeartbeatMessage::new("ship-aurora", Some(3));
		let hb_bytes = serde_json::to_vec(&hb).unwrap();
		assert!(matches!(
			BusEnvelope::decode(&hb_bytes).unwrap(),
			BusEnvelope::Heartbeat(_)
		));
	}

	#[test]
	fn message_id_embeds_peer_and_content() {
		let msg = sample();
		assert!(msg.message_id.starts_with("ship-aurora-"));
		assert!(msg.message_id.ends_with("-doc-1"));
	}
}
