//! Lifecycle interceptor
//!
//! Registered as the CMS document-middleware hook. Runs after the CMS
//! operation succeeded: filters by content type, resolves the document id,
//! skips bulk results and peer-originated writes, redacts sensitive fields,
//! then hands the change to the outbound queue (replica) or the producer /
//! broadcast queue (master).
//!
//! The hook must never break the underlying CMS operation: every failure of
//! its own logic is caught and logged at debug level.

use crate::cms::{DocumentEvent, DocumentHook, Operation};
use crate::config::{NodeMode, MASTER_PEER_ID};
use crate::infra::event_bus::{SyncEvent, SyncEventBus};
use crate::infra::payload::redact_sensitive;
use crate::service::sync::message::SyncMessage;
use crate::service::sync::producer::BusProducer;
use crate::service::sync::queue::{BroadcastQueue, NewQueueEntry, OutboundQueue};
use crate::service::sync::version::VersionTracker;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

pub struct DocumentInterceptor {
	mode: NodeMode,
	ship_id: String,
	/// Empty allow-list means every api content type participates
	allow_list: Vec<String>,
	versions: Arc<VersionTracker>,
	outbound: Arc<OutboundQueue>,
	broadcast: Arc<BroadcastQueue>,
	producer: Arc<BusProducer>,
	events: Arc<SyncEventBus>,
	/// Wakes the replica's debounced push worker
	push_trigger: Arc<Notify>,
}

impl DocumentInterceptor {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		mode: NodeMode,
		ship_id: impl Into<String>,
		allow_list: Vec<String>,
		versions: Arc<VersionTracker>,
		outbound: Arc<OutboundQueue>,
		broadcast: Arc<BroadcastQueue>,
		producer: Arc<BusProducer>,
		events: Arc<SyncEventBus>,
		push_trigger: Arc<Notify>,
	) -> Self {
		Self {
			mode,
			ship_id: ship_id.into(),
			allow_list,
			versions,
			outbound,
			broadcast,
			producer,
			events,
			push_trigger,
		}
	}

	fn content_type_included(&self, content_type: &str) -> bool {
		if content_type.starts_with("plugin::") || content_type.starts_with("admin::") {
			return false;
		}
		self.allow_list.is_empty() || self.allow_list.iter().any(|ct| ct == content_type)
	}

	/// Best-effort document id: deletes prefer the operation parameters,
	/// everything else prefers the returned entity.
	fn resolve_document_id(event: &DocumentEvent) -> Option<String> {
		let from_value = |value: &Value| {
			value
				.get("documentId")
				.or_else(|| value.get("id"))
				.and_then(|id| match id {
					Value::String(s) => Some(s.clone()),
					Value::Number(n) => Some(n.to_string()),
					_ => None,
				})
		};

		if let Some(id) = &event.document_id {
			return Some(id.clone());
		}
		match event.action {
			Operation::Delete => event
				.params
				.as_ref()
				.and_then(from_value)
				.or_else(|| event.entry.as_ref().and_then(from_value)),
			_ => event
				.entry
				.as_ref()
				.and_then(from_value)
				.or_else(|| event.params.as_ref().and_then(from_value)),
		}
	}

	/// Bulk and count-shaped results cannot be attributed to one document.
	fn is_bulk_result(event: &DocumentEvent) -> bool {
		let Some(entry) = &event.entry else {
			return false;
		};
		if entry.is_array() {
			return true;
		}
		entry.get("count").is_some() && event.action != Operation::Delete
	}

	async fn process(&self, event: &DocumentEvent) -> anyhow::Result<()> {
		if !self.content_type_included(&event.content_type) {
			return Ok(());
		}

		let Some(document_id) = Self::resolve_document_id(event) else {
			debug!(
				content_type = %event.content_type,
				action = %event.action,
				"No document id resolvable, skipping"
			);
			return Ok(());
		};

		if Self::is_bulk_result(event) {
			debug!(
				content_type = %event.content_type,
				"Bulk result, skipping"
			);
			return Ok(());
		}

		// A write applied on behalf of a peer must not be propagated again.
		// The origin is part of this one operation's context, so concurrent
		// applies and local edits cannot mask each other.
		if event.origin.is_remote() {
			debug!(
				content_type = %event.content_type,
				document_id = %document_id,
				"Peer-originated write, not propagating"
			);
			return Ok(());
		}

		let data = match event.action {
			Operation::Delete => None,
			_ => event.entry.as_ref().map(redact_sensitive),
		};

		match self.mode {
			NodeMode::Replica => {
				self.propagate_from_replica(event, &document_id, data).await
			}
			NodeMode::Master => self.propagate_from_master(event, &document_id, data).await,
		}
	}

	async fn propagate_from_replica(
		&self,
		event: &DocumentEvent,
		document_id: &str,
		data: Option<Value>,
	) -> anyhow::Result<()> {
		let local_version = match event.action {
			Operation::Delete => {
				self.versions.purge(&event.content_type, document_id).await?;
				0
			}
			_ => {
				self.versions
					.increment_version(&event.content_type, document_id, &self.ship_id)
					.await?
			}
		};

		self.outbound
			.enqueue(NewQueueEntry {
				ship_id: self.ship_id.clone(),
				content_type: event.content_type.clone(),
				content_id: document_id.to_string(),
				operation: event.action,
				local_version,
				data,
				locale: event.locale.clone(),
			})
			.await?;

		let pending = self.outbound.pending_count().await.unwrap_or(0);
		self.events.emit(SyncEvent::QueueChanged { pending });
		self.push_trigger.notify_one();
		Ok(())
	}

	async fn propagate_from_master(
		&self,
		event: &DocumentEvent,
		document_id: &str,
		data: Option<Value>,
	) -> anyhow::Result<()> {
		let version = match event.action {
			Operation::Delete => {
				self.versions.purge(&event.content_type, document_id).await?;
				0
			}
			_ => {
				self.versions
					.increment_version(&event.content_type, document_id, MASTER_PEER_ID)
					.await?
			}
		};

		info!(
			content_type = %event.content_type,
			document_id = %document_id,
			action = %event.action,
			version,
			"Master edit"
		);

		if self.producer.is_connected() {
			let now = Utc::now();
			let msg = SyncMessage {
				message_id: SyncMessage::compose_id(MASTER_PEER_ID, now, document_id),
				ship_id: MASTER_PEER_ID.to_string(),
				timestamp: now,
				operation: event.action,
				content_type: event.content_type.clone(),
				content_id: document_id.to_string(),
				version,
				data: data.clone(),
				locale: event.locale.clone(),
				file_records: None,
			};
			match self.producer.send_to_ships(&msg).await {
				Ok(()) => {
					if event.action != Operation::Delete {
						self.versions
							.mark_synced(&event.content_type, document_id, version, None)
							.await?;
					}
					return Ok(());
				}
				Err(e) => {
					debug!(error = %e, "Broadcast failed, buffering");
				}
			}
		}

		// Bus down: buffer the broadcast for the drainer
		self.broadcast
			.enqueue(NewQueueEntry {
				ship_id: MASTER_PEER_ID.to_string(),
				content_type: event.content_type.clone(),
				content_id: document_id.to_string(),
				operation: event.action,
				local_version: version,
				data,
				locale: event.locale.clone(),
			})
			.await?;

		let pending = self.broadcast.pending_count().await.unwrap_or(0);
		self.events.emit(SyncEvent::QueueChanged { pending });
		Ok(())
	}
}

#[async_trait]
impl DocumentHook for DocumentInterceptor {
	async fn after_document_change(&self, event: DocumentEvent) {
		// The CMS operation already succeeded; nothing that happens in here
		// may surface to the caller.
		if let Err(e) = self.process(&event).await {
			debug!(
				content_type = %event.content_type,
				action = %event.action,
				error = %e,
				"Sync hook failed"
			);
		}
	}
}
