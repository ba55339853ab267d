//! Apply path and conflict resolution
//!
//! Takes a validated envelope and mutates the local CMS to reflect it. A
//! remote change against a diverged local copy is parked in the conflict
//! log instead of being applied - nothing is overwritten silently. Manual
//! resolution writes the chosen payload back through the CMS with a local
//! origin, so the resolution propagates like any other edit.

use crate::cms::{ChangeOrigin, CmsError, ContentStore, Operation, WriteContext};
use crate::config::MergeStrategy;
use crate::infra::db::entities::conflict_log;
use crate::infra::event_bus::{SyncEvent, SyncEventBus};
use crate::infra::payload::RESERVED_FIELDS;
use crate::service::media::MediaMirror;
use crate::service::sync::message::SyncMessage;
use crate::service::sync::metrics::SyncMetrics;
use crate::service::sync::version::{detect_conflict, ConflictKind, VersionTracker};
use chrono::{DateTime, Utc};
use sea_orm::{
	ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
	QueryFilter, QueryOrder, Set,
};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Terminal outcome of applying one message. Transient infrastructure
/// failures are errors instead, so the consumer can leave the message
/// unacknowledged for redelivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
	Applied,
	ConflictRecorded { fields: Vec<String> },
	/// Harmless to skip; logged and acknowledged
	Dropped(String),
	/// Will never succeed; belongs in the dead-letter store
	Quarantine(String),
}

#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("version tracking failed: {0}")]
	Version(#[from] crate::service::sync::version::VersionError),

	#[error("conflict log failed: {0}")]
	Conflict(#[from] ConflictStoreError),

	#[error("content store failed: {0}")]
	Cms(CmsError),
}

/// Conflict lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStatus {
	Pending,
	Resolved,
}

impl ConflictStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConflictStatus::Pending => "pending",
			ConflictStatus::Resolved => "resolved",
		}
	}
}

/// Manual resolution choice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
	KeepLocal,
	KeepRemote,
	Merge,
}

impl Resolution {
	pub fn as_str(&self) -> &'static str {
		match self {
			Resolution::KeepLocal => "keep_local",
			Resolution::KeepRemote => "keep_remote",
			Resolution::Merge => "merge",
		}
	}
}

impl FromStr for Resolution {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"keep_local" => Ok(Resolution::KeepLocal),
			"keep_remote" => Ok(Resolution::KeepRemote),
			"merge" => Ok(Resolution::Merge),
			other => Err(format!("unknown resolution: {other}")),
		}
	}
}

#[derive(Debug, Error)]
pub enum ConflictStoreError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),

	#[error("conflict {0} not found")]
	NotFound(i32),

	#[error("conflict {0} is already resolved")]
	AlreadyResolved(i32),
}

/// Persisted conflict rows
pub struct ConflictStore {
	db: Arc<DatabaseConnection>,
}

impl ConflictStore {
	pub fn new(db: Arc<DatabaseConnection>) -> Self {
		Self { db }
	}

	/// Record a conflict. An existing pending row for the same entity is
	/// overwritten in place so the log always shows the latest divergence.
	pub async fn upsert_pending(
		&self,
		content_type: &str,
		entity_id: &str,
		local_data: Value,
		remote_data: Value,
		fields: &[String],
		kind: ConflictKind,
	) -> Result<conflict_log::Model, ConflictStoreError> {
		let fields_json = Value::from(fields.to_vec());
		let existing = conflict_log::Entity::find()
			.filter(conflict_log::Column::ContentType.eq(content_type))
			.filter(conflict_log::Column::EntityId.eq(entity_id))
			.filter(conflict_log::Column::Status.eq(ConflictStatus::Pending.as_str()))
			.one(self.db.as_ref())
			.await?;

		let row = match existing {
			Some(row) => {
				let mut active: conflict_log::ActiveModel = row.into();
				active.local_data = Set(local_data);
				active.remote_data = Set(remote_data);
				active.conflicting_fields = Set(fields_json);
				active.conflict_type = Set(kind.as_str().to_string());
				active.update(self.db.as_ref()).await?
			}
			None => {
				conflict_log::ActiveModel {
					content_type: Set(content_type.to_string()),
					entity_id: Set(entity_id.to_string()),
					local_data: Set(local_data),
					remote_data: Set(remote_data),
					conflicting_fields: Set(fields_json),
					conflict_type: Set(kind.as_str().to_string()),
					status: Set(ConflictStatus::Pending.as_str().to_string()),
					resolution: Set(None),
					merged_data: Set(None),
					created_at: Set(Utc::now()),
					resolved_at: Set(None),
					resolved_by: Set(None),
					..Default::default()
				}
				.insert(self.db.as_ref())
				.await?
			}
		};
		Ok(row)
	}

	pub async fn get(&self, id: i32) -> Result<conflict_log::Model, ConflictStoreError> {
		conflict_log::Entity::find_by_id(id)
			.one(self.db.as_ref())
			.await?
			.ok_or(ConflictStoreError::NotFound(id))
	}

	pub async fn list_pending(&self) -> Result<Vec<conflict_log::Model>, ConflictStoreError> {
		Ok(conflict_log::Entity::find()
			.filter(conflict_log::Column::Status.eq(ConflictStatus::Pending.as_str()))
			.order_by_asc(conflict_log::Column::Id)
			.all(self.db.as_ref())
			.await?)
	}

	pub async fn pending_count(&self) -> Result<u64, ConflictStoreError> {
		Ok(conflict_log::Entity::find()
			.filter(conflict_log::Column::Status.eq(ConflictStatus::Pending.as_str()))
			.count(self.db.as_ref())
			.await?)
	}

	pub async fn mark_resolved(
		&self,
		id: i32,
		resolution: Resolution,
		merged_data: Option<Value>,
		resolved_by: Option<&str>,
	) -> Result<conflict_log::Model, ConflictStoreError> {
		let row = self.get(id).await?;
		if row.status == ConflictStatus::Resolved.as_str() {
			return Err(ConflictStoreError::AlreadyResolved(id));
		}
		let mut active: conflict_log::ActiveModel = row.into();
		active.status = Set(ConflictStatus::Resolved.as_str().to_string());
		active.resolution = Set(Some(resolution.as_str().to_string()));
		active.merged_data = Set(merged_data);
		active.resolved_at = Set(Some(Utc::now()));
		active.resolved_by = Set(resolved_by.map(str::to_string));
		Ok(active.update(self.db.as_ref()).await?)
	}
}

/// Shallow field-wise combination: `local` is the base and any field absent
/// there is filled from `remote`, skipping the reserved metadata set.
pub fn shallow_merge(local: &Value, remote: &Value) -> Value {
	let (Some(local_map), Some(remote_map)) = (local.as_object(), remote.as_object()) else {
		return local.clone();
	};
	let mut merged = local_map.clone();
	for (key, value) in remote_map {
		if RESERVED_FIELDS.contains(&key.as_str()) {
			continue;
		}
		merged.entry(key.clone()).or_insert_with(|| value.clone());
	}
	Value::Object(merged)
}

/// Whole-payload pick by `updatedAt`; local wins when the comparison is
/// impossible.
pub fn last_writer_wins(local: &Value, remote: &Value) -> Value {
	let parse = |v: &Value| {
		v.get("updatedAt")
			.and_then(Value::as_str)
			.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
	};
	match (parse(local), parse(remote)) {
		(Some(l), Some(r)) if r > l => remote.clone(),
		_ => local.clone(),
	}
}

/// Applies remote operations and arbitrates conflicts.
pub struct ApplyEngine {
	cms: Arc<dyn ContentStore>,
	versions: Arc<VersionTracker>,
	conflicts: Arc<ConflictStore>,
	media: Option<Arc<MediaMirror>>,
	events: Arc<SyncEventBus>,
	metrics: Arc<SyncMetrics>,
	merge_strategy: MergeStrategy,
}

impl ApplyEngine {
	pub fn new(
		cms: Arc<dyn ContentStore>,
		versions: Arc<VersionTracker>,
		conflicts: Arc<ConflictStore>,
		media: Option<Arc<MediaMirror>>,
		events: Arc<SyncEventBus>,
		metrics: Arc<SyncMetrics>,
		merge_strategy: MergeStrategy,
	) -> Self {
		Self {
			cms,
			versions,
			conflicts,
			media,
			events,
			metrics,
			merge_strategy,
		}
	}

	pub fn conflicts(&self) -> &Arc<ConflictStore> {
		&self.conflicts
	}

	/// Apply one message. `origin` travels with every CMS write so the
	/// interceptor can tell peer-applied operations from local ones without
	/// any shared mutable flag.
	pub async fn apply(
		&self,
		msg: &SyncMessage,
		origin: &ChangeOrigin,
	) -> Result<ApplyOutcome, ApplyError> {
		let content_type = msg.content_type.as_str();
		let content_id = msg.content_id.as_str();
		let locale = msg.locale.as_deref();

		match self.cms.content_type_exists(content_type).await {
			Ok(true) => {}
			Ok(false) => {
				warn!(content_type, content_id, "Unknown content type");
				return Ok(ApplyOutcome::Quarantine(format!(
					"unknown content type {content_type}"
				)));
			}
			Err(e) => return Err(ApplyError::Cms(e)),
		}

		// Media runs before the CMS write so the stored payload already
		// points at reachable objects. Failures inside are logged and the
		// apply proceeds with the original URLs.
		let mut data = msg.data.clone();
		if let (Some(media), Some(payload)) = (&self.media, data.as_ref()) {
			let prepared = media
				.prepare_incoming(payload, msg.file_records.as_deref())
				.await;
			data = Some(prepared);
		}

		let local_meta = self.versions.get(content_type, content_id).await?;
		let local_data = self
			.cms
			.get_document(content_type, content_id, locale)
			.await
			.map_err(ApplyError::Cms)?;

		if origin.is_remote() && local_data.is_some() && local_meta.is_some() {
			let check = detect_conflict(
				local_meta.as_ref(),
				local_data.as_ref(),
				msg.version,
				data.as_ref(),
			);
			if check.has_conflict {
				let kind = check.kind.unwrap_or(ConflictKind::Direct);
				info!(
					content_type,
					content_id,
					kind = kind.as_str(),
					fields = ?check.fields,
					"Conflict detected, apply withheld"
				);
				self.conflicts
					.upsert_pending(
						content_type,
						content_id,
						local_data.clone().unwrap_or(Value::Null),
						data.clone().unwrap_or(Value::Null),
						&check.fields,
						kind,
					)
					.await?;
				self.versions.mark_conflict(content_type, content_id).await?;
				self.metrics.conflicts_detected.increment();
				self.events.emit(SyncEvent::ConflictDetected {
					content_type: content_type.to_string(),
					entity_id: content_id.to_string(),
				});
				return Ok(ApplyOutcome::ConflictRecorded {
					fields: check.fields,
				});
			}
		}

		let ctx = WriteContext {
			origin: origin.clone(),
		};

		match msg.operation {
			Operation::Create => {
				if local_data.is_some() {
					warn!(content_type, content_id, "Create for existing entity, skipping");
					return Ok(ApplyOutcome::Dropped("entity already exists".to_string()));
				}
				let payload = data.clone().unwrap_or(Value::Null);
				match self
					.cms
					.create_document(&ctx, content_type, content_id, locale, payload)
					.await
				{
					Ok(_) => {}
					Err(CmsError::AlreadyExists(_)) => {
						return Ok(ApplyOutcome::Dropped("entity already exists".to_string()));
					}
					Err(e) => return Err(ApplyError::Cms(e)),
				}
			}
			Operation::Update => {
				if local_data.is_none() {
					warn!(content_type, content_id, "Update for missing entity, skipping");
					return Ok(ApplyOutcome::Dropped("entity does not exist".to_string()));
				}
				let payload = data.clone().unwrap_or(Value::Null);
				match self
					.cms
					.update_document(&ctx, content_type, content_id, locale, payload)
					.await
				{
					Ok(_) => {}
					Err(CmsError::NotFound(_)) => {
						return Ok(ApplyOutcome::Dropped("entity does not exist".to_string()));
					}
					Err(e) => return Err(ApplyError::Cms(e)),
				}
			}
			Operation::Delete => {
				if local_data.is_none() {
					debug!(content_type, content_id, "Delete for missing entity");
					return Ok(ApplyOutcome::Dropped("entity already gone".to_string()));
				}
				match self
					.cms
					.delete_document(&ctx, content_type, content_id, locale)
					.await
				{
					Ok(()) | Err(CmsError::NotFound(_)) => {}
					Err(e) => return Err(ApplyError::Cms(e)),
				}
				self.versions.purge(content_type, content_id).await?;
				self.metrics.messages_applied.increment();
				self.emit_applied(msg);
				return Ok(ApplyOutcome::Applied);
			}
			Operation::Publish => {
				let payload = data.clone().unwrap_or(Value::Null);
				self.cms
					.publish_document(&ctx, content_type, content_id, locale, payload)
					.await
					.map_err(ApplyError::Cms)?;
			}
		}

		self.versions
			.mark_synced(content_type, content_id, msg.version, Some(&msg.ship_id))
			.await?;
		self.metrics.messages_applied.increment();
		self.emit_applied(msg);
		Ok(ApplyOutcome::Applied)
	}

	fn emit_applied(&self, msg: &SyncMessage) {
		self.events.emit(SyncEvent::MessageApplied {
			content_type: msg.content_type.clone(),
			content_id: msg.content_id.clone(),
			operation: msg.operation.as_str().to_string(),
		});
	}

	/// Resolve a pending conflict. The chosen payload is written back
	/// through the CMS with a *local* origin, so the interceptor propagates
	/// the resolution to the other side like any local edit.
	pub async fn resolve_conflict(
		&self,
		conflict_id: i32,
		choice: Resolution,
		merged: Option<Value>,
		resolved_by: Option<&str>,
	) -> Result<(), ResolveError> {
		let conflict = self.conflicts.get(conflict_id).await?;
		if conflict.status == ConflictStatus::Resolved.as_str() {
			return Err(ResolveError::Conflict(ConflictStoreError::AlreadyResolved(
				conflict_id,
			)));
		}

		let chosen = match choice {
			Resolution::KeepLocal => conflict.local_data.clone(),
			Resolution::KeepRemote => conflict.remote_data.clone(),
			Resolution::Merge => merged.clone().unwrap_or_else(|| match self.merge_strategy {
				MergeStrategy::Shallow => {
					shallow_merge(&conflict.local_data, &conflict.remote_data)
				}
				MergeStrategy::LastWriterWins => {
					last_writer_wins(&conflict.local_data, &conflict.remote_data)
				}
			}),
		};

		let content_type = conflict.content_type.as_str();
		let entity_id = conflict.entity_id.as_str();
		let ctx = WriteContext::local();

		let existing = self
			.cms
			.get_document(content_type, entity_id, None)
			.await
			.map_err(ResolveError::Cms)?;
		// Recreate the entity when the conflicting side had deleted it
		let write = if existing.is_some() {
			self.cms
				.update_document(&ctx, content_type, entity_id, None, chosen.clone())
				.await
		} else {
			self.cms
				.create_document(&ctx, content_type, entity_id, None, chosen.clone())
				.await
		};
		write.map_err(ResolveError::Cms)?;

		let merged_data = matches!(choice, Resolution::Merge).then_some(chosen);
		self.conflicts
			.mark_resolved(conflict_id, choice, merged_data, resolved_by)
			.await?;

		info!(
			conflict_id,
			content_type,
			entity_id,
			resolution = choice.as_str(),
			"Conflict resolved"
		);
		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("conflict log failed: {0}")]
	Conflict(#[from] ConflictStoreError),

	#[error("content store failed: {0}")]
	Cms(CmsError),

	#[error("version tracking failed: {0}")]
	Version(#[from] crate::service::sync::version::VersionError),
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::Database;
	use serde_json::json;
	use tempfile::TempDir;

	async fn create_test_store() -> (ConflictStore, TempDir) {
		let temp = TempDir::new().unwrap();
		let db = Database::open(&temp.path().join("sync.db")).await.unwrap();
		db.migrate().await.unwrap();
		(ConflictStore::new(Arc::new(db.conn().clone())), temp)
	}

	#[tokio::test]
	async fn one_pending_conflict_per_entity() {
		let (store, _temp) = create_test_store().await;

		let first = store
			.upsert_pending(
				"api::article.article",
				"a1",
				json!({"title": "L1"}),
				json!({"title": "R1"}),
				&["title".to_string()],
				ConflictKind::Direct,
			)
			.await
			.unwrap();

		// A later divergence for the same entity overwrites the row in place
		let second = store
			.upsert_pending(
				"api::article.article",
				"a1",
				json!({"title": "L2", "body": "b"}),
				json!({"title": "R2"}),
				&["body".to_string(), "title".to_string()],
				ConflictKind::Structural,
			)
			.await
			.unwrap();

		assert_eq!(second.id, first.id);
		assert_eq!(store.pending_count().await.unwrap(), 1);
		assert_eq!(second.conflict_type, "structural");
		assert_eq!(second.local_data["title"], "L2");

		// Resolution frees the slot for the next divergence
		store
			.mark_resolved(first.id, Resolution::KeepLocal, None, Some("operator"))
			.await
			.unwrap();
		assert_eq!(store.pending_count().await.unwrap(), 0);

		let reopened = store
			.upsert_pending(
				"api::article.article",
				"a1",
				json!({}),
				json!({}),
				&[],
				ConflictKind::Direct,
			)
			.await
			.unwrap();
		assert_ne!(reopened.id, first.id);
	}

	#[tokio::test]
	async fn resolving_twice_is_rejected() {
		let (store, _temp) = create_test_store().await;
		let row = store
			.upsert_pending(
				"api::page.page",
				"p1",
				json!({}),
				json!({}),
				&[],
				ConflictKind::Direct,
			)
			.await
			.unwrap();

		store
			.mark_resolved(row.id, Resolution::KeepRemote, None, None)
			.await
			.unwrap();
		assert!(matches!(
			store.mark_resolved(row.id, Resolution::KeepRemote, None, None).await,
			Err(ConflictStoreError::AlreadyResolved(_))
		));
	}

	#[test]
	fn shallow_merge_keeps_local_and_fills_gaps() {
		let local = json!({"title": "local", "body": "b"});
		let remote = json!({"title": "remote", "summary": "s", "updatedAt": "x"});

		let merged = shallow_merge(&local, &remote);
		assert_eq!(merged["title"], "local");
		assert_eq!(merged["body"], "b");
		assert_eq!(merged["summary"], "s");
		// Reserved fields are never pulled across
		assert!(merged.get("updatedAt").is_none());
	}

	#[test]
	fn last_writer_wins_picks_the_newer_payload() {
		let local = json!({"title": "old", "updatedAt": "2026-01-01T00:00:00Z"});
		let remote = json!({"title": "new", "updatedAt": "2026-02-01T00:00:00Z"});

		assert_eq!(last_writer_wins(&local, &remote)["title"], "new");
		assert_eq!(last_writer_wins(&remote, &local)["title"], "new");

		// Missing timestamps fall back to local
		let bare = json!({"title": "bare"});
		assert_eq!(last_writer_wins(&bare, &remote)["title"], "bare");
	}
}
