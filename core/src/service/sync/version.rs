//! Per-entity version tracking and conflict detection
//!
//! One `sync_metadata` row per (content_type, entity_id). Local edits bump
//! the monotonic counter and mark the row pending; applying a peer's change
//! adopts the peer's version and marks the row synced. A remote change
//! conflicts only when the local copy has diverged - a pending row whose
//! payload disagrees with the incoming one.

use crate::infra::db::entities::sync_metadata;
use crate::infra::payload::RESERVED_FIELDS;
use chrono::Utc;
use sea_orm::{
	ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
	Set, TransactionTrait,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Sync lifecycle of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
	Pending,
	Synced,
	Conflict,
}

impl SyncStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncStatus::Pending => "pending",
			SyncStatus::Synced => "synced",
			SyncStatus::Conflict => "conflict",
		}
	}
}

/// How two divergent copies disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
	/// The same fields carry different values
	Direct,
	/// Disagreement only through relations or derived data
	Indirect,
	/// Fields exist on one side only (including delete-vs-edit)
	Structural,
}

impl ConflictKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConflictKind::Direct => "direct",
			ConflictKind::Indirect => "indirect",
			ConflictKind::Structural => "structural",
		}
	}
}

/// Result of comparing a local copy against an incoming remote change
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCheck {
	pub has_conflict: bool,
	pub fields: Vec<String>,
	pub kind: Option<ConflictKind>,
}

impl ConflictCheck {
	fn clean() -> Self {
		Self {
			has_conflict: false,
			fields: Vec::new(),
			kind: None,
		}
	}
}

#[derive(Debug, Error)]
pub enum VersionError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
}

/// Tracks `sync_metadata` rows
pub struct VersionTracker {
	db: Arc<DatabaseConnection>,
}

impl VersionTracker {
	pub fn new(db: Arc<DatabaseConnection>) -> Self {
		Self { db }
	}

	/// Atomically bump the version for a local edit. Initializes the row at
	/// version 1 when the entity is first touched. Returns the new version.
	pub async fn increment_version(
		&self,
		content_type: &str,
		entity_id: &str,
		peer_id: &str,
	) -> Result<i64, VersionError> {
		let txn = self.db.begin().await?;
		let now = Utc::now();

		let existing = sync_metadata::Entity::find()
			.filter(sync_metadata::Column::ContentType.eq(content_type))
			.filter(sync_metadata::Column::EntityId.eq(entity_id))
			.one(&txn)
			.await?;

		let new_version = match existing {
			Some(row) => {
				let version = row.sync_version + 1;
				let mut active: sync_metadata::ActiveModel = row.into();
				active.sync_version = Set(version);
				active.modified_by_location = Set(peer_id.to_string());
				active.sync_status = Set(SyncStatus::Pending.as_str().to_string());
				active.updated_at = Set(now);
				active.update(&txn).await?;
				version
			}
			None => {
				sync_metadata::ActiveModel {
					content_type: Set(content_type.to_string()),
					entity_id: Set(entity_id.to_string()),
					sync_version: Set(1),
					modified_by_location: Set(peer_id.to_string()),
					last_synced_at: Set(None),
					sync_status: Set(SyncStatus::Pending.as_str().to_string()),
					conflict_flag: Set(false),
					created_at: Set(now),
					updated_at: Set(now),
					..Default::default()
				}
				.insert(&txn)
				.await?;
				1
			}
		};

		txn.commit().await?;
		debug!(content_type, entity_id, version = new_version, "Version bumped");
		Ok(new_version)
	}

	pub async fn get(
		&self,
		content_type: &str,
		entity_id: &str,
	) -> Result<Option<sync_metadata::Model>, VersionError> {
		Ok(sync_metadata::Entity::find()
			.filter(sync_metadata::Column::ContentType.eq(content_type))
			.filter(sync_metadata::Column::EntityId.eq(entity_id))
			.one(self.db.as_ref())
			.await?)
	}

	/// Record a completed sync. Clears the conflict flag, stamps
	/// `last_synced_at`, and advances the version to `at_version` if that is
	/// ahead (the counter never moves backwards). `modified_by` is recorded
	/// when the sync applied a peer's change.
	pub async fn mark_synced(
		&self,
		content_type: &str,
		entity_id: &str,
		at_version: i64,
		modified_by: Option<&str>,
	) -> Result<(), VersionError> {
		let txn = self.db.begin().await?;
		let now = Utc::now();

		let existing = sync_metadata::Entity::find()
			.filter(sync_metadata::Column::ContentType.eq(content_type))
			.filter(sync_metadata::Column::EntityId.eq(entity_id))
			.one(&txn)
			.await?;

		match existing {
			Some(row) => {
				let version = row.sync_version.max(at_version);
				let modified = modified_by
					.map(str::to_string)
					.unwrap_or_else(|| row.modified_by_location.clone());
				let mut active: sync_metadata::ActiveModel = row.into();
				active.sync_version = Set(version);
				active.modified_by_location = Set(modified);
				active.sync_status = Set(SyncStatus::Synced.as_str().to_string());
				active.conflict_flag = Set(false);
				active.last_synced_at = Set(Some(now));
				active.updated_at = Set(now);
				active.update(&txn).await?;
			}
			None => {
				sync_metadata::ActiveModel {
					content_type: Set(content_type.to_string()),
					entity_id: Set(entity_id.to_string()),
					sync_version: Set(at_version.max(1)),
					modified_by_location: Set(modified_by.unwrap_or_default().to_string()),
					last_synced_at: Set(Some(now)),
					sync_status: Set(SyncStatus::Synced.as_str().to_string()),
					conflict_flag: Set(false),
					created_at: Set(now),
					updated_at: Set(now),
					..Default::default()
				}
				.insert(&txn)
				.await?;
			}
		}

		txn.commit().await?;
		Ok(())
	}

	/// Flag an entity as conflicted; the row stays at its local version.
	pub async fn mark_conflict(
		&self,
		content_type: &str,
		entity_id: &str,
	) -> Result<(), VersionError> {
		let existing = self.get(content_type, entity_id).await?;
		if let Some(row) = existing {
			let mut active: sync_metadata::ActiveModel = row.into();
			active.sync_status = Set(SyncStatus::Conflict.as_str().to_string());
			active.conflict_flag = Set(true);
			active.updated_at = Set(Utc::now());
			active.update(self.db.as_ref()).await?;
		}
		Ok(())
	}

	/// Drop the row entirely (entity deleted).
	pub async fn purge(&self, content_type: &str, entity_id: &str) -> Result<(), VersionError> {
		sync_metadata::Entity::delete_many()
			.filter(sync_metadata::Column::ContentType.eq(content_type))
			.filter(sync_metadata::Column::EntityId.eq(entity_id))
			.exec(self.db.as_ref())
			.await?;
		Ok(())
	}

	/// Most recent completed sync across all entities.
	pub async fn latest_sync_time(
		&self,
	) -> Result<Option<chrono::DateTime<Utc>>, VersionError> {
		let row = sync_metadata::Entity::find()
			.filter(sync_metadata::Column::LastSyncedAt.is_not_null())
			.order_by_desc(sync_metadata::Column::LastSyncedAt)
			.one(self.db.as_ref())
			.await?;
		Ok(row.and_then(|r| r.last_synced_at))
	}

	/// Entities changed after `since`, for the pull fallback.
	pub async fn modified_since(
		&self,
		since: chrono::DateTime<Utc>,
		exclude_peer: Option<&str>,
	) -> Result<Vec<sync_metadata::Model>, VersionError> {
		let mut query = sync_metadata::Entity::find()
			.filter(sync_metadata::Column::UpdatedAt.gt(since));
		if let Some(peer) = exclude_peer {
			query = query.filter(sync_metadata::Column::ModifiedByLocation.ne(peer));
		}
		Ok(query.all(self.db.as_ref()).await?)
	}
}

/// Compare a local copy against an incoming remote change.
///
/// A clean (non-pending) local copy never conflicts: the remote change
/// supersedes it, whatever the version gap. A pending local copy has
/// diverged; equal versions there mean both sides advanced independently
/// from the same ancestor, so the payloads decide. Disagreement outside the
/// reserved field set is a conflict - same-field disagreement is `direct`,
/// presence on one side only is `structural`. Identical payloads never
/// conflict, which also absorbs re-deliveries.
pub fn detect_conflict(
	local_meta: Option<&sync_metadata::Model>,
	local_data: Option<&Value>,
	remote_version: i64,
	remote_data: Option<&Value>,
) -> ConflictCheck {
	let Some(meta) = local_meta else {
		return ConflictCheck::clean();
	};

	// Clean local copy: remote change fast-forwards it.
	if meta.sync_status != SyncStatus::Pending.as_str() && !meta.conflict_flag {
		return ConflictCheck::clean();
	}

	debug!(
		content_type = %meta.content_type,
		entity_id = %meta.entity_id,
		local_version = meta.sync_version,
		remote_version,
		"Local copy has unsynced edits, diffing payloads"
	);

	let (changed, one_sided) = diff_fields(local_data, remote_data);
	if changed.is_empty() && one_sided.is_empty() {
		return ConflictCheck::clean();
	}

	let kind = if changed.is_empty() {
		ConflictKind::Structural
	} else {
		ConflictKind::Direct
	};

	let mut fields = changed;
	fields.extend(one_sided);

	ConflictCheck {
		has_conflict: true,
		fields,
		kind: Some(kind),
	}
}

/// Field-wise structural diff, excluding the reserved set. Returns
/// (fields differing on both sides, fields present on one side only).
fn diff_fields(local: Option<&Value>, remote: Option<&Value>) -> (Vec<String>, Vec<String>) {
	match (local.and_then(Value::as_object), remote.and_then(Value::as_object)) {
		(Some(local_map), Some(remote_map)) => {
			let mut changed = Vec::new();
			let mut one_sided = Vec::new();

			for (key, local_value) in local_map {
				if RESERVED_FIELDS.contains(&key.as_str()) {
					continue;
				}
				match remote_map.get(key) {
					Some(remote_value) => {
						if local_value.to_string() != remote_value.to_string() {
							changed.push(key.clone());
						}
					}
					None => one_sided.push(key.clone()),
				}
			}
			for key in remote_map.keys() {
				if RESERVED_FIELDS.contains(&key.as_str()) {
					continue;
				}
				if !local_map.contains_key(key) {
					one_sided.push(key.clone());
				}
			}

			changed.sort();
			one_sided.sort();
			(changed, one_sided)
		}
		(None, None) => (Vec::new(), Vec::new()),
		// Delete-vs-edit and other shape mismatches
		(Some(local_map), None) => (
			Vec::new(),
			local_map
				.keys()
				.filter(|k| !RESERVED_FIELDS.contains(&k.as_str()))
				.cloned()
				.collect(),
		),
		(None, Some(remote_map)) => (
			Vec::new(),
			remote_map
				.keys()
				.filter(|k| !RESERVED_FIELDS.contains(&k.as_str()))
				.cloned()
				.collect(),
		),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::Database;
	use serde_json::json;
	use tempfile::TempDir;

	async fn create_test_db() -> (Arc<DatabaseConnection>, TempDir) {
		let temp = TempDir::new().unwrap();
		let db = Database::open(&temp.path().join("sync.db")).await.unwrap();
		db.migrate().await.unwrap();
		(Arc::new(db.conn().clone()), temp)
	}

	#[tokio::test]
	async fn version_starts_at_one_and_only_increases() {
		let (db, _temp) = create_test_db().await;
		let tracker = VersionTracker::new(db);

		let v1 = tracker
			.increment_version("api::article.article", "a1", "ship-7")
			.await
			.unwrap();
		assert_eq!(v1, 1);

		let v2 = tracker
			.increment_version("api::article.article", "a1", "ship-7")
			.await
			.unwrap();
		assert_eq!(v2, 2);

		// mark_synced with an older version must not move the counter back
		tracker
			.mark_synced("api::article.article", "a1", 1, None)
			.await
			.unwrap();
		let row = tracker.get("api::article.article", "a1").await.unwrap().unwrap();
		assert_eq!(row.sync_version, 2);
		assert_eq!(row.sync_status, "synced");
		assert!(row.last_synced_at.is_some());
	}

	#[tokio::test]
	async fn synced_rows_always_have_a_timestamp() {
		let (db, _temp) = create_test_db().await;
		let tracker = VersionTracker::new(db);

		tracker
			.mark_synced("api::page.page", "p1", 5, Some("master"))
			.await
			.unwrap();
		let row = tracker.get("api::page.page", "p1").await.unwrap().unwrap();
		assert_eq!(row.sync_version, 5);
		assert_eq!(row.modified_by_location, "master");
		assert!(row.last_synced_at.is_some());
	}

	fn pending_meta(version: i64) -> sync_metadata::Model {
		sync_metadata::Model {
			id: 1,
			content_type: "api::article.article".to_string(),
			entity_id: "a1".to_string(),
			sync_version: version,
			modified_by_location: "master".to_string(),
			last_synced_at: None,
			sync_status: "pending".to_string(),
			conflict_flag: false,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	#[test]
	fn clean_local_copy_never_conflicts() {
		let mut meta = pending_meta(3);
		meta.sync_status = "synced".to_string();

		let check = detect_conflict(
			Some(&meta),
			Some(&json!({"title": "A"})),
			4,
			Some(&json!({"title": "B"})),
		);
		assert!(!check.has_conflict);
	}

	#[test]
	fn diverged_copies_conflict_directly_on_changed_fields() {
		let meta = pending_meta(3);
		let check = detect_conflict(
			Some(&meta),
			Some(&json!({"title": "A", "body": "same"})),
			3,
			Some(&json!({"title": "B", "body": "same"})),
		);
		assert!(check.has_conflict);
		assert_eq!(check.fields, vec!["title"]);
		assert_eq!(check.kind, Some(ConflictKind::Direct));
	}

	#[test]
	fn one_sided_fields_are_structural() {
		let meta = pending_meta(2);
		let check = detect_conflict(
			Some(&meta),
			Some(&json!({"title": "A", "local_only": 1})),
			3,
			Some(&json!({"title": "A"})),
		);
		assert!(check.has_conflict);
		assert_eq!(check.kind, Some(ConflictKind::Structural));
		assert_eq!(check.fields, vec!["local_only"]);
	}

	#[test]
	fn identical_payloads_do_not_conflict() {
		let meta = pending_meta(3);
		let data = json!({"title": "A", "updatedAt": "ignored-anyway"});
		let check = detect_conflict(Some(&meta), Some(&data), 3, Some(&data));
		assert!(!check.has_conflict);
	}

	#[test]
	fn delete_against_pending_edit_is_structural() {
		let meta = pending_meta(4);
		let check = detect_conflict(Some(&meta), Some(&json!({"title": "A"})), 0, None);
		assert!(check.has_conflict);
		assert_eq!(check.kind, Some(ConflictKind::Structural));
	}

	#[test]
	fn reserved_fields_are_ignored_by_the_diff() {
		let meta = pending_meta(2);
		let check = detect_conflict(
			Some(&meta),
			Some(&json!({"title": "A", "updatedAt": "t1", "id": 1})),
			3,
			Some(&json!({"title": "A", "updatedAt": "t2", "id": 9})),
		);
		assert!(!check.has_conflict);
	}
}
