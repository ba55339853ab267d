//! Dead-letter quarantine
//!
//! Messages that cannot be applied and will never succeed on retry land
//! here with a reason. The management API lists them and can resolve one by
//! re-applying it or discarding it.

use crate::infra::db::entities::dead_letter;
use chrono::{Duration, Utc};
use sea_orm::{
	ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
	QueryFilter, QueryOrder, Set,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DeadLetterError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),

	#[error("dead letter {0} not found")]
	NotFound(i32),
}

pub struct DeadLetterStore {
	db: Arc<DatabaseConnection>,
}

impl DeadLetterStore {
	pub fn new(db: Arc<DatabaseConnection>) -> Self {
		Self { db }
	}

	pub async fn quarantine(
		&self,
		message_id: &str,
		payload: Value,
		reason: &str,
	) -> Result<dead_letter::Model, DeadLetterError> {
		warn!(message_id, reason, "Quarantining message");
		Ok(dead_letter::ActiveModel {
			message_id: Set(message_id.to_string()),
			payload: Set(payload),
			reason: Set(reason.to_string()),
			created_at: Set(Utc::now()),
			resolved_at: Set(None),
			..Default::default()
		}
		.insert(self.db.as_ref())
		.await?)
	}

	/// Unresolved letters, oldest first.
	pub async fn list_open(&self) -> Result<Vec<dead_letter::Model>, DeadLetterError> {
		Ok(dead_letter::Entity::find()
			.filter(dead_letter::Column::ResolvedAt.is_null())
			.order_by_asc(dead_letter::Column::Id)
			.all(self.db.as_ref())
			.await?)
	}

	pub async fn get(&self, id: i32) -> Result<dead_letter::Model, DeadLetterError> {
		dead_letter::Entity::find_by_id(id)
			.one(self.db.as_ref())
			.await?
			.ok_or(DeadLetterError::NotFound(id))
	}

	pub async fn mark_resolved(&self, id: i32) -> Result<(), DeadLetterError> {
		let row = self.get(id).await?;
		let mut active: dead_letter::ActiveModel = row.into();
		active.resolved_at = Set(Some(Utc::now()));
		active.update(self.db.as_ref()).await?;
		Ok(())
	}

	pub async fn open_count(&self) -> Result<u64, DeadLetterError> {
		Ok(dead_letter::Entity::find()
			.filter(dead_letter::Column::ResolvedAt.is_null())
			.count(self.db.as_ref())
			.await?)
	}

	/// Drop resolved letters older than the retention window.
	pub async fn prune(&self, retention_days: i64) -> Result<u64, DeadLetterError> {
		let cutoff = Utc::now() - Duration::days(retention_days);
		let result = dead_letter::Entity::delete_many()
			.filter(dead_letter::Column::ResolvedAt.is_not_null())
			.filter(dead_letter::Column::ResolvedAt.lt(cutoff))
			.exec(self.db.as_ref())
			.await?;
		Ok(result.rows_affected)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::Database;
	use serde_json::json;
	use tempfile::TempDir;

	async fn create_test_store() -> (DeadLetterStore, TempDir) {
		let temp = TempDir::new().unwrap();
		let db = Database::open(&temp.path().join("sync.db")).await.unwrap();
		db.migrate().await.unwrap();
		(DeadLetterStore::new(Arc::new(db.conn().clone())), temp)
	}

	#[tokio::test]
	async fn quarantine_and_resolve_lifecycle() {
		let (store, _temp) = create_test_store().await;

		let letter = store
			.quarantine("m1", json!({"contentType": "nope"}), "unknown content type")
			.await
			.unwrap();
		assert_eq!(store.open_count().await.unwrap(), 1);

		store.mark_resolved(letter.id).await.unwrap();
		assert_eq!(store.open_count().await.unwrap(), 0);
		assert!(store.list_open().await.unwrap().is_empty());

		// Freshly resolved letters survive pruning with a retention window
		assert_eq!(store.prune(30).await.unwrap(), 0);
		assert_eq!(store.prune(0).await.unwrap(), 1);
	}
}
