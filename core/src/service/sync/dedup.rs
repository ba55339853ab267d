//! Processed-message ledger
//!
//! The bus delivers at-least-once; this ledger makes processing effectively
//! once. `seen` is consulted before an apply, `record` afterwards, and old
//! entries are pruned by the janitor.

use crate::infra::db::entities::processed_message;
use chrono::{Duration, Utc};
use sea_orm::{
	ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
}

pub struct MessageDeduplicator {
	db: Arc<DatabaseConnection>,
}

impl MessageDeduplicator {
	pub fn new(db: Arc<DatabaseConnection>) -> Self {
		Self { db }
	}

	pub async fn seen(&self, message_id: &str) -> Result<bool, DedupError> {
		let count = processed_message::Entity::find()
			.filter(processed_message::Column::MessageId.eq(message_id))
			.count(self.db.as_ref())
			.await?;
		Ok(count > 0)
	}

	/// Record a handled message. Racing inserts of the same id collapse into
	/// one row thanks to the unique column.
	pub async fn record(&self, message_id: &str) -> Result<(), DedupError> {
		let result = processed_message::Entity::insert(processed_message::ActiveModel {
			message_id: Set(message_id.to_string()),
			processed_at: Set(Utc::now()),
			..Default::default()
		})
		.on_conflict(
			sea_orm::sea_query::OnConflict::column(processed_message::Column::MessageId)
				.do_nothing()
				.to_owned(),
		)
		.exec(self.db.as_ref())
		.await;

		match result {
			Ok(_) => Ok(()),
			// Another worker already recorded this id
			Err(DbErr::RecordNotInserted) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Drop ledger entries older than the retention window.
	pub async fn prune(&self, retention_days: i64) -> Result<u64, DedupError> {
		let cutoff = Utc::now() - Duration::days(retention_days);
		let result = processed_message::Entity::delete_many()
			.filter(processed_message::Column::ProcessedAt.lt(cutoff))
			.exec(self.db.as_ref())
			.await?;
		Ok(result.rows_affected)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::Database;
	use tempfile::TempDir;

	async fn create_test_dedup() -> (MessageDeduplicator, TempDir) {
		let temp = TempDir::new().unwrap();
		let db = Database::open(&temp.path().join("sync.db")).await.unwrap();
		db.migrate().await.unwrap();
		(MessageDeduplicator::new(Arc::new(db.conn().clone())), temp)
	}

	#[tokio::test]
	async fn seen_flips_after_record() {
		let (dedup, _temp) = create_test_dedup().await;

		assert!(!dedup.seen("m1").await.unwrap());
		dedup.record("m1").await.unwrap();
		assert!(dedup.seen("m1").await.unwrap());
	}

	#[tokio::test]
	async fn double_record_keeps_a_single_row() {
		let (dedup, _temp) = create_test_dedup().await;

		dedup.record("m1").await.unwrap();
		dedup.record("m1").await.unwrap();

		assert!(dedup.seen("m1").await.unwrap());
		// Retention of 0 days prunes everything, proving exactly one row
		assert_eq!(dedup.prune(0).await.unwrap(), 1);
	}
}
