//! Durable outbound queues
//!
//! Two tables with one contract: the replica's outbound queue of local edits
//! pending push, and the master's broadcast queue used while its producer is
//! disconnected. Coalescing is part of the contract, not an optimization:
//! at most one pending row exists per (content_type, content_id, locale),
//! so rapid successive edits collapse into one outbound message and per-key
//! ordering falls out of the single-row rule.

use crate::cms::Operation;
use crate::infra::db::entities::{broadcast_queue, outbound_queue};
use chrono::{Duration, Utc};
use sea_orm::{
	ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
	QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Queue row lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
	Pending,
	Sent,
	Failed,
}

impl QueueStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			QueueStatus::Pending => "pending",
			QueueStatus::Sent => "sent",
			QueueStatus::Failed => "failed",
		}
	}
}

/// A change handed to a queue by the interceptor
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
	pub ship_id: String,
	pub content_type: String,
	pub content_id: String,
	pub operation: Operation,
	pub local_version: i64,
	pub data: Option<Value>,
	pub locale: Option<String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),

	#[error("queue entry {0} not found")]
	NotFound(i32),
}

macro_rules! queue_store {
	($(#[$doc:meta])* $store:ident, $table:ident) => {
		$(#[$doc])*
		pub struct $store {
			db: Arc<DatabaseConnection>,
			max_retries: i32,
		}

		impl $store {
			pub fn new(db: Arc<DatabaseConnection>, max_retries: i32) -> Self {
				Self { db, max_retries }
			}

			fn locale_filter(
				query: sea_orm::Select<$table::Entity>,
				locale: &Option<String>,
			) -> sea_orm::Select<$table::Entity> {
				match locale {
					Some(locale) => query.filter($table::Column::Locale.eq(locale.clone())),
					None => query.filter($table::Column::Locale.is_null()),
				}
			}

			/// Enqueue a change. An existing pending row for the same
			/// (content_type, content_id, locale) is overwritten in place:
			/// payload, operation and version are replaced and the retry
			/// counter resets, collapsing rapid edits into one message.
			pub async fn enqueue(&self, entry: NewQueueEntry) -> Result<$table::Model, QueueError> {
				let txn = self.db.begin().await?;
				let now = Utc::now();

				let existing = Self::locale_filter(
					$table::Entity::find()
						.filter($table::Column::ContentType.eq(entry.content_type.as_str()))
						.filter($table::Column::ContentId.eq(entry.content_id.as_str()))
						.filter($table::Column::Status.eq(QueueStatus::Pending.as_str())),
					&entry.locale,
				)
				.one(&txn)
				.await?;

				let row = match existing {
					Some(row) => {
						let id = row.id;
						let mut active: $table::ActiveModel = row.into();
						active.operation = Set(entry.operation.as_str().to_string());
						active.local_version = Set(entry.local_version);
						active.data = Set(entry.data.clone());
						active.retry_count = Set(0);
						active.error_message = Set(None);
						let updated = active.update(&txn).await?;
						debug!(
							id,
							content_type = %entry.content_type,
							content_id = %entry.content_id,
							operation = %entry.operation,
							"Coalesced into pending queue entry"
						);
						updated
					}
					None => {
						let inserted = $table::ActiveModel {
							ship_id: Set(entry.ship_id.clone()),
							content_type: Set(entry.content_type.clone()),
							content_id: Set(entry.content_id.clone()),
							operation: Set(entry.operation.as_str().to_string()),
							local_version: Set(entry.local_version),
							data: Set(entry.data.clone()),
							locale: Set(entry.locale.clone()),
							status: Set(QueueStatus::Pending.as_str().to_string()),
							retry_count: Set(0),
							error_message: Set(None),
							created_at: Set(now),
							sent_at: Set(None),
							..Default::default()
						}
						.insert(&txn)
						.await?;
						debug!(
							id = inserted.id,
							content_type = %entry.content_type,
							content_id = %entry.content_id,
							operation = %entry.operation,
							"Enqueued"
						);
						inserted
					}
				};

				txn.commit().await?;
				Ok(row)
			}

			/// Oldest pending rows first, capped at `limit`.
			pub async fn get_pending(&self, limit: u64) -> Result<Vec<$table::Model>, QueueError> {
				Ok($table::Entity::find()
					.filter($table::Column::Status.eq(QueueStatus::Pending.as_str()))
					.order_by_asc($table::Column::Id)
					.limit(limit)
					.all(self.db.as_ref())
					.await?)
			}

			pub async fn pending_count(&self) -> Result<u64, QueueError> {
				Ok($table::Entity::find()
					.filter($table::Column::Status.eq(QueueStatus::Pending.as_str()))
					.count(self.db.as_ref())
					.await?)
			}

			pub async fn mark_synced(&self, id: i32) -> Result<(), QueueError> {
				let row = $table::Entity::find_by_id(id)
					.one(self.db.as_ref())
					.await?
					.ok_or(QueueError::NotFound(id))?;
				let mut active: $table::ActiveModel = row.into();
				active.status = Set(QueueStatus::Sent.as_str().to_string());
				active.sent_at = Set(Some(Utc::now()));
				active.error_message = Set(None);
				active.update(self.db.as_ref()).await?;
				Ok(())
			}

			/// Count a failed send attempt. The row stays pending for the
			/// next pass until the retry cap is reached, then goes failed.
			pub async fn mark_failed(&self, id: i32, error: &str) -> Result<(), QueueError> {
				let row = $table::Entity::find_by_id(id)
					.one(self.db.as_ref())
					.await?
					.ok_or(QueueError::NotFound(id))?;
				let retries = row.retry_count + 1;
				let exhausted = retries >= self.max_retries;
				let mut active: $table::ActiveModel = row.into();
				active.retry_count = Set(retries);
				active.error_message = Set(Some(error.to_string()));
				if exhausted {
					active.status = Set(QueueStatus::Failed.as_str().to_string());
				}
				active.update(self.db.as_ref()).await?;
				Ok(())
			}

			/// Requeue failed rows for another full round of attempts.
			pub async fn retry_failed(&self) -> Result<u64, QueueError> {
				let result = $table::Entity::update_many()
					.col_expr(
						$table::Column::Status,
						sea_orm::sea_query::Expr::value(QueueStatus::Pending.as_str()),
					)
					.col_expr(
						$table::Column::RetryCount,
						sea_orm::sea_query::Expr::value(0),
					)
					.filter($table::Column::Status.eq(QueueStatus::Failed.as_str()))
					.exec(self.db.as_ref())
					.await?;
				Ok(result.rows_affected)
			}

			/// Drop sent rows older than the retention window.
			pub async fn prune_sent(&self, retention_days: i64) -> Result<u64, QueueError> {
				let cutoff = Utc::now() - Duration::days(retention_days);
				let result = $table::Entity::delete_many()
					.filter($table::Column::Status.eq(QueueStatus::Sent.as_str()))
					.filter($table::Column::SentAt.lt(cutoff))
					.exec(self.db.as_ref())
					.await?;
				Ok(result.rows_affected)
			}
		}
	};
}

queue_store!(
	/// Replica-side durable FIFO of local edits pending push to the master.
	OutboundQueue,
	outbound_queue
);

queue_store!(
	/// Master-side buffer of broadcasts made while the producer was down.
	BroadcastQueue,
	broadcast_queue
);
