//! Replica outbound queue
//!
//! Durable FIFO of local edits pending push to the master. At most one
//! `pending` row exists per (content_type, content_id, locale); a second
//! enqueue for the same key coalesces into the existing row.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbound_queue")]
pub struct Model {
	#[sea_orm(primary_key)]
	#[serde(default)]
	pub id: i32,
	pub ship_id: String,
	pub content_type: String,
	pub content_id: String,
	/// create | update | delete | publish
	pub operation: String,
	pub local_version: i64,
	/// Redacted document payload; None for deletes
	pub data: Option<Json>,
	pub locale: Option<String>,
	/// pending | sent | failed
	pub status: String,
	pub retry_count: i32,
	pub error_message: Option<String>,
	#[serde(default)]
	pub created_at: DateTimeUtc,
	pub sent_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
