//! Per-entity sync bookkeeping
//!
//! One row per (content_type, entity_id). `sync_version` is monotonic and
//! only ever increases; a row with `sync_status = "synced"` always carries a
//! `last_synced_at` timestamp.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_metadata")]
pub struct Model {
	#[sea_orm(primary_key)]
	#[serde(default)]
	pub id: i32,
	pub content_type: String,
	pub entity_id: String,
	pub sync_version: i64,
	/// Peer id that produced the most recent change
	pub modified_by_location: String,
	pub last_synced_at: Option<DateTimeUtc>,
	/// pending | synced | conflict
	pub sync_status: String,
	pub conflict_flag: bool,
	#[serde(default)]
	pub created_at: DateTimeUtc,
	#[serde(default)]
	pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
