//! Conflict log
//!
//! One `pending` row at most per (content_type, entity_id). Rows persist
//! until resolved through the management path.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "conflict_log")]
pub struct Model {
	#[sea_orm(primary_key)]
	#[serde(default)]
	pub id: i32,
	pub content_type: String,
	pub entity_id: String,
	pub local_data: Json,
	pub remote_data: Json,
	/// JSON array of field names that disagree
	pub conflicting_fields: Json,
	/// direct | indirect | structural
	pub conflict_type: String,
	/// pending | resolved
	pub status: String,
	/// keep_local | keep_remote | merge
	pub resolution: Option<String>,
	pub merged_data: Option<Json>,
	#[serde(default)]
	pub created_at: DateTimeUtc,
	pub resolved_at: Option<DateTimeUtc>,
	pub resolved_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
