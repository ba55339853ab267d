//! Per-peer liveness session (master side)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "peer_session")]
pub struct Model {
	#[sea_orm(primary_key)]
	#[serde(default)]
	pub id: i32,
	#[sea_orm(unique)]
	pub peer_id: String,
	pub last_seen_at: DateTimeUtc,
	pub is_online: bool,
	/// Silence tolerated before the peer flips offline (seconds)
	pub online_threshold_secs: i64,
	pub last_sync_at: Option<DateTimeUtc>,
	/// success | partial | failed
	pub last_sync_status: Option<String>,
	pub total_syncs: i64,
	/// Free-form peer metadata reported with heartbeats
	pub metadata: Option<Json>,
	#[serde(default)]
	pub created_at: DateTimeUtc,
	#[serde(default)]
	pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
