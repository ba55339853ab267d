//! Management HTTP surface
//!
//! A small axum router over the engine: status, the conflict queue, and the
//! HTTP push/pull fallback used for bootstrap when the bus is not an option.
//! The bus remains the primary transport; these endpoints never bypass the
//! apply path or the ledger.

use crate::cms::ChangeOrigin;
use crate::service::sync::apply::{ApplyOutcome, Resolution};
use crate::service::sync::liveness::SyncOutcome;
use crate::service::sync::message::SyncMessage;
use crate::service::sync::SyncContext;
use axum::{
	extract::{Path, Query, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

struct ApiError {
	status: StatusCode,
	message: String,
}

impl ApiError {
	fn bad_request(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			message: message.into(),
		}
	}

	fn not_found(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::NOT_FOUND,
			message: message.into(),
		}
	}

	fn master_only() -> Self {
		Self {
			status: StatusCode::FORBIDDEN,
			message: "endpoint is only served by the master".to_string(),
		}
	}

	fn internal(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::INTERNAL_SERVER_ERROR,
			message: message.into(),
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = Json(serde_json::json!({ "error": self.message }));
		(self.status, body).into_response()
	}
}

pub fn router(ctx: Arc<SyncContext>) -> Router {
	Router::new()
		.route("/sync/status", get(sync_status))
		.route("/sync/push", post(sync_push))
		.route("/sync/pull", get(sync_pull))
		.route("/sync/conflicts", get(list_conflicts))
		.route("/sync/conflicts/{id}/resolve", post(resolve_conflict))
		.route("/sync/dead-letters", get(list_dead_letters))
		.route("/sync/dead-letters/{id}/resolve", post(resolve_dead_letter))
		.layer(TraceLayer::new_for_http())
		.with_state(ctx)
}

/// Serve the management API until the shutdown channel fires.
pub async fn serve(
	ctx: Arc<SyncContext>,
	addr: &str,
	mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(addr, "Management API listening");
	axum::serve(listener, router(ctx))
		.with_graceful_shutdown(async move {
			let _ = shutdown.recv().await;
		})
		.await?;
	Ok(())
}

async fn sync_status(State(ctx): State<Arc<SyncContext>>) -> impl IntoResponse {
	Json(ctx.status().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
	ship_id: String,
	changes: Vec<SyncMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
	processed: usize,
	conflicts: usize,
	updated_entities: Vec<String>,
}

/// Bootstrap fallback for a named peer pushing a batch over HTTP. Runs the
/// same apply path as the bus consumer, ledger included.
async fn sync_push(
	State(ctx): State<Arc<SyncContext>>,
	Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
	if !ctx.config.mode.is_master() {
		return Err(ApiError::master_only());
	}
	if request.ship_id.trim().is_empty() {
		return Err(ApiError::bad_request("shipId must not be empty"));
	}

	let mut processed = 0;
	let mut conflicts = 0;
	let mut updated_entities = Vec::new();

	for msg in &request.changes {
		if let Err(e) = msg.validate() {
			warn!(message_id = %msg.message_id, error = %e, "Rejected pushed change");
			continue;
		}
		match ctx.dedup.seen(&msg.message_id).await {
			Ok(true) => {
				ctx.metrics.duplicates_dropped.increment();
				continue;
			}
			Ok(false) => {}
			Err(e) => return Err(ApiError::internal(e.to_string())),
		}

		let origin = ChangeOrigin::Remote {
			peer: request.ship_id.clone(),
		};
		match ctx.engine.apply(msg, &origin).await {
			Ok(ApplyOutcome::Applied) => {
				processed += 1;
				updated_entities.push(msg.content_id.clone());
				let _ = ctx.dedup.record(&msg.message_id).await;
			}
			Ok(ApplyOutcome::ConflictRecorded { .. }) => {
				conflicts += 1;
				let _ = ctx.dedup.record(&msg.message_id).await;
			}
			Ok(ApplyOutcome::Dropped(_)) | Ok(ApplyOutcome::Quarantine(_)) => {
				let _ = ctx.dedup.record(&msg.message_id).await;
			}
			Err(e) => return Err(ApiError::internal(e.to_string())),
		}
	}

	let outcome = if conflicts > 0 {
		SyncOutcome::Partial
	} else {
		SyncOutcome::Success
	};
	let _ = ctx
		.liveness
		.update_sync_status(&request.ship_id, outcome, Some(processed as i64))
		.await;

	Ok(Json(PushResponse {
		processed,
		conflicts,
		updated_entities,
	}))
}

#[derive(Debug, Deserialize)]
struct PullQuery {
	since: Option<DateTime<Utc>>,
	peer: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
	changes: Vec<SyncMessage>,
	server_time: DateTime<Utc>,
}

/// Changes modified since a supplied timestamp, excluding those the asking
/// peer produced itself.
async fn sync_pull(
	State(ctx): State<Arc<SyncContext>>,
	Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, ApiError> {
	if !ctx.config.mode.is_master() {
		return Err(ApiError::master_only());
	}

	let since = query.since.unwrap_or(DateTime::<Utc>::MIN_UTC);
	let rows = ctx
		.versions
		.modified_since(since, query.peer.as_deref())
		.await
		.map_err(|e| ApiError::internal(e.to_string()))?;

	let now = Utc::now();
	let mut changes = Vec::new();
	for row in rows {
		let data = ctx
			.cms
			.get_document(&row.content_type, &row.entity_id, None)
			.await
			.map_err(|e| ApiError::internal(e.to_string()))?;
		let Some(data) = data else {
			continue;
		};
		changes.push(SyncMessage {
			message_id: SyncMessage::compose_id(&ctx.config.ship_id, now, &row.entity_id),
			ship_id: ctx.config.ship_id.clone(),
			timestamp: now,
			operation: crate::cms::Operation::Update,
			content_type: row.content_type.clone(),
			content_id: row.entity_id.clone(),
			version: row.sync_version,
			data: Some(data),
			locale: None,
			file_records: None,
		});
	}

	Ok(Json(PullResponse {
		changes,
		server_time: now,
	}))
}

async fn list_conflicts(
	State(ctx): State<Arc<SyncContext>>,
) -> Result<Json<Vec<Value>>, ApiError> {
	let conflicts = ctx
		.engine
		.conflicts()
		.list_pending()
		.await
		.map_err(|e| ApiError::internal(e.to_string()))?;
	let as_json = conflicts
		.into_iter()
		.map(|row| serde_json::to_value(row).unwrap_or(Value::Null))
		.collect();
	Ok(Json(as_json))
}

async fn list_dead_letters(
	State(ctx): State<Arc<SyncContext>>,
) -> Result<Json<Vec<Value>>, ApiError> {
	let letters = ctx
		.dead_letters
		.list_open()
		.await
		.map_err(|e| ApiError::internal(e.to_string()))?;
	let as_json = letters
		.into_iter()
		.map(|row| serde_json::to_value(row).unwrap_or(Value::Null))
		.collect();
	Ok(Json(as_json))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DeadLetterAction {
	/// Run the quarantined message through the apply path again
	Requeue,
	/// Drop it for good
	Discard,
}

#[derive(Debug, Deserialize)]
struct DeadLetterResolveRequest {
	action: DeadLetterAction,
}

async fn resolve_dead_letter(
	State(ctx): State<Arc<SyncContext>>,
	Path(id): Path<i32>,
	Json(request): Json<DeadLetterResolveRequest>,
) -> Result<Json<Value>, ApiError> {
	let letter = ctx.dead_letters.get(id).await.map_err(|e| match e {
		crate::service::sync::dead_letter::DeadLetterError::NotFound(_) => {
			ApiError::not_found(format!("dead letter {id} not found"))
		}
		other => ApiError::internal(other.to_string()),
	})?;

	let outcome = match request.action {
		DeadLetterAction::Requeue => {
			let msg: SyncMessage = serde_json::from_value(letter.payload.clone())
				.map_err(|e| ApiError::bad_request(format!("payload is not replayable: {e}")))?;
			let origin = ChangeOrigin::Remote {
				peer: msg.ship_id.clone(),
			};
			let outcome = ctx
				.engine
				.apply(&msg, &origin)
				.await
				.map_err(|e| ApiError::internal(e.to_string()))?;
			format!("{outcome:?}")
		}
		DeadLetterAction::Discard => "discarded".to_string(),
	};

	ctx.dead_letters
		.mark_resolved(id)
		.await
		.map_err(|e| ApiError::internal(e.to_string()))?;

	Ok(Json(serde_json::json!({ "resolved": id, "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
	resolution: String,
	merged_data: Option<Value>,
	resolved_by: Option<String>,
}

async fn resolve_conflict(
	State(ctx): State<Arc<SyncContext>>,
	Path(id): Path<i32>,
	Json(request): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
	let resolution = Resolution::from_str(&request.resolution)
		.map_err(|e| ApiError::bad_request(e))?;

	ctx.engine
		.resolve_conflict(
			id,
			resolution,
			request.merged_data,
			request.resolved_by.as_deref(),
		)
		.await
		.map_err(|e| match e {
			crate::service::sync::apply::ResolveError::Conflict(
				crate::service::sync::apply::ConflictStoreError::NotFound(_),
			) => ApiError::not_found(format!("conflict {id} not found")),
			other => ApiError::internal(other.to_string()),
		})?;

	Ok(Json(serde_json::json!({ "resolved": id })))
}
