//! Management surface: status, the HTTP push fallback, and conflict
//! resolution all go through the same engine paths as the bus.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use helpers::*;
use hawser_core::cms::{Operation, WriteContext};
use hawser_core::ContentStore;
use hawser_core::infra::bus::MemoryBus;
use hawser_core::service::api;
use hawser_core::service::sync::SyncMessage;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
	let bytes = response.into_body().collect().await.unwrap().to_bytes();
	serde_json::from_slice(&bytes).unwrap()
}

fn push_message(content_id: &str, version: i64, data: Value) -> SyncMessage {
	let now = Utc::now();
	SyncMessage {
		message_id: SyncMessage::compose_id("ship-aurora", now, content_id),
		ship_id: "ship-aurora".to_string(),
		timestamp: now,
		operation: Operation::Create,
		content_type: ARTICLE.to_string(),
		content_id: content_id.to_string(),
		version,
		data: Some(data),
		locale: None,
		file_records: None,
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reflects_mode_and_queues() {
	let bus = MemoryBus::new();
	let master = master_node(&bus).await;
	let router = api::router(master.ctx().clone());

	let response = router
		.oneshot(
			Request::builder()
				.uri("/sync/status")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	let status = body_json(response).await;
	assert_eq!(status["mode"], "master");
	assert_eq!(status["queueSize"], 0);
	assert_eq!(status["pendingConflicts"], 0);
	assert!(status["peers"].is_array());
	assert!(status.get("connectivity").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn http_push_applies_and_deduplicates() {
	let bus = MemoryBus::new();
	let master = master_node(&bus).await;
	let router = api::router(master.ctx().clone());

	let msg = push_message("h1", 1, json!({"title": "over http"}));
	let request_body = json!({
		"shipId": "ship-aurora",
		"changes": [msg]
	});

	let send = |router: axum::Router, body: Value| async move {
		router
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/sync/push")
					.header("content-type", "application/json")
					.body(Body::from(body.to_string()))
					.unwrap(),
			)
			.await
			.unwrap()
	};

	let response = send(router.clone(), request_body.clone()).await;
	assert_eq!(response.status(), StatusCode::OK);
	let result = body_json(response).await;
	assert_eq!(result["processed"], 1);
	assert_eq!(result["conflicts"], 0);
	assert_eq!(result["updatedEntities"], json!(["h1"]));

	assert!(master
		.cms
		.get_document(ARTICLE, "h1", None)
		.await
		.unwrap()
		.is_some());

	// Re-sending the same batch is absorbed by the ledger
	let response = send(router, request_body).await;
	let result = body_json(response).await;
	assert_eq!(result["processed"], 0);
	assert_eq!(master.cms.write_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_returns_changes_since_timestamp() {
	let bus = MemoryBus::new();
	let master = master_node(&bus).await;

	master
		.cms
		.create_document(
			&WriteContext::local(),
			ARTICLE,
			"p1",
			None,
			json!({"title": "pullable"}),
		)
		.await
		.unwrap();

	let router = api::router(master.ctx().clone());
	let response = router
		.oneshot(
			Request::builder()
				.uri("/sync/pull?peer=ship-aurora")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	let result = body_json(response).await;
	let changes = result["changes"].as_array().unwrap();
	assert_eq!(changes.len(), 1);
	assert_eq!(changes[0]["contentId"], "p1");
	assert_eq!(changes[0]["data"]["title"], "pullable");
}

#[tokio::test(flavor = "multi_thread")]
async fn replica_refuses_master_only_endpoints() {
	let bus = MemoryBus::new();
	let replica = replica_node(&bus, "ship-aurora").await;
	let router = api::router(replica.ctx().clone());

	let response = router
		.oneshot(
			Request::builder()
				.uri("/sync/pull")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_can_be_listed_and_resolved_over_http() {
	let bus = MemoryBus::new();
	let master = master_node(&bus).await;
	let ctx = master.ctx().clone();

	// Seed a pending local edit, then let a remote change collide with it
	master
		.cms
		.create_document(
			&WriteContext::local(),
			ARTICLE,
			"c1",
			None,
			json!({"title": "B"}),
		)
		.await
		.unwrap();

	let msg = SyncMessage {
		operation: Operation::Update,
		..push_message("c1", 3, json!({"title": "A"}))
	};
	let origin = hawser_core::cms::ChangeOrigin::Remote {
		peer: "ship-aurora".to_string(),
	};
	let outcome = ctx.engine.apply(&msg, &origin).await.unwrap();
	assert!(matches!(
		outcome,
		hawser_core::service::sync::ApplyOutcome::ConflictRecorded { .. }
	));

	let router = api::router(ctx.clone());
	let response = router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/sync/conflicts")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	let conflicts = body_json(response).await;
	let conflict_id = conflicts[0]["id"].as_i64().unwrap();

	let response = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri(format!("/sync/conflicts/{conflict_id}/resolve"))
				.header("content-type", "application/json")
				.body(Body::from(
					json!({"resolution": "keep_remote", "resolvedBy": "operator"}).to_string(),
				))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	let doc = master
		.cms
		.get_document(ARTICLE, "c1", None)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(doc["title"], "A");
	assert_eq!(ctx.engine.conflicts().pending_count().await.unwrap(), 0);
}
