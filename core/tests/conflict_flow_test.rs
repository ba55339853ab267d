//! Divergent offline edits on both sides produce a pending conflict instead
//! of a silent overwrite, and manual resolution propagates back out.

mod helpers;

use helpers::*;
use hawser_core::cms::WriteContext;
use hawser_core::ContentStore;
use hawser_core::infra::bus::MemoryBus;
use hawser_core::service::sync::Resolution;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edits_conflict_and_resolve() {
	init_test_tracing();

	let bus = MemoryBus::new();
	let master = master_node(&bus).await;
	let replica = replica_node(&bus, "ship-aurora").await;
	master.start().await;
	replica.start().await;

	let master_ctx = master.ctx().clone();
	let replica_ctx = replica.ctx().clone();

	wait_until("both nodes connected", 5_000, || {
		let m = master_ctx.clone();
		let r = replica_ctx.clone();
		async move { m.producer.is_connected() && r.producer.is_connected() }
	})
	.await;

	// Seed an entity on the master and let it replicate
	master
		.cms
		.create_document(
			&WriteContext::local(),
			ARTICLE,
			"c1",
			None,
			json!({"title": "base"}),
		)
		.await
		.unwrap();

	let replica_cms = replica.cms.clone();
	wait_until("replica received the seed", 6_000, || {
		let cms = replica_cms.clone();
		async move { cms.get_document(ARTICLE, "c1", None).await.unwrap().is_some() }
	})
	.await;

	// Cut the uplink, edit the same entity on both sides
	bus.set_online(false);
	wait_until("both see the outage", 5_000, || {
		let m = master_ctx.clone();
		let r = replica_ctx.clone();
		async move { !m.producer.is_connected() && !r.producer.is_connected() }
	})
	.await;

	master
		.cms
		.update_document(
			&WriteContext::local(),
			ARTICLE,
			"c1",
			None,
			json!({"title": "B"}),
		)
		.await
		.unwrap();
	replica
		.cms
		.update_document(
			&WriteContext::local(),
			ARTICLE,
			"c1",
			None,
			json!({"title": "A"}),
		)
		.await
		.unwrap();

	bus.set_online(true);

	// The replica's push collides with the master's own pending edit
	wait_until("master records the conflict", 6_000, || {
		let m = master_ctx.clone();
		async move { m.engine.conflicts().pending_count().await.unwrap_or(0) == 1 }
	})
	.await;

	let conflicts = master_ctx.engine.conflicts().list_pending().await.unwrap();
	let conflict = &conflicts[0];
	assert_eq!(conflict.content_type, ARTICLE);
	assert_eq!(conflict.entity_id, "c1");
	assert_eq!(conflict.conflict_type, "direct");
	assert_eq!(conflict.conflicting_fields, json!(["title"]));
	assert_eq!(conflict.local_data["title"], "B");
	assert_eq!(conflict.remote_data["title"], "A");

	// The master's own edit was not silently overwritten
	let master_doc = master
		.cms
		.get_document(ARTICLE, "c1", None)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(master_doc["title"], "B");

	// Metadata reflects the conflicted state
	let meta = master_ctx.versions.get(ARTICLE, "c1").await.unwrap().unwrap();
	assert!(meta.conflict_flag);
	assert_eq!(meta.sync_status, "conflict");

	// Resolve for the ship's version; the resolution is a local edit and
	// flows back out to every peer
	master_ctx
		.engine
		.resolve_conflict(conflict.id, Resolution::KeepRemote, None, Some("operator"))
		.await
		.unwrap();

	let master_doc = master
		.cms
		.get_document(ARTICLE, "c1", None)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(master_doc["title"], "A");
	assert_eq!(
		master_ctx.engine.conflicts().pending_count().await.unwrap(),
		0
	);

	let replica_cms = replica.cms.clone();
	wait_until("resolution reached the replica", 6_000, || {
		let cms = replica_cms.clone();
		async move {
			cms.get_document(ARTICLE, "c1", None)
				.await
				.unwrap()
				.is_some_and(|doc| doc["title"] == "A")
		}
	})
	.await;

	replica.stop().await;
	master.stop().await;
}
