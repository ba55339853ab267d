//! At-least-once delivery: a re-delivered message is absorbed by the
//! processed-message ledger and never reaches the CMS twice.

mod helpers;

use chrono::Utc;
use helpers::*;
use hawser_core::cms::Operation;
use hawser_core::ContentStore;
use hawser_core::infra::bus::{BusTransport, MemoryBus};
use hawser_core::service::sync::SyncMessage;
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_delivery_applies_once() {
	init_test_tracing();

	let bus = MemoryBus::new();
	bus.connect().await.unwrap();
	let master = master_node(&bus).await;
	master.start().await;
	let master_ctx = master.ctx().clone();

	wait_until("master connected", 5_000, || {
		let m = master_ctx.clone();
		async move { m.producer.is_connected() }
	})
	.await;
	// Give the consumer loop a beat to subscribe
	tokio::time::sleep(Duration::from_millis(100)).await;

	// Watch the broadcast direction: an applied ship edit must never be
	// re-propagated to the ships
	let mut broadcast_observer = bus.subscribe("master-updates", "observer").await.unwrap();

	let now = Utc::now();
	let msg = SyncMessage {
		message_id: SyncMessage::compose_id("ship-aurora", now, "d1"),
		ship_id: "ship-aurora".to_string(),
		timestamp: now,
		operation: Operation::Create,
		content_type: ARTICLE.to_string(),
		content_id: "d1".to_string(),
		version: 1,
		data: Some(json!({"title": "only once"})),
		locale: None,
		file_records: None,
	};
	let payload = serde_json::to_vec(&msg).unwrap();

	// The bus re-delivers the exact same record
	bus.publish("ship-updates", "d1", &payload).await.unwrap();
	bus.publish("ship-updates", "d1", &payload).await.unwrap();

	let master_cms = master.cms.clone();
	wait_until("message applied", 6_000, || {
		let cms = master_cms.clone();
		async move { cms.get_document(ARTICLE, "d1", None).await.unwrap().is_some() }
	})
	.await;

	wait_until("duplicate dropped by the ledger", 6_000, || {
		let m = master_ctx.clone();
		async move { m.metrics.snapshot().duplicates_dropped >= 1 }
	})
	.await;

	// One CMS write, one ledger row
	assert_eq!(master.cms.write_count(), 1);
	assert!(master_ctx.dedup.seen(&msg.message_id).await.unwrap());

	// The sender shows up as a live peer
	let session = master_ctx
		.liveness
		.get_status("ship-aurora")
		.await
		.unwrap()
		.unwrap();
	assert!(session.is_online);
	assert!(session.total_syncs >= 1);

	// Loop prevention: the peer-applied edit did not echo back out
	let echo = tokio::time::timeout(
		Duration::from_millis(300),
		broadcast_observer.recv(),
	)
	.await;
	assert!(echo.is_err(), "applied ship edit was re-broadcast: {echo:?}");
	assert_eq!(master_ctx.broadcast.pending_count().await.unwrap(), 0);

	master.stop().await;
}
