//! Media mirroring through the full engine: shore objects are pulled into
//! the ship bucket on receive, ship objects are pushed shoreward with file
//! records that the master folds into its CMS.

mod helpers;

use helpers::*;
use hawser_core::cms::WriteContext;
use hawser_core::ContentStore;
use hawser_core::config::NodeMode;
use hawser_core::infra::bus::MemoryBus;
use hawser_core::service::media::{MediaStores, MemoryObjectStore, ObjectStore, StoreLocation};
use serde_json::json;
use std::sync::Arc;

const SHORE_BASE: &str = "https://oss.example";
const SHIP_BASE: &str = "http://minio.local/media";

fn stores_for(
	shore: &Arc<MemoryObjectStore>,
	ship: &Arc<MemoryObjectStore>,
) -> MediaStores {
	MediaStores {
		master: shore.clone(),
		master_location: StoreLocation::new(SHORE_BASE, Some("uploads")),
		local: ship.clone(),
		local_location: StoreLocation::new(SHIP_BASE, None),
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn media_moves_both_ways_through_the_engine() {
	init_test_tracing();

	let shore_store = Arc::new(MemoryObjectStore::new());
	let ship_store = Arc::new(MemoryObjectStore::new());

	let bus = MemoryBus::new();
	let master = build_node(
		&bus,
		NodeMode::Master,
		"master",
		Some(stores_for(&shore_store, &shore_store)),
	)
	.await;
	let replica = build_node(
		&bus,
		NodeMode::Replica,
		"ship-aurora",
		Some(stores_for(&shore_store, &ship_store)),
	)
	.await;
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

	// Shoreward-published content references an object in the shore bucket
	shore_store
		.put_object("uploads/img.jpg", b"jpeg-bytes", Some("image/jpeg"))
		.await
		.unwrap();

	master
		.cms
		.create_document(
			&WriteContext::local(),
			ARTICLE,
			"m1",
			None,
			json!({"cover": format!("{SHORE_BASE}/uploads/img.jpg")}),
		)
		.await
		.unwrap();

	let replica_cms = replica.cms.clone();
	wait_until("replica applied with a local URL", 6_000, || {
		let cms = replica_cms.clone();
		async move {
			cms.get_document(ARTICLE, "m1", None)
				.await
				.unwrap()
				.is_some_and(|doc| doc["cover"] == format!("{SHIP_BASE}/img.jpg"))
		}
	})
	.await;

	// The object landed in the ship bucket, prefix stripped
	assert!(ship_store.stat_object("img.jpg").await.unwrap().is_some());

	// Shipward-created content references a local object
	ship_store
		.put_object("new.png", b"png-bytes", Some("image/png"))
		.await
		.unwrap();

	replica
		.cms
		.create_document(
			&WriteContext::local(),
			ARTICLE,
			"r1",
			None,
			json!({
				"title": "from ship",
				"photo": {
					"id": 12,
					"hash": "ship_hash_1",
					"url": format!("{SHIP_BASE}/new.png")
				}
			}),
		)
		.await
		.unwrap();

	let master_cms = master.cms.clone();
	wait_until("master applied the ship edit", 6_000, || {
		let cms = master_cms.clone();
		async move { cms.get_document(ARTICLE, "r1", None).await.unwrap().is_some() }
	})
	.await;

	// Uploaded shoreward under the configured prefix
	assert!(shore_store
		.stat_object("uploads/new.png")
		.await
		.unwrap()
		.is_some());

	// The file record materialized a CMS file row, and the in-payload
	// reference now carries the master-side id and URL
	let file_row = master
		.cms
		.find_file_by_hash("ship_hash_1")
		.await
		.unwrap()
		.expect("file row created from the record");

	let doc = master
		.cms
		.get_document(ARTICLE, "r1", None)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(doc["photo"]["id"], file_row.id);
	assert_eq!(doc["photo"]["url"], format!("{SHORE_BASE}/uploads/new.png"));

	// Pushing the same content again reuses the existing row
	replica
		.cms
		.update_document(
			&WriteContext::local(),
			ARTICLE,
			"r1",
			None,
			json!({
				"title": "from ship, edited",
				"photo": {
					"id": 12,
					"hash": "ship_hash_1",
					"url": format!("{SHIP_BASE}/new.png")
				}
			}),
		)
		.await
		.unwrap();

	wait_until("master applied the second edit", 6_000, || {
		let cms = master_cms.clone();
		async move {
			cms.get_document(ARTICLE, "r1", None)
				.await
				.unwrap()
				.is_some_and(|doc| doc["title"] == "from ship, edited")
		}
	})
	.await;

	let doc = master
		.cms
		.get_document(ARTICLE, "r1", None)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(doc["photo"]["id"], file_row.id);

	replica.stop().await;
	master.stop().await;
}
