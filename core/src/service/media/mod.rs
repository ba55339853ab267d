//! Media mirror
//!
//! Moves binary media between the shore store and the ship store on demand,
//! driven by the messages passing through the engine rather than by bulk
//! scans. Shipward: incoming payload URLs under the shore base are fetched
//! into the local bucket and rewritten. Shoreward: locally created objects
//! are uploaded before the push and described as file records so the master
//! can materialize CMS file rows without re-reading the bytes.
//!
//! Media failures are logged and never fail the surrounding apply or push.

use crate::cms::{ContentStore, FileRecord};
use crate::config::{MediaConfig, NodeMode};
use crate::infra::payload::{
	collect_urls, replace_in_strings, rewrite_file_ids, MAX_TRAVERSAL_DEPTH,
};
use crate::service::sync::metrics::SyncMetrics;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod paths;
pub mod store;

pub use paths::{guess_mime, StoreLocation};
pub use store::{MediaError, MemoryObjectStore, ObjectStore, S3ObjectStore};

/// Result of mirroring one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncObjectOutcome {
	Copied,
	Skipped,
	Failed(String),
}

/// The two stores a mirror runs between, handed to the bootstrap.
pub struct MediaStores {
	pub master: Arc<dyn ObjectStore>,
	pub master_location: StoreLocation,
	pub local: Arc<dyn ObjectStore>,
	pub local_location: StoreLocation,
}

pub struct MediaMirror {
	role: NodeMode,
	master: Arc<dyn ObjectStore>,
	master_loc: StoreLocation,
	local: Arc<dyn ObjectStore>,
	local_loc: StoreLocation,
	cms: Arc<dyn ContentStore>,
	transform_urls: bool,
	max_files_per_sync: usize,
	metrics: Arc<SyncMetrics>,
}

impl MediaMirror {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		role: NodeMode,
		master: Arc<dyn ObjectStore>,
		master_loc: StoreLocation,
		local: Arc<dyn ObjectStore>,
		local_loc: StoreLocation,
		cms: Arc<dyn ContentStore>,
		config: &MediaConfig,
		metrics: Arc<SyncMetrics>,
	) -> Self {
		Self {
			role,
			master,
			master_loc,
			local,
			local_loc,
			cms,
			transform_urls: config.transform_urls,
			max_files_per_sync: config.max_files_per_sync,
			metrics,
		}
	}

	pub fn master_location(&self) -> &StoreLocation {
		&self.master_loc
	}

	pub fn local_location(&self) -> &StoreLocation {
		&self.local_loc
	}

	/// Create the ship-side bucket when it does not exist yet.
	pub async fn ensure_local_bucket(&self) -> Result<(), MediaError> {
		if !self.local.bucket_exists().await? {
			info!("Creating local media bucket");
			self.local.make_bucket().await?;
		}
		Ok(())
	}

	/// Normalized object paths for every URL under `location`'s base found
	/// anywhere in the payload.
	pub fn extract_object_paths(&self, data: &Value, location: &StoreLocation) -> Vec<String> {
		collect_urls(data, location.base_url())
			.into_iter()
			.filter_map(|url| location.url_to_object_path(&url))
			.collect()
	}

	/// Copy one object shipward if it is not already present locally.
	pub async fn sync_object(&self, path: &str) -> SyncObjectOutcome {
		match self.local.stat_object(path).await {
			Ok(Some(_)) => return SyncObjectOutcome::Skipped,
			Ok(None) => {}
			Err(e) => return SyncObjectOutcome::Failed(e.to_string()),
		}

		let master_key = self.master_loc.object_key(path);
		let content = match self.master.get_object(&master_key).await {
			Ok(content) => content,
			Err(e) => return SyncObjectOutcome::Failed(e.to_string()),
		};

		if let Err(e) = self
			.local
			.put_object(path, &content.bytes, content.content_type.as_deref())
			.await
		{
			return SyncObjectOutcome::Failed(e.to_string());
		}

		self.metrics.media_objects_copied.increment();
		debug!(path, bytes = content.bytes.len(), "Mirrored object shipward");
		SyncObjectOutcome::Copied
	}

	/// Shipward pass over an incoming payload: ensure every object under the
	/// shore base exists locally, then rewrite those URLs to the local base.
	/// Objects that fail keep their shore URL so nothing dangles.
	pub async fn sync_content_media(&self, data: &Value) -> Value {
		let mut urls = collect_urls(data, self.master_loc.base_url());
		if urls.is_empty() {
			return data.clone();
		}
		if self.max_files_per_sync > 0 && urls.len() > self.max_files_per_sync {
			warn!(
				found = urls.len(),
				cap = self.max_files_per_sync,
				"Media cap reached; excess objects keep their shore URLs this pass"
			);
			urls.truncate(self.max_files_per_sync);
		}

		let mut replacements = HashMap::new();
		for url in urls {
			let Some(path) = self.master_loc.url_to_object_path(&url) else {
				continue;
			};
			match self.sync_object(&path).await {
				SyncObjectOutcome::Copied | SyncObjectOutcome::Skipped => {
					if self.transform_urls {
						replacements.insert(url, self.local_loc.object_url(&path));
					}
				}
				SyncObjectOutcome::Failed(reason) => {
					warn!(url = %url, reason, "Object mirror failed; keeping shore URL");
				}
			}
		}

		if replacements.is_empty() {
			data.clone()
		} else {
			replace_in_strings(data, &replacements)
		}
	}

	/// Shoreward pass before a push: upload local objects the master does
	/// not have, rewrite payload URLs to the shore base, and emit file
	/// records describing the uploads.
	pub async fn prepare_for_push(&self, data: &Value) -> (Value, Vec<FileRecord>) {
		let urls = collect_urls(data, self.local_loc.base_url());
		if urls.is_empty() {
			return (data.clone(), Vec::new());
		}

		let file_objects = collect_file_objects(data);
		let mut replacements = HashMap::new();
		let mut records = Vec::new();

		for url in urls {
			let Some(path) = self.local_loc.url_to_object_path(&url) else {
				continue;
			};
			let master_key = self.master_loc.object_key(&path);

			let already_there = match self.master.stat_object(&master_key).await {
				Ok(stat) => stat.is_some(),
				Err(e) => {
					warn!(url = %url, error = %e, "Shore stat failed; keeping local URL");
					continue;
				}
			};

			let content = match self.local.get_object(&path).await {
				Ok(content) => content,
				Err(e) => {
					warn!(url = %url, error = %e, "Local object unreadable; keeping local URL");
					continue;
				}
			};

			if !already_there {
				if let Err(e) = self
					.master
					.put_object(&master_key, &content.bytes, content.content_type.as_deref())
					.await
				{
					warn!(url = %url, error = %e, "Shore upload failed; keeping local URL");
					continue;
				}
				self.metrics.media_objects_copied.increment();
				debug!(path = %path, bytes = content.bytes.len(), "Uploaded object shoreward");
			}

			if self.transform_urls {
				replacements.insert(url.clone(), self.master_loc.object_url(&path));
			}
			records.push(self.build_file_record(&path, &url, &content.bytes, &file_objects));
		}

		let rewritten = if replacements.is_empty() {
			data.clone()
		} else {
			replace_in_strings(data, &replacements)
		};
		(rewritten, records)
	}

	/// Describe one uploaded object. CMS metadata carried by an embedded
	/// file object (id, hash, dimensions, captions) is reused so the hash
	/// stays stable across pushes; otherwise the content hash stands in.
	fn build_file_record(
		&self,
		path: &str,
		local_url: &str,
		bytes: &[u8],
		file_objects: &[Map<String, Value>],
	) -> FileRecord {
		let embedded = file_objects
			.iter()
			.find(|obj| obj.get("url").and_then(Value::as_str) == Some(local_url));

		let get_str = |key: &str| {
			embedded
				.and_then(|o| o.get(key))
				.and_then(Value::as_str)
				.map(str::to_string)
		};
		let get_i64 = |key: &str| embedded.and_then(|o| o.get(key)).and_then(Value::as_i64);

		let name = path.rsplit('/').next().unwrap_or(path).to_string();
		let ext = name.rsplit_once('.').map(|(_, e)| format!(".{e}"));
		let hash = get_str("hash").unwrap_or_else(|| blake3::hash(bytes).to_hex().to_string());

		FileRecord {
			id: get_i64("id").unwrap_or(0),
			document_id: get_str("documentId").unwrap_or_else(|| hash.clone()),
			name: get_str("name").unwrap_or(name),
			hash,
			ext,
			mime: get_str("mime").or_else(|| Some(guess_mime(path).to_string())),
			size: embedded
				.and_then(|o| o.get("size"))
				.and_then(Value::as_f64)
				.or(Some(bytes.len() as f64)),
			url: self.master_loc.object_url(path),
			preview_url: None,
			width: get_i64("width"),
			height: get_i64("height"),
			formats: embedded.and_then(|o| o.get("formats")).cloned(),
			provider: get_str("provider").or_else(|| Some("local".to_string())),
			provider_metadata: embedded.and_then(|o| o.get("provider_metadata")).cloned(),
			folder_path: get_str("folderPath"),
			alternative_text: get_str("alternativeText"),
			caption: get_str("caption"),
		}
	}

	/// Master side: materialize CMS file rows for replica uploads, reusing
	/// any row that already carries the same hash. Returns replica id to
	/// master id.
	pub async fn process_replica_file_records(&self, records: &[FileRecord]) -> HashMap<i64, i64> {
		let mut mapping = HashMap::new();
		for record in records {
			if record.hash.is_empty() {
				continue;
			}
			let master_id = match self.cms.find_file_by_hash(&record.hash).await {
				Ok(Some(existing)) => existing.id,
				Ok(None) => match self.cms.create_file(record).await {
					Ok(created) => {
						debug!(hash = %record.hash, id = created.id, "Created file row");
						created.id
					}
					Err(e) => {
						warn!(hash = %record.hash, error = %e, "File row creation failed");
						continue;
					}
				},
				Err(e) => {
					warn!(hash = %record.hash, error = %e, "File row lookup failed");
					continue;
				}
			};
			if record.id != 0 {
				mapping.insert(record.id, master_id);
			}
		}
		mapping
	}

	/// Rewrite in-payload file references to their master-side ids.
	pub fn update_content_file_ids(&self, data: &Value, mapping: &HashMap<i64, i64>) -> Value {
		rewrite_file_ids(data, mapping)
	}

	/// Role-aware hook run on every incoming payload before it reaches the
	/// CMS. Never fails the apply.
	pub async fn prepare_incoming(
		&self,
		data: &Value,
		file_records: Option<&[FileRecord]>,
	) -> Value {
		match self.role {
			NodeMode::Replica => self.sync_content_media(data).await,
			NodeMode::Master => match file_records {
				Some(records) if !records.is_empty() => {
					let mapping = self.process_replica_file_records(records).await;
					self.update_content_file_ids(data, &mapping)
				}
				_ => data.clone(),
			},
		}
	}
}

/// Objects that look like CMS file entries: a string `url` next to a string
/// `hash`. Depth-bounded like every payload traversal.
fn collect_file_objects(value: &Value) -> Vec<Map<String, Value>> {
	let mut found = Vec::new();
	collect_file_objects_at(value, 0, &mut found);
	found
}

fn collect_file_objects_at(value: &Value, depth: usize, found: &mut Vec<Map<String, Value>>) {
	if depth >= MAX_TRAVERSAL_DEPTH {
		return;
	}
	match value {
		Value::Object(map) => {
			if map.get("url").is_some_and(Value::is_string)
				&& map.get("hash").is_some_and(Value::is_string)
			{
				found.push(map.clone());
			}
			for child in map.values() {
				collect_file_objects_at(child, depth + 1, found);
			}
		}
		Value::Array(items) => {
			for item in items {
				collect_file_objects_at(item, depth + 1, found);
			}
		}
		_ => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cms::MemoryContentStore;
	use serde_json::json;

	fn mirror(role: NodeMode) -> (MediaMirror, Arc<MemoryObjectStore>, Arc<MemoryObjectStore>) {
		let master = Arc::new(MemoryObjectStore::new());
		let local = Arc::new(MemoryObjectStore::new());
		let cms = MemoryContentStore::new(["api::article.article"]);
		let config = MediaConfig {
			enabled: true,
			master_store: None,
			local_store: None,
			transform_urls: true,
			max_files_per_sync: 0,
			disable_full_sync: false,
		};
		let mirror = MediaMirror::new(
			role,
			master.clone(),
			StoreLocation::new("https://oss.example", Some("uploads")),
			local.clone(),
			StoreLocation::new("http://minio.local/media", None),
			cms,
			&config,
			Arc::new(SyncMetrics::default()),
		);
		(mirror, master, local)
	}

	#[tokio::test]
	async fn incoming_payload_objects_are_mirrored_and_rewritten() {
		let (mirror, master, local) = mirror(NodeMode::Replica);
		master
			.put_object("uploads/img.jpg", b"jpeg-bytes", Some("image/jpeg"))
			.await
			.unwrap();

		let payload = json!({
			"title": "post",
			"cover": "https://oss.example/uploads/img.jpg"
		});

		let rewritten = mirror.sync_content_media(&payload).await;
		assert_eq!(rewritten["cover"], "http://minio.local/media/img.jpg");

		// Stored locally without the shore prefix
		let stat = local.stat_object("img.jpg").await.unwrap().unwrap();
		assert_eq!(stat.size, 10);

		// Second pass skips the copy but still rewrites
		let again = mirror.sync_content_media(&payload).await;
		assert_eq!(again["cover"], "http://minio.local/media/img.jpg");
	}

	#[tokio::test]
	async fn object_paths_extract_normalized_from_either_base() {
		let (mirror, _master, _local) = mirror(NodeMode::Replica);
		let payload = json!({
			"cover": "https://oss.example/uploads/a.jpg",
			"body": "inline <img src=\"https://oss.example/uploads/2026/b.png\"> and http://minio.local/media/c.gif",
			"other": "https://elsewhere.example/d.jpg"
		});

		let master_loc = mirror.master_location().clone();
		let shoreward = mirror.extract_object_paths(&payload, &master_loc);
		assert_eq!(shoreward, vec!["a.jpg", "2026/b.png"]);

		let local_loc = mirror.local_location().clone();
		let shipward = mirror.extract_object_paths(&payload, &local_loc);
		assert_eq!(shipward, vec!["c.gif"]);
	}

	#[tokio::test]
	async fn missing_shore_objects_keep_their_urls() {
		let (mirror, _master, _local) = mirror(NodeMode::Replica);
		let payload = json!({"cover": "https://oss.example/uploads/ghost.png"});

		let rewritten = mirror.sync_content_media(&payload).await;
		assert_eq!(rewritten["cover"], "https://oss.example/uploads/ghost.png");
	}

	#[tokio::test]
	async fn push_uploads_with_prefix_and_emits_records() {
		let (mirror, master, local) = mirror(NodeMode::Replica);
		local
			.put_object("new.png", b"png-bytes", Some("image/png"))
			.await
			.unwrap();

		let payload = json!({
			"title": "from ship",
			"photo": {
				"id": 12,
				"hash": "ship_hash_1",
				"url": "http://minio.local/media/new.png",
				"width": 640,
				"height": 480
			}
		});

		let (rewritten, records) = mirror.prepare_for_push(&payload).await;

		// Uploaded under the shore prefix
		assert!(master
			.stat_object("uploads/new.png")
			.await
			.unwrap()
			.is_some());

		assert_eq!(
			rewritten["photo"]["url"],
			"https://oss.example/uploads/new.png"
		);

		assert_eq!(records.len(), 1);
		let record = &records[0];
		assert_eq!(record.id, 12);
		assert_eq!(record.hash, "ship_hash_1");
		assert_eq!(record.width, Some(640));
		assert_eq!(record.url, "https://oss.example/uploads/new.png");

		// Re-pushing is idempotent: object already on shore, hash stable
		let (_, records_again) = mirror.prepare_for_push(&payload).await;
		assert_eq!(records_again[0].hash, "ship_hash_1");
	}

	#[tokio::test]
	async fn master_reuses_file_rows_by_hash() {
		let (mirror, _master, _local) = mirror(NodeMode::Master);

		let record = FileRecord {
			id: 12,
			document_id: "f-1".to_string(),
			name: "new.png".to_string(),
			hash: "ship_hash_1".to_string(),
			ext: Some(".png".to_string()),
			mime: Some("image/png".to_string()),
			size: Some(9.0),
			url: "https://oss.example/uploads/new.png".to_string(),
			preview_url: None,
			width: None,
			height: None,
			formats: None,
			provider: Some("local".to_string()),
			provider_metadata: None,
			folder_path: None,
			alternative_text: None,
			caption: None,
		};

		let first = mirror.process_replica_file_records(&[record.clone()]).await;
		let master_id = first[&12];

		// Same hash from another push maps to the same row
		let mut again = record.clone();
		again.id = 77;
		let second = mirror.process_replica_file_records(&[again]).await;
		assert_eq!(second[&77], master_id);

		let payload = json!({"photo": {"id": 77, "hash": "ship_hash_1", "url": "u"}});
		let rewritten = mirror.update_content_file_ids(&payload, &second);
		assert_eq!(rewritten["photo"]["id"], master_id);
	}
}
