//! In-memory content store
//!
//! Reference implementation of the CMS contract used by tests and the demo
//! daemon. Documents live in a map keyed by (content_type, document_id,
//! locale); file rows get sequential ids. The registered hook fires after
//! each successful mutation, exactly like a CMS document middleware.

use super::{
	ChangeOrigin, CmsError, ContentStore, DocumentEvent, DocumentHook, FileRecord, Operation,
	WriteContext,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type DocKey = (String, String, Option<String>);

#[derive(Default)]
pub struct MemoryContentStore {
	content_types: RwLock<HashSet<String>>,
	documents: RwLock<HashMap<DocKey, Value>>,
	files: RwLock<Vec<FileRecord>>,
	next_file_id: AtomicI64,
	write_count: AtomicU64,
	hook: RwLock<Option<Arc<dyn DocumentHook>>>,
}

impl MemoryContentStore {
	pub fn new(content_types: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
		let store = Self {
			content_types: RwLock::new(content_types.into_iter().map(Into::into).collect()),
			next_file_id: AtomicI64::new(1),
			..Self::default()
		};
		Arc::new(store)
	}

	/// Register the middleware hook. Done once at bootstrap; the store does
	/// not own the interceptor, it only holds a handle to it.
	pub async fn set_hook(&self, hook: Arc<dyn DocumentHook>) {
		*self.hook.write().await = Some(hook);
	}

	/// Number of successful document writes, for tests asserting that a
	/// duplicate delivery never reached the store.
	pub fn write_count(&self) -> u64 {
		self.write_count.load(Ordering::SeqCst)
	}

	pub async fn document_count(&self) -> usize {
		self.documents.read().await.len()
	}

	fn key(content_type: &str, document_id: &str, locale: Option<&str>) -> DocKey {
		(
			content_type.to_string(),
			document_id.to_string(),
			locale.map(str::to_string),
		)
	}

	fn describe(content_type: &str, document_id: &str) -> String {
		format!("{content_type}/{document_id}")
	}

	/// Stamp the document id into the stored entity, the way a CMS exposes
	/// its own identifier on every returned entry.
	fn with_document_id(mut data: Value, document_id: &str) -> Value {
		if let Some(map) = data.as_object_mut() {
			map.entry("documentId".to_string())
				.or_insert_with(|| Value::String(document_id.to_string()));
		}
		data
	}

	async fn fire_hook(
		&self,
		action: Operation,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		entry: Option<Value>,
		origin: &ChangeOrigin,
	) {
		let hook = { self.hook.read().await.clone() };
		if let Some(hook) = hook {
			hook.after_document_change(DocumentEvent {
				action,
				content_type: content_type.to_string(),
				document_id: Some(document_id.to_string()),
				locale: locale.map(str::to_string),
				entry,
				params: None,
				origin: origin.clone(),
			})
			.await;
		}
	}

	async fn ensure_content_type(&self, content_type: &str) -> Result<(), CmsError> {
		if self.content_types.read().await.contains(content_type) {
			Ok(())
		} else {
			Err(CmsError::UnknownContentType(content_type.to_string()))
		}
	}
}

#[async_trait]
impl ContentStore for MemoryContentStore {
	async fn content_type_exists(&self, content_type: &str) -> Result<bool, CmsError> {
		Ok(self.content_types.read().await.contains(content_type))
	}

	async fn get_document(
		&self,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
	) -> Result<Option<Value>, CmsError> {
		let documents = self.documents.read().await;
		Ok(documents
			.get(&Self::key(content_type, document_id, locale))
			.cloned())
	}

	async fn create_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		data: Value,
	) -> Result<Value, CmsError> {
		self.ensure_content_type(content_type).await?;
		let stored = Self::with_document_id(data, document_id);
		{
			let mut documents = self.documents.write().await;
			let key = Self::key(content_type, document_id, locale);
			if documents.contains_key(&key) {
				return Err(CmsError::AlreadyExists(Self::describe(
					content_type,
					document_id,
				)));
			}
			documents.insert(key, stored.clone());
		}
		self.write_count.fetch_add(1, Ordering::SeqCst);
		self.fire_hook(
			Operation::Create,
			content_type,
			document_id,
			locale,
			Some(stored.clone()),
			&ctx.origin,
		)
		.await;
		Ok(stored)
	}

	async fn update_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		data: Value,
	) -> Result<Value, CmsError> {
		self.ensure_content_type(content_type).await?;
		let stored = Self::with_document_id(data, document_id);
		{
			let mut documents = self.documents.write().await;
			let key = Self::key(content_type, document_id, locale);
			if !documents.contains_key(&key) {
				return Err(CmsError::NotFound(Self::describe(content_type, document_id)));
			}
			documents.insert(key, stored.clone());
		}
		self.write_count.fetch_add(1, Ordering::SeqCst);
		self.fire_hook(
			Operation::Update,
			content_type,
			document_id,
			locale,
			Some(stored.clone()),
			&ctx.origin,
		)
		.await;
		Ok(stored)
	}

	async fn delete_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
	) -> Result<(), CmsError> {
		self.ensure_content_type(content_type).await?;
		{
			let mut documents = self.documents.write().await;
			if documents
				.remove(&Self::key(content_type, document_id, locale))
				.is_none()
			{
				return Err(CmsError::NotFound(Self::describe(content_type, document_id)));
			}
		}
		self.write_count.fetch_add(1, Ordering::SeqCst);
		self.fire_hook(
			Operation::Delete,
			content_type,
			document_id,
			locale,
			None,
			&ctx.origin,
		)
		.await;
		Ok(())
	}

	async fn publish_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		data: Value,
	) -> Result<Value, CmsError> {
		self.ensure_content_type(content_type).await?;
		let stored = Self::with_document_id(data, document_id);
		{
			let mut documents = self.documents.write().await;
			documents.insert(Self::key(content_type, document_id, locale), stored.clone());
		}
		self.write_count.fetch_add(1, Ordering::SeqCst);
		self.fire_hook(
			Operation::Publish,
			content_type,
			document_id,
			locale,
			Some(stored.clone()),
			&ctx.origin,
		)
		.await;
		Ok(stored)
	}

	async fn find_file_by_hash(&self, hash: &str) -> Result<Option<FileRecord>, CmsError> {
		let files = self.files.read().await;
		Ok(files.iter().find(|f| f.hash == hash).cloned())
	}

	async fn create_file(&self, record: &FileRecord) -> Result<FileRecord, CmsError> {
		let mut created = record.clone();
		created.id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
		self.files.write().await.push(created.clone());
		Ok(created)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tokio::sync::Mutex;

	struct RecordingHook {
		events: Mutex<Vec<DocumentEvent>>,
	}

	#[async_trait]
	impl DocumentHook for RecordingHook {
		async fn after_document_change(&self, event: DocumentEvent) {
			self.events.lock().await.push(event);
		}
	}

	#[tokio::test]
	async fn hook_fires_with_the_operations_origin() {
		let store = MemoryContentStore::new(["api::article.article"]);
		let hook = Arc::new(RecordingHook {
			events: Mutex::new(Vec::new()),
		});
		store.set_hook(hook.clone()).await;

		store
			.create_document(
				&WriteContext::local(),
				"api::article.article",
				"a1",
				None,
				json!({"title": "x"}),
			)
			.await
			.unwrap();

		store
			.update_document(
				&WriteContext::remote("ship-7"),
				"api::article.article",
				"a1",
				None,
				json!({"title": "y"}),
			)
			.await
			.unwrap();

		let events = hook.events.lock().await;
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].origin, ChangeOrigin::Local);
		assert_eq!(
			events[1].origin,
			ChangeOrigin::Remote {
				peer: "ship-7".to_string()
			}
		);
	}

	#[tokio::test]
	async fn create_rejects_duplicates_and_update_rejects_missing() {
		let store = MemoryContentStore::new(["api::page.page"]);
		let ctx = WriteContext::local();

		store
			.create_document(&ctx, "api::page.page", "p1", None, json!({}))
			.await
			.unwrap();
		assert!(matches!(
			store
				.create_document(&ctx, "api::page.page", "p1", None, json!({}))
				.await,
			Err(CmsError::AlreadyExists(_))
		));
		assert!(matches!(
			store
				.update_document(&ctx, "api::page.page", "missing", None, json!({}))
				.await,
			Err(CmsError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn file_rows_deduplicate_by_hash() {
		let store = MemoryContentStore::new(["api::article.article"]);
		let record = FileRecord {
			id: 900,
			document_id: "f1".to_string(),
			name: "img.jpg".to_string(),
			hash: "abc".to_string(),
			ext: Some(".jpg".to_string()),
			mime: Some("image/jpeg".to_string()),
			size: Some(12.5),
			url: "/uploads/img.jpg".to_string(),
			preview_url: None,
			width: Some(64),
			height: Some(64),
			formats: None,
			provider: Some("local".to_string()),
			provider_metadata: None,
			folder_path: Some("/".to_string()),
			alternative_text: None,
			caption: None,
		};

		let created = store.create_file(&record).await.unwrap();
		assert_eq!(created.id, 1);
		let found = store.find_file_by_hash("abc").await.unwrap().unwrap();
		assert_eq!(found.id, 1);
		assert!(store.find_file_by_hash("zzz").await.unwrap().is_none());
	}
}
