//! Object-store seam
//!
//! The minimum client surface the mirror needs, with an S3-compatible
//! implementation (OSS on shore, MinIO on ships, R2 in staging - all speak
//! the same dialect) and an in-memory one for tests.

use crate::config::MediaStoreConfig;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum MediaError {
	#[error("object storage error: {0}")]
	Storage(String),

	#[error("object not found: {0}")]
	NotFound(String),

	#[error("invalid object path: {0}")]
	InvalidPath(String),
}

#[derive(Debug, Clone)]
pub struct ObjectStat {
	pub size: i64,
}

#[derive(Debug, Clone)]
pub struct ObjectContent {
	pub bytes: Vec<u8>,
	pub content_type: Option<String>,
}

/// Minimum object-store contract required by the mirror.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn bucket_exists(&self) -> Result<bool, MediaError>;

	async fn make_bucket(&self) -> Result<(), MediaError>;

	/// None when the object does not exist.
	async fn stat_object(&self, key: &str) -> Result<Option<ObjectStat>, MediaError>;

	async fn get_object(&self, key: &str) -> Result<ObjectContent, MediaError>;

	async fn put_object(
		&self,
		key: &str,
		bytes: &[u8],
		content_type: Option<&str>,
	) -> Result<(), MediaError>;

	/// Keys under a prefix; paginates internally.
	async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, MediaError>;
}

/// S3-compatible store
pub struct S3ObjectStore {
	client: Client,
	bucket: String,
}

impl S3ObjectStore {
	pub fn new(config: &MediaStoreConfig) -> Self {
		let credentials = Credentials::new(
			config.access_key_id.clone(),
			config.secret_access_key.clone(),
			None,
			None,
			"hawser-media",
		);

		let sdk_config = aws_sdk_s3::config::Builder::new()
			.region(Region::new(
				config.region.clone().unwrap_or_else(|| "auto".to_string()),
			))
			.credentials_provider(credentials)
			.endpoint_url(&config.endpoint)
			.force_path_style(true)
			.build();

		Self {
			client: Client::from_conf(sdk_config),
			bucket: config.bucket.clone(),
		}
	}

	fn err(operation: &str, target: &str, error: impl std::fmt::Display) -> MediaError {
		MediaError::Storage(format!("{operation} failed for {target}: {error}"))
	}

	fn normalize(key: &str) -> Result<String, MediaError> {
		let key = key.trim().trim_matches('/');
		if key.is_empty() {
			return Err(MediaError::InvalidPath("empty object key".to_string()));
		}
		Ok(key.to_string())
	}
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
	async fn bucket_exists(&self) -> Result<bool, MediaError> {
		match self.client.head_bucket().bucket(&self.bucket).send().await {
			Ok(_) => Ok(true),
			Err(error) => {
				let service = error.into_service_error();
				if service.is_not_found() {
					Ok(false)
				} else {
					Err(Self::err("head_bucket", &self.bucket, service))
				}
			}
		}
	}

	async fn make_bucket(&self) -> Result<(), MediaError> {
		self.client
			.create_bucket()
			.bucket(&self.bucket)
			.send()
			.await
			.map_err(|e| Self::err("create_bucket", &self.bucket, e))?;
		Ok(())
	}

	async fn stat_object(&self, key: &str) -> Result<Option<ObjectStat>, MediaError> {
		let key = Self::normalize(key)?;
		match self
			.client
			.head_object()
			.bucket(&self.bucket)
			.key(&key)
			.send()
			.await
		{
			Ok(output) => Ok(Some(ObjectStat {
				size: output.content_length().unwrap_or(0),
			})),
			Err(error) => {
				let service = error.into_service_error();
				if service.is_not_found() {
					Ok(None)
				} else {
					Err(Self::err("head_object", &key, service))
				}
			}
		}
	}

	async fn get_object(&self, key: &str) -> Result<ObjectContent, MediaError> {
		let key = Self::normalize(key)?;
		let response = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(&key)
			.send()
			.await
			.map_err(|e| Self::err("get_object", &key, e))?;

		let content_type = response
			.content_type()
			.map(str::trim)
			.filter(|value| !value.is_empty())
			.map(ToOwned::to_owned);

		let payload = response
			.body
			.collect()
			.await
			.map_err(|e| Self::err("get_object_body", &key, e))?;

		Ok(ObjectContent {
			bytes: payload.into_bytes().to_vec(),
			content_type,
		})
	}

	async fn put_object(
		&self,
		key: &str,
		bytes: &[u8],
		content_type: Option<&str>,
	) -> Result<(), MediaError> {
		let key = Self::normalize(key)?;
		let mut request = self
			.client
			.put_object()
			.bucket(&self.bucket)
			.key(&key)
			.body(ByteStream::from(bytes.to_vec()));

		if let Some(content_type) = content_type {
			request = request.content_type(content_type);
		}

		request
			.send()
			.await
			.map_err(|e| Self::err("put_object", &key, e))?;
		Ok(())
	}

	async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, MediaError> {
		let mut keys = Vec::new();
		let mut pages = self
			.client
			.list_objects_v2()
			.bucket(&self.bucket)
			.prefix(prefix)
			.into_paginator()
			.send();

		while let Some(page) = pages.next().await {
			let page = page.map_err(|e| Self::err("list_objects_v2", prefix, e))?;
			keys.extend(
				page.contents()
					.iter()
					.filter_map(|object| object.key())
					.map(str::to_string),
			);
		}
		Ok(keys)
	}
}

/// In-memory store for tests and demos
#[derive(Default)]
pub struct MemoryObjectStore {
	objects: RwLock<HashMap<String, (Vec<u8>, Option<String>)>>,
	bucket_created: AtomicBool,
}

impl MemoryObjectStore {
	pub fn new() -> Self {
		Self {
			bucket_created: AtomicBool::new(true),
			..Self::default()
		}
	}

	/// A store whose bucket does not exist yet.
	pub fn without_bucket() -> Self {
		Self::default()
	}

	pub async fn object_count(&self) -> usize {
		self.objects.read().await.len()
	}
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
	async fn bucket_exists(&self) -> Result<bool, MediaError> {
		Ok(self.bucket_created.load(Ordering::SeqCst))
	}

	async fn make_bucket(&self) -> Result<(), MediaError> {
		self.bucket_created.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn stat_object(&self, key: &str) -> Result<Option<ObjectStat>, MediaError> {
		let objects = self.objects.read().await;
		Ok(objects.get(key.trim_matches('/')).map(|(bytes, _)| ObjectStat {
			size: bytes.len() as i64,
		}))
	}

	async fn get_object(&self, key: &str) -> Result<ObjectContent, MediaError> {
		let objects = self.objects.read().await;
		objects
			.get(key.trim_matches('/'))
			.map(|(bytes, content_type)| ObjectContent {
				bytes: bytes.clone(),
				content_type: content_type.clone(),
			})
			.ok_or_else(|| MediaError::NotFound(key.to_string()))
	}

	async fn put_object(
		&self,
		key: &str,
		bytes: &[u8],
		content_type: Option<&str>,
	) -> Result<(), MediaError> {
		self.objects.write().await.insert(
			key.trim_matches('/').to_string(),
			(bytes.to_vec(), content_type.map(str::to_string)),
		);
		Ok(())
	}

	async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, MediaError> {
		let objects = self.objects.read().await;
		let mut keys: Vec<String> = objects
			.keys()
			.filter(|key| key.starts_with(prefix))
			.cloned()
			.collect();
		keys.sort();
		Ok(keys)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn memory_store_round_trips_objects() {
		let store = MemoryObjectStore::new();
		assert!(store.bucket_exists().await.unwrap());
		assert!(store.stat_object("a/b.png").await.unwrap().is_none());

		store
			.put_object("a/b.png", b"bytes", Some("image/png"))
			.await
			.unwrap();

		let stat = store.stat_object("a/b.png").await.unwrap().unwrap();
		assert_eq!(stat.size, 5);

		let content = store.get_object("a/b.png").await.unwrap();
		assert_eq!(content.bytes, b"bytes");
		assert_eq!(content.content_type.as_deref(), Some("image/png"));

		assert_eq!(store.list_objects("a/").await.unwrap(), vec!["a/b.png"]);
		assert!(store.list_objects("z/").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn missing_bucket_can_be_created() {
		let store = MemoryObjectStore::without_bucket();
		assert!(!store.bucket_exists().await.unwrap());
		store.make_bucket().await.unwrap();
		assert!(store.bucket_exists().await.unwrap());
	}
}
