//! Content-store seam
//!
//! The CMS that owns content-type definitions and document storage is an
//! external collaborator; the engine only depends on this contract. Every
//! write carries a [`WriteContext`] whose origin travels with that one
//! operation - loop prevention is per-operation state, never a process-wide
//! flag - and the store invokes the registered [`DocumentHook`] after each
//! successful mutation, which is how the lifecycle interceptor sees edits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod memory;

pub use memory::MemoryContentStore;

/// Document operation kind, shared by the CMS hook and the wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
	Create,
	Update,
	Delete,
	Publish,
}

impl Operation {
	pub fn as_str(&self) -> &'static str {
		match self {
			Operation::Create => "create",
			Operation::Update => "update",
			Operation::Delete => "delete",
			Operation::Publish => "publish",
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Operation {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"create" => Ok(Operation::Create),
			"update" => Ok(Operation::Update),
			"delete" => Ok(Operation::Delete),
			"publish" => Ok(Operation::Publish),
			other => Err(format!("unknown operation: {other}")),
		}
	}
}

/// Where a document write came from.
///
/// `Remote` writes were applied on behalf of a peer; the interceptor must
/// not propagate them again or the edit loops forever between the topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
	/// A local editor (request path, import script, conflict resolution)
	Local,
	/// Applied from a peer's message
	Remote { peer: String },
}

impl ChangeOrigin {
	pub fn is_remote(&self) -> bool {
		matches!(self, ChangeOrigin::Remote { .. })
	}
}

/// Per-operation write context.
#[derive(Debug, Clone)]
pub struct WriteContext {
	pub origin: ChangeOrigin,
}

impl WriteContext {
	pub fn local() -> Self {
		Self {
			origin: ChangeOrigin::Local,
		}
	}

	pub fn remote(peer: impl Into<String>) -> Self {
		Self {
			origin: ChangeOrigin::Remote { peer: peer.into() },
		}
	}
}

/// Serializable metadata describing an object in either store, used for
/// propagating CMS file relations from ships to shore. `hash` is the
/// de-duplication key on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
	pub id: i64,
	#[serde(rename = "documentId")]
	pub document_id: String,
	pub name: String,
	pub hash: String,
	pub ext: Option<String>,
	pub mime: Option<String>,
	pub size: Option<f64>,
	pub url: String,
	#[serde(rename = "previewUrl")]
	pub preview_url: Option<String>,
	pub width: Option<i64>,
	pub height: Option<i64>,
	/// Rendition name -> `{url, ...}`
	pub formats: Option<Value>,
	pub provider: Option<String>,
	pub provider_metadata: Option<Value>,
	#[serde(rename = "folderPath")]
	pub folder_path: Option<String>,
	#[serde(rename = "alternativeText")]
	pub alternative_text: Option<String>,
	pub caption: Option<String>,
}

/// Content-store errors
#[derive(Debug, Error)]
pub enum CmsError {
	#[error("document not found: {0}")]
	NotFound(String),

	#[error("document already exists: {0}")]
	AlreadyExists(String),

	#[error("unknown content type: {0}")]
	UnknownContentType(String),

	#[error("storage error: {0}")]
	Storage(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// Hook invoked by the store after every successful document mutation.
#[async_trait]
pub trait DocumentHook: Send + Sync {
	async fn after_document_change(&self, event: DocumentEvent);
}

/// What the hook sees for one mutation.
#[derive(Debug, Clone)]
pub struct DocumentEvent {
	pub action: Operation,
	pub content_type: String,
	/// Best-effort id; absent for bulk results
	pub document_id: Option<String>,
	pub locale: Option<String>,
	/// The resulting entity (None for deletes and bulk results)
	pub entry: Option<Value>,
	/// The operation parameters as submitted
	pub params: Option<Value>,
	pub origin: ChangeOrigin,
}

/// Contract the CMS fulfils for the sync engine.
#[async_trait]
pub trait ContentStore: Send + Sync {
	/// Whether this deployment knows the content type at all.
	async fn content_type_exists(&self, content_type: &str) -> Result<bool, CmsError>;

	async fn get_document(
		&self,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
	) -> Result<Option<Value>, CmsError>;

	async fn create_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		data: Value,
	) -> Result<Value, CmsError>;

	async fn update_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		data: Value,
	) -> Result<Value, CmsError>;

	async fn delete_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
	) -> Result<(), CmsError>;

	/// Publish is an upsert with the canonical publish payload.
	async fn publish_document(
		&self,
		ctx: &WriteContext,
		content_type: &str,
		document_id: &str,
		locale: Option<&str>,
		data: Value,
	) -> Result<Value, CmsError>;

	/// File rows, keyed for de-duplication by content hash.
	async fn find_file_by_hash(&self, hash: &str) -> Result<Option<FileRecord>, CmsError>;

	/// Create a file row; the store assigns the id.
	async fn create_file(&self, record: &FileRecord) -> Result<FileRecord, CmsError>;
}
