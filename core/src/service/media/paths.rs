//! URL and object-path mapping
//!
//! Canonical object paths never carry a store prefix. The shore store may
//! prefix its keys (e.g. `uploads/`); the prefix is restored when writing
//! shoreward and stripped when mirroring shipward. All mappings are
//! idempotent on already-prefixed input.

use crate::config::MediaStoreConfig;

/// One store's public address scheme
#[derive(Debug, Clone)]
pub struct StoreLocation {
	base_url: String,
	upload_path: Option<String>,
}

impl StoreLocation {
	pub fn new(base_url: &str, upload_path: Option<&str>) -> Self {
		Self {
			base_url: base_url.trim_end_matches('/').to_string(),
			upload_path: upload_path
				.map(|p| p.trim_matches('/').to_string())
				.filter(|p| !p.is_empty()),
		}
	}

	pub fn from_config(config: &MediaStoreConfig) -> Self {
		Self::new(&config.base_url, config.upload_path.as_deref())
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	/// Storage key for a canonical path, prefix restored when configured.
	/// A path that already carries the prefix is left alone.
	pub fn object_key(&self, path: &str) -> String {
		let path = path.trim_start_matches('/');
		match &self.upload_path {
			Some(prefix) => {
				if path.starts_with(&format!("{prefix}/")) {
					path.to_string()
				} else {
					format!("{prefix}/{path}")
				}
			}
			None => path.to_string(),
		}
	}

	/// Canonical path for a storage key, prefix stripped when configured.
	pub fn canonical_path(&self, key: &str) -> String {
		let key = key.trim_start_matches('/');
		match &self.upload_path {
			Some(prefix) => key
				.strip_prefix(&format!("{prefix}/"))
				.unwrap_or(key)
				.to_string(),
			None => key.to_string(),
		}
	}

	/// Public URL for a canonical path.
	pub fn object_url(&self, path: &str) -> String {
		format!("{}/{}", self.base_url, self.object_key(path))
	}

	/// Canonical path for a URL under this store's base; None for foreign
	/// URLs.
	pub fn url_to_object_path(&self, url: &str) -> Option<String> {
		let rest = url.strip_prefix(&self.base_url)?;
		let key = rest.trim_start_matches('/');
		if key.is_empty() {
			return None;
		}
		Some(self.canonical_path(key))
	}
}

/// Best-effort MIME type from the path extension.
pub fn guess_mime(path: &str) -> &'static str {
	let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
	match ext.as_str() {
		"jpg" | "jpeg" => "image/jpeg",
		"png" => "image/png",
		"gif" => "image/gif",
		"webp" => "image/webp",
		"svg" => "image/svg+xml",
		"mp4" => "video/mp4",
		"mov" => "video/quicktime",
		"webm" => "video/webm",
		"mp3" => "audio/mpeg",
		"pdf" => "application/pdf",
		_ => "application/octet-stream",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn master() -> StoreLocation {
		StoreLocation::new("https://oss.example", Some("uploads"))
	}

	fn local() -> StoreLocation {
		StoreLocation::new("http://minio.local/media/", None)
	}

	#[test]
	fn url_round_trips_to_canonical_path_on_both_stores() {
		let path = "img.jpg";
		assert_eq!(
			master().url_to_object_path(&master().object_url(path)),
			Some(path.to_string())
		);
		assert_eq!(
			local().url_to_object_path(&local().object_url(path)),
			Some(path.to_string())
		);
	}

	#[test]
	fn prefix_restoration_is_idempotent() {
		let loc = master();
		assert_eq!(loc.object_key("img.jpg"), "uploads/img.jpg");
		assert_eq!(loc.object_key("uploads/img.jpg"), "uploads/img.jpg");
		assert_eq!(loc.canonical_path("uploads/img.jpg"), "img.jpg");
		assert_eq!(loc.canonical_path("img.jpg"), "img.jpg");
	}

	#[test]
	fn nested_paths_keep_their_directories() {
		let loc = master();
		assert_eq!(
			loc.object_url("2026/07/cover.png"),
			"https://oss.example/uploads/2026/07/cover.png"
		);
		assert_eq!(
			loc.url_to_object_path("https://oss.example/uploads/2026/07/cover.png"),
			Some("2026/07/cover.png".to_string())
		);
	}

	#[test]
	fn foreign_urls_do_not_map() {
		assert_eq!(master().url_to_object_path("https://elsewhere.example/x.png"), None);
		assert_eq!(master().url_to_object_path("https://oss.example"), None);
	}

	#[test]
	fn mime_guesses_common_types() {
		assert_eq!(guess_mime("a/b/photo.JPG"), "image/jpeg");
		assert_eq!(guess_mime("clip.mp4"), "video/mp4");
		assert_eq!(guess_mime("blob"), "application/octet-stream");
	}
}
