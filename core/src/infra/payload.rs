//! Structural traversal over arbitrary content payloads
//!
//! Content documents are duck-typed JSON. Every traversal here is
//! depth-bounded so a pathological payload cannot recurse the worker stack
//! away, and every function returns a new value instead of mutating input.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Nesting deeper than this is passed through untouched.
pub const MAX_TRAVERSAL_DEPTH: usize = 24;

/// Field names never propagated between peers: database ids, CMS-managed
/// timestamps, and the sync bookkeeping itself.
pub const RESERVED_FIELDS: &[&str] = &[
	"id",
	"documentId",
	"createdAt",
	"updatedAt",
	"publishedAt",
	"syncVersion",
	"modifiedByLocation",
	"lastSyncedAt",
	"syncStatus",
	"conflictFlag",
];

/// Substrings that mark a field as sensitive. Matched case-insensitively
/// against the key with separators stripped.
const SENSITIVE_MARKERS: &[&str] = &["password", "token", "secret", "apikey", "credential"];

fn normalized_key(key: &str) -> String {
	key.chars()
		.filter(|c| *c != '_' && *c != '-')
		.collect::<String>()
		.to_ascii_lowercase()
}

/// Whether a field must be stripped before a payload goes on the wire.
pub fn is_sensitive_field(key: &str) -> bool {
	let normalized = normalized_key(key);
	SENSITIVE_MARKERS
		.iter()
		.any(|marker| normalized.contains(marker))
}

/// Returns a copy of `value` with sensitive fields removed by omission,
/// at every nesting level.
pub fn redact_sensitive(value: &Value) -> Value {
	redact_at(value, 0)
}

fn redact_at(value: &Value, depth: usize) -> Value {
	if depth >= MAX_TRAVERSAL_DEPTH {
		return value.clone();
	}
	match value {
		Value::Object(map) => {
			let mut out = Map::with_capacity(map.len());
			for (key, child) in map {
				if is_sensitive_field(key) {
					continue;
				}
				out.insert(key.clone(), redact_at(child, depth + 1));
			}
			Value::Object(out)
		}
		Value::Array(items) => {
			Value::Array(items.iter().map(|item| redact_at(item, depth + 1)).collect())
		}
		other => other.clone(),
	}
}

/// Returns a deep copy with every occurrence of `from` replaced by `to`
/// inside every string, including strings embedded in rich-text blobs.
///
/// Rewriting is involutive for payloads whose URLs are all either
/// `from`-prefixed or `to`-prefixed: applying the reverse rewrite restores
/// the original payload.
pub fn rewrite_urls(value: &Value, from: &str, to: &str) -> Value {
	if from.is_empty() || from == to {
		return value.clone();
	}
	map_strings(value, 0, &|s| {
		if s.contains(from) {
			Some(s.replace(from, to))
		} else {
			None
		}
	})
}

/// Returns a deep copy with every occurrence of each map key replaced by the
/// mapped value, inside every string. Longer sources are applied first so a
/// URL that is a prefix of another cannot clobber it.
pub fn replace_in_strings(value: &Value, replacements: &HashMap<String, String>) -> Value {
	if replacements.is_empty() {
		return value.clone();
	}
	let mut ordered: Vec<(&String, &String)> = replacements.iter().collect();
	ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

	map_strings(value, 0, &|s| {
		let mut current = s.to_string();
		let mut touched = false;
		for (from, to) in &ordered {
			if current.contains(from.as_str()) {
				current = current.replace(from.as_str(), to);
				touched = true;
			}
		}
		touched.then_some(current)
	})
}

fn map_strings(value: &Value, depth: usize, f: &dyn Fn(&str) -> Option<String>) -> Value {
	if depth >= MAX_TRAVERSAL_DEPTH {
		return value.clone();
	}
	match value {
		Value::String(s) => match f(s) {
			Some(replaced) => Value::String(replaced),
			None => value.clone(),
		},
		Value::Object(map) => Value::Object(
			map.iter()
				.map(|(key, child)| (key.clone(), map_strings(child, depth + 1, f)))
				.collect(),
		),
		Value::Array(items) => Value::Array(
			items
				.iter()
				.map(|item| map_strings(item, depth + 1, f))
				.collect(),
		),
		other => other.clone(),
	}
}

/// Collects every URL under `base` found anywhere in the payload, including
/// URLs embedded inside longer strings. Order is first-seen; duplicates are
/// dropped.
pub fn collect_urls(value: &Value, base: &str) -> Vec<String> {
	let mut found = Vec::new();
	if base.is_empty() {
		return found;
	}
	collect_at(value, base, 0, &mut found);
	found
}

fn collect_at(value: &Value, base: &str, depth: usize, found: &mut Vec<String>) {
	if depth >= MAX_TRAVERSAL_DEPTH {
		return;
	}
	match value {
		Value::String(s) => {
			let mut rest = s.as_str();
			while let Some(idx) = rest.find(base) {
				let tail = &rest[idx..];
				let end = tail
					.find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ')' | '>' | ']'))
					.unwrap_or(tail.len());
				let url = tail[..end].trim_end_matches(['.', ',', ';']).to_string();
				if !url.is_empty() && !found.contains(&url) {
					found.push(url);
				}
				rest = &tail[end.min(tail.len())..];
			}
		}
		Value::Object(map) => {
			for child in map.values() {
				collect_at(child, base, depth + 1, found);
			}
		}
		Value::Array(items) => {
			for item in items {
				collect_at(item, base, depth + 1, found);
			}
		}
		_ => {}
	}
}

/// Rewrites file references to their master-side ids. Any object carrying
/// both an integer `id` and a string `hash` is treated as a file reference;
/// its id is swapped when the mapping knows it.
pub fn rewrite_file_ids(value: &Value, mapping: &HashMap<i64, i64>) -> Value {
	if mapping.is_empty() {
		return value.clone();
	}
	rewrite_file_ids_at(value, mapping, 0)
}

fn rewrite_file_ids_at(value: &Value, mapping: &HashMap<i64, i64>, depth: usize) -> Value {
	if depth >= MAX_TRAVERSAL_DEPTH {
		return value.clone();
	}
	match value {
		Value::Object(map) => {
			let mut out: Map<String, Value> = map
				.iter()
				.map(|(key, child)| (key.clone(), rewrite_file_ids_at(child, mapping, depth + 1)))
				.collect();

			let looks_like_file = out.contains_key("hash") && out.get("hash").is_some_and(Value::is_string);
			if looks_like_file {
				if let Some(old_id) = out.get("id").and_then(Value::as_i64) {
					if let Some(new_id) = mapping.get(&old_id) {
						out.insert("id".to_string(), Value::from(*new_id));
					}
				}
			}
			Value::Object(out)
		}
		Value::Array(items) => Value::Array(
			items
				.iter()
				.map(|item| rewrite_file_ids_at(item, mapping, depth + 1))
				.collect(),
		),
		other => other.clone(),
	}
}
