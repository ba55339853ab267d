//! Engine counters
//!
//! Cheap atomic counters surfaced by the status endpoint. These never gate
//! behavior; they exist so an operator can see at a glance whether a ship
//! is moving data or silently failing.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
	pub fn increment(&self) {
		self.0.fetch_add(1, Ordering::Relaxed);
	}

	pub fn add(&self, n: u64) {
		self.0.fetch_add(n, Ordering::Relaxed);
	}

	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
	pub messages_sent: Counter,
	pub messages_applied: Counter,
	pub duplicates_dropped: Counter,
	pub conflicts_detected: Counter,
	pub dead_letters: Counter,
	pub media_objects_copied: Counter,
	pub push_failures: Counter,
}

/// Point-in-time copy for serialization
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
	pub messages_sent: u64,
	pub messages_applied: u64,
	pub duplicates_dropped: u64,
	pub conflicts_detected: u64,
	pub dead_letters: u64,
	pub media_objects_copied: u64,
	pub push_failures: u64,
}

impl SyncMetrics {
	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			messages_sent: self.messages_sent.get(),
			messages_applied: self.messages_applied.get(),
			duplicates_dropped: self.duplicates_dropped.get(),
			conflicts_detected: self.conflicts_detected.get(),
			dead_letters: self.dead_letters.get(),
			media_objects_copied: self.media_objects_copied.get(),
			push_failures: self.push_failures.get(),
		}
	}
}
