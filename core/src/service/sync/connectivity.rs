//! Connectivity monitor (replica side)
//!
//! Periodically probes the bus (and optionally the master's HTTP health
//! endpoint) with bounded timeouts. An offline-to-online transition fires
//! the registered reconnect callbacks and a `ConnectivityChanged` event.

use crate::infra::bus::BusTransport;
use crate::infra::event_bus::{SyncEvent, SyncEventBus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Bound on a single probe, bus or HTTP.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe history
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
	pub is_online: bool,
	pub last_checked: Option<DateTime<Utc>>,
	pub last_success: Option<DateTime<Utc>>,
	pub last_failure: Option<DateTime<Utc>>,
	pub consecutive_failures: u32,
	pub consecutive_successes: u32,
}

type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ConnectivityMonitor {
	transport: Arc<dyn BusTransport>,
	health_url: Option<String>,
	http: reqwest::Client,
	state: RwLock<ConnectivityState>,
	callbacks: RwLock<Vec<ReconnectCallback>>,
	events: Arc<SyncEventBus>,
}

impl ConnectivityMonitor {
	pub fn new(
		transport: Arc<dyn BusTransport>,
		health_url: Option<String>,
		events: Arc<SyncEventBus>,
	) -> Self {
		Self {
			transport,
			health_url,
			http: reqwest::Client::new(),
			state: RwLock::new(ConnectivityState::default()),
			callbacks: RwLock::new(Vec::new()),
			events,
		}
	}

	/// Register a callback fired on every offline-to-online transition.
	pub async fn on_reconnect<F>(&self, callback: F)
	where
		F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
	{
		self.callbacks.write().await.push(Arc::new(callback));
	}

	pub async fn state(&self) -> ConnectivityState {
		self.state.read().await.clone()
	}

	pub async fn is_online(&self) -> bool {
		self.state.read().await.is_online
	}

	/// Run one probe and update state. Returns the new online flag.
	pub async fn check_connectivity(&self) -> bool {
		let bus_up = tokio::time::timeout(PROBE_TIMEOUT, self.transport.probe())
			.await
			.unwrap_or(false);

		let online = if bus_up {
			match &self.health_url {
				Some(url) => self.probe_http(url).await,
				None => true,
			}
		} else {
			false
		};

		let was_online = {
			let mut state = self.state.write().await;
			let now = Utc::now();
			let was_online = state.is_online;
			state.is_online = online;
			state.last_checked = Some(now);
			if online {
				state.last_success = Some(now);
				state.consecutive_successes += 1;
				state.consecutive_failures = 0;
			} else {
				state.last_failure = Some(now);
				state.consecutive_failures += 1;
				state.consecutive_successes = 0;
			}
			was_online
		};

		if online != was_online {
			info!(online, "Connectivity changed");
			self.events.emit(SyncEvent::ConnectivityChanged { online });
		}

		if online && !was_online {
			let callbacks = { self.callbacks.read().await.clone() };
			debug!(count = callbacks.len(), "Firing reconnect callbacks");
			for callback in callbacks {
				callback().await;
			}
		}

		online
	}

	async fn probe_http(&self, url: &str) -> bool {
		match self
			.http
			.get(url)
			.timeout(PROBE_TIMEOUT)
			.send()
			.await
		{
			Ok(response) => response.status().is_success(),
			Err(e) => {
				warn!(url, error = %e, "Health probe failed");
				false
			}
		}
	}

	/// Probe loop. Runs until the shutdown channel fires; every sleep is
	/// cancellable so shutdown never waits out an interval.
	pub async fn run(
		self: Arc<Self>,
		interval: Duration,
		mut shutdown: broadcast::Receiver<()>,
	) {
		info!(interval_ms = interval.as_millis() as u64, "Connectivity monitor started");
		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => {
					self.check_connectivity().await;
				}
				_ = shutdown.recv() => {
					info!("Connectivity monitor stopped");
					return;
				}
			}
		}
	}

	/// Block (cooperatively) until online or the timeout elapses. Returns
	/// whether the bus came up in time.
	pub async fn wait_for_connectivity(
		&self,
		timeout: Duration,
		check_interval: Duration,
	) -> bool {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			if self.check_connectivity().await {
				return true;
			}
			if tokio::time::Instant::now() + check_interval > deadline {
				return false;
			}
			tokio::time::sleep(check_interval).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::bus::MemoryBus;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn monitor_over(bus: &MemoryBus) -> Arc<ConnectivityMonitor> {
		Arc::new(ConnectivityMonitor::new(
			Arc::new(bus.clone()),
			None,
			Arc::new(SyncEventBus::new()),
		))
	}

	#[tokio::test]
	async fn transitions_update_streak_counters() {
		let bus = MemoryBus::new();
		let monitor = monitor_over(&bus);

		assert!(monitor.check_connectivity().await);
		assert!(monitor.check_connectivity().await);
		let state = monitor.state().await;
		assert!(state.is_online);
		assert_eq!(state.consecutive_successes, 2);

		bus.set_online(false);
		assert!(!monitor.check_connectivity().await);
		let state = monitor.state().await;
		assert!(!state.is_online);
		assert_eq!(state.consecutive_failures, 1);
		assert_eq!(state.consecutive_successes, 0);
		assert!(state.last_failure.is_some());
	}

	#[tokio::test]
	async fn reconnect_callbacks_fire_only_on_the_transition() {
		let bus = MemoryBus::new();
		bus.set_online(false);
		let monitor = monitor_over(&bus);

		let fired = Arc::new(AtomicUsize::new(0));
		let fired_clone = fired.clone();
		monitor
			.on_reconnect(move || {
				let fired = fired_clone.clone();
				Box::pin(async move {
					fired.fetch_add(1, Ordering::SeqCst);
				})
			})
			.await;

		monitor.check_connectivity().await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);

		bus.set_online(true);
		monitor.check_connectivity().await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);

		// Staying online does not re-fire
		monitor.check_connectivity().await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn wait_for_connectivity_times_out_while_offline() {
		let bus = MemoryBus::new();
		bus.set_online(false);
		let monitor = monitor_over(&bus);

		let online = monitor
			.wait_for_connectivity(Duration::from_millis(60), Duration::from_millis(20))
			.await;
		assert!(!online);

		bus.set_online(true);
		let online = monitor
			.wait_for_connectivity(Duration::from_millis(60), Duration::from_millis(20))
			.await;
		assert!(online);
	}
}
