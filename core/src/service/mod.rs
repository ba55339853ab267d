//! Long-running services

use anyhow::Result;
use async_trait::async_trait;

pub mod api;
pub mod media;
pub mod sync;

/// A background service with a start/stop lifecycle.
#[async_trait]
pub trait Service: Send + Sync {
	fn name(&self) -> &'static str;

	fn is_running(&self) -> bool;

	async fn start(&self) -> Result<()>;

	async fn stop(&self) -> Result<()>;
}
