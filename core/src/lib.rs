//! Hawser - offline-first CMS replication for intermittently connected fleets
//!
//! A deployment runs in one of two modes:
//! - **master**: the authoritative shore instance. Broadcasts its own edits,
//!   receives edits pushed by ships, arbitrates conflicts, tracks peer liveness.
//! - **replica**: a ship instance. Buffers local edits in a durable queue while
//!   offline, pushes them when the bus is reachable, applies master broadcasts,
//!   and mirrors binary media into a local object store.
//!
//! The engine is transport- and CMS-agnostic: the message bus, the content
//! store, and the two object stores are all seam traits with production
//! implementations (Kafka, S3) and in-memory ones for tests.

pub mod cms;
pub mod config;
pub mod infra;
pub mod service;

pub use cms::{ChangeOrigin, ContentStore, MemoryContentStore, WriteContext};
pub use config::{AppConfig, NodeMode};
pub use infra::db::Database;
pub use service::sync::{SyncMessage, SyncService};
