//! Sync engine entities

pub mod broadcast_queue;
pub mod conflict_log;
pub mod dead_letter;
pub mod outbound_queue;
pub mod peer_session;
pub mod processed_message;
pub mod sync_metadata;
