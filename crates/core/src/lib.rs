//! Agora Core Library
//!
//! Domain model for event discussions: rooms, participants, the message
//! log, the reaction ledger and typing state, plus configuration and the
//! optional SQLite archive.

pub mod config;
pub mod error;
pub mod invariants;
pub mod models;
pub mod storage;

pub use config::{ArchiveConfig, ServerConfig};
pub use error::{Error, Result};
pub use models::*;
pub use storage::{Database, MessageStore, RoomArchive};
