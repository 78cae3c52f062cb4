//! SQLite storage layer for Agora

mod messages;
mod migrations;
mod parse;
mod traits;

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{EventId, Message, ReactionLedger};

pub use messages::MessageStore;
pub use traits::RoomArchive;

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        migrations::schema_version(&self.conn).unwrap_or(0)
    }

    /// Get message store
    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(&self.conn)
    }
}

impl RoomArchive for Database {
    #[instrument(skip(self), fields(event_id = %event_id))]
    fn load_history(&self, event_id: &EventId, limit: Option<usize>) -> Result<Vec<Message>> {
        let messages = self.messages().list_for_room(event_id, limit)?;
        debug!(count = messages.len(), "Loaded room history");
        Ok(messages)
    }

    fn record_message(&self, message: &Message) -> Result<()> {
        self.messages().create(message)
    }

    fn record_reactions(&self, message_id: Uuid, reactions: &ReactionLedger) -> Result<()> {
        self.messages().update_reactions(message_id, reactions)
    }

    fn record_edit(&self, message: &Message) -> Result<()> {
        self.messages().update_content(message)
    }
}
