//! Storage repository traits
//!
//! The discussion server talks to persistence only through these traits,
//! so the archive can be swapped or left out entirely.

use uuid::Uuid;

use crate::error::Result;
use crate::models::{EventId, Message, ReactionLedger};

/// Durable record of room history
pub trait RoomArchive {
    /// Load a room's log, oldest first; `limit` keeps the newest entries
    fn load_history(&self, event_id: &EventId, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Append a newly accepted message
    fn record_message(&self, message: &Message) -> Result<()>;

    /// Replace a message's reaction ledger
    fn record_reactions(&self, message_id: Uuid, reactions: &ReactionLedger) -> Result<()>;

    /// Store edited content and the edited flag
    fn record_edit(&self, message: &Message) -> Result<()>;
}
