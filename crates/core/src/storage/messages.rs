//! Discussion message storage operations

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::parse::{
    parse_datetime, parse_datetime_opt, parse_reactions, parse_uuid, parse_uuid_opt, OptionalExt,
};
use crate::error::{Error, Result};
use crate::models::{AuthorRef, EventId, Message, ReactionLedger};

const SELECT_COLUMNS: &str = "id, event_id, author_id, author_name, content, created_at, \
                              reply_to, is_edited, edited_at, reactions";

pub struct MessageStore<'a> {
    conn: &'a Connection,
}

impl<'a> MessageStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a message to its room's log
    pub fn create(&self, message: &Message) -> Result<()> {
        self.conn.execute(
            "INSERT INTO discussion_messages
                (id, event_id, author_id, author_name, content, created_at,
                 reply_to, is_edited, edited_at, reactions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_string(),
                message.event_id.as_str(),
                message.author.id.to_string(),
                message.author.name,
                message.content,
                message.created_at.to_rfc3339(),
                message.reply_to.map(|id| id.to_string()),
                message.is_edited as i32,
                message.edited_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&message.reactions)?,
            ],
        )?;
        Ok(())
    }

    /// Get message by ID
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM discussion_messages WHERE id = ?1",
            SELECT_COLUMNS
        );
        let message = self
            .conn
            .query_row(&sql, params![id.to_string()], Self::map_message)
            .optional()?;
        Ok(message)
    }

    /// List a room's messages oldest first, keeping the newest `limit`
    pub fn list_for_room(&self, event_id: &EventId, limit: Option<usize>) -> Result<Vec<Message>> {
        // Newest first so LIMIT keeps the tail, then reversed
        let sql = format!(
            "SELECT {} FROM discussion_messages WHERE event_id = ?1 ORDER BY seq DESC LIMIT ?2",
            SELECT_COLUMNS
        );
        let limit = limit.map(|n| n as i64).unwrap_or(-1);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut messages = stmt
            .query_map(params![event_id.as_str(), limit], Self::map_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        messages.reverse();
        Ok(messages)
    }

    /// Replace the stored reaction ledger
    pub fn update_reactions(&self, message_id: Uuid, reactions: &ReactionLedger) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE discussion_messages SET reactions = ?1 WHERE id = ?2",
            params![serde_json::to_string(reactions)?, message_id.to_string()],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Message {}", message_id)));
        }
        Ok(())
    }

    /// Store edited content
    pub fn update_content(&self, message: &Message) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE discussion_messages SET content = ?1, is_edited = ?2, edited_at = ?3
             WHERE id = ?4",
            params![
                message.content,
                message.is_edited as i32,
                message.edited_at.map(|t| t.to_rfc3339()),
                message.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Message {}", message.id)));
        }
        Ok(())
    }

    /// Get message count for a room
    pub fn count_for_room(&self, event_id: &EventId) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM discussion_messages WHERE event_id = ?1",
            params![event_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            event_id: EventId::new(row.get::<_, String>(1)?),
            author: AuthorRef {
                id: parse_uuid(&row.get::<_, String>(2)?)?,
                name: row.get(3)?,
            },
            content: row.get(4)?,
            created_at: parse_datetime(&row.get::<_, String>(5)?)?,
            reply_to: parse_uuid_opt(row.get(6)?)?,
            is_edited: row.get::<_, i32>(7)? != 0,
            edited_at: parse_datetime_opt(row.get(8)?)?,
            reactions: parse_reactions(&row.get::<_, String>(9)?)?,
        })
    }
}
