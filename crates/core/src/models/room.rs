//! Discussion room model
//!
//! A room is the per-event channel: ordered message log, active
//! participants in join order, and typing state. All mutation goes
//! through the methods here so the invariants in [`crate::invariants`]
//! hold after every call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    normalize_content, normalize_emoji, Message, Participant, ReactionChange, ReactionLedger,
    TypingState,
};
use crate::error::{Error, Result};
use crate::invariants::{assert_room_invariants, assert_user_id_valid};

/// Correlation ids remembered per room for duplicate suppression
const MAX_TRACKED_SENDS: usize = 1024;

/// Longest accepted event identifier, in bytes
const MAX_EVENT_ID_LEN: usize = 128;

/// Messages per history page when the caller does not say
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Search hits returned when the caller does not say
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Upper bound on any page or search result
pub const MAX_PAGE_SIZE: usize = 100;

/// Identifier of the event a room belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty() && self.0.len() <= MAX_EVENT_ID_LEN
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-room feature switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub allow_reactions: bool,
    pub allow_replies: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_reactions: true,
            allow_replies: true,
        }
    }
}

/// Aggregate numbers for a room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub total_messages: u64,
    /// Distinct authors in the log
    pub participants: usize,
    pub total_reactions: usize,
    pub active_users: usize,
}

/// A slice of the log, oldest first
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    /// Older messages exist before the first one in this page
    pub has_more: bool,
}

/// A participant removed from the active set
#[derive(Debug, Clone)]
pub struct Departure {
    pub participant: Participant,
    pub was_typing: bool,
}

/// Result of an accepted post
#[derive(Debug, Clone)]
pub enum Posted {
    /// Appended to the log
    New(Message),
    /// Same author and correlation id seen before; nothing appended
    Duplicate(Message),
}

impl Posted {
    pub fn message(&self) -> &Message {
        match self {
            Posted::New(m) | Posted::Duplicate(m) => m,
        }
    }
}

/// Result of a reaction toggle
#[derive(Debug, Clone)]
pub struct ReactionUpdate {
    pub message_id: Uuid,
    pub emoji: String,
    pub change: ReactionChange,
    pub reactions: ReactionLedger,
}

/// A per-event discussion room
#[derive(Debug, Clone)]
pub struct DiscussionRoom {
    event_id: EventId,
    messages: Vec<Message>,
    message_count: u64,
    active: Vec<Participant>,
    typing: TypingState,
    settings: RoomSettings,
    last_activity: DateTime<Utc>,
    correlations: HashMap<(Uuid, Uuid), Uuid>,
    correlation_order: VecDeque<(Uuid, Uuid)>,
}

impl DiscussionRoom {
    pub fn new(event_id: EventId, settings: RoomSettings, typing_window: Duration) -> Self {
        Self {
            event_id,
            messages: Vec::new(),
            message_count: 0,
            active: Vec::new(),
            typing: TypingState::new(typing_window),
            settings,
            last_activity: Utc::now(),
            correlations: HashMap::new(),
            correlation_order: VecDeque::new(),
        }
    }

    /// Rebuild a room around a previously archived log (oldest first)
    pub fn restore(
        event_id: EventId,
        settings: RoomSettings,
        typing_window: Duration,
        messages: Vec<Message>,
    ) -> Self {
        let mut room = Self::new(event_id, settings, typing_window);
        room.message_count = messages.len() as u64;
        if let Some(last) = messages.last() {
            room.last_activity = last.created_at;
        }
        room.messages = messages;
        assert_room_invariants(&room);
        room
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn settings(&self) -> RoomSettings {
        self.settings
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn active_users(&self) -> &[Participant] {
        &self.active
    }

    pub fn is_active(&self, user_id: Uuid) -> bool {
        self.active.iter().any(|p| p.user_id == user_id)
    }

    pub fn is_typing(&self, user_id: Uuid) -> bool {
        self.typing.contains(user_id)
    }

    pub fn typing_users(&self) -> Vec<Uuid> {
        self.typing.users()
    }

    pub fn find_message(&self, message_id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// The log oldest first, keeping only the newest `limit` entries if set
    pub fn history(&self, limit: Option<usize>) -> Vec<Message> {
        let start = limit.map_or(0, |n| self.messages.len().saturating_sub(n));
        self.messages[start..].to_vec()
    }

    /// The `limit` messages just before `before` (or the newest ones when
    /// unset), oldest first
    pub fn page_before(&self, before: Option<Uuid>, limit: usize) -> Result<HistoryPage> {
        let end = match before {
            Some(id) => self
                .messages
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| Error::NotFound(format!("Message {}", id)))?,
            None => self.messages.len(),
        };
        let start = end.saturating_sub(limit.clamp(1, MAX_PAGE_SIZE));

        Ok(HistoryPage {
            messages: self.messages[start..end].to_vec(),
            has_more: start > 0,
        })
    }

    /// Direct replies to a message, oldest first
    pub fn replies(&self, message_id: Uuid) -> Result<Vec<Message>> {
        if self.find_message(message_id).is_none() {
            return Err(Error::NotFound(format!("Message {}", message_id)));
        }
        Ok(self
            .messages
            .iter()
            .filter(|m| m.reply_to == Some(message_id))
            .cloned()
            .collect())
    }

    /// Case-insensitive match on content or author name, newest first
    pub fn search(&self, query: &str, limit: usize) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        self.messages
            .iter()
            .rev()
            .filter(|m| {
                m.content.to_lowercase().contains(&needle)
                    || m.author.name.to_lowercase().contains(&needle)
            })
            .take(limit.clamp(1, MAX_PAGE_SIZE))
            .cloned()
            .collect()
    }

    /// Add a participant to the active set
    pub fn join(&mut self, participant: Participant) -> Result<()> {
        assert_user_id_valid(participant.user_id, "room join");
        if self.is_active(participant.user_id) {
            return Err(Error::InvalidOperation(format!(
                "{} is already in room {}",
                participant.user_id, self.event_id
            )));
        }

        self.active.push(participant);
        self.last_activity = Utc::now();
        assert_room_invariants(self);
        Ok(())
    }

    /// Remove a participant from the active and typing sets
    pub fn leave(&mut self, user_id: Uuid) -> Option<Departure> {
        let idx = self.active.iter().position(|p| p.user_id == user_id)?;
        let participant = self.active.remove(idx);
        let was_typing = self.typing.remove(user_id);
        assert_room_invariants(self);
        Some(Departure {
            participant,
            was_typing,
        })
    }

    /// Append a message from an active participant.
    ///
    /// Blank or over-long content yields `Ok(None)` and leaves the room
    /// untouched. A correlation id already seen for this author yields the
    /// original message as [`Posted::Duplicate`].
    pub fn post(
        &mut self,
        author_id: Uuid,
        raw_content: &str,
        reply_to: Option<Uuid>,
        correlation_id: Option<Uuid>,
    ) -> Result<Option<Posted>> {
        let author = self.touch_participant(author_id)?.author_ref();

        if let Some(correlation_id) = correlation_id {
            if let Some(existing) = self
                .correlations
                .get(&(author_id, correlation_id))
                .and_then(|id| self.find_message(*id))
            {
                return Ok(Some(Posted::Duplicate(existing.clone())));
            }
        }

        let Some(content) = normalize_content(raw_content) else {
            return Ok(None);
        };

        let reply_to = if self.settings.allow_replies {
            reply_to.map(|id| self.reply_root(id))
        } else {
            None
        };

        let message = Message::new(self.event_id.clone(), author, content, reply_to);
        self.messages.push(message.clone());
        self.message_count += 1;
        self.last_activity = message.created_at;

        if let Some(correlation_id) = correlation_id {
            self.track_correlation(author_id, correlation_id, message.id);
        }

        assert_room_invariants(self);
        Ok(Some(Posted::New(message)))
    }

    /// Toggle `emoji` on a message for an active participant
    pub fn toggle_reaction(
        &mut self,
        user_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<ReactionUpdate> {
        if !self.settings.allow_reactions {
            return Err(Error::InvalidOperation(format!(
                "Reactions are disabled in room {}",
                self.event_id
            )));
        }

        let emoji = normalize_emoji(emoji)
            .ok_or_else(|| Error::Validation(format!("Invalid emoji {:?}", emoji)))?;
        self.touch_participant(user_id)?;

        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("Message {}", message_id)))?;

        let change = message.reactions.toggle(&emoji, user_id);
        let reactions = message.reactions.clone();
        self.last_activity = Utc::now();

        assert_room_invariants(self);
        Ok(ReactionUpdate {
            message_id,
            emoji,
            change,
            reactions,
        })
    }

    /// Replace the content of the caller's own message.
    ///
    /// Invalid content is a no-op, mirroring [`DiscussionRoom::post`].
    pub fn edit(
        &mut self,
        user_id: Uuid,
        message_id: Uuid,
        raw_content: &str,
    ) -> Result<Option<Message>> {
        self.touch_participant(user_id)?;

        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("Message {}", message_id)))?;

        if message.author.id != user_id {
            return Err(Error::PermissionDenied(
                "Only the author can edit a message".into(),
            ));
        }

        let Some(content) = normalize_content(raw_content) else {
            return Ok(None);
        };

        message.apply_edit(content);
        let edited = message.clone();

        self.last_activity = Utc::now();
        assert_room_invariants(self);
        Ok(Some(edited))
    }

    /// Update an active participant's typing flag. Returns true when the
    /// flag flipped; inactive users are ignored.
    pub fn set_typing(&mut self, user_id: Uuid, is_typing: bool, now: Instant) -> bool {
        if self.touch_participant(user_id).is_err() {
            return false;
        }
        self.typing.set(user_id, is_typing, now)
    }

    /// Clear typing flags past their deadline
    pub fn expire_typing(&mut self, now: Instant) -> Vec<Uuid> {
        self.typing.expire(now)
    }

    pub fn stats(&self) -> RoomStats {
        let authors: HashSet<Uuid> = self.messages.iter().map(|m| m.author.id).collect();
        RoomStats {
            total_messages: self.message_count,
            participants: authors.len(),
            total_reactions: self.messages.iter().map(|m| m.reactions.total()).sum(),
            active_users: self.active.len(),
        }
    }

    fn touch_participant(&mut self, user_id: Uuid) -> Result<&mut Participant> {
        let event_id = &self.event_id;
        let participant = self
            .active
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or_else(|| {
                Error::PermissionDenied(format!("{} is not in room {}", user_id, event_id))
            })?;
        participant.touch();
        Ok(participant)
    }

    /// Replies stay one level deep: answering a reply targets its root
    fn reply_root(&self, target: Uuid) -> Uuid {
        self.find_message(target)
            .and_then(|m| m.reply_to)
            .unwrap_or(target)
    }

    fn track_correlation(&mut self, author_id: Uuid, correlation_id: Uuid, message_id: Uuid) {
        let key = (author_id, correlation_id);
        self.correlations.insert(key, message_id);
        self.correlation_order.push_back(key);

        while self.correlation_order.len() > MAX_TRACKED_SENDS {
            if let Some(old) = self.correlation_order.pop_front() {
                self.correlations.remove(&old);
            }
        }
    }
}
