//! Discussion protocol event types
//!
//! Every frame is a JSON object tagged by `"type"`, carrying one named
//! event. Frames are parsed into these closed enums at the socket
//! boundary; nothing untyped reaches room or view state.

use agora_core::{EventId, Message, Participant, ReactionLedger, RoomSettings, RoomStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A participant as broadcast in `active_users_update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub is_typing: bool,
    pub last_seen: DateTime<Utc>,
}

impl ActiveUser {
    pub fn from_participant(participant: &Participant, is_typing: bool) -> Self {
        Self {
            user_id: participant.user_id,
            name: participant.name.clone(),
            email: participant.email.clone(),
            is_typing,
            last_seen: participant.last_seen,
        }
    }
}

/// Events sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection
    JoinDiscussion {
        event_id: EventId,
        user_id: Uuid,
        name: String,
        #[serde(default)]
        email: Option<String>,
    },

    SendMessage {
        correlation_id: Uuid,
        content: String,
        #[serde(default)]
        reply_to: Option<Uuid>,
    },

    EditMessage {
        message_id: Uuid,
        content: String,
    },

    Typing {
        is_typing: bool,
    },

    /// Toggle: a second identical reaction removes the first
    AddReaction {
        message_id: Uuid,
        emoji: String,
    },

    /// Older history, answered with `history_page`
    LoadHistory {
        /// Page ends just before this message; the newest page when unset
        #[serde(default)]
        before: Option<Uuid>,
        #[serde(default)]
        limit: Option<usize>,
    },

    /// Direct replies to one message, answered with `replies`
    GetReplies {
        message_id: Uuid,
    },

    /// Case-insensitive search over content and author names
    SearchMessages {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
    },

    LeaveDiscussion,

    /// Keeps an otherwise quiet connection from being reaped
    Ping,
}

/// Events sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Snapshot delivered to the joining connection only
    DiscussionJoined {
        event_id: EventId,
        messages: Vec<Message>,
        active_users: Vec<ActiveUser>,
        stats: RoomStats,
        settings: RoomSettings,
    },

    /// A message appended to the log. The author's copy carries the
    /// correlation id of the send it answers.
    NewMessage {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<Uuid>,
    },

    MessageUpdated {
        message: Message,
    },

    ActiveUsersUpdate {
        active_users: Vec<ActiveUser>,
    },

    UserTyping {
        user_id: Uuid,
        is_typing: bool,
    },

    ReactionUpdated {
        message_id: Uuid,
        reactions: ReactionLedger,
    },

    /// Answer to `load_history`, oldest first
    HistoryPage {
        messages: Vec<Message>,
        has_more: bool,
    },

    /// Answer to `get_replies`, oldest first
    Replies {
        message_id: Uuid,
        messages: Vec<Message>,
    },

    /// Answer to `search_messages`, newest first
    SearchResults {
        query: String,
        messages: Vec<Message>,
    },

    Error {
        message: String,
    },

    Pong,

    ServerShutdown,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}
