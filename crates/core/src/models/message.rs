//! Message model for event discussions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AuthorRef, EventId, ReactionLedger, UNKNOWN_AUTHOR};

/// Maximum message length, counted in characters after trimming
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Length of the quoted excerpt shown above a reply
pub const REPLY_EXCERPT_CHARS: usize = 100;

/// Trim message content and check it is sendable.
///
/// Returns `None` for blank or over-long content; callers treat that as a
/// silent no-op.
pub fn normalize_content(raw: &str) -> Option<String> {
    let content = raw.trim();
    if content.is_empty() || content.chars().count() > MAX_CONTENT_CHARS {
        return None;
    }
    Some(content.to_string())
}

/// Truncate to `max_chars`, appending "..." when something was cut
pub fn excerpt(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// A message in a discussion room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub event_id: EventId,
    pub author: AuthorRef,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: ReactionLedger,
}

impl Message {
    pub fn new(
        event_id: EventId,
        author: AuthorRef,
        content: String,
        reply_to: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id,
            author,
            content,
            created_at: Utc::now(),
            reply_to,
            is_edited: false,
            edited_at: None,
            reactions: ReactionLedger::new(),
        }
    }

    /// Replace the content and flag the message as edited
    pub fn apply_edit(&mut self, content: String) {
        self.content = content;
        self.is_edited = true;
        self.edited_at = Some(Utc::now());
    }
}

/// What a reply shows of the message it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPreview {
    pub message_id: Uuid,
    pub author_name: String,
    pub excerpt: String,
    /// False when the target is not in the local log
    pub resolved: bool,
}

impl ReplyPreview {
    /// Look the target up in `log`, degrading to a placeholder when absent
    pub fn resolve(log: &[Message], message_id: Uuid) -> Self {
        match log.iter().find(|m| m.id == message_id) {
            Some(target) => Self {
                message_id,
                author_name: target.author.name.clone(),
                excerpt: excerpt(&target.content, REPLY_EXCERPT_CHARS),
                resolved: true,
            },
            None => Self {
                message_id,
                author_name: UNKNOWN_AUTHOR.to_string(),
                excerpt: String::new(),
                resolved: false,
            },
        }
    }
}
