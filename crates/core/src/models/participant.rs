//! Participant model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when a referenced author is not known locally
pub const UNKNOWN_AUTHOR: &str = "Unknown User";

/// A connected user within a discussion room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Participant {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            email: None,
            last_seen: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    /// Record activity from this participant
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn author_ref(&self) -> AuthorRef {
        AuthorRef {
            id: self.user_id,
            name: self.name.clone(),
        }
    }

    /// Up to two uppercase initials taken from the display name
    pub fn initials(&self) -> String {
        let initials: String = self
            .name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .take(2)
            .flat_map(char::to_uppercase)
            .collect();

        if initials.is_empty() {
            "?".to_string()
        } else {
            initials
        }
    }
}

/// Author reference carried by every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initials() {
        let p = Participant::new(Uuid::new_v4(), "sarah martin");
        assert_eq!(p.initials(), "SM");

        let p = Participant::new(Uuid::new_v4(), "Future Work Institute");
        assert_eq!(p.initials(), "FW");

        let p = Participant::new(Uuid::new_v4(), "   ");
        assert_eq!(p.initials(), "?");
    }

    #[test]
    fn test_author_ref() {
        let p = Participant::new(Uuid::new_v4(), "alice").with_email(Some("a@x.io".into()));
        let author = p.author_ref();
        assert_eq!(author.id, p.user_id);
        assert_eq!(author.name, "alice");
        assert_eq!(p.email.as_deref(), Some("a@x.io"));
    }
}
