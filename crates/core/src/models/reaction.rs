//! Reaction ledger
//!
//! Each message owns a ledger mapping an emoji to the ordered set of
//! participants who applied it. Counts are always derived from the set.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted emoji symbol, in characters
pub const MAX_EMOJI_CHARS: usize = 16;

/// Trim and validate an emoji symbol
pub fn normalize_emoji(raw: &str) -> Option<String> {
    let emoji = raw.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
        return None;
    }
    Some(emoji.to_string())
}

/// Outcome of a toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionChange {
    Added,
    Removed,
}

/// One emoji on one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawReaction")]
pub struct Reaction {
    pub emoji: String,
    users: Vec<Uuid>,
}

/// Wire shape; duplicates are collapsed on the way in
#[derive(Deserialize)]
struct RawReaction {
    emoji: String,
    #[serde(default)]
    users: Vec<Uuid>,
}

impl From<RawReaction> for Reaction {
    fn from(raw: RawReaction) -> Self {
        let mut users = Vec::with_capacity(raw.users.len());
        for user in raw.users {
            if !users.contains(&user) {
                users.push(user);
            }
        }
        Self {
            emoji: raw.emoji,
            users,
        }
    }
}

impl Reaction {
    pub fn users(&self) -> &[Uuid] {
        &self.users
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }

    pub fn includes(&self, user_id: Uuid) -> bool {
        self.users.contains(&user_id)
    }
}

/// Per-message set of reactions, in first-applied order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionLedger {
    reactions: Vec<Reaction>,
}

impl ReactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the user's reaction, or remove it if already present.
    /// An emoji left with no users is dropped from the ledger.
    pub fn toggle(&mut self, emoji: &str, user_id: Uuid) -> ReactionChange {
        match self.reactions.iter().position(|r| r.emoji == emoji) {
            Some(idx) => {
                let reaction = &mut self.reactions[idx];
                if let Some(pos) = reaction.users.iter().position(|u| *u == user_id) {
                    reaction.users.remove(pos);
                    if reaction.users.is_empty() {
                        self.reactions.remove(idx);
                    }
                    ReactionChange::Removed
                } else {
                    reaction.users.push(user_id);
                    ReactionChange::Added
                }
            }
            None => {
                self.reactions.push(Reaction {
                    emoji: emoji.to_string(),
                    users: vec![user_id],
                });
                ReactionChange::Added
            }
        }
    }

    pub fn get(&self, emoji: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.emoji == emoji)
    }

    pub fn count(&self, emoji: &str) -> usize {
        self.get(emoji).map(Reaction::count).unwrap_or(0)
    }

    /// Whether the user currently holds this emoji (drives highlighting)
    pub fn has_reacted(&self, emoji: &str, user_id: Uuid) -> bool {
        self.get(emoji).is_some_and(|r| r.includes(user_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reaction> {
        self.reactions.iter()
    }

    /// Sum of counts across all emoji
    pub fn total(&self) -> usize {
        self.reactions.iter().map(Reaction::count).sum()
    }

    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_parity() {
        let user = Uuid::new_v4();
        let mut ledger = ReactionLedger::new();

        for n in 1..=7 {
            ledger.toggle("👍", user);
            assert_eq!(ledger.has_reacted("👍", user), n % 2 == 1, "after {n} toggles");
        }
    }

    #[test]
    fn test_count_is_derived() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut ledger = ReactionLedger::new();

        assert_eq!(ledger.toggle("🔥", a), ReactionChange::Added);
        assert_eq!(ledger.toggle("🔥", b), ReactionChange::Added);
        assert_eq!(ledger.count("🔥"), 2);

        assert_eq!(ledger.toggle("🔥", a), ReactionChange::Removed);
        assert_eq!(ledger.count("🔥"), 1);
        assert!(!ledger.has_reacted("🔥", a));
        assert!(ledger.has_reacted("🔥", b));
    }

    #[test]
    fn test_empty_reaction_dropped() {
        let a = Uuid::new_v4();
        let mut ledger = ReactionLedger::new();
        ledger.toggle("🎉", a);
        ledger.toggle("❤️", a);
        ledger.toggle("🎉", a);

        assert_eq!(ledger.len(), 1);
        assert!(ledger.get("🎉").is_none());
        assert_eq!(ledger.count("🎉"), 0);
        assert_eq!(ledger.total(), 1);
    }

    #[test]
    fn test_deserialize_collapses_duplicates() {
        let user = Uuid::new_v4();
        let json = format!(r#"[{{"emoji":"👍","users":["{user}","{user}"]}}]"#);
        let ledger: ReactionLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(ledger.count("👍"), 1);
    }

    #[test]
    fn test_normalize_emoji() {
        assert_eq!(normalize_emoji(" 👍 ").as_deref(), Some("👍"));
        assert!(normalize_emoji("   ").is_none());
        assert!(normalize_emoji(&"x".repeat(MAX_EMOJI_CHARS + 1)).is_none());
    }
}
