//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible room states during
//! development. These checks are compiled out in release builds.

use std::collections::HashSet;

use uuid::Uuid;

use crate::models::{DiscussionRoom, ReactionLedger};

/// Validate that a room's state is internally consistent
pub fn assert_room_invariants(room: &DiscussionRoom) {
    if !cfg!(debug_assertions) {
        return;
    }

    // A participant appears at most once in the active set
    let mut seen = HashSet::new();
    for p in room.active_users() {
        debug_assert!(
            seen.insert(p.user_id),
            "Room {} lists participant {} twice",
            room.event_id(),
            p.user_id
        );
    }

    // Typers must be active
    for user_id in room.typing_users() {
        debug_assert!(
            room.is_active(user_id),
            "Room {} has inactive typer {}",
            room.event_id(),
            user_id
        );
    }

    debug_assert!(
        room.message_count() >= room.messages().len() as u64,
        "Room {} counter {} is behind its log of {}",
        room.event_id(),
        room.message_count(),
        room.messages().len()
    );

    for message in room.messages() {
        assert_ledger_invariants(&message.reactions, message.id);

        // Replies are single-level
        if let Some(target) = message.reply_to.and_then(|id| room.find_message(id)) {
            debug_assert!(
                target.reply_to.is_none(),
                "Message {} replies to reply {}",
                message.id,
                target.id
            );
        }
    }
}

/// Validate that a reaction ledger holds no empty or duplicate entries
pub fn assert_ledger_invariants(ledger: &ReactionLedger, message_id: Uuid) {
    let mut emojis = HashSet::new();
    for reaction in ledger.iter() {
        debug_assert!(
            emojis.insert(reaction.emoji.as_str()),
            "Message {} has emoji {} twice",
            message_id,
            reaction.emoji
        );
        debug_assert!(
            reaction.count() > 0,
            "Message {} keeps empty reaction {}",
            message_id,
            reaction.emoji
        );

        let users: HashSet<&Uuid> = reaction.users().iter().collect();
        debug_assert!(
            users.len() == reaction.count(),
            "Message {} has a repeated user on {}",
            message_id,
            reaction.emoji
        );
    }
}

/// Validate that a user ID is not nil
pub fn assert_user_id_valid(user_id: Uuid, context: &str) {
    debug_assert!(
        user_id != Uuid::nil(),
        "Nil user_id in context: {}",
        context
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventId, Participant, RoomSettings, TYPING_WINDOW};

    #[test]
    fn test_valid_room() {
        let mut room =
            DiscussionRoom::new(EventId::from("evt"), RoomSettings::default(), TYPING_WINDOW);
        let a = Uuid::new_v4();
        room.join(Participant::new(a, "a")).unwrap();
        room.post(a, "hi", None, None).unwrap();
        assert_room_invariants(&room);
    }

    #[test]
    fn test_valid_ledger() {
        let mut ledger = ReactionLedger::new();
        ledger.toggle("👍", Uuid::new_v4());
        assert_ledger_invariants(&ledger, Uuid::new_v4());
    }

    #[test]
    #[should_panic(expected = "Nil user_id")]
    fn test_nil_user_rejected() {
        assert_user_id_valid(Uuid::nil(), "test");
    }
}
