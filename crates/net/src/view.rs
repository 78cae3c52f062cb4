//! Client-side mirror of a discussion room
//!
//! The view is rebuilt from every `discussion_joined` snapshot and then
//! advanced one server frame at a time. Messages are appended strictly in
//! arrival order. Older pages fetched on demand are prepended.

use std::collections::BTreeSet;

use agora_core::{
    typing_summary, EventId, Message, ReactionLedger, ReplyPreview, RoomSettings, RoomStats,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::client::ClientEvent;
use crate::protocol::{ActiveUser, ServerFrame};

/// A send the server has not acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub correlation_id: Uuid,
    pub content: String,
    pub reply_to: Option<Uuid>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoomView {
    event_id: EventId,
    self_id: Uuid,
    messages: Vec<Message>,
    active_users: Vec<ActiveUser>,
    /// Other participants currently typing
    typing: BTreeSet<Uuid>,
    pending: Vec<PendingSend>,
    stats: RoomStats,
    settings: RoomSettings,
    last_error: Option<String>,
    joined: bool,
    /// The server holds messages older than the first one here
    has_older: bool,
}

impl RoomView {
    pub fn new(event_id: EventId, self_id: Uuid) -> Self {
        Self {
            event_id,
            self_id,
            messages: Vec::new(),
            active_users: Vec::new(),
            typing: BTreeSet::new(),
            pending: Vec::new(),
            stats: RoomStats::default(),
            settings: RoomSettings::default(),
            last_error: None,
            joined: false,
            has_older: false,
        }
    }

    /// Advance the view by one server frame, returning what changed
    pub fn apply(&mut self, frame: ServerFrame) -> Vec<ClientEvent> {
        let mut events = Vec::new();

        match frame {
            ServerFrame::DiscussionJoined {
                event_id,
                messages,
                active_users,
                stats,
                settings,
            } => {
                // A rejoin replaces everything except in-flight sends
                self.typing = active_users
                    .iter()
                    .filter(|u| u.is_typing && u.user_id != self.self_id)
                    .map(|u| u.user_id)
                    .collect();
                self.event_id = event_id.clone();
                self.has_older = stats.total_messages > messages.len() as u64;
                self.messages = messages;
                self.active_users = active_users;
                self.stats = stats;
                self.settings = settings;
                self.last_error = None;
                self.joined = true;

                events.push(ClientEvent::Joined {
                    event_id,
                    history: self.messages.len(),
                });
            }
            ServerFrame::NewMessage {
                message,
                correlation_id,
            } => {
                if let Some(correlation_id) = correlation_id {
                    if self.reconcile(correlation_id) {
                        events.push(ClientEvent::SendConfirmed {
                            correlation_id,
                            message_id: message.id,
                        });
                    }
                }

                // Replayed sends come back as duplicates
                if self.find_message(message.id).is_none() {
                    if !self.messages.iter().any(|m| m.author.id == message.author.id) {
                        self.stats.participants += 1;
                    }
                    self.stats.total_messages += 1;
                    self.messages.push(message.clone());
                    events.push(ClientEvent::MessageReceived(message));
                }
            }
            ServerFrame::MessageUpdated { message } => {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message.clone();
                    events.push(ClientEvent::MessageEdited(message));
                }
            }
            ServerFrame::ActiveUsersUpdate { active_users } => {
                self.typing
                    .retain(|id| active_users.iter().any(|u| u.user_id == *id));
                self.stats.active_users = active_users.len();
                self.active_users = active_users.clone();
                events.push(ClientEvent::ActiveUsersChanged(active_users));
            }
            ServerFrame::UserTyping { user_id, is_typing } => {
                if user_id == self.self_id {
                    return events;
                }
                let changed = if is_typing {
                    self.typing.insert(user_id)
                } else {
                    self.typing.remove(&user_id)
                };
                if changed {
                    events.push(ClientEvent::TypingChanged { user_id, is_typing });
                }
            }
            ServerFrame::ReactionUpdated {
                message_id,
                reactions,
            } => {
                if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
                    let before = message.reactions.total();
                    message.reactions = reactions.clone();
                    self.stats.total_reactions =
                        (self.stats.total_reactions + reactions.total()).saturating_sub(before);
                    events.push(ClientEvent::ReactionsChanged {
                        message_id,
                        reactions,
                    });
                }
            }
            ServerFrame::HistoryPage { messages, has_more } => {
                let mut older: Vec<Message> = messages
                    .into_iter()
                    .filter(|m| self.find_message(m.id).is_none())
                    .collect();
                let added = older.len();
                older.append(&mut self.messages);
                self.messages = older;
                self.has_older = has_more;
                events.push(ClientEvent::HistoryLoaded { added, has_more });
            }
            ServerFrame::Replies {
                message_id,
                messages,
            } => {
                events.push(ClientEvent::Replies {
                    message_id,
                    messages,
                });
            }
            ServerFrame::SearchResults { query, messages } => {
                events.push(ClientEvent::SearchResults { query, messages });
            }
            ServerFrame::Error { message } => {
                self.last_error = Some(message.clone());
                events.push(ClientEvent::Error(message));
            }
            ServerFrame::Pong => {}
            ServerFrame::ServerShutdown => {
                self.joined = false;
                events.push(ClientEvent::ServerShutdown);
            }
        }

        events
    }

    /// Record an outgoing send until the server echoes it
    pub fn queue_send(&mut self, content: String, reply_to: Option<Uuid>) -> PendingSend {
        let pending = PendingSend {
            correlation_id: Uuid::new_v4(),
            content,
            reply_to,
            queued_at: Utc::now(),
        };
        self.pending.push(pending.clone());
        pending
    }

    fn reconcile(&mut self, correlation_id: Uuid) -> bool {
        match self
            .pending
            .iter()
            .position(|p| p.correlation_id == correlation_id)
        {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.joined = false;
        self.typing.clear();
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// More history can be fetched with `load_older`
    pub fn has_older(&self) -> bool {
        self.has_older
    }

    pub fn oldest_message_id(&self) -> Option<Uuid> {
        self.messages.first().map(|m| m.id)
    }

    pub fn find_message(&self, message_id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn active_users(&self) -> &[ActiveUser] {
        &self.active_users
    }

    pub fn pending(&self) -> &[PendingSend] {
        &self.pending
    }

    pub fn stats(&self) -> RoomStats {
        self.stats
    }

    pub fn settings(&self) -> RoomSettings {
        self.settings
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_typing(&self, user_id: Uuid) -> bool {
        self.typing.contains(&user_id)
    }

    pub fn typing_users(&self) -> Vec<Uuid> {
        self.typing.iter().copied().collect()
    }

    /// Indicator line for everyone else who is typing, in join order
    pub fn typing_summary(&self) -> Option<String> {
        let names: Vec<&str> = self
            .active_users
            .iter()
            .filter(|u| self.typing.contains(&u.user_id))
            .map(|u| u.name.as_str())
            .collect();
        typing_summary(&names)
    }

    /// Preview of the message `message` replies to, if any
    pub fn reply_preview(&self, message: &Message) -> Option<ReplyPreview> {
        message
            .reply_to
            .map(|target| ReplyPreview::resolve(&self.messages, target))
    }

    pub fn reactions(&self, message_id: Uuid) -> Option<&ReactionLedger> {
        self.find_message(message_id).map(|m| &m.reactions)
    }

    /// Whether the local user has applied `emoji` to a message
    pub fn has_reacted(&self, message_id: Uuid, emoji: &str) -> bool {
        self.reactions(message_id)
            .is_some_and(|r| r.has_reacted(emoji, self.self_id))
    }

    pub fn reaction_count(&self, message_id: Uuid, emoji: &str) -> usize {
        self.reactions(message_id).map_or(0, |r| r.count(emoji))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{AuthorRef, UNKNOWN_AUTHOR};

    fn user(name: &str) -> ActiveUser {
        ActiveUser {
            user_id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            is_typing: false,
            last_seen: Utc::now(),
        }
    }

    fn message_from(author: &ActiveUser, content: &str) -> Message {
        Message::new(
            EventId::from("evt-42"),
            AuthorRef {
                id: author.user_id,
                name: author.name.clone(),
            },
            content.into(),
            None,
        )
    }

    fn joined(view: &mut RoomView, messages: Vec<Message>, active: Vec<ActiveUser>) {
        view.apply(ServerFrame::DiscussionJoined {
            event_id: EventId::from("evt-42"),
            messages,
            active_users: active,
            stats: RoomStats::default(),
            settings: RoomSettings::default(),
        });
    }

    #[test]
    fn test_snapshot_replaces_state() {
        let me = user("alice");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        joined(&mut view, vec![message_from(&me, "old")], vec![me.clone()]);
        view.apply(ServerFrame::error("boom"));

        let bob = user("bob");
        joined(
            &mut view,
            vec![message_from(&bob, "a"), message_from(&bob, "b")],
            vec![me, bob],
        );

        let contents: Vec<&str> = view.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
        assert_eq!(view.active_users().len(), 2);
        assert!(view.last_error().is_none());
        assert!(view.is_joined());
    }

    #[test]
    fn test_new_message_reconciles_pending_send() {
        let me = user("alice");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        joined(&mut view, vec![], vec![me.clone()]);

        let pending = view.queue_send("hello".into(), None);
        assert_eq!(view.pending().len(), 1);

        let echoed = message_from(&me, "hello");
        let events = view.apply(ServerFrame::NewMessage {
            message: echoed.clone(),
            correlation_id: Some(pending.correlation_id),
        });

        assert!(view.pending().is_empty());
        assert!(matches!(
            events[0],
            ClientEvent::SendConfirmed { message_id, .. } if message_id == echoed.id
        ));
        assert!(matches!(events[1], ClientEvent::MessageReceived(_)));
        assert_eq!(view.stats().total_messages, 1);
    }

    #[test]
    fn test_duplicate_message_not_appended_twice() {
        let me = user("alice");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        joined(&mut view, vec![], vec![me.clone()]);

        let msg = message_from(&me, "once");
        view.apply(ServerFrame::NewMessage {
            message: msg.clone(),
            correlation_id: None,
        });
        let events = view.apply(ServerFrame::NewMessage {
            message: msg,
            correlation_id: None,
        });

        assert!(events.is_empty());
        assert_eq!(view.messages().len(), 1);
    }

    #[test]
    fn test_typing_ignores_self_and_prunes_departed() {
        let me = user("alice");
        let bob = user("bob");
        let carol = user("carol");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        joined(&mut view, vec![], vec![me.clone(), bob.clone(), carol.clone()]);

        view.apply(ServerFrame::UserTyping {
            user_id: me.user_id,
            is_typing: true,
        });
        assert!(view.typing_summary().is_none());

        view.apply(ServerFrame::UserTyping {
            user_id: bob.user_id,
            is_typing: true,
        });
        assert_eq!(view.typing_summary().as_deref(), Some("bob is typing..."));

        view.apply(ServerFrame::UserTyping {
            user_id: carol.user_id,
            is_typing: true,
        });
        assert_eq!(view.typing_summary().as_deref(), Some("2 users typing..."));

        view.apply(ServerFrame::ActiveUsersUpdate {
            active_users: vec![me, carol.clone()],
        });
        assert_eq!(view.typing_users(), vec![carol.user_id]);
    }

    #[test]
    fn test_reaction_update_drives_highlight() {
        let me = user("alice");
        let bob = user("bob");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        let msg = message_from(&bob, "hello");
        joined(&mut view, vec![msg.clone()], vec![me.clone(), bob]);

        let mut ledger = ReactionLedger::new();
        ledger.toggle("👍", me.user_id);
        view.apply(ServerFrame::ReactionUpdated {
            message_id: msg.id,
            reactions: ledger,
        });
        assert!(view.has_reacted(msg.id, "👍"));
        assert_eq!(view.reaction_count(msg.id, "👍"), 1);
        assert_eq!(view.stats().total_reactions, 1);

        view.apply(ServerFrame::ReactionUpdated {
            message_id: msg.id,
            reactions: ReactionLedger::new(),
        });
        assert!(!view.has_reacted(msg.id, "👍"));
        assert_eq!(view.reaction_count(msg.id, "👍"), 0);
        assert_eq!(view.stats().total_reactions, 0);
    }

    #[test]
    fn test_reply_preview_degrades_for_missing_target() {
        let me = user("alice");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        let target = message_from(&me, "original");
        let mut reply = message_from(&me, "answer");
        reply.reply_to = Some(target.id);
        joined(&mut view, vec![reply.clone()], vec![me]);

        let preview = view.reply_preview(&reply).unwrap();
        assert_eq!(preview.author_name, UNKNOWN_AUTHOR);
        assert!(!preview.resolved);
        assert!(view.reply_preview(&target).is_none());
    }

    #[test]
    fn test_error_frame_recorded() {
        let mut view = RoomView::new(EventId::from("evt-42"), Uuid::new_v4());
        let events = view.apply(ServerFrame::error("Message not found"));
        assert_eq!(view.last_error(), Some("Message not found"));
        assert!(matches!(&events[0], ClientEvent::Error(m) if m == "Message not found"));
    }

    #[test]
    fn test_older_page_prepends_without_duplicates() {
        let me = user("alice");
        let mut view = RoomView::new(EventId::from("evt-42"), me.user_id);
        let first = message_from(&me, "first");
        let second = message_from(&me, "second");
        let mut third = message_from(&me, "third");
        third.reply_to = Some(first.id);

        view.apply(ServerFrame::DiscussionJoined {
            event_id: EventId::from("evt-42"),
            messages: vec![second.clone(), third.clone()],
            active_users: vec![me],
            stats: RoomStats {
                total_messages: 3,
                ..RoomStats::default()
            },
            settings: RoomSettings::default(),
        });
        assert!(view.has_older());
        assert_eq!(view.oldest_message_id(), Some(second.id));
        assert!(!view.reply_preview(&third).unwrap().resolved);

        // Overlaps the snapshot by one message
        let events = view.apply(ServerFrame::HistoryPage {
            messages: vec![first.clone(), second],
            has_more: false,
        });
        assert!(matches!(
            events[0],
            ClientEvent::HistoryLoaded {
                added: 1,
                has_more: false
            }
        ));

        let contents: Vec<&str> = view.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert!(!view.has_older());
        assert!(view.reply_preview(&third).unwrap().resolved);
    }
}
