//! Typing indicator state
//!
//! Every typer holds a deadline one debounce window after their last
//! keystroke. Time is passed in explicitly so callers control the clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Inactivity after which a typing flag is cleared
pub const TYPING_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TypingState {
    window: Duration,
    deadlines: HashMap<Uuid, Instant>,
}

impl Default for TypingState {
    fn default() -> Self {
        Self::new(TYPING_WINDOW)
    }
}

impl TypingState {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Set or clear a user's flag. Returns true if membership changed;
    /// a repeated `true` only pushes the deadline out.
    pub fn set(&mut self, user_id: Uuid, is_typing: bool, now: Instant) -> bool {
        if is_typing {
            self.deadlines.insert(user_id, now + self.window).is_none()
        } else {
            self.deadlines.remove(&user_id).is_some()
        }
    }

    pub fn remove(&mut self, user_id: Uuid) -> bool {
        self.deadlines.remove(&user_id).is_some()
    }

    /// Drop every flag whose deadline has passed, returning those users
    pub fn expire(&mut self, now: Instant) -> Vec<Uuid> {
        let mut expired: Vec<Uuid> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();

        for id in &expired {
            self.deadlines.remove(id);
        }
        expired
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.deadlines.contains_key(&user_id)
    }

    /// Current typers, sorted for stable output
    pub fn users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.deadlines.keys().copied().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Human-readable indicator line for a set of typers
pub fn typing_summary<S: AsRef<str>>(names: &[S]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing...", one.as_ref())),
        many => Some(format!("{} users typing...", many.len())),
    }
}
