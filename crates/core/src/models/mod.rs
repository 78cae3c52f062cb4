//! Data models for Agora discussions

mod message;
mod participant;
mod reaction;
mod room;
mod typing;

pub use message::*;
pub use participant::*;
pub use reaction::*;
pub use room::*;
pub use typing::*;
