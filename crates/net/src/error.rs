//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Join rejected: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Room full")]
    RoomFull,

    #[error("Timed out waiting for the room snapshot")]
    JoinTimeout,

    #[error("No stored identity: {0}")]
    IdentityMissing(String),

    #[error("Server error: {0}")]
    Transport(String),

    #[error(transparent)]
    Core(#[from] agora_core::Error),
}
