//! Agora Network Library
//!
//! TCP transport for event discussions.
//!
//! # Architecture
//!
//! - **Server**: hosts one room per event, created on first join
//! - **Client**: one connection per room visit, with a local [`RoomView`]
//! - **Protocol**: length-prefixed JSON frames carrying named events
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(ServerConfig::default(), None).await?;
//!
//! let identity = Identity::load(&path)?;
//! let mut client = Client::connect(addr, EventId::from("evt-42"), &identity, ClientOptions::default()).await?;
//! client.send("hello", None).await?;
//!
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         ClientEvent::MessageReceived(msg) => { /* render */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod identity;
pub mod protocol;
pub mod server;
pub mod view;

pub use client::{Client, ClientEvent, ClientOptions, ConnectionState, ReconnectPolicy};
pub use error::{Error, Result};
pub use identity::Identity;
pub use protocol::{ActiveUser, ClientFrame, ServerFrame};
pub use server::{Server, SharedArchive};
pub use view::{PendingSend, RoomView};
