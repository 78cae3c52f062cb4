//! TCP server for event discussions
//!
//! Hosts any number of rooms, each created on its first join. A connection
//! belongs to exactly one room. Every event in a room is applied and queued
//! to its connections while holding that room's lock, so all participants
//! observe a single total order. Queueing never waits: a connection whose
//! queue is full is dropped from the room instead of stalling it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agora_core::{
    DiscussionRoom, EventId, Message, Participant, Posted, RoomArchive, ServerConfig,
    DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_LIMIT,
};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ActiveUser, ClientFrame, ServerFrame};

/// Archive handle shared by every room
pub type SharedArchive = Arc<Mutex<dyn RoomArchive + Send>>;

/// Upper bound on the typing sweep period
const TYPING_SWEEP_INTERVAL_MS: u64 = 250;

/// Time allowed for a closing connection to flush its queue
const WRITER_DRAIN_MS: u64 = 1000;

/// Time a single frame may take to reach the socket
const WRITE_TIMEOUT_MS: u64 = 5000;

/// Outbound side of one joined connection
struct Peer {
    tx: mpsc::Sender<ServerFrame>,
    /// Tells the connection task to close
    kick: Arc<Notify>,
}

/// A room plus the outbound queues of its connections
struct RoomState {
    room: DiscussionRoom,
    peers: HashMap<Uuid, Peer>,
}

type SharedRoom = Arc<RwLock<RoomState>>;

impl RoomState {
    fn active_users(&self) -> Vec<ActiveUser> {
        self.room
            .active_users()
            .iter()
            .map(|p| ActiveUser::from_participant(p, self.room.is_typing(p.user_id)))
            .collect()
    }

    /// Queue a frame for one connection without waiting. A connection
    /// whose queue is full or gone is dropped and told to close.
    fn deliver(&mut self, user_id: Uuid, frame: ServerFrame) {
        let Some(peer) = self.peers.get(&user_id) else {
            return;
        };

        match peer.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(event_id = %self.room.event_id(), user_id = %user_id, "Peer queue full, dropping connection");
                self.evict(user_id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = %user_id, "Peer queue closed");
                self.evict(user_id);
            }
        }
    }

    /// Queue a frame for every connection, optionally skipping one
    fn broadcast(&mut self, frame: ServerFrame, except: Option<Uuid>) {
        let targets: Vec<Uuid> = self
            .peers
            .keys()
            .copied()
            .filter(|id| except != Some(*id))
            .collect();

        for user_id in targets {
            self.deliver(user_id, frame.clone());
        }
    }

    fn evict(&mut self, user_id: Uuid) {
        if let Some(peer) = self.peers.remove(&user_id) {
            peer.kick.notify_one();
        }
    }
}

type ArchiveJob = Box<dyn FnOnce(&(dyn RoomArchive + Send)) -> agora_core::Result<()> + Send>;

/// Runs archive writes on a blocking thread, one at a time, in the order
/// they were submitted
#[derive(Clone)]
struct ArchiveWriter {
    tx: mpsc::UnboundedSender<(&'static str, ArchiveJob)>,
}

impl ArchiveWriter {
    fn spawn(archive: SharedArchive) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, ArchiveJob)>();

        tokio::task::spawn_blocking(move || {
            while let Some((what, job)) = rx.blocking_recv() {
                let Ok(guard) = archive.lock() else {
                    warn!(what, "Archive lock poisoned");
                    continue;
                };
                if let Err(e) = job(&*guard) {
                    warn!(error = %e, what, "Archive write failed");
                }
            }
            debug!("Archive writer stopped");
        });

        Self { tx }
    }

    fn submit(&self, what: &'static str, job: ArchiveJob) {
        if self.tx.send((what, job)).is_err() {
            warn!(what, "Archive writer gone, write skipped");
        }
    }
}

/// Server state shared across tasks
struct ServerState {
    config: ServerConfig,
    rooms: HashMap<EventId, SharedRoom>,
    archive: Option<SharedArchive>,
    writer: Option<ArchiveWriter>,
}

/// One joined connection
struct Session {
    event_id: EventId,
    user_id: Uuid,
    room: SharedRoom,
    tx: mpsc::Sender<ServerFrame>,
    kick: Arc<Notify>,
    writer: Option<ArchiveWriter>,
}

impl Session {
    /// Queue an archive write; failures are logged, never returned
    fn archive<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&(dyn RoomArchive + Send)) -> agora_core::Result<()> + Send + 'static,
    {
        if let Some(writer) = &self.writer {
            writer.submit(what, Box::new(f));
        }
    }

    /// Answer this connection only
    fn reply(&self, frame: ServerFrame) {
        if self.tx.try_send(frame).is_err() {
            warn!(user_id = %self.user_id, "Own queue unavailable, closing connection");
            self.kick.notify_one();
        }
    }
}

/// Discussion server handle
pub struct Server {
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind and start serving. Rooms are restored from `archive` on first
    /// join when one is given.
    pub async fn start(config: ServerConfig, archive: Option<SharedArchive>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, archive = archive.is_some(), "Server started");

        let sweep_interval = (config.typing_window() / 4)
            .min(Duration::from_millis(TYPING_SWEEP_INTERVAL_MS))
            .max(Duration::from_millis(10));

        let (shutdown_tx, _) = broadcast::channel(1);

        let writer = archive.clone().map(ArchiveWriter::spawn);
        let state = Arc::new(RwLock::new(ServerState {
            config,
            rooms: HashMap::new(),
            archive,
            writer,
        }));

        // Spawn accept loop
        tokio::spawn(accept_loop(
            listener,
            state.clone(),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        // Spawn typing sweep
        tokio::spawn(typing_sweep_task(
            state.clone(),
            sweep_interval,
            shutdown_tx.subscribe(),
        ));

        Ok(Server {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Rooms created so far, sorted
    pub async fn rooms(&self) -> Vec<EventId> {
        let mut rooms: Vec<EventId> = self.state.read().await.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Active participants of a room, in join order
    pub async fn active_users(&self, event_id: &EventId) -> Vec<ActiveUser> {
        match self.room(event_id).await {
            Some(room) => room.read().await.active_users(),
            None => Vec::new(),
        }
    }

    /// A room's full log, oldest first
    pub async fn history(&self, event_id: &EventId) -> Vec<Message> {
        match self.room(event_id).await {
            Some(room) => room.read().await.room.history(None),
            None => Vec::new(),
        }
    }

    /// Shutdown the server, closing every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }

    async fn room(&self, event_id: &EventId) -> Option<SharedRoom> {
        self.state.read().await.rooms.get(event_id).cloned()
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let state = state.clone();
                        tokio::spawn(handle_connection(stream, addr, state, shutdown_tx.subscribe()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (idle_timeout, queue) = {
        let s = state.read().await;
        (s.config.idle_timeout(), s.config.peer_queue)
    };

    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(queue);
    let kick = Arc::new(Notify::new());
    let writer_handle = tokio::spawn(writer_task(writer, rx, kick.clone()));

    // First frame must be join_discussion
    let session = match handle_join(&mut reader, &state, &tx, &kick, idle_timeout).await {
        Ok(session) => session,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Join failed");
            let _ = tx.try_send(ServerFrame::error(e.to_string()));
            drop(tx);
            finish_writer(writer_handle).await;
            return;
        }
    };

    info!(
        addr = %addr,
        event_id = %session.event_id,
        user_id = %session.user_id,
        "Participant joined"
    );

    loop {
        tokio::select! {
            result = tokio::time::timeout(idle_timeout, read_frame::<_, ClientFrame>(&mut reader)) => {
                match result {
                    Ok(Ok(frame)) => {
                        if handle_frame(frame, &session).await.is_break() {
                            debug!(user_id = %session.user_id, "Leave requested");
                            break;
                        }
                    }
                    Ok(Err(Error::ConnectionClosed)) => {
                        debug!(user_id = %session.user_id, "Connection closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(user_id = %session.user_id, error = %e, "Read error");
                        session.reply(ServerFrame::error(e.to_string()));
                        break;
                    }
                    Err(_) => {
                        info!(user_id = %session.user_id, "Connection idle, closing");
                        break;
                    }
                }
            }
            _ = session.kick.notified() => {
                info!(user_id = %session.user_id, "Connection fell behind, closing");
                break;
            }
            _ = shutdown_rx.recv() => {
                let _ = session.tx.try_send(ServerFrame::ServerShutdown);
                break;
            }
        }
    }

    // Cleanup
    depart(&session).await;
    let (event_id, user_id) = (session.event_id.clone(), session.user_id);
    drop(session);
    drop(tx);
    finish_writer(writer_handle).await;

    info!(event_id = %event_id, user_id = %user_id, "Participant disconnected");
}

/// Handle join request
async fn handle_join(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<ServerState>>,
    tx: &mpsc::Sender<ServerFrame>,
    kick: &Arc<Notify>,
    idle_timeout: Duration,
) -> Result<Session> {
    let frame = tokio::time::timeout(idle_timeout, read_frame::<_, ClientFrame>(reader))
        .await
        .map_err(|_| Error::Protocol("No join request".into()))??;

    let ClientFrame::JoinDiscussion {
        event_id,
        user_id,
        name,
        email,
    } = frame
    else {
        return Err(Error::Protocol("Expected join_discussion".into()));
    };

    if !event_id.is_valid() {
        return Err(Error::Rejected("Invalid event id".into()));
    }
    if user_id.is_nil() || name.trim().is_empty() {
        return Err(Error::Rejected("Missing userId or name".into()));
    }

    let (room, max_peers, history_limit, writer) = room_for(state, &event_id).await?;

    let mut r = room.write().await;

    // Check capacity
    if r.peers.len() >= max_peers {
        return Err(Error::RoomFull);
    }

    r.room
        .join(Participant::new(user_id, name.trim()).with_email(email))
        .map_err(|e| Error::Rejected(e.to_string()))?;
    r.peers.insert(
        user_id,
        Peer {
            tx: tx.clone(),
            kick: kick.clone(),
        },
    );

    let snapshot = ServerFrame::DiscussionJoined {
        event_id: event_id.clone(),
        messages: r.room.history(history_limit),
        active_users: r.active_users(),
        stats: r.room.stats(),
        settings: r.room.settings(),
    };
    r.deliver(user_id, snapshot);

    // Everyone, the newcomer included, sees the new member list
    let update = ServerFrame::ActiveUsersUpdate {
        active_users: r.active_users(),
    };
    r.broadcast(update, None);
    drop(r);

    Ok(Session {
        event_id,
        user_id,
        room,
        tx: tx.clone(),
        kick: kick.clone(),
        writer,
    })
}

/// Find a room, creating it (and replaying its archive) on first use
async fn room_for(
    state: &Arc<RwLock<ServerState>>,
    event_id: &EventId,
) -> Result<(SharedRoom, usize, Option<usize>, Option<ArchiveWriter>)> {
    let mut s = state.write().await;
    let max_peers = s.config.max_peers_per_room;
    let history_limit = s.config.history_limit;
    let writer = s.writer.clone();

    if let Some(room) = s.rooms.get(event_id) {
        return Ok((room.clone(), max_peers, history_limit, writer));
    }

    let messages = match s.archive.clone() {
        Some(archive) => {
            let key = event_id.clone();
            tokio::task::spawn_blocking(move || {
                let guard = archive
                    .lock()
                    .map_err(|_| Error::Protocol("Archive lock poisoned".into()))?;
                Ok::<_, Error>(guard.load_history(&key, None)?)
            })
            .await
            .map_err(|e| Error::Protocol(format!("Archive load failed: {e}")))??
        }
        None => Vec::new(),
    };

    let room = DiscussionRoom::restore(
        event_id.clone(),
        s.config.room,
        s.config.typing_window(),
        messages,
    );
    info!(event_id = %event_id, messages = room.message_count(), "Room created");

    let shared = Arc::new(RwLock::new(RoomState {
        room,
        peers: HashMap::new(),
    }));
    s.rooms.insert(event_id.clone(), shared.clone());

    Ok((shared, max_peers, history_limit, writer))
}

/// Writer task - sends frames to the client
async fn writer_task(
    mut writer: WriteHalf<TcpStream>,
    mut rx: mpsc::Receiver<ServerFrame>,
    kick: Arc<Notify>,
) {
    let limit = Duration::from_millis(WRITE_TIMEOUT_MS);

    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(limit, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed");
                kick.notify_one();
                break;
            }
            Err(_) => {
                warn!("Write stalled, closing connection");
                kick.notify_one();
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Wait for a writer to drain its queue, aborting it if it stalls
async fn finish_writer(handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(Duration::from_millis(WRITER_DRAIN_MS), handle)
        .await
        .is_err()
    {
        abort.abort();
    }
}

/// Handle an incoming frame from a joined connection
async fn handle_frame(frame: ClientFrame, session: &Session) -> ControlFlow<()> {
    let user_id = session.user_id;

    match frame {
        ClientFrame::SendMessage {
            correlation_id,
            content,
            reply_to,
        } => {
            let mut r = session.room.write().await;
            match r.room.post(user_id, &content, reply_to, Some(correlation_id)) {
                Ok(Some(Posted::New(message))) => {
                    let record = message.clone();
                    session.archive("message", move |a| a.record_message(&record));
                    debug!(
                        event_id = %session.event_id,
                        message_id = %message.id,
                        "Message appended"
                    );

                    // Broadcast to all including sender; only the sender's
                    // copy carries the correlation id
                    let targets: Vec<Uuid> = r.peers.keys().copied().collect();
                    for peer_id in targets {
                        let frame = ServerFrame::NewMessage {
                            message: message.clone(),
                            correlation_id: (peer_id == user_id).then_some(correlation_id),
                        };
                        r.deliver(peer_id, frame);
                    }
                }
                Ok(Some(Posted::Duplicate(message))) => {
                    debug!(correlation_id = %correlation_id, "Duplicate send, acknowledging again");
                    r.deliver(
                        user_id,
                        ServerFrame::NewMessage {
                            message,
                            correlation_id: Some(correlation_id),
                        },
                    );
                }
                Ok(None) => {
                    debug!(user_id = %user_id, "Dropped empty or oversized message");
                }
                Err(e) => {
                    session.reply(ServerFrame::error(e.to_string()));
                }
            }
        }
        ClientFrame::EditMessage {
            message_id,
            content,
        } => {
            let mut r = session.room.write().await;
            match r.room.edit(user_id, message_id, &content) {
                Ok(Some(message)) => {
                    let record = message.clone();
                    session.archive("edit", move |a| a.record_edit(&record));
                    r.broadcast(ServerFrame::MessageUpdated { message }, None);
                }
                Ok(None) => {
                    debug!(user_id = %user_id, "Dropped empty or oversized edit");
                }
                Err(e) => {
                    session.reply(ServerFrame::error(e.to_string()));
                }
            }
        }
        ClientFrame::Typing { is_typing } => {
            let mut r = session.room.write().await;
            if r.room.set_typing(user_id, is_typing, Instant::now()) {
                r.broadcast(ServerFrame::UserTyping { user_id, is_typing }, Some(user_id));
            }
        }
        ClientFrame::AddReaction { message_id, emoji } => {
            let mut r = session.room.write().await;
            match r.room.toggle_reaction(user_id, message_id, &emoji) {
                Ok(update) => {
                    let reactions = update.reactions.clone();
                    session.archive("reactions", move |a| {
                        a.record_reactions(message_id, &reactions)
                    });
                    debug!(
                        message_id = %message_id,
                        emoji = %update.emoji,
                        change = ?update.change,
                        "Reaction toggled"
                    );
                    r.broadcast(
                        ServerFrame::ReactionUpdated {
                            message_id,
                            reactions: update.reactions,
                        },
                        None,
                    );
                }
                Err(e) => {
                    session.reply(ServerFrame::error(e.to_string()));
                }
            }
        }
        ClientFrame::LoadHistory { before, limit } => {
            let r = session.room.read().await;
            let frame = match r.room.page_before(before, limit.unwrap_or(DEFAULT_PAGE_SIZE)) {
                Ok(page) => ServerFrame::HistoryPage {
                    messages: page.messages,
                    has_more: page.has_more,
                },
                Err(e) => ServerFrame::error(e.to_string()),
            };
            session.reply(frame);
        }
        ClientFrame::GetReplies { message_id } => {
            let r = session.room.read().await;
            let frame = match r.room.replies(message_id) {
                Ok(messages) => ServerFrame::Replies {
                    message_id,
                    messages,
                },
                Err(e) => ServerFrame::error(e.to_string()),
            };
            session.reply(frame);
        }
        ClientFrame::SearchMessages { query, limit } => {
            let r = session.room.read().await;
            let messages = r
                .room
                .search(&query, limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
            session.reply(ServerFrame::SearchResults { query, messages });
        }
        ClientFrame::LeaveDiscussion => return ControlFlow::Break(()),
        ClientFrame::Ping => session.reply(ServerFrame::Pong),
        ClientFrame::JoinDiscussion { .. } => {
            session.reply(ServerFrame::error(
                "Already joined a discussion on this connection",
            ));
        }
    }

    ControlFlow::Continue(())
}

/// Remove a participant and broadcast the updated member list
async fn depart(session: &Session) {
    let mut r = session.room.write().await;
    r.peers.remove(&session.user_id);

    if let Some(departure) = r.room.leave(session.user_id) {
        if departure.was_typing {
            r.broadcast(
                ServerFrame::UserTyping {
                    user_id: session.user_id,
                    is_typing: false,
                },
                None,
            );
        }

        let update = ServerFrame::ActiveUsersUpdate {
            active_users: r.active_users(),
        };
        r.broadcast(update, None);
    }
}

/// Clears typing flags whose debounce window has lapsed
async fn typing_sweep_task(
    state: Arc<RwLock<ServerState>>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let rooms: Vec<SharedRoom> = state.read().await.rooms.values().cloned().collect();
                let now = Instant::now();

                for room in rooms {
                    let mut r = room.write().await;
                    for user_id in r.room.expire_typing(now) {
                        debug!(user_id = %user_id, "Typing flag expired");
                        r.broadcast(
                            ServerFrame::UserTyping { user_id, is_typing: false },
                            Some(user_id),
                        );
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Typing sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{RoomSettings, MAX_CONTENT_CHARS, TYPING_WINDOW};
    use tokio::io::AsyncReadExt;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        }
    }

    async fn raw_join(addr: SocketAddr, event: &str, name: &str) -> (TcpStream, Uuid) {
        let user_id = Uuid::new_v4();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &ClientFrame::JoinDiscussion {
                event_id: EventId::from(event),
                user_id,
                name: name.to_string(),
                email: None,
            },
        )
        .await
        .unwrap();
        (stream, user_id)
    }

    async fn next(stream: &mut TcpStream) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
    }

    /// Join and consume the snapshot and the member list update
    async fn joined(addr: SocketAddr, event: &str, name: &str) -> (TcpStream, Uuid) {
        let (mut stream, user_id) = raw_join(addr, event, name).await;
        assert!(matches!(
            next(&mut stream).await,
            ServerFrame::DiscussionJoined { .. }
        ));
        assert!(matches!(
            next(&mut stream).await,
            ServerFrame::ActiveUsersUpdate { .. }
        ));
        (stream, user_id)
    }

    async fn say(stream: &mut TcpStream, content: &str, reply_to: Option<Uuid>) -> Message {
        write_frame(
            stream,
            &ClientFrame::SendMessage {
                correlation_id: Uuid::new_v4(),
                content: content.to_string(),
                reply_to,
            },
        )
        .await
        .unwrap();
        loop {
            if let ServerFrame::NewMessage {
                message,
                correlation_id: Some(_),
            } = next(stream).await
            {
                return message;
            }
        }
    }

    fn bare_room() -> RoomState {
        RoomState {
            room: DiscussionRoom::new(EventId::from("evt-1"), RoomSettings::default(), TYPING_WINDOW),
            peers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_server_start() {
        let server = Server::start(test_config(), None).await.unwrap();
        assert!(server.addr().port() > 0);
        assert!(server.rooms().await.is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_join_snapshot_then_member_list() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, user_id) = raw_join(server.addr(), "evt-1", "alice").await;

        match next(&mut stream).await {
            ServerFrame::DiscussionJoined {
                event_id,
                messages,
                active_users,
                ..
            } => {
                assert_eq!(event_id.as_str(), "evt-1");
                assert!(messages.is_empty());
                assert_eq!(active_users.len(), 1);
                assert_eq!(active_users[0].user_id, user_id);
            }
            other => panic!("expected discussion_joined, got {:?}", other),
        }
        assert!(matches!(
            next(&mut stream).await,
            ServerFrame::ActiveUsersUpdate { .. }
        ));

        assert_eq!(server.rooms().await, vec![EventId::from("evt-1")]);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_join() {
        let server = Server::start(test_config(), None).await.unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        write_frame(&mut stream, &ClientFrame::Ping).await.unwrap();

        assert!(matches!(next(&mut stream).await, ServerFrame::Error { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut first, user_id) = raw_join(server.addr(), "evt-1", "alice").await;
        next(&mut first).await;
        next(&mut first).await;

        let mut second = TcpStream::connect(server.addr()).await.unwrap();
        write_frame(
            &mut second,
            &ClientFrame::JoinDiscussion {
                event_id: EventId::from("evt-1"),
                user_id,
                name: "alice".into(),
                email: None,
            },
        )
        .await
        .unwrap();

        assert!(matches!(next(&mut second).await, ServerFrame::Error { .. }));
        assert_eq!(server.active_users(&EventId::from("evt-1")).await.len(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_second_join_on_connection_errors() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, user_id) = raw_join(server.addr(), "evt-1", "alice").await;
        next(&mut stream).await;
        next(&mut stream).await;

        write_frame(
            &mut stream,
            &ClientFrame::JoinDiscussion {
                event_id: EventId::from("evt-2"),
                user_id,
                name: "alice".into(),
                email: None,
            },
        )
        .await
        .unwrap();

        assert!(matches!(next(&mut stream).await, ServerFrame::Error { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_message_not_appended() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, _) = raw_join(server.addr(), "evt-1", "alice").await;
        next(&mut stream).await;
        next(&mut stream).await;

        write_frame(
            &mut stream,
            &ClientFrame::SendMessage {
                correlation_id: Uuid::new_v4(),
                content: "a".repeat(MAX_CONTENT_CHARS + 1),
                reply_to: None,
            },
        )
        .await
        .unwrap();

        // The ping is answered after the send was processed
        write_frame(&mut stream, &ClientFrame::Ping).await.unwrap();
        assert!(matches!(next(&mut stream).await, ServerFrame::Pong));
        assert!(server.history(&EventId::from("evt-1")).await.is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reaction_on_unknown_message_errors() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, _) = raw_join(server.addr(), "evt-1", "alice").await;
        next(&mut stream).await;
        next(&mut stream).await;

        write_frame(
            &mut stream,
            &ClientFrame::AddReaction {
                message_id: Uuid::new_v4(),
                emoji: "👍".into(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(next(&mut stream).await, ServerFrame::Error { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_notifies_connections() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, _) = raw_join(server.addr(), "evt-1", "alice").await;
        next(&mut stream).await;
        next(&mut stream).await;

        server.shutdown();
        assert!(matches!(next(&mut stream).await, ServerFrame::ServerShutdown));
    }

    #[tokio::test]
    async fn test_full_queue_drops_peer() {
        let mut state = bare_room();
        let (tx, mut rx) = mpsc::channel(1);
        let kick = Arc::new(Notify::new());
        let slow = Uuid::new_v4();
        state.peers.insert(
            slow,
            Peer {
                tx,
                kick: kick.clone(),
            },
        );

        state.broadcast(ServerFrame::Pong, None);
        assert!(state.peers.contains_key(&slow));

        // Second frame finds the queue full and returns immediately
        state.broadcast(ServerFrame::Pong, None);
        assert!(!state.peers.contains_key(&slow));
        tokio::time::timeout(Duration::from_secs(1), kick.notified())
            .await
            .expect("evicted connection was not told to close");

        assert!(matches!(rx.recv().await, Some(ServerFrame::Pong)));
    }

    #[tokio::test]
    async fn test_closed_queue_drops_peer() {
        let mut state = bare_room();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let gone = Uuid::new_v4();
        let kick = Arc::new(Notify::new());
        state.peers.insert(
            gone,
            Peer {
                tx,
                kick: kick.clone(),
            },
        );

        state.deliver(gone, ServerFrame::Pong);
        assert!(state.peers.is_empty());
    }

    #[tokio::test]
    async fn test_reader_that_never_reads_does_not_stall_room() {
        let server = Server::start(test_config(), None).await.unwrap();
        let event = EventId::from("evt-1");

        // Joins, then never reads, with a tiny receive window
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let mut stalled = socket.connect(server.addr()).await.unwrap();
        write_frame(
            &mut stalled,
            &ClientFrame::JoinDiscussion {
                event_id: event.clone(),
                user_id: Uuid::new_v4(),
                name: "stalled".into(),
                email: None,
            },
        )
        .await
        .unwrap();

        let (busy, _) = joined(server.addr(), "evt-1", "bob").await;
        let (mut busy_reader, mut busy_writer) = busy.into_split();
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while let Ok(n) = busy_reader.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let content = "x".repeat(MAX_CONTENT_CHARS);
        let _ = tokio::time::timeout(Duration::from_secs(20), async {
            for _ in 0..3000 {
                let frame = ClientFrame::SendMessage {
                    correlation_id: Uuid::new_v4(),
                    content: content.clone(),
                    reply_to: None,
                };
                if write_frame(&mut busy_writer, &frame).await.is_err() {
                    break;
                }
            }
        })
        .await;

        let history = tokio::time::timeout(Duration::from_secs(3), server.history(&event)).await;
        assert!(history.is_ok(), "room lock still held");

        let (mut late, _) = raw_join(server.addr(), "evt-1", "carol").await;
        let snapshot = tokio::time::timeout(
            Duration::from_secs(3),
            read_frame::<_, ServerFrame>(&mut late),
        )
        .await;
        assert!(matches!(
            snapshot,
            Ok(Ok(ServerFrame::DiscussionJoined { .. }))
        ));

        drop(stalled);
        drain.abort();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_room_full_rejects_join() {
        let config = ServerConfig {
            max_peers_per_room: 1,
            ..test_config()
        };
        let server = Server::start(config, None).await.unwrap();
        let (_first, _) = joined(server.addr(), "evt-1", "alice").await;

        let (mut second, _) = raw_join(server.addr(), "evt-1", "bob").await;
        match next(&mut second).await {
            ServerFrame::Error { message } => assert_eq!(message, Error::RoomFull.to_string()),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(server.active_users(&EventId::from("evt-1")).await.len(), 1);

        // Other rooms are unaffected
        joined(server.addr(), "evt-2", "bob").await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_edit_reaches_every_connection() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut alice, _) = joined(server.addr(), "evt-1", "alice").await;
        let (mut bob, _) = joined(server.addr(), "evt-1", "bob").await;
        next(&mut alice).await; // bob's arrival

        let original = say(&mut alice, "helo", None).await;
        assert!(matches!(next(&mut bob).await, ServerFrame::NewMessage { .. }));

        write_frame(
            &mut alice,
            &ClientFrame::EditMessage {
                message_id: original.id,
                content: "hello".into(),
            },
        )
        .await
        .unwrap();

        for stream in [&mut alice, &mut bob] {
            match next(stream).await {
                ServerFrame::MessageUpdated { message } => {
                    assert_eq!(message.id, original.id);
                    assert_eq!(message.content, "hello");
                    assert!(message.is_edited);
                }
                other => panic!("expected message_updated, got {:?}", other),
            }
        }

        // Only the author may edit
        write_frame(
            &mut bob,
            &ClientFrame::EditMessage {
                message_id: original.id,
                content: "hijacked".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(next(&mut bob).await, ServerFrame::Error { .. }));
        assert_eq!(server.history(&EventId::from("evt-1")).await[0].content, "hello");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reactions_disabled_rejected() {
        let config = ServerConfig {
            room: RoomSettings {
                allow_reactions: false,
                ..RoomSettings::default()
            },
            ..test_config()
        };
        let server = Server::start(config, None).await.unwrap();
        let (mut stream, _) = joined(server.addr(), "evt-1", "alice").await;
        let message = say(&mut stream, "no emoji please", None).await;

        write_frame(
            &mut stream,
            &ClientFrame::AddReaction {
                message_id: message.id,
                emoji: "👍".into(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(next(&mut stream).await, ServerFrame::Error { .. }));
        let history = server.history(&EventId::from("evt-1")).await;
        assert!(history[0].reactions.is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_history_limit_caps_snapshot() {
        let config = ServerConfig {
            history_limit: Some(3),
            ..test_config()
        };
        let server = Server::start(config, None).await.unwrap();
        let (mut alice, _) = joined(server.addr(), "evt-1", "alice").await;
        for i in 0..5 {
            say(&mut alice, &format!("m{i}"), None).await;
        }

        let (mut bob, _) = raw_join(server.addr(), "evt-1", "bob").await;
        match next(&mut bob).await {
            ServerFrame::DiscussionJoined {
                messages, stats, ..
            } => {
                let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["m2", "m3", "m4"]);
                assert_eq!(stats.total_messages, 5);
            }
            other => panic!("expected discussion_joined, got {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_load_history_pages_backwards() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, _) = joined(server.addr(), "evt-1", "alice").await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(say(&mut stream, &format!("m{i}"), None).await.id);
        }

        write_frame(
            &mut stream,
            &ClientFrame::LoadHistory {
                before: Some(ids[2]),
                limit: Some(10),
            },
        )
        .await
        .unwrap();
        match next(&mut stream).await {
            ServerFrame::HistoryPage { messages, has_more } => {
                let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["m0", "m1"]);
                assert!(!has_more);
            }
            other => panic!("expected history_page, got {:?}", other),
        }

        write_frame(
            &mut stream,
            &ClientFrame::LoadHistory {
                before: Some(Uuid::new_v4()),
                limit: None,
            },
        )
        .await
        .unwrap();
        assert!(matches!(next(&mut stream).await, ServerFrame::Error { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_replies_and_search() {
        let server = Server::start(test_config(), None).await.unwrap();
        let (mut stream, _) = joined(server.addr(), "evt-1", "alice").await;
        let root = say(&mut stream, "Where is lunch?", None).await;
        say(&mut stream, "Hall B", Some(root.id)).await;
        say(&mut stream, "Lunch moved to noon", None).await;

        write_frame(
            &mut stream,
            &ClientFrame::GetReplies {
                message_id: root.id,
            },
        )
        .await
        .unwrap();
        match next(&mut stream).await {
            ServerFrame::Replies {
                message_id,
                messages,
            } => {
                assert_eq!(message_id, root.id);
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "Hall B");
            }
            other => panic!("expected replies, got {:?}", other),
        }

        write_frame(
            &mut stream,
            &ClientFrame::SearchMessages {
                query: "LUNCH".into(),
                limit: None,
            },
        )
        .await
        .unwrap();
        match next(&mut stream).await {
            ServerFrame::SearchResults { query, messages } => {
                assert_eq!(query, "LUNCH");
                let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["Lunch moved to noon", "Where is lunch?"]);
            }
            other => panic!("expected search_results, got {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_archive_writes_land_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.db");
        let archive: SharedArchive =
            Arc::new(Mutex::new(agora_core::Database::open(&path).unwrap()));
        let server = Server::start(test_config(), Some(archive)).await.unwrap();

        let (mut stream, _) = joined(server.addr(), "evt-1", "alice").await;
        let message = say(&mut stream, "persist me", None).await;
        write_frame(
            &mut stream,
            &ClientFrame::AddReaction {
                message_id: message.id,
                emoji: "🎉".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            next(&mut stream).await,
            ServerFrame::ReactionUpdated { .. }
        ));

        // The reaction update only lands if the insert ran first
        let reader = agora_core::Database::open(&path).unwrap();
        let stored = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(history) = reader.load_history(&EventId::from("evt-1"), None) {
                    if history.first().is_some_and(|m| m.reactions.count("🎉") == 1) {
                        return history;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("archive never caught up");

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, message.id);
        server.shutdown();
    }
}
