//! TCP client for joining an event discussion
//!
//! A [`Client`] owns one connection to one room. A background task owns the
//! socket: it applies server frames to the shared [`RoomView`], drives the
//! typing debounce and keepalive, and reconnects with backoff when the
//! transport drops. Dropping the client stops the task and closes the
//! socket.
//!
//! The view is authoritative. Events are a change feed on a bounded queue;
//! when the application falls behind, new events are discarded and counted
//! rather than stalling the connection.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use agora_core::{
    normalize_content, normalize_emoji, EventId, Message, ReactionLedger, TYPING_WINDOW,
};
use rand::Rng;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::identity::Identity;
use crate::protocol::{ActiveUser, ClientFrame, ServerFrame};
use crate::view::{PendingSend, RoomView};

/// Backoff schedule between reconnect attempts, last entry repeats
const RECONNECT_DELAYS_MS: &[u64] = &[500, 1000, 2000, 5000, 10000];

const EVENT_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 64;
const FRAME_QUEUE: usize = 64;

/// How long `leave` waits for the goodbye to be written
const LEAVE_TIMEOUT_MS: u64 = 2000;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Opening the socket and waiting for the room snapshot
    Connecting,
    Joined,
    Reconnecting { attempt: u32 },
    /// Terminal, after an explicit leave
    Left,
}

/// Something that changed in the room or the connection
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A snapshot replaced the local view
    Joined { event_id: EventId, history: usize },
    MessageReceived(Message),
    /// The server accepted one of our sends
    SendConfirmed { correlation_id: Uuid, message_id: Uuid },
    MessageEdited(Message),
    ActiveUsersChanged(Vec<ActiveUser>),
    TypingChanged { user_id: Uuid, is_typing: bool },
    ReactionsChanged {
        message_id: Uuid,
        reactions: ReactionLedger,
    },
    /// An older page was prepended to the view
    HistoryLoaded { added: usize, has_more: bool },
    /// Answer to [`Client::fetch_replies`], oldest first
    Replies {
        message_id: Uuid,
        messages: Vec<Message>,
    },
    /// Answer to [`Client::search`], newest first
    SearchResults {
        query: String,
        messages: Vec<Message>,
    },
    /// Error reported by the server or the connection
    Error(String),
    ServerShutdown,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delays_ms: Vec<u64>,
    pub max_attempts: u32,
    /// Upper bound of the random delay added to each wait
    pub jitter_ms: u64,
}

impl ReconnectPolicy {
    /// Give up as soon as the connection drops
    pub fn none() -> Self {
        Self {
            delays_ms: Vec::new(),
            max_attempts: 0,
            jitter_ms: 0,
        }
    }

    /// Wait before the zero-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = match self.delays_ms.as_slice() {
            [] => 0,
            delays => delays[(attempt as usize).min(delays.len() - 1)],
        };
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delays_ms: RECONNECT_DELAYS_MS.to_vec(),
            max_attempts: 8,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long to wait for the room snapshot
    pub join_timeout: Duration,
    /// Quiet time after the last keystroke before typing stops
    pub typing_window: Duration,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            typing_window: TYPING_WINDOW,
            ping_interval: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Client handle for one room visit
pub struct Client {
    user_id: Uuid,
    event_id: EventId,
    shared: Arc<RwLock<ClientShared>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
    task: Option<JoinHandle<()>>,
}

struct ClientShared {
    connection: ConnectionState,
    view: RoomView,
    /// Events discarded because the queue was full
    dropped_events: u64,
}

enum ClientCommand {
    Send(PendingSend),
    Edit { message_id: Uuid, content: String },
    React { message_id: Uuid, emoji: String },
    Keystroke,
    StopTyping,
    LoadHistory { before: Option<Uuid>, limit: usize },
    Replies { message_id: Uuid },
    Search { query: String, limit: Option<usize> },
    Leave,
}

impl Client {
    /// Join the discussion for `event_id` as `identity`
    pub async fn connect(
        addr: SocketAddr,
        event_id: EventId,
        identity: &Identity,
        options: ClientOptions,
    ) -> Result<Self> {
        if !event_id.is_valid() {
            return Err(Error::Rejected("Invalid event id".into()));
        }
        if identity.id.is_nil() || identity.name.trim().is_empty() {
            return Err(Error::IdentityMissing("incomplete identity".into()));
        }

        info!(addr = %addr, event_id = %event_id, "Connecting to discussion");

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let _ = event_tx.try_send(ClientEvent::StateChanged(ConnectionState::Connecting));

        let (reader, writer, snapshot) =
            tokio::time::timeout(options.join_timeout, establish(addr, identity, &event_id))
                .await
                .map_err(|_| Error::JoinTimeout)??;

        let mut view = RoomView::new(event_id.clone(), identity.id);
        let initial = view.apply(snapshot);

        let shared = Arc::new(RwLock::new(ClientShared {
            connection: ConnectionState::Joined,
            view,
            dropped_events: 0,
        }));

        let _ = event_tx.try_send(ClientEvent::StateChanged(ConnectionState::Joined));
        for event in initial {
            let _ = event_tx.try_send(event);
        }

        info!(event_id = %event_id, user_id = %identity.id, "Joined discussion");

        let link = Link {
            addr,
            event_id: event_id.clone(),
            identity: identity.clone(),
            options,
            shared: shared.clone(),
            event_tx,
            cmd_rx,
        };
        let task = tokio::spawn(connection_task(reader, writer, link));

        Ok(Client {
            user_id: identity.id,
            event_id,
            shared,
            event_rx,
            cmd_tx,
            task: Some(task),
        })
    }

    /// Get the next event
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    /// Get an event if one is already queued
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.read().await.connection
    }

    /// Snapshot of the local room view
    pub async fn view(&self) -> RoomView {
        self.shared.read().await.view.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.shared.read().await.view.messages().to_vec()
    }

    pub async fn active_users(&self) -> Vec<ActiveUser> {
        self.shared.read().await.view.active_users().to_vec()
    }

    pub async fn typing_summary(&self) -> Option<String> {
        self.shared.read().await.view.typing_summary()
    }

    /// Events discarded so far because they were not consumed in time
    pub async fn dropped_events(&self) -> u64 {
        self.shared.read().await.dropped_events
    }

    /// Send a message. Blank or over-long content is ignored and yields
    /// `Ok(None)`; otherwise returns the send's correlation id.
    pub async fn send(&self, content: &str, reply_to: Option<Uuid>) -> Result<Option<Uuid>> {
        let Some(content) = normalize_content(content) else {
            debug!(event_id = %self.event_id, "Ignoring empty or oversized message");
            return Ok(None);
        };

        let pending = {
            let mut shared = self.shared.write().await;
            if !is_open(shared.connection) {
                return Err(Error::NotConnected);
            }
            let reply_to = reply_to.filter(|_| shared.view.settings().allow_replies);
            shared.view.queue_send(content, reply_to)
        };
        let correlation_id = pending.correlation_id;

        self.command(ClientCommand::Send(pending)).await?;
        Ok(Some(correlation_id))
    }

    /// Replace the content of one of our messages. Returns false when the
    /// new content is blank or over-long.
    pub async fn edit_message(&self, message_id: Uuid, content: &str) -> Result<bool> {
        let Some(content) = normalize_content(content) else {
            return Ok(false);
        };
        self.ensure_joined().await?;
        self.command(ClientCommand::Edit {
            message_id,
            content,
        })
        .await?;
        Ok(true)
    }

    /// Toggle a reaction on a message
    pub async fn add_reaction(&self, message_id: Uuid, emoji: &str) -> Result<()> {
        let emoji = normalize_emoji(emoji)
            .ok_or_else(|| agora_core::Error::Validation(format!("Invalid emoji: {:?}", emoji)))?;

        {
            let shared = self.shared.read().await;
            if shared.connection != ConnectionState::Joined {
                return Err(Error::NotConnected);
            }
            if !shared.view.settings().allow_reactions {
                return Err(agora_core::Error::InvalidOperation(
                    "Reactions are disabled in this discussion".into(),
                )
                .into());
            }
        }

        self.command(ClientCommand::React { message_id, emoji })
            .await
    }

    /// Report a keystroke; typing stops after the debounce window
    pub async fn keystroke(&self) -> Result<()> {
        self.ensure_joined().await?;
        self.command(ClientCommand::Keystroke).await
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<()> {
        self.ensure_joined().await?;
        let command = if is_typing {
            ClientCommand::Keystroke
        } else {
            ClientCommand::StopTyping
        };
        self.command(command).await
    }

    /// Fetch up to `limit` messages older than the oldest one in the view.
    /// They are prepended to the view and announced with
    /// [`ClientEvent::HistoryLoaded`].
    pub async fn load_older(&self, limit: usize) -> Result<()> {
        let before = {
            let shared = self.shared.read().await;
            if shared.connection != ConnectionState::Joined {
                return Err(Error::NotConnected);
            }
            shared.view.oldest_message_id()
        };
        self.command(ClientCommand::LoadHistory { before, limit })
            .await
    }

    /// Ask for the replies to a message; answered with [`ClientEvent::Replies`]
    pub async fn fetch_replies(&self, message_id: Uuid) -> Result<()> {
        self.ensure_joined().await?;
        self.command(ClientCommand::Replies { message_id }).await
    }

    /// Search content and author names; answered with
    /// [`ClientEvent::SearchResults`]
    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<()> {
        let query = query.trim();
        if query.is_empty() {
            return Err(agora_core::Error::Validation("Empty search query".into()).into());
        }
        self.ensure_joined().await?;
        self.command(ClientCommand::Search {
            query: query.to_string(),
            limit,
        })
        .await
    }

    /// Leave the discussion and close the connection
    pub async fn leave(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        let _ = self.cmd_tx.send(ClientCommand::Leave).await;

        let abort = task.abort_handle();
        if tokio::time::timeout(Duration::from_millis(LEAVE_TIMEOUT_MS), task)
            .await
            .is_err()
        {
            warn!(event_id = %self.event_id, "Leave did not complete, closing");
            abort.abort();
        }

        self.shared.write().await.connection = ConnectionState::Left;
        info!(event_id = %self.event_id, user_id = %self.user_id, "Left discussion");
        Ok(())
    }

    /// Edits, reactions, typing and queries need a live session; only
    /// sends are kept for replay while reconnecting
    async fn ensure_joined(&self) -> Result<()> {
        if self.shared.read().await.connection == ConnectionState::Joined {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn command(&self, command: ClientCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::NotConnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn is_open(state: ConnectionState) -> bool {
    !matches!(
        state,
        ConnectionState::Disconnected | ConnectionState::Left
    )
}

/// Everything the connection task needs across reconnects
struct Link {
    addr: SocketAddr,
    event_id: EventId,
    identity: Identity,
    options: ClientOptions,
    shared: Arc<RwLock<ClientShared>>,
    event_tx: mpsc::Sender<ClientEvent>,
    cmd_rx: mpsc::Receiver<ClientCommand>,
}

impl Link {
    async fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            let mut shared = self.shared.write().await;
            shared.dropped_events += 1;
            if shared.dropped_events == 1 {
                warn!(event_id = %self.event_id, "Event queue full, discarding events");
            }
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        self.shared.write().await.connection = state;
        self.emit(ClientEvent::StateChanged(state)).await;
    }

    async fn apply(&self, frame: ServerFrame) {
        let events = self.shared.write().await.view.apply(frame);
        for event in events {
            self.emit(event).await;
        }
    }
}

enum SessionEnd {
    Left,
    Lost(String),
}

enum Reconnect {
    Joined(ReadHalf<TcpStream>, WriteHalf<TcpStream>),
    Cancelled,
    Exhausted,
}

/// Open a connection and wait for the room snapshot
async fn establish(
    addr: SocketAddr,
    identity: &Identity,
    event_id: &EventId,
) -> Result<(ReadHalf<TcpStream>, WriteHalf<TcpStream>, ServerFrame)> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let join = ClientFrame::JoinDiscussion {
        event_id: event_id.clone(),
        user_id: identity.id,
        name: identity.name.clone(),
        email: identity.email.clone(),
    };
    write_frame(&mut writer, &join).await?;

    match read_frame(&mut reader).await? {
        frame @ ServerFrame::DiscussionJoined { .. } => Ok((reader, writer, frame)),
        ServerFrame::Error { message } if message == Error::RoomFull.to_string() => {
            Err(Error::RoomFull)
        }
        ServerFrame::Error { message } => Err(Error::Rejected(message)),
        other => Err(Error::Protocol(format!(
            "Unexpected frame before join: {:?}",
            other
        ))),
    }
}

/// Main connection task
async fn connection_task(
    reader: ReadHalf<TcpStream>,
    writer: WriteHalf<TcpStream>,
    mut link: Link,
) {
    let (mut reader, mut writer) = (reader, writer);

    loop {
        match run_session(reader, writer, &mut link).await {
            SessionEnd::Left => {
                link.set_state(ConnectionState::Left).await;
                return;
            }
            SessionEnd::Lost(reason) => {
                warn!(event_id = %link.event_id, reason = %reason, "Connection lost");
                link.shared.write().await.view.mark_disconnected();

                match reconnect(&mut link).await {
                    Reconnect::Joined(r, w) => {
                        reader = r;
                        writer = w;
                    }
                    Reconnect::Cancelled => {
                        link.set_state(ConnectionState::Left).await;
                        return;
                    }
                    Reconnect::Exhausted => {
                        link.emit(ClientEvent::Error(Error::Transport(reason).to_string()))
                            .await;
                        link.set_state(ConnectionState::Disconnected).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Drive one joined connection until it ends
async fn run_session(
    reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    link: &mut Link,
) -> SessionEnd {
    let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_QUEUE);
    let reader_handle = tokio::spawn(reader_task(reader, frame_tx));

    let end = session_loop(&mut writer, &mut frame_rx, link).await;

    reader_handle.abort();
    let _ = writer.shutdown().await;
    end
}

/// Reader task - forwards frames from the server
async fn reader_task(
    mut reader: ReadHalf<TcpStream>,
    frame_tx: mpsc::Sender<Result<ServerFrame>>,
) {
    loop {
        let result = read_frame(&mut reader).await;
        let failed = result.is_err();
        if frame_tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn session_loop(
    writer: &mut WriteHalf<TcpStream>,
    frames: &mut mpsc::Receiver<Result<ServerFrame>>,
    link: &mut Link,
) -> SessionEnd {
    let window = link.options.typing_window;
    let ping_interval = link.options.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut typing_deadline: Option<Instant> = None;

    loop {
        let deadline = typing_deadline;
        let typing_expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(Ok(ServerFrame::ServerShutdown)) => {
                        link.apply(ServerFrame::ServerShutdown).await;
                        return SessionEnd::Lost("Server shutting down".into());
                    }
                    Some(Ok(frame)) => link.apply(frame).await,
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("Reader stopped".into()),
                }
            }
            command = link.cmd_rx.recv() => {
                // Client dropped
                let Some(command) = command else {
                    return SessionEnd::Left;
                };
                match handle_command(writer, command, &mut typing_deadline, window).await {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => return SessionEnd::Left,
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                }
            }
            _ = typing_expired => {
                typing_deadline = None;
                if let Err(e) = write_frame(writer, &ClientFrame::Typing { is_typing: false }).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write_frame(writer, &ClientFrame::Ping).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
        }
    }
}

async fn handle_command(
    writer: &mut WriteHalf<TcpStream>,
    command: ClientCommand,
    typing_deadline: &mut Option<Instant>,
    window: Duration,
) -> Result<ControlFlow<()>> {
    match command {
        ClientCommand::Send(pending) => {
            // Sending ends the typing burst
            if typing_deadline.take().is_some() {
                write_frame(writer, &ClientFrame::Typing { is_typing: false }).await?;
            }
            write_frame(writer, &send_frame(&pending)).await?;
        }
        ClientCommand::Edit {
            message_id,
            content,
        } => {
            write_frame(
                writer,
                &ClientFrame::EditMessage {
                    message_id,
                    content,
                },
            )
            .await?;
        }
        ClientCommand::React { message_id, emoji } => {
            write_frame(writer, &ClientFrame::AddReaction { message_id, emoji }).await?;
        }
        ClientCommand::Keystroke => {
            *typing_deadline = Some(Instant::now() + window);
            write_frame(writer, &ClientFrame::Typing { is_typing: true }).await?;
        }
        ClientCommand::StopTyping => {
            if typing_deadline.take().is_some() {
                write_frame(writer, &ClientFrame::Typing { is_typing: false }).await?;
            }
        }
        ClientCommand::LoadHistory { before, limit } => {
            write_frame(
                writer,
                &ClientFrame::LoadHistory {
                    before,
                    limit: Some(limit),
                },
            )
            .await?;
        }
        ClientCommand::Replies { message_id } => {
            write_frame(writer, &ClientFrame::GetReplies { message_id }).await?;
        }
        ClientCommand::Search { query, limit } => {
            write_frame(writer, &ClientFrame::SearchMessages { query, limit }).await?;
        }
        ClientCommand::Leave => {
            let _ = write_frame(writer, &ClientFrame::LeaveDiscussion).await;
            return Ok(ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

fn send_frame(pending: &PendingSend) -> ClientFrame {
    ClientFrame::SendMessage {
        correlation_id: pending.correlation_id,
        content: pending.content.clone(),
        reply_to: pending.reply_to,
    }
}

/// Rejoin with backoff, replaying unacknowledged sends
async fn reconnect(link: &mut Link) -> Reconnect {
    let policy = link.options.reconnect.clone();

    for attempt in 1..=policy.max_attempts {
        link.set_state(ConnectionState::Reconnecting { attempt })
            .await;

        let delay = policy.delay(attempt - 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        if wait_or_leave(link, delay).await {
            return Reconnect::Cancelled;
        }

        let attempt_result = tokio::time::timeout(
            link.options.join_timeout,
            establish(link.addr, &link.identity, &link.event_id),
        )
        .await;

        match attempt_result {
            Ok(Ok((reader, mut writer, snapshot))) => {
                link.apply(snapshot).await;

                let pending = link.shared.read().await.view.pending().to_vec();
                let mut replayed = Ok(());
                for send in &pending {
                    if let Err(e) = write_frame(&mut writer, &send_frame(send)).await {
                        replayed = Err(e);
                        break;
                    }
                }

                match replayed {
                    Ok(()) => {
                        info!(
                            event_id = %link.event_id,
                            attempt,
                            replayed = pending.len(),
                            "Rejoined discussion"
                        );
                        link.set_state(ConnectionState::Joined).await;
                        return Reconnect::Joined(reader, writer);
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Replay failed");
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "Reconnect failed");
            }
            Err(_) => {
                warn!(attempt, "Reconnect timed out");
            }
        }
    }

    Reconnect::Exhausted
}

/// Sleep for `delay`; true when the user left in the meantime
async fn wait_or_leave(link: &mut Link, delay: Duration) -> bool {
    let pause = sleep(delay);
    tokio::pin!(pause);

    loop {
        tokio::select! {
            _ = &mut pause => return false,
            command = link.cmd_rx.recv() => {
                match command {
                    Some(ClientCommand::Leave) | None => return true,
                    // Sends stay pending and are replayed after rejoining
                    Some(ClientCommand::Send(_)) => {}
                    // Issued just before the connection dropped
                    Some(_) => {
                        debug!("Discarding command while reconnecting");
                        link.emit(ClientEvent::Error(Error::NotConnected.to_string())).await;
                    }
                }
            }
        }
    }
}
