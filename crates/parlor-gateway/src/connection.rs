use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parlor_types::api::Caller;
use parlor_types::events::{ClientCommand, ClientEnvelope, SendPayload, ServerEvent};

use crate::hub::{Hub, Payload};

/// Time allowed to write a single frame.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Connection is dropped when nothing (not even a pong) arrives for this long.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping period; must be shorter than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_INCOMING_BYTES: usize = 512 * 1024;
pub const OUTBOUND_CAPACITY: usize = 128;

/// Per-connection context handed to the frame handler.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: Uuid,
    pub caller: Caller,
    /// Room given at connect time; used when a `send` frame names none.
    pub room: String,
}

/// How the handler disposed of an inbound `send` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Accepted,
    /// Rejected without telling the client.
    Dropped,
    /// Rejected; the message is reported back to this connection only.
    Rejected(String),
}

/// Application side of the gateway: builds the `init` snapshot and decides
/// what a `send` frame does.
pub trait FrameHandler: Send + Sync + 'static {
    /// Serialized `init` event for a freshly registered connection. Called
    /// after the connection joined the hub, so anything broadcast while the
    /// snapshot loads is already queued. `None` aborts the connection.
    fn snapshot(&self, session: &Session) -> impl Future<Output = Option<Payload>> + Send;

    fn on_send(
        &self,
        session: &Session,
        payload: SendPayload,
    ) -> impl Future<Output = FrameOutcome> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Forward-only connection state, shared by both loops.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ConnectionState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connecting),
        }
    }
}

impl Lifecycle {
    /// Move to `next` if it lies ahead of the current state. Returns whether
    /// the transition happened, so teardown steps run once no matter which
    /// loop asks first.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Read-side liveness: every received frame (pongs included) pushes the
/// deadline out by `PONG_WAIT`.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    last_seen: Instant,
    deadline: Instant,
}

impl Liveness {
    pub fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            deadline: now + PONG_WAIT,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.deadline = now + PONG_WAIT;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Drive one gateway connection from handshake to close.
///
/// The connection joins the hub before its snapshot is taken, and `init` is
/// written ahead of anything queued meanwhile. A message can therefore show
/// up both in `init` and as a later `message` event; clients dedupe by id.
pub async fn handle_connection<H: FrameHandler>(
    socket: WebSocket,
    hub: Hub,
    handler: Arc<H>,
    caller: Caller,
    room: String,
) {
    let lifecycle = Arc::new(Lifecycle::default());
    let registration = hub.register(OUTBOUND_CAPACITY);
    let conn_id = registration.conn_id;

    let session = Session {
        conn_id,
        caller,
        room,
    };

    let Some(init) = handler.snapshot(&session).await else {
        warn!("No init snapshot for conn {}, closing", conn_id);
        teardown(&hub, &lifecycle, conn_id);
        return;
    };

    info!(
        "{} ({}) connected to chat gateway, room {}, conn {}",
        display_user(&session.caller),
        session.caller.user_id,
        session.room,
        conn_id
    );

    lifecycle.advance(ConnectionState::Open);

    let (sender, receiver) = socket.split();

    let send_lifecycle = lifecycle.clone();
    let mut send_task = tokio::spawn(async move {
        write_loop(sender, init, registration.outbound, conn_id).await;
        send_lifecycle.advance(ConnectionState::Closing);
    });

    let recv_lifecycle = lifecycle.clone();
    let direct = registration.direct;
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        read_loop(receiver, handler.as_ref(), &recv_session, &direct).await;
        recv_lifecycle.advance(ConnectionState::Closing);
    });

    // Wait for either loop to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if teardown(&hub, &lifecycle, conn_id) {
        info!(
            "{} ({}) disconnected from chat gateway, conn {}",
            display_user(&session.caller),
            session.caller.user_id,
            conn_id
        );
    }
}

/// Leave the hub exactly once. Returns false when the connection was
/// already torn down.
fn teardown(hub: &Hub, lifecycle: &Lifecycle, conn_id: Uuid) -> bool {
    lifecycle.advance(ConnectionState::Closing);
    if !lifecycle.advance(ConnectionState::Closed) {
        return false;
    }
    hub.unregister(conn_id);
    true
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    init: Payload,
    mut outbound: mpsc::Receiver<Payload>,
    conn_id: Uuid,
) {
    if let Err(e) = write_frame(&mut sender, Message::Text(init)).await {
        debug!("Init write failed for conn {}: {}", conn_id, e);
        return;
    }

    let mut heartbeat = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(payload) = next else {
                    // Queue released: say goodbye and stop.
                    let _ = write_frame(&mut sender, Message::Close(None)).await;
                    debug!("Outbound queue closed for conn {}", conn_id);
                    break;
                };
                if let Err(e) = write_frame(&mut sender, Message::Text(payload)).await {
                    debug!("Write failed for conn {}: {}", conn_id, e);
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = write_frame(&mut sender, Message::Ping(Bytes::new())).await {
                    debug!("Ping failed for conn {}: {}", conn_id, e);
                    break;
                }
                trace!("Ping sent to conn {}", conn_id);
            }
        }
    }
}

async fn write_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: Message,
) -> anyhow::Result<()> {
    match tokio::time::timeout(WRITE_WAIT, sender.send(frame)).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(anyhow!("write deadline exceeded")),
    }
}

async fn read_loop<H: FrameHandler>(
    mut receiver: SplitStream<WebSocket>,
    handler: &H,
    session: &Session,
    direct: &mpsc::WeakSender<Payload>,
) {
    let mut liveness = Liveness::new(Instant::now());

    loop {
        let msg = match tokio::time::timeout_at(liveness.deadline(), receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("Read failed for conn {}: {}", session.conn_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(
                    "Conn {} idle for {:?} past read deadline, closing",
                    session.conn_id,
                    liveness.last_seen().elapsed()
                );
                break;
            }
        };
        liveness.touch(Instant::now());

        match msg {
            Message::Text(text) => handle_text(handler, session, direct, text.as_str()).await,
            Message::Close(_) => break,
            // Pongs only renew liveness, which already happened above.
            _ => {}
        }
    }
}

async fn handle_text<H: FrameHandler>(
    handler: &H,
    session: &Session,
    direct: &mpsc::WeakSender<Payload>,
    text: &str,
) {
    let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            trace!(
                "Conn {} sent unparseable frame: {} -- raw: {}",
                session.conn_id,
                e,
                truncate(text, 200)
            );
            return;
        }
    };

    let Some(command) = envelope.into_command() else {
        return;
    };

    match command {
        ClientCommand::Send(payload) => match handler.on_send(session, payload).await {
            FrameOutcome::Accepted | FrameOutcome::Dropped => {}
            FrameOutcome::Rejected(message) => send_error(session, direct, message),
        },
    }
}

/// Best-effort `error` event to this connection only.
fn send_error(session: &Session, direct: &mpsc::WeakSender<Payload>, message: String) {
    let Some(tx) = direct.upgrade() else {
        return;
    };
    let json = match (ServerEvent::Error { message }).to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize error event: {}", e);
            return;
        }
    };
    if let Err(e) = tx.try_send(Payload::from(json)) {
        warn!("Dropping error event for conn {}: {}", session.conn_id, e);
    }
}

fn display_user(caller: &Caller) -> &str {
    if caller.is_anonymous() { "anonymous" } else { &caller.username }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
