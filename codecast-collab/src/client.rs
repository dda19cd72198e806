//! WebSocket client session for a shared editing room.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Local buffer that remote `code-change` events overwrite
//! - Automatic answer to late joiners with the current buffer (`sync-code`)
//! - Peer list maintained from `joined` / `disconnected` events
//!
//! The background reader and writer tasks belong to the client. Leaving the
//! session sends a Close frame through the writer before the reader is
//! aborted, so the server sees an orderly close and no listener outlives the
//! session.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, ClientInfo, ConnectionId, ProtocolError, RoomId, ServerEvent};

/// How long `disconnect` waits for the Close frame to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport handshake finished; carries our own connection id
    Connected(ConnectionId),
    /// Someone (possibly us) joined; carries the refreshed peer list
    Joined {
        socket_id: ConnectionId,
        username: Option<String>,
        clients: Vec<ClientInfo>,
    },
    /// A peer left the room
    PeerLeft {
        socket_id: ConnectionId,
        username: Option<String>,
    },
    /// The buffer was replaced by a peer's contents
    RemoteChange(String),
    /// The connection dropped; the session must be started again
    ConnectionLost,
}

/// State shared between the client handle and its reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    socket_id: RwLock<Option<ConnectionId>>,
    buffer: RwLock<String>,
    clients: RwLock<Vec<ClientInfo>>,
}

/// A participant in one room.
pub struct SyncClient {
    username: String,
    room_id: RoomId,
    server_url: String,

    shared: Arc<Shared>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    event_tx: mpsc::Sender<SessionEvent>,

    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(username: impl Into<String>, room_id: impl Into<RoomId>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            username: username.into(),
            room_id: room_id.into(),
            server_url: server_url.into(),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                socket_id: RwLock::new(None),
                buffer: RwLock::new(String::new()),
                clients: RwLock::new(Vec::new()),
            }),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            writer: None,
            reader: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the room.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.shutdown_tasks();
        *self.shared.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket, stop after Close
        self.writer = Some(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        self.send(ClientEvent::join(self.room_id.clone(), self.username.clone()))
            .await?;
        *self.shared.state.write().await = ConnectionState::Connected;

        // Reader task: apply server events to the session
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if let Some(out) = apply_event(&shared, &out_tx, event).await {
                                let _ = event_tx.send(out).await;
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed server event: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *shared.state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SessionEvent::ConnectionLost).await;
        }));

        Ok(())
    }

    /// Replace the local buffer and broadcast it to the room.
    pub async fn edit(&self, code: impl Into<String>) -> Result<(), ProtocolError> {
        let code = code.into();
        *self.shared.buffer.write().await = code.clone();
        self.send(ClientEvent::code_change(self.room_id.clone(), code)).await
    }

    /// Push the local buffer to one peer.
    pub async fn sync_to(&self, target: ConnectionId) -> Result<(), ProtocolError> {
        let code = self.shared.buffer.read().await.clone();
        self.send(ClientEvent::sync_code(target, code)).await
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        let encoded = event.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Text(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send a Close frame, wait briefly for it to go out, then stop the tasks.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                log::debug!("Close frame not flushed in time, aborting writer");
                writer.abort();
            }
        }
        self.shutdown_tasks();
        *self.shared.state.write().await = ConnectionState::Disconnected;
        *self.shared.socket_id.write().await = None;
        self.shared.clients.write().await.clear();
    }

    fn shutdown_tasks(&mut self) {
        self.outgoing_tx = None;
        for task in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            task.abort();
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Our connection id, once the handshake arrived.
    pub async fn socket_id(&self) -> Option<ConnectionId> {
        self.shared.socket_id.read().await.clone()
    }

    pub async fn buffer(&self) -> String {
        self.shared.buffer.read().await.clone()
    }

    /// Peers currently in the room, ourselves included.
    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.shared.clients.read().await.clone()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        // A queued Close lets the writer finish on its own.
        let closing = self
            .outgoing_tx
            .take()
            .is_some_and(|tx| tx.try_send(Message::Close(None)).is_ok());
        if closing {
            self.writer = None;
        }
        self.shutdown_tasks();
    }
}

/// Apply one server event to the session, answering late joiners.
async fn apply_event(
    shared: &Shared,
    out_tx: &mpsc::Sender<Message>,
    event: ServerEvent,
) -> Option<SessionEvent> {
    match event {
        ServerEvent::Connected { socket_id } => {
            *shared.socket_id.write().await = Some(socket_id.clone());
            Some(SessionEvent::Connected(socket_id))
        }

        ServerEvent::Joined { clients, username, socket_id } => {
            let mut unique: Vec<ClientInfo> = Vec::with_capacity(clients.len());
            for client in clients {
                match unique.iter_mut().find(|c| c.socket_id == client.socket_id) {
                    Some(existing) => *existing = client,
                    None => unique.push(client),
                }
            }
            *shared.clients.write().await = unique.clone();

            let own_id = shared.socket_id.read().await.clone();
            if own_id.as_ref() != Some(&socket_id) {
                let code = shared.buffer.read().await.clone();
                match ClientEvent::sync_code(socket_id.clone(), code).encode() {
                    Ok(encoded) => {
                        let _ = out_tx.send(Message::Text(encoded.into())).await;
                    }
                    Err(e) => log::warn!("Failed to encode sync-code: {e}"),
                }
            }

            Some(SessionEvent::Joined {
                socket_id,
                username,
                clients: unique,
            })
        }

        ServerEvent::CodeChange { code } => {
            let code = code?;
            *shared.buffer.write().await = code.clone();
            Some(SessionEvent::RemoteChange(code))
        }

        ServerEvent::Disconnected { socket_id, username } => {
            shared.clients.write().await.retain(|c| c.socket_id != socket_id);
            Some(SessionEvent::PeerLeft { socket_id, username })
        }
    }
}
