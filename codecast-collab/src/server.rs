//! WebSocket server binding the presence coordinator to real connections.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── outbox A ──► Client A
//!            ├── PresenceCoordinator┤
//! Client B ──┘   (registry + rooms) └── outbox B ──► Client B
//! ```
//!
//! Each accepted socket gets a fresh [`ConnectionId`], a `connected` handshake
//! frame, and a task that multiplexes inbound frames, its outbox and a
//! heartbeat. A peer that sends nothing, not even a pong, for two heartbeat
//! periods is treated as gone. Whatever ends that loop, the coordinator's
//! teardown runs exactly once for the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Mailbox;
use crate::presence::{PresenceCoordinator, DEFAULT_OUTBOX_CAPACITY};
use crate::protocol::{ClientEvent, ConnectionId, ServerEvent};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Buffer frames queued per connection before new ones are dropped
    pub outbox_capacity: usize,
    /// Heartbeat ping interval in seconds (0 disables pings and the idle deadline)
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            heartbeat_interval_secs: 25,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub total_bytes: u64,
    pub malformed_events: u64,
    /// Connections that ended on a transport error rather than a close
    pub failed_connections: u64,
    /// Connections dropped for missing the heartbeat deadline
    pub timed_out_connections: u64,
    pub active_rooms: usize,
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: PresenceCoordinator,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let coordinator = PresenceCoordinator::new(config.outbox_capacity);
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("TCP accept error: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => Self::handle_connection(ws, addr, coordinator, stats, config).await,
                    Err(e) => log::warn!("WebSocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }

    /// Run one connection from handshake to teardown.
    async fn handle_connection(
        ws: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        coordinator: PresenceCoordinator,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) {
        let id = ConnectionId::generate();
        let outbox = coordinator.connect(id.clone()).await;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Connection {id} established from {addr}");

        if let Err(e) = Self::pump(ws, &id, outbox, &coordinator, &stats, &config).await {
            stats.write().await.failed_connections += 1;
            log::warn!("Connection {id} from {addr} failed: {e}");
        }

        coordinator.disconnecting(&id).await;

        let active_rooms = coordinator.room_count().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = active_rooms;
        }
        log::info!("Connection {id} closed");
    }

    /// Multiplex inbound frames, the outbox and the heartbeat until the socket ends.
    async fn pump(
        ws: WebSocketStream<TcpStream>,
        id: &ConnectionId,
        mut outbox: Mailbox,
        coordinator: &PresenceCoordinator,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        let hello = ServerEvent::Connected { socket_id: id.clone() }.encode()?;
        ws_sender.send(Message::Text(hello.into())).await?;

        let heartbeat_enabled = config.heartbeat_interval_secs > 0;
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    if matches!(msg, Some(Ok(_))) {
                        last_seen = Instant::now();
                    }
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_events += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientEvent::decode(text.as_str()) {
                                Ok(event) => {
                                    log::trace!("{id} sent {}", event.name());
                                    coordinator.handle(id, event).await;
                                }
                                Err(e) => {
                                    stats.write().await.malformed_events += 1;
                                    log::warn!("Ignoring malformed event from {id}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("{id} closed the socket");
                            return Ok(());
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {id}");
                        }

                        Some(Ok(_)) => {}

                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        None => return Ok(()),
                    }
                }

                _ = heartbeat.tick(), if heartbeat_enabled => {
                    if heartbeat_expired(last_seen.elapsed(), period) {
                        stats.write().await.timed_out_connections += 1;
                        log::warn!("{id} missed its heartbeat deadline, dropping connection");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.coordinator.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Handle to the protocol engine, for inspecting membership.
    pub fn coordinator(&self) -> &PresenceCoordinator {
        &self.coordinator
    }
}

/// Whether a peer silent for `idle` has missed two heartbeats.
fn heartbeat_expired(idle: Duration, period: Duration) -> bool {
    idle > period * 2
}
