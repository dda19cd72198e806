//! Room-scoped fan-out over per-connection outboxes.
//!
//! Every connection owns an outbox. Events are encoded once and the shared
//! frame is pushed to each recipient, so a 100-member room costs one
//! serialization and 100 pointer clones.
//!
//! Rooms exist only while they have members: the first join creates a
//! [`BroadcastGroup`], removing the last member destroys it.
//!
//! Buffer traffic is [`Delivery::BestEffort`]: once a recipient has `capacity`
//! undelivered buffer frames, further ones are dropped for it and counted in
//! `frames_dropped`. Membership frames are [`Delivery::Required`] and always
//! enqueue, in order with the buffer frames around them, so every member sees
//! every `joined` and `disconnected` however far behind it is on edits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::protocol::{ConnectionId, RoomId};

/// A pre-encoded event shared by every recipient.
pub type Frame = Arc<str>;

/// Whether a frame may be dropped when its recipient is backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Counts against the outbox capacity; dropped when it is exhausted.
    BestEffort,
    /// Always enqueued while the connection is open.
    Required,
}

/// Why a frame did not reach an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undelivered {
    Full,
    Closed,
}

struct Envelope {
    frame: Frame,
    counted: bool,
}

/// Create a connection outbox holding at most `capacity` best-effort frames.
pub fn outbox(capacity: usize) -> (Outbox, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        Outbox {
            tx,
            backlog: backlog.clone(),
            capacity: capacity.max(1),
        },
        Mailbox { rx, backlog },
    )
}

/// Sending half of a connection's outbox.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
    backlog: Arc<AtomicUsize>,
    capacity: usize,
}

impl Outbox {
    /// Enqueue without waiting.
    pub fn push(&self, frame: &Frame, delivery: Delivery) -> Result<(), Undelivered> {
        let counted = delivery == Delivery::BestEffort;
        if counted {
            if self.backlog.load(Ordering::Acquire) >= self.capacity {
                return Err(Undelivered::Full);
            }
            self.backlog.fetch_add(1, Ordering::AcqRel);
        }

        let envelope = Envelope {
            frame: frame.clone(),
            counted,
        };
        if self.tx.send(envelope).is_err() {
            if counted {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(Undelivered::Closed);
        }
        Ok(())
    }
}

/// Receiving half of a connection's outbox, drained by its socket task.
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    backlog: Arc<AtomicUsize>,
}

impl Mailbox {
    /// Next frame, or `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        let envelope = self.rx.recv().await?;
        Some(self.release(envelope))
    }

    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        let envelope = self.rx.try_recv()?;
        Ok(self.release(envelope))
    }

    fn release(&self, envelope: Envelope) -> Frame {
        if envelope.counted {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
        }
        envelope.frame
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// Members of a single room, in join order.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    members: Vec<ConnectionId>,
}

impl BroadcastGroup {
    fn add(&mut self, id: &ConnectionId) -> bool {
        if self.members.contains(id) {
            return false;
        }
        self.members.push(id.clone());
        true
    }

    fn remove(&mut self, id: &ConnectionId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != id);
        self.members.len() != before
    }

    pub fn members(&self) -> &[ConnectionId] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A live connection: its outbox and the rooms it has joined.
struct Peer {
    outbox: Outbox,
    rooms: HashSet<RoomId>,
}

/// Room directory plus delivery: room id → members, connection id → outbox.
///
/// Not synchronized on its own; the presence coordinator keeps it behind the
/// same lock as the connection registry.
#[derive(Default)]
pub struct RoomManager {
    peers: HashMap<ConnectionId, Peer>,
    rooms: HashMap<RoomId, BroadcastGroup>,
    stats: BroadcastStats,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection's outbox.
    pub fn connect(&mut self, id: ConnectionId, outbox: Outbox) {
        self.peers.insert(
            id,
            Peer {
                outbox,
                rooms: HashSet::new(),
            },
        );
    }

    /// Drop a connection: its outbox and every membership it held.
    ///
    /// Rooms left empty are destroyed. Returns the rooms the connection was in.
    pub fn disconnect(&mut self, id: &ConnectionId) -> Vec<RoomId> {
        let Some(peer) = self.peers.remove(id) else {
            return Vec::new();
        };

        let mut left: Vec<RoomId> = peer.rooms.into_iter().collect();
        left.sort();
        for room_id in &left {
            if let Some(group) = self.rooms.get_mut(room_id) {
                group.remove(id);
                if group.is_empty() {
                    self.rooms.remove(room_id);
                    log::debug!("Room {room_id} removed (empty)");
                }
            }
        }
        left
    }

    /// Add a connected peer to a room, creating the room if needed.
    ///
    /// Returns `false` for an unknown connection. Re-joining is a no-op.
    pub fn join(&mut self, room_id: &str, id: &ConnectionId) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        peer.rooms.insert(room_id.to_string());
        self.rooms.entry(room_id.to_string()).or_default().add(id);
        true
    }

    /// Current members of a room in join order (empty for unknown rooms).
    pub fn members_of(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|group| group.members().to_vec())
            .unwrap_or_default()
    }

    /// Rooms a connection currently belongs to, sorted.
    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .peers
            .get(id)
            .map(|peer| peer.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Deliver a buffer frame to one connection. Returns whether it was queued.
    pub fn send_to(&mut self, id: &ConnectionId, frame: &Frame) -> bool {
        let delivered = match self.peers.get(id) {
            Some(peer) => Self::deliver(id, &peer.outbox, frame, Delivery::BestEffort),
            None => {
                log::debug!("No outbox for {id}, dropping frame");
                false
            }
        };
        self.record(delivered);
        delivered
    }

    /// Deliver a frame to every member of a room, optionally skipping one.
    ///
    /// Returns the number of outboxes that accepted it.
    pub fn broadcast(
        &mut self,
        room_id: &str,
        frame: &Frame,
        except: Option<&ConnectionId>,
        delivery: Delivery,
    ) -> usize {
        let Some(group) = self.rooms.get(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = 0;
        for member in group.members() {
            if Some(member) == except {
                continue;
            }
            let accepted = self
                .peers
                .get(member)
                .is_some_and(|peer| Self::deliver(member, &peer.outbox, frame, delivery));
            if accepted {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }

        self.stats.frames_sent += delivered as u64;
        self.stats.frames_dropped += dropped;
        delivered
    }

    fn deliver(id: &ConnectionId, outbox: &Outbox, frame: &Frame, delivery: Delivery) -> bool {
        match outbox.push(frame, delivery) {
            Ok(()) => true,
            Err(Undelivered::Full) => {
                log::warn!("Outbox for {id} is full, dropping frame");
                false
            }
            Err(Undelivered::Closed) => {
                log::debug!("Outbox for {id} is closed, dropping frame");
                false
            }
        }
    }

    fn record(&mut self, delivered: bool) {
        if delivered {
            self.stats.frames_sent += 1;
        } else {
            self.stats.frames_dropped += 1;
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}
