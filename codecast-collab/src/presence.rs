//! Presence coordinator: join, edit relay, late-joiner sync and teardown.
//!
//! ## Event flow
//!
//! ```text
//! join ──────────► registry.set ─► rooms.join ─► joined ──► whole room (incl. joiner)
//! code-change ───► code-change ──────────────────────────► room minus sender
//! sync-code ─────► code-change ──────────────────────────► one target connection
//! disconnecting ─► disconnected ─────────────────────────► each room minus leaver
//!                  └► rooms.disconnect ─► registry.remove
//! ```
//!
//! The registry and the room directory live behind one mutex. Each handler
//! takes it once and mutates, computes recipients and enqueues frames without
//! releasing it, so every broadcast is built from a single consistent snapshot.
//! Handlers never await while holding the lock except on the lock itself.
//!
//! `joined` and `disconnected` are never dropped for a slow recipient; only
//! buffer frames are subject to the outbox capacity.
//!
//! The server never stores buffer contents. A late joiner gets the current
//! buffer from a peer that answers its `joined` event with `sync-code`.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broadcast::{self, BroadcastStats, Delivery, Frame, Mailbox, RoomManager};
use crate::protocol::{ClientEvent, ClientInfo, ConnectionId, RoomId, ServerEvent};
use crate::registry::ConnectionRegistry;

/// Default number of undelivered buffer frames per connection.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Default)]
struct PresenceState {
    registry: ConnectionRegistry,
    rooms: RoomManager,
}

impl PresenceState {
    /// Membership records for a room, names resolved at call time.
    fn clients_in(&self, room_id: &str) -> Vec<ClientInfo> {
        self.rooms
            .members_of(room_id)
            .into_iter()
            .map(|socket_id| {
                let username = self.registry.get(&socket_id).map(str::to_string);
                ClientInfo { socket_id, username }
            })
            .collect()
    }
}

/// Encode once for fan-out. A failure is logged and the event skipped.
fn encode(event: &ServerEvent) -> Option<Frame> {
    match event.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode {} event: {e}", event.name());
            None
        }
    }
}

/// Shared protocol engine. Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct PresenceCoordinator {
    state: Arc<Mutex<PresenceState>>,
    outbox_capacity: usize,
}

impl Default for PresenceCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl PresenceCoordinator {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PresenceState::default())),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Register a new transport connection and hand back its outbox receiver.
    ///
    /// The connection is known to the transport but belongs to no room and has
    /// no registry entry until it sends `join`.
    pub async fn connect(&self, id: ConnectionId) -> Mailbox {
        let (tx, rx) = broadcast::outbox(self.outbox_capacity);
        self.state.lock().await.rooms.connect(id, tx);
        rx
    }

    /// Dispatch one inbound client event.
    pub async fn handle(&self, from: &ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Join(payload) => self.join(from, &payload.room_id, payload.username).await,
            ClientEvent::CodeChange(payload) => {
                self.code_change(from, &payload.room_id, payload.code).await;
            }
            ClientEvent::SyncCode(payload) => match payload.socket_id {
                Some(target) => {
                    self.sync_code(from, &target, payload.code).await;
                }
                None => log::debug!("Dropping sync-code from {from} without a target"),
            },
        }
    }

    /// Record the name, add to the room, and send the new membership snapshot
    /// to every member including the joiner.
    pub async fn join(&self, id: &ConnectionId, room_id: &str, username: Option<String>) {
        let mut state = self.state.lock().await;

        if !state.rooms.join(room_id, id) {
            log::warn!("Ignoring join to {room_id} from unregistered connection {id}");
            return;
        }
        state.registry.set(id.clone(), username.clone());

        let clients = state.clients_in(room_id);
        log::info!(
            "{} joined room {room_id} ({} members)",
            username.as_deref().unwrap_or("<anonymous>"),
            clients.len()
        );

        let event = ServerEvent::Joined {
            clients,
            username,
            socket_id: id.clone(),
        };
        if let Some(frame) = encode(&event) {
            state.rooms.broadcast(room_id, &frame, None, Delivery::Required);
        }
    }

    /// Relay a buffer to every member of `room_id` except the sender.
    ///
    /// Sender membership is not checked. Returns the number of recipients.
    pub async fn code_change(&self, from: &ConnectionId, room_id: &str, code: Option<String>) -> usize {
        let event = ServerEvent::CodeChange { code };
        let Some(frame) = encode(&event) else {
            return 0;
        };

        let mut state = self.state.lock().await;
        let delivered = state.rooms.broadcast(room_id, &frame, Some(from), Delivery::BestEffort);
        log::trace!("Relayed edit from {from} to {delivered} peers in {room_id}");
        delivered
    }

    /// Deliver a buffer to one connection as a `code-change`.
    ///
    /// A target that has already left is dropped silently.
    pub async fn sync_code(&self, from: &ConnectionId, target: &ConnectionId, code: Option<String>) -> bool {
        let event = ServerEvent::CodeChange { code };
        let Some(frame) = encode(&event) else {
            return false;
        };

        let mut state = self.state.lock().await;
        let delivered = state.rooms.send_to(target, &frame);
        if !delivered {
            log::debug!("Dropping sync-code from {from}: target {target} unreachable");
        }
        delivered
    }

    /// Tear down a connection.
    ///
    /// Each room it belonged to hears `disconnected` (everyone but the leaver)
    /// before the room membership and registry entry are removed. Unknown or
    /// never-joined connections tear down without broadcasting.
    pub async fn disconnecting(&self, id: &ConnectionId) {
        let mut state = self.state.lock().await;

        let rooms = state.rooms.rooms_of(id);
        let username = state.registry.get(id).map(str::to_string);

        if !rooms.is_empty() {
            let event = ServerEvent::Disconnected {
                socket_id: id.clone(),
                username: username.clone(),
            };
            if let Some(frame) = encode(&event) {
                for room_id in &rooms {
                    state.rooms.broadcast(room_id, &frame, Some(id), Delivery::Required);
                }
            }
        }

        state.rooms.disconnect(id);
        state.registry.remove(id);

        if !rooms.is_empty() {
            log::info!(
                "{} left {} room(s)",
                username.as_deref().unwrap_or("<anonymous>"),
                rooms.len()
            );
        }
    }

    /// Current membership records of a room.
    pub async fn members_of(&self, room_id: &str) -> Vec<ClientInfo> {
        self.state.lock().await.clients_in(room_id)
    }

    pub async fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.state.lock().await.rooms.rooms_of(id)
    }

    pub async fn display_name(&self, id: &ConnectionId) -> Option<String> {
        self.state.lock().await.registry.get(id).map(str::to_string)
    }

    /// Whether the connection has a registry entry.
    pub async fn is_registered(&self, id: &ConnectionId) -> bool {
        self.state.lock().await.registry.contains(id)
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.room_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.rooms.connection_count()
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.state.lock().await.rooms.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(frame: Frame) -> ServerEvent {
        ServerEvent::decode(&frame).unwrap()
    }

    fn next(rx: &mut Mailbox) -> ServerEvent {
        decode(rx.try_recv().expect("expected a pending frame"))
    }

    fn assert_idle(rx: &mut Mailbox) {
        assert!(rx.try_recv().is_err(), "expected no pending frame");
    }

    async fn connect(
        coordinator: &PresenceCoordinator,
        id: &str,
    ) -> (ConnectionId, Mailbox) {
        let id = ConnectionId::from(id);
        let rx = coordinator.connect(id.clone()).await;
        (id, rx)
    }

    fn socket_ids(clients: &[ClientInfo]) -> Vec<ConnectionId> {
        clients.iter().map(|c| c.socket_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_joiner() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;

        coordinator.join(&a, "r1", Some("alice".into())).await;

        match next(&mut ra) {
            ServerEvent::Joined { clients, username, socket_id } => {
                assert_eq!(socket_ids(&clients), vec![a.clone()]);
                assert_eq!(clients[0].username.as_deref(), Some("alice"));
                assert_eq!(username.as_deref(), Some("alice"));
                assert_eq!(socket_id, a);
            }
            other => panic!("Expected Joined, got {other:?}"),
        }
        assert_idle(&mut ra);
    }

    #[tokio::test]
    async fn test_two_peer_scenario() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;

        coordinator.join(&a, "r1", Some("alice".into())).await;
        match next(&mut ra) {
            ServerEvent::Joined { clients, .. } => assert_eq!(socket_ids(&clients), vec![a.clone()]),
            other => panic!("Expected Joined, got {other:?}"),
        }

        coordinator.join(&b, "r1", Some("bob".into())).await;
        for rx in [&mut ra, &mut rb] {
            match next(rx) {
                ServerEvent::Joined { clients, username, socket_id } => {
                    assert_eq!(socket_ids(&clients), vec![a.clone(), b.clone()]);
                    assert_eq!(username.as_deref(), Some("bob"));
                    assert_eq!(socket_id, b);
                }
                other => panic!("Expected Joined, got {other:?}"),
            }
        }

        // A answers the late joiner with its buffer.
        assert!(coordinator.sync_code(&a, &b, Some("print(1)".into())).await);
        assert_eq!(next(&mut rb), ServerEvent::CodeChange { code: Some("print(1)".into()) });
        assert_idle(&mut ra);

        coordinator.disconnecting(&b).await;
        assert_eq!(
            next(&mut ra),
            ServerEvent::Disconnected { socket_id: b.clone(), username: Some("bob".into()) }
        );
        assert_idle(&mut rb);

        let members = coordinator.members_of("r1").await;
        assert_eq!(socket_ids(&members), vec![a]);
        assert!(!coordinator.is_registered(&b).await);
    }

    #[tokio::test]
    async fn test_rejoin_keeps_clients_unique() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;

        coordinator.join(&a, "r1", Some("alice".into())).await;
        let _ = next(&mut ra);
        coordinator.join(&a, "r1", Some("alicia".into())).await;

        match next(&mut ra) {
            ServerEvent::Joined { clients, .. } => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].username.as_deref(), Some("alicia"));
            }
            other => panic!("Expected Joined, got {other:?}"),
        }
        assert_eq!(coordinator.display_name(&a).await.as_deref(), Some("alicia"));
    }

    #[tokio::test]
    async fn test_join_from_unregistered_connection_is_ignored() {
        let coordinator = PresenceCoordinator::default();
        let ghost = ConnectionId::from("ghost");

        coordinator.join(&ghost, "r1", Some("casper".into())).await;

        assert!(coordinator.members_of("r1").await.is_empty());
        assert!(!coordinator.is_registered(&ghost).await);
        assert_eq!(coordinator.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_without_username() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;

        coordinator.join(&a, "r1", None).await;

        match next(&mut ra) {
            ServerEvent::Joined { clients, username, .. } => {
                assert!(username.is_none());
                assert!(clients[0].username.is_none());
            }
            other => panic!("Expected Joined, got {other:?}"),
        }
        assert!(coordinator.is_registered(&a).await);
    }

    #[tokio::test]
    async fn test_code_change_skips_sender() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;
        let (c, mut rc) = connect(&coordinator, "c").await;
        for (id, name) in [(&a, "alice"), (&b, "bob"), (&c, "carol")] {
            coordinator.join(id, "r1", Some(name.into())).await;
        }
        while ra.try_recv().is_ok() {}
        while rb.try_recv().is_ok() {}
        while rc.try_recv().is_ok() {}

        let code = "let x = 1;\n\tlet y = \"two\";";
        let delivered = coordinator.code_change(&a, "r1", Some(code.into())).await;

        assert_eq!(delivered, 2);
        assert_eq!(next(&mut rb), ServerEvent::CodeChange { code: Some(code.into()) });
        assert_eq!(next(&mut rc), ServerEvent::CodeChange { code: Some(code.into()) });
        assert_idle(&mut ra);
    }

    #[tokio::test]
    async fn test_code_change_to_empty_room() {
        let coordinator = PresenceCoordinator::default();
        let (a, _ra) = connect(&coordinator, "a").await;
        assert_eq!(coordinator.code_change(&a, "nowhere", Some("x".into())).await, 0);
    }

    #[tokio::test]
    async fn test_sync_code_is_unicast() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;
        let (c, mut rc) = connect(&coordinator, "c").await;
        for id in [&a, &b, &c] {
            coordinator.join(id, "r1", None).await;
        }
        while ra.try_recv().is_ok() {}
        while rb.try_recv().is_ok() {}
        while rc.try_recv().is_ok() {}

        coordinator
            .handle(&a, ClientEvent::sync_code(c.clone(), "buffer"))
            .await;

        assert_eq!(next(&mut rc), ServerEvent::CodeChange { code: Some("buffer".into()) });
        assert_idle(&mut ra);
        assert_idle(&mut rb);
    }

    #[tokio::test]
    async fn test_sync_code_to_departed_target_is_dropped() {
        let coordinator = PresenceCoordinator::default();
        let (a, _ra) = connect(&coordinator, "a").await;
        let (b, _rb) = connect(&coordinator, "b").await;
        coordinator.disconnecting(&b).await;

        assert!(!coordinator.sync_code(&a, &b, Some("late".into())).await);
        assert_eq!(coordinator.broadcast_stats().await.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_every_room() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;
        let (c, mut rc) = connect(&coordinator, "c").await;

        coordinator.join(&a, "r1", Some("alice".into())).await;
        coordinator.join(&a, "r2", Some("alice".into())).await;
        coordinator.join(&b, "r1", Some("bob".into())).await;
        coordinator.join(&c, "r2", Some("carol".into())).await;
        while ra.try_recv().is_ok() {}
        while rb.try_recv().is_ok() {}
        while rc.try_recv().is_ok() {}

        coordinator.disconnecting(&a).await;

        let expected = ServerEvent::Disconnected {
            socket_id: a.clone(),
            username: Some("alice".into()),
        };
        assert_eq!(next(&mut rb), expected);
        assert_eq!(next(&mut rc), expected);
        assert_idle(&mut rb);
        assert_idle(&mut rc);

        assert!(coordinator.rooms_of(&a).await.is_empty());
        assert_eq!(socket_ids(&coordinator.members_of("r1").await), vec![b]);
        assert_eq!(socket_ids(&coordinator.members_of("r2").await), vec![c]);
        assert!(!coordinator.is_registered(&a).await);
        assert_eq!(coordinator.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_last_member_leaving_destroys_room() {
        let coordinator = PresenceCoordinator::default();
        let (a, _ra) = connect(&coordinator, "a").await;
        coordinator.join(&a, "r1", Some("alice".into())).await;
        assert_eq!(coordinator.room_count().await, 1);

        coordinator.disconnecting(&a).await;
        assert_eq!(coordinator.room_count().await, 0);
        assert_eq!(coordinator.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_join_is_noop() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;
        coordinator.join(&a, "r1", None).await;
        while ra.try_recv().is_ok() {}

        coordinator.disconnecting(&b).await;

        assert_idle(&mut ra);
        assert_idle(&mut rb);
        assert_eq!(coordinator.connection_count().await, 1);
        assert_eq!(socket_ids(&coordinator.members_of("r1").await), vec![a]);
    }

    #[tokio::test]
    async fn test_membership_matches_live_joiners() {
        let coordinator = PresenceCoordinator::default();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..8 {
            let (id, rx) = connect(&coordinator, &format!("c{i}")).await;
            ids.push(id);
            receivers.push(rx);
        }

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.join(&id, "busy", Some(id.to_string())).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for id in ids.iter().step_by(2) {
            coordinator.disconnecting(id).await;
        }

        let mut members = socket_ids(&coordinator.members_of("busy").await);
        members.sort();
        let mut expected: Vec<ConnectionId> = ids.iter().skip(1).step_by(2).cloned().collect();
        expected.sort();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn test_each_joined_snapshot_is_consistent() {
        let coordinator = PresenceCoordinator::default();
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;
        let (c, mut rc) = connect(&coordinator, "c").await;

        coordinator.join(&a, "r1", None).await;
        coordinator.join(&b, "r1", None).await;
        coordinator.join(&c, "r1", None).await;

        // A sees three snapshots of growing size, B two, C one.
        for (rx, expected_sizes) in [(&mut ra, vec![1, 2, 3]), (&mut rb, vec![2, 3]), (&mut rc, vec![3])] {
            for size in expected_sizes {
                match next(rx) {
                    ServerEvent::Joined { clients, .. } => {
                        let mut unique = socket_ids(&clients);
                        unique.dedup();
                        assert_eq!(clients.len(), size);
                        assert_eq!(unique.len(), size);
                    }
                    other => panic!("Expected Joined, got {other:?}"),
                }
            }
            assert_idle(rx);
        }
    }

    #[tokio::test]
    async fn test_membership_frames_survive_edit_backlog() {
        let coordinator = PresenceCoordinator::new(1);
        let (a, mut ra) = connect(&coordinator, "a").await;
        let (b, mut rb) = connect(&coordinator, "b").await;
        let (c, mut rc) = connect(&coordinator, "c").await;

        coordinator.join(&a, "r1", Some("alice".into())).await;
        coordinator.join(&b, "r1", Some("bob".into())).await;
        // Fills A's single buffer slot; the second edit is dropped for A.
        assert_eq!(coordinator.code_change(&b, "r1", Some("v1".into())).await, 1);
        assert_eq!(coordinator.code_change(&b, "r1", Some("v2".into())).await, 0);
        coordinator.join(&c, "r1", Some("carol".into())).await;
        coordinator.disconnecting(&b).await;

        let mut seen = Vec::new();
        while let Ok(frame) = ra.try_recv() {
            seen.push(frame.to_string());
        }
        assert_eq!(seen.len(), 5, "unexpected frames for A: {seen:?}");
        assert!(seen[2].contains(r#""code":"v1""#));
        assert!(seen[3].contains(r#""username":"carol""#));
        match decode(Arc::from(seen[4].as_str())) {
            ServerEvent::Disconnected { socket_id, username } => {
                assert_eq!(socket_id, b);
                assert_eq!(username.as_deref(), Some("bob"));
            }
            other => panic!("Expected Disconnected, got {other:?}"),
        }

        while rb.try_recv().is_ok() {}
        match next(&mut rc) {
            ServerEvent::Joined { clients, .. } => {
                assert_eq!(socket_ids(&clients), vec![a.clone(), b.clone(), c.clone()]);
            }
            other => panic!("Expected Joined, got {other:?}"),
        }
        assert!(matches!(next(&mut rc), ServerEvent::Disconnected { .. }));
        assert_idle(&mut rc);
    }
}
