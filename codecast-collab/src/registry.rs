//! Connection registry: connection id → display name supplied at join time.
//!
//! Identity is connection-scoped. Empty and duplicate names are accepted, and a
//! repeated join on the same connection overwrites the previous name.

use std::collections::HashMap;

use crate::protocol::ConnectionId;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// `None` records a join that carried no username.
    names: HashMap<ConnectionId, Option<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the display name for a connection, returning the entry it replaced.
    pub fn set(&mut self, id: ConnectionId, name: Option<String>) -> Option<Option<String>> {
        self.names.insert(id, name)
    }

    /// Display name of a joined connection, if it supplied one.
    pub fn get(&self, id: &ConnectionId) -> Option<&str> {
        self.names.get(id).and_then(|name| name.as_deref())
    }

    /// Whether the connection has an entry (joined at least once).
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.names.contains_key(id)
    }

    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        self.names.remove(id).is_some()
    }
}
