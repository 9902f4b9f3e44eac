use super::connection::{Connection, ConnectionId};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// The set of connections a host is tracking.
///
/// Every tracked id is either live or pending retirement, never both. Live
/// ids keep their insertion order. Marking an id dead removes it from every
/// later iteration immediately, but its connection stays owned here until
/// [`Self::reap`] hands it back for closing.
#[derive(Debug)]
pub struct ConnectionRegistry<C = Connection> {
    entries: HashMap<ConnectionId, C>,
    live: Vec<ConnectionId>,
    pending: BTreeSet<ConnectionId>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            live: Vec::new(),
            pending: BTreeSet::new(),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a live connection. Returns `false` and leaves the registry
    /// untouched if `id` is already tracked.
    pub fn insert(&mut self, id: ConnectionId, connection: C) -> bool {
        if self.entries.contains_key(&id) {
            warn!(id, "Connection id already registered");
            return false;
        }
        self.entries.insert(id, connection);
        self.live.push(id);
        true
    }

    /// Moves a live connection to the pending-retirement set.
    ///
    /// Returns `true` only on the transition, so a connection is retired
    /// exactly once no matter how many failures report it.
    pub fn mark_dead(&mut self, id: ConnectionId) -> bool {
        let Some(pos) = self.live.iter().position(|&live_id| live_id == id) else {
            return false;
        };
        self.live.remove(pos);
        self.pending.insert(id);
        debug!(id, "Marked connection dead");
        true
    }

    /// Removes every connection pending retirement and returns them in id
    /// order. Returns an empty list and changes nothing if none are pending.
    pub fn reap(&mut self) -> Vec<(ConnectionId, C)> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|conn| (id, conn)))
            .collect()
    }

    /// Removes every connection, live or pending.
    pub fn drain(&mut self) -> Vec<(ConnectionId, C)> {
        self.live.clear();
        self.pending.clear();
        self.entries.drain().collect()
    }

    /// Live ids in insertion order, skipping `exclude`.
    pub fn live_ids_except(&self, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.live
            .iter()
            .copied()
            .filter(|&id| Some(id) != exclude)
            .collect()
    }

    /// Live ids in insertion order.
    pub fn live_ids(&self) -> &[ConnectionId] {
        &self.live
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.live.contains(&id)
    }

    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending.contains(&id)
    }

    /// Whether `id` is tracked at all, live or pending.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&C> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut C> {
        self.entries.get_mut(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of connections waiting for [`Self::reap`].
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
