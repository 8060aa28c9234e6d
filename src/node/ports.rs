//! The per-node port registry.

use crate::addr::{Port, PORT_EPHEMERAL, PORT_MAX};
use rustc_hash::FxHashMap;

/// What kind of object holds a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortOwner {
    Endpoint,
    Pipe,
}

/// Allocates and tracks the node's 24-bit ports.
///
/// Static ports are claimed explicitly; ephemeral ports are probed
/// forward from a randomly seeded cursor so that fresh nodes do not hand
/// out predictable sequences.
#[derive(Debug)]
pub(crate) struct PortRegistry {
    entries: FxHashMap<Port, PortOwner>,
    next_ephemeral: Port,
}

impl PortRegistry {
    pub fn new(seed: u64) -> Self {
        let span = u64::from(PORT_MAX - PORT_EPHEMERAL + 1);
        Self {
            entries: FxHashMap::default(),
            next_ephemeral: PORT_EPHEMERAL + (seed % span) as Port,
        }
    }

    /// Claims a specific port. Fails if it is already held.
    pub fn insert(&mut self, port: Port, owner: PortOwner) -> bool {
        debug_assert!(port >= 1 && port <= PORT_MAX);
        if self.entries.contains_key(&port) {
            return false;
        }
        self.entries.insert(port, owner);
        true
    }

    /// Allocates a free ephemeral port, probing forward (with wraparound)
    /// from the cursor. Returns `None` only when the whole ephemeral
    /// range is in use.
    pub fn allocate(&mut self, owner: PortOwner) -> Option<Port> {
        let span = PORT_MAX - PORT_EPHEMERAL + 1;
        for _ in 0..span {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == PORT_MAX {
                PORT_EPHEMERAL
            } else {
                candidate + 1
            };
            if !self.entries.contains_key(&candidate) {
                self.entries.insert(candidate, owner);
                return Some(candidate);
            }
        }
        None
    }

    pub fn find(&self, port: Port) -> Option<PortOwner> {
        self.entries.get(&port).copied()
    }

    /// Changes the owner kind of a held port (an endpoint handing its
    /// port to the pipe it produced).
    pub fn reassign(&mut self, port: Port, owner: PortOwner) {
        if let Some(entry) = self.entries.get_mut(&port) {
            *entry = owner;
        }
    }

    pub fn remove(&mut self, port: Port) -> Option<PortOwner> {
        self.entries.remove(&port)
    }
}
