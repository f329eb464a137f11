use ahash::RandomState;
use dashmap::DashMap;

use crate::nexus::event::{SmEvent, SmEventTx};
use crate::type_alias::*;

/// Process-wide lookup from RPC ID to the instance's event channel.
///
/// The session-management thread uses it to route inbound control messages;
/// instances register at construction and deregister at drop. Mutations pay
/// the map's shard locks, which are never held beyond the operation.
pub(crate) struct Registry {
    channels: DashMap<RpcId, SmEventTx, RandomState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::with_capacity_and_hasher(64, RandomState::new()),
        }
    }

    /// Register an instance's channel.
    ///
    /// # Panics
    ///
    /// Panic if the ID is already taken.
    pub fn insert(&self, id: RpcId, tx: SmEventTx) {
        assert!(
            self.channels.insert(id, tx).is_none(),
            "Rpc ID {id} is already in use"
        );
    }

    pub fn remove(&self, id: RpcId) {
        self.channels.remove(&id);
    }

    /// Route an event to its destination instance.
    /// Returns `false` if no such instance exists.
    pub fn route(&self, event: SmEvent) -> bool {
        match self.channels.get(&event.dst_rpc_id) {
            Some(tx) => {
                tx.send(event);
                true
            }
            None => false,
        }
    }
}
