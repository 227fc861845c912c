//! Common types for the grid core
//!
//! This crate defines:
//! - Node and future identifiers (UUID based)
//! - Transaction versions and the clock that issues them
//! - Cache keys and values
//! - Collaborator interfaces: topology, affinity and entry storage,
//!   together with in-memory implementations used by tests and node assembly

mod affinity;
mod ids;
mod key;
mod storage;
mod topology;
mod version;

pub use affinity::{Affinity, RendezvousAffinity};
pub use ids::{FutureId, MiniId, NodeId};
pub use key::{CacheKey, CacheValue};
pub use storage::{CacheEntry, EntryRemoved, EntryStore, MemoryStore, StorageError, UpdateOutcome};
pub use topology::{
    Cluster, ClusterNode, LocalTopology, NodeEvent, NodeEventListener, Subscription,
    TopologyProvider,
};
pub use version::{TxVersion, VersionClock};
