//! Transactional core of a partitioned in-memory data grid
//!
//! A [`GridNode`] wires one member of the grid: the messaging substrate,
//! the transaction participant serving this node's partitions, the near
//! transaction coordinator and the near atomic cache. The building blocks
//! live in their own crates and are re-exported here.

mod config;
mod error;
mod node;

pub use config::GridConfig;
pub use error::{GridError, Result};
pub use node::GridNode;

pub use gridcore_common as common;
pub use gridcore_messaging as messaging;
pub use gridcore_near as near;
pub use gridcore_protocol as protocol;
pub use gridcore_tx as tx;
