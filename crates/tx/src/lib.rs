//! Near transactions for the grid core
//!
//! A transaction started on this node is mapped onto the primary and backup
//! owners of its keys, prepared through one mini future per node and then
//! committed or rolled back. Node departure resolves outstanding mini
//! futures instead of leaving the aggregate hanging. The [`dht`] module is
//! the other side: requests served by the owners.

mod config;
mod coordinator;
pub mod dht;
mod error;
mod finish;
mod future;
mod lock;
mod lock_mapping;
mod mapping;
mod prepare;
mod registry;
mod transaction;

pub use config::TxConfig;
pub use coordinator::TxCoordinator;
pub use dht::{LockResult, LockTable, TxParticipant};
pub use error::{Result, TxError};
pub use finish::{FinishFuture, FinishOutcome};
pub use future::{Completion, MiniFuture};
pub use lock::LockFuture;
pub use lock_mapping::{LockMapper, LockMappingEntry};
pub use mapping::{TxMapping, TxMappings};
pub use prepare::{PrepareFuture, PrepareOutcome};
pub use registry::{ActiveTxRegistry, FutureRegistry, TxFuture};
pub use transaction::{NearTx, TxOptions, TxState};
