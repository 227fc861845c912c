//! Error types for near transactions

use gridcore_common::{CacheKey, MiniId, NodeId};
use gridcore_messaging::MessagingError;
use gridcore_protocol::RemoteError;
use thiserror::Error;

/// Transaction error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("Node {node} left the topology holding keys {keys:?}")]
    Topology { node: NodeId, keys: Vec<CacheKey> },

    #[error("Prepare failed on node {node}: {cause}")]
    Prepare { node: NodeId, cause: RemoteError },

    #[error("Finish failed on node {node}: {cause}")]
    Finish { node: NodeId, cause: RemoteError },

    #[error("Lock failed on node {node}: {cause}")]
    Lock { node: NodeId, cause: RemoteError },

    #[error("Heuristic failure on node {node} (transaction outcome is unknown): {message}")]
    Heuristic { node: NodeId, message: String },

    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Mini future {0} resolved twice")]
    MiniAlreadyResolved(MiniId),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No primary node for key {0}")]
    NoPrimary(CacheKey),
}

impl TxError {
    /// The outcome on some participant is unknown
    pub fn is_heuristic(&self) -> bool {
        matches!(self, TxError::Heuristic { .. })
    }

    /// Caused by a node leaving the topology
    pub fn is_topology(&self) -> bool {
        match self {
            TxError::Topology { .. } | TxError::NoPrimary(_) => true,
            TxError::Messaging(e) => e.is_topology(),
            _ => false,
        }
    }
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TxError>;
