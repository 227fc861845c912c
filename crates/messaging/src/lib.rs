//! Topic-addressed messaging between grid nodes
//!
//! The substrate offers unordered and ordered (per sender sequence) delivery,
//! dispatches every listener callback on a worker pool selected by the
//! envelope's I/O policy, buffers inbound traffic until the node has started,
//! and cleans up per-sender state when nodes leave.

use gridcore_common::NodeId;
use gridcore_protocol::{CodecError, IoPolicy, Topic};
use thiserror::Error;

mod busy;
mod closed;
pub mod config;
mod listener;
mod message_set;
pub mod network;
mod pool;
mod substrate;
pub mod transport;

pub use config::MessagingConfig;
pub use listener::{Listener, MessageListener};
pub use network::LocalNetwork;
pub use substrate::Messaging;
pub use transport::{InboundHandler, Transport};

/// Transport failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node unreachable: {0}")]
    Unreachable(NodeId),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] CodecError),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Messaging errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Failed to send message to node (has node left the grid?): {0}")]
    NodeNotFound(NodeId),

    #[error("Trying to send message when messaging is not fully started")]
    NotStarted,

    #[error("Messaging is stopping")]
    Stopping,

    #[error("Failed to send message [node={node}, topic={topic}, policy={policy:?}]: {source}")]
    Communication {
        node: NodeId,
        topic: Topic,
        policy: IoPolicy,
        #[source]
        source: TransportError,
    },

    #[error("No tokio runtime available")]
    NoRuntime,
}

impl MessagingError {
    /// The destination is no longer part of the topology
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            MessagingError::NodeNotFound(_)
                | MessagingError::Communication {
                    source: TransportError::Unreachable(_),
                    ..
                }
        )
    }

    /// The caller may retry the send
    pub fn is_retryable(&self) -> bool {
        matches!(self, MessagingError::Communication { .. })
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
