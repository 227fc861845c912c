use gridcore_common::{CacheKey, NodeId};
use gridcore_messaging::MessagingError;
use thiserror::Error;

/// Near cache error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NearError {
    #[error("Primary node {node} left the topology before answering for keys {keys:?}")]
    Topology { node: NodeId, keys: Vec<CacheKey> },

    #[error("No primary node for key {0}")]
    NoPrimary(CacheKey),

    #[error("Failed to update keys: {0:?}")]
    UpdateFailed(Vec<(CacheKey, String)>),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Update cancelled")]
    Cancelled,
}

impl NearError {
    pub fn is_topology(&self) -> bool {
        match self {
            NearError::Topology { .. } | NearError::NoPrimary(_) => true,
            NearError::Messaging(e) => e.is_topology(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NearError>;
