//! Communication topics.

use gridcore_common::FutureId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal written on the wire for [`Topic::Custom`]
pub const CUSTOM_TOPIC_ORDINAL: u8 = 0xFF;

/// A logical communication channel.
///
/// Well-known topics are small enumerants; ad-hoc topics carry an opaque
/// value, typically a future id used for exactly one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    Job,
    Task,
    Event,
    Cache,
    User,
    Comm,
    Replication,
    Custom(Vec<u8>),
}

impl Topic {
    const WELL_KNOWN: [Topic; 7] = [
        Topic::Job,
        Topic::Task,
        Topic::Event,
        Topic::Cache,
        Topic::User,
        Topic::Comm,
        Topic::Replication,
    ];

    pub fn custom(value: impl Into<Vec<u8>>) -> Self {
        Topic::Custom(value.into())
    }

    /// Topic correlating a single exchange with a future
    pub fn for_future(id: FutureId) -> Self {
        Topic::Custom(id.to_bytes().to_vec())
    }

    /// Wire ordinal; `None` for custom topics
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            Topic::Job => Some(0),
            Topic::Task => Some(1),
            Topic::Event => Some(2),
            Topic::Cache => Some(3),
            Topic::User => Some(4),
            Topic::Comm => Some(5),
            Topic::Replication => Some(6),
            Topic::Custom(_) => None,
        }
    }

    /// Ordinal as written on the wire, [`CUSTOM_TOPIC_ORDINAL`] for custom topics
    pub fn wire_ordinal(&self) -> u8 {
        self.ordinal().unwrap_or(CUSTOM_TOPIC_ORDINAL)
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::WELL_KNOWN.get(ordinal as usize).cloned()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Custom(bytes) => {
                write!(f, "custom:")?;
                for b in bytes.iter().take(8) {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            other => write!(f, "{:?}", other),
        }
    }
}
