//! I/O policies select the worker pool that processes a message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IoPolicy {
    /// General purpose user traffic
    Public = 0,
    /// Internal system traffic (transactions, atomic updates)
    System = 1,
    Management = 2,
    /// Affinity computation
    Affinity = 3,
    Replication = 4,
}

impl IoPolicy {
    pub const ALL: [IoPolicy; 5] = [
        IoPolicy::Public,
        IoPolicy::System,
        IoPolicy::Management,
        IoPolicy::Affinity,
        IoPolicy::Replication,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::System => "system",
            Self::Management => "management",
            Self::Affinity => "affinity",
            Self::Replication => "replication",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_roundtrip() {
        for policy in IoPolicy::ALL {
            assert_eq!(IoPolicy::from_ordinal(policy.ordinal()), Some(policy));
        }
        assert_eq!(IoPolicy::from_ordinal(5), None);
    }
}
