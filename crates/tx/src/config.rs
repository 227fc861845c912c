//! Transaction configuration

use gridcore_protocol::Concurrency;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Wait for commit responses unless a transaction overrides it
    pub default_sync_commit: bool,
    /// Wait for rollback responses unless a transaction overrides it
    pub default_sync_rollback: bool,
    pub default_concurrency: Concurrency,
    /// Finished transaction versions a participant remembers to reject late prepares
    pub finished_history: usize,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            default_sync_commit: true,
            default_sync_rollback: true,
            default_concurrency: Concurrency::Pessimistic,
            finished_history: 10_240,
        }
    }
}

impl TxConfig {
    pub fn for_testing() -> Self {
        Self {
            finished_history: 64,
            ..Self::default()
        }
    }
}
