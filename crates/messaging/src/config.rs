//! Messaging configuration

use gridcore_protocol::IoPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Workers for general purpose messages
    pub public_pool_size: usize,
    /// Workers for internal system messages
    pub system_pool_size: usize,
    pub management_pool_size: usize,
    pub affinity_pool_size: usize,
    pub replication_pool_size: usize,
    /// Queued tasks per pool before callers run them inline
    pub pool_queue_capacity: usize,
    /// Gap timeout for ordered messages sent with timeout 0
    pub network_timeout_ms: u64,
    /// Closed (topic, sender) pairs remembered after departures
    pub max_closed_topics: usize,
    /// Upper bound on waiting for in-flight work during shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            public_pool_size: 8,
            system_pool_size: 8,
            management_pool_size: 4,
            affinity_pool_size: 1,
            replication_pool_size: 2,
            pool_queue_capacity: 1024,
            network_timeout_ms: 5_000,
            max_closed_topics: 10_240,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl MessagingConfig {
    /// Small pools and short timeouts
    pub fn for_testing() -> Self {
        Self {
            public_pool_size: 2,
            system_pool_size: 2,
            management_pool_size: 1,
            affinity_pool_size: 1,
            replication_pool_size: 1,
            pool_queue_capacity: 64,
            network_timeout_ms: 1_000,
            max_closed_topics: 128,
            shutdown_timeout_ms: 2_000,
        }
    }

    pub fn pool_size(&self, policy: IoPolicy) -> usize {
        let size = match policy {
            IoPolicy::Public => self.public_pool_size,
            IoPolicy::System => self.system_pool_size,
            IoPolicy::Management => self.management_pool_size,
            IoPolicy::Affinity => self.affinity_pool_size,
            IoPolicy::Replication => self.replication_pool_size,
        };
        size.max(1)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
