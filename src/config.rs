//! Node configuration

use gridcore_messaging::MessagingConfig;
use gridcore_near::NearConfig;
use gridcore_tx::TxConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub messaging: MessagingConfig,
    pub tx: TxConfig,
    pub near: NearConfig,
    /// Affinity partitions
    pub partitions: u32,
    /// Backup copies of every partition
    pub backups: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            messaging: MessagingConfig::default(),
            tx: TxConfig::default(),
            near: NearConfig::default(),
            partitions: 1024,
            backups: 1,
        }
    }
}

impl GridConfig {
    pub fn for_testing() -> Self {
        Self {
            messaging: MessagingConfig::for_testing(),
            tx: TxConfig::for_testing(),
            near: NearConfig::for_testing(),
            partitions: 64,
            backups: 1,
        }
    }

    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_sections_default() {
        let config: GridConfig =
            serde_json::from_str(r#"{"backups": 2, "near": {"delete_history_size": 16}}"#).unwrap();
        assert_eq!(config.backups, 2);
        assert_eq!(config.partitions, 1024);
        assert_eq!(config.near.delete_history_capacity(), 16);
        assert_eq!(config.messaging, MessagingConfig::default());
    }
}
