//! Near cache configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NearConfig {
    /// Recently deleted entries remembered before the oldest is purged.
    /// Rounded up to a power of two.
    pub delete_history_size: usize,
}

impl Default for NearConfig {
    fn default() -> Self {
        Self {
            delete_history_size: 1_000_000 / 10,
        }
    }
}

impl NearConfig {
    pub fn for_testing() -> Self {
        Self {
            delete_history_size: 8,
        }
    }

    /// Capacity actually allocated for the delete history
    pub fn delete_history_capacity(&self) -> usize {
        self.delete_history_size.max(1).next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity_is_rounded() {
        let config = NearConfig::default();
        assert_eq!(config.delete_history_size, 100_000);
        assert_eq!(config.delete_history_capacity(), 131_072);
    }

    #[test]
    fn test_zero_history_still_allocates() {
        let config = NearConfig {
            delete_history_size: 0,
        };
        assert_eq!(config.delete_history_capacity(), 1);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: NearConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NearConfig::default());
    }
}
