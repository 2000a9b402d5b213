//! Scan configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a pool scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Maximum number of per-image pipelines in flight at once. Bounds the
    /// read load placed on the cluster; values below 1 behave as 1.
    pub max_concurrency: usize,
    /// Directory-listing page size for the image namespace enumeration.
    pub list_page_size: usize,
}

impl ScanConfig {
    /// Concurrency limit with the lower bound applied.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            list_page_size: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScanConfig::default();
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.list_page_size, 1024);
    }

    #[test]
    fn test_concurrency_lower_bound() {
        let config = ScanConfig {
            max_concurrency: 0,
            ..ScanConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }
}
