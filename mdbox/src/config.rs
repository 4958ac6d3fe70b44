//! Workspace configuration.

use crate::boxtree::constants::{
    DEFAULT_BUFFER_BYTES, DEFAULT_MAX_DEPTH, DEFAULT_SPLIT_FACTOR, DEFAULT_SPLIT_THRESHOLD,
};
use crate::errors::{MdError, MdResult};

/// Tuning knobs for a workspace. Values are fixed once the workspace is
/// initialized.
#[derive(Debug, Clone)]
pub struct MdConfig {
    split_threshold: usize,
    max_depth: usize,
    split_factor: usize,
    buffer_bytes: usize,
    workers: usize,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MdConfig {
    /// Creates a configuration with default values. The worker count
    /// defaults to the number of available cores.
    pub fn new() -> Self {
        MdConfig {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            split_factor: DEFAULT_SPLIT_FACTOR,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    /// Event count above which a leaf is split.
    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Maximum tree depth; leaves at this depth never split.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Number of children per dimension on split.
    pub fn with_split_factor(mut self, factor: usize) -> Self {
        self.split_factor = factor;
        self
    }

    /// Disk-buffer byte budget for resident event data.
    pub fn with_buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    /// Worker-pool size for split/save tasks.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn split_factor(&self) -> usize {
        self.split_factor
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Checks the configuration before a workspace is built from it.
    pub fn validate(&self) -> MdResult<()> {
        if self.split_threshold == 0 {
            return Err(MdError::Configuration(
                "split threshold must be positive".into(),
            ));
        }
        if self.split_factor < 2 {
            return Err(MdError::Configuration(
                "split factor must be at least 2".into(),
            ));
        }
        if self.buffer_bytes == 0 {
            return Err(MdError::Configuration(
                "disk buffer budget must be positive".into(),
            ));
        }
        if self.workers == 0 {
            return Err(MdError::Configuration(
                "worker count must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_valid() {
        let config = MdConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.split_threshold(), DEFAULT_SPLIT_THRESHOLD);
        assert_eq!(config.split_factor(), DEFAULT_SPLIT_FACTOR);
        assert!(config.workers() >= 1);
    }

    #[test]
    fn test_config_builder_chain() {
        let config = MdConfig::new()
            .with_split_threshold(100)
            .with_max_depth(5)
            .with_split_factor(3)
            .with_buffer_bytes(1 << 20)
            .with_workers(2);
        assert!(config.validate().is_ok());
        assert_eq!(config.split_threshold(), 100);
        assert_eq!(config.max_depth(), 5);
        assert_eq!(config.split_factor(), 3);
        assert_eq!(config.buffer_bytes(), 1 << 20);
        assert_eq!(config.workers(), 2);
    }

    #[test]
    fn test_config_rejects_zero_threshold() {
        let result = MdConfig::new().with_split_threshold(0).validate();
        assert!(matches!(result, Err(MdError::Configuration(_))));
    }

    #[test]
    fn test_config_rejects_split_factor_below_two() {
        assert!(MdConfig::new().with_split_factor(0).validate().is_err());
        assert!(MdConfig::new().with_split_factor(1).validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_budget() {
        assert!(MdConfig::new().with_buffer_bytes(0).validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        assert!(MdConfig::new().with_workers(0).validate().is_err());
    }
}
