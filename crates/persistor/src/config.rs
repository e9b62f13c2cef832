//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the mapper and transaction manager.
///
/// # Example
///
/// ```
/// use helios_persistor::PersistorConfig;
///
/// let config = PersistorConfig::default().with_max_deadlock_retries(5);
/// assert_eq!(config.max_deadlock_retries, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistorConfig {
    /// How many times `end` re-runs the write phase after a backend deadlock.
    #[serde(default = "default_max_deadlock_retries")]
    pub max_deadlock_retries: u32,

    /// Backoff before retry `n` is `n * deadlock_backoff_ms`.
    #[serde(default = "default_deadlock_backoff_ms")]
    pub deadlock_backoff_ms: u64,

    /// Upper bound on recursive eager fetching.
    #[serde(default = "default_max_fetch_depth")]
    pub max_fetch_depth: usize,
}

fn default_max_deadlock_retries() -> u32 {
    3
}

fn default_deadlock_backoff_ms() -> u64 {
    10
}

fn default_max_fetch_depth() -> usize {
    16
}

impl Default for PersistorConfig {
    fn default() -> Self {
        Self {
            max_deadlock_retries: default_max_deadlock_retries(),
            deadlock_backoff_ms: default_deadlock_backoff_ms(),
            max_fetch_depth: default_max_fetch_depth(),
        }
    }
}

impl PersistorConfig {
    /// Sets the deadlock retry budget.
    pub fn with_max_deadlock_retries(mut self, retries: u32) -> Self {
        self.max_deadlock_retries = retries;
        self
    }

    /// Sets the per-attempt deadlock backoff.
    pub fn with_deadlock_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.deadlock_backoff_ms = backoff_ms;
        self
    }

    /// Sets the eager-fetch depth bound.
    pub fn with_max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    /// Validates the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_fetch_depth == 0 {
            errors.push("max_fetch_depth must be at least 1".to_string());
        }
        if self.deadlock_backoff_ms > 60_000 {
            errors.push("deadlock_backoff_ms must not exceed 60000".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PersistorConfig::default();
        assert_eq!(config.max_deadlock_retries, 3);
        assert_eq!(config.deadlock_backoff_ms, 10);
        assert_eq!(config.max_fetch_depth, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: PersistorConfig =
            serde_json::from_str(r#"{"max_deadlock_retries": 1}"#).unwrap();
        assert_eq!(config.max_deadlock_retries, 1);
        assert_eq!(config.max_fetch_depth, 16);
    }

    #[test]
    fn test_validate_rejects_zero_depth() {
        let errors = PersistorConfig::default()
            .with_max_fetch_depth(0)
            .validate()
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("max_fetch_depth"));
    }
}
