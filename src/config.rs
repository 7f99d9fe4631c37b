use crate::{dimension::DimensionResolver, error::ConfigError, fact::FactWriter};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for loading.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```json
/// { "batch_size": 100, "retry_budget": 5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Records per atomic batch. The last batch may be smaller.
    pub batch_size: usize,
    /// Attempts per dimension or fact claim before a conflict is reported.
    pub retry_budget: u32,
    /// How long one attempt waits for a competing batch to commit or roll back.
    pub conflict_wait_ms: u64,
    /// Largest accepted absolute difference between a supplied total and
    /// price x quantity.
    pub total_tolerance: f64,
    pub journal_lock_timeout_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry_budget: 3,
            conflict_wait_ms: 50,
            total_tolerance: 0.005,
            journal_lock_timeout_ms: 1000,
        }
    }
}

impl LoaderConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.retry_budget == 0 {
            return Err(ConfigError::Invalid("retry_budget must be positive".into()));
        }
        if !self.total_tolerance.is_finite() || self.total_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "total_tolerance must be finite and non-negative, got {}",
                self.total_tolerance
            )));
        }
        Ok(())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn conflict_wait(&self) -> Duration {
        Duration::from_millis(self.conflict_wait_ms)
    }

    pub fn journal_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.journal_lock_timeout_ms)
    }

    pub fn resolver(&self) -> DimensionResolver {
        DimensionResolver::new(self.retry_budget, self.conflict_wait())
    }

    pub fn fact_writer(&self) -> FactWriter {
        FactWriter::new(self.total_tolerance, self.retry_budget, self.conflict_wait())
    }
}
