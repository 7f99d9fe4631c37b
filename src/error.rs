use crate::{batch::RunReport, io::WriteError, DimensionKind, SurrogateKey};
use thiserror::Error;

/// A record (or part of one) that cannot be loaded as given.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid calendar date: {0:?}")]
    InvalidDate(String),

    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(u32),

    #[error("{field} must be a finite, non-negative number, got {value}")]
    InvalidPrice { field: &'static str, value: f64 },

    #[error("Malformed record: {0}")]
    Malformed(String),
}

/// Failures raised while loading records.
///
/// Everything except [`LoadError::StorageUnavailable`] and
/// [`LoadError::RunAborted`] is scoped to a single record and aborts only
/// that record's batch.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} row {natural_key:?} still held by another batch after {attempts} attempts")]
    DimensionConflict {
        kind: DimensionKind,
        natural_key: String,
        attempts: u32,
    },

    #[error("Fact business key still held by another batch after {attempts} attempts")]
    FactConflict { attempts: u32 },

    #[error("Supplied total {supplied} disagrees with price x quantity = {computed} (tolerance {tolerance})")]
    Consistency {
        supplied: f64,
        computed: f64,
        tolerance: f64,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] JournalError),

    /// Storage failed part way through a run. `report` holds the batches
    /// that finished before the failure; the batch in flight was rolled back.
    #[error("Run aborted after {} finished batches: {source}", .report.batches.len())]
    RunAborted { report: RunReport, source: JournalError },
}

impl LoadError {
    /// Run-level failures abort the whole ingestion instead of one batch.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            LoadError::StorageUnavailable(_) | LoadError::RunAborted { .. }
        )
    }

    /// Reports of the batches that finished before a run was aborted.
    pub fn partial_report(&self) -> Option<&RunReport> {
        match self {
            LoadError::RunAborted { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Transient failures that may succeed if the batch is submitted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoadError::DimensionConflict { .. } | LoadError::FactConflict { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Read error: {0}")]
    Read(#[from] crate::io::ReadError),

    #[error("Journal entry {line} restores {kind} key {key} twice")]
    DuplicateKey {
        line: usize,
        kind: &'static str,
        key: SurrogateKey,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    #[error("Total for store {store} / product {product} is not finite")]
    NonFiniteTotal { store: String, product: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
