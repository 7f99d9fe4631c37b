//! Newline-delimited JSON streams: transaction input and the commit journal.

mod common;
mod sync;
pub use sync::{StreamReader, StreamWriter};
#[cfg(test)]
pub(crate) use sync::WriteFault;

#[cfg(feature = "tokio")]
mod asyncio;
#[cfg(feature = "tokio")]
pub use asyncio::AsyncStreamReader;


use crate::{
    dimension::{CustomerAttrs, DateAttrs, ProductAttrs, StoreAttrs, SupplierAttrs},
    table::TxId,
    SaleFact, SurrogateKey, TransactionRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Reads raw transactions, one JSON object per line.
pub type RecordReader = StreamReader<TransactionRecord>;

#[cfg(feature = "tokio")]
pub type AsyncRecordReader = AsyncStreamReader<TransactionRecord>;

/// Reads back the commit journal.
pub type JournalReader = StreamReader<JournalEntry>;

/// Everything one committed batch added, written as a single journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tx: TxId,
    pub committed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub customers: Vec<(SurrogateKey, CustomerAttrs)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stores: Vec<(SurrogateKey, StoreAttrs)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppliers: Vec<(SurrogateKey, SupplierAttrs)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<(SurrogateKey, ProductAttrs)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dates: Vec<(SurrogateKey, DateAttrs)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<(u64, SaleFact)>,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File is already locked by another process")]
    AlreadyLocked,

    #[error("Failed to acquire lock within {0:?}")]
    LockTimeout(Duration),

    #[error("Writer is poisoned: an earlier failed write could not be truncated away")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("File is already locked by another process")]
    AlreadyLocked,

    #[error("Failed to acquire lock within {0:?}")]
    LockTimeout(Duration),
}
