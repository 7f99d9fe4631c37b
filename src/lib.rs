//! Idempotent batch loading of sales transactions into a star schema.
//!
//! Raw [`TransactionRecord`]s are grouped into batches by [`BatchIngestor`].
//! Each batch runs inside one [`UnitOfWork`]: the five dimension keys of every
//! record are resolved (created on first sight), the resulting [`SaleFact`] is
//! inserted unless its business key already exists, and the whole batch then
//! commits or rolls back as a unit. [`AggregateMaintainer`] keeps plain, rollup
//! and cube store x product summaries derived from the committed facts.
//!
//! ```rust
//! use starload::{
//!     AggregateMaintainer, BatchIngestor, GroupingMode, LoaderConfig, TransactionRecord, Warehouse,
//! };
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let warehouse = Arc::new(Warehouse::in_memory());
//! let aggregates = Arc::new(AggregateMaintainer::new(warehouse.clone()));
//! let ingestor = BatchIngestor::new(warehouse.clone(), LoaderConfig::default())?
//!     .with_aggregates(aggregates.clone());
//!
//! let records = vec![TransactionRecord::new(
//!     "Alice", "Downtown", "Acme", "Widget", "2024-01-15", 2, 9.5,
//! )];
//! let report = ingestor.ingest(records)?;
//! assert!(report.succeeded());
//!
//! let snapshot = aggregates.refresh(GroupingMode::Rollup)?;
//! println!("{} aggregate rows", snapshot.rows().len());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod date;
pub mod dimension;
pub mod error;
pub mod fact;
pub mod io;
pub mod table;
pub mod warehouse;

pub use aggregate::{
    AggregateMaintainer, AggregateRow, AggregateSnapshot, Group, GroupingMode, ViewState,
};
pub use batch::{BatchIngestor, BatchReport, FailedRecord, FailureReason, RunReport};
pub use config::LoaderConfig;
pub use date::{DateDeriver, DateParts};
pub use dimension::{
    CustomerAttrs, DateAttrs, DimensionResolver, ProductAttrs, StoreAttrs, SupplierAttrs,
};
pub use error::{AggregateError, ConfigError, JournalError, LoadError, ValidationError};
pub use fact::{FactWriter, WriteOutcome};
pub use warehouse::{UnitOfWork, Warehouse, WarehouseSnapshot};

/// System-assigned identifier of a dimension row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(pub u64);

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Customer,
    Store,
    Supplier,
    Product,
    Date,
}

impl DimensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Customer => "customer",
            DimensionKind::Store => "store",
            DimensionKind::Supplier => "supplier",
            DimensionKind::Product => "product",
            DimensionKind::Date => "date",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw sales transaction as it arrives from a source.
///
/// Natural keys are the names (and the calendar date). String fields default
/// to empty when absent so that a missing field is reported as a
/// [`ValidationError::MissingField`] rather than an undecodable line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_gender: Option<String>,
    #[serde(default)]
    pub store_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_city: Option<String>,
    #[serde(default)]
    pub supplier_name: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_category: Option<String>,
    /// Calendar date, `YYYY-MM-DD`.
    #[serde(default)]
    pub date: String,
    pub quantity: u32,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sale: Option<f64>,
}

impl TransactionRecord {
    pub fn new(
        customer: impl Into<String>,
        store: impl Into<String>,
        supplier: impl Into<String>,
        product: impl Into<String>,
        date: impl Into<String>,
        quantity: u32,
        price: f64,
    ) -> Self {
        Self {
            transaction_id: None,
            customer_name: customer.into(),
            customer_gender: None,
            store_name: store.into(),
            store_city: None,
            supplier_name: supplier.into(),
            product_name: product.into(),
            product_category: None,
            date: date.into(),
            quantity,
            price,
            total_sale: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_total(mut self, total_sale: f64) -> Self {
        self.total_sale = Some(total_sale);
        self
    }

    /// How this record is named in failure reports.
    pub fn identity(&self, position: usize) -> String {
        match &self.transaction_id {
            Some(id) => id.clone(),
            None => format!("#{position}"),
        }
    }
}

/// The tuple identifying one transaction occurrence in the fact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusinessKey {
    pub customer_key: SurrogateKey,
    pub store_key: SurrogateKey,
    pub supplier_key: SurrogateKey,
    pub product_key: SurrogateKey,
    pub date_key: SurrogateKey,
}

/// A row of the fact table. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleFact {
    pub customer_key: SurrogateKey,
    pub store_key: SurrogateKey,
    pub supplier_key: SurrogateKey,
    pub product_key: SurrogateKey,
    pub date_key: SurrogateKey,
    pub total_sale: f64,
    pub price: f64,
    pub quantity: u32,
}

impl SaleFact {
    pub fn business_key(&self) -> BusinessKey {
        BusinessKey {
            customer_key: self.customer_key,
            store_key: self.store_key,
            supplier_key: self.supplier_key,
            product_key: self.product_key,
            date_key: self.date_key,
        }
    }
}
