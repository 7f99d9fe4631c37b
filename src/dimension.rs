use crate::{
    date::{parse_calendar_date, DateDeriver, DateParts},
    error::{LoadError, ValidationError},
    table::{Claim, KeyedTable, TxId},
    warehouse::UnitOfWork,
    BusinessKey, DimensionKind, SurrogateKey, TransactionRecord,
};
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Descriptive attributes of one dimension type.
///
/// The natural key identifies a row; everything else is carried along on
/// creation and never updated afterwards.
pub trait DimensionAttributes: Clone + Serialize + DeserializeOwned + Send + Sync {
    const KIND: DimensionKind;

    fn natural_key(&self) -> String;

    fn validate(&self) -> Result<(), ValidationError>;
}

/// A dimension table keyed by natural key, row id = surrogate key.
pub type DimensionTable<A> = KeyedTable<String, A>;

fn required(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerAttrs {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

impl DimensionAttributes for CustomerAttrs {
    const KIND: DimensionKind = DimensionKind::Customer;

    fn natural_key(&self) -> String {
        self.name.trim().to_string()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        required(&self.name, "customer_name")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAttrs {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

impl DimensionAttributes for StoreAttrs {
    const KIND: DimensionKind = DimensionKind::Store;

    fn natural_key(&self) -> String {
        self.name.trim().to_string()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        required(&self.name, "store_name")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierAttrs {
    pub name: String,
}

impl DimensionAttributes for SupplierAttrs {
    const KIND: DimensionKind = DimensionKind::Supplier;

    fn natural_key(&self) -> String {
        self.name.trim().to_string()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        required(&self.name, "supplier_name")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAttrs {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl DimensionAttributes for ProductAttrs {
    const KIND: DimensionKind = DimensionKind::Product;

    fn natural_key(&self) -> String {
        self.name.trim().to_string()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        required(&self.name, "product_name")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateAttrs {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub parts: DateParts,
}

impl DateAttrs {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            date,
            parts: DateDeriver::derive(date),
        }
    }
}

impl DimensionAttributes for DateAttrs {
    const KIND: DimensionKind = DimensionKind::Date;

    fn natural_key(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if DateDeriver::derive(self.date) != self.parts {
            return Err(ValidationError::InvalidDate(self.natural_key()));
        }
        Ok(())
    }
}

/// The five dimension attribute sets a record refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDimensions {
    pub customer: CustomerAttrs,
    pub store: StoreAttrs,
    pub supplier: SupplierAttrs,
    pub product: ProductAttrs,
    pub date: DateAttrs,
}

impl RecordDimensions {
    pub fn from_record(record: &TransactionRecord) -> Result<Self, ValidationError> {
        let date = parse_calendar_date(&record.date)?;
        Ok(Self {
            customer: CustomerAttrs {
                name: record.customer_name.clone(),
                gender: record.customer_gender.clone(),
            },
            store: StoreAttrs {
                name: record.store_name.clone(),
                city: record.store_city.clone(),
            },
            supplier: SupplierAttrs {
                name: record.supplier_name.clone(),
            },
            product: ProductAttrs {
                name: record.product_name.clone(),
                category: record.product_category.clone(),
            },
            date: DateAttrs::from_date(date),
        })
    }
}

/// Outcome of resolving one natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub key: SurrogateKey,
    pub created: bool,
}

/// Maps natural keys to surrogate keys, creating dimension rows on first
/// sight.
///
/// Creation is a conditional insert on the natural key. When another
/// in-flight batch already holds the key, the resolver waits for that batch
/// to settle and tries again, up to `retry_budget` attempts, before giving up
/// with [`LoadError::DimensionConflict`].
#[derive(Debug, Clone)]
pub struct DimensionResolver {
    retry_budget: u32,
    conflict_wait: Duration,
}

impl Default for DimensionResolver {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

impl DimensionResolver {
    pub fn new(retry_budget: u32, conflict_wait: Duration) -> Self {
        Self {
            retry_budget: retry_budget.max(1),
            conflict_wait,
        }
    }

    /// Resolve `attrs` in `table` on behalf of transaction `tx`.
    pub fn resolve<A: DimensionAttributes>(
        &self,
        table: &DimensionTable<A>,
        tx: TxId,
        attrs: A,
    ) -> Result<Resolved, LoadError> {
        attrs.validate()?;
        let natural_key = attrs.natural_key();

        for attempt in 1..=self.retry_budget {
            match table.claim(&natural_key, tx, |_| attrs.clone()) {
                Claim::Created(id) => {
                    return Ok(Resolved {
                        key: SurrogateKey(id),
                        created: true,
                    })
                }
                Claim::Existing(id) => {
                    return Ok(Resolved {
                        key: SurrogateKey(id),
                        created: false,
                    })
                }
                Claim::Pending { owner } => {
                    tracing::debug!(
                        kind = %A::KIND,
                        natural_key = %natural_key,
                        owner,
                        attempt,
                        "dimension row held by another batch"
                    );
                    if attempt < self.retry_budget {
                        table.wait_settled(&natural_key, tx, self.conflict_wait);
                    }
                }
            }
        }

        Err(LoadError::DimensionConflict {
            kind: A::KIND,
            natural_key,
            attempts: self.retry_budget,
        })
    }

    /// Resolve all five dimension keys of `record` inside `uow`.
    pub fn resolve_record(
        &self,
        uow: &mut UnitOfWork<'_>,
        record: &TransactionRecord,
    ) -> Result<BusinessKey, LoadError> {
        let dims = RecordDimensions::from_record(record)?;
        let warehouse = uow.warehouse();
        let tx = uow.tx();

        let customer = self.resolve(warehouse.customers(), tx, dims.customer)?;
        uow.track(DimensionKind::Customer, customer);
        let store = self.resolve(warehouse.stores(), tx, dims.store)?;
        uow.track(DimensionKind::Store, store);
        let supplier = self.resolve(warehouse.suppliers(), tx, dims.supplier)?;
        uow.track(DimensionKind::Supplier, supplier);
        let product = self.resolve(warehouse.products(), tx, dims.product)?;
        uow.track(DimensionKind::Product, product);
        let date = self.resolve(warehouse.dates(), tx, dims.date)?;
        uow.track(DimensionKind::Date, date);

        Ok(BusinessKey {
            customer_key: customer.key,
            store_key: store.key,
            supplier_key: supplier.key,
            product_key: product.key,
            date_key: date.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Warehouse;
    use rstest::rstest;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn product(name: &str) -> ProductAttrs {
        ProductAttrs {
            name: name.to_string(),
            category: None,
        }
    }

    #[test]
    fn resolve_creates_then_reuses() {
        let table = DimensionTable::<ProductAttrs>::new();
        let resolver = DimensionResolver::default();

        let first = resolver.resolve(&table, 1, product("Widget")).unwrap();
        assert!(first.created);

        let second = resolver.resolve(&table, 1, product("Widget")).unwrap();
        assert_eq!(second, Resolved { key: first.key, created: false });
    }

    #[test]
    fn natural_key_is_trimmed() {
        let table = DimensionTable::<ProductAttrs>::new();
        let resolver = DimensionResolver::default();

        let a = resolver.resolve(&table, 1, product("Widget")).unwrap();
        let b = resolver.resolve(&table, 1, product("  Widget ")).unwrap();
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn existing_row_attributes_are_not_mutated() {
        let table = DimensionTable::<ProductAttrs>::new();
        let resolver = DimensionResolver::default();

        let first = resolver.resolve(&table, 1, product("Widget")).unwrap();
        table.commit(1, &[first.key.0]);

        let relabelled = ProductAttrs {
            name: "Widget".to_string(),
            category: Some("Tools".to_string()),
        };
        resolver.resolve(&table, 2, relabelled).unwrap();

        assert_eq!(table.get(first.key.0), Some(product("Widget")));
    }

    #[rstest]
    #[case(product(""), "product_name")]
    #[case(product("   "), "product_name")]
    fn missing_natural_key_is_a_validation_error(
        #[case] attrs: ProductAttrs,
        #[case] field: &'static str,
    ) {
        let table = DimensionTable::<ProductAttrs>::new();
        let result = DimensionResolver::default().resolve(&table, 1, attrs);
        assert!(matches!(
            result,
            Err(LoadError::Validation(ValidationError::MissingField(f))) if f == field
        ));
        // No surrogate key was consumed
        let probe = table.claim(&"probe".to_string(), 9, |_| product("probe"));
        assert_eq!(probe, Claim::Created(1));
    }

    #[test]
    fn inconsistent_date_parts_are_rejected() {
        let table = DimensionTable::<DateAttrs>::new();
        let mut attrs = DateAttrs::from_date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        attrs.parts.quarter = 1;

        let result = DimensionResolver::default().resolve(&table, 1, attrs);
        assert!(matches!(
            result,
            Err(LoadError::Validation(ValidationError::InvalidDate(_)))
        ));
    }

    #[test]
    fn held_key_exhausts_retry_budget() {
        let table = DimensionTable::<ProductAttrs>::new();
        let resolver = DimensionResolver::new(3, Duration::from_millis(5));

        resolver.resolve(&table, 1, product("Widget")).unwrap();

        let result = resolver.resolve(&table, 2, product("Widget"));
        assert!(matches!(
            result,
            Err(LoadError::DimensionConflict { kind: DimensionKind::Product, attempts: 3, .. })
        ));
    }

    #[test]
    fn waiter_adopts_row_once_owner_commits() {
        let table = Arc::new(DimensionTable::<ProductAttrs>::new());
        let resolver = DimensionResolver::new(3, Duration::from_secs(2));

        let owned = resolver.resolve(&table, 1, product("Widget")).unwrap();

        let waiter = {
            let table = table.clone();
            let resolver = resolver.clone();
            thread::spawn(move || resolver.resolve(&table, 2, product("Widget")))
        };

        thread::sleep(Duration::from_millis(20));
        table.commit(1, &[owned.key.0]);

        let adopted = waiter.join().unwrap().unwrap();
        assert_eq!(adopted, Resolved { key: owned.key, created: false });
    }

    #[test]
    fn waiter_creates_row_once_owner_rolls_back() {
        let table = Arc::new(DimensionTable::<ProductAttrs>::new());
        let resolver = DimensionResolver::new(3, Duration::from_secs(2));

        let owned = resolver.resolve(&table, 1, product("Widget")).unwrap();

        let waiter = {
            let table = table.clone();
            let resolver = resolver.clone();
            thread::spawn(move || resolver.resolve(&table, 2, product("Widget")))
        };

        thread::sleep(Duration::from_millis(20));
        table.rollback(1, &[owned.key.0]);

        let created = waiter.join().unwrap().unwrap();
        assert!(created.created);
        assert_ne!(created.key, owned.key);
    }

    #[test]
    fn concurrent_resolution_converges_on_one_row() {
        let warehouse = Arc::new(Warehouse::in_memory());
        let resolver = DimensionResolver::new(3, Duration::from_secs(2));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let warehouse = warehouse.clone();
                let resolver = resolver.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut uow = warehouse.begin();
                    barrier.wait();
                    let resolved = resolver
                        .resolve(warehouse.products(), uow.tx(), product("Gadget"))
                        .unwrap();
                    uow.track(DimensionKind::Product, resolved);
                    uow.commit().unwrap();
                    resolved.key
                })
            })
            .collect();

        let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(keys[0], keys[1]);
        assert_eq!(warehouse.products().len(), 1);
    }

    #[test]
    fn record_dimensions_derive_date_parts() {
        let record = TransactionRecord::new("Alice", "Downtown", "Acme", "Widget", "2024-08-03", 1, 2.0);
        let dims = RecordDimensions::from_record(&record).unwrap();

        assert_eq!(dims.date.natural_key(), "2024-08-03");
        assert_eq!(dims.date.parts.quarter, 3);
        assert_eq!(dims.store.natural_key(), "Downtown");
    }
}
