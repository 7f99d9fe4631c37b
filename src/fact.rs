use crate::{
    error::{LoadError, ValidationError},
    table::{Claim, KeyedTable},
    warehouse::UnitOfWork,
    BusinessKey, SaleFact, TransactionRecord,
};
use std::time::Duration;

/// The fact table, keyed by business key.
pub type FactTable = KeyedTable<BusinessKey, SaleFact>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    SkippedDuplicate,
}

/// Inserts facts at most once per business key.
///
/// A business key that already exists, whether committed earlier or written
/// earlier in the same batch, yields [`WriteOutcome::SkippedDuplicate`].
/// Reprocessing the same input therefore leaves the fact table unchanged.
#[derive(Debug, Clone)]
pub struct FactWriter {
    tolerance: f64,
    retry_budget: u32,
    conflict_wait: Duration,
}

impl Default for FactWriter {
    fn default() -> Self {
        Self::new(0.005, 3, Duration::from_millis(50))
    }
}

impl FactWriter {
    pub fn new(tolerance: f64, retry_budget: u32, conflict_wait: Duration) -> Self {
        Self {
            tolerance,
            retry_budget: retry_budget.max(1),
            conflict_wait,
        }
    }

    /// Build the fact row for `record` under already resolved `keys`.
    ///
    /// A supplied total that disagrees with price x quantity by more than the
    /// tolerance is rejected, never silently replaced.
    pub fn build(&self, keys: BusinessKey, record: &TransactionRecord) -> Result<SaleFact, LoadError> {
        if record.quantity == 0 {
            return Err(ValidationError::InvalidQuantity(record.quantity).into());
        }
        if !record.price.is_finite() || record.price < 0.0 {
            return Err(ValidationError::InvalidPrice {
                field: "price",
                value: record.price,
            }
            .into());
        }

        let computed = record.price * f64::from(record.quantity);
        if !computed.is_finite() {
            return Err(ValidationError::InvalidPrice {
                field: "total_sale",
                value: computed,
            }
            .into());
        }

        let total_sale = match record.total_sale {
            None => computed,
            Some(supplied) if !supplied.is_finite() || supplied < 0.0 => {
                return Err(ValidationError::InvalidPrice {
                    field: "total_sale",
                    value: supplied,
                }
                .into());
            }
            Some(supplied) if (supplied - computed).abs() > self.tolerance => {
                return Err(LoadError::Consistency {
                    supplied,
                    computed,
                    tolerance: self.tolerance,
                });
            }
            Some(supplied) => supplied,
        };

        Ok(SaleFact {
            customer_key: keys.customer_key,
            store_key: keys.store_key,
            supplier_key: keys.supplier_key,
            product_key: keys.product_key,
            date_key: keys.date_key,
            total_sale,
            price: record.price,
            quantity: record.quantity,
        })
    }

    /// Insert the fact for `record` inside `uow` unless its business key exists.
    pub fn write(
        &self,
        uow: &mut UnitOfWork<'_>,
        keys: BusinessKey,
        record: &TransactionRecord,
    ) -> Result<WriteOutcome, LoadError> {
        let fact = self.build(keys, record)?;
        let table = uow.warehouse().facts();
        let tx = uow.tx();

        for attempt in 1..=self.retry_budget {
            match table.claim(&keys, tx, |_| fact.clone()) {
                Claim::Created(id) => {
                    uow.track_fact(id);
                    return Ok(WriteOutcome::Inserted);
                }
                Claim::Existing(_) => return Ok(WriteOutcome::SkippedDuplicate),
                Claim::Pending { owner } => {
                    tracing::debug!(owner, attempt, "fact business key held by another batch");
                    if attempt < self.retry_budget {
                        table.wait_settled(&keys, tx, self.conflict_wait);
                    }
                }
            }
        }

        Err(LoadError::FactConflict {
            attempts: self.retry_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SurrogateKey, Warehouse};
    use rstest::rstest;
    use std::thread;

    fn keys(n: u64) -> BusinessKey {
        BusinessKey {
            customer_key: SurrogateKey(n),
            store_key: SurrogateKey(1),
            supplier_key: SurrogateKey(1),
            product_key: SurrogateKey(1),
            date_key: SurrogateKey(1),
        }
    }

    fn record(quantity: u32, price: f64, total: Option<f64>) -> TransactionRecord {
        let mut record = TransactionRecord::new("a", "b", "c", "d", "2024-01-01", quantity, price);
        record.total_sale = total;
        record
    }

    #[rstest]
    #[case::derived(record(3, 2.5, None), 7.5)]
    #[case::supplied_exact(record(3, 2.5, Some(7.5)), 7.5)]
    #[case::supplied_within_tolerance(record(3, 2.5, Some(7.501)), 7.501)]
    fn total_sale(#[case] record: TransactionRecord, #[case] expected: f64) {
        let fact = FactWriter::default().build(keys(1), &record).unwrap();
        assert_eq!(fact.total_sale, expected);
        assert_eq!(fact.business_key(), keys(1));
    }

    #[test]
    fn mismatched_total_is_a_consistency_error() {
        let result = FactWriter::default().build(keys(1), &record(3, 2.5, Some(8.0)));
        assert!(matches!(
            result,
            Err(LoadError::Consistency { supplied, computed, .. }) if supplied == 8.0 && computed == 7.5
        ));
    }

    #[rstest]
    #[case::zero_quantity(record(0, 1.0, None))]
    #[case::negative_price(record(1, -1.0, None))]
    #[case::nan_price(record(1, f64::NAN, None))]
    #[case::infinite_total(record(1, 1.0, Some(f64::INFINITY)))]
    #[case::overflowing_product(record(10, f64::MAX, None))]
    fn invalid_amounts(#[case] record: TransactionRecord) {
        let result = FactWriter::default().build(keys(1), &record);
        assert!(matches!(result, Err(LoadError::Validation(_))));
    }

    #[test]
    fn duplicate_business_key_in_same_unit_is_skipped() {
        let warehouse = Warehouse::in_memory();
        let writer = FactWriter::default();
        let mut uow = warehouse.begin();

        let first = writer.write(&mut uow, keys(1), &record(1, 1.0, None)).unwrap();
        let again = writer.write(&mut uow, keys(1), &record(5, 9.0, None)).unwrap();
        let other = writer.write(&mut uow, keys(2), &record(1, 1.0, None)).unwrap();
        uow.commit().unwrap();

        assert_eq!(first, WriteOutcome::Inserted);
        assert_eq!(again, WriteOutcome::SkippedDuplicate);
        assert_eq!(other, WriteOutcome::Inserted);
        assert_eq!(warehouse.facts().len(), 2);
    }

    #[test]
    fn committed_business_key_is_skipped() {
        let warehouse = Warehouse::in_memory();
        let writer = FactWriter::default();

        let mut uow = warehouse.begin();
        writer.write(&mut uow, keys(1), &record(1, 1.0, None)).unwrap();
        uow.commit().unwrap();

        let mut uow = warehouse.begin();
        let outcome = writer.write(&mut uow, keys(1), &record(1, 1.0, None)).unwrap();
        uow.commit().unwrap();

        assert_eq!(outcome, WriteOutcome::SkippedDuplicate);
        assert_eq!(warehouse.facts().len(), 1);
    }

    #[test]
    fn business_key_held_by_open_unit_exhausts_budget() {
        let warehouse = Warehouse::in_memory();
        let writer = FactWriter::new(0.005, 2, Duration::from_millis(5));

        let mut holder = warehouse.begin();
        writer.write(&mut holder, keys(1), &record(1, 1.0, None)).unwrap();

        let mut contender = warehouse.begin();
        let result = writer.write(&mut contender, keys(1), &record(1, 1.0, None));
        assert!(matches!(result, Err(LoadError::FactConflict { attempts: 2 })));
    }

    #[test]
    fn waiter_skips_once_holder_commits() {
        let warehouse = Warehouse::in_memory();
        let writer = FactWriter::new(0.005, 3, Duration::from_secs(2));

        let mut holder = warehouse.begin();
        writer.write(&mut holder, keys(1), &record(1, 1.0, None)).unwrap();

        let outcome = thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let mut uow = warehouse.begin();
                let outcome = writer.write(&mut uow, keys(1), &record(1, 1.0, None));
                uow.commit().unwrap();
                outcome
            });

            thread::sleep(Duration::from_millis(20));
            holder.commit().unwrap();
            waiter.join().unwrap()
        });

        assert_eq!(outcome.unwrap(), WriteOutcome::SkippedDuplicate);
        assert_eq!(warehouse.facts().len(), 1);
    }

    #[test]
    fn waiter_inserts_once_holder_rolls_back() {
        let warehouse = Warehouse::in_memory();
        let writer = FactWriter::new(0.005, 3, Duration::from_secs(2));

        let mut holder = warehouse.begin();
        writer.write(&mut holder, keys(1), &record(1, 1.0, None)).unwrap();

        let outcome = thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let mut uow = warehouse.begin();
                let outcome = writer.write(&mut uow, keys(1), &record(2, 1.0, None));
                uow.commit().unwrap();
                outcome
            });

            thread::sleep(Duration::from_millis(20));
            holder.rollback();
            waiter.join().unwrap()
        });

        assert_eq!(outcome.unwrap(), WriteOutcome::Inserted);
        let facts = warehouse.committed_facts().1;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].quantity, 2);
    }
}
