use crate::{
    dimension::{
        CustomerAttrs, DateAttrs, DimensionAttributes, DimensionTable, ProductAttrs, Resolved,
        StoreAttrs, SupplierAttrs,
    },
    error::JournalError,
    fact::FactTable,
    io::{JournalEntry, JournalReader, StreamWriter},
    table::TxId,
    DimensionKind, LoaderConfig, SaleFact, SurrogateKey,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// The star schema: five dimension tables and one fact table.
///
/// Writes happen through a [`UnitOfWork`]. Rows a unit creates stay private
/// to it until [`UnitOfWork::commit`], which publishes all of them at once
/// under the commit gate; dropping or rolling back the unit discards them.
/// When opened on a path, every commit is first appended to a journal that
/// is replayed on the next open.
///
/// # Examples
///
/// ```rust
/// use starload::{LoaderConfig, Warehouse};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let warehouse = Warehouse::open("warehouse.journal", &LoaderConfig::default())?;
///
/// let snapshot = warehouse.snapshot();
/// println!("{} facts, {} products", snapshot.facts.len(), snapshot.products.len());
/// # Ok(())
/// # }
/// ```
pub struct Warehouse {
    customers: DimensionTable<CustomerAttrs>,
    stores: DimensionTable<StoreAttrs>,
    suppliers: DimensionTable<SupplierAttrs>,
    products: DimensionTable<ProductAttrs>,
    dates: DimensionTable<DateAttrs>,
    facts: FactTable,
    journal: Option<Mutex<StreamWriter>>,
    /// Held for writing while a unit publishes; readers that need a
    /// cross-table consistent view hold it for reading.
    gate: RwLock<()>,
    next_tx: AtomicU64,
    /// Number of commits that published at least one row.
    generation: AtomicU64,
}

impl Warehouse {
    pub fn in_memory() -> Self {
        Self::with_journal(None)
    }

    /// Open a journal-backed warehouse, replaying any existing journal.
    ///
    /// Only `journal_lock_timeout_ms` is read from `config`.
    pub fn open(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<Self, JournalError> {
        let path = path.as_ref();
        let timeout = config.journal_lock_timeout();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut replayed = Vec::new();
        if path.exists() {
            let reader = JournalReader::open_with_timeout(path, timeout)?;
            for entry in reader {
                replayed.push(entry?);
            }
        }

        let writer = StreamWriter::open_with_timeout(path, timeout)?;
        let warehouse = Self::with_journal(Some(writer));

        let mut last_tx = 0;
        for (line, entry) in replayed.into_iter().enumerate() {
            last_tx = last_tx.max(entry.tx);
            warehouse.replay(line + 1, entry)?;
        }
        warehouse.next_tx.store(last_tx + 1, Ordering::SeqCst);

        tracing::info!(
            path = %path.display(),
            facts = warehouse.facts.len(),
            "warehouse opened"
        );
        Ok(warehouse)
    }

    fn with_journal(journal: Option<StreamWriter>) -> Self {
        Self {
            customers: DimensionTable::new(),
            stores: DimensionTable::new(),
            suppliers: DimensionTable::new(),
            products: DimensionTable::new(),
            dates: DimensionTable::new(),
            facts: FactTable::new(),
            journal: journal.map(Mutex::new),
            gate: RwLock::new(()),
            next_tx: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    fn replay(&self, line: usize, entry: JournalEntry) -> Result<(), JournalError> {
        fn restore<A: DimensionAttributes>(
            table: &DimensionTable<A>,
            line: usize,
            rows: Vec<(SurrogateKey, A)>,
        ) -> Result<(), JournalError> {
            for (key, attrs) in rows {
                if !table.restore(key.0, attrs.natural_key(), attrs) {
                    return Err(JournalError::DuplicateKey {
                        line,
                        kind: A::KIND.as_str(),
                        key,
                    });
                }
            }
            Ok(())
        }

        restore(&self.customers, line, entry.customers)?;
        restore(&self.stores, line, entry.stores)?;
        restore(&self.suppliers, line, entry.suppliers)?;
        restore(&self.products, line, entry.products)?;
        restore(&self.dates, line, entry.dates)?;
        for (id, fact) in entry.facts {
            if !self.facts.restore(id, fact.business_key(), fact) {
                return Err(JournalError::DuplicateKey {
                    line,
                    kind: "fact",
                    key: SurrogateKey(id),
                });
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Start a new unit of work.
    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            warehouse: self,
            tx: self.next_tx.fetch_add(1, Ordering::SeqCst),
            created: CreatedRows::default(),
            finished: false,
        }
    }

    pub fn customers(&self) -> &DimensionTable<CustomerAttrs> {
        &self.customers
    }

    pub fn stores(&self) -> &DimensionTable<StoreAttrs> {
        &self.stores
    }

    pub fn suppliers(&self) -> &DimensionTable<SupplierAttrs> {
        &self.suppliers
    }

    pub fn products(&self) -> &DimensionTable<ProductAttrs> {
        &self.products
    }

    pub fn dates(&self) -> &DimensionTable<DateAttrs> {
        &self.dates
    }

    pub fn facts(&self) -> &FactTable {
        &self.facts
    }

    pub fn dimension_len(&self, kind: DimensionKind) -> usize {
        match kind {
            DimensionKind::Customer => self.customers.len(),
            DimensionKind::Store => self.stores.len(),
            DimensionKind::Supplier => self.suppliers.len(),
            DimensionKind::Product => self.products.len(),
            DimensionKind::Date => self.dates.len(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Committed facts together with the generation they belong to.
    pub fn committed_facts(&self) -> (u64, Vec<SaleFact>) {
        let _gate = self.gate.read();
        let facts = self.facts.rows().into_iter().map(|(_, fact)| fact).collect();
        (self.generation(), facts)
    }

    /// A consistent copy of every committed row.
    pub fn snapshot(&self) -> WarehouseSnapshot {
        fn keyed<A>(rows: Vec<(u64, A)>) -> Vec<(SurrogateKey, A)> {
            rows.into_iter().map(|(id, a)| (SurrogateKey(id), a)).collect()
        }

        let _gate = self.gate.read();
        WarehouseSnapshot {
            generation: self.generation(),
            customers: keyed(self.customers.rows()),
            stores: keyed(self.stores.rows()),
            suppliers: keyed(self.suppliers.rows()),
            products: keyed(self.products.rows()),
            dates: keyed(self.dates.rows()),
            facts: self.facts.rows().into_iter().map(|(_, fact)| fact).collect(),
        }
    }
}

/// Committed state at one point in time, for read-only consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseSnapshot {
    pub generation: u64,
    pub customers: Vec<(SurrogateKey, CustomerAttrs)>,
    pub stores: Vec<(SurrogateKey, StoreAttrs)>,
    pub suppliers: Vec<(SurrogateKey, SupplierAttrs)>,
    pub products: Vec<(SurrogateKey, ProductAttrs)>,
    pub dates: Vec<(SurrogateKey, DateAttrs)>,
    pub facts: Vec<SaleFact>,
}

#[derive(Debug, Default)]
struct CreatedRows {
    customers: Vec<u64>,
    stores: Vec<u64>,
    suppliers: Vec<u64>,
    products: Vec<u64>,
    dates: Vec<u64>,
    facts: Vec<u64>,
}

impl CreatedRows {
    fn dimensions(&self) -> usize {
        self.customers.len()
            + self.stores.len()
            + self.suppliers.len()
            + self.products.len()
            + self.dates.len()
    }

    fn is_empty(&self) -> bool {
        self.dimensions() == 0 && self.facts.is_empty()
    }
}

/// An atomic batch of dimension and fact writes.
///
/// Dropping a unit that was not committed rolls it back.
pub struct UnitOfWork<'w> {
    warehouse: &'w Warehouse,
    tx: TxId,
    created: CreatedRows,
    finished: bool,
}

impl<'w> UnitOfWork<'w> {
    pub fn warehouse(&self) -> &'w Warehouse {
        self.warehouse
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Dimension rows this unit has created so far.
    pub fn created_dimensions(&self) -> usize {
        self.created.dimensions()
    }

    pub fn inserted_facts(&self) -> usize {
        self.created.facts.len()
    }

    pub(crate) fn track(&mut self, kind: DimensionKind, resolved: Resolved) {
        if !resolved.created {
            return;
        }
        let ids = match kind {
            DimensionKind::Customer => &mut self.created.customers,
            DimensionKind::Store => &mut self.created.stores,
            DimensionKind::Supplier => &mut self.created.suppliers,
            DimensionKind::Product => &mut self.created.products,
            DimensionKind::Date => &mut self.created.dates,
        };
        ids.push(resolved.key.0);
    }

    pub(crate) fn track_fact(&mut self, id: u64) {
        self.created.facts.push(id);
    }

    /// Publish every row this unit created, journaling them first.
    ///
    /// If the journal cannot be written the unit is rolled back and nothing
    /// becomes visible.
    pub fn commit(mut self) -> Result<(), JournalError> {
        let warehouse = self.warehouse;
        let gate = warehouse.gate.write();

        if let Some(journal) = &warehouse.journal {
            if !self.created.is_empty() {
                let entry = self.journal_entry();
                if let Err(err) = journal.lock().write_batch(&[entry]) {
                    drop(gate);
                    self.discard();
                    return Err(err.into());
                }
            }
        }

        let tx = self.tx;
        let created = &self.created;
        warehouse.customers.commit(tx, &created.customers);
        warehouse.stores.commit(tx, &created.stores);
        warehouse.suppliers.commit(tx, &created.suppliers);
        warehouse.products.commit(tx, &created.products);
        warehouse.dates.commit(tx, &created.dates);
        warehouse.facts.commit(tx, &created.facts);
        if !created.is_empty() {
            warehouse.generation.fetch_add(1, Ordering::SeqCst);
        }
        drop(gate);

        self.finished = true;
        Ok(())
    }

    /// Discard every row this unit created.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.finished {
            return;
        }
        let warehouse = self.warehouse;
        let tx = self.tx;
        let created = &self.created;
        // Facts first so no in-flight fact outlives the dimensions it names
        warehouse.facts.rollback(tx, &created.facts);
        warehouse.customers.rollback(tx, &created.customers);
        warehouse.stores.rollback(tx, &created.stores);
        warehouse.suppliers.rollback(tx, &created.suppliers);
        warehouse.products.rollback(tx, &created.products);
        warehouse.dates.rollback(tx, &created.dates);
        self.finished = true;
    }

    fn journal_entry(&self) -> JournalEntry {
        fn owned<A: DimensionAttributes>(
            table: &DimensionTable<A>,
            tx: TxId,
            ids: &[u64],
        ) -> Vec<(SurrogateKey, A)> {
            ids.iter()
                .filter_map(|id| table.get_owned(*id, tx).map(|a| (SurrogateKey(*id), a)))
                .collect()
        }

        let warehouse = self.warehouse;
        let tx = self.tx;
        JournalEntry {
            tx,
            committed_at: Utc::now(),
            customers: owned(&warehouse.customers, tx, &self.created.customers),
            stores: owned(&warehouse.stores, tx, &self.created.stores),
            suppliers: owned(&warehouse.suppliers, tx, &self.created.suppliers),
            products: owned(&warehouse.products, tx, &self.created.products),
            dates: owned(&warehouse.dates, tx, &self.created.dates),
            facts: self
                .created
                .facts
                .iter()
                .filter_map(|id| warehouse.facts.get_owned(*id, tx).map(|f| (*id, f)))
                .collect(),
        }
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}
