use crate::{error::AggregateError, warehouse::Warehouse, SaleFact, SurrogateKey};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// One row per observed (store, product) pair.
    Plain,
    /// Plain rows, a subtotal per store, and a grand total.
    Rollup,
    /// Rollup rows plus a subtotal per product.
    Cube,
}

impl GroupingMode {
    pub const ALL: [GroupingMode; 3] = [
        GroupingMode::Plain,
        GroupingMode::Rollup,
        GroupingMode::Cube,
    ];

    fn index(self) -> usize {
        match self {
            GroupingMode::Plain => 0,
            GroupingMode::Rollup => 1,
            GroupingMode::Cube => 2,
        }
    }
}

/// A grouping value: a concrete key, or `All` for a subtotal across it.
///
/// `All` orders after every concrete key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Group<K> {
    Key(K),
    All,
}

impl<K: fmt::Display> fmt::Display for Group<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Key(key) => key.fmt(f),
            Group::All => f.pad("ALL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub store: Group<SurrogateKey>,
    pub product: Group<SurrogateKey>,
    pub total_sale: f64,
}

/// A fully computed aggregate. Published snapshots are never modified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub mode: GroupingMode,
    /// Warehouse generation the snapshot was computed from.
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    rows: Vec<AggregateRow>,
}

impl AggregateSnapshot {
    /// Rows ordered by store, then product, `All` last at each level.
    pub fn rows(&self) -> &[AggregateRow] {
        &self.rows
    }

    pub fn total(&self, store: Group<SurrogateKey>, product: Group<SurrogateKey>) -> Option<f64> {
        self.rows
            .binary_search_by(|row| (row.store, row.product).cmp(&(store, product)))
            .ok()
            .map(|i| self.rows[i].total_sale)
    }
}

/// Sum `total_sale` per (store, product) under `mode`.
///
/// Facts are summed in the order given, so equal input yields bit-identical
/// totals. Rollup and cube always carry the grand total, even over no facts.
pub fn compute(mode: GroupingMode, facts: &[SaleFact]) -> Result<Vec<AggregateRow>, AggregateError> {
    let mut cells: BTreeMap<(Group<SurrogateKey>, Group<SurrogateKey>), f64> = BTreeMap::new();

    if mode != GroupingMode::Plain {
        cells.insert((Group::All, Group::All), 0.0);
    }

    for fact in facts {
        let store = Group::Key(fact.store_key);
        let product = Group::Key(fact.product_key);

        let mut add = |cell| *cells.entry(cell).or_insert(0.0) += fact.total_sale;
        add((store, product));
        if mode != GroupingMode::Plain {
            add((store, Group::All));
            add((Group::All, Group::All));
        }
        if mode == GroupingMode::Cube {
            add((Group::All, product));
        }
    }

    cells
        .into_iter()
        .map(|((store, product), total_sale)| {
            if !total_sale.is_finite() {
                return Err(AggregateError::NonFiniteTotal {
                    store: store.to_string(),
                    product: product.to_string(),
                });
            }
            Ok(AggregateRow {
                store,
                product,
                total_sale,
            })
        })
        .collect()
}

/// Lifecycle of one aggregate view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    Fresh,
    Stale,
    Refreshing,
}

struct View {
    published: RwLock<Option<Arc<AggregateSnapshot>>>,
    state: Mutex<ViewState>,
    /// Held for the whole of a refresh so refreshes of one view never overlap.
    flight: Mutex<()>,
}

impl View {
    fn new() -> Self {
        Self {
            published: RwLock::new(None),
            state: Mutex::new(ViewState::Stale),
            flight: Mutex::new(()),
        }
    }
}

/// Maintains the store x product aggregate views over a warehouse.
///
/// Each view is recomputed wholesale from the committed facts and swapped in
/// only once complete; readers keep seeing the previous snapshot until then.
/// Refreshes of the same view are serialized; different views refresh
/// independently.
///
/// # Examples
///
/// ```rust
/// use starload::{AggregateMaintainer, GroupingMode, ViewState, Warehouse};
/// use std::sync::Arc;
///
/// let warehouse = Arc::new(Warehouse::in_memory());
/// let aggregates = AggregateMaintainer::new(warehouse);
///
/// assert_eq!(aggregates.state(GroupingMode::Cube), ViewState::Stale);
/// let snapshot = aggregates.refresh(GroupingMode::Cube).unwrap();
/// assert_eq!(snapshot.rows().len(), 1); // grand total only
/// assert_eq!(aggregates.state(GroupingMode::Cube), ViewState::Fresh);
/// ```
pub struct AggregateMaintainer {
    warehouse: Arc<Warehouse>,
    views: [View; 3],
}

impl AggregateMaintainer {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self {
            warehouse,
            views: [View::new(), View::new(), View::new()],
        }
    }

    fn view(&self, mode: GroupingMode) -> &View {
        &self.views[mode.index()]
    }

    /// Current state of a view. A fresh view whose snapshot lags the
    /// warehouse is reported (and recorded) as stale.
    pub fn state(&self, mode: GroupingMode) -> ViewState {
        let view = self.view(mode);
        let mut state = view.state.lock();
        if *state == ViewState::Fresh {
            let lagging = view
                .published
                .read()
                .as_ref()
                .map_or(true, |s| s.generation != self.warehouse.generation());
            if lagging {
                *state = ViewState::Stale;
            }
        }
        *state
    }

    /// The last complete snapshot of a view, if it was ever refreshed.
    pub fn snapshot(&self, mode: GroupingMode) -> Option<Arc<AggregateSnapshot>> {
        self.view(mode).published.read().clone()
    }

    /// Mark every fresh view stale. Called after a batch commits.
    pub fn invalidate(&self) {
        for view in &self.views {
            let mut state = view.state.lock();
            if *state == ViewState::Fresh {
                *state = ViewState::Stale;
            }
        }
    }

    /// Recompute a view from the committed facts and publish it.
    ///
    /// If another refresh of the same view is running this waits for it, and
    /// returns its snapshot when that is already current. On failure the view
    /// goes back to stale and the published snapshot is left untouched.
    pub fn refresh(&self, mode: GroupingMode) -> Result<Arc<AggregateSnapshot>, AggregateError> {
        let view = self.view(mode);
        let _flight = view.flight.lock();

        if self.state(mode) == ViewState::Fresh {
            if let Some(current) = self.snapshot(mode) {
                return Ok(current);
            }
        }

        *view.state.lock() = ViewState::Refreshing;
        let (generation, facts) = self.warehouse.committed_facts();

        let rows = match compute(mode, &facts) {
            Ok(rows) => rows,
            Err(err) => {
                *view.state.lock() = ViewState::Stale;
                tracing::warn!(?mode, error = %err, "aggregate refresh failed");
                return Err(err);
            }
        };

        let snapshot = Arc::new(AggregateSnapshot {
            mode,
            generation,
            built_at: Utc::now(),
            rows,
        });
        *view.published.write() = Some(snapshot.clone());

        // Commits that landed while computing leave the view stale
        let mut state = view.state.lock();
        *state = if generation == self.warehouse.generation() {
            ViewState::Fresh
        } else {
            ViewState::Stale
        };
        drop(state);

        tracing::info!(?mode, generation, rows = snapshot.rows.len(), "aggregate refreshed");
        Ok(snapshot)
    }

    /// Refresh every view, each on its own thread.
    pub fn refresh_all(&self) -> Vec<Result<Arc<AggregateSnapshot>, AggregateError>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = GroupingMode::ALL
                .iter()
                .map(|mode| scope.spawn(move || self.refresh(*mode)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fact(store: u64, product: u64, total: f64) -> SaleFact {
        SaleFact {
            customer_key: SurrogateKey(1),
            store_key: SurrogateKey(store),
            supplier_key: SurrogateKey(1),
            product_key: SurrogateKey(product),
            date_key: SurrogateKey(1),
            total_sale: total,
            price: total,
            quantity: 1,
        }
    }

    fn key(k: u64) -> Group<SurrogateKey> {
        Group::Key(SurrogateKey(k))
    }

    /// 2 stores x 3 products, one fact each.
    fn grid() -> Vec<SaleFact> {
        let mut facts = Vec::new();
        for store in 1..=2 {
            for product in 1..=3 {
                facts.push(fact(store, product, (store * 10 + product) as f64));
            }
        }
        facts
    }

    #[rstest]
    #[case(GroupingMode::Plain, 6)]
    #[case(GroupingMode::Rollup, 9)]
    #[case(GroupingMode::Cube, 12)]
    fn cardinality(#[case] mode: GroupingMode, #[case] expected: usize) {
        assert_eq!(compute(mode, &grid()).unwrap().len(), expected);
    }

    #[rstest]
    #[case(GroupingMode::Plain, 0)]
    #[case(GroupingMode::Rollup, 1)]
    #[case(GroupingMode::Cube, 1)]
    fn empty_fact_table(#[case] mode: GroupingMode, #[case] expected: usize) {
        assert_eq!(compute(mode, &[]).unwrap().len(), expected);
    }

    #[test]
    fn cube_order_puts_all_after_concrete_keys() {
        let rows = compute(GroupingMode::Cube, &grid()).unwrap();
        let order: Vec<_> = rows.iter().map(|r| (r.store, r.product)).collect();

        assert_eq!(
            order,
            vec![
                (key(1), key(1)),
                (key(1), key(2)),
                (key(1), key(3)),
                (key(1), Group::All),
                (key(2), key(1)),
                (key(2), key(2)),
                (key(2), key(3)),
                (key(2), Group::All),
                (Group::All, key(1)),
                (Group::All, key(2)),
                (Group::All, key(3)),
                (Group::All, Group::All),
            ]
        );
    }

    #[test]
    fn subtotals_and_grand_total() {
        let rows = compute(GroupingMode::Cube, &grid()).unwrap();
        let snapshot = AggregateSnapshot {
            mode: GroupingMode::Cube,
            generation: 0,
            built_at: Utc::now(),
            rows,
        };

        assert_eq!(snapshot.total(key(1), Group::All), Some(11.0 + 12.0 + 13.0));
        assert_eq!(snapshot.total(Group::All, key(2)), Some(12.0 + 22.0));
        assert_eq!(snapshot.total(Group::All, Group::All), Some(99.0));
        assert_eq!(snapshot.total(key(3), key(1)), None);
    }

    #[test]
    fn repeated_pairs_are_summed() {
        let facts = vec![fact(1, 1, 2.5), fact(1, 1, 4.0), fact(1, 2, 1.0)];
        let rows = compute(GroupingMode::Rollup, &facts).unwrap();

        assert_eq!(
            rows,
            vec![
                AggregateRow { store: key(1), product: key(1), total_sale: 6.5 },
                AggregateRow { store: key(1), product: key(2), total_sale: 1.0 },
                AggregateRow { store: key(1), product: Group::All, total_sale: 7.5 },
                AggregateRow { store: Group::All, product: Group::All, total_sale: 7.5 },
            ]
        );
    }

    #[test]
    fn overflowing_sum_fails() {
        let facts = vec![fact(1, 1, f64::MAX), fact(1, 1, f64::MAX)];
        assert_eq!(
            compute(GroupingMode::Plain, &facts),
            Err(AggregateError::NonFiniteTotal {
                store: "1".to_string(),
                product: "1".to_string(),
            })
        );
    }

    #[test]
    fn group_display() {
        assert_eq!(key(7).to_string(), "7");
        assert_eq!(Group::<SurrogateKey>::All.to_string(), "ALL");
    }

    #[test]
    fn fresh_view_goes_stale_on_invalidate() {
        let aggregates = AggregateMaintainer::new(Arc::new(Warehouse::in_memory()));

        aggregates.refresh(GroupingMode::Plain).unwrap();
        assert_eq!(aggregates.state(GroupingMode::Plain), ViewState::Fresh);
        assert_eq!(aggregates.state(GroupingMode::Rollup), ViewState::Stale);

        aggregates.invalidate();
        assert_eq!(aggregates.state(GroupingMode::Plain), ViewState::Stale);
        // The previous snapshot stays readable
        assert!(aggregates.snapshot(GroupingMode::Plain).is_some());
    }

    #[test]
    fn refresh_of_fresh_view_reuses_snapshot() {
        let aggregates = AggregateMaintainer::new(Arc::new(Warehouse::in_memory()));

        let first = aggregates.refresh(GroupingMode::Rollup).unwrap();
        let second = aggregates.refresh(GroupingMode::Rollup).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn refresh_all_publishes_every_view() {
        let aggregates = AggregateMaintainer::new(Arc::new(Warehouse::in_memory()));

        let results = aggregates.refresh_all();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Result::is_ok));
        for mode in GroupingMode::ALL {
            assert_eq!(aggregates.state(mode), ViewState::Fresh);
        }
    }
}
