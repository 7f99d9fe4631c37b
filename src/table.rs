// starload/src/table.rs

//! Atomic "insert if absent, else return existing" over a uniqueness key.
//!
//! Every row is owned by the transaction that created it until that
//! transaction commits or rolls back. The contract:
//!
//! - [`KeyedTable::claim`] is atomic with respect to every other claim on the
//!   same table: for one key, exactly one caller ever sees `Created`.
//! - A committed row, or a row the caller's own transaction created, is
//!   returned as `Existing` without mutation.
//! - A row created by another transaction that has not settled yet is
//!   reported as `Pending`. The caller may [`wait_settled`](KeyedTable::wait_settled)
//!   and claim again: after a commit it re-reads the winner, after a rollback
//!   it can create the row itself.
//! - Readers ([`lookup`](KeyedTable::lookup), [`get`](KeyedTable::get),
//!   [`rows`](KeyedTable::rows)) only observe committed rows.
//! - Row ids come from a per-table sequence and are never reused, even when a
//!   claim is rolled back.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Identifies one unit of work.
pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Created(u64),
    Existing(u64),
    Pending { owner: TxId },
}

struct Slot<K, R> {
    key: K,
    row: R,
    owner: Option<TxId>,
}

struct Inner<K, R> {
    index: HashMap<K, u64>,
    rows: BTreeMap<u64, Slot<K, R>>,
    next_id: u64,
    committed: usize,
}

impl<K: Eq + Hash, R> Inner<K, R> {
    fn held_by_other(&self, key: &K, tx: TxId) -> bool {
        self.index
            .get(key)
            .and_then(|id| self.rows.get(id))
            .and_then(|slot| slot.owner)
            .is_some_and(|owner| owner != tx)
    }
}

pub struct KeyedTable<K, R> {
    inner: Mutex<Inner<K, R>>,
    /// Signalled whenever pending rows commit or roll back.
    settled: Condvar,
}

impl<K, R> Default for KeyedTable<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, R> KeyedTable<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                rows: BTreeMap::new(),
                next_id: 1,
                committed: 0,
            }),
            settled: Condvar::new(),
        }
    }

    /// Insert the row built by `make_row` unless `key` is already present.
    ///
    /// `make_row` receives the freshly assigned id and is only called when
    /// the row is actually created.
    pub fn claim(&self, key: &K, tx: TxId, make_row: impl FnOnce(u64) -> R) -> Claim {
        let mut inner = self.inner.lock();

        if let Some(&id) = inner.index.get(key) {
            return match inner.rows.get(&id).and_then(|slot| slot.owner) {
                Some(owner) if owner != tx => Claim::Pending { owner },
                _ => Claim::Existing(id),
            };
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let row = make_row(id);
        inner.index.insert(key.clone(), id);
        inner.rows.insert(
            id,
            Slot {
                key: key.clone(),
                row,
                owner: Some(tx),
            },
        );
        Claim::Created(id)
    }

    /// Block until `key` is no longer held by a transaction other than `tx`,
    /// or until `timeout` elapses. Returns whether the key settled.
    pub fn wait_settled(&self, key: &K, tx: TxId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        while inner.held_by_other(key, tx) {
            if self.settled.wait_until(&mut inner, deadline).timed_out() {
                return !inner.held_by_other(key, tx);
            }
        }
        true
    }

    /// Make the rows `tx` created visible to readers.
    pub fn commit(&self, tx: TxId, ids: &[u64]) {
        let mut inner = self.inner.lock();
        let mut published = 0;
        for id in ids {
            if let Some(slot) = inner.rows.get_mut(id) {
                if slot.owner == Some(tx) {
                    slot.owner = None;
                    published += 1;
                }
            }
        }
        inner.committed += published;
        drop(inner);
        self.settled.notify_all();
    }

    /// Discard the rows `tx` created.
    pub fn rollback(&self, tx: TxId, ids: &[u64]) {
        let mut inner = self.inner.lock();
        for id in ids {
            let owned = inner.rows.get(id).is_some_and(|slot| slot.owner == Some(tx));
            if owned {
                if let Some(slot) = inner.rows.remove(id) {
                    inner.index.remove(&slot.key);
                }
            }
        }
        drop(inner);
        self.settled.notify_all();
    }

    /// Re-insert a committed row with a known id, e.g. when replaying a
    /// journal. Returns `false` if the id or key is already taken.
    pub fn restore(&self, id: u64, key: K, row: R) -> bool {
        let mut inner = self.inner.lock();
        if inner.rows.contains_key(&id) || inner.index.contains_key(&key) {
            return false;
        }
        inner.index.insert(key.clone(), id);
        inner.rows.insert(
            id,
            Slot {
                key,
                row,
                owner: None,
            },
        );
        inner.next_id = inner.next_id.max(id + 1);
        inner.committed += 1;
        true
    }

    /// Id of the committed row with this key.
    pub fn lookup(&self, key: &K) -> Option<u64> {
        let inner = self.inner.lock();
        let id = *inner.index.get(key)?;
        inner
            .rows
            .get(&id)
            .filter(|slot| slot.owner.is_none())
            .map(|_| id)
    }

    pub fn get(&self, id: u64) -> Option<R> {
        let inner = self.inner.lock();
        inner
            .rows
            .get(&id)
            .filter(|slot| slot.owner.is_none())
            .map(|slot| slot.row.clone())
    }

    /// A row created by `tx`, whether or not it has committed yet.
    pub fn get_owned(&self, id: u64, tx: TxId) -> Option<R> {
        let inner = self.inner.lock();
        inner
            .rows
            .get(&id)
            .filter(|slot| slot.owner == Some(tx))
            .map(|slot| slot.row.clone())
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.inner.lock().committed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All committed rows in id order.
    pub fn rows(&self) -> Vec<(u64, R)> {
        let inner = self.inner.lock();
        inner
            .rows
            .iter()
            .filter(|(_, slot)| slot.owner.is_none())
            .map(|(id, slot)| (*id, slot.row.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    type Table = KeyedTable<String, String>;

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn first_claim_creates_and_repeat_returns_existing() {
        let table = Table::new();

        let first = table.claim(&key("widget"), 1, |id| format!("row-{id}"));
        assert_eq!(first, Claim::Created(1));

        let again = table.claim(&key("widget"), 1, |_| unreachable!());
        assert_eq!(again, Claim::Existing(1));
    }

    #[test]
    fn uncommitted_rows_are_invisible_to_readers() {
        let table = Table::new();
        table.claim(&key("widget"), 1, |_| "w".to_string());

        assert_eq!(table.lookup(&key("widget")), None);
        assert_eq!(table.get(1), None);
        assert_eq!(table.get_owned(1, 1), Some("w".to_string()));
        assert!(table.is_empty());

        table.commit(1, &[1]);
        assert_eq!(table.lookup(&key("widget")), Some(1));
        assert_eq!(table.rows(), vec![(1, "w".to_string())]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn other_transaction_sees_pending() {
        let table = Table::new();
        table.claim(&key("widget"), 1, |_| "w".to_string());

        let claim = table.claim(&key("widget"), 2, |_| unreachable!());
        assert_eq!(claim, Claim::Pending { owner: 1 });

        table.commit(1, &[1]);
        assert_eq!(table.claim(&key("widget"), 2, |_| unreachable!()), Claim::Existing(1));
    }

    #[test]
    fn rollback_frees_key_without_reusing_id() {
        let table = Table::new();
        table.claim(&key("widget"), 1, |_| "w".to_string());
        table.rollback(1, &[1]);

        assert_eq!(table.lookup(&key("widget")), None);
        assert_eq!(table.claim(&key("widget"), 2, |_| "w2".to_string()), Claim::Created(2));
    }

    #[test]
    fn rollback_ignores_rows_of_other_transactions() {
        let table = Table::new();
        table.claim(&key("a"), 1, |_| "a".to_string());
        table.commit(1, &[1]);

        table.rollback(2, &[1]);
        assert_eq!(table.lookup(&key("a")), Some(1));
    }

    #[test]
    fn restore_advances_sequence() {
        let table = Table::new();
        assert!(table.restore(7, key("old"), "o".to_string()));
        assert!(!table.restore(7, key("other"), "x".to_string()));
        assert!(!table.restore(8, key("old"), "x".to_string()));

        assert_eq!(table.claim(&key("new"), 1, |_| "n".to_string()), Claim::Created(8));
    }

    #[test]
    fn wait_settled_wakes_on_commit() {
        let table = Arc::new(Table::new());
        table.claim(&key("widget"), 1, |_| "w".to_string());

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.wait_settled(&key("widget"), 2, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        table.commit(1, &[1]);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_settled_times_out() {
        let table = Table::new();
        table.claim(&key("widget"), 1, |_| "w".to_string());

        assert!(!table.wait_settled(&key("widget"), 2, Duration::from_millis(10)));
        // The owner itself never waits
        assert!(table.wait_settled(&key("widget"), 1, Duration::from_millis(10)));
    }

    #[test]
    fn concurrent_claims_create_exactly_one_row() {
        let table = Arc::new(Table::new());

        let handles: Vec<_> = (1..=8)
            .map(|tx| {
                let table = table.clone();
                thread::spawn(move || table.claim(&key("widget"), tx, |_| "w".to_string()))
            })
            .collect();

        let claims: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let created = claims
            .iter()
            .filter(|c| matches!(c, Claim::Created(_)))
            .count();
        assert_eq!(created, 1);
        assert!(claims
            .iter()
            .all(|c| matches!(c, Claim::Created(1) | Claim::Pending { .. })));
    }
}
