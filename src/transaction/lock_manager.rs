use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    error::GraniteError,
    storage::Rid,
    transaction::wait_for_graph::WaitForGraph,
    types::GraniteResult,
    wal::TxnId,
};

/// Lock modes over tables and rows. Intent modes are taken on the
/// table before the matching row mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    /// Standard two-phase-locking compatibility matrix.
    pub fn compatible(&self, other: &LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentShared, Exclusive) | (Exclusive, IntentShared) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (IntentExclusive, _) | (_, IntentExclusive) => false,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Least mode at least as strong as both, used for upgrades.
    fn join(&self, other: &LockMode) -> LockMode {
        use LockMode::*;
        if self == other {
            return *self;
        }
        match (self, other) {
            (IntentShared, m) | (m, IntentShared) => *m,
            _ => Exclusive,
        }
    }
}

/// What is being locked: a whole table or one row in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId {
    pub table_id: u32,
    pub rid: Option<Rid>,
}

impl LockId {
    pub fn table(table_id: u32) -> Self {
        Self {
            table_id,
            rid: None,
        }
    }

    pub fn row(table_id: u32, rid: Rid) -> Self {
        Self {
            table_id,
            rid: Some(rid),
        }
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.rid {
            Some(rid) => write!(f, "{}#{}", self.table_id, rid),
            None => write!(f, "{}", self.table_id),
        }
    }
}

struct LockTables {
    /// Granted holders per lock, strongest mode per transaction.
    entries: HashMap<LockId, HashMap<TxnId, LockMode>>,
    wait_for: WaitForGraph,
    /// Transactions picked as deadlock victims; their next wait step
    /// fails with a conflict error.
    victims: HashSet<TxnId>,
}

/// Strict two-phase locking at table and row granularity. Locks are
/// held until transaction end; waits are bounded by the lock timeout
/// and watched by the deadlock detector.
pub struct LockManager {
    inner: Mutex<LockTables>,
    lock_timeout: Duration,
}

const WAIT_STEP: Duration = Duration::from_millis(5);

impl LockManager {
    pub fn new(lock_timeout_ms: u64) -> Self {
        Self {
            inner: Mutex::new(LockTables {
                entries: HashMap::new(),
                wait_for: WaitForGraph::new(),
                victims: HashSet::new(),
            }),
            lock_timeout: Duration::from_millis(lock_timeout_ms),
        }
    }

    /// Acquire `mode` on `id` for `tx`. Blocks until granted, the
    /// transaction is chosen as a deadlock victim, or the timeout
    /// runs out.
    pub fn acquire(&self, tx: TxnId, id: LockId, mode: LockMode) -> GraniteResult {
        let start = Instant::now();

        loop {
            {
                let mut tables = self.inner.lock().unwrap();

                if tables.victims.contains(&tx) {
                    tables.victims.remove(&tx);
                    tables.wait_for.remove_transaction(tx);
                    let err = GraniteError::conflict(&format!(
                        "tx_{} chosen as deadlock victim while waiting for {} on {}",
                        tx,
                        format!("{:?}", mode),
                        id
                    ));
                    err.show_backtrace();
                    return Err(err);
                }

                let blockers = Self::blockers(&tables, tx, &id, &mode);
                if blockers.is_empty() {
                    let holders = tables.entries.entry(id).or_insert_with(HashMap::new);
                    let granted = match holders.get(&tx) {
                        Some(held) => held.join(&mode),
                        None => mode,
                    };
                    holders.insert(tx, granted);
                    tables.wait_for.remove_waiter(tx);
                    return Ok(());
                }

                for blocker in &blockers {
                    tables.wait_for.add_edge(tx, *blocker);
                }

                // fast path: if this very request closed a cycle and
                // the requester is the youngest member, fail it right
                // here instead of waiting for the detector tick
                if let Some(cycle) = tables.wait_for.find_cycle() {
                    if cycle.contains(&tx) && cycle.iter().all(|t| *t <= tx) {
                        tables.wait_for.remove_transaction(tx);
                        return Err(GraniteError::conflict(&format!(
                            "deadlock detected, tx_{} aborted (cycle: {:?})",
                            tx, cycle
                        )));
                    }
                }
            }

            if start.elapsed() >= self.lock_timeout {
                let mut tables = self.inner.lock().unwrap();
                tables.wait_for.remove_waiter(tx);
                return Err(GraniteError::conflict(&format!(
                    "lock timeout: tx_{} waited {:?} for {}",
                    tx, self.lock_timeout, id
                )));
            }

            sleep(WAIT_STEP);
        }
    }

    fn blockers(tables: &LockTables, tx: TxnId, id: &LockId, mode: &LockMode) -> Vec<TxnId> {
        match tables.entries.get(id) {
            None => Vec::new(),
            Some(holders) => holders
                .iter()
                .filter(|(holder, held)| **holder != tx && !mode.compatible(held))
                .map(|(holder, _)| *holder)
                .collect(),
        }
    }

    /// Release everything `tx` holds. Called exactly once at
    /// transaction end (strict 2PL).
    pub fn release_all(&self, tx: TxnId) {
        let mut tables = self.inner.lock().unwrap();
        tables.entries.retain(|_, holders| {
            holders.remove(&tx);
            !holders.is_empty()
        });
        tables.wait_for.remove_transaction(tx);
        tables.victims.remove(&tx);
        debug!("tx_{} released all locks", tx);
    }

    /// One detector pass. `started_at` and `write_set_size` come from
    /// the transaction manager; the victim is the youngest transaction
    /// in the cycle, ties broken by the smaller write set.
    pub fn detect_deadlock<A, W>(&self, started_at: A, write_set_size: W) -> Option<TxnId>
    where
        A: Fn(TxnId) -> Option<Instant>,
        W: Fn(TxnId) -> usize,
    {
        let mut tables = self.inner.lock().unwrap();
        let cycle = tables.wait_for.find_cycle()?;

        let victim = cycle
            .iter()
            .copied()
            .max_by(|a, b| {
                let age_a = started_at(*a);
                let age_b = started_at(*b);
                // later start = younger = preferred victim
                age_a.cmp(&age_b).then_with(|| {
                    write_set_size(*b)
                        .cmp(&write_set_size(*a))
                        .then(a.cmp(b))
                })
            })
            .unwrap_or(*cycle.last().unwrap());

        warn!(
            "deadlock cycle {:?}, victim tx_{} (write set {})",
            cycle,
            victim,
            write_set_size(victim)
        );
        tables.victims.insert(victim);
        Some(victim)
    }

    /// Whether the transaction has been flagged as a victim but has
    /// not yet observed it (e.g. it is not currently waiting).
    pub fn is_victim(&self, tx: TxnId) -> bool {
        self.inner.lock().unwrap().victims.contains(&tx)
    }

    pub fn held_count(&self, tx: TxnId) -> usize {
        let tables = self.inner.lock().unwrap();
        tables
            .entries
            .values()
            .filter(|holders| holders.contains_key(&tx))
            .count()
    }
}

/// Sort lock targets into the canonical (table_id, rid) order. Taking
/// locks in this order when a statement's write set is known up front
/// keeps such statements out of deadlock cycles entirely.
pub fn canonical_order(mut ids: Vec<LockId>) -> Vec<LockId> {
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(IntentShared.compatible(&IntentExclusive));
        assert!(IntentShared.compatible(&Shared));
        assert!(!IntentShared.compatible(&Exclusive));
        assert!(IntentExclusive.compatible(&IntentExclusive));
        assert!(!IntentExclusive.compatible(&Shared));
        assert!(Shared.compatible(&Shared));
        assert!(!Shared.compatible(&Exclusive));
        assert!(!Exclusive.compatible(&Exclusive));
    }

    #[test]
    fn test_shared_then_exclusive_conflict() {
        let manager = LockManager::new(50);
        let id = LockId::row(1, 10);

        manager.acquire(1, id, LockMode::Shared).unwrap();
        manager.acquire(2, id, LockMode::Shared).unwrap();

        // tx 3 cannot take X while S holders exist
        let err = manager.acquire(3, id, LockMode::Exclusive).unwrap_err();
        assert!(err.is_retriable());

        manager.release_all(1);
        manager.release_all(2);
        manager.acquire(3, id, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_upgrade() {
        let manager = LockManager::new(50);
        let id = LockId::row(1, 1);
        manager.acquire(7, id, LockMode::Shared).unwrap();
        // same transaction upgrades its own lock
        manager.acquire(7, id, LockMode::Exclusive).unwrap();
        assert_eq!(manager.held_count(7), 1);
    }

    #[test]
    fn test_disjoint_rows_do_not_block() {
        let manager = Arc::new(LockManager::new(1_000));
        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);

        let t1 = thread::spawn(move || {
            m1.acquire(1, LockId::row(1, 1), LockMode::Exclusive).unwrap();
        });
        let t2 = thread::spawn(move || {
            m2.acquire(2, LockId::row(1, 2), LockMode::Exclusive).unwrap();
        });
        t1.join().unwrap();
        t2.join().unwrap();
    }

    #[test]
    fn test_detector_picks_youngest() {
        let manager = LockManager::new(5_000);
        let a = LockId::row(1, 1);
        let b = LockId::row(1, 2);

        manager.acquire(1, a, LockMode::Exclusive).unwrap();
        manager.acquire(2, b, LockMode::Exclusive).unwrap();

        // manufacture the cycle edges directly
        {
            let mut tables = manager.inner.lock().unwrap();
            tables.wait_for.add_edge(1, 2);
            tables.wait_for.add_edge(2, 1);
        }

        let base = Instant::now();
        let victim = manager
            .detect_deadlock(
                |tx| Some(base + Duration::from_millis(tx as u64)),
                |_| 0,
            )
            .unwrap();
        // tx 2 started later, so it is the younger one
        assert_eq!(victim, 2);
        assert!(manager.is_victim(2));
    }

    #[test]
    fn test_canonical_order() {
        let ids = vec![
            LockId::row(2, 1),
            LockId::row(1, 9),
            LockId::row(1, 2),
            LockId::row(1, 2),
            LockId::table(1),
        ];
        let sorted = canonical_order(ids);
        assert_eq!(
            sorted,
            vec![
                LockId::table(1),
                LockId::row(1, 2),
                LockId::row(1, 9),
                LockId::row(2, 1),
            ]
        );
    }
}
