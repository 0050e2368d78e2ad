use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use log::debug;

use crate::{
    btree::page_id::PageId,
    error::{ErrorKind, GraniteError},
    types::GraniteResult,
    wal::{record::RowChange, Lsn, TxnId, NO_LSN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Aborting,
    Terminated,
}

/// How a terminated transaction ended. Kept around so a second
/// `commit` fails loudly while a second `rollback` stays a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    Aborted,
}

/// One row change made by a live transaction: the pre/post images for
/// undo and forward propagation, plus the LSN of the WAL record that
/// logged it.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub change: RowChange,
    pub lsn: Lsn,
}

pub struct TxnContext {
    pub state: TxnState,
    pub begin_lsn: Lsn,
    pub last_lsn: Lsn,
    pub write_set: Vec<WriteRecord>,
    pub dirty_pages: HashSet<PageId>,
    pub started_at: Instant,
}

/// Bookkeeping for every transaction the engine has seen: current
/// state, write set, dirty pages. The idea of a central status table
/// keyed by transaction id comes from how PostgreSQL tracks
/// transaction state.
pub struct TransactionManager {
    next_id: AtomicU64,
    live: HashMap<TxnId, TxnContext>,
    outcomes: HashMap<TxnId, TxnOutcome>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: HashMap::new(),
            outcomes: HashMap::new(),
        }
    }

    pub fn begin(&mut self, begin_lsn: Lsn) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(
            id,
            TxnContext {
                state: TxnState::Active,
                begin_lsn,
                last_lsn: begin_lsn,
                write_set: Vec::new(),
                dirty_pages: HashSet::new(),
                started_at: Instant::now(),
            },
        );
        debug!("tx_{} started at lsn {}", id, begin_lsn);
        id
    }

    /// Register a transaction id restored by recovery so undo can use
    /// the normal paths. Keeps `next_id` ahead of everything replayed.
    pub fn adopt(&mut self, id: TxnId, begin_lsn: Lsn) {
        self.live.insert(
            id,
            TxnContext {
                state: TxnState::Active,
                begin_lsn,
                last_lsn: begin_lsn,
                write_set: Vec::new(),
                dirty_pages: HashSet::new(),
                started_at: Instant::now(),
            },
        );
        let floor = id + 1;
        if self.next_id.load(Ordering::Relaxed) < floor {
            self.next_id.store(floor, Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: TxnId) -> Option<&TxnContext> {
        self.live.get(&id)
    }

    /// Fix up the begin LSN once the Begin record has been appended.
    pub fn set_begin_lsn(&mut self, id: TxnId, lsn: Lsn) {
        if let Some(ctx) = self.live.get_mut(&id) {
            ctx.begin_lsn = lsn;
            ctx.last_lsn = lsn;
        }
    }

    pub fn outcome(&self, id: TxnId) -> Option<TxnOutcome> {
        self.outcomes.get(&id).copied()
    }

    pub fn state(&self, id: TxnId) -> Option<TxnState> {
        self.live.get(&id).map(|ctx| ctx.state)
    }

    /// Every state-changing operation funnels through this check.
    pub fn ensure_active(&self, id: TxnId) -> GraniteResult {
        match self.state(id) {
            Some(TxnState::Active) => Ok(()),
            _ => Err(GraniteError::new(
                ErrorKind::TxnNotActive,
                &format!("tx_{} is not active", id),
            )),
        }
    }

    pub fn set_state(&mut self, id: TxnId, state: TxnState) -> GraniteResult {
        match self.live.get_mut(&id) {
            Some(ctx) => {
                ctx.state = state;
                Ok(())
            }
            None => Err(GraniteError::new(
                ErrorKind::TxnNotActive,
                &format!("tx_{} is unknown", id),
            )),
        }
    }

    pub fn record_write(&mut self, id: TxnId, record: WriteRecord) -> GraniteResult {
        match self.live.get_mut(&id) {
            Some(ctx) => {
                ctx.last_lsn = record.lsn;
                ctx.write_set.push(record);
                Ok(())
            }
            None => Err(GraniteError::new(
                ErrorKind::TxnNotActive,
                &format!("tx_{} is unknown", id),
            )),
        }
    }

    pub fn add_dirty_page(&mut self, id: TxnId, pid: PageId) {
        if let Some(ctx) = self.live.get_mut(&id) {
            ctx.dirty_pages.insert(pid);
        }
    }

    pub fn dirty_pages(&self, id: TxnId) -> HashSet<PageId> {
        self.live
            .get(&id)
            .map(|ctx| ctx.dirty_pages.clone())
            .unwrap_or_default()
    }

    /// The write set in reverse order, as rollback walks it.
    pub fn write_set_reversed(&self, id: TxnId) -> Vec<WriteRecord> {
        let mut records = self
            .live
            .get(&id)
            .map(|ctx| ctx.write_set.clone())
            .unwrap_or_default();
        records.reverse();
        records
    }

    pub fn write_set_size(&self, id: TxnId) -> usize {
        self.live.get(&id).map(|ctx| ctx.write_set.len()).unwrap_or(0)
    }

    pub fn started_at(&self, id: TxnId) -> Option<Instant> {
        self.live.get(&id).map(|ctx| ctx.started_at)
    }

    /// Close the book on a transaction.
    pub fn terminate(&mut self, id: TxnId, outcome: TxnOutcome) {
        if let Some(ctx) = self.live.get_mut(&id) {
            ctx.state = TxnState::Terminated;
            ctx.write_set.clear();
            ctx.dirty_pages.clear();
        }
        self.live.remove(&id);
        self.outcomes.insert(id, outcome);
        debug!("tx_{} terminated: {:?}", id, outcome);
    }

    /// Active transactions with their begin LSNs, for checkpoints:
    /// the recovery point must reach back to the oldest of these so
    /// undo can see every record of an in-flight transaction.
    pub fn active_txns(&self) -> Vec<(TxnId, Lsn)> {
        self.live
            .iter()
            .filter(|(_, ctx)| ctx.state == TxnState::Active)
            .map(|(id, ctx)| (*id, ctx.begin_lsn))
            .collect()
    }

    /// The begin LSN of the oldest live transaction, if any.
    pub fn oldest_active_lsn(&self) -> Lsn {
        self.live
            .values()
            .map(|ctx| ctx.begin_lsn)
            .filter(|lsn| *lsn != NO_LSN)
            .min()
            .unwrap_or(NO_LSN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Cell, Row};

    #[test]
    fn test_state_machine() {
        let mut manager = TransactionManager::new();
        let id = manager.begin(1);
        assert!(manager.ensure_active(id).is_ok());

        manager.set_state(id, TxnState::Committing).unwrap();
        assert_eq!(
            manager.ensure_active(id).unwrap_err().get_kind(),
            ErrorKind::TxnNotActive
        );

        manager.terminate(id, TxnOutcome::Committed);
        assert_eq!(manager.outcome(id), Some(TxnOutcome::Committed));
        assert!(manager.ensure_active(id).is_err());
    }

    #[test]
    fn test_write_set_reversed() {
        let mut manager = TransactionManager::new();
        let id = manager.begin(1);

        for rid in 1..=3u64 {
            manager
                .record_write(
                    id,
                    WriteRecord {
                        change: RowChange::insert(1, rid, Row::new(vec![Cell::Int64(rid as i64)])),
                        lsn: rid,
                    },
                )
                .unwrap();
        }

        let reversed = manager.write_set_reversed(id);
        assert_eq!(reversed.len(), 3);
        assert_eq!(reversed[0].change.rid, 3);
        assert_eq!(manager.write_set_size(id), 3);
    }

    #[test]
    fn test_ids_monotonic() {
        let mut manager = TransactionManager::new();
        let a = manager.begin(1);
        let b = manager.begin(1);
        assert!(b > a);

        manager.adopt(100, 5);
        let c = manager.begin(1);
        assert!(c > 100);
    }
}
