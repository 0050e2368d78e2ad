//! Parallel partitioned scans. The clustering tree's RID space is
//! split into contiguous ranges, one worker thread per range; rows
//! flow back through a bounded crossbeam channel, which is the
//! operator's exchange point.

use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crossbeam::channel::{bounded, Receiver};
use log::debug;

use crate::{
    btree::{ScanDirection, TreeCursor},
    catalog::TableInfo,
    error::GraniteError,
    exec::{expr::eval_predicate, operator::ExecContext},
    plan::ast::Expr,
    storage::{Rid, Row},
    types::GraniteResult,
};

const CHANNEL_CAPACITY: usize = 4096;

pub struct ParallelSeqScanOp {
    table: Arc<TableInfo>,
    predicate: Option<Expr>,
    degree: usize,

    receiver: Option<Receiver<Result<Row, GraniteError>>>,
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ParallelSeqScanOp {
    pub fn new(table: Arc<TableInfo>, predicate: Option<Expr>, degree: usize) -> Self {
        Self {
            table,
            predicate,
            degree: degree.max(1),
            receiver: None,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.table.id)?;

        // partition the RID space into contiguous ranges
        let low = 1u64;
        let high = self.table.peek_next_rid();
        let span = high.saturating_sub(low).max(1);
        let degree = self.degree.min(span as usize).max(1);
        let step = span / degree as u64 + 1;

        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        self.stop = Arc::new(AtomicBool::new(false));
        self.receiver = Some(receiver);

        debug!(
            "parallel scan of {} with {} workers over rids [{}, {})",
            self.table.name, degree, low, high
        );

        for worker in 0..degree {
            let from = low + worker as u64 * step;
            let to = (from + step).min(high + 1);

            let table = Arc::clone(&self.table);
            let db = Arc::clone(&ctx.db);
            let predicate = self.predicate.clone();
            let sender = sender.clone();
            let stop = Arc::clone(&self.stop);

            self.workers.push(thread::spawn(move || {
                let mut cursor = TreeCursor::new(
                    Arc::clone(&table.clustering),
                    db,
                    Bound::Included(TableInfo::rid_key(from as Rid)),
                    Bound::Excluded(TableInfo::rid_key(to as Rid)),
                    ScanDirection::Forward,
                );

                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match cursor.next_row() {
                        Ok(Some(stored)) => {
                            let row = table.user_row(&stored);
                            let keep = match &predicate {
                                Some(predicate) => match eval_predicate(predicate, &row) {
                                    Ok(keep) => keep,
                                    Err(e) => {
                                        let _ = sender.send(Err(e));
                                        return;
                                    }
                                },
                                None => true,
                            };
                            if keep && sender.send(Ok(row)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            let _ = sender.send(Err(e));
                            return;
                        }
                    }
                }
            }));
        }

        // the operator keeps only worker clones alive
        drop(sender);
        Ok(())
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        ctx.check_cancelled()?;
        let receiver = match &self.receiver {
            Some(receiver) => receiver,
            None => return Err(GraniteError::internal("scan used before open")),
        };

        match receiver.recv() {
            Ok(Ok(row)) => {
                ctx.note_row();
                Ok(Some(row))
            }
            Ok(Err(e)) => Err(e),
            // all senders dropped: every worker finished
            Err(_) => Ok(None),
        }
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        self.stop.store(true, Ordering::Relaxed);
        self.receiver = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        Ok(())
    }
}
