//! Three-phase crash recovery over the WAL.
//!
//! 1. Analysis: scan forward from the last checkpoint, rebuilding the
//!    set of transactions alive at the crash and which ones committed.
//! 2. Redo: reapply every row record in LSN order, compensation
//!    records included, driving each row to the record's after-image.
//!    The row-level records are idempotent, so a page that already
//!    carries a change absorbs its replay without harm.
//! 3. Undo: for each transaction alive at the crash, walk its chain
//!    backward applying inverses and writing compensation records,
//!    then close it with an abort record.
//!
//! The outcome: every committed transaction's effects are present,
//! no uncommitted transaction's effects survive.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::{info, warn};

use crate::{
    database::Database,
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    transaction::{Transaction, TxnOutcome},
    types::GraniteResult,
    wal::{
        record::{CheckpointBody, RecordKind, RowChange},
        Lsn, TxnId, NO_LSN,
    },
};

struct LoserRecord {
    lsn: Lsn,
    change: RowChange,
    compensation: bool,
}

pub fn recover(db: &Arc<Database>) -> GraniteResult {
    let checkpoint_lsn = db.log_manager().last_checkpoint_lsn();

    // ------------------------------------------------------------------
    // phase 1: analysis
    // ------------------------------------------------------------------
    // the checkpoint body anchors how far back the scan must reach:
    // at least to the begin record of every transaction it saw alive
    // and to the oldest possibly-unwritten page change
    let mut analysis_from = 1;
    if checkpoint_lsn != NO_LSN {
        analysis_from = checkpoint_lsn;
        let mut found: Option<Lsn> = None;
        db.log_manager().replay(checkpoint_lsn, &mut |record| {
            if found.is_none() && record.kind == RecordKind::Checkpoint {
                let mut reader = GraniteReader::new(&record.payload);
                if let Ok(body) = CheckpointBody::decode_from(&mut reader) {
                    found = Some(body.recovery_lsn(record.lsn));
                }
            }
            Ok(())
        })?;
        if let Some(from) = found {
            analysis_from = from.max(1);
        }
    }

    let mut committed: HashSet<TxnId> = HashSet::new();
    let mut losers: HashMap<TxnId, Vec<LoserRecord>> = HashMap::new();
    // the full row-record stream, materialized so the logical pass
    // can run without holding the log manager (tree splits during
    // replay append to it)
    let mut row_records: Vec<(Lsn, RowChange)> = Vec::new();
    let redo_from = analysis_from;
    let mut max_txn_id: TxnId = 0;

    {
        let log = db.log_manager();
        log.replay(analysis_from, &mut |record| {
            max_txn_id = max_txn_id.max(record.txn_id);
            match record.kind {
                RecordKind::Begin => {
                    losers.insert(record.txn_id, Vec::new());
                }
                RecordKind::Insert | RecordKind::Update | RecordKind::Delete => {
                    let mut reader = GraniteReader::new(&record.payload);
                    let change = RowChange::decode_from(&mut reader)?;
                    row_records.push((record.lsn, change.clone()));
                    losers
                        .entry(record.txn_id)
                        .or_insert_with(Vec::new)
                        .push(LoserRecord {
                            lsn: record.lsn,
                            change,
                            compensation: record.compensation,
                        });
                }
                RecordKind::Commit => {
                    committed.insert(record.txn_id);
                    losers.remove(&record.txn_id);
                }
                RecordKind::Abort => {
                    losers.remove(&record.txn_id);
                }
                RecordKind::Checkpoint => {
                    let mut reader = GraniteReader::new(&record.payload);
                    if let Ok(body) = CheckpointBody::decode_from(&mut reader) {
                        for (txn, _) in body.active_txns {
                            losers.entry(txn).or_insert_with(Vec::new);
                        }
                    }
                }
                RecordKind::IndexOp | RecordKind::StructuralMod => {
                    // structure rebuilds through the row records
                }
            }
            Ok(())
        })?;
    }

    info!(
        "recovery analysis: {} committed, {} in flight at crash, redo from lsn {}",
        committed.len(),
        losers.len(),
        redo_from
    );

    // a synthetic transaction carries redo work; its id is adopted so
    // page attribution has somewhere to go
    let redo_id = max_txn_id + 1;
    db.mut_txn_manager().adopt(redo_id, NO_LSN);
    let redo_tx = Transaction::with_id(redo_id);

    // ------------------------------------------------------------------
    // phase 2a: physical redo
    // ------------------------------------------------------------------
    // page images were logged right before each page write-back; in
    // LSN order they drive every file to the state of its last logged
    // flush, so a crash mid write-back can never leave a half-written
    // tree behind for the logical pass to trip over
    let page_size = db.get_config().page_size;
    let mut images = 0u64;
    {
        let mut apply = |record: &crate::wal::record::LogRecord| -> GraniteResult {
            if record.kind != RecordKind::StructuralMod {
                return Ok(());
            }
            let mut reader = GraniteReader::new(&record.payload);
            let image = match crate::wal::StructuralPayload::decode_from(&mut reader)? {
                crate::wal::StructuralPayload::Page(image) => image,
                crate::wal::StructuralPayload::Op(_) => return Ok(()),
            };

            let tree = match db.catalog().tree_by_file_id(image.file_id) {
                Some(tree) => tree,
                None => return Ok(()),
            };
            let offset = image.page_index as u64 * page_size as u64;
            let needed = offset + page_size as u64;
            if tree.get_file().get_size()? < needed {
                tree.get_file().set_len(needed)?;
            }
            tree.get_file().write_at(offset, &image.bytes)?;
            if image.page_index == 0 {
                tree.reload_meta(&image.bytes)?;
            }
            images += 1;
            Ok(())
        };

        let log = db.log_manager();
        log.replay(redo_from, &mut apply)?;
    }
    // the pool may hold pages parsed before the physical pass; drop
    // them so the logical pass reads the replayed bytes
    db.mut_buffer_pool().clear();
    info!("recovery replayed {} page images", images);

    // ------------------------------------------------------------------
    // phase 2b: logical redo
    // ------------------------------------------------------------------
    // repeat history: every row record in LSN order, losers and
    // compensation records included (phase 3 settles the losers).
    // Idempotent, so records the physical pass already covered are
    // absorbed without harm.
    let mut redone = 0u64;
    for (lsn, change) in &row_records {
        let table = match db.catalog().table_by_id(change.table_id) {
            Some(table) => table,
            None => {
                // the table was dropped after this record; its
                // effects are gone with it
                continue;
            }
        };

        table.force_row_state(db, &redo_tx, change.rid, change.after.as_ref(), *lsn)?;
        redone += 1;
    }
    info!("recovery redo applied {} row records", redone);

    // ------------------------------------------------------------------
    // phase 3: undo
    // ------------------------------------------------------------------
    let mut loser_ids: Vec<TxnId> = losers.keys().copied().collect();
    loser_ids.sort_unstable();

    for txn_id in loser_ids {
        let records = losers.remove(&txn_id).unwrap_or_default();

        // records already compensated before the crash stay undone: a
        // chain of n forward records with m compensation records means
        // the last m forward changes are already rolled back
        let compensations = records.iter().filter(|r| r.compensation).count();
        let forward: Vec<&LoserRecord> = records.iter().filter(|r| !r.compensation).collect();
        let undo_until = forward.len().saturating_sub(compensations);

        db.mut_txn_manager().adopt(txn_id, NO_LSN);
        let tx = Transaction::with_id(txn_id);

        for record in forward[..undo_until].iter().rev() {
            let inverse = record.change.inverse();
            let kind = match (&inverse.before, &inverse.after) {
                (_, None) => RecordKind::Delete,
                (None, Some(_)) => RecordKind::Insert,
                (Some(_), Some(_)) => RecordKind::Update,
            };
            let clr_lsn =
                db.mut_log_manager()
                    .append(txn_id, kind, inverse.encode(), true)?;

            match db.catalog().table_by_id(inverse.table_id) {
                Some(table) => {
                    table.force_row_state(db, &tx, inverse.rid, inverse.after.as_ref(), clr_lsn)?;
                }
                None => warn!(
                    "undo skipped record at lsn {}: table {} is gone",
                    record.lsn, inverse.table_id
                ),
            }
        }

        db.mut_log_manager()
            .append(txn_id, RecordKind::Abort, vec![], false)?;
        db.lock_manager().release_all(txn_id);
        db.mut_txn_manager().terminate(txn_id, TxnOutcome::Aborted);
        info!("recovery rolled back tx_{}", txn_id);
    }

    db.mut_txn_manager().terminate(redo_id, TxnOutcome::Committed);

    // recovered state goes straight to disk so a crash during normal
    // operation never needs this log prefix again
    db.mut_buffer_pool().flush_all()?;
    let flush_to = db.log_manager().written_lsn();
    db.mut_log_manager().flush_to(flush_to)?;

    info!("recovery complete");
    Ok(())
}
