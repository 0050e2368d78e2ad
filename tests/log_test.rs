mod test_utils;

use granite::{storage::Cell, Session};
use rand::prelude::*;

use crate::test_utils::{
    col, create_kv_table, crash_and_reopen, eq, get_table, insert_kv, lit, open_db, run, search_k,
    table_count,
};

/// Committed work survives a kill between commit and the next
/// checkpoint: recovery replays the log and the table comes back
/// complete and ordered.
#[test]
fn test_crash_consistent_insert() {
    let (db, dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));

    let mut keys: Vec<i64> = (1..=10_000).collect();
    keys.shuffle(&mut rand::thread_rng());

    let tx_session = &mut session;
    run(&db, tx_session, granite::plan::ast::Statement::Begin);
    for chunk in keys.chunks(500) {
        let pairs: Vec<(i64, i64)> = chunk.iter().map(|k| (*k, k * 3)).collect();
        run(&db, tx_session, insert_kv("t", &pairs));
    }
    run(&db, tx_session, granite::plan::ast::Statement::Commit);

    // kill the process between commit and the next checkpoint
    let db = crash_and_reopen(db, &dir);
    let mut session = Session::new();

    assert_eq!(table_count(&db, &mut session, "t"), 10_000);

    let table = get_table(&db, "t");
    table.clustering.check_integrity(&db);

    // keys come back in order through the pk index
    let pk = table.primary_key_index().unwrap();
    let mut cursor = granite::btree::TreeCursor::full(
        pk.tree.clone(),
        db.arc(),
        granite::btree::ScanDirection::Forward,
    );
    let mut expected = 1i64;
    while let Some(entry) = cursor.next_row().unwrap() {
        assert_eq!(crate::test_utils::int_cell(&entry, 0), expected);
        expected += 1;
    }
    assert_eq!(expected, 10_001);
}

/// An uncommitted transaction disappears across a crash.
#[test]
fn test_open_transaction_crash() {
    let (db, dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 1), (2, 2)]));

    // a transaction inserts but never commits
    run(&db, &mut session, granite::plan::ast::Statement::Begin);
    run(&db, &mut session, insert_kv("t", &[(10, 10), (11, 11)]));
    assert_eq!(search_k(&db, &mut session, "t", 10), 1);

    let db = crash_and_reopen(db, &dir);
    let mut session = Session::new();

    assert_eq!(search_k(&db, &mut session, "t", 1), 1);
    assert_eq!(search_k(&db, &mut session, "t", 2), 1);
    assert_eq!(search_k(&db, &mut session, "t", 10), 0);
    assert_eq!(search_k(&db, &mut session, "t", 11), 0);
    assert_eq!(table_count(&db, &mut session, "t"), 2);
}

/// Rollback restores pre-images, secondary index entries included,
/// and is idempotent on an already rolled back transaction.
#[test]
fn test_rollback_restores_preimages() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 10), (2, 20)]));

    let tx = db.begin_transaction().unwrap();
    let table = get_table(&db, "t");

    // mutate through the table layer inside the transaction
    let rid = {
        use granite::btree::{ScanDirection, TreeCursor};
        let mut cursor = TreeCursor::full(table.clustering.clone(), db.arc(), ScanDirection::Forward);
        let stored = cursor.next_row().unwrap().unwrap();
        granite::catalog::TableInfo::rid_of_stored(&stored)
    };
    table
        .update_row(
            &db,
            &tx,
            rid,
            &granite::storage::Row::new(vec![Cell::Int64(1), Cell::Int64(999)]),
        )
        .unwrap();
    table.delete_row(&db, &tx, rid + 1).unwrap();

    db.rollback(tx).unwrap();
    // second rollback of the same handle: a no-op
    db.rollback(tx).unwrap();

    let result = run(
        &db,
        &mut session,
        crate::test_utils::select_where("t", eq(col("k"), lit(1))),
    );
    assert_eq!(crate::test_utils::int_cell(&result.rows[0], 1), 10);
    assert_eq!(search_k(&db, &mut session, "t", 2), 1);

    // and the pk index still resolves the restored rows
    assert_eq!(table.primary_key_index().unwrap().tree.entry_count(), 2);
}

/// Repeated commit of the same transaction fails with TxnNotActive.
#[test]
fn test_double_commit_rejected() {
    let (db, _dir) = open_db();
    let tx = db.begin_transaction().unwrap();
    db.commit(tx).unwrap();

    let err = db.commit(tx).unwrap_err();
    assert_eq!(err.get_kind(), granite::ErrorKind::TxnNotActive);

    // rollback of a committed transaction is an error, not a no-op
    let err = db.rollback(tx).unwrap_err();
    assert_eq!(err.get_kind(), granite::ErrorKind::TxnNotActive);
}

/// Interleaved commit and abort land on the right sides of a crash.
#[test]
fn test_commit_abort_interleaved_crash() {
    let (db, dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));

    // T1 commits (1, 2); T2 aborts (3, 4); T3 commits (5, 6)
    run(&db, &mut session, insert_kv("t", &[(1, 1), (2, 2)]));

    run(&db, &mut session, granite::plan::ast::Statement::Begin);
    run(&db, &mut session, insert_kv("t", &[(3, 3), (4, 4)]));
    run(&db, &mut session, granite::plan::ast::Statement::Rollback);

    run(&db, &mut session, insert_kv("t", &[(5, 5), (6, 6)]));

    let db = crash_and_reopen(db, &dir);
    let mut session = Session::new();

    for k in [1, 2, 5, 6] {
        assert_eq!(search_k(&db, &mut session, "t", k), 1, "key {} must survive", k);
    }
    for k in [3, 4] {
        assert_eq!(search_k(&db, &mut session, "t", k), 0, "key {} must be gone", k);
    }
}

/// A crash right after a checkpoint recovers from the checkpoint, not
/// from the beginning of time.
#[test]
fn test_checkpoint_then_crash() {
    let (db, dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 1), (2, 2)]));
    db.checkpoint().unwrap();
    run(&db, &mut session, insert_kv("t", &[(3, 3)]));

    let db = crash_and_reopen(db, &dir);
    let mut session = Session::new();
    assert_eq!(table_count(&db, &mut session, "t"), 3);
}

/// A WAL flush failure surfaces as a storage error and the engine
/// refuses writes afterward.
#[test]
fn test_wal_fault_poisons_engine() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));

    granite::fault::arm(granite::fault::WAL_FLUSH);
    let err = db
        .execute(&mut session, insert_kv("t", &[(1, 1)]))
        .unwrap_err();
    granite::fault::disarm(granite::fault::WAL_FLUSH);
    assert_eq!(err.get_kind(), granite::ErrorKind::Storage);

    let err = db
        .execute(&mut session, insert_kv("t", &[(2, 2)]))
        .unwrap_err();
    assert_eq!(err.get_kind(), granite::ErrorKind::Storage);
    assert!(db.is_read_only());
}
