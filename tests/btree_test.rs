mod test_utils;

use std::ops::Bound;

use granite::{
    btree::{ScanDirection, TreeCursor},
    storage::{Cell, Row},
    Session,
};
use rand::prelude::*;

use crate::test_utils::{
    create_kv_table, eq, col, get_table, insert_kv, lit, open_db, run, search_k, table_count,
};

/// Insert then search returns the inserted payload; delete then
/// search returns nothing.
#[test]
fn test_insert_search_delete() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 10), (2, 20), (3, 30)]));

    assert_eq!(search_k(&db, &mut session, "t", 2), 1);

    let result = run(
        &db,
        &mut session,
        crate::test_utils::select_where("t", eq(col("k"), lit(2))),
    );
    assert_eq!(result.rows[0], Row::new(vec![Cell::Int64(2), Cell::Int64(20)]));

    run(
        &db,
        &mut session,
        crate::test_utils::delete_where("t", Some(eq(col("k"), lit(2)))),
    );
    assert_eq!(search_k(&db, &mut session, "t", 2), 0);
    assert_eq!(search_k(&db, &mut session, "t", 1), 1);
}

/// A full scan yields exactly the inserted-and-not-deleted keys, in
/// ascending order, across enough rows to force several levels of
/// splits at the test fan-out.
#[test]
fn test_scan_after_random_inserts() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));

    let mut keys: Vec<i64> = (1..=500).collect();
    let mut rng = rand::thread_rng();
    keys.shuffle(&mut rng);

    for chunk in keys.chunks(50) {
        let pairs: Vec<(i64, i64)> = chunk.iter().map(|k| (*k, k * 10)).collect();
        run(&db, &mut session, insert_kv("t", &pairs));
    }

    let table = get_table(&db, "t");
    assert!(table.clustering.height() > 1, "expected splits at order 8");
    table.clustering.check_integrity(&db);

    let result = run(&db, &mut session, crate::test_utils::select_all("t"));
    assert_eq!(result.row_count(), 500);

    // the clustering tree is rid-ordered and rids follow insertion;
    // verify key order through a cursor over the secondary pk index
    let pk = table.primary_key_index().unwrap();
    let mut cursor = TreeCursor::full(pk.tree.clone(), db.arc(), ScanDirection::Forward);
    let mut previous = i64::MIN;
    let mut seen = 0;
    while let Some(entry) = cursor.next_row().unwrap() {
        let k = crate::test_utils::int_cell(&entry, 0);
        assert!(k > previous, "pk index out of order: {} after {}", k, previous);
        previous = k;
        seen += 1;
    }
    assert_eq!(seen, 500);
}

/// Leaf capacity is the fan-out; one more insert triggers the first
/// split and the tree grows upward through a new root.
#[test]
fn test_split_boundary() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let table = get_table(&db, "t");
    let order = table.clustering.get_order();

    let fill: Vec<(i64, i64)> = (1..=order as i64).map(|k| (k, k)).collect();
    run(&db, &mut session, insert_kv("t", &fill));
    assert_eq!(table.clustering.height(), 1, "exactly at capacity: no split yet");

    run(&db, &mut session, insert_kv("t", &[(order as i64 + 1, 0)]));
    assert_eq!(table.clustering.height(), 2, "one more row must split the root");
    table.clustering.check_integrity(&db);
}

/// Deleting below half-full redistributes or merges; the counters and
/// the invariants hold through a full drain.
#[test]
fn test_delete_drains_tree() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=200).map(|k| (k, k)).collect();
    for chunk in pairs.chunks(40) {
        run(&db, &mut session, insert_kv("t", &chunk.to_vec()));
    }

    let table = get_table(&db, "t");
    assert!(table.clustering.height() >= 2);

    // drain in an order that exercises both merge directions
    for k in (1..=200).rev() {
        run(
            &db,
            &mut session,
            crate::test_utils::delete_where("t", Some(eq(col("k"), lit(k)))),
        );
        if k % 37 == 0 {
            table.clustering.check_integrity(&db);
        }
    }

    assert_eq!(table_count(&db, &mut session, "t"), 0);
    assert_eq!(table.clustering.entry_count(), 0);
    assert_eq!(table.clustering.height(), 1, "empty tree collapses to a leaf root");
}

/// An empty range (lo > hi) yields nothing.
#[test]
fn test_empty_range_scan() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 1), (2, 2), (3, 3)]));

    let table = get_table(&db, "t");
    let mut cursor = TreeCursor::new(
        table.clustering.clone(),
        db.arc(),
        Bound::Included(vec![Cell::Int64(10)]),
        Bound::Included(vec![Cell::Int64(5)]),
        ScanDirection::Forward,
    );
    assert!(cursor.next_row().unwrap().is_none());
}

/// Reverse scans walk the leaf chain backward.
#[test]
fn test_reverse_scan() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=50).map(|k| (k, k)).collect();
    run(&db, &mut session, insert_kv("t", &pairs));

    let table = get_table(&db, "t");
    let mut cursor = TreeCursor::full(table.clustering.clone(), db.arc(), ScanDirection::Backward);

    let mut expected = 50i64;
    while let Some(stored) = cursor.next_row().unwrap() {
        // stored layout: [rid, k, v]; rids were assigned in key order
        assert_eq!(crate::test_utils::int_cell(&stored, 1), expected);
        expected -= 1;
    }
    assert_eq!(expected, 0);
}

/// Bulk loading sorted input builds a tree whose scan matches the
/// input and whose shape passes the same integrity checks as one
/// grown by inserts.
#[test]
fn test_bulk_load_matches_inserts() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let table = get_table(&db, "t");

    let tx = db.begin_transaction().unwrap();
    let rows: Vec<Row> = (1..=300u64)
        .map(|rid| {
            Row::new(vec![
                Cell::Int64(rid as i64),
                Cell::Int64(rid as i64),
                Cell::Int64((rid * 7) as i64),
            ])
        })
        .collect();
    table.clustering.bulk_load(&db, &tx, rows, 0).unwrap();
    db.commit(tx).unwrap();
    table.bump_next_rid(301);

    table.clustering.check_integrity(&db);
    assert_eq!(table.clustering.entry_count(), 300);

    let mut cursor = TreeCursor::full(table.clustering.clone(), db.arc(), ScanDirection::Forward);
    let mut expected = 1i64;
    while let Some(stored) = cursor.next_row().unwrap() {
        assert_eq!(crate::test_utils::int_cell(&stored, 0), expected);
        expected += 1;
    }
    assert_eq!(expected, 301);
}

/// Duplicate primary keys are rejected by the unique index tree.
#[test]
fn test_duplicate_key_rejected() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 1)]));

    let err = db
        .execute(&mut session, insert_kv("t", &[(1, 2)]))
        .unwrap_err();
    assert_eq!(err.get_kind(), granite::ErrorKind::ConstraintViolation);

    // the failed statement left nothing behind
    assert_eq!(table_count(&db, &mut session, "t"), 1);
}

/// Data survives a clean shutdown and reopen through the tree files.
#[test]
fn test_persist_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    crate::test_utils::setup();

    {
        let db = granite::Database::open_with_config(dir.path(), crate::test_utils::test_config())
            .unwrap();
        let mut session = Session::new();
        run(&db, &mut session, create_kv_table("t", &[]));
        let pairs: Vec<(i64, i64)> = (1..=100).map(|k| (k, k * 2)).collect();
        run(&db, &mut session, insert_kv("t", &pairs));
        db.shutdown().unwrap();
    }

    let db =
        granite::Database::open_with_config(dir.path(), crate::test_utils::test_config()).unwrap();
    let mut session = Session::new();
    assert_eq!(table_count(&db, &mut session, "t"), 100);
    assert_eq!(search_k(&db, &mut session, "t", 57), 1);

    let table = get_table(&db, "t");
    table.clustering.check_integrity(&db);
}
