mod test_utils;

use std::{sync::Arc, thread, time::Duration};

use granite::{
    transaction::{LockId, LockMode},
    ErrorKind, Session,
};

use crate::test_utils::{col, create_kv_table, eq, insert_kv, lit, open_db, run, update_where};

/// Two transactions whose read/write sets are disjoint never block
/// each other.
#[test]
fn test_disjoint_writes_do_not_block() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 0), (2, 0)]));

    let db1 = Arc::clone(&db);
    let db2 = Arc::clone(&db);

    let t1 = thread::spawn(move || {
        let mut session = Session::new();
        run(&db1, &mut session, granite::plan::ast::Statement::Begin);
        run(
            &db1,
            &mut session,
            update_where("t", vec![("v", lit(11))], Some(eq(col("k"), lit(1)))),
        );
        thread::sleep(Duration::from_millis(100));
        run(&db1, &mut session, granite::plan::ast::Statement::Commit);
    });

    let t2 = thread::spawn(move || {
        let mut session = Session::new();
        run(&db2, &mut session, granite::plan::ast::Statement::Begin);
        run(
            &db2,
            &mut session,
            update_where("t", vec![("v", lit(22))], Some(eq(col("k"), lit(2)))),
        );
        thread::sleep(Duration::from_millis(100));
        run(&db2, &mut session, granite::plan::ast::Statement::Commit);
    });

    t1.join().unwrap();
    t2.join().unwrap();

    let mut session = Session::new();
    let r1 = run(
        &db,
        &mut session,
        crate::test_utils::select_where("t", eq(col("k"), lit(1))),
    );
    assert_eq!(crate::test_utils::int_cell(&r1.rows[0], 1), 11);
    let r2 = run(
        &db,
        &mut session,
        crate::test_utils::select_where("t", eq(col("k"), lit(2))),
    );
    assert_eq!(crate::test_utils::int_cell(&r2.rows[0], 1), 22);
}

/// The canonical deadlock: T1 holds A and wants B, T2 holds B and
/// wants A. The younger transaction dies with a conflict error; the
/// older commits, and the final state is the older transaction's
/// effect alone.
#[test]
fn test_deadlock_victim_is_younger() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("a", &[]));
    run(&db, &mut session, create_kv_table("b", &[]));
    run(&db, &mut session, insert_kv("a", &[(1, 0)]));
    run(&db, &mut session, insert_kv("b", &[(1, 0)]));

    // older transaction first
    let t1 = db.begin_transaction().unwrap();
    let t2 = db.begin_transaction().unwrap();
    assert!(t2.get_id() > t1.get_id());

    let a = crate::test_utils::get_table(&db, "a");
    let b = crate::test_utils::get_table(&db, "b");

    // T1 locks a#1, T2 locks b#1
    db.lock_manager()
        .acquire(t1.get_id(), LockId::row(a.id, 1), LockMode::Exclusive)
        .unwrap();
    db.lock_manager()
        .acquire(t2.get_id(), LockId::row(b.id, 1), LockMode::Exclusive)
        .unwrap();

    let db1 = Arc::clone(&db);
    let older = thread::spawn(move || {
        // T1 now wants b#1
        let outcome = db1
            .lock_manager()
            .acquire(t1.get_id(), LockId::row(b.id, 1), LockMode::Exclusive);
        (t1, outcome)
    });

    thread::sleep(Duration::from_millis(50));

    // T2 closes the cycle by asking for a#1
    let younger_outcome =
        db.lock_manager()
            .acquire(t2.get_id(), LockId::row(a.id, 1), LockMode::Exclusive);
    let younger_err = younger_outcome.expect_err("the younger transaction must be the victim");
    assert_eq!(younger_err.get_kind(), ErrorKind::TxnConflict);
    assert!(younger_err.is_retriable());
    db.rollback(t2).unwrap();

    // with the victim gone, the older transaction gets its lock and
    // commits its effect
    let (t1, older_outcome) = older.join().unwrap();
    older_outcome.expect("the older transaction must win the lock");

    let rid = 1;
    let row = a.fetch(&db, rid).unwrap().unwrap();
    let mut updated = row.clone();
    updated.set_cell(1, granite::storage::Cell::Int64(77));
    a.update_row(&db, &t1, rid, &updated).unwrap();
    db.commit(t1).unwrap();

    let mut session = Session::new();
    let result = run(
        &db,
        &mut session,
        crate::test_utils::select_where("a", eq(col("k"), lit(1))),
    );
    assert_eq!(crate::test_utils::int_cell(&result.rows[0], 1), 77);
}

/// Lock waits give up after the configured timeout with a retriable
/// conflict error.
#[test]
fn test_lock_timeout() {
    let mut config = crate::test_utils::test_config();
    config.lock_timeout_ms = 150;
    let (db, _dir) = crate::test_utils::open_db_with(config);
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 0)]));

    let table = crate::test_utils::get_table(&db, "t");

    let holder = db.begin_transaction().unwrap();
    db.lock_manager()
        .acquire(holder.get_id(), LockId::row(table.id, 1), LockMode::Exclusive)
        .unwrap();

    let waiter = db.begin_transaction().unwrap();
    let err = db
        .lock_manager()
        .acquire(waiter.get_id(), LockId::row(table.id, 1), LockMode::Shared)
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::TxnConflict);

    db.rollback(waiter).unwrap();
    db.commit(holder).unwrap();
}

/// Strict two-phase locking: everything releases at commit, so a
/// blocked writer proceeds right after.
#[test]
fn test_locks_release_at_commit() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 0)]));

    let table = crate::test_utils::get_table(&db, "t");

    let first = db.begin_transaction().unwrap();
    db.lock_manager()
        .acquire(first.get_id(), LockId::row(table.id, 1), LockMode::Exclusive)
        .unwrap();
    assert_eq!(db.lock_manager().held_count(first.get_id()), 1);

    let db2 = Arc::clone(&db);
    let blocked = thread::spawn(move || {
        let second = db2.begin_transaction().unwrap();
        db2.lock_manager()
            .acquire(second.get_id(), LockId::row(table.id, 1), LockMode::Exclusive)
            .unwrap();
        db2.commit(second).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    db.commit(first).unwrap();
    assert_eq!(db.lock_manager().held_count(first.get_id()), 0);

    blocked.join().unwrap();
}
