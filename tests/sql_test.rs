mod test_utils;

use granite::{
    plan::ast::{
        AggregateFunc, BinaryOperator, ColumnDef, CreateTableStmt, Expr, InList, JoinKind,
        OrderByItem, Projection, SelectStmt, SetOpClause, SetOpKind, Statement, TableConstraint,
        TableRef,
    },
    storage::{Cell, ReferentialAction, Type},
    ErrorKind, Session,
};

use crate::test_utils::{
    cmp, col, count_star, create_index, create_kv_table, delete_where, eq, fk_constraint,
    insert_kv, insert_values, int_cell, lit, open_db, qcol, run, select_all, select_exprs,
    select_where, slit, table_count, update_where,
};

fn emp_dept(db: &granite::Database, session: &mut Session) {
    // dept(id, name): 3 rows, one of them unreferenced
    run(
        db,
        session,
        Statement::CreateTable(CreateTableStmt {
            name: "dept".to_string(),
            columns: vec![
                ColumnDef::new("id", Type::Int64).not_null(),
                ColumnDef::new("name", Type::String),
            ],
            constraints: vec![TableConstraint::PrimaryKey(vec!["id".to_string()])],
        }),
    );
    run(
        db,
        session,
        insert_values(
            "dept",
            vec![
                vec![Cell::Int64(1), Cell::String("eng".into())],
                vec![Cell::Int64(2), Cell::String("ops".into())],
                vec![Cell::Int64(3), Cell::String("idle".into())],
            ],
        ),
    );

    // emp(id, dept_id): 5 rows, one pointing nowhere (NULL)
    run(
        db,
        session,
        Statement::CreateTable(CreateTableStmt {
            name: "emp".to_string(),
            columns: vec![
                ColumnDef::new("id", Type::Int64).not_null(),
                ColumnDef::new("dept_id", Type::Int64),
            ],
            constraints: vec![TableConstraint::PrimaryKey(vec!["id".to_string()])],
        }),
    );
    run(
        db,
        session,
        insert_values(
            "emp",
            vec![
                vec![Cell::Int64(1), Cell::Int64(1)],
                vec![Cell::Int64(2), Cell::Int64(1)],
                vec![Cell::Int64(3), Cell::Int64(2)],
                vec![Cell::Int64(4), Cell::Int64(2)],
                vec![Cell::Int64(5), Cell::Null],
            ],
        ),
    );
}

fn join_stmt(kind: JoinKind) -> Statement {
    let mut select = SelectStmt::simple(
        vec![Projection::Wildcard],
        vec![TableRef::Join {
            left: Box::new(TableRef::named("emp")),
            right: Box::new(TableRef::named("dept")),
            kind,
            on: Some(eq(qcol("emp", "dept_id"), qcol("dept", "id"))),
        }],
    );
    select.order_by = vec![OrderByItem {
        expr: lit(1),
        descending: false,
    }];
    Statement::Select(Box::new(select))
}

/// Inner join yields exactly the matching rows; left join keeps every
/// left row, null-extending the unmatched ones.
#[test]
fn test_join_semantics() {
    let (db, _dir) = open_db();
    let mut session = Session::new();
    emp_dept(&db, &mut session);

    let inner = run(&db, &mut session, join_stmt(JoinKind::Inner));
    assert_eq!(inner.row_count(), 4);
    for row in &inner.rows {
        assert_eq!(int_cell(row, 1), int_cell(row, 2), "join key must match");
    }

    let left = run(&db, &mut session, join_stmt(JoinKind::Left));
    assert_eq!(left.row_count(), 5);
    let unmatched: Vec<_> = left
        .rows
        .iter()
        .filter(|row| row.get_cell(2).is_null())
        .collect();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(int_cell(unmatched[0], 0), 5);
}

/// ON DELETE CASCADE removes exactly the parent and its children,
/// atomically within the statement's transaction.
#[test]
fn test_fk_cascade_delete() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(
        &db,
        &mut session,
        Statement::CreateTable(CreateTableStmt {
            name: "departments".to_string(),
            columns: vec![ColumnDef::new("id", Type::Int64).not_null()],
            constraints: vec![TableConstraint::PrimaryKey(vec!["id".to_string()])],
        }),
    );
    run(
        &db,
        &mut session,
        Statement::CreateTable(CreateTableStmt {
            name: "employees".to_string(),
            columns: vec![
                ColumnDef::new("id", Type::Int64).not_null(),
                ColumnDef::new("dept_id", Type::Int64),
            ],
            constraints: vec![
                TableConstraint::PrimaryKey(vec!["id".to_string()]),
                fk_constraint(
                    "fk_dept",
                    &["dept_id"],
                    "departments",
                    &["id"],
                    ReferentialAction::Cascade,
                ),
            ],
        }),
    );

    run(
        &db,
        &mut session,
        insert_values(
            "departments",
            vec![vec![Cell::Int64(1)], vec![Cell::Int64(2)]],
        ),
    );
    run(
        &db,
        &mut session,
        insert_values(
            "employees",
            vec![
                vec![Cell::Int64(1), Cell::Int64(1)],
                vec![Cell::Int64(2), Cell::Int64(1)],
                vec![Cell::Int64(3), Cell::Int64(1)],
                vec![Cell::Int64(4), Cell::Int64(2)],
            ],
        ),
    );

    let result = run(
        &db,
        &mut session,
        delete_where("departments", Some(eq(col("id"), lit(1)))),
    );
    assert_eq!(result.rows_affected, Some(1));

    assert_eq!(table_count(&db, &mut session, "departments"), 1);
    assert_eq!(table_count(&db, &mut session, "employees"), 1);
    assert_eq!(search_k_by(&db, &mut session, "employees", "id", 4), 1);
}

fn search_k_by(
    db: &granite::Database,
    session: &mut Session,
    table: &str,
    column: &str,
    value: i64,
) -> usize {
    run(db, session, select_where(table, eq(col(column), lit(value)))).row_count()
}

/// Inserting a child without a parent is a constraint violation.
#[test]
fn test_fk_insert_rejected() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(
        &db,
        &mut session,
        Statement::CreateTable(CreateTableStmt {
            name: "p".to_string(),
            columns: vec![ColumnDef::new("id", Type::Int64).not_null()],
            constraints: vec![TableConstraint::PrimaryKey(vec!["id".to_string()])],
        }),
    );
    run(
        &db,
        &mut session,
        Statement::CreateTable(CreateTableStmt {
            name: "c".to_string(),
            columns: vec![
                ColumnDef::new("id", Type::Int64).not_null(),
                ColumnDef::new("p_id", Type::Int64),
            ],
            constraints: vec![
                TableConstraint::PrimaryKey(vec!["id".to_string()]),
                fk_constraint("fk_p", &["p_id"], "p", &["id"], ReferentialAction::Restrict),
            ],
        }),
    );

    run(&db, &mut session, insert_values("p", vec![vec![Cell::Int64(1)]]));

    let err = db
        .execute(
            &mut session,
            insert_values("c", vec![vec![Cell::Int64(1), Cell::Int64(99)]]),
        )
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);

    // a NULL key skips the check
    run(
        &db,
        &mut session,
        insert_values("c", vec![vec![Cell::Int64(2), Cell::Null]]),
    );

    // RESTRICT blocks deleting a referenced parent
    run(
        &db,
        &mut session,
        insert_values("c", vec![vec![Cell::Int64(3), Cell::Int64(1)]]),
    );
    let err = db
        .execute(&mut session, delete_where("p", Some(eq(col("id"), lit(1)))))
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);
}

/// A point lookup through a created index touches a logarithmic
/// number of pages, not the whole table.
#[test]
fn test_index_point_lookup() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=10_000).map(|k| (k, k % 97)).collect();
    for chunk in pairs.chunks(1000) {
        run(&db, &mut session, insert_kv("t", &chunk.to_vec()));
    }
    run(&db, &mut session, create_index("idx_v", "t", &["v"], false));
    db.analyze(granite::DEFAULT_DB, "t").unwrap();

    // the planner must route k = 42 through the pk index
    let bound = granite::plan::binder::bind_statement(
        &db,
        granite::DEFAULT_DB,
        &select_where("t", eq(col("k"), lit(42))),
    )
    .unwrap();
    let (plan, _) = granite::plan::planner::plan_statement(&db, &bound).unwrap();
    fn scan_of(plan: &granite::plan::PhysicalPlan) -> &granite::plan::PhysicalPlan {
        match plan {
            granite::plan::PhysicalPlan::Project { input, .. }
            | granite::plan::PhysicalPlan::Filter { input, .. } => scan_of(input),
            other => other,
        }
    }
    assert!(
        matches!(
            scan_of(&plan),
            granite::plan::PhysicalPlan::IndexScan { .. }
                | granite::plan::PhysicalPlan::IndexOnlyScan { .. }
        ),
        "point lookup must use the index"
    );

    // and the lookup reads a handful of pages, nowhere near the scan
    let before = db.buffer_pool().get_stats();
    let result = run(&db, &mut session, select_where("t", eq(col("k"), lit(42))));
    let after = db.buffer_pool().get_stats();
    assert_eq!(result.row_count(), 1);
    assert_eq!(int_cell(&result.rows[0], 0), 42);

    let touched = (after.hits + after.misses) - (before.hits + before.misses);
    assert!(
        touched < 64,
        "point lookup touched {} pages, expected O(log n)",
        touched
    );
}

/// `SELECT MIN(k)` over an indexed column reads the index edge, not
/// the table.
#[test]
fn test_min_via_index_edge() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=500).map(|k| (k * 3, k)).collect();
    run(&db, &mut session, insert_kv("t", &pairs));

    let min_stmt = select_exprs(
        "t",
        vec![Expr::Aggregate {
            func: AggregateFunc::Min,
            arg: Some(Box::new(col("k"))),
            distinct: false,
        }],
    );

    let bound =
        granite::plan::binder::bind_statement(&db, granite::DEFAULT_DB, &min_stmt).unwrap();
    let (plan, _) = granite::plan::planner::plan_statement(&db, &bound).unwrap();
    assert!(matches!(
        plan,
        granite::plan::PhysicalPlan::IndexEdge { max: false, .. }
    ));

    let result = run(&db, &mut session, min_stmt);
    assert_eq!(int_cell(&result.rows[0], 0), 3);

    // COUNT(*) short-circuits through the entry counter
    let bound =
        granite::plan::binder::bind_statement(&db, granite::DEFAULT_DB, &count_star("t")).unwrap();
    let (plan, _) = granite::plan::planner::plan_statement(&db, &bound).unwrap();
    assert!(matches!(plan, granite::plan::PhysicalPlan::CountStar { .. }));
}

/// GROUP BY with HAVING over a join of aggregates.
#[test]
fn test_group_by_having() {
    let (db, _dir) = open_db();
    let mut session = Session::new();
    emp_dept(&db, &mut session);

    // SELECT dept_id, COUNT(*) FROM emp GROUP BY dept_id HAVING COUNT(*) >= 2
    let mut select = SelectStmt::simple(
        vec![
            Projection::Expr {
                expr: col("dept_id"),
                alias: None,
            },
            Projection::Expr {
                expr: Expr::Aggregate {
                    func: AggregateFunc::Count,
                    arg: None,
                    distinct: false,
                },
                alias: Some("n".to_string()),
            },
        ],
        vec![TableRef::named("emp")],
    );
    select.group_by = vec![col("dept_id")];
    select.having = Some(cmp(
        BinaryOperator::GtEq,
        Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        },
        lit(2),
    ));
    select.order_by = vec![OrderByItem {
        expr: lit(1),
        descending: false,
    }];

    let result = run(&db, &mut session, Statement::Select(Box::new(select)));
    // NULL group has 1 row, groups 1 and 2 have 2 each
    assert_eq!(result.row_count(), 2);
    assert_eq!(int_cell(&result.rows[0], 0), 1);
    assert_eq!(int_cell(&result.rows[0], 1), 2);
    assert_eq!(int_cell(&result.rows[1], 0), 2);
}

/// SUM/AVG skip NULLs; COUNT(expr) counts non-null values only.
#[test]
fn test_aggregate_null_rules() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(
        &db,
        &mut session,
        insert_values(
            "t",
            vec![
                vec![Cell::Int64(1), Cell::Int64(10)],
                vec![Cell::Int64(2), Cell::Null],
                vec![Cell::Int64(3), Cell::Int64(20)],
            ],
        ),
    );

    let result = run(
        &db,
        &mut session,
        select_exprs(
            "t",
            vec![
                Expr::Aggregate {
                    func: AggregateFunc::Count,
                    arg: None,
                    distinct: false,
                },
                Expr::Aggregate {
                    func: AggregateFunc::Count,
                    arg: Some(Box::new(col("v"))),
                    distinct: false,
                },
                Expr::Aggregate {
                    func: AggregateFunc::Sum,
                    arg: Some(Box::new(col("v"))),
                    distinct: false,
                },
                Expr::Aggregate {
                    func: AggregateFunc::Avg,
                    arg: Some(Box::new(col("v"))),
                    distinct: false,
                },
            ],
        ),
    );

    let row = &result.rows[0];
    assert_eq!(int_cell(row, 0), 3);
    assert_eq!(int_cell(row, 1), 2);
    assert_eq!(int_cell(row, 2), 30);
    assert_eq!(row.get_cell(3), &Cell::Float64(15.0));
}

/// External sort spills to temp files under a tiny memory budget and
/// still yields ordered output with the input multiset intact.
#[test]
fn test_external_sort_spill() {
    let mut config = crate::test_utils::test_config();
    config.operator_memory_budget = 2048;
    let (db, _dir) = crate::test_utils::open_db_with(config);
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let mut pairs: Vec<(i64, i64)> = (1..=2000).map(|k| (k, (k * 7919) % 1000)).collect();
    use rand::prelude::*;
    pairs.shuffle(&mut rand::thread_rng());
    for chunk in pairs.chunks(250) {
        run(&db, &mut session, insert_kv("t", &chunk.to_vec()));
    }

    let mut select = SelectStmt::simple(
        vec![Projection::Wildcard],
        vec![TableRef::named("t")],
    );
    select.order_by = vec![
        OrderByItem {
            expr: col("v"),
            descending: false,
        },
        OrderByItem {
            expr: col("k"),
            descending: false,
        },
    ];
    let result = run(&db, &mut session, Statement::Select(Box::new(select)));
    assert_eq!(result.row_count(), 2000);

    let mut previous = (i64::MIN, i64::MIN);
    let mut key_sum = 0i64;
    for row in &result.rows {
        let pair = (int_cell(row, 1), int_cell(row, 0));
        assert!(pair >= previous, "sorted output out of order");
        previous = pair;
        key_sum += int_cell(row, 0);
    }
    assert_eq!(key_sum, (1..=2000i64).sum::<i64>(), "multiset must be preserved");
}

/// LIMIT 0 yields nothing without reading the table; TopN keeps the
/// right prefix.
#[test]
fn test_limit_and_topn() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=100).map(|k| (k, 1000 - k)).collect();
    run(&db, &mut session, insert_kv("t", &pairs));

    let mut limited = SelectStmt::simple(vec![Projection::Wildcard], vec![TableRef::named("t")]);
    limited.limit = Some(0);
    let before = db.buffer_pool().get_stats();
    let result = run(&db, &mut session, Statement::Select(Box::new(limited)));
    let after = db.buffer_pool().get_stats();
    assert_eq!(result.row_count(), 0);
    assert_eq!(
        before.hits + before.misses,
        after.hits + after.misses,
        "LIMIT 0 must not read any pages"
    );

    let mut topn = SelectStmt::simple(vec![Projection::Wildcard], vec![TableRef::named("t")]);
    topn.order_by = vec![OrderByItem {
        expr: col("v"),
        descending: true,
    }];
    topn.limit = Some(3);
    let result = run(&db, &mut session, Statement::Select(Box::new(topn)));
    assert_eq!(result.row_count(), 3);
    assert_eq!(int_cell(&result.rows[0], 0), 1);
    assert_eq!(int_cell(&result.rows[1], 0), 2);
    assert_eq!(int_cell(&result.rows[2], 0), 3);
}

/// UNION / INTERSECT / EXCEPT with and without ALL.
#[test]
fn test_set_operations() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("x", &[]));
    run(&db, &mut session, create_kv_table("y", &[]));
    run(&db, &mut session, insert_kv("x", &[(1, 1), (2, 2), (3, 3)]));
    run(&db, &mut session, insert_kv("y", &[(2, 2), (3, 3), (4, 4)]));

    let arm = |table: &str| {
        let mut select =
            SelectStmt::simple(vec![Projection::Expr { expr: col("k"), alias: None }], vec![TableRef::named(table)]);
        select
            .order_by
            .clear();
        select
    };

    let set = |op: SetOpKind, all: bool| {
        let mut left = arm("x");
        left.set_op = Some(SetOpClause {
            op,
            all,
            right: Box::new(arm("y")),
        });
        Statement::Select(Box::new(left))
    };

    let mut union: Vec<i64> = run(&db, &mut session, set(SetOpKind::Union, false))
        .rows
        .iter()
        .map(|r| int_cell(r, 0))
        .collect();
    union.sort_unstable();
    assert_eq!(union, vec![1, 2, 3, 4]);

    assert_eq!(run(&db, &mut session, set(SetOpKind::Union, true)).row_count(), 6);

    let mut intersect: Vec<i64> = run(&db, &mut session, set(SetOpKind::Intersect, false))
        .rows
        .iter()
        .map(|r| int_cell(r, 0))
        .collect();
    intersect.sort_unstable();
    assert_eq!(intersect, vec![2, 3]);

    let mut except: Vec<i64> = run(&db, &mut session, set(SetOpKind::Except, false))
        .rows
        .iter()
        .map(|r| int_cell(r, 0))
        .collect();
    except.sort_unstable();
    assert_eq!(except, vec![1]);
}

/// IN (subquery) rewrites to a semi join; NOT IN and scalar
/// subqueries materialize eagerly.
#[test]
fn test_subqueries() {
    let (db, _dir) = open_db();
    let mut session = Session::new();
    emp_dept(&db, &mut session);

    // employees in a department that exists
    let sub = SelectStmt::simple(
        vec![Projection::Expr { expr: col("id"), alias: None }],
        vec![TableRef::named("dept")],
    );
    let stmt = select_where(
        "emp",
        Expr::In {
            expr: Box::new(col("dept_id")),
            list: InList::Subquery(Box::new(sub.clone())),
            negated: false,
        },
    );
    assert_eq!(run(&db, &mut session, stmt).row_count(), 4);

    // scalar subquery in a predicate
    let scalar = SelectStmt {
        projections: vec![Projection::Expr {
            expr: Expr::Aggregate {
                func: AggregateFunc::Max,
                arg: Some(Box::new(col("id"))),
                distinct: false,
            },
            alias: None,
        }],
        ..SelectStmt::simple(vec![], vec![TableRef::named("dept")])
    };
    let stmt = select_where(
        "emp",
        eq(col("dept_id"), Expr::Subquery(Box::new(scalar))),
    );
    // max dept id is 3; nobody is in dept 3
    assert_eq!(run(&db, &mut session, stmt).row_count(), 0);
}

/// BETWEEN, LIKE, CASE and compound predicates evaluate with SQL
/// semantics.
#[test]
fn test_expression_surface() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(
        &db,
        &mut session,
        Statement::CreateTable(CreateTableStmt {
            name: "s".to_string(),
            columns: vec![
                ColumnDef::new("id", Type::Int64).not_null(),
                ColumnDef::new("name", Type::String),
            ],
            constraints: vec![TableConstraint::PrimaryKey(vec!["id".to_string()])],
        }),
    );
    run(
        &db,
        &mut session,
        insert_values(
            "s",
            vec![
                vec![Cell::Int64(1), Cell::String("alpha".into())],
                vec![Cell::Int64(2), Cell::String("beta".into())],
                vec![Cell::Int64(3), Cell::String("alps".into())],
                vec![Cell::Int64(10), Cell::Null],
            ],
        ),
    );

    let result = run(
        &db,
        &mut session,
        select_where(
            "s",
            Expr::Between {
                expr: Box::new(col("id")),
                low: Box::new(lit(2)),
                high: Box::new(lit(9)),
                negated: false,
            },
        ),
    );
    assert_eq!(result.row_count(), 2);

    let result = run(
        &db,
        &mut session,
        select_where(
            "s",
            Expr::Like {
                expr: Box::new(col("name")),
                pattern: Box::new(slit("al%")),
                negated: false,
            },
        ),
    );
    assert_eq!(result.row_count(), 2);

    // CASE folds the name into a category; NULL name lands in the else
    let case = Expr::Case {
        operand: None,
        branches: vec![(
            Expr::IsNull {
                expr: Box::new(col("name")),
                negated: false,
            },
            slit("missing"),
        )],
        else_result: Some(Box::new(slit("present"))),
    };
    let result = run(&db, &mut session, select_exprs("s", vec![case]));
    let missing = result
        .rows
        .iter()
        .filter(|r| r.get_cell(0) == &Cell::String("missing".into()))
        .count();
    assert_eq!(missing, 1);
}

/// The result cache serves a repeated read verbatim and a write to
/// the referenced table invalidates it.
#[test]
fn test_result_cache_invalidation() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 1)]));

    let first = run(&db, &mut session, select_all("t"));
    assert_eq!(first.row_count(), 1);

    // identical statement; served from cache with identical rows
    let cached = run(&db, &mut session, select_all("t"));
    assert_eq!(cached, first);

    run(&db, &mut session, insert_kv("t", &[(2, 2)]));
    let refreshed = run(&db, &mut session, select_all("t"));
    assert_eq!(refreshed.row_count(), 2);
}

/// The cached plan produces results identical to a fresh plan, and
/// DDL retires it.
#[test]
fn test_plan_cache_equivalence() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=50).map(|k| (k, k)).collect();
    run(&db, &mut session, insert_kv("t", &pairs));

    let stmt = select_where("t", cmp(BinaryOperator::Lt, col("k"), lit(10)));
    let fresh = run(&db, &mut session, stmt.clone());
    let replanned = run(&db, &mut session, stmt.clone());
    assert_eq!(fresh, replanned);

    // an index changes the catalog version; the statement still
    // answers identically through a new plan
    run(&db, &mut session, create_index("idx_k2", "t", &["v"], false));
    let after_ddl = run(&db, &mut session, stmt);
    assert_eq!(fresh.rows, after_ddl.rows);
}

/// UPDATE with a predicate changes exactly the matching rows and
/// maintains secondary indexes.
#[test]
fn test_update_with_index_maintenance() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 5), (2, 5), (3, 7)]));
    run(&db, &mut session, create_index("idx_v", "t", &["v"], false));

    let result = run(
        &db,
        &mut session,
        update_where("t", vec![("v", lit(9))], Some(eq(col("v"), lit(5)))),
    );
    assert_eq!(result.rows_affected, Some(2));

    // lookups through the maintained index see the new values
    let via_index = run(&db, &mut session, select_where("t", eq(col("v"), lit(9))));
    assert_eq!(via_index.row_count(), 2);
    let stale = run(&db, &mut session, select_where("t", eq(col("v"), lit(5))));
    assert_eq!(stale.row_count(), 0);
}

/// A CHECK constraint rejects definite violations and lets NULL pass.
#[test]
fn test_check_constraint() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(
        &db,
        &mut session,
        Statement::CreateTable(CreateTableStmt {
            name: "t".to_string(),
            columns: vec![
                ColumnDef::new("k", Type::Int64).not_null(),
                ColumnDef::new("v", Type::Int64),
            ],
            constraints: vec![
                TableConstraint::PrimaryKey(vec!["k".to_string()]),
                TableConstraint::Check {
                    name: "v_positive".to_string(),
                    expr: cmp(BinaryOperator::Gt, col("v"), lit(0)),
                },
            ],
        }),
    );

    run(&db, &mut session, insert_kv("t", &[(1, 5)]));
    // NULL does not violate the check
    run(
        &db,
        &mut session,
        insert_values("t", vec![vec![Cell::Int64(2), Cell::Null]]),
    );

    let err = db
        .execute(&mut session, insert_kv("t", &[(3, -1)]))
        .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ConstraintViolation);
    assert_eq!(table_count(&db, &mut session, "t"), 2);
}

/// Statement timeouts surface as a cancellation at the next operator
/// safe point.
#[test]
fn test_statement_timeout() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    let pairs: Vec<(i64, i64)> = (1..=2000).map(|k| (k, k)).collect();
    for chunk in pairs.chunks(500) {
        run(&db, &mut session, insert_kv("t", &chunk.to_vec()));
    }

    session.statement_timeout_ms = Some(1);
    // a cross join large enough to outlive a 1ms budget
    let stmt = Statement::Select(Box::new(SelectStmt::simple(
        vec![Projection::Wildcard],
        vec![TableRef::Join {
            left: Box::new(TableRef::named("t")),
            right: Box::new(TableRef::Named {
                table: "t".to_string(),
                alias: Some("t2".to_string()),
            }),
            kind: JoinKind::Cross,
            on: None,
        }],
    )));
    let err = db.execute(&mut session, stmt).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Cancelled);

    session.statement_timeout_ms = None;
    assert_eq!(table_count(&db, &mut session, "t"), 2000);
}

/// DISTINCT collapses duplicates in projection output.
#[test]
fn test_distinct() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 7), (2, 7), (3, 8)]));

    let mut select = SelectStmt::simple(
        vec![Projection::Expr { expr: col("v"), alias: None }],
        vec![TableRef::named("t")],
    );
    select.distinct = true;
    let result = run(&db, &mut session, Statement::Select(Box::new(select)));
    assert_eq!(result.row_count(), 2);
}

/// ADD COLUMN reads as its default on old rows; DROP COLUMN rewrites
/// them.
#[test]
fn test_alter_table_columns() {
    let (db, _dir) = open_db();
    let mut session = Session::new();

    run(&db, &mut session, create_kv_table("t", &[]));
    run(&db, &mut session, insert_kv("t", &[(1, 10), (2, 20)]));

    db.add_column(
        granite::DEFAULT_DB,
        "t",
        granite::storage::Column::new("w", Type::Int64).with_default(Cell::Int64(7)),
    )
    .unwrap();

    // old rows surface the default in the new position
    let result = run(&db, &mut session, select_where("t", eq(col("k"), lit(1))));
    assert_eq!(result.rows[0].width(), 3);
    assert_eq!(int_cell(&result.rows[0], 2), 7);

    // new rows carry their own value
    run(
        &db,
        &mut session,
        insert_values(
            "t",
            vec![vec![Cell::Int64(3), Cell::Int64(30), Cell::Int64(99)]],
        ),
    );
    let result = run(&db, &mut session, select_where("t", eq(col("k"), lit(3))));
    assert_eq!(int_cell(&result.rows[0], 2), 99);

    // dropping the middle column shifts the later one into place
    db.drop_column(granite::DEFAULT_DB, "t", "v").unwrap();
    let result = run(&db, &mut session, select_where("t", eq(col("k"), lit(3))));
    assert_eq!(result.rows[0].width(), 2);
    assert_eq!(int_cell(&result.rows[0], 1), 99);
    let result = run(&db, &mut session, select_where("t", eq(col("k"), lit(1))));
    assert_eq!(int_cell(&result.rows[0], 1), 7);

    // the pk column refuses to go
    let err = db.drop_column(granite::DEFAULT_DB, "t", "k").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Semantic);
}
