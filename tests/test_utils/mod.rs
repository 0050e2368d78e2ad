use std::sync::Arc;

use granite::{
    catalog::TableInfo,
    plan::ast::{
        BinaryOperator, ColumnDef, CreateIndexStmt, CreateTableStmt, DeleteStmt, Expr,
        InsertSource, InsertStmt, Projection, SelectStmt, Statement, TableConstraint, TableRef,
        UpdateStmt,
    },
    storage::{Cell, ReferentialAction, Row, Type},
    utils, Database, DbConfig, FsyncMode, QueryResult, Session, DEFAULT_DB,
};
use tempfile::TempDir;

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    utils::init_log();
    granite::fault::clear();
}

/// A config sized for tests: small trees so splits and merges happen
/// with a handful of rows, group fsync so commits are durable without
/// an fsync per record, and a parked checkpoint timer so tests control
/// checkpoints themselves.
pub fn test_config() -> DbConfig {
    let mut config = DbConfig::default();
    config.btree_order = 8;
    config.buffer_pool_frames = 512;
    config.wal_fsync_mode = FsyncMode::Group;
    config.deadlock_check_interval_ms = 50;
    config.lock_timeout_ms = 2_000;
    config.checkpoint_interval_ms = 3_600_000;
    config
}

pub fn open_db() -> (Arc<Database>, TempDir) {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_with_config(dir.path(), test_config()).unwrap();
    (db, dir)
}

pub fn open_db_with(config: DbConfig) -> (Arc<Database>, TempDir) {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_with_config(dir.path(), config).unwrap();
    (db, dir)
}

/// Reopen the directory as if the process had been killed: the first
/// handle is dropped without shutdown, so no clean marker exists and
/// the new instance runs recovery.
pub fn crash_and_reopen(db: Arc<Database>, dir: &TempDir) -> Arc<Database> {
    drop(db);
    Database::open_with_config(dir.path(), test_config()).unwrap()
}

pub fn run(db: &Database, session: &mut Session, statement: Statement) -> QueryResult {
    db.execute(session, statement).unwrap()
}

// ----------------------------------------------------------------------
// statement builders
// ----------------------------------------------------------------------

pub fn lit(v: i64) -> Expr {
    Expr::Literal(Cell::Int64(v))
}

pub fn slit(v: &str) -> Expr {
    Expr::Literal(Cell::String(v.to_string()))
}

pub fn col(name: &str) -> Expr {
    Expr::column(name)
}

pub fn qcol(table: &str, name: &str) -> Expr {
    Expr::qualified(table, name)
}

pub fn eq(left: Expr, right: Expr) -> Expr {
    Expr::eq(left, right)
}

pub fn cmp(op: BinaryOperator, left: Expr, right: Expr) -> Expr {
    Expr::binary(op, left, right)
}

/// CREATE TABLE <name> (k INT64 PRIMARY KEY, v INT64, ...extra)
pub fn create_kv_table(name: &str, extra_columns: &[(&str, Type)]) -> Statement {
    let mut columns = vec![
        ColumnDef::new("k", Type::Int64).not_null(),
        ColumnDef::new("v", Type::Int64),
    ];
    for (column, ctype) in extra_columns {
        columns.push(ColumnDef::new(column, *ctype));
    }
    Statement::CreateTable(CreateTableStmt {
        name: name.to_string(),
        columns,
        constraints: vec![TableConstraint::PrimaryKey(vec!["k".to_string()])],
    })
}

pub fn create_index(name: &str, table: &str, columns: &[&str], unique: bool) -> Statement {
    Statement::CreateIndex(CreateIndexStmt {
        name: name.to_string(),
        table: table.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        unique,
    })
}

pub fn insert_values(table: &str, rows: Vec<Vec<Cell>>) -> Statement {
    Statement::Insert(InsertStmt {
        table: table.to_string(),
        columns: Vec::new(),
        source: InsertSource::Values(
            rows.into_iter()
                .map(|row| row.into_iter().map(Expr::Literal).collect())
                .collect(),
        ),
    })
}

/// INSERT INTO <table> VALUES (k, v) pairs.
pub fn insert_kv(table: &str, pairs: &[(i64, i64)]) -> Statement {
    insert_values(
        table,
        pairs
            .iter()
            .map(|(k, v)| vec![Cell::Int64(*k), Cell::Int64(*v)])
            .collect(),
    )
}

pub fn select_all(table: &str) -> Statement {
    Statement::Select(Box::new(SelectStmt::simple(
        vec![Projection::Wildcard],
        vec![TableRef::named(table)],
    )))
}

pub fn select_where(table: &str, predicate: Expr) -> Statement {
    let mut select = SelectStmt::simple(vec![Projection::Wildcard], vec![TableRef::named(table)]);
    select.where_clause = Some(predicate);
    Statement::Select(Box::new(select))
}

pub fn select_exprs(table: &str, exprs: Vec<Expr>) -> Statement {
    Statement::Select(Box::new(SelectStmt::simple(
        exprs
            .into_iter()
            .map(|expr| Projection::Expr { expr, alias: None })
            .collect(),
        vec![TableRef::named(table)],
    )))
}

pub fn count_star(table: &str) -> Statement {
    select_exprs(
        table,
        vec![Expr::Aggregate {
            func: granite::plan::ast::AggregateFunc::Count,
            arg: None,
            distinct: false,
        }],
    )
}

pub fn update_where(table: &str, assignments: Vec<(&str, Expr)>, predicate: Option<Expr>) -> Statement {
    Statement::Update(UpdateStmt {
        table: table.to_string(),
        assignments: assignments
            .into_iter()
            .map(|(column, expr)| (column.to_string(), expr))
            .collect(),
        where_clause: predicate,
    })
}

pub fn delete_where(table: &str, predicate: Option<Expr>) -> Statement {
    Statement::Delete(DeleteStmt {
        table: table.to_string(),
        where_clause: predicate,
    })
}

pub fn fk_constraint(
    name: &str,
    columns: &[&str],
    parent: &str,
    parent_columns: &[&str],
    on_delete: ReferentialAction,
) -> TableConstraint {
    TableConstraint::ForeignKey {
        name: name.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        parent_table: parent.to_string(),
        parent_columns: parent_columns.iter().map(|c| c.to_string()).collect(),
        on_delete,
        on_update: ReferentialAction::Restrict,
    }
}

// ----------------------------------------------------------------------
// direct table access
// ----------------------------------------------------------------------

pub fn get_table(db: &Database, name: &str) -> Arc<TableInfo> {
    db.catalog().get_table(DEFAULT_DB, name).unwrap()
}

/// The count reported by `SELECT COUNT(*)`.
pub fn table_count(db: &Database, session: &mut Session, table: &str) -> i64 {
    let result = run(db, session, count_star(table));
    match result.rows[0].get_cell(0) {
        Cell::Int64(v) => *v,
        other => panic!("COUNT(*) yielded {:?}", other),
    }
}

/// Number of rows in the result matching a single int key lookup.
pub fn search_k(db: &Database, session: &mut Session, table: &str, k: i64) -> usize {
    run(db, session, select_where(table, eq(col("k"), lit(k)))).row_count()
}

pub fn int_cell(row: &Row, i: usize) -> i64 {
    match row.get_cell(i) {
        Cell::Int64(v) => *v,
        other => panic!("expected int cell, got {:?}", other),
    }
}
