//! The engine context: every subsystem composed by construction and
//! threaded explicitly into operators and transactions. No module
//! global state; a process can hold several `Database` values side by
//! side.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    buffer::BufferPool,
    catalog::{statistics, Catalog, TableInfo},
    config::DbConfig,
    error::{ErrorKind, GraniteError},
    exec::{self, ExecContext, Operator, QueryResult},
    plan::{
        ast::{Expr, Statement, TableConstraint},
        binder,
        cache::{PlanCache, ResultCache},
        fingerprint,
        logical::BoundStatement,
        planner,
    },
    storage::{Column, Schema},
    transaction::{LockManager, Transaction, TransactionManager, TxnOutcome, TxnState},
    types::{GraniteResult, Pod},
    utils::HandyRwLock,
    wal::{recovery, CheckpointBody, LogManager, RecordKind, TxnId},
};

pub const DEFAULT_DB: &str = "default";

/// Per-connection state: the current database, the open transaction
/// (if any) and session-level overrides.
pub struct Session {
    pub current_db: String,
    txn: Option<Transaction>,
    /// Overrides the engine-wide statement timeout; 0 disables.
    pub statement_timeout_ms: Option<u64>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            current_db: DEFAULT_DB.to_string(),
            txn: None,
            statement_timeout_ms: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn current_txn(&self) -> Option<Transaction> {
        self.txn
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Database {
    dir: PathBuf,
    config: DbConfig,

    buffer_pool: Pod<BufferPool>,
    log_manager: Pod<LogManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: Pod<TransactionManager>,
    catalog: Pod<Catalog>,
    plan_cache: Pod<PlanCache>,
    result_cache: Pod<ResultCache>,

    /// Storage or internal errors poison the engine read-only until
    /// restart.
    read_only: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    background: Mutex<Vec<thread::JoinHandle<()>>>,
    self_ref: RwLock<Weak<Database>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Arc<Database>, GraniteError> {
        Self::open_with_config(dir, DbConfig::from_env())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        dir: P,
        config: DbConfig,
    ) -> Result<Arc<Database>, GraniteError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join("tmp"))?;

        let log_manager: Pod<LogManager> = Arc::new(RwLock::new(LogManager::open(
            &dir.join("wal"),
            &config,
        )?));

        let buffer_pool = Arc::new(RwLock::new(BufferPool::new(
            config.buffer_pool_frames,
            config.buffer_pool_lru_ratio,
            config.page_size,
            Arc::clone(&log_manager),
        )));

        let mut catalog = Catalog::open(&dir, &config)?;
        if !catalog.has_database(DEFAULT_DB) {
            catalog.create_database(DEFAULT_DB)?;
        }

        let database = Arc::new(Database {
            lock_manager: Arc::new(LockManager::new(config.lock_timeout_ms)),
            txn_manager: Arc::new(RwLock::new(TransactionManager::new())),
            plan_cache: Arc::new(RwLock::new(PlanCache::new(config.plan_cache_size))),
            result_cache: Arc::new(RwLock::new(ResultCache::new(config.result_cache_size))),
            catalog: Arc::new(RwLock::new(catalog)),
            buffer_pool,
            log_manager,
            read_only: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(Vec::new()),
            config,
            dir,
            self_ref: RwLock::new(Weak::new()),
        });
        *database.self_ref.wl() = Arc::downgrade(&database);

        let clean = database.log_manager().was_clean_start();
        if clean {
            info!("clean shutdown marker found, skipping recovery");
        } else {
            recovery::recover(&database)?;
        }

        // RIDs must stay ahead of everything on disk, including rows
        // replayed by redo
        database.fix_rid_counters()?;

        database.spawn_background();
        Ok(database)
    }

    fn fix_rid_counters(&self) -> GraniteResult {
        let tables: Vec<Arc<TableInfo>> = {
            let catalog = self.catalog();
            let mut out = Vec::new();
            for db_name in catalog.list_databases() {
                for table_name in catalog.list_tables(&db_name)? {
                    out.push(catalog.get_table(&db_name, &table_name)?);
                }
            }
            out
        };
        for table in tables {
            if let Some(max) = table.max_rid(self)? {
                table.bump_next_rid(max + 1);
            }
        }
        Ok(())
    }

    fn spawn_background(&self) {
        let mut threads = self.background.lock().unwrap();

        // deadlock detector
        let weak = self.self_ref.rl().clone();
        let interval = Duration::from_millis(self.config.deadlock_check_interval_ms.max(10));
        let stop = Arc::clone(&self.shutting_down);
        threads.push(thread::spawn(move || loop {
            thread::sleep(interval);
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let db = match weak.upgrade() {
                Some(db) => db,
                None => return,
            };
            db.run_deadlock_detector();
        }));

        // periodic checkpointer
        let weak = self.self_ref.rl().clone();
        let interval = Duration::from_millis(self.config.checkpoint_interval_ms.max(100));
        let stop = Arc::clone(&self.shutting_down);
        threads.push(thread::spawn(move || loop {
            thread::sleep(interval);
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let db = match weak.upgrade() {
                Some(db) => db,
                None => return,
            };
            if let Err(e) = db.checkpoint() {
                error!("periodic checkpoint failed: {}", e);
            }
        }));
    }

    fn run_deadlock_detector(&self) {
        let txn_manager = Arc::clone(&self.txn_manager);
        let victim = self.lock_manager.detect_deadlock(
            |tx| txn_manager.rl().started_at(tx),
            |tx| txn_manager.rl().write_set_size(tx),
        );
        if let Some(victim) = victim {
            warn!("deadlock detector chose tx_{} as victim", victim);
        }
    }

    // ------------------------------------------------------------------
    // component access
    // ------------------------------------------------------------------

    pub fn arc(&self) -> Arc<Database> {
        self.self_ref
            .rl()
            .upgrade()
            .expect("engine context used after drop")
    }

    pub fn get_config(&self) -> &DbConfig {
        &self.config
    }

    pub fn get_dir(&self) -> &Path {
        &self.dir
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.dir.join("tmp")
    }

    pub fn buffer_pool(&self) -> RwLockReadGuard<'_, BufferPool> {
        self.buffer_pool.rl()
    }

    pub fn mut_buffer_pool(&self) -> RwLockWriteGuard<'_, BufferPool> {
        self.buffer_pool.wl()
    }

    pub fn log_manager(&self) -> RwLockReadGuard<'_, LogManager> {
        self.log_manager.rl()
    }

    pub fn mut_log_manager(&self) -> RwLockWriteGuard<'_, LogManager> {
        self.log_manager.wl()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn txn_manager(&self) -> RwLockReadGuard<'_, TransactionManager> {
        self.txn_manager.rl()
    }

    pub fn mut_txn_manager(&self) -> RwLockWriteGuard<'_, TransactionManager> {
        self.txn_manager.wl()
    }

    pub fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.rl()
    }

    pub fn mut_catalog(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.wl()
    }

    pub fn mut_plan_cache(&self) -> RwLockWriteGuard<'_, PlanCache> {
        self.plan_cache.wl()
    }

    pub fn mut_result_cache(&self) -> RwLockWriteGuard<'_, ResultCache> {
        self.result_cache.wl()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    fn mark_read_only(&self, cause: &GraniteError) {
        error!("marking database read-only after failure: {}", cause);
        self.read_only.store(true, Ordering::Relaxed);
    }

    fn check_writable(&self) -> GraniteResult {
        if self.is_read_only() {
            return Err(GraniteError::storage(
                "database is read-only after an earlier storage failure; restart to recover",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&self) -> Result<Transaction, GraniteError> {
        self.check_writable()?;
        let id = self.mut_txn_manager().begin(0);
        let lsn = self
            .mut_log_manager()
            .append(id, RecordKind::Begin, vec![], false)?;
        self.mut_txn_manager().set_begin_lsn(id, lsn);
        Ok(Transaction::with_id(id))
    }

    /// Commit: append the commit record, force the log to it, flush
    /// the transaction's dirty pages, release every lock.
    pub fn commit(&self, tx: Transaction) -> GraniteResult {
        {
            let mut manager = self.mut_txn_manager();
            manager.ensure_active(tx.get_id())?;
            manager.set_state(tx.get_id(), TxnState::Committing)?;
        }

        let lsn = self
            .mut_log_manager()
            .append(tx.get_id(), RecordKind::Commit, vec![], false)?;
        self.mut_log_manager().flush_to(lsn)?;

        let dirty = self.txn_manager().dirty_pages(tx.get_id());
        self.mut_buffer_pool().flush_pages(&dirty)?;

        // tree headers (root pids, counters) of every touched tree go
        // down with the data pages, through the same logged protocol
        let mut file_ids: Vec<u32> = dirty.iter().map(|pid| pid.file_id).collect();
        file_ids.sort_unstable();
        file_ids.dedup();
        for file_id in file_ids {
            if let Some(tree) = self.catalog().tree_by_file_id(file_id) {
                tree.persist_header(self)?;
            }
        }

        self.lock_manager.release_all(tx.get_id());
        self.mut_txn_manager()
            .terminate(tx.get_id(), TxnOutcome::Committed);
        Ok(())
    }

    /// Rollback: walk the write set backward restoring pre-images
    /// (secondary index entries included), writing compensation
    /// records, then the abort record. A second rollback of the same
    /// transaction is a no-op.
    pub fn rollback(&self, tx: Transaction) -> GraniteResult {
        {
            let manager = self.txn_manager();
            match manager.state(tx.get_id()) {
                Some(TxnState::Active) => {}
                Some(_) => {
                    return Err(GraniteError::new(
                        ErrorKind::TxnNotActive,
                        &format!("tx_{} is mid-termination", tx.get_id()),
                    ))
                }
                None => {
                    return match manager.outcome(tx.get_id()) {
                        // idempotent on an already rolled back handle
                        Some(TxnOutcome::Aborted) => Ok(()),
                        Some(TxnOutcome::Committed) => Err(GraniteError::new(
                            ErrorKind::TxnNotActive,
                            &format!("tx_{} already committed", tx.get_id()),
                        )),
                        None => Err(GraniteError::new(
                            ErrorKind::TxnNotActive,
                            &format!("tx_{} is unknown", tx.get_id()),
                        )),
                    };
                }
            }
        }
        self.mut_txn_manager()
            .set_state(tx.get_id(), TxnState::Aborting)?;

        let records = self.txn_manager().write_set_reversed(tx.get_id());
        for record in records {
            let inverse = record.change.inverse();
            let kind = match (&inverse.before, &inverse.after) {
                (_, None) => RecordKind::Delete,
                (None, Some(_)) => RecordKind::Insert,
                (Some(_), Some(_)) => RecordKind::Update,
            };
            let clr_lsn = self.mut_log_manager().append(
                tx.get_id(),
                kind,
                crate::io::Encodeable::encode(&inverse),
                true,
            )?;

            let table = self
                .catalog()
                .table_by_id(inverse.table_id)
                .ok_or_else(|| {
                    GraniteError::internal(&format!(
                        "table {} vanished during rollback",
                        inverse.table_id
                    ))
                })?;
            table.force_row_state(self, &tx, inverse.rid, inverse.after.as_ref(), clr_lsn)?;
        }

        self.mut_log_manager()
            .append(tx.get_id(), RecordKind::Abort, vec![], false)?;

        self.lock_manager.release_all(tx.get_id());
        self.mut_txn_manager()
            .terminate(tx.get_id(), TxnOutcome::Aborted);
        Ok(())
    }

    // ------------------------------------------------------------------
    // statement execution
    // ------------------------------------------------------------------

    /// The statement entry point. Statements outside BEGIN run as
    /// single-statement transactions that commit on success and roll
    /// back on error.
    pub fn execute(
        &self,
        session: &mut Session,
        statement: Statement,
    ) -> Result<QueryResult, GraniteError> {
        let result = self.execute_inner(session, statement);

        if let Err(e) = &result {
            match e.get_kind() {
                ErrorKind::Storage | ErrorKind::Internal => {
                    self.mark_read_only(e);
                    if let Some(tx) = session.txn.take() {
                        let _ = self.rollback(tx);
                    }
                }
                // conflicts abort the transaction (the victim's locks
                // are already gone); constraint violations abort the
                // enclosing transaction too
                ErrorKind::TxnConflict | ErrorKind::ConstraintViolation => {
                    if let Some(tx) = session.txn.take() {
                        let _ = self.rollback(tx);
                    }
                }
                _ => {}
            }
        }

        result
    }

    fn execute_inner(
        &self,
        session: &mut Session,
        statement: Statement,
    ) -> Result<QueryResult, GraniteError> {
        match statement {
            Statement::Begin => {
                if session.txn.is_some() {
                    return Err(GraniteError::semantic("transaction already open"));
                }
                session.txn = Some(self.begin_transaction()?);
                Ok(QueryResult::empty())
            }
            Statement::Commit => match session.txn.take() {
                Some(tx) => {
                    self.commit(tx)?;
                    Ok(QueryResult::empty())
                }
                None => Err(GraniteError::semantic("no open transaction")),
            },
            Statement::Rollback => {
                if let Some(tx) = session.txn.take() {
                    self.rollback(tx)?;
                }
                Ok(QueryResult::empty())
            }
            Statement::CreateTable(_)
            | Statement::DropTable { .. }
            | Statement::CreateIndex(_)
            | Statement::DropIndex { .. } => {
                if session.txn.is_some() {
                    return Err(GraniteError::semantic(
                        "DDL inside an explicit transaction is not supported",
                    ));
                }
                self.check_writable()?;
                self.execute_ddl(&session.current_db, statement)
            }
            other => self.execute_plannable(session, other),
        }
    }

    /// Materialize scalar subqueries and IN-subqueries the planner
    /// cannot turn into semi joins: each one runs eagerly (within the
    /// same transaction context) and its value replaces the
    /// expression.
    fn resolve_subqueries(
        &self,
        session: &mut Session,
        statement: Statement,
    ) -> Result<Statement, GraniteError> {
        use crate::plan::ast::{InList, InsertSource};
        use crate::storage::Cell;

        let mut resolve_expr = |expr: Expr| -> Result<Expr, GraniteError> {
            match expr {
                Expr::Subquery(sub) => {
                    let result = self
                        .execute_plannable(session, Statement::Select(sub))?;
                    if result.columns.len() != 1 {
                        return Err(GraniteError::semantic(
                            "scalar subquery must yield exactly one column",
                        ));
                    }
                    if result.rows.len() > 1 {
                        return Err(GraniteError::semantic(
                            "scalar subquery yielded more than one row",
                        ));
                    }
                    let value = result
                        .rows
                        .first()
                        .map(|row| row.get_cell(0).clone())
                        .unwrap_or(Cell::Null);
                    Ok(Expr::Literal(value))
                }
                Expr::In {
                    expr,
                    list: InList::Subquery(sub),
                    negated,
                } if negated || !binder::semi_join_eligible(&sub) => {
                    let result = self
                        .execute_plannable(session, Statement::Select(sub))?;
                    if result.columns.len() != 1 {
                        return Err(GraniteError::semantic(
                            "IN subquery must yield exactly one column",
                        ));
                    }
                    let items = result
                        .rows
                        .into_iter()
                        .map(|row| Expr::Literal(row.get_cell(0).clone()))
                        .collect();
                    Ok(Expr::In {
                        expr,
                        list: InList::Exprs(items),
                        negated,
                    })
                }
                other => Ok(other),
            }
        };

        fn resolve_opt<F>(
            clause: Option<Expr>,
            f: &mut F,
        ) -> Result<Option<Expr>, GraniteError>
        where
            F: FnMut(Expr) -> Result<Expr, GraniteError>,
        {
            match clause {
                Some(expr) => Ok(Some(expr.transform_fallible(f)?)),
                None => Ok(None),
            }
        }

        match statement {
            Statement::Select(mut select) => {
                select.where_clause = resolve_opt(select.where_clause, &mut resolve_expr)?;
                select.having = resolve_opt(select.having, &mut resolve_expr)?;
                select.projections = select
                    .projections
                    .into_iter()
                    .map(|projection| match projection {
                        crate::plan::ast::Projection::Expr { expr, alias } => {
                            Ok(crate::plan::ast::Projection::Expr {
                                expr: expr.transform_fallible(&mut resolve_expr)?,
                                alias,
                            })
                        }
                        other => Ok(other),
                    })
                    .collect::<Result<_, GraniteError>>()?;
                Ok(Statement::Select(select))
            }
            Statement::Update(mut update) => {
                update.where_clause = resolve_opt(update.where_clause, &mut resolve_expr)?;
                update.assignments = update
                    .assignments
                    .into_iter()
                    .map(|(column, expr)| {
                        Ok((column, expr.transform_fallible(&mut resolve_expr)?))
                    })
                    .collect::<Result<_, GraniteError>>()?;
                Ok(Statement::Update(update))
            }
            Statement::Delete(mut delete) => {
                delete.where_clause = resolve_opt(delete.where_clause, &mut resolve_expr)?;
                Ok(Statement::Delete(delete))
            }
            Statement::Insert(mut insert) => {
                if let InsertSource::Values(rows) = insert.source {
                    let rows = rows
                        .into_iter()
                        .map(|row| {
                            row.into_iter()
                                .map(|expr| expr.transform_fallible(&mut resolve_expr))
                                .collect::<Result<Vec<_>, GraniteError>>()
                        })
                        .collect::<Result<Vec<_>, GraniteError>>()?;
                    insert.source = InsertSource::Values(rows);
                }
                Ok(Statement::Insert(insert))
            }
            other => Ok(other),
        }
    }

    fn execute_plannable(
        &self,
        session: &mut Session,
        statement: Statement,
    ) -> Result<QueryResult, GraniteError> {
        // subqueries that survive into the plan would have no
        // execution context; resolve them to values first
        let statement = self.resolve_subqueries(session, statement)?;

        let read_only_stmt = statement.is_read_only();
        if !read_only_stmt {
            self.check_writable()?;
        }

        let catalog_version = self.catalog().get_version();
        let exact_fp = fingerprint::exact_fingerprint(&statement, catalog_version);
        let structural_fp = fingerprint::structural_fingerprint(&statement, catalog_version);

        // the result cache serves repeated read-only statements
        // verbatim; any write to a referenced table has retired stale
        // entries already
        if read_only_stmt && session.txn.is_none() {
            if let Some(result) = self.mut_result_cache().get(exact_fp) {
                return Ok(result);
            }
        }

        let bound = binder::bind_statement(self, &session.current_db, &statement)?;
        let tables = referenced_tables(self, &session.current_db, &bound)?;

        // plans are cached per statement shape and literal binding;
        // the catalog version inside the fingerprint retires entries
        // on DDL or statistics refresh
        let plan_key = structural_fp ^ exact_fp.rotate_left(17);
        let plan = match self.mut_plan_cache().get(plan_key) {
            Some((plan, _)) => plan,
            None => {
                let (plan, cost) = planner::plan_statement(self, &bound)?;
                let plan = Arc::new(plan);
                self.mut_plan_cache()
                    .put(plan_key, Arc::clone(&plan), cost, tables.clone());
                plan
            }
        };

        let auto_commit = session.txn.is_none();
        let tx = match session.txn {
            Some(tx) => tx,
            None => self.begin_transaction()?,
        };

        let timeout_ms = session
            .statement_timeout_ms
            .unwrap_or(self.config.statement_timeout_ms);
        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };
        let ctx = ExecContext::new(self.arc(), tx, &session.current_db, deadline);

        let mut operator = Operator::build(&plan);
        let outcome = exec::run_to_completion(&mut operator, &ctx);

        match outcome {
            Ok((rows, rows_affected)) => {
                let result = match &bound {
                    BoundStatement::Select(select) => {
                        let names: Vec<String> =
                            select.projections.iter().map(|(_, n)| n.clone()).collect();
                        let types = binder::output_types(self, select);
                        let columns = names
                            .into_iter()
                            .zip(types)
                            .map(|(name, ctype)| crate::exec::result::ResultColumn { name, ctype })
                            .collect();
                        QueryResult::rows(columns, rows)
                    }
                    _ => QueryResult::affected(rows_affected.unwrap_or(0)),
                };

                if auto_commit {
                    self.commit(tx)?;
                }

                if read_only_stmt {
                    if session.txn.is_none() {
                        self.mut_result_cache()
                            .put(exact_fp, result.clone(), tables);
                    }
                } else {
                    // writes retire cached results over every touched
                    // table
                    let mut cache = self.mut_result_cache();
                    for table in &tables {
                        cache.invalidate_table(*table);
                    }
                }

                Ok(result)
            }
            Err(e) => {
                if auto_commit {
                    let _ = self.rollback(tx);
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn execute_ddl(
        &self,
        db_name: &str,
        statement: Statement,
    ) -> Result<QueryResult, GraniteError> {
        match statement {
            Statement::CreateTable(stmt) => {
                let schema = build_schema(&stmt.columns, &stmt.constraints)?;
                self.mut_catalog()
                    .create_table(self, db_name, &stmt.name, schema)?;
                Ok(QueryResult::empty())
            }
            Statement::DropTable { name, cascade } => {
                let table_id = self.catalog().get_table(db_name, &name)?.id;
                self.mut_catalog().drop_table(db_name, &name, cascade)?;
                self.mut_result_cache().invalidate_table(table_id);
                self.mut_plan_cache().invalidate_table(table_id);
                Ok(QueryResult::empty())
            }
            Statement::CreateIndex(stmt) => {
                let tx = self.begin_transaction()?;
                let result = self.mut_catalog().create_index(
                    self,
                    &tx,
                    db_name,
                    &stmt.table,
                    &stmt.name,
                    &stmt.columns,
                    stmt.unique,
                );
                match result {
                    Ok(()) => {
                        self.commit(tx)?;
                        Ok(QueryResult::empty())
                    }
                    Err(e) => {
                        let _ = self.rollback(tx);
                        Err(e)
                    }
                }
            }
            Statement::DropIndex { name, table } => {
                self.mut_catalog().drop_index(db_name, &table, &name)?;
                Ok(QueryResult::empty())
            }
            _ => Err(GraniteError::internal("non-DDL statement in DDL path")),
        }
    }

    /// ADD COLUMN is metadata-only: rows written before the change
    /// read the declared default (NULL otherwise) in the new position.
    pub fn add_column(&self, db_name: &str, table_name: &str, column: Column) -> GraniteResult {
        if !column.nullable && column.default.is_none() {
            return Err(GraniteError::semantic(&format!(
                "new column {} must be nullable or carry a default",
                column.name
            )));
        }
        let table = self.catalog().get_table(db_name, table_name)?;
        let mut schema = table.get_schema();
        schema.add_column(column)?;
        self.mut_catalog().alter_table(db_name, table_name, schema)?;
        self.mut_result_cache().invalidate_table(table.id);
        Ok(())
    }

    /// DROP COLUMN rewrites every row under one transaction. Columns
    /// referenced by an index or constraint refuse to go.
    pub fn drop_column(&self, db_name: &str, table_name: &str, column: &str) -> GraniteResult {
        let table = self.catalog().get_table(db_name, table_name)?;
        let old_schema = table.get_schema();
        let dropped = old_schema
            .column_index(column)
            .ok_or_else(|| GraniteError::semantic(&format!("unknown column: {}", column)))?;

        for index in table.get_indexes() {
            if index.column_names.iter().any(|c| c == column) {
                return Err(GraniteError::semantic(&format!(
                    "cannot drop column {}: referenced by index {}",
                    column, index.name
                )));
            }
        }
        for fk in &old_schema.foreign_keys {
            if fk.columns.iter().any(|c| c == column) {
                return Err(GraniteError::semantic(&format!(
                    "cannot drop column {}: referenced by foreign key {}",
                    column, fk.name
                )));
            }
        }

        // collect the rewrite under the old layout first
        let tx = self.begin_transaction()?;
        let outcome: GraniteResult = (|| {
            let mut rewrites = Vec::new();
            {
                let mut cursor = table.scan(self, crate::btree::ScanDirection::Forward);
                while let Some(stored) = cursor.next_row()? {
                    let rid = TableInfo::rid_of_stored(&stored);
                    let before = table.user_row(&stored);
                    let mut cells = before.cells().to_vec();
                    cells.remove(dropped);
                    rewrites.push((rid, before, crate::storage::Row::new(cells)));
                }
            }

            let mut schema = old_schema.clone();
            schema.drop_column(column)?;
            self.mut_catalog().alter_table(db_name, table_name, schema)?;

            // index column positions after the dropped one shift left
            for index in table.get_indexes() {
                let new_schema = table.get_schema();
                let columns = new_schema.resolve_columns(&index.column_names)?;
                if columns != index.columns {
                    table.remove_index(&index.name);
                    table.add_index(Arc::new(crate::catalog::IndexInfo {
                        id: index.id,
                        name: index.name.clone(),
                        column_names: index.column_names.clone(),
                        columns,
                        unique: index.unique,
                        tree: Arc::clone(&index.tree),
                    }));
                }
            }

            // indexed values are untouched by a layout rewrite, so
            // the stored images are replaced without index churn
            for (rid, before, after) in rewrites {
                table.rewrite_row(self, &tx, rid, &before, &after)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                self.commit(tx)?;
                self.mut_result_cache().invalidate_table(table.id);
                self.mut_plan_cache().invalidate_table(table.id);
                Ok(())
            }
            Err(e) => {
                let _ = self.rollback(tx);
                Err(e)
            }
        }
    }

    /// Refresh a table's statistics and retire dependent cached plans.
    pub fn analyze(&self, db_name: &str, table_name: &str) -> GraniteResult {
        let table = self.catalog().get_table(db_name, table_name)?;
        statistics::analyze_table(self, &table)?;
        self.mut_catalog().record_statistics(db_name)?;
        self.mut_plan_cache().invalidate_table(table.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // checkpoint & shutdown
    // ------------------------------------------------------------------

    /// Flush dirty pages, persist tree headers and the catalog, write
    /// a checkpoint record and drop WAL segments below the recovery
    /// point.
    pub fn checkpoint(&self) -> GraniteResult {
        self.mut_buffer_pool().flush_all()?;

        // tree headers carry root pids and counters; make them durable
        let catalog = self.catalog();
        for db_name in catalog.list_databases() {
            for table_name in catalog.list_tables(&db_name)? {
                let table = catalog.get_table(&db_name, &table_name)?;
                table.clustering.persist(self)?;
                for index in table.get_indexes() {
                    index.tree.persist(self)?;
                }
            }
            catalog.persist_database(&db_name)?;
        }
        drop(catalog);

        let body = CheckpointBody {
            active_txns: self.txn_manager().active_txns(),
            oldest_dirty_lsn: self.buffer_pool().oldest_dirty_lsn(),
        };
        let lsn = self.mut_log_manager().log_checkpoint(body.clone())?;

        let truncate_to = body.recovery_lsn(lsn);
        self.mut_log_manager().truncate(truncate_to)?;
        Ok(())
    }

    /// Flush everything and leave a clean-shutdown marker; the next
    /// open skips recovery.
    pub fn shutdown(&self) -> GraniteResult {
        self.shutting_down.store(true, Ordering::Relaxed);
        for handle in self.background.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        // abandoned transactions roll back like a crash would
        let live: Vec<TxnId> = self
            .txn_manager()
            .active_txns()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        for id in live {
            let _ = self.rollback(Transaction::with_id(id));
        }

        self.checkpoint()?;
        self.mut_buffer_pool().flush_all()?;
        self.mut_log_manager().write_clean_marker()?;
        info!("database shut down cleanly");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

/// Tables a statement touches, direct targets plus the transitive FK
/// dependents a cascade can reach, for cache invalidation.
fn referenced_tables(
    db: &Database,
    db_name: &str,
    bound: &BoundStatement,
) -> Result<Vec<u32>, GraniteError> {
    let mut out: HashSet<u32> = HashSet::new();

    fn add_select(select: &crate::plan::logical::BoundSelect, out: &mut HashSet<u32>) {
        for relation in &select.relations {
            out.insert(relation.table.id);
        }
        if let Some((_, _, right)) = &select.set_op {
            add_select(right, out);
        }
    }

    match bound {
        BoundStatement::Select(select) => add_select(select, &mut out),
        BoundStatement::Insert { table, source, .. } => {
            out.insert(table.id);
            if let crate::plan::logical::BoundInsertSource::Subquery(select) = source {
                add_select(select, &mut out);
            }
        }
        BoundStatement::Update { table, .. } | BoundStatement::Delete { table, .. } => {
            out.insert(table.id);
            // cascades may touch dependents transitively
            let catalog = db.catalog();
            let mut frontier = vec![table.name.clone()];
            let mut seen = HashSet::new();
            while let Some(name) = frontier.pop() {
                if !seen.insert(name.clone()) {
                    continue;
                }
                for (child, _) in catalog.dependents_of(db_name, &name)? {
                    out.insert(child.id);
                    frontier.push(child.name.clone());
                }
            }
        }
    }

    Ok(out.into_iter().collect())
}

/// Assemble a `Schema` out of DDL column definitions and constraints.
/// CHECK expressions are bound to the table's own layout here, once.
fn build_schema(
    columns: &[crate::plan::ast::ColumnDef],
    constraints: &[TableConstraint],
) -> Result<Schema, GraniteError> {
    let mut schema_columns = Vec::with_capacity(columns.len());
    for def in columns {
        let mut column = Column::new(&def.name, def.ctype);
        column.nullable = def.nullable;
        column.default = def.default.clone();
        schema_columns.push(column);
    }
    let mut schema = Schema::new(schema_columns);

    for constraint in constraints {
        match constraint {
            TableConstraint::PrimaryKey(columns) => {
                if !schema.primary_key.is_empty() {
                    return Err(GraniteError::semantic("multiple primary keys declared"));
                }
                schema.primary_key = columns.clone();
            }
            TableConstraint::Unique { name, columns } => {
                schema.uniques.push((name.clone(), columns.clone()));
            }
            TableConstraint::ForeignKey {
                name,
                columns,
                parent_table,
                parent_columns,
                on_delete,
                on_update,
            } => {
                schema.foreign_keys.push(crate::storage::ForeignKey {
                    name: name.clone(),
                    columns: columns.clone(),
                    parent_table: parent_table.clone(),
                    parent_columns: parent_columns.clone(),
                    on_delete: *on_delete,
                    on_update: *on_update,
                });
            }
            TableConstraint::Check { name, expr } => {
                let bound = bind_check(&schema, expr.clone())?;
                schema.checks.push((name.clone(), bound));
            }
        }
    }

    Ok(schema)
}

/// Resolve a CHECK expression's column references against the table
/// being defined. Anything that stays unresolved is an unknown column.
fn bind_check(schema: &Schema, expr: Expr) -> Result<Expr, GraniteError> {
    let bound = expr.transform(&|e| match e {
        Expr::ColumnRef { column, .. } => match schema.column_index(&column) {
            Some(i) => Expr::BoundColumn(i),
            None => Expr::ColumnRef {
                table: None,
                column,
            },
        },
        other => other,
    });

    fn find_unresolved(expr: &Expr) -> Option<String> {
        match expr {
            Expr::ColumnRef { column, .. } => Some(column.clone()),
            Expr::BinaryOp { left, right, .. } => {
                find_unresolved(left).or_else(|| find_unresolved(right))
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => find_unresolved(expr),
            Expr::Between {
                expr, low, high, ..
            } => find_unresolved(expr)
                .or_else(|| find_unresolved(low))
                .or_else(|| find_unresolved(high)),
            _ => None,
        }
    }

    match find_unresolved(&bound) {
        Some(column) => Err(GraniteError::semantic(&format!(
            "unknown column in CHECK constraint: {}",
            column
        ))),
        None => Ok(bound),
    }
}
