//! Insert / Update / Delete execution: constraint checks (NOT NULL,
//! CHECK, unique via the index trees, foreign keys) and referential
//! actions, all inside the statement's transaction.

use std::{ops::Bound, sync::Arc};

use crate::{
    btree::{ScanDirection, TreeCursor},
    catalog::{IndexInfo, TableInfo},
    error::GraniteError,
    exec::{
        expr::eval,
        operator::{ExecContext, Operator},
    },
    plan::ast::Expr,
    storage::{Cell, ForeignKey, ReferentialAction, Rid, Row},
    types::GraniteResult,
};

/// Referential cascades deeper than this indicate a cycle in the FK
/// graph that keeps reproducing rows.
const MAX_CASCADE_DEPTH: usize = 32;

/// CHECK constraints reject only definite FALSE; NULL passes.
fn check_constraints(table: &TableInfo, row: &Row) -> GraniteResult {
    for (name, expr) in &table.get_schema().checks {
        if eval(expr, row)? == Cell::Bool(false) {
            return Err(GraniteError::constraint(&format!(
                "row violates check constraint {}",
                name
            )));
        }
    }
    Ok(())
}

/// Child-side FK enforcement: every non-null key must have a parent.
fn check_child_fks(ctx: &ExecContext, table: &TableInfo, row: &Row) -> GraniteResult {
    let schema = table.get_schema();
    for fk in &schema.foreign_keys {
        let columns = schema.resolve_columns(&fk.columns)?;
        let values = row.project(&columns);
        if values.iter().any(|c| c.is_null()) {
            continue;
        }

        let (_parent, index) = {
            let catalog = ctx.db.catalog();
            catalog.parent_index_for(&table.db_name, fk)?
        };

        if index.tree.search(&ctx.db, &values)?.is_none() {
            return Err(GraniteError::constraint(&format!(
                "foreign key {} violated: no parent row {:?} in {}",
                fk.name, values, fk.parent_table
            )));
        }
    }
    Ok(())
}

/// Child rows whose FK columns equal `key_values`, found through an
/// index on the FK columns when one exists.
fn child_rows_matching(
    ctx: &ExecContext,
    child: &TableInfo,
    fk: &ForeignKey,
    key_values: &[Cell],
) -> Result<Vec<(Rid, Row)>, GraniteError> {
    let schema = child.get_schema();
    let columns = schema.resolve_columns(&fk.columns)?;
    let mut out = Vec::new();

    if let Some(index) = child.index_with_prefix(&columns) {
        let mut cursor = TreeCursor::new(
            Arc::clone(&index.tree),
            Arc::clone(&ctx.db),
            Bound::Included(key_values.to_vec()),
            Bound::Included(key_values.to_vec()),
            ScanDirection::Forward,
        );
        while let Some(entry) = cursor.next_row()? {
            let rid = IndexInfo::rid_of(&entry);
            if let Some(row) = child.fetch(&ctx.db, rid)? {
                if row.project(&columns) == key_values {
                    out.push((rid, row));
                }
            }
        }
        return Ok(out);
    }

    let mut cursor = child.scan(&ctx.db, ScanDirection::Forward);
    while let Some(stored) = cursor.next_row()? {
        let rid = TableInfo::rid_of_stored(&stored);
        let row = child.user_row(&stored);
        if row.project(&columns) == key_values {
            out.push((rid, row));
        }
    }
    Ok(out)
}

/// Apply the declared ON DELETE actions for every FK pointing at this
/// row, then delete the row itself.
fn delete_row_cascading(
    ctx: &ExecContext,
    table: &Arc<TableInfo>,
    rid: Rid,
    row: &Row,
    depth: usize,
) -> GraniteResult {
    if depth > MAX_CASCADE_DEPTH {
        return Err(GraniteError::internal(
            "referential cascade exceeded maximum depth (cyclic foreign keys?)",
        ));
    }

    let dependents = {
        let catalog = ctx.db.catalog();
        catalog.dependents_of(&table.db_name, &table.name)?
    };

    for (child, fk) in dependents {
        let parent_schema = table.get_schema();
        let parent_columns = parent_schema.resolve_columns(&fk.parent_columns)?;
        let key_values = row.project(&parent_columns);
        if key_values.iter().any(|c| c.is_null()) {
            continue;
        }

        let matching = child_rows_matching(ctx, &child, &fk, &key_values)?;
        if matching.is_empty() {
            continue;
        }

        match fk.on_delete {
            ReferentialAction::Restrict => {
                return Err(GraniteError::constraint(&format!(
                    "cannot delete from {}: {} row(s) in {} reference it through {}",
                    table.name,
                    matching.len(),
                    child.name,
                    fk.name
                )));
            }
            ReferentialAction::Cascade => {
                for (child_rid, child_row) in matching {
                    ctx.lock_row_exclusive(child.id, child_rid)?;
                    delete_row_cascading(ctx, &child, child_rid, &child_row, depth + 1)?;
                }
            }
            ReferentialAction::SetNull => {
                let child_schema = child.get_schema();
                let columns = child_schema.resolve_columns(&fk.columns)?;
                for (child_rid, child_row) in matching {
                    ctx.lock_row_exclusive(child.id, child_rid)?;
                    let mut updated = child_row.clone();
                    for column in &columns {
                        updated.set_cell(*column, Cell::Null);
                    }
                    child_schema.validate_row(&updated)?;
                    child.update_row(&ctx.db, &ctx.tx, child_rid, &updated)?;
                }
            }
        }
    }

    table.delete_row(&ctx.db, &ctx.tx, rid)?;
    Ok(())
}

/// Apply ON UPDATE actions when a referenced key changes.
fn propagate_key_update(
    ctx: &ExecContext,
    table: &Arc<TableInfo>,
    old_row: &Row,
    new_row: &Row,
) -> GraniteResult {
    let dependents = {
        let catalog = ctx.db.catalog();
        catalog.dependents_of(&table.db_name, &table.name)?
    };

    for (child, fk) in dependents {
        let parent_schema = table.get_schema();
        let parent_columns = parent_schema.resolve_columns(&fk.parent_columns)?;
        let old_key = old_row.project(&parent_columns);
        let new_key = new_row.project(&parent_columns);
        if old_key == new_key || old_key.iter().any(|c| c.is_null()) {
            continue;
        }

        let matching = child_rows_matching(ctx, &child, &fk, &old_key)?;
        if matching.is_empty() {
            continue;
        }

        match fk.on_update {
            ReferentialAction::Restrict => {
                return Err(GraniteError::constraint(&format!(
                    "cannot update key of {}: {} row(s) in {} reference it through {}",
                    table.name,
                    matching.len(),
                    child.name,
                    fk.name
                )));
            }
            ReferentialAction::Cascade => {
                let child_schema = child.get_schema();
                let columns = child_schema.resolve_columns(&fk.columns)?;
                for (child_rid, child_row) in matching {
                    ctx.lock_row_exclusive(child.id, child_rid)?;
                    let mut updated = child_row.clone();
                    for (column, value) in columns.iter().zip(new_key.iter()) {
                        updated.set_cell(*column, value.clone());
                    }
                    child.update_row(&ctx.db, &ctx.tx, child_rid, &updated)?;
                }
            }
            ReferentialAction::SetNull => {
                let child_schema = child.get_schema();
                let columns = child_schema.resolve_columns(&fk.columns)?;
                for (child_rid, child_row) in matching {
                    ctx.lock_row_exclusive(child.id, child_rid)?;
                    let mut updated = child_row.clone();
                    for column in &columns {
                        updated.set_cell(*column, Cell::Null);
                    }
                    child_schema.validate_row(&updated)?;
                    child.update_row(&ctx.db, &ctx.tx, child_rid, &updated)?;
                }
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// operators
// ----------------------------------------------------------------------

pub struct InsertOp {
    table: Arc<TableInfo>,
    columns: Vec<usize>,
    input: Box<Operator>,
    count: u64,
}

impl InsertOp {
    pub fn new(table: Arc<TableInfo>, columns: Vec<usize>, input: Box<Operator>) -> Self {
        Self {
            table,
            columns,
            input,
            count: 0,
        }
    }

    pub fn affected(&self) -> u64 {
        self.count
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.count = 0;
        ctx.lock_table_exclusive_intent(self.table.id)?;
        self.input.open(ctx)?;

        let schema = self.table.get_schema();
        while let Some(source_row) = self.input.next(ctx)? {
            ctx.check_cancelled()?;

            if source_row.width() != self.columns.len() {
                return Err(GraniteError::semantic(&format!(
                    "INSERT source yields {} values for {} target columns",
                    source_row.width(),
                    self.columns.len()
                )));
            }

            // assemble the full row: targeted columns from the source,
            // declared defaults elsewhere
            let mut cells = Vec::with_capacity(schema.width());
            for i in 0..schema.width() {
                match self.columns.iter().position(|c| *c == i) {
                    Some(p) => cells.push(source_row.get_cell(p).clone()),
                    None => cells.push(schema.default_cell(i)),
                }
            }
            let row = Row::new(cells);

            schema.validate_row(&row)?;
            check_constraints(&self.table, &row)?;
            check_child_fks(ctx, &self.table, &row)?;

            // RIDs are monotonic, so insertion order is already the
            // canonical lock order
            let rid = self.table.allocate_rid();
            ctx.lock_row_exclusive(self.table.id, rid)?;
            self.table.insert_row(&ctx.db, &ctx.tx, rid, &row)?;
            self.count += 1;
        }
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        Ok(None)
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.close(ctx)
    }
}

pub struct UpdateOp {
    table: Arc<TableInfo>,
    assignments: Vec<(usize, Expr)>,
    input: Box<Operator>,
    count: u64,
}

impl UpdateOp {
    pub fn new(table: Arc<TableInfo>, assignments: Vec<(usize, Expr)>, input: Box<Operator>) -> Self {
        Self {
            table,
            assignments,
            input,
            count: 0,
        }
    }

    pub fn affected(&self) -> u64 {
        self.count
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.count = 0;
        ctx.lock_table_exclusive_intent(self.table.id)?;
        self.input.open(ctx)?;

        let schema = self.table.get_schema();

        // the input delivers [rid, user columns...]; collect first so
        // the rescan below never observes its own updates
        let mut targets: Vec<(Rid, Row)> = Vec::new();
        while let Some(tagged) = self.input.next(ctx)? {
            ctx.check_cancelled()?;
            let rid = match tagged.get_cell(0) {
                Cell::Int64(v) => *v as Rid,
                other => {
                    return Err(GraniteError::internal(&format!(
                        "DML input without leading rid: {:?}",
                        other
                    )))
                }
            };
            targets.push((rid, Row::new(tagged.cells()[1..].to_vec())));
        }

        for (rid, old_row) in targets {
            ctx.lock_row_exclusive(self.table.id, rid)?;

            let mut new_row = old_row.clone();
            for (column, expr) in &self.assignments {
                new_row.set_cell(*column, eval(expr, &old_row)?);
            }

            schema.validate_row(&new_row)?;
            check_constraints(&self.table, &new_row)?;
            check_child_fks(ctx, &self.table, &new_row)?;
            propagate_key_update(ctx, &self.table, &old_row, &new_row)?;

            self.table.update_row(&ctx.db, &ctx.tx, rid, &new_row)?;
            self.count += 1;
        }
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        Ok(None)
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.close(ctx)
    }
}

pub struct DeleteOp {
    table: Arc<TableInfo>,
    input: Box<Operator>,
    count: u64,
}

impl DeleteOp {
    pub fn new(table: Arc<TableInfo>, input: Box<Operator>) -> Self {
        Self {
            table,
            input,
            count: 0,
        }
    }

    pub fn affected(&self) -> u64 {
        self.count
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.count = 0;
        ctx.lock_table_exclusive_intent(self.table.id)?;
        self.input.open(ctx)?;

        let mut targets: Vec<(Rid, Row)> = Vec::new();
        while let Some(tagged) = self.input.next(ctx)? {
            ctx.check_cancelled()?;
            let rid = match tagged.get_cell(0) {
                Cell::Int64(v) => *v as Rid,
                other => {
                    return Err(GraniteError::internal(&format!(
                        "DML input without leading rid: {:?}",
                        other
                    )))
                }
            };
            targets.push((rid, Row::new(tagged.cells()[1..].to_vec())));
        }

        for (rid, row) in targets {
            ctx.lock_row_exclusive(self.table.id, rid)?;
            delete_row_cascading(ctx, &self.table, rid, &row, 0)?;
            self.count += 1;
        }
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        Ok(None)
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.close(ctx)
    }
}
