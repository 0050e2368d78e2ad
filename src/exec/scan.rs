use std::{ops::Bound, sync::Arc};

use crate::{
    btree::{ScanDirection, TreeCursor},
    catalog::{IndexInfo, TableInfo},
    error::GraniteError,
    exec::{expr::eval_predicate, operator::ExecContext},
    plan::ast::Expr,
    storage::{Cell, Row},
    types::GraniteResult,
};

/// Walks the clustering tree in RID order. Emits user rows; with
/// `with_rid` the RID leads the row for the DML operators above.
pub struct SeqScanOp {
    table: Arc<TableInfo>,
    predicate: Option<Expr>,
    with_rid: bool,
    cursor: Option<TreeCursor>,
}

impl SeqScanOp {
    pub fn new(table: Arc<TableInfo>, predicate: Option<Expr>, with_rid: bool) -> Self {
        Self {
            table,
            predicate,
            with_rid,
            cursor: None,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.table.id)?;
        self.cursor = Some(TreeCursor::full(
            Arc::clone(&self.table.clustering),
            Arc::clone(&ctx.db),
            ScanDirection::Forward,
        ));
        Ok(())
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Err(GraniteError::internal("scan used before open")),
        };

        loop {
            ctx.check_cancelled()?;
            let stored = match cursor.next_row()? {
                Some(stored) => stored,
                None => return Ok(None),
            };
            ctx.note_row();

            let rid = TableInfo::rid_of_stored(&stored);
            let row = self.table.user_row(&stored);

            if let Some(predicate) = &self.predicate {
                if !eval_predicate(predicate, &row)? {
                    continue;
                }
            }

            ctx.lock_row_shared(self.table.id, rid)?;

            if self.with_rid {
                let mut cells = vec![Cell::Int64(rid as i64)];
                cells.extend_from_slice(row.cells());
                return Ok(Some(Row::new(cells)));
            }
            return Ok(Some(row));
        }
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        self.cursor = None;
        Ok(())
    }
}

/// Probes a secondary index range, then fetches each row from the
/// clustering tree by RID.
pub struct IndexScanOp {
    table: Arc<TableInfo>,
    index: Arc<IndexInfo>,
    lo: Bound<Vec<Cell>>,
    hi: Bound<Vec<Cell>>,
    direction: ScanDirection,
    predicate: Option<Expr>,
    with_rid: bool,
    cursor: Option<TreeCursor>,
}

impl IndexScanOp {
    pub fn new(
        table: Arc<TableInfo>,
        index: Arc<IndexInfo>,
        lo: Bound<Vec<Cell>>,
        hi: Bound<Vec<Cell>>,
        direction: ScanDirection,
        predicate: Option<Expr>,
        with_rid: bool,
    ) -> Self {
        Self {
            table,
            index,
            lo,
            hi,
            direction,
            predicate,
            with_rid,
            cursor: None,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.table.id)?;
        self.cursor = Some(TreeCursor::new(
            Arc::clone(&self.index.tree),
            Arc::clone(&ctx.db),
            self.lo.clone(),
            self.hi.clone(),
            self.direction,
        ));
        Ok(())
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Err(GraniteError::internal("scan used before open")),
        };

        loop {
            ctx.check_cancelled()?;
            let entry = match cursor.next_row()? {
                Some(entry) => entry,
                None => return Ok(None),
            };
            ctx.note_row();

            let rid = IndexInfo::rid_of(&entry);
            // the row can be gone when a concurrent delete won the
            // race between index walk and row fetch
            let row = match self.table.fetch(&ctx.db, rid)? {
                Some(row) => row,
                None => continue,
            };

            if let Some(predicate) = &self.predicate {
                if !eval_predicate(predicate, &row)? {
                    continue;
                }
            }

            ctx.lock_row_shared(self.table.id, rid)?;

            if self.with_rid {
                let mut cells = vec![Cell::Int64(rid as i64)];
                cells.extend_from_slice(row.cells());
                return Ok(Some(Row::new(cells)));
            }
            return Ok(Some(row));
        }
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        self.cursor = None;
        Ok(())
    }
}

/// Serves a query entirely from index entries; the uncovered columns
/// come out as NULL and are never referenced by the plan above.
pub struct IndexOnlyScanOp {
    table: Arc<TableInfo>,
    index: Arc<IndexInfo>,
    lo: Bound<Vec<Cell>>,
    hi: Bound<Vec<Cell>>,
    direction: ScanDirection,
    predicate: Option<Expr>,
    cursor: Option<TreeCursor>,
    width: usize,
}

impl IndexOnlyScanOp {
    pub fn new(
        table: Arc<TableInfo>,
        index: Arc<IndexInfo>,
        lo: Bound<Vec<Cell>>,
        hi: Bound<Vec<Cell>>,
        direction: ScanDirection,
        predicate: Option<Expr>,
    ) -> Self {
        let width = table.get_schema().width();
        Self {
            table,
            index,
            lo,
            hi,
            direction,
            predicate,
            cursor: None,
            width,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.table.id)?;
        self.cursor = Some(TreeCursor::new(
            Arc::clone(&self.index.tree),
            Arc::clone(&ctx.db),
            self.lo.clone(),
            self.hi.clone(),
            self.direction,
        ));
        Ok(())
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Err(GraniteError::internal("scan used before open")),
        };

        loop {
            ctx.check_cancelled()?;
            let entry = match cursor.next_row()? {
                Some(entry) => entry,
                None => return Ok(None),
            };
            ctx.note_row();

            let mut cells = vec![Cell::Null; self.width];
            for (position, column) in self.index.columns.iter().enumerate() {
                cells[*column] = entry.get_cell(position).clone();
            }
            let row = Row::new(cells);

            if let Some(predicate) = &self.predicate {
                if !eval_predicate(predicate, &row)? {
                    continue;
                }
            }
            return Ok(Some(row));
        }
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        self.cursor = None;
        Ok(())
    }
}

/// `COUNT(*)` without predicates: one row out of the tree's entry
/// counter, no scan at all.
pub struct CountStarOp {
    table: Arc<TableInfo>,
    emitted: bool,
}

impl CountStarOp {
    pub fn new(table: Arc<TableInfo>) -> Self {
        Self {
            table,
            emitted: false,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.table.id)?;
        self.emitted = false;
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(Row::new(vec![Cell::Int64(
            self.table.row_count() as i64
        )])))
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        Ok(())
    }
}

/// MIN/MAX over an index-ordered column: a single probe at the edge of
/// the index, one leaf entry read.
pub struct IndexEdgeOp {
    table: Arc<TableInfo>,
    index: Arc<IndexInfo>,
    max: bool,
    emitted: bool,
}

impl IndexEdgeOp {
    pub fn new(table: Arc<TableInfo>, index: Arc<IndexInfo>, max: bool) -> Self {
        Self {
            table,
            index,
            max,
            emitted: false,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.table.id)?;
        self.emitted = false;
        Ok(())
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;

        let direction = if self.max {
            ScanDirection::Backward
        } else {
            ScanDirection::Forward
        };
        let mut cursor = TreeCursor::full(
            Arc::clone(&self.index.tree),
            Arc::clone(&ctx.db),
            direction,
        );
        let value = match cursor.next_row()? {
            Some(entry) => entry.get_cell(0).clone(),
            None => Cell::Null,
        };
        Ok(Some(Row::new(vec![value])))
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        Ok(())
    }
}
