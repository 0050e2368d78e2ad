use std::{cmp::Ordering, collections::HashSet};

use crate::{
    error::GraniteError,
    exec::{
        expr::{eval, eval_predicate},
        operator::{ExecContext, Operator},
        sort,
    },
    plan::ast::Expr,
    storage::{Cell, Row},
    types::GraniteResult,
};

pub struct FilterOp {
    input: Box<Operator>,
    predicate: Expr,
}

impl FilterOp {
    pub fn new(input: Box<Operator>, predicate: Expr) -> Self {
        Self { input, predicate }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        loop {
            ctx.check_cancelled()?;
            match self.input.next(ctx)? {
                None => return Ok(None),
                Some(row) => {
                    if eval_predicate(&self.predicate, &row)? {
                        return Ok(Some(row));
                    }
                }
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.close(ctx)
    }
}

pub struct ProjectOp {
    input: Box<Operator>,
    exprs: Vec<Expr>,
}

impl ProjectOp {
    pub fn new(input: Box<Operator>, exprs: Vec<Expr>) -> Self {
        Self { input, exprs }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        match self.input.next(ctx)? {
            None => Ok(None),
            Some(row) => {
                let mut cells = Vec::with_capacity(self.exprs.len());
                for expr in &self.exprs {
                    cells.push(eval(expr, &row)?);
                }
                Ok(Some(Row::new(cells)))
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.close(ctx)
    }
}

/// LIMIT/OFFSET. `LIMIT 0` never opens its child, so nothing below is
/// read at all.
pub struct LimitOp {
    input: Box<Operator>,
    limit: Option<u64>,
    offset: u64,
    emitted: u64,
    skipped: u64,
    child_open: bool,
}

impl LimitOp {
    pub fn new(input: Box<Operator>, limit: Option<u64>, offset: u64) -> Self {
        Self {
            input,
            limit,
            offset,
            emitted: 0,
            skipped: 0,
            child_open: false,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.emitted = 0;
        self.skipped = 0;
        if self.limit == Some(0) {
            self.child_open = false;
            return Ok(());
        }
        self.child_open = true;
        self.input.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return Ok(None);
            }
        }
        if !self.child_open {
            return Ok(None);
        }

        while self.skipped < self.offset {
            match self.input.next(ctx)? {
                None => return Ok(None),
                Some(_) => self.skipped += 1,
            }
        }

        match self.input.next(ctx)? {
            None => Ok(None),
            Some(row) => {
                self.emitted += 1;
                Ok(Some(row))
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        if self.child_open {
            self.input.close(ctx)?;
        }
        Ok(())
    }
}

/// ORDER BY + LIMIT as a bounded heap of `limit + offset` rows.
pub struct TopNOp {
    input: Box<Operator>,
    keys: Vec<(usize, bool)>,
    limit: u64,
    offset: u64,
    sorted: Vec<Row>,
    position: usize,
}

impl TopNOp {
    pub fn new(input: Box<Operator>, keys: Vec<(usize, bool)>, limit: u64, offset: u64) -> Self {
        Self {
            input,
            keys,
            limit,
            offset,
            sorted: Vec::new(),
            position: 0,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.sorted.clear();
        self.position = 0;

        let keep = (self.limit + self.offset) as usize;
        if keep == 0 {
            return Ok(());
        }

        self.input.open(ctx)?;

        // a sorted buffer of at most `keep` rows; the tail falls off
        let keys = self.keys.clone();
        let mut buffer: Vec<Row> = Vec::with_capacity(keep + 1);
        while let Some(row) = self.input.next(ctx)? {
            ctx.check_cancelled()?;
            let position = buffer
                .binary_search_by(|candidate| sort::compare_rows(&keys, candidate, &row))
                .unwrap_or_else(|p| p);
            if position >= keep {
                continue;
            }
            buffer.insert(position, row);
            buffer.truncate(keep);
        }

        self.sorted = buffer;
        self.position = self.offset as usize;
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.position >= self.sorted.len() {
            return Ok(None);
        }
        let row = self.sorted[self.position].clone();
        self.position += 1;
        Ok(Some(row))
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.sorted.clear();
        if self.limit + self.offset > 0 {
            self.input.close(ctx)?;
        }
        Ok(())
    }
}

/// Duplicate elimination, hashing by default and falling back to
/// sorted dedup when the hash table would blow the memory budget.
pub struct DistinctOp {
    input: Box<Operator>,
    seen: HashSet<Vec<u8>>,
    seen_bytes: usize,
    /// Sorted fallback state once the budget is gone.
    fallback: Option<Vec<Row>>,
    fallback_pos: usize,
}

impl DistinctOp {
    pub fn new(input: Box<Operator>) -> Self {
        Self {
            input,
            seen: HashSet::new(),
            seen_bytes: 0,
            fallback: None,
            fallback_pos: 0,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.seen.clear();
        self.seen_bytes = 0;
        self.fallback = None;
        self.fallback_pos = 0;
        self.input.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if let Some(rows) = &self.fallback {
            // low-memory path: everything was sorted up front
            while self.fallback_pos < rows.len() {
                let i = self.fallback_pos;
                self.fallback_pos += 1;
                if i == 0 || rows[i] != rows[i - 1] {
                    return Ok(Some(rows[i].clone()));
                }
            }
            return Ok(None);
        }

        let budget = ctx.db.get_config().operator_memory_budget;
        loop {
            ctx.check_cancelled()?;
            let row = match self.input.next(ctx)? {
                None => return Ok(None),
                Some(row) => row,
            };

            use crate::io::Encodeable;
            let key = row.encode();
            if self.seen.contains(&key) {
                continue;
            }

            if self.seen_bytes + key.len() > budget {
                // switch to the sorted fallback: drain the rest, sort
                // everything (already-emitted keys stay deduped by the
                // hash set)
                let mut rows = vec![row.clone()];
                while let Some(pending) = self.input.next(ctx)? {
                    let pending_key = pending.encode();
                    if !self.seen.contains(&pending_key) {
                        rows.push(pending);
                    }
                }
                rows.sort_by(|a, b| compare_whole_rows(a, b));
                self.seen.clear();
                self.seen_bytes = 0;
                self.fallback = Some(rows);
                self.fallback_pos = 0;
                return self.next(ctx);
            }

            self.seen_bytes += key.len();
            self.seen.insert(key);
            return Ok(Some(row));
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.seen.clear();
        self.fallback = None;
        self.input.close(ctx)
    }
}

fn compare_whole_rows(a: &Row, b: &Row) -> Ordering {
    for (x, y) in a.cells().iter().zip(b.cells().iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.width().cmp(&b.width())
}

/// Literal rows (INSERT ... VALUES).
pub struct ValuesOp {
    rows: Vec<Vec<Cell>>,
    position: usize,
}

impl ValuesOp {
    pub fn new(rows: Vec<Vec<Cell>>) -> Self {
        Self { rows, position: 0 }
    }

    pub fn open(&mut self, _ctx: &ExecContext) -> GraniteResult {
        self.position = 0;
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.position >= self.rows.len() {
            return Ok(None);
        }
        let row = Row::new(self.rows[self.position].clone());
        self.position += 1;
        Ok(Some(row))
    }

    pub fn close(&mut self, _ctx: &ExecContext) -> GraniteResult {
        Ok(())
    }
}
