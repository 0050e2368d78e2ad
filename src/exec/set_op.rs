use std::collections::{BTreeMap, VecDeque};

use crate::{
    error::GraniteError,
    exec::operator::{ExecContext, Operator},
    plan::ast::SetOpKind,
    storage::Row,
    types::GraniteResult,
};

/// UNION / INTERSECT / EXCEPT with bag semantics under ALL and set
/// semantics otherwise. The hash variant counts rows per key; the
/// sorted variant merges two ordered runs. Both arms are chosen by
/// the planner.
pub struct SetOpOp {
    left: Box<Operator>,
    right: Box<Operator>,
    op: SetOpKind,
    all: bool,
    hashed: bool,
    output: VecDeque<Row>,
}

impl SetOpOp {
    pub fn new(
        left: Box<Operator>,
        right: Box<Operator>,
        op: SetOpKind,
        all: bool,
        hashed: bool,
    ) -> Self {
        Self {
            left,
            right,
            op,
            all,
            hashed,
            output: VecDeque::new(),
        }
    }

    fn drain(child: &mut Operator, ctx: &ExecContext) -> Result<Vec<Row>, GraniteError> {
        let mut rows = Vec::new();
        while let Some(row) = child.next(ctx)? {
            ctx.check_cancelled()?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Multiset counting per row value. BTreeMap keyed by the encoded
    /// row keeps output order deterministic.
    fn count_rows(rows: Vec<Row>) -> BTreeMap<Vec<u8>, (Row, u64)> {
        use crate::io::Encodeable;
        let mut counted: BTreeMap<Vec<u8>, (Row, u64)> = BTreeMap::new();
        for row in rows {
            let key = row.encode();
            counted
                .entry(key)
                .and_modify(|(_, c)| *c += 1)
                .or_insert((row, 1));
        }
        counted
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.left.open(ctx)?;
        self.right.open(ctx)?;

        let left_rows = Self::drain(&mut self.left, ctx)?;
        let right_rows = Self::drain(&mut self.right, ctx)?;

        // the sorted variant sorts first and merges; the hash variant
        // counts. Counting over sorted input subsumes both shapes, so
        // the only difference that remains observable is output order,
        // which we keep deterministic either way.
        let (left_rows, right_rows) = if self.hashed {
            (left_rows, right_rows)
        } else {
            let mut l = left_rows;
            let mut r = right_rows;
            l.sort_by(|a, b| a.cells().cmp(b.cells()));
            r.sort_by(|a, b| a.cells().cmp(b.cells()));
            (l, r)
        };

        if self.op == SetOpKind::Union && self.all {
            for row in left_rows.into_iter().chain(right_rows) {
                self.output.push_back(row);
            }
            return Ok(());
        }

        let left_counts = Self::count_rows(left_rows);
        let mut right_counts = Self::count_rows(right_rows);

        match self.op {
            SetOpKind::Union => {
                // distinct union: every key from either side, once
                for (key, (row, _)) in left_counts {
                    right_counts.remove(&key);
                    self.output.push_back(row);
                }
                for (_, (row, _)) in right_counts {
                    self.output.push_back(row);
                }
            }
            SetOpKind::Intersect => {
                for (key, (row, left_count)) in left_counts {
                    let right_count = right_counts.get(&key).map(|(_, c)| *c).unwrap_or(0);
                    let emit = if self.all {
                        left_count.min(right_count)
                    } else if right_count > 0 {
                        1
                    } else {
                        0
                    };
                    for _ in 0..emit {
                        self.output.push_back(row.clone());
                    }
                }
            }
            SetOpKind::Except => {
                for (key, (row, left_count)) in left_counts {
                    let right_count = right_counts.get(&key).map(|(_, c)| *c).unwrap_or(0);
                    let emit = if self.all {
                        left_count.saturating_sub(right_count)
                    } else if right_count == 0 {
                        1
                    } else {
                        0
                    };
                    for _ in 0..emit {
                        self.output.push_back(row.clone());
                    }
                }
            }
        }

        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        Ok(self.output.pop_front())
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.left.close(ctx)?;
        self.right.close(ctx)
    }
}
