//! Statement fingerprints: structural hashes of the normalized tree,
//! stable across process restarts (nothing address-based goes in).
//! The structural variant masks literals down to their type, so
//! statements differing only in constants share a shape; the exact
//! variant keeps literal values and keys the result cache.

use crc32fast::Hasher;

use crate::{
    plan::ast::{
        Expr, InList, InsertSource, OrderByItem, Projection, SelectStmt, Statement, TableRef,
    },
    storage::Cell,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiteralMode {
    /// Literals contribute only a type tag (plan cache shape).
    Masked,
    /// Literals contribute their value (result cache identity).
    Exact,
}

pub fn structural_fingerprint(statement: &Statement, catalog_version: u64) -> u64 {
    fingerprint(statement, catalog_version, LiteralMode::Masked)
}

pub fn exact_fingerprint(statement: &Statement, catalog_version: u64) -> u64 {
    fingerprint(statement, catalog_version, LiteralMode::Exact)
}

fn fingerprint(statement: &Statement, catalog_version: u64, mode: LiteralMode) -> u64 {
    let mut w = Walker {
        hasher: Hasher::new(),
        mode,
    };
    w.bytes(&catalog_version.to_le_bytes());
    w.statement(statement);
    // two passes with different salts widen 32-bit crc into a 64-bit key
    let low = w.hasher.finalize();

    let mut w = Walker {
        hasher: Hasher::new(),
        mode,
    };
    w.bytes(b"salt");
    w.bytes(&catalog_version.to_le_bytes());
    w.statement(statement);
    let high = w.hasher.finalize();

    ((high as u64) << 32) | low as u64
}

struct Walker {
    hasher: Hasher,
    mode: LiteralMode,
}

impl Walker {
    fn bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn tag(&mut self, tag: u8) {
        self.hasher.update(&[tag]);
    }

    fn text(&mut self, text: &str) {
        self.bytes(&(text.len() as u32).to_le_bytes());
        self.bytes(text.as_bytes());
    }

    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Select(select) => {
                self.tag(1);
                self.select(select);
            }
            Statement::Insert(insert) => {
                self.tag(2);
                self.text(&insert.table);
                for column in &insert.columns {
                    self.text(column);
                }
                match &insert.source {
                    InsertSource::Values(rows) => {
                        self.tag(1);
                        for row in rows {
                            for value in row {
                                self.expr(value);
                            }
                            self.tag(0xfe);
                        }
                    }
                    InsertSource::Subquery(select) => {
                        self.tag(2);
                        self.select(select);
                    }
                }
            }
            Statement::Update(update) => {
                self.tag(3);
                self.text(&update.table);
                for (column, value) in &update.assignments {
                    self.text(column);
                    self.expr(value);
                }
                self.optional_expr(&update.where_clause);
            }
            Statement::Delete(delete) => {
                self.tag(4);
                self.text(&delete.table);
                self.optional_expr(&delete.where_clause);
            }
            // DDL and transaction control never hit the caches; a
            // coarse tag is enough
            Statement::CreateTable(stmt) => {
                self.tag(5);
                self.text(&stmt.name);
            }
            Statement::DropTable { name, cascade } => {
                self.tag(6);
                self.text(name);
                self.tag(*cascade as u8);
            }
            Statement::CreateIndex(stmt) => {
                self.tag(7);
                self.text(&stmt.name);
                self.text(&stmt.table);
            }
            Statement::DropIndex { name, table } => {
                self.tag(8);
                self.text(name);
                self.text(table);
            }
            Statement::Begin => self.tag(9),
            Statement::Commit => self.tag(10),
            Statement::Rollback => self.tag(11),
        }
    }

    fn select(&mut self, select: &SelectStmt) {
        self.tag(20);
        for projection in &select.projections {
            match projection {
                Projection::Wildcard => self.tag(1),
                Projection::Expr { expr, alias } => {
                    self.tag(2);
                    self.expr(expr);
                    if let Some(alias) = alias {
                        self.text(alias);
                    }
                }
            }
        }
        self.tag(21);
        for table_ref in &select.from {
            self.table_ref(table_ref);
        }
        self.tag(22);
        self.optional_expr(&select.where_clause);
        for group in &select.group_by {
            self.expr(group);
        }
        self.tag(23);
        self.optional_expr(&select.having);
        for OrderByItem { expr, descending } in &select.order_by {
            self.expr(expr);
            self.tag(*descending as u8);
        }
        self.tag(24);
        // limits are literals too: masked for the plan shape
        match self.mode {
            LiteralMode::Masked => {
                self.tag(select.limit.is_some() as u8);
                self.tag(select.offset.is_some() as u8);
            }
            LiteralMode::Exact => {
                self.bytes(&select.limit.unwrap_or(u64::MAX).to_le_bytes());
                self.bytes(&select.offset.unwrap_or(u64::MAX).to_le_bytes());
            }
        }
        self.tag(select.distinct as u8);
        if let Some(clause) = &select.set_op {
            self.tag(25 + clause.op as u8);
            self.tag(clause.all as u8);
            self.select(&clause.right);
        }
    }

    fn table_ref(&mut self, table_ref: &TableRef) {
        match table_ref {
            TableRef::Named { table, alias } => {
                self.tag(30);
                self.text(table);
                if let Some(alias) = alias {
                    self.text(alias);
                }
            }
            TableRef::Join {
                left,
                right,
                kind,
                on,
            } => {
                self.tag(31);
                self.tag(*kind as u8);
                self.table_ref(left);
                self.table_ref(right);
                self.optional_expr(on);
            }
        }
    }

    fn optional_expr(&mut self, expr: &Option<Expr>) {
        match expr {
            Some(expr) => {
                self.tag(1);
                self.expr(expr);
            }
            None => self.tag(0),
        }
    }

    fn literal(&mut self, cell: &Cell) {
        match self.mode {
            LiteralMode::Masked => {
                // placeholder: only the type shape participates
                self.tag(match cell {
                    Cell::Null => 0,
                    Cell::Bool(_) => 1,
                    Cell::Int64(_) => 2,
                    Cell::Float64(_) => 3,
                    Cell::String(_) => 4,
                });
            }
            LiteralMode::Exact => {
                use crate::io::Encodeable;
                self.bytes(&cell.encode());
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(cell) => {
                self.tag(40);
                self.literal(cell);
            }
            Expr::ColumnRef { table, column } => {
                self.tag(41);
                if let Some(table) = table {
                    self.text(table);
                }
                self.text(column);
            }
            Expr::BoundColumn(i) => {
                self.tag(42);
                self.bytes(&(*i as u32).to_le_bytes());
            }
            Expr::BinaryOp { op, left, right } => {
                self.tag(43);
                self.tag(*op as u8);
                self.expr(left);
                self.expr(right);
            }
            Expr::UnaryOp { op, expr } => {
                self.tag(44);
                self.tag(*op as u8);
                self.expr(expr);
            }
            Expr::FunctionCall { name, args } => {
                self.tag(45);
                self.text(&name.to_ascii_lowercase());
                for arg in args {
                    self.expr(arg);
                }
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                self.tag(46);
                self.tag(*func as u8);
                self.tag(*distinct as u8);
                if let Some(arg) = arg {
                    self.expr(arg);
                }
            }
            Expr::Subquery(select) => {
                self.tag(47);
                self.select(select);
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                self.tag(48);
                self.tag(*negated as u8);
                self.expr(expr);
                match list {
                    InList::Exprs(exprs) => {
                        self.tag(1);
                        for e in exprs {
                            self.expr(e);
                        }
                    }
                    InList::Subquery(select) => {
                        self.tag(2);
                        self.select(select);
                    }
                }
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                self.tag(49);
                self.tag(*negated as u8);
                self.expr(expr);
                self.expr(low);
                self.expr(high);
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                self.tag(50);
                self.tag(*negated as u8);
                self.expr(expr);
                self.expr(pattern);
            }
            Expr::IsNull { expr, negated } => {
                self.tag(51);
                self.tag(*negated as u8);
                self.expr(expr);
            }
            Expr::Case {
                operand,
                branches,
                else_result,
            } => {
                self.tag(52);
                match operand {
                    Some(operand) => {
                        self.tag(1);
                        self.expr(operand);
                    }
                    None => self.tag(0),
                }
                for (when, then) in branches {
                    self.expr(when);
                    self.expr(then);
                }
                match else_result {
                    Some(e) => {
                        self.tag(1);
                        self.expr(e);
                    }
                    None => self.tag(0),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ast::{Projection, SelectStmt, TableRef};

    fn select_with_literal(value: i64) -> Statement {
        let mut select = SelectStmt::simple(
            vec![Projection::Wildcard],
            vec![TableRef::named("t")],
        );
        select.where_clause = Some(Expr::eq(
            Expr::column("k"),
            Expr::literal(Cell::Int64(value)),
        ));
        Statement::Select(Box::new(select))
    }

    #[test]
    fn test_literals_masked_in_structural() {
        let a = structural_fingerprint(&select_with_literal(1), 7);
        let b = structural_fingerprint(&select_with_literal(2), 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_literals_kept_in_exact() {
        let a = exact_fingerprint(&select_with_literal(1), 7);
        let b = exact_fingerprint(&select_with_literal(2), 7);
        assert_ne!(a, b);
    }

    #[test]
    fn test_catalog_version_changes_key() {
        let a = structural_fingerprint(&select_with_literal(1), 7);
        let b = structural_fingerprint(&select_with_literal(1), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stable_across_calls() {
        let a = exact_fingerprint(&select_with_literal(42), 1);
        let b = exact_fingerprint(&select_with_literal(42), 1);
        assert_eq!(a, b);
    }
}
