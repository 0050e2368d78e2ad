//! AST normalization ahead of binding: flatten AND chains, fold away
//! trivially true/false predicates, and canonicalize the WHERE shape
//! so equivalent statements fingerprint identically.

use crate::{
    plan::ast::{BinaryOperator, Expr, SelectStmt, UnaryOperator},
    storage::Cell,
};

pub fn normalize_select(mut select: SelectStmt) -> SelectStmt {
    select.where_clause = select.where_clause.and_then(normalize_predicate);
    select.having = select.having.and_then(normalize_predicate);
    select.set_op = select.set_op.map(|mut clause| {
        clause.right = Box::new(normalize_select(*clause.right));
        clause
    });
    select
}

/// Normalize a boolean expression. Returns None when the predicate is
/// trivially true (no filtering needed).
pub fn normalize_predicate(expr: Expr) -> Option<Expr> {
    match simplify(expr) {
        Expr::Literal(Cell::Bool(true)) => None,
        other => Some(other),
    }
}

/// Split a (possibly nested) AND chain into its conjuncts.
pub fn split_conjuncts(expr: Expr) -> Vec<Expr> {
    let mut out = Vec::new();
    collect_conjuncts(expr, &mut out);
    out
}

fn collect_conjuncts(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            op: BinaryOperator::And,
            left,
            right,
        } => {
            collect_conjuncts(*left, out);
            collect_conjuncts(*right, out);
        }
        Expr::Literal(Cell::Bool(true)) => {}
        other => out.push(other),
    }
}

/// Constant-folds boolean structure: double negation, AND/OR with
/// literal arms.
fn simplify(expr: Expr) -> Expr {
    match expr {
        Expr::BinaryOp {
            op: BinaryOperator::And,
            left,
            right,
        } => {
            let left = simplify(*left);
            let right = simplify(*right);
            match (&left, &right) {
                (Expr::Literal(Cell::Bool(false)), _) | (_, Expr::Literal(Cell::Bool(false))) => {
                    Expr::Literal(Cell::Bool(false))
                }
                (Expr::Literal(Cell::Bool(true)), _) => right,
                (_, Expr::Literal(Cell::Bool(true))) => left,
                _ => Expr::binary(BinaryOperator::And, left, right),
            }
        }
        Expr::BinaryOp {
            op: BinaryOperator::Or,
            left,
            right,
        } => {
            let left = simplify(*left);
            let right = simplify(*right);
            match (&left, &right) {
                (Expr::Literal(Cell::Bool(true)), _) | (_, Expr::Literal(Cell::Bool(true))) => {
                    Expr::Literal(Cell::Bool(true))
                }
                (Expr::Literal(Cell::Bool(false)), _) => right,
                (_, Expr::Literal(Cell::Bool(false))) => left,
                _ => Expr::binary(BinaryOperator::Or, left, right),
            }
        }
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => {
            let inner = simplify(*expr);
            match inner {
                Expr::Literal(Cell::Bool(b)) => Expr::Literal(Cell::Bool(!b)),
                Expr::UnaryOp {
                    op: UnaryOperator::Not,
                    expr,
                } => *expr,
                other => Expr::UnaryOp {
                    op: UnaryOperator::Not,
                    expr: Box::new(other),
                },
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_and_chain() {
        let expr = Expr::and(
            Expr::and(Expr::column("a"), Expr::column("b")),
            Expr::column("c"),
        );
        let conjuncts = split_conjuncts(expr);
        assert_eq!(conjuncts.len(), 3);
    }

    #[test]
    fn test_trivially_true_removed() {
        let expr = Expr::and(
            Expr::Literal(Cell::Bool(true)),
            Expr::Literal(Cell::Bool(true)),
        );
        assert!(normalize_predicate(expr).is_none());
    }

    #[test]
    fn test_false_collapses_and() {
        let expr = Expr::and(Expr::column("a"), Expr::Literal(Cell::Bool(false)));
        assert_eq!(
            normalize_predicate(expr),
            Some(Expr::Literal(Cell::Bool(false)))
        );
    }

    #[test]
    fn test_double_negation() {
        let expr = Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: Box::new(Expr::column("a")),
            }),
        };
        assert_eq!(normalize_predicate(expr), Some(Expr::column("a")));
    }
}
