//! Expression evaluation over rows, with SQL ternary NULL semantics:
//! comparisons against NULL are NULL, AND/OR follow Kleene logic, and
//! a filter keeps a row only when its predicate is exactly true.

use std::cmp::Ordering;

use crate::{
    error::GraniteError,
    plan::ast::{BinaryOperator, Expr, InList, UnaryOperator},
    storage::{Cell, Row},
};

pub fn eval(expr: &Expr, row: &Row) -> Result<Cell, GraniteError> {
    match expr {
        Expr::Literal(cell) => Ok(cell.clone()),
        Expr::BoundColumn(i) => {
            if *i >= row.width() {
                return Err(GraniteError::internal(&format!(
                    "bound column {} out of range for row of width {}",
                    i,
                    row.width()
                )));
            }
            Ok(row.get_cell(*i).clone())
        }
        Expr::ColumnRef { column, .. } => Err(GraniteError::internal(&format!(
            "unbound column reference at execution: {}",
            column
        ))),
        Expr::BinaryOp { op, left, right } => {
            let left = eval(left, row)?;
            // short-circuit AND/OR before evaluating the right arm
            match op {
                BinaryOperator::And => {
                    if left == Cell::Bool(false) {
                        return Ok(Cell::Bool(false));
                    }
                    let right = eval(right, row)?;
                    return Ok(kleene_and(&left, &right));
                }
                BinaryOperator::Or => {
                    if left == Cell::Bool(true) {
                        return Ok(Cell::Bool(true));
                    }
                    let right = eval(right, row)?;
                    return Ok(kleene_or(&left, &right));
                }
                _ => {}
            }
            let right = eval(right, row)?;
            eval_binary(*op, &left, &right)
        }
        Expr::UnaryOp { op, expr } => {
            let value = eval(expr, row)?;
            match op {
                UnaryOperator::Not => Ok(match value {
                    Cell::Null => Cell::Null,
                    Cell::Bool(b) => Cell::Bool(!b),
                    other => {
                        return Err(GraniteError::semantic(&format!(
                            "NOT applied to non-boolean {:?}",
                            other
                        )))
                    }
                }),
                UnaryOperator::Negate => Ok(match value {
                    Cell::Null => Cell::Null,
                    Cell::Int64(v) => Cell::Int64(-v),
                    Cell::Float64(v) => Cell::Float64(-v),
                    other => {
                        return Err(GraniteError::semantic(&format!(
                            "cannot negate {:?}",
                            other
                        )))
                    }
                }),
            }
        }
        Expr::FunctionCall { name, args } => {
            let value = eval(&args[0], row)?;
            eval_function(name, value)
        }
        Expr::Aggregate { .. } => Err(GraniteError::internal(
            "aggregate reached row-level evaluation",
        )),
        Expr::Subquery(_) => Err(GraniteError::internal(
            "unmaterialized subquery reached row-level evaluation",
        )),
        Expr::In {
            expr,
            list,
            negated,
        } => {
            let value = eval(expr, row)?;
            let items = match list {
                InList::Exprs(exprs) => exprs,
                InList::Subquery(_) => {
                    return Err(GraniteError::internal(
                        "unmaterialized IN subquery reached row-level evaluation",
                    ))
                }
            };
            if value.is_null() {
                return Ok(Cell::Null);
            }
            let mut saw_null = false;
            for item in items {
                let candidate = eval(item, row)?;
                if candidate.is_null() {
                    saw_null = true;
                } else if candidate == value {
                    return Ok(Cell::Bool(!negated));
                }
            }
            if saw_null {
                Ok(Cell::Null)
            } else {
                Ok(Cell::Bool(*negated))
            }
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = eval(expr, row)?;
            let low = eval(low, row)?;
            let high = eval(high, row)?;
            if value.is_null() || low.is_null() || high.is_null() {
                return Ok(Cell::Null);
            }
            let inside = value >= low && value <= high;
            Ok(Cell::Bool(inside != *negated))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let value = eval(expr, row)?;
            let pattern = eval(pattern, row)?;
            match (value, pattern) {
                (Cell::Null, _) | (_, Cell::Null) => Ok(Cell::Null),
                (Cell::String(s), Cell::String(p)) => {
                    Ok(Cell::Bool(like_match(&s, &p) != *negated))
                }
                (v, p) => Err(GraniteError::semantic(&format!(
                    "LIKE needs string operands, got {:?} and {:?}",
                    v, p
                ))),
            }
        }
        Expr::IsNull { expr, negated } => {
            let value = eval(expr, row)?;
            Ok(Cell::Bool(value.is_null() != *negated))
        }
        Expr::Case {
            operand,
            branches,
            else_result,
        } => {
            let operand_value = match operand {
                Some(e) => Some(eval(e, row)?),
                None => None,
            };
            for (when, then) in branches {
                let hit = match &operand_value {
                    Some(op_value) => {
                        let candidate = eval(when, row)?;
                        !op_value.is_null() && !candidate.is_null() && *op_value == candidate
                    }
                    None => eval(when, row)? == Cell::Bool(true),
                };
                if hit {
                    return eval(then, row);
                }
            }
            match else_result {
                Some(e) => eval(e, row),
                None => Ok(Cell::Null),
            }
        }
    }
}

/// A predicate holds only when it evaluates to exactly TRUE.
pub fn eval_predicate(expr: &Expr, row: &Row) -> Result<bool, GraniteError> {
    Ok(eval(expr, row)? == Cell::Bool(true))
}

fn kleene_and(a: &Cell, b: &Cell) -> Cell {
    match (a, b) {
        (Cell::Bool(false), _) | (_, Cell::Bool(false)) => Cell::Bool(false),
        (Cell::Bool(true), Cell::Bool(true)) => Cell::Bool(true),
        _ => Cell::Null,
    }
}

fn kleene_or(a: &Cell, b: &Cell) -> Cell {
    match (a, b) {
        (Cell::Bool(true), _) | (_, Cell::Bool(true)) => Cell::Bool(true),
        (Cell::Bool(false), Cell::Bool(false)) => Cell::Bool(false),
        _ => Cell::Null,
    }
}

fn eval_binary(op: BinaryOperator, left: &Cell, right: &Cell) -> Result<Cell, GraniteError> {
    if left.is_null() || right.is_null() {
        return Ok(Cell::Null);
    }

    if op.is_comparison() {
        let ordering = left.cmp(right);
        let result = match op {
            BinaryOperator::Eq => ordering == Ordering::Equal,
            BinaryOperator::NotEq => ordering != Ordering::Equal,
            BinaryOperator::Lt => ordering == Ordering::Less,
            BinaryOperator::LtEq => ordering != Ordering::Greater,
            BinaryOperator::Gt => ordering == Ordering::Greater,
            BinaryOperator::GtEq => ordering != Ordering::Less,
            _ => unreachable!(),
        };
        return Ok(Cell::Bool(result));
    }

    match (op, left, right) {
        (BinaryOperator::Plus, Cell::Int64(a), Cell::Int64(b)) => Ok(Cell::Int64(a + b)),
        (BinaryOperator::Minus, Cell::Int64(a), Cell::Int64(b)) => Ok(Cell::Int64(a - b)),
        (BinaryOperator::Multiply, Cell::Int64(a), Cell::Int64(b)) => Ok(Cell::Int64(a * b)),
        (BinaryOperator::Divide, Cell::Int64(a), Cell::Int64(b)) => {
            if *b == 0 {
                Ok(Cell::Null)
            } else {
                Ok(Cell::Int64(a / b))
            }
        }
        (BinaryOperator::Modulo, Cell::Int64(a), Cell::Int64(b)) => {
            if *b == 0 {
                Ok(Cell::Null)
            } else {
                Ok(Cell::Int64(a % b))
            }
        }
        (op, a, b) => {
            // mixed numeric arithmetic goes through f64
            let fa = a.as_f64();
            let fb = b.as_f64();
            match (op, fa, fb) {
                (BinaryOperator::Plus, Some(a), Some(b)) => Ok(Cell::Float64(a + b)),
                (BinaryOperator::Minus, Some(a), Some(b)) => Ok(Cell::Float64(a - b)),
                (BinaryOperator::Multiply, Some(a), Some(b)) => Ok(Cell::Float64(a * b)),
                (BinaryOperator::Divide, Some(a), Some(b)) => {
                    if b == 0.0 {
                        Ok(Cell::Null)
                    } else {
                        Ok(Cell::Float64(a / b))
                    }
                }
                (BinaryOperator::Modulo, Some(a), Some(b)) => {
                    if b == 0.0 {
                        Ok(Cell::Null)
                    } else {
                        Ok(Cell::Float64(a % b))
                    }
                }
                _ => Err(GraniteError::semantic(&format!(
                    "invalid operands for {:?}: {:?}, {:?}",
                    op, left, right
                ))),
            }
        }
    }
}

fn eval_function(name: &str, value: Cell) -> Result<Cell, GraniteError> {
    if value.is_null() {
        return Ok(Cell::Null);
    }
    match (name.to_ascii_lowercase().as_str(), value) {
        ("abs", Cell::Int64(v)) => Ok(Cell::Int64(v.abs())),
        ("abs", Cell::Float64(v)) => Ok(Cell::Float64(v.abs())),
        ("length", Cell::String(s)) => Ok(Cell::Int64(s.chars().count() as i64)),
        ("upper", Cell::String(s)) => Ok(Cell::String(s.to_uppercase())),
        ("lower", Cell::String(s)) => Ok(Cell::String(s.to_lowercase())),
        (name, value) => Err(GraniteError::semantic(&format!(
            "invalid argument {:?} for function {}",
            value, name
        ))),
    }
}

/// SQL LIKE: `%` matches any run, `_` any single character.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_inner(&text, &pattern)
}

fn like_inner(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('%') => {
            // try every split point, including the empty one
            (0..=text.len()).any(|skip| like_inner(&text[skip..], &pattern[1..]))
        }
        Some('_') => !text.is_empty() && like_inner(&text[1..], &pattern[1..]),
        Some(c) => text.first() == Some(c) && like_inner(&text[1..], &pattern[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(vec![
            Cell::Int64(5),
            Cell::String("hello".to_string()),
            Cell::Null,
        ])
    }

    #[test]
    fn test_comparison_and_arithmetic() {
        let expr = Expr::eq(
            Expr::binary(
                BinaryOperator::Plus,
                Expr::BoundColumn(0),
                Expr::literal(Cell::Int64(5)),
            ),
            Expr::literal(Cell::Int64(10)),
        );
        assert_eq!(eval(&expr, &row()).unwrap(), Cell::Bool(true));
    }

    #[test]
    fn test_null_propagation() {
        let cmp = Expr::eq(Expr::BoundColumn(2), Expr::literal(Cell::Int64(1)));
        assert_eq!(eval(&cmp, &row()).unwrap(), Cell::Null);
        assert!(!eval_predicate(&cmp, &row()).unwrap());

        let is_null = Expr::IsNull {
            expr: Box::new(Expr::BoundColumn(2)),
            negated: false,
        };
        assert_eq!(eval(&is_null, &row()).unwrap(), Cell::Bool(true));
    }

    #[test]
    fn test_kleene_logic() {
        // NULL OR TRUE = TRUE
        let expr = Expr::binary(
            BinaryOperator::Or,
            Expr::eq(Expr::BoundColumn(2), Expr::literal(Cell::Int64(1))),
            Expr::literal(Cell::Bool(true)),
        );
        assert_eq!(eval(&expr, &row()).unwrap(), Cell::Bool(true));

        // NULL AND FALSE = FALSE
        let expr = Expr::binary(
            BinaryOperator::And,
            Expr::eq(Expr::BoundColumn(2), Expr::literal(Cell::Int64(1))),
            Expr::literal(Cell::Bool(false)),
        );
        assert_eq!(eval(&expr, &row()).unwrap(), Cell::Bool(false));
    }

    #[test]
    fn test_like() {
        assert!(like_match("hello", "h%"));
        assert!(like_match("hello", "%llo"));
        assert!(like_match("hello", "h_llo"));
        assert!(!like_match("hello", "h_"));
        assert!(like_match("", "%"));
        assert!(!like_match("x", ""));
    }

    #[test]
    fn test_case() {
        let expr = Expr::Case {
            operand: Some(Box::new(Expr::BoundColumn(0))),
            branches: vec![
                (Expr::literal(Cell::Int64(4)), Expr::literal(Cell::String("four".into()))),
                (Expr::literal(Cell::Int64(5)), Expr::literal(Cell::String("five".into()))),
            ],
            else_result: None,
        };
        assert_eq!(
            eval(&expr, &row()).unwrap(),
            Cell::String("five".to_string())
        );
    }

    #[test]
    fn test_in_list_with_null() {
        // 5 IN (1, NULL) -> NULL ; 5 IN (5, NULL) -> TRUE
        let make = |items: Vec<Cell>| Expr::In {
            expr: Box::new(Expr::BoundColumn(0)),
            list: InList::Exprs(items.into_iter().map(Expr::Literal).collect()),
            negated: false,
        };
        assert_eq!(
            eval(&make(vec![Cell::Int64(1), Cell::Null]), &row()).unwrap(),
            Cell::Null
        );
        assert_eq!(
            eval(&make(vec![Cell::Int64(5), Cell::Null]), &row()).unwrap(),
            Cell::Bool(true)
        );
    }

    #[test]
    fn test_division_by_zero_yields_null() {
        let expr = Expr::binary(
            BinaryOperator::Divide,
            Expr::BoundColumn(0),
            Expr::literal(Cell::Int64(0)),
        );
        assert_eq!(eval(&expr, &row()).unwrap(), Cell::Null);
    }
}
