//! The statement tree consumed by the planner. The SQL text parser is
//! an external collaborator; it hands over this shape.

use crate::{
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    storage::{Cell, ReferentialAction, Type},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Box<SelectStmt>),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    CreateTable(CreateTableStmt),
    DropTable {
        name: String,
        cascade: bool,
    },
    CreateIndex(CreateIndexStmt),
    DropIndex {
        name: String,
        table: String,
    },
    Begin,
    Commit,
    Rollback,
}

impl Statement {
    /// Read-only statements are the ones the result cache may serve.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Statement::Select(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub projections: Vec<Projection>,
    pub from: Vec<TableRef>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    pub set_op: Option<SetOpClause>,
}

impl SelectStmt {
    /// A bare `SELECT <projections> FROM <from>` with everything else
    /// empty, the shape most tests build on.
    pub fn simple(projections: Vec<Projection>, from: Vec<TableRef>) -> Self {
        Self {
            projections,
            from,
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            set_op: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Named {
        table: String,
        alias: Option<String>,
    },
    Join {
        left: Box<TableRef>,
        right: Box<TableRef>,
        kind: JoinKind,
        on: Option<Expr>,
    },
}

impl TableRef {
    pub fn named(table: &str) -> Self {
        TableRef::Named {
            table: table.to_string(),
            alias: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
    /// Produced by the IN-subquery rewrite; not part of the consumed
    /// surface.
    Semi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOpClause {
    pub op: SetOpKind,
    pub all: bool,
    pub right: Box<SelectStmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    /// Empty means all columns in declared order.
    pub columns: Vec<String>,
    pub source: InsertSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Subquery(Box<SelectStmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub ctype: Type,
    pub nullable: bool,
    pub default: Option<Cell>,
}

impl ColumnDef {
    pub fn new(name: &str, ctype: Type) -> Self {
        Self {
            name: name.to_string(),
            ctype,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Unique {
        name: String,
        columns: Vec<String>,
    },
    ForeignKey {
        name: String,
        columns: Vec<String>,
        parent_table: String,
        parent_columns: Vec<String>,
        on_delete: ReferentialAction,
        on_update: ReferentialAction,
    },
    Check {
        name: String,
        expr: Expr,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStmt {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStmt {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InList {
    Exprs(Vec<Expr>),
    Subquery(Box<SelectStmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Cell),
    ColumnRef {
        table: Option<String>,
        column: String,
    },
    /// A resolved reference into the operator's input row. Produced by
    /// binding; never part of the consumed surface.
    BoundColumn(usize),
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggregateFunc,
        /// None is `COUNT(*)`.
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    Subquery(Box<SelectStmt>),
    In {
        expr: Box<Expr>,
        list: InList,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_result: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn literal(cell: Cell) -> Expr {
        Expr::Literal(cell)
    }

    pub fn column(name: &str) -> Expr {
        Expr::ColumnRef {
            table: None,
            column: name.to_string(),
        }
    }

    pub fn qualified(table: &str, column: &str) -> Expr {
        Expr::ColumnRef {
            table: Some(table.to_string()),
            column: column.to_string(),
        }
    }

    pub fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOperator::Eq, left, right)
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOperator::And, left, right)
    }

    /// Whether the expression contains an aggregate call at any depth
    /// outside of subqueries.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Literal(_) | Expr::ColumnRef { .. } | Expr::BoundColumn(_) | Expr::Subquery(_) => {
                false
            }
            Expr::BinaryOp { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::UnaryOp { expr, .. } => expr.contains_aggregate(),
            Expr::FunctionCall { args, .. } => args.iter().any(|a| a.contains_aggregate()),
            Expr::In { expr, list, .. } => {
                expr.contains_aggregate()
                    || match list {
                        InList::Exprs(exprs) => exprs.iter().any(|e| e.contains_aggregate()),
                        InList::Subquery(_) => false,
                    }
            }
            Expr::Between {
                expr, low, high, ..
            } => expr.contains_aggregate() || low.contains_aggregate() || high.contains_aggregate(),
            Expr::Like { expr, pattern, .. } => {
                expr.contains_aggregate() || pattern.contains_aggregate()
            }
            Expr::IsNull { expr, .. } => expr.contains_aggregate(),
            Expr::Case {
                operand,
                branches,
                else_result,
            } => {
                operand.as_ref().map_or(false, |e| e.contains_aggregate())
                    || branches
                        .iter()
                        .any(|(w, t)| w.contains_aggregate() || t.contains_aggregate())
                    || else_result
                        .as_ref()
                        .map_or(false, |e| e.contains_aggregate())
            }
        }
    }

    /// Rewrite every node bottom-up.
    pub fn transform<F>(self, f: &F) -> Expr
    where
        F: Fn(Expr) -> Expr,
    {
        let rebuilt = match self {
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op,
                left: Box::new(left.transform(f)),
                right: Box::new(right.transform(f)),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op,
                expr: Box::new(expr.transform(f)),
            },
            Expr::FunctionCall { name, args } => Expr::FunctionCall {
                name,
                args: args.into_iter().map(|a| a.transform(f)).collect(),
            },
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => Expr::Aggregate {
                func,
                arg: arg.map(|a| Box::new(a.transform(f))),
                distinct,
            },
            Expr::In {
                expr,
                list,
                negated,
            } => Expr::In {
                expr: Box::new(expr.transform(f)),
                list: match list {
                    InList::Exprs(exprs) => {
                        InList::Exprs(exprs.into_iter().map(|e| e.transform(f)).collect())
                    }
                    other => other,
                },
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(expr.transform(f)),
                low: Box::new(low.transform(f)),
                high: Box::new(high.transform(f)),
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(expr.transform(f)),
                pattern: Box::new(pattern.transform(f)),
                negated,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.transform(f)),
                negated,
            },
            Expr::Case {
                operand,
                branches,
                else_result,
            } => Expr::Case {
                operand: operand.map(|e| Box::new(e.transform(f))),
                branches: branches
                    .into_iter()
                    .map(|(w, t)| (w.transform(f), t.transform(f)))
                    .collect(),
                else_result: else_result.map(|e| Box::new(e.transform(f))),
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Rewrite every node bottom-up with a fallible visitor.
    pub fn transform_fallible<F, E>(self, f: &mut F) -> Result<Expr, E>
    where
        F: FnMut(Expr) -> Result<Expr, E>,
    {
        let rebuilt = match self {
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op,
                left: Box::new(left.transform_fallible(f)?),
                right: Box::new(right.transform_fallible(f)?),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op,
                expr: Box::new(expr.transform_fallible(f)?),
            },
            Expr::FunctionCall { name, args } => Expr::FunctionCall {
                name,
                args: args
                    .into_iter()
                    .map(|a| a.transform_fallible(f))
                    .collect::<Result<_, E>>()?,
            },
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => Expr::Aggregate {
                func,
                arg: match arg {
                    Some(a) => Some(Box::new(a.transform_fallible(f)?)),
                    None => None,
                },
                distinct,
            },
            Expr::In {
                expr,
                list,
                negated,
            } => Expr::In {
                expr: Box::new(expr.transform_fallible(f)?),
                list: match list {
                    InList::Exprs(exprs) => InList::Exprs(
                        exprs
                            .into_iter()
                            .map(|e| e.transform_fallible(f))
                            .collect::<Result<_, E>>()?,
                    ),
                    other => other,
                },
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(expr.transform_fallible(f)?),
                low: Box::new(low.transform_fallible(f)?),
                high: Box::new(high.transform_fallible(f)?),
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(expr.transform_fallible(f)?),
                pattern: Box::new(pattern.transform_fallible(f)?),
                negated,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.transform_fallible(f)?),
                negated,
            },
            Expr::Case {
                operand,
                branches,
                else_result,
            } => Expr::Case {
                operand: match operand {
                    Some(e) => Some(Box::new(e.transform_fallible(f)?)),
                    None => None,
                },
                branches: branches
                    .into_iter()
                    .map(|(w, t)| Ok((w.transform_fallible(f)?, t.transform_fallible(f)?)))
                    .collect::<Result<_, E>>()?,
                else_result: match else_result {
                    Some(e) => Some(Box::new(e.transform_fallible(f)?)),
                    None => None,
                },
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Shift every BoundColumn by `delta`. Used when moving bound
    /// predicates between layouts.
    pub fn shift_columns(self, delta: isize) -> Expr {
        self.transform(&|e| match e {
            Expr::BoundColumn(i) => Expr::BoundColumn((i as isize + delta) as usize),
            other => other,
        })
    }

    /// Collect the BoundColumn indexes referenced anywhere.
    pub fn collect_columns(&self, out: &mut Vec<usize>) {
        match self {
            Expr::BoundColumn(i) => out.push(*i),
            Expr::Literal(_) | Expr::ColumnRef { .. } | Expr::Subquery(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::UnaryOp { expr, .. } => expr.collect_columns(out),
            Expr::FunctionCall { args, .. } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_columns(out);
                }
            }
            Expr::In { expr, list, .. } => {
                expr.collect_columns(out);
                if let InList::Exprs(exprs) = list {
                    for e in exprs {
                        e.collect_columns(out);
                    }
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.collect_columns(out);
                pattern.collect_columns(out);
            }
            Expr::IsNull { expr, .. } => expr.collect_columns(out),
            Expr::Case {
                operand,
                branches,
                else_result,
            } => {
                if let Some(operand) = operand {
                    operand.collect_columns(out);
                }
                for (w, t) in branches {
                    w.collect_columns(out);
                    t.collect_columns(out);
                }
                if let Some(e) = else_result {
                    e.collect_columns(out);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// byte codec for the expression subset CHECK constraints persist
// ----------------------------------------------------------------------

impl Encodeable for Expr {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_expr(self, &mut buf);
        buf
    }
}

fn encode_expr(expr: &Expr, buf: &mut Vec<u8>) {
    match expr {
        Expr::Literal(cell) => {
            buf.push(0);
            buf.extend_from_slice(&cell.encode());
        }
        Expr::ColumnRef { table, column } => {
            buf.push(1);
            match table {
                Some(t) => {
                    buf.push(1);
                    buf.extend_from_slice(&t.encode());
                }
                None => buf.push(0),
            }
            buf.extend_from_slice(&column.encode());
        }
        Expr::BoundColumn(i) => {
            buf.push(2);
            buf.extend_from_slice(&(*i as u32).to_le_bytes());
        }
        Expr::BinaryOp { op, left, right } => {
            buf.push(3);
            buf.push(*op as u8);
            encode_expr(left, buf);
            encode_expr(right, buf);
        }
        Expr::UnaryOp { op, expr } => {
            buf.push(4);
            buf.push(*op as u8);
            encode_expr(expr, buf);
        }
        Expr::IsNull { expr, negated } => {
            buf.push(5);
            buf.push(*negated as u8);
            encode_expr(expr, buf);
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            buf.push(6);
            buf.push(*negated as u8);
            encode_expr(expr, buf);
            encode_expr(low, buf);
            encode_expr(high, buf);
        }
        // CHECK constraints never carry the remaining shapes; encode a
        // sentinel so a future reader fails loudly instead of silently
        _ => buf.push(255),
    }
}

impl Decodeable for Expr {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let tag = u8::decode_from(reader)?;
        match tag {
            0 => Ok(Expr::Literal(Cell::decode_from(reader)?)),
            1 => {
                let table = if u8::decode_from(reader)? == 1 {
                    Some(String::decode_from(reader)?)
                } else {
                    None
                };
                Ok(Expr::ColumnRef {
                    table,
                    column: String::decode_from(reader)?,
                })
            }
            2 => Ok(Expr::BoundColumn(u32::decode_from(reader)? as usize)),
            3 => {
                let op = decode_binary_op(u8::decode_from(reader)?)?;
                let left = Expr::decode_from(reader)?;
                let right = Expr::decode_from(reader)?;
                Ok(Expr::binary(op, left, right))
            }
            4 => {
                let op = match u8::decode_from(reader)? {
                    0 => UnaryOperator::Not,
                    _ => UnaryOperator::Negate,
                };
                Ok(Expr::UnaryOp {
                    op,
                    expr: Box::new(Expr::decode_from(reader)?),
                })
            }
            5 => {
                let negated = u8::decode_from(reader)? == 1;
                Ok(Expr::IsNull {
                    expr: Box::new(Expr::decode_from(reader)?),
                    negated,
                })
            }
            6 => {
                let negated = u8::decode_from(reader)? == 1;
                Ok(Expr::Between {
                    expr: Box::new(Expr::decode_from(reader)?),
                    low: Box::new(Expr::decode_from(reader)?),
                    high: Box::new(Expr::decode_from(reader)?),
                    negated,
                })
            }
            _ => Err(GraniteError::storage(&format!(
                "unsupported persisted expression tag: {}",
                tag
            ))),
        }
    }
}

fn decode_binary_op(tag: u8) -> Result<BinaryOperator, GraniteError> {
    use BinaryOperator::*;
    let ops = [
        Plus, Minus, Multiply, Divide, Modulo, Eq, NotEq, Lt, LtEq, Gt, GtEq, And, Or,
    ];
    ops.get(tag as usize).copied().ok_or_else(|| {
        GraniteError::storage(&format!("invalid binary operator tag: {}", tag))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_codec_round_trip() {
        let expr = Expr::and(
            Expr::binary(
                BinaryOperator::GtEq,
                Expr::column("age"),
                Expr::literal(Cell::Int64(0)),
            ),
            Expr::IsNull {
                expr: Box::new(Expr::column("name")),
                negated: true,
            },
        );
        let bytes = expr.encode();
        let mut reader = GraniteReader::new(&bytes);
        assert_eq!(Expr::decode_from(&mut reader).unwrap(), expr);
    }

    #[test]
    fn test_shift_columns() {
        let expr = Expr::eq(Expr::BoundColumn(2), Expr::BoundColumn(5));
        let shifted = expr.shift_columns(-2);
        assert_eq!(
            shifted,
            Expr::eq(Expr::BoundColumn(0), Expr::BoundColumn(3))
        );
    }

    #[test]
    fn test_contains_aggregate() {
        let agg = Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        };
        assert!(Expr::binary(BinaryOperator::Plus, agg, Expr::literal(Cell::Int64(1)))
            .contains_aggregate());
        assert!(!Expr::column("x").contains_aggregate());
    }
}
