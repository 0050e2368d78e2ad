use std::sync::Arc;

use crate::{
    catalog::TableInfo,
    plan::ast::{AggregateFunc, Expr, JoinKind, SetOpKind},
    storage::Cell,
};

/// One relation in a FROM clause, with its slice of the canonical
/// joined row (relations concatenated in declared order).
pub struct BoundRelation {
    pub table: Arc<TableInfo>,
    pub alias: String,
    pub offset: usize,
    pub width: usize,
    /// True for relations introduced by the IN-subquery rewrite: they
    /// filter the main tree through a semi join instead of widening
    /// the output.
    pub semi: bool,
}

/// A conjunct of the (merged) WHERE clause, bound to the canonical
/// layout, with the set of relations it references as a bitmask.
#[derive(Debug, Clone)]
pub struct BoundPredicate {
    pub expr: Expr,
    pub mask: u64,
}

impl BoundPredicate {
    pub fn single_relation(&self) -> Option<usize> {
        if self.mask.count_ones() == 1 {
            Some(self.mask.trailing_zeros() as usize)
        } else {
            None
        }
    }
}

/// The declared join tree, kept when outer joins forbid reordering.
pub enum BoundJoinNode {
    Leaf(usize),
    Join {
        left: Box<BoundJoinNode>,
        right: Box<BoundJoinNode>,
        kind: JoinKind,
        /// Bound to the canonical layout.
        on: Option<Expr>,
    },
}

#[derive(Debug, Clone)]
pub struct BoundAggregate {
    pub func: AggregateFunc,
    /// Bound to the canonical layout; None is COUNT(*).
    pub arg: Option<Expr>,
    pub distinct: bool,
}

pub struct BoundSelect {
    pub relations: Vec<BoundRelation>,
    /// None when every join is inner/cross and the planner may
    /// reorder freely.
    pub from_tree: Option<BoundJoinNode>,
    pub conjuncts: Vec<BoundPredicate>,
    /// Bound output expressions with their column names. For grouped
    /// queries these are bound to the aggregate output layout
    /// `[group values..., aggregate values...]`.
    pub projections: Vec<(Expr, String)>,
    pub group_by: Vec<Expr>,
    pub aggregates: Vec<BoundAggregate>,
    /// Bound to the aggregate output layout.
    pub having: Option<Expr>,
    /// Bound to the projection output layout.
    pub order_by: Vec<(Expr, bool)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    pub set_op: Option<(SetOpKind, bool, Box<BoundSelect>)>,
    /// Canonical joined width.
    pub width: usize,
}

impl BoundSelect {
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregates.is_empty()
    }

    /// Which relation owns an absolute canonical column.
    pub fn relation_of_column(&self, column: usize) -> Option<usize> {
        self.relations
            .iter()
            .position(|r| column >= r.offset && column < r.offset + r.width)
    }

    /// The canonical columns each relation must produce for the rest
    /// of the plan (projections, predicates, ordering), used for
    /// index-only scan decisions.
    pub fn referenced_columns(&self) -> Vec<usize> {
        let mut columns = Vec::new();
        for (expr, _) in &self.projections {
            expr.collect_columns(&mut columns);
        }
        for predicate in &self.conjuncts {
            predicate.expr.collect_columns(&mut columns);
        }
        for group in &self.group_by {
            group.collect_columns(&mut columns);
        }
        for aggregate in &self.aggregates {
            if let Some(arg) = &aggregate.arg {
                arg.collect_columns(&mut columns);
            }
        }
        if let Some(tree) = &self.from_tree {
            collect_tree_columns(tree, &mut columns);
        }
        columns.sort_unstable();
        columns.dedup();
        columns
    }
}

fn collect_tree_columns(node: &BoundJoinNode, out: &mut Vec<usize>) {
    match node {
        BoundJoinNode::Leaf(_) => {}
        BoundJoinNode::Join {
            left, right, on, ..
        } => {
            if let Some(on) = on {
                on.collect_columns(out);
            }
            collect_tree_columns(left, out);
            collect_tree_columns(right, out);
        }
    }
}

/// A bound statement, ready for physical planning.
pub enum BoundStatement {
    Select(BoundSelect),
    Insert {
        table: Arc<TableInfo>,
        /// Target column indexes, in the order values arrive.
        columns: Vec<usize>,
        source: BoundInsertSource,
    },
    Update {
        table: Arc<TableInfo>,
        assignments: Vec<(usize, Expr)>,
        conjuncts: Vec<BoundPredicate>,
    },
    Delete {
        table: Arc<TableInfo>,
        conjuncts: Vec<BoundPredicate>,
    },
}

pub enum BoundInsertSource {
    /// Literal rows, already evaluated to cells.
    Values(Vec<Vec<Cell>>),
    Subquery(Box<BoundSelect>),
}
