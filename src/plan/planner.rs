//! Cost-based physical planning: access-method selection per
//! relation, join-order enumeration (exhaustive dynamic programming up
//! to the configured threshold, greedy beyond), join algorithm and
//! aggregation strategy choice. Deterministic: the same statement,
//! catalog and statistics always produce the same plan.

use std::{collections::HashMap, ops::Bound, sync::Arc};

use log::debug;

use crate::{
    btree::ScanDirection,
    catalog::{IndexInfo, TableInfo},
    database::Database,
    error::GraniteError,
    plan::{
        ast::{AggregateFunc, BinaryOperator, Expr, JoinKind, SetOpKind},
        cost,
        logical::{
            BoundAggregate, BoundInsertSource, BoundJoinNode, BoundPredicate, BoundSelect,
            BoundStatement,
        },
    },
    storage::Cell,
    utils::HandyRwLock,
};

#[derive(Clone)]
pub enum PhysicalPlan {
    SeqScan {
        table: Arc<TableInfo>,
        predicate: Option<Expr>,
        with_rid: bool,
    },
    ParallelSeqScan {
        table: Arc<TableInfo>,
        predicate: Option<Expr>,
        degree: usize,
    },
    IndexScan {
        table: Arc<TableInfo>,
        index: Arc<IndexInfo>,
        lo: Bound<Vec<Cell>>,
        hi: Bound<Vec<Cell>>,
        direction: ScanDirection,
        predicate: Option<Expr>,
        with_rid: bool,
    },
    /// Serves the query straight from the index entries; uncovered
    /// columns surface as NULL and are never referenced.
    IndexOnlyScan {
        table: Arc<TableInfo>,
        index: Arc<IndexInfo>,
        lo: Bound<Vec<Cell>>,
        hi: Bound<Vec<Cell>>,
        direction: ScanDirection,
        predicate: Option<Expr>,
    },
    /// COUNT(*) without predicates: the tree's entry counter.
    CountStar {
        table: Arc<TableInfo>,
    },
    /// MIN/MAX over a column ordered by an index: one edge probe.
    IndexEdge {
        table: Arc<TableInfo>,
        index: Arc<IndexInfo>,
        max: bool,
    },
    Filter {
        input: Box<PhysicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Box<PhysicalPlan>,
        exprs: Vec<Expr>,
    },
    Sort {
        input: Box<PhysicalPlan>,
        keys: Vec<(usize, bool)>,
    },
    TopN {
        input: Box<PhysicalPlan>,
        keys: Vec<(usize, bool)>,
        limit: u64,
        offset: u64,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: Option<u64>,
        offset: u64,
    },
    Distinct {
        input: Box<PhysicalPlan>,
    },
    HashAggregate {
        input: Box<PhysicalPlan>,
        groups: Vec<Expr>,
        aggregates: Vec<BoundAggregate>,
    },
    /// Input arrives sorted (or grouped) on the grouping columns.
    SortAggregate {
        input: Box<PhysicalPlan>,
        groups: Vec<Expr>,
        aggregates: Vec<BoundAggregate>,
    },
    HashJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        kind: JoinKind,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        /// Build on the left input instead of the right.
        build_left: bool,
        residual: Option<Expr>,
        /// Width of the right input, for null extension.
        right_width: usize,
    },
    SortMergeJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        kind: JoinKind,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Option<Expr>,
        right_width: usize,
    },
    IndexNestedLoopJoin {
        outer: Box<PhysicalPlan>,
        inner_table: Arc<TableInfo>,
        inner_index: Arc<IndexInfo>,
        inner_predicate: Option<Expr>,
        outer_keys: Vec<Expr>,
        kind: JoinKind,
        residual: Option<Expr>,
    },
    BlockNestedLoopJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        kind: JoinKind,
        predicate: Option<Expr>,
        /// Width of the right input, for null extension.
        right_width: usize,
    },
    CrossJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
    },
    SetOp {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        op: SetOpKind,
        all: bool,
        hashed: bool,
    },
    Values {
        rows: Vec<Vec<Cell>>,
    },
    Insert {
        table: Arc<TableInfo>,
        columns: Vec<usize>,
        input: Box<PhysicalPlan>,
    },
    Update {
        table: Arc<TableInfo>,
        assignments: Vec<(usize, Expr)>,
        input: Box<PhysicalPlan>,
    },
    Delete {
        table: Arc<TableInfo>,
        input: Box<PhysicalPlan>,
    },
}

/// Rows past which a sequential scan is worth partitioning across
/// worker threads.
const PARALLEL_SCAN_ROWS: f64 = 100_000.0;

pub fn plan_statement(
    db: &Database,
    bound: &BoundStatement,
) -> Result<(PhysicalPlan, f64), GraniteError> {
    match bound {
        BoundStatement::Select(select) => plan_select_query(db, select),
        BoundStatement::Insert {
            table,
            columns,
            source,
        } => {
            let (input, cost) = match source {
                BoundInsertSource::Values(rows) => {
                    (PhysicalPlan::Values { rows: rows.clone() }, 0.0)
                }
                BoundInsertSource::Subquery(select) => {
                    let (plan, cost) = plan_select_query(db, select)?;
                    (plan, cost)
                }
            };
            Ok((
                PhysicalPlan::Insert {
                    table: Arc::clone(table),
                    columns: columns.clone(),
                    input: Box::new(input),
                },
                cost,
            ))
        }
        BoundStatement::Update {
            table,
            assignments,
            conjuncts,
        } => {
            let access = plan_single_table(db, table, conjuncts, true)?;
            Ok((
                PhysicalPlan::Update {
                    table: Arc::clone(table),
                    assignments: assignments.clone(),
                    input: Box::new(access.plan),
                },
                access.cost,
            ))
        }
        BoundStatement::Delete { table, conjuncts } => {
            let access = plan_single_table(db, table, conjuncts, true)?;
            Ok((
                PhysicalPlan::Delete {
                    table: Arc::clone(table),
                    input: Box::new(access.plan),
                },
                access.cost,
            ))
        }
    }
}

pub fn plan_select_query(
    db: &Database,
    bound: &BoundSelect,
) -> Result<(PhysicalPlan, f64), GraniteError> {
    let (mut plan, mut cost, est_rows) = plan_select_core(db, bound)?;

    if let Some((op, all, right)) = &bound.set_op {
        let (right_plan, right_cost) = plan_select_query(db, right)?;
        let budget = db.get_config().operator_memory_budget as f64;
        let hashed = est_rows * 96.0 <= budget;
        plan = PhysicalPlan::SetOp {
            left: Box::new(plan),
            right: Box::new(right_plan),
            op: *op,
            all: *all,
            hashed,
        };
        cost += right_cost + cost::aggregate_cost(est_rows, est_rows);
    }

    Ok((plan, cost))
}

// ----------------------------------------------------------------------
// access methods
// ----------------------------------------------------------------------

struct Access {
    plan: PhysicalPlan,
    rows: f64,
    cost: f64,
}

/// Equality and range conjuncts over one relation's local columns,
/// harvested for index matching.
struct LocalPredicates {
    all: Vec<Expr>,
    eq: HashMap<usize, Cell>,
    ranges: Vec<(usize, BinaryOperator, Cell)>,
    selectivity: f64,
}

fn harvest_local(
    table: &TableInfo,
    conjuncts: &[BoundPredicate],
    relation_bit: u64,
    offset: usize,
) -> LocalPredicates {
    let stats = table.stats.rl();
    let mut out = LocalPredicates {
        all: Vec::new(),
        eq: HashMap::new(),
        ranges: Vec::new(),
        selectivity: 1.0,
    };

    for predicate in conjuncts {
        if predicate.mask != relation_bit {
            continue;
        }
        let local_expr = predicate.expr.clone().shift_columns(-(offset as isize));
        out.selectivity *= cost::conjunct_selectivity(&stats, &local_expr, |c| Some(c));

        if let Expr::BinaryOp { op, left, right } = &local_expr {
            let column_literal = match (&**left, &**right) {
                (Expr::BoundColumn(c), Expr::Literal(v)) => Some((*c, *op, v.clone())),
                (Expr::Literal(v), Expr::BoundColumn(c)) => flip_op(*op).map(|op| (*c, op, v.clone())),
                _ => None,
            };
            if let Some((column, op, value)) = column_literal {
                match op {
                    BinaryOperator::Eq => {
                        out.eq.insert(column, value);
                    }
                    BinaryOperator::Lt
                    | BinaryOperator::LtEq
                    | BinaryOperator::Gt
                    | BinaryOperator::GtEq => out.ranges.push((column, op, value)),
                    _ => {}
                }
            }
        }
        out.all.push(local_expr);
    }
    out
}

fn flip_op(op: BinaryOperator) -> Option<BinaryOperator> {
    match op {
        BinaryOperator::Eq => Some(BinaryOperator::Eq),
        BinaryOperator::Lt => Some(BinaryOperator::Gt),
        BinaryOperator::LtEq => Some(BinaryOperator::GtEq),
        BinaryOperator::Gt => Some(BinaryOperator::Lt),
        BinaryOperator::GtEq => Some(BinaryOperator::LtEq),
        _ => None,
    }
}

fn and_all(mut exprs: Vec<Expr>) -> Option<Expr> {
    let first = exprs.pop()?;
    Some(exprs.into_iter().fold(first, |acc, e| Expr::and(acc, e)))
}

/// Best access path for one relation given its pushed-down conjuncts.
fn plan_access(
    db: &Database,
    table: &Arc<TableInfo>,
    local: &LocalPredicates,
    referenced: &[usize],
    with_rid: bool,
) -> Access {
    let base_rows = cost::relation_rows(table);
    let pages = cost::relation_pages(table);
    let out_rows = (base_rows * local.selectivity).max(1.0);

    let predicate = and_all(local.all.clone());

    // sequential scan is always available
    let mut best = Access {
        plan: PhysicalPlan::SeqScan {
            table: Arc::clone(table),
            predicate: predicate.clone(),
            with_rid,
        },
        rows: out_rows,
        cost: cost::scan_cost(base_rows, pages),
    };

    for index in table.get_indexes() {
        // longest equality prefix over the index columns
        let mut eq_values = Vec::new();
        for column in &index.columns {
            match local.eq.get(column) {
                Some(value) => eq_values.push(value.clone()),
                None => break,
            }
        }

        // optionally one range conjunct on the next index column
        let next_column = index.columns.get(eq_values.len());
        let range = next_column.and_then(|nc| {
            local
                .ranges
                .iter()
                .find(|(c, _, _)| c == nc)
                .cloned()
        });

        if eq_values.is_empty() && range.is_none() {
            continue;
        }

        let mut lo_key = eq_values.clone();
        let mut hi_key = eq_values.clone();
        let (lo, hi) = match &range {
            None => (
                if lo_key.is_empty() {
                    Bound::Unbounded
                } else {
                    Bound::Included(lo_key)
                },
                Bound::Included(hi_key),
            ),
            Some((_, op, value)) => match op {
                BinaryOperator::Lt => {
                    hi_key.push(value.clone());
                    (
                        if lo_key.is_empty() {
                            Bound::Unbounded
                        } else {
                            Bound::Included(lo_key)
                        },
                        Bound::Excluded(hi_key),
                    )
                }
                BinaryOperator::LtEq => {
                    hi_key.push(value.clone());
                    (
                        if lo_key.is_empty() {
                            Bound::Unbounded
                        } else {
                            Bound::Included(lo_key)
                        },
                        Bound::Included(hi_key),
                    )
                }
                BinaryOperator::Gt => {
                    lo_key.push(value.clone());
                    (
                        Bound::Excluded(lo_key),
                        if hi_key.is_empty() {
                            Bound::Unbounded
                        } else {
                            Bound::Included(hi_key)
                        },
                    )
                }
                BinaryOperator::GtEq => {
                    lo_key.push(value.clone());
                    (
                        Bound::Included(lo_key),
                        if hi_key.is_empty() {
                            Bound::Unbounded
                        } else {
                            Bound::Included(hi_key)
                        },
                    )
                }
                _ => (Bound::Unbounded, Bound::Unbounded),
            },
        };

        // selectivity of the bounds the index actually consumes
        let stats = table.stats.rl();
        let mut index_selectivity = 1.0;
        for column in index.columns.iter().take(eq_values.len()) {
            index_selectivity *= stats
                .column(*column)
                .filter(|cs| cs.distinct > 0)
                .map(|cs| cs.eq_selectivity())
                .unwrap_or(crate::catalog::statistics::DEFAULT_EQ_SELECTIVITY);
        }
        if range.is_some() {
            index_selectivity *= crate::catalog::statistics::DEFAULT_RANGE_SELECTIVITY;
        }
        drop(stats);

        let index_rows = (base_rows * index_selectivity).max(1.0);
        let covered = referenced.iter().all(|c| index.columns.contains(c));

        let (plan, access_cost) = if covered && !with_rid {
            (
                PhysicalPlan::IndexOnlyScan {
                    table: Arc::clone(table),
                    index: Arc::clone(&index),
                    lo: lo.clone(),
                    hi: hi.clone(),
                    direction: ScanDirection::Forward,
                    predicate: predicate.clone(),
                },
                // no clustering-tree lookups at all
                cost::index_probe_cost(table, index_rows) * 0.5,
            )
        } else {
            (
                PhysicalPlan::IndexScan {
                    table: Arc::clone(table),
                    index: Arc::clone(&index),
                    lo: lo.clone(),
                    hi: hi.clone(),
                    direction: ScanDirection::Forward,
                    predicate: predicate.clone(),
                    with_rid,
                },
                cost::index_probe_cost(table, index_rows)
                    + index_rows * cost::IO_COST_PER_PAGE * 0.1,
            )
        };

        if access_cost < best.cost {
            best = Access {
                plan,
                rows: out_rows.min(index_rows),
                cost: access_cost,
            };
        }
    }

    // wide scans parallelize when the planner kept the seq scan
    let degree = db
        .get_config()
        .max_parallel_per_query
        .min(num_cpus::get())
        .max(1);
    let parallel = match &best.plan {
        PhysicalPlan::SeqScan {
            table,
            predicate,
            with_rid: false,
        } if base_rows > PARALLEL_SCAN_ROWS && degree > 1 => {
            Some((Arc::clone(table), predicate.clone()))
        }
        _ => None,
    };
    if let Some((table, predicate)) = parallel {
        best.plan = PhysicalPlan::ParallelSeqScan {
            table,
            predicate,
            degree,
        };
    }

    best
}

/// Access planning for DML statements over one table.
fn plan_single_table(
    db: &Database,
    table: &Arc<TableInfo>,
    conjuncts: &[BoundPredicate],
    with_rid: bool,
) -> Result<Access, GraniteError> {
    let local = harvest_local(table, conjuncts, 1, 0);
    let referenced: Vec<usize> = (0..table.get_schema().width()).collect();
    Ok(plan_access(db, table, &local, &referenced, with_rid))
}

// ----------------------------------------------------------------------
// join planning
// ----------------------------------------------------------------------

/// An intermediate join result: its plan, estimates, and the order in
/// which relation slices appear in its output rows.
#[derive(Clone)]
struct Built {
    plan: PhysicalPlan,
    rows: f64,
    cost: f64,
    layout: Vec<usize>,
    /// Set when the plan is a bare scan of one relation, making it an
    /// index-nested-loop inner candidate.
    base: Option<usize>,
}

struct JoinContext<'a> {
    bound: &'a BoundSelect,
}

impl<'a> JoinContext<'a> {
    fn mask_of(&self, built: &Built) -> u64 {
        built.layout.iter().fold(0, |m, r| m | 1 << r)
    }

    /// Position of a canonical column inside a layout's output row.
    fn position_in(&self, layout: &[usize], column: usize) -> Option<usize> {
        let relation = self.bound.relation_of_column(column)?;
        let mut offset = 0;
        for r in layout {
            if *r == relation {
                return Some(offset + (column - self.bound.relations[relation].offset));
            }
            offset += self.bound.relations[*r].width;
        }
        None
    }

    fn remap(&self, expr: &Expr, layout: &[usize]) -> Expr {
        let ctx = self;
        expr.clone().transform(&|e| match e {
            Expr::BoundColumn(c) => match ctx.position_in(layout, c) {
                Some(p) => Expr::BoundColumn(p),
                None => Expr::BoundColumn(c),
            },
            other => other,
        })
    }

    fn columns_within(&self, expr: &Expr, mask: u64) -> bool {
        let mut columns = Vec::new();
        expr.collect_columns(&mut columns);
        columns.iter().all(|c| {
            self.bound
                .relation_of_column(*c)
                .map_or(false, |r| mask & (1 << r) != 0)
        })
    }
}

/// Conjuncts that become applicable exactly when `left` and `right`
/// combine: equi pairs become join keys, the rest residual filters.
struct JoinConjuncts {
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    /// Canonical join-key columns for cardinality estimation.
    key_columns: Option<(usize, usize)>,
    residual: Vec<Expr>,
}

fn applicable_conjuncts(
    ctx: &JoinContext,
    conjuncts: &[BoundPredicate],
    left: &Built,
    right: &Built,
) -> JoinConjuncts {
    let left_mask = ctx.mask_of(left);
    let right_mask = ctx.mask_of(right);
    let combined = left_mask | right_mask;

    let mut out = JoinConjuncts {
        left_keys: Vec::new(),
        right_keys: Vec::new(),
        key_columns: None,
        residual: Vec::new(),
    };

    for predicate in conjuncts {
        let applicable = predicate.mask & !combined == 0
            && predicate.mask & left_mask != 0
            && predicate.mask & right_mask != 0;
        if !applicable {
            continue;
        }

        if let Expr::BinaryOp {
            op: BinaryOperator::Eq,
            left: a,
            right: b,
        } = &predicate.expr
        {
            let (l, r) = if ctx.columns_within(a, left_mask) && ctx.columns_within(b, right_mask) {
                (a, b)
            } else if ctx.columns_within(b, left_mask) && ctx.columns_within(a, right_mask) {
                (b, a)
            } else {
                out.residual.push(predicate.expr.clone());
                continue;
            };

            if out.key_columns.is_none() {
                if let (Expr::BoundColumn(lc), Expr::BoundColumn(rc)) = (&**l, &**r) {
                    out.key_columns = Some((*lc, *rc));
                }
            }
            out.left_keys.push(ctx.remap(l, &left.layout));
            out.right_keys.push(ctx.remap(r, &right.layout));
        } else {
            out.residual.push(predicate.expr.clone());
        }
    }

    out
}

fn stats_for(ctx: &JoinContext, column: Option<usize>) -> Option<(Arc<TableInfo>, Option<usize>)> {
    let column = column?;
    let relation = ctx.bound.relation_of_column(column)?;
    let table = Arc::clone(&ctx.bound.relations[relation].table);
    let local = column - ctx.bound.relations[relation].offset;
    Some((table, Some(local)))
}

/// Join two intermediates, choosing the cheapest algorithm by costed
/// comparison.
fn join_pair(
    ctx: &JoinContext,
    conjuncts: &[BoundPredicate],
    left: &Built,
    right: &Built,
    kind: JoinKind,
) -> Built {
    let jc = applicable_conjuncts(ctx, conjuncts, left, right);

    let combined_layout: Vec<usize> = left
        .layout
        .iter()
        .chain(right.layout.iter())
        .copied()
        .collect();
    let residual = and_all(
        jc.residual
            .iter()
            .map(|e| ctx.remap(e, &combined_layout))
            .collect(),
    );

    let right_width: usize = right
        .layout
        .iter()
        .map(|r| ctx.bound.relations[*r].width)
        .sum();

    let (left_key_col, right_key_col) = match jc.key_columns {
        Some((l, r)) => (Some(l), Some(r)),
        None => (None, None),
    };
    let left_stats = stats_for(ctx, left_key_col);
    let right_stats = stats_for(ctx, right_key_col);

    let out_rows = if jc.left_keys.is_empty() {
        (left.rows * right.rows).max(1.0)
    } else {
        let l = left_stats.as_ref().map(|(t, c)| (t.stats.rl().clone(), *c));
        let r = right_stats.as_ref().map(|(t, c)| (t.stats.rl().clone(), *c));
        cost::join_cardinality(
            left.rows,
            right.rows,
            l.as_ref().map(|(s, c)| (s, *c)),
            r.as_ref().map(|(s, c)| (s, *c)),
        )
    };
    let out_rows = match kind {
        JoinKind::Left => out_rows.max(left.rows),
        JoinKind::Semi => left.rows * 0.5,
        _ => out_rows,
    };

    // no equi keys: block nested loop (a cross join when there is no
    // residual either)
    if jc.left_keys.is_empty() {
        let plan = if residual.is_none() && kind == JoinKind::Cross || residual.is_none() && kind == JoinKind::Inner {
            PhysicalPlan::CrossJoin {
                left: Box::new(left.plan.clone()),
                right: Box::new(right.plan.clone()),
            }
        } else {
            PhysicalPlan::BlockNestedLoopJoin {
                left: Box::new(left.plan.clone()),
                right: Box::new(right.plan.clone()),
                kind,
                predicate: residual,
                right_width,
            }
        };
        return Built {
            plan,
            rows: out_rows,
            cost: left.cost
                + right.cost
                + cost::block_nested_loop_cost(left.rows, right.rows, right.rows / 32.0),
            layout: combined_layout,
            base: None,
        };
    }

    // candidate: hash join, building on the estimated smaller side
    // (outer joins must build on the inner side)
    let build_left = kind == JoinKind::Inner && left.rows < right.rows;
    let hash_cost = if build_left {
        cost::hash_join_cost(left.rows, right.rows, out_rows)
    } else {
        cost::hash_join_cost(right.rows, left.rows, out_rows)
    };

    // candidate: sort-merge
    let merge_cost = cost::sort_merge_join_cost(left.rows, right.rows, out_rows);

    // candidate: index nested loop when the inner side is a bare scan
    // with an index on its join column
    let inl = right.base.and_then(|relation| {
        let key_local = right_key_col
            .map(|c| c - ctx.bound.relations[relation].offset)?;
        let table = &ctx.bound.relations[relation].table;
        let index = table.index_with_prefix(&[key_local])?;
        // only single-column probes through this path
        if jc.right_keys.len() != 1 {
            return None;
        }
        Some((
            Arc::clone(table),
            index,
            cost::index_nested_loop_cost(left.rows, table, out_rows),
        ))
    });

    let mut best_cost = hash_cost;
    let mut best = PhysicalPlan::HashJoin {
        left: Box::new(left.plan.clone()),
        right: Box::new(right.plan.clone()),
        kind,
        left_keys: jc.left_keys.clone(),
        right_keys: jc.right_keys.clone(),
        build_left,
        residual: residual.clone(),
        right_width,
    };

    if merge_cost < best_cost {
        best_cost = merge_cost;
        best = PhysicalPlan::SortMergeJoin {
            left: Box::new(left.plan.clone()),
            right: Box::new(right.plan.clone()),
            kind,
            left_keys: jc.left_keys.clone(),
            right_keys: jc.right_keys.clone(),
            residual: residual.clone(),
            right_width,
        };
    }

    if let Some((inner_table, inner_index, inl_cost)) = inl {
        if inl_cost < best_cost && matches!(kind, JoinKind::Inner | JoinKind::Left | JoinKind::Semi)
        {
            let inner_predicate = match &right.plan {
                PhysicalPlan::SeqScan { predicate, .. }
                | PhysicalPlan::ParallelSeqScan { predicate, .. }
                | PhysicalPlan::IndexScan { predicate, .. } => predicate.clone(),
                _ => None,
            };
            best_cost = inl_cost;
            best = PhysicalPlan::IndexNestedLoopJoin {
                outer: Box::new(left.plan.clone()),
                inner_table,
                inner_index,
                inner_predicate,
                outer_keys: jc.left_keys.clone(),
                kind,
                residual: residual.clone(),
            };
        }
    }

    Built {
        plan: best,
        rows: out_rows,
        cost: left.cost + right.cost + best_cost,
        layout: combined_layout,
        base: None,
    }
}

/// Exhaustive DP over relation subsets; for every mask the cheapest
/// (cost, then lower layout for determinism) way to join it.
fn dp_join_order(
    ctx: &JoinContext,
    conjuncts: &[BoundPredicate],
    leaves: Vec<Built>,
) -> Built {
    let n = leaves.len();
    let full: u64 = (1 << n) - 1;
    let mut table: Vec<Option<Built>> = vec![None; (full + 1) as usize];

    for (i, leaf) in leaves.into_iter().enumerate() {
        table[1 << i] = Some(leaf);
    }

    for mask in 1..=full {
        if mask.count_ones() < 2 {
            continue;
        }
        let mut best: Option<Built> = None;

        // enumerate proper submask splits; (sub, mask ^ sub) and its
        // mirror both appear, so left/right orders are covered
        let mut sub = (mask - 1) & mask;
        while sub > 0 {
            let rest = mask ^ sub;
            if let (Some(left), Some(right)) =
                (&table[sub as usize], &table[rest as usize])
            {
                let candidate = join_pair(ctx, conjuncts, left, right, JoinKind::Inner);
                let better = match &best {
                    None => true,
                    Some(current) => candidate.cost < current.cost,
                };
                if better {
                    best = Some(candidate);
                }
            }
            sub = (sub - 1) & mask;
        }

        table[mask as usize] = best;
    }

    table[full as usize]
        .take()
        .expect("join DP left the full mask unplanned")
}

/// Greedy fallback beyond the enumeration threshold: start from the
/// cheapest relation and repeatedly attach the one whose join costs
/// least (one step of lookahead).
fn greedy_join_order(
    ctx: &JoinContext,
    conjuncts: &[BoundPredicate],
    mut leaves: Vec<Built>,
) -> Built {
    let start = leaves
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.cost.partial_cmp(&b.cost).unwrap())
        .map(|(i, _)| i)
        .unwrap();
    let mut current = leaves.remove(start);

    while !leaves.is_empty() {
        let (next, built) = leaves
            .iter()
            .enumerate()
            .map(|(i, leaf)| {
                (
                    i,
                    join_pair(ctx, conjuncts, &current, leaf, JoinKind::Inner),
                )
            })
            .min_by(|(_, a), (_, b)| a.cost.partial_cmp(&b.cost).unwrap())
            .unwrap();
        current = built;
        leaves.remove(next);
    }

    current
}

fn build_declared_tree(
    ctx: &JoinContext,
    conjuncts: &[BoundPredicate],
    leaves: &[Built],
    node: &BoundJoinNode,
) -> Built {
    match node {
        BoundJoinNode::Leaf(i) => leaves[*i].clone(),
        BoundJoinNode::Join {
            left,
            right,
            kind,
            on,
        } => {
            let left = build_declared_tree(ctx, conjuncts, leaves, left);
            let right = build_declared_tree(ctx, conjuncts, leaves, right);

            // the ON condition arrives as extra conjuncts scoped to
            // this join
            let mut extra = conjuncts.to_vec();
            if let Some(on) = on {
                for part in crate::plan::normalize::split_conjuncts(on.clone()) {
                    let mut columns = Vec::new();
                    part.collect_columns(&mut columns);
                    let mut mask = 0u64;
                    for c in columns {
                        if let Some(r) = ctx.bound.relation_of_column(c) {
                            mask |= 1 << r;
                        }
                    }
                    extra.push(BoundPredicate { expr: part, mask });
                }
            }
            join_pair(ctx, &extra, &left, &right, *kind)
        }
    }
}

// ----------------------------------------------------------------------
// the SELECT pipeline
// ----------------------------------------------------------------------

fn plan_select_core(
    db: &Database,
    bound: &BoundSelect,
) -> Result<(PhysicalPlan, f64, f64), GraniteError> {
    if let Some(shortcut) = aggregate_shortcut(bound) {
        return Ok((shortcut, 1.0, 1.0));
    }

    let ctx = JoinContext { bound };
    let referenced = bound.referenced_columns();

    // below an outer join, WHERE must run after null extension: no
    // pushdown into scans or join residuals on that path
    let outer_path = bound.from_tree.is_some();
    let no_pushdown: Vec<BoundPredicate> = Vec::new();
    let pushdown: &[BoundPredicate] = if outer_path {
        &no_pushdown
    } else {
        &bound.conjuncts
    };

    // 1. per-relation access paths
    let mut leaves = Vec::new();
    for (i, relation) in bound.relations.iter().enumerate() {
        if relation.semi {
            continue;
        }
        let local = harvest_local(&relation.table, pushdown, 1 << i, relation.offset);
        let local_referenced: Vec<usize> = referenced
            .iter()
            .filter(|c| **c >= relation.offset && **c < relation.offset + relation.width)
            .map(|c| c - relation.offset)
            .collect();
        let access = plan_access(db, &relation.table, &local, &local_referenced, false);
        leaves.push(Built {
            plan: access.plan,
            rows: access.rows,
            cost: access.cost,
            layout: vec![i],
            base: Some(i),
        });
    }

    // 2. join order
    let mut built = if let Some(tree) = &bound.from_tree {
        build_declared_tree(&ctx, &no_pushdown, &leaves, tree)
    } else if leaves.len() == 1 {
        leaves.pop().unwrap()
    } else if leaves.len() <= db.get_config().join_enum_threshold {
        dp_join_order(&ctx, &bound.conjuncts, leaves)
    } else {
        greedy_join_order(&ctx, &bound.conjuncts, leaves)
    };

    // 3. semi joins from IN-subquery rewrites
    for (i, relation) in bound.relations.iter().enumerate() {
        if !relation.semi {
            continue;
        }
        let local = harvest_local(&relation.table, &bound.conjuncts, 1 << i, relation.offset);
        let access = plan_access(db, &relation.table, &local, &relation.table.get_schema().columns.iter().enumerate().map(|(c, _)| c).collect::<Vec<_>>(), false);
        let semi_leaf = Built {
            plan: access.plan,
            rows: access.rows,
            cost: access.cost,
            layout: vec![i],
            base: Some(i),
        };
        built = join_pair(&ctx, &bound.conjuncts, &built, &semi_leaf, JoinKind::Semi);
        // semi joins emit only the left row
        built.layout.retain(|r| *r != i);
    }

    // 4. leftover conjuncts that never became applicable (e.g. ones
    // referencing a single relation through a complex shape were
    // already pushed; anything else lands here)
    let applied_mask: u64 = built.layout.iter().fold(0, |m, r| m | 1 << r);
    let mut leftovers = Vec::new();
    for predicate in &bound.conjuncts {
        let semi_related = bound
            .relations
            .iter()
            .enumerate()
            .any(|(i, r)| r.semi && predicate.mask & (1 << i) != 0);
        if semi_related {
            // consumed by the semi join stage
            continue;
        }
        if outer_path {
            leftovers.push(ctx.remap(&predicate.expr, &built.layout));
            continue;
        }
        if predicate.single_relation().is_some() {
            // pushed into the scan
            continue;
        }
        if predicate.mask.count_ones() >= 2 && predicate.mask & !applied_mask == 0 {
            // consumed as a join conjunct or residual
            continue;
        }
        leftovers.push(ctx.remap(&predicate.expr, &built.layout));
    }
    let mut plan = built.plan;
    let mut rows = built.rows;
    let mut total_cost = built.cost;
    if let Some(filter) = and_all(leftovers) {
        plan = PhysicalPlan::Filter {
            input: Box::new(plan),
            predicate: filter,
        };
    }

    // 5. restore the canonical layout when joins reordered it
    let canonical: Vec<usize> = (0..bound.relations.len())
        .filter(|i| !bound.relations[*i].semi)
        .collect();
    if built.layout != canonical {
        let mut exprs = Vec::with_capacity(bound.width);
        for relation in canonical.iter().map(|i| &bound.relations[*i]) {
            for local in 0..relation.width {
                let absolute = relation.offset + local;
                let position = ctx
                    .position_in(&built.layout, absolute)
                    .expect("canonical column lost during join planning");
                exprs.push(Expr::BoundColumn(position));
            }
        }
        plan = PhysicalPlan::Project {
            input: Box::new(plan),
            exprs,
        };
    }

    // 6. aggregation
    if bound.is_grouped() {
        let groups = bound.group_by.clone();
        let aggregates = bound.aggregates.clone();

        let grouping_index = index_backed_grouping(bound).filter(|_| {
            // the index delivers grouped order only when it replaces a
            // bare single-table scan with nothing filtered below it
            bound.relations.len() == 1 && bound.conjuncts.is_empty() && !outer_path
        });
        plan = match grouping_index {
            Some(index) => {
                let table = Arc::clone(&bound.relations[0].table);
                PhysicalPlan::SortAggregate {
                    input: Box::new(PhysicalPlan::IndexScan {
                        table,
                        index,
                        lo: Bound::Unbounded,
                        hi: Bound::Unbounded,
                        direction: ScanDirection::Forward,
                        predicate: None,
                        with_rid: false,
                    }),
                    groups,
                    aggregates,
                }
            }
            None => PhysicalPlan::HashAggregate {
                input: Box::new(plan),
                groups,
                aggregates,
            },
        };
        let group_estimate = (rows / 10.0).max(1.0);
        total_cost += cost::aggregate_cost(rows, group_estimate);
        rows = group_estimate;

        if let Some(having) = &bound.having {
            plan = PhysicalPlan::Filter {
                input: Box::new(plan),
                predicate: having.clone(),
            };
        }
    }

    // 7. projection to the output shape
    plan = PhysicalPlan::Project {
        input: Box::new(plan),
        exprs: bound.projections.iter().map(|(e, _)| e.clone()).collect(),
    };

    // 8. distinct, order, limit
    if bound.distinct {
        plan = PhysicalPlan::Distinct {
            input: Box::new(plan),
        };
        total_cost += cost::aggregate_cost(rows, rows);
    }

    let keys: Vec<(usize, bool)> = bound
        .order_by
        .iter()
        .map(|(expr, descending)| match expr {
            Expr::BoundColumn(i) => (*i, *descending),
            _ => unreachable!("order keys are bound to output positions"),
        })
        .collect();

    match (keys.is_empty(), bound.limit) {
        (false, Some(limit)) => {
            // a bounded sort keeps a heap of limit + offset rows
            plan = PhysicalPlan::TopN {
                input: Box::new(plan),
                keys,
                limit,
                offset: bound.offset.unwrap_or(0),
            };
            total_cost += cost::sort_cost(rows.min((limit + bound.offset.unwrap_or(0)) as f64));
        }
        (false, None) => {
            plan = PhysicalPlan::Sort {
                input: Box::new(plan),
                keys,
            };
            total_cost += cost::sort_cost(rows);
        }
        (true, _) => {
            if bound.limit.is_some() || bound.offset.is_some() {
                plan = PhysicalPlan::Limit {
                    input: Box::new(plan),
                    limit: bound.limit,
                    offset: bound.offset.unwrap_or(0),
                };
            }
        }
    }

    debug!("planned select: estimated {} rows, cost {:.2}", rows as u64, total_cost);
    Ok((plan, total_cost, rows))
}

/// `COUNT(*)`, `MIN(c)`, `MAX(c)` over a bare table resolve without a
/// scan: the tree keeps an entry counter, and an index ordered by `c`
/// serves MIN/MAX from its edge.
fn aggregate_shortcut(bound: &BoundSelect) -> Option<PhysicalPlan> {
    let simple = bound.relations.len() == 1
        && !bound.relations[0].semi
        && bound.conjuncts.is_empty()
        && bound.group_by.is_empty()
        && bound.aggregates.len() == 1
        && bound.having.is_none()
        && bound.order_by.is_empty()
        && !bound.distinct
        && bound.limit.is_none()
        && bound.projections.len() == 1
        && bound.projections[0].0 == Expr::BoundColumn(0);
    if !simple {
        return None;
    }

    let table = &bound.relations[0].table;
    let aggregate = &bound.aggregates[0];
    match (aggregate.func, &aggregate.arg) {
        (AggregateFunc::Count, None) => Some(PhysicalPlan::CountStar {
            table: Arc::clone(table),
        }),
        (AggregateFunc::Min, Some(Expr::BoundColumn(c)))
        | (AggregateFunc::Max, Some(Expr::BoundColumn(c))) => {
            let index = table.index_with_prefix(&[*c])?;
            Some(PhysicalPlan::IndexEdge {
                table: Arc::clone(table),
                index,
                max: aggregate.func == AggregateFunc::Max,
            })
        }
        _ => None,
    }
}

/// Grouping rides an index when the query reads one relation and the
/// GROUP BY columns form a prefix of one of its indexes; the index
/// scan delivers rows already grouped.
fn index_backed_grouping(bound: &BoundSelect) -> Option<Arc<IndexInfo>> {
    if bound.relations.len() != 1 || bound.group_by.is_empty() {
        return None;
    }
    let columns: Option<Vec<usize>> = bound
        .group_by
        .iter()
        .map(|g| match g {
            Expr::BoundColumn(c) => Some(*c),
            _ => None,
        })
        .collect();
    bound.relations[0].table.index_with_prefix(&columns?)
}
