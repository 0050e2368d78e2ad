//! Cost model: `cost = cpu_cost * tuples + io_cost * pages`, with
//! selectivities from per-column statistics (equi-depth histograms and
//! distinct counts) and fixed fallbacks when statistics are missing.

use crate::{
    catalog::{
        statistics::{
            TableStatistics, DEFAULT_EQ_SELECTIVITY, DEFAULT_RANGE_SELECTIVITY,
            DEFAULT_UNKNOWN_SELECTIVITY,
        },
        TableInfo,
    },
    plan::ast::{BinaryOperator, Expr, InList},
    storage::Cell,
};

pub const CPU_COST_PER_TUPLE: f64 = 0.01;
pub const IO_COST_PER_PAGE: f64 = 1.0;

/// Rows in a relation, preferring live tree counters over possibly
/// stale statistics.
pub fn relation_rows(table: &TableInfo) -> f64 {
    let live = table.row_count();
    if live > 0 {
        live as f64
    } else {
        table.stats.read().unwrap().row_count as f64
    }
}

/// Leaf pages a full scan reads, assuming leaves run ~70% full.
pub fn relation_pages(table: &TableInfo) -> f64 {
    let per_leaf = (table.clustering.get_order() as f64 * 0.7).max(1.0);
    (relation_rows(table) / per_leaf).max(1.0)
}

pub fn scan_cost(rows: f64, pages: f64) -> f64 {
    CPU_COST_PER_TUPLE * rows + IO_COST_PER_PAGE * pages
}

/// Cost of probing an index once and fetching `rows` matches.
pub fn index_probe_cost(table: &TableInfo, rows: f64) -> f64 {
    let height = table.clustering.height().max(1) as f64;
    IO_COST_PER_PAGE * (height + rows / (table.clustering.get_order() as f64 * 0.7).max(1.0))
        + CPU_COST_PER_TUPLE * rows
}

/// Selectivity of one conjunct over a single relation. `local` maps an
/// absolute bound column to the relation-local index, returning None
/// for columns of other relations.
pub fn conjunct_selectivity<F>(stats: &TableStatistics, expr: &Expr, local: F) -> f64
where
    F: Fn(usize) -> Option<usize> + Copy,
{
    match expr {
        Expr::BinaryOp { op, left, right } if op.is_comparison() => {
            let (column, literal) = match (&**left, &**right) {
                (Expr::BoundColumn(c), Expr::Literal(v)) => (local(*c), Some(v)),
                (Expr::Literal(v), Expr::BoundColumn(c)) => (local(*c), Some(v)),
                _ => (None, None),
            };
            let column_stats = column.and_then(|c| stats.column(c));
            match (op, column_stats, literal) {
                (BinaryOperator::Eq, Some(cs), _) if cs.distinct > 0 => cs.eq_selectivity(),
                (BinaryOperator::Eq, _, _) => DEFAULT_EQ_SELECTIVITY,
                (BinaryOperator::NotEq, Some(cs), _) if cs.distinct > 0 => {
                    1.0 - cs.eq_selectivity()
                }
                (BinaryOperator::NotEq, _, _) => 1.0 - DEFAULT_EQ_SELECTIVITY,
                (BinaryOperator::Lt, Some(cs), Some(v)) | (BinaryOperator::LtEq, Some(cs), Some(v))
                    if cs.histogram.is_some() =>
                {
                    cs.below_selectivity(v).max(0.001)
                }
                (BinaryOperator::Gt, Some(cs), Some(v)) | (BinaryOperator::GtEq, Some(cs), Some(v))
                    if cs.histogram.is_some() =>
                {
                    (1.0 - cs.below_selectivity(v)).max(0.001)
                }
                _ => DEFAULT_RANGE_SELECTIVITY,
            }
        }
        Expr::Between { .. } => DEFAULT_RANGE_SELECTIVITY,
        Expr::IsNull { negated, .. } => {
            if *negated {
                0.9
            } else {
                0.1
            }
        }
        Expr::In {
            list: InList::Exprs(items),
            ..
        } => (items.len() as f64 * DEFAULT_EQ_SELECTIVITY).min(1.0),
        Expr::Like { .. } => 0.25,
        _ => DEFAULT_UNKNOWN_SELECTIVITY,
    }
}

/// Distinct count of a join key column, falling back to row count
/// (key-like) when unknown.
fn key_distinct(stats: &TableStatistics, column: Option<usize>, rows: f64) -> f64 {
    column
        .and_then(|c| stats.column(c))
        .map(|cs| cs.distinct as f64)
        .filter(|d| *d > 0.0)
        .unwrap_or(rows)
        .max(1.0)
}

/// Join cardinality under the containment assumption:
/// |L join R| = |L| * |R| / max(d(L.k), d(R.k)).
pub fn join_cardinality(
    left_rows: f64,
    right_rows: f64,
    left_stats: Option<(&TableStatistics, Option<usize>)>,
    right_stats: Option<(&TableStatistics, Option<usize>)>,
) -> f64 {
    let left_distinct = left_stats
        .map(|(s, c)| key_distinct(s, c, left_rows))
        .unwrap_or(left_rows.max(1.0));
    let right_distinct = right_stats
        .map(|(s, c)| key_distinct(s, c, right_rows))
        .unwrap_or(right_rows.max(1.0));
    (left_rows * right_rows / left_distinct.max(right_distinct)).max(1.0)
}

pub fn hash_join_cost(build_rows: f64, probe_rows: f64, out_rows: f64) -> f64 {
    CPU_COST_PER_TUPLE * (2.0 * build_rows + probe_rows + out_rows)
}

pub fn sort_merge_join_cost(left_rows: f64, right_rows: f64, out_rows: f64) -> f64 {
    let sort = |rows: f64| {
        if rows <= 1.0 {
            0.0
        } else {
            CPU_COST_PER_TUPLE * rows * rows.log2()
        }
    };
    sort(left_rows) + sort(right_rows) + CPU_COST_PER_TUPLE * (left_rows + right_rows + out_rows)
}

pub fn index_nested_loop_cost(outer_rows: f64, inner: &TableInfo, out_rows: f64) -> f64 {
    let height = inner.clustering.height().max(1) as f64;
    outer_rows * IO_COST_PER_PAGE * height + CPU_COST_PER_TUPLE * (outer_rows + out_rows)
}

pub fn block_nested_loop_cost(left_rows: f64, right_rows: f64, right_pages: f64) -> f64 {
    // the inner side is rescanned once per block of the outer
    let blocks = (left_rows / 1024.0).ceil().max(1.0);
    CPU_COST_PER_TUPLE * left_rows * right_rows + IO_COST_PER_PAGE * blocks * right_pages
}

pub fn sort_cost(rows: f64) -> f64 {
    if rows <= 1.0 {
        0.0
    } else {
        CPU_COST_PER_TUPLE * rows * rows.log2()
    }
}

pub fn aggregate_cost(rows: f64, groups: f64) -> f64 {
    CPU_COST_PER_TUPLE * (rows + groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::statistics::{ColumnStatistics, Histogram};

    fn stats_with_column(distinct: u64, values: Option<Vec<Cell>>) -> TableStatistics {
        let mut cs = ColumnStatistics::empty();
        cs.distinct = distinct;
        if let Some(values) = values {
            cs.histogram = Histogram::build(&values, 10);
        }
        TableStatistics {
            row_count: 1000,
            columns: vec![cs],
        }
    }

    #[test]
    fn test_eq_selectivity_uses_distinct() {
        let stats = stats_with_column(100, None);
        let expr = Expr::eq(Expr::BoundColumn(0), Expr::literal(Cell::Int64(5)));
        let s = conjunct_selectivity(&stats, &expr, |c| Some(c));
        assert!((s - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_selectivities() {
        let stats = TableStatistics::empty(1);
        let eq = Expr::eq(Expr::BoundColumn(0), Expr::literal(Cell::Int64(5)));
        assert_eq!(
            conjunct_selectivity(&stats, &eq, |c| Some(c)),
            DEFAULT_EQ_SELECTIVITY
        );

        let range = Expr::binary(
            BinaryOperator::Lt,
            Expr::BoundColumn(0),
            Expr::literal(Cell::Int64(5)),
        );
        assert_eq!(
            conjunct_selectivity(&stats, &range, |c| Some(c)),
            DEFAULT_RANGE_SELECTIVITY
        );
    }

    #[test]
    fn test_containment_cardinality() {
        let rows = join_cardinality(1000.0, 100.0, None, None);
        // keys default to row counts: 1000 * 100 / 1000
        assert!((rows - 100.0).abs() < 1e-9);
    }
}
