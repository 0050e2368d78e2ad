use std::collections::{BTreeMap, HashSet};

use crate::{
    error::GraniteError,
    exec::{
        expr::eval,
        operator::{ExecContext, Operator},
    },
    plan::{ast::AggregateFunc, logical::BoundAggregate},
    plan::ast::Expr,
    storage::{Cell, Row},
    types::GraniteResult,
};

/// Accumulator for one aggregate in one group.
enum AggState {
    Count {
        count: i64,
        distinct: Option<HashSet<Cell>>,
        count_rows: bool,
    },
    Sum {
        int: i64,
        float: f64,
        saw_float: bool,
        saw_any: bool,
        distinct: Option<HashSet<Cell>>,
    },
    Avg {
        sum: f64,
        count: i64,
        distinct: Option<HashSet<Cell>>,
    },
    Min(Option<Cell>),
    Max(Option<Cell>),
}

impl AggState {
    fn new(aggregate: &BoundAggregate) -> AggState {
        let distinct = if aggregate.distinct {
            Some(HashSet::new())
        } else {
            None
        };
        match aggregate.func {
            AggregateFunc::Count => AggState::Count {
                count: 0,
                distinct,
                count_rows: aggregate.arg.is_none(),
            },
            AggregateFunc::Sum => AggState::Sum {
                int: 0,
                float: 0.0,
                saw_float: false,
                saw_any: false,
                distinct,
            },
            AggregateFunc::Avg => AggState::Avg {
                sum: 0.0,
                count: 0,
                distinct,
            },
            AggregateFunc::Min => AggState::Min(None),
            AggregateFunc::Max => AggState::Max(None),
        }
    }

    /// Feed one row's value. `COUNT(*)` counts rows; everything else
    /// skips NULL.
    fn update(&mut self, value: Option<Cell>) -> GraniteResult {
        match self {
            AggState::Count {
                count,
                distinct,
                count_rows,
            } => {
                if *count_rows {
                    *count += 1;
                    return Ok(());
                }
                let value = match value {
                    Some(v) if !v.is_null() => v,
                    _ => return Ok(()),
                };
                if let Some(seen) = distinct {
                    if !seen.insert(value) {
                        return Ok(());
                    }
                }
                *count += 1;
            }
            AggState::Sum {
                int,
                float,
                saw_float,
                saw_any,
                distinct,
            } => {
                let value = match value {
                    Some(v) if !v.is_null() => v,
                    _ => return Ok(()),
                };
                if let Some(seen) = distinct {
                    if !seen.insert(value.clone()) {
                        return Ok(());
                    }
                }
                match value {
                    Cell::Int64(v) => {
                        *int += v;
                        *float += v as f64;
                    }
                    Cell::Float64(v) => {
                        *float += v;
                        *saw_float = true;
                    }
                    other => {
                        return Err(GraniteError::semantic(&format!(
                            "SUM over non-numeric value {:?}",
                            other
                        )))
                    }
                }
                *saw_any = true;
            }
            AggState::Avg {
                sum,
                count,
                distinct,
            } => {
                let value = match value {
                    Some(v) if !v.is_null() => v,
                    _ => return Ok(()),
                };
                if let Some(seen) = distinct {
                    if !seen.insert(value.clone()) {
                        return Ok(());
                    }
                }
                match value.as_f64() {
                    Some(v) => {
                        *sum += v;
                        *count += 1;
                    }
                    None => {
                        return Err(GraniteError::semantic(&format!(
                            "AVG over non-numeric value {:?}",
                            value
                        )))
                    }
                }
            }
            AggState::Min(current) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let smaller = current.as_ref().map_or(true, |c| v < *c);
                        if smaller {
                            *current = Some(v);
                        }
                    }
                }
            }
            AggState::Max(current) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let larger = current.as_ref().map_or(true, |c| v > *c);
                        if larger {
                            *current = Some(v);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Cell {
        match self {
            AggState::Count { count, .. } => Cell::Int64(count),
            AggState::Sum {
                int,
                float,
                saw_float,
                saw_any,
                ..
            } => {
                if !saw_any {
                    Cell::Null
                } else if saw_float {
                    Cell::Float64(float)
                } else {
                    Cell::Int64(int)
                }
            }
            AggState::Avg { sum, count, .. } => {
                if count == 0 {
                    Cell::Null
                } else {
                    Cell::Float64(sum / count as f64)
                }
            }
            AggState::Min(v) | AggState::Max(v) => v.unwrap_or(Cell::Null),
        }
    }
}

fn feed(
    states: &mut [AggState],
    aggregates: &[BoundAggregate],
    row: &Row,
) -> GraniteResult {
    for (state, aggregate) in states.iter_mut().zip(aggregates.iter()) {
        let value = match &aggregate.arg {
            Some(expr) => Some(eval(expr, row)?),
            None => None,
        };
        state.update(value)?;
    }
    Ok(())
}

fn output_row(key: Vec<Cell>, states: Vec<AggState>) -> Row {
    let mut cells = key;
    cells.extend(states.into_iter().map(|s| s.finish()));
    Row::new(cells)
}

/// Hash aggregation. Groups drain in key order so results are
/// deterministic regardless of input arrival order.
pub struct HashAggregateOp {
    input: Box<Operator>,
    groups: Vec<Expr>,
    aggregates: Vec<BoundAggregate>,
    output: Vec<Row>,
    position: usize,
}

impl HashAggregateOp {
    pub fn new(input: Box<Operator>, groups: Vec<Expr>, aggregates: Vec<BoundAggregate>) -> Self {
        Self {
            input,
            groups,
            aggregates,
            output: Vec::new(),
            position: 0,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.position = 0;
        self.input.open(ctx)?;

        // BTreeMap keeps group emission order stable
        let mut table: BTreeMap<Vec<Cell>, Vec<AggState>> = BTreeMap::new();
        let mut saw_rows = false;

        while let Some(row) = self.input.next(ctx)? {
            ctx.check_cancelled()?;
            saw_rows = true;

            let mut key = Vec::with_capacity(self.groups.len());
            for group in &self.groups {
                key.push(eval(group, &row)?);
            }

            let aggregates = &self.aggregates;
            let states = table
                .entry(key)
                .or_insert_with(|| aggregates.iter().map(AggState::new).collect());
            feed(states, &self.aggregates, &row)?;
        }

        // a global aggregate over zero rows still yields one row
        // (COUNT = 0, the others NULL); a grouped one yields none
        if !saw_rows && self.groups.is_empty() {
            let states: Vec<AggState> = self.aggregates.iter().map(AggState::new).collect();
            self.output.push(output_row(Vec::new(), states));
            return Ok(());
        }

        for (key, states) in table {
            self.output.push(output_row(key, states));
        }
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.position >= self.output.len() {
            return Ok(None);
        }
        let row = self.output[self.position].clone();
        self.position += 1;
        Ok(Some(row))
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.input.close(ctx)
    }
}

/// Streaming aggregation over input already grouped on the grouping
/// columns (index-ordered scans): one group in flight at a time.
pub struct SortAggregateOp {
    input: Box<Operator>,
    groups: Vec<Expr>,
    aggregates: Vec<BoundAggregate>,
    current: Option<(Vec<Cell>, Vec<AggState>)>,
    exhausted: bool,
    emitted_empty: bool,
}

impl SortAggregateOp {
    pub fn new(input: Box<Operator>, groups: Vec<Expr>, aggregates: Vec<BoundAggregate>) -> Self {
        Self {
            input,
            groups,
            aggregates,
            current: None,
            exhausted: false,
            emitted_empty: false,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.current = None;
        self.exhausted = false;
        self.emitted_empty = false;
        self.input.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            ctx.check_cancelled()?;
            let row = match self.input.next(ctx)? {
                Some(row) => row,
                None => {
                    self.exhausted = true;
                    return match self.current.take() {
                        Some((key, states)) => Ok(Some(output_row(key, states))),
                        None => {
                            if self.groups.is_empty() && !self.emitted_empty {
                                self.emitted_empty = true;
                                let states: Vec<AggState> =
                                    self.aggregates.iter().map(AggState::new).collect();
                                Ok(Some(output_row(Vec::new(), states)))
                            } else {
                                Ok(None)
                            }
                        }
                    };
                }
            };

            let mut key = Vec::with_capacity(self.groups.len());
            for group in &self.groups {
                key.push(eval(group, &row)?);
            }

            match &mut self.current {
                Some((current_key, states)) if *current_key == key => {
                    feed(states, &self.aggregates, &row)?;
                }
                Some(_) => {
                    // group boundary: emit the finished group, start
                    // the next one
                    let (finished_key, finished_states) = self.current.take().unwrap();
                    let mut states: Vec<AggState> =
                        self.aggregates.iter().map(AggState::new).collect();
                    feed(&mut states, &self.aggregates, &row)?;
                    self.current = Some((key, states));
                    return Ok(Some(output_row(finished_key, finished_states)));
                }
                None => {
                    let mut states: Vec<AggState> =
                        self.aggregates.iter().map(AggState::new).collect();
                    feed(&mut states, &self.aggregates, &row)?;
                    self.current = Some((key, states));
                }
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.current = None;
        self.input.close(ctx)
    }
}
