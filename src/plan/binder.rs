//! Binding: resolve identifiers against the catalog, attach types,
//! and rewrite column references into positions over the canonical
//! joined layout (relations concatenated in declared order).

use std::sync::Arc;

use crate::{
    catalog::TableInfo,
    database::Database,
    error::GraniteError,
    plan::{
        ast::{
            Expr, InList, InsertSource, InsertStmt, JoinKind, Projection, SelectStmt, Statement,
            TableRef,
        },
        logical::{
            BoundAggregate, BoundInsertSource, BoundJoinNode, BoundPredicate, BoundRelation,
            BoundSelect, BoundStatement,
        },
        normalize,
    },
    storage::{Cell, Type},
};

/// Resolves names for one SELECT scope.
struct Scope {
    relations: Vec<BoundRelation>,
}

impl Scope {
    fn width(&self) -> usize {
        self.relations
            .iter()
            .filter(|r| !r.semi)
            .map(|r| r.width)
            .sum()
    }

    fn resolve(&self, table: &Option<String>, column: &str) -> Result<usize, GraniteError> {
        let mut found: Option<usize> = None;
        for relation in &self.relations {
            if let Some(qualifier) = table {
                if *qualifier != relation.alias {
                    continue;
                }
            }
            if let Some(i) = relation.table.get_schema().column_index(column) {
                if found.is_some() {
                    return Err(GraniteError::semantic(&format!(
                        "ambiguous column reference: {}",
                        column
                    )));
                }
                found = Some(relation.offset + i);
            }
        }
        found.ok_or_else(|| match table {
            Some(qualifier) => GraniteError::semantic(&format!(
                "unknown column: {}.{}",
                qualifier, column
            )),
            None => GraniteError::semantic(&format!("unknown column: {}", column)),
        })
    }

    fn column_type(&self, absolute: usize) -> Option<Type> {
        for relation in &self.relations {
            if absolute >= relation.offset && absolute < relation.offset + relation.width {
                return Some(
                    relation
                        .table
                        .get_schema()
                        .column(absolute - relation.offset)
                        .ctype,
                );
            }
        }
        None
    }
}

pub fn bind_statement(
    db: &Database,
    db_name: &str,
    statement: &Statement,
) -> Result<BoundStatement, GraniteError> {
    match statement {
        Statement::Select(select) => Ok(BoundStatement::Select(bind_select(db, db_name, select)?)),
        Statement::Insert(insert) => bind_insert(db, db_name, insert),
        Statement::Update(update) => {
            let table = db.catalog().get_table(db_name, &update.table)?;
            let scope = table_scope(&table);
            let schema = table.get_schema();

            let mut assignments = Vec::new();
            for (column, expr) in &update.assignments {
                let index = schema.column_index(column).ok_or_else(|| {
                    GraniteError::semantic(&format!("unknown column: {}", column))
                })?;
                let bound = bind_expr(db, db_name, &scope, expr)?;
                check_type(
                    infer_type(&scope, &bound),
                    schema.column(index).ctype,
                    column,
                )?;
                assignments.push((index, bound));
            }

            let conjuncts = bind_conjuncts(db, db_name, &scope, &update.where_clause)?;
            Ok(BoundStatement::Update {
                table,
                assignments,
                conjuncts,
            })
        }
        Statement::Delete(delete) => {
            let table = db.catalog().get_table(db_name, &delete.table)?;
            let scope = table_scope(&table);
            let conjuncts = bind_conjuncts(db, db_name, &scope, &delete.where_clause)?;
            Ok(BoundStatement::Delete { table, conjuncts })
        }
        _ => Err(GraniteError::internal(
            "DDL and transaction control do not go through the planner",
        )),
    }
}

fn table_scope(table: &Arc<TableInfo>) -> Scope {
    let width = table.get_schema().width();
    Scope {
        relations: vec![BoundRelation {
            table: Arc::clone(table),
            alias: table.name.clone(),
            offset: 0,
            width,
            semi: false,
        }],
    }
}

fn bind_insert(
    db: &Database,
    db_name: &str,
    insert: &InsertStmt,
) -> Result<BoundStatement, GraniteError> {
    let table = db.catalog().get_table(db_name, &insert.table)?;
    let schema = table.get_schema();

    let columns: Vec<usize> = if insert.columns.is_empty() {
        (0..schema.width()).collect()
    } else {
        schema.resolve_columns(&insert.columns)?
    };

    let source = match &insert.source {
        InsertSource::Values(rows) => {
            let mut bound_rows = Vec::with_capacity(rows.len());
            for row in rows {
                if row.len() != columns.len() {
                    return Err(GraniteError::semantic(&format!(
                        "INSERT row has {} values for {} columns",
                        row.len(),
                        columns.len()
                    )));
                }
                let mut cells = Vec::with_capacity(row.len());
                for expr in row {
                    match const_fold(expr) {
                        Some(cell) => cells.push(cell),
                        None => {
                            return Err(GraniteError::semantic(
                                "INSERT VALUES must be constant expressions",
                            ))
                        }
                    }
                }
                bound_rows.push(cells);
            }
            BoundInsertSource::Values(bound_rows)
        }
        InsertSource::Subquery(select) => {
            let bound = bind_select(db, db_name, select)?;
            if bound.projections.len() != columns.len() {
                return Err(GraniteError::semantic(&format!(
                    "INSERT subquery yields {} columns, target list has {}",
                    bound.projections.len(),
                    columns.len()
                )));
            }
            BoundInsertSource::Subquery(Box::new(bound))
        }
    };

    Ok(BoundStatement::Insert {
        table,
        columns,
        source,
    })
}

/// Evaluate a constant expression at bind time, or None when it
/// references anything beyond literals.
pub fn const_fold(expr: &Expr) -> Option<Cell> {
    match expr {
        Expr::Literal(cell) => Some(cell.clone()),
        Expr::UnaryOp {
            op: crate::plan::ast::UnaryOperator::Negate,
            expr,
        } => match const_fold(expr)? {
            Cell::Int64(v) => Some(Cell::Int64(-v)),
            Cell::Float64(v) => Some(Cell::Float64(-v)),
            _ => None,
        },
        _ => None,
    }
}

pub fn bind_select(
    db: &Database,
    db_name: &str,
    select: &SelectStmt,
) -> Result<BoundSelect, GraniteError> {
    let select = normalize::normalize_select(select.clone());

    // 1. relations, in declared order
    let mut relations = Vec::new();
    let mut reorderable = true;
    for table_ref in &select.from {
        collect_relations(db, db_name, table_ref, &mut relations, &mut reorderable)?;
    }
    if relations.is_empty() {
        return Err(GraniteError::semantic("SELECT without FROM"));
    }
    if relations.len() > 64 {
        return Err(GraniteError::semantic("too many relations in FROM"));
    }

    let mut offset = 0;
    for relation in relations.iter_mut() {
        relation.offset = offset;
        offset += relation.width;
    }
    let mut scope = Scope { relations };

    // 2. WHERE conjuncts; inner-join ON conditions merge into them
    // when the tree is reorderable
    let mut conjuncts = bind_conjuncts(db, db_name, &scope, &select.where_clause)?;

    let from_tree = if reorderable {
        let mut next_leaf = 0;
        for table_ref in &select.from {
            merge_inner_on(db, db_name, &scope, table_ref, &mut conjuncts, &mut next_leaf)?;
        }
        None
    } else {
        if select.from.len() != 1 {
            return Err(GraniteError::semantic(
                "outer joins cannot mix with comma-separated FROM entries",
            ));
        }
        let mut next_leaf = 0;
        Some(bind_join_tree(db, db_name, &scope, &select.from[0], &mut next_leaf)?)
    };

    // 3. IN (subquery) conjuncts become semi joins where legal
    rewrite_in_subqueries(db, db_name, &mut scope, &mut conjuncts)?;

    // 4. projections
    let mut projections: Vec<(Expr, String)> = Vec::new();
    for projection in &select.projections {
        match projection {
            Projection::Wildcard => {
                for relation in scope.relations.iter().filter(|r| !r.semi) {
                    let schema = relation.table.get_schema();
                    for (i, column) in schema.columns.iter().enumerate() {
                        projections
                            .push((Expr::BoundColumn(relation.offset + i), column.name.clone()));
                    }
                }
            }
            Projection::Expr { expr, alias } => {
                let bound = bind_expr(db, db_name, &scope, expr)?;
                let name = alias.clone().unwrap_or_else(|| display_name(expr));
                projections.push((bound, name));
            }
        }
    }

    // 5. grouping: extract aggregates and rebind outputs over the
    // aggregate layout [group values..., aggregate values...]
    let bound_group_by: Vec<Expr> = select
        .group_by
        .iter()
        .map(|e| bind_expr(db, db_name, &scope, e))
        .collect::<Result<_, _>>()?;

    let grouped = !bound_group_by.is_empty()
        || projections.iter().any(|(e, _)| e.contains_aggregate())
        || select
            .having
            .as_ref()
            .map_or(false, |e| e.contains_aggregate());

    let mut aggregates: Vec<BoundAggregate> = Vec::new();
    let mut having = None;

    if grouped {
        let mut rebound = Vec::with_capacity(projections.len());
        for (expr, name) in projections {
            let over_groups =
                rebind_over_groups(expr, &bound_group_by, &mut aggregates).map_err(|_| {
                    GraniteError::semantic(&format!(
                        "column {} must appear in GROUP BY or inside an aggregate",
                        name
                    ))
                })?;
            rebound.push((over_groups, name));
        }
        projections = rebound;

        if let Some(having_expr) = &select.having {
            let bound = bind_expr(db, db_name, &scope, having_expr)?;
            let over_groups =
                rebind_over_groups(bound, &bound_group_by, &mut aggregates).map_err(|_| {
                    GraniteError::semantic("HAVING may only reference grouped columns and aggregates")
                })?;
            having = Some(over_groups);
        }
    } else if select.having.is_some() {
        return Err(GraniteError::semantic("HAVING without GROUP BY or aggregates"));
    }

    // 6. ORDER BY binds against the projection output
    let mut order_by = Vec::new();
    for item in &select.order_by {
        let index = resolve_order_target(db, db_name, &scope, &item.expr, &projections, grouped, &bound_group_by, &mut aggregates)?;
        order_by.push((Expr::BoundColumn(index), item.descending));
    }

    // 7. set operation arms must align
    let set_op = match &select.set_op {
        Some(clause) => {
            let right = bind_select(db, db_name, &clause.right)?;
            if right.projections.len() != projections.len() {
                return Err(GraniteError::semantic(&format!(
                    "set operation arms yield {} and {} columns",
                    projections.len(),
                    right.projections.len()
                )));
            }
            Some((clause.op, clause.all, Box::new(right)))
        }
        None => None,
    };

    let width = scope.width();
    Ok(BoundSelect {
        relations: scope.relations,
        from_tree,
        conjuncts,
        projections,
        group_by: bound_group_by,
        aggregates,
        having,
        order_by,
        limit: select.limit,
        offset: select.offset,
        distinct: select.distinct,
        set_op,
        width,
    })
}

fn collect_relations(
    db: &Database,
    db_name: &str,
    table_ref: &TableRef,
    out: &mut Vec<BoundRelation>,
    reorderable: &mut bool,
) -> Result<(), GraniteError> {
    match table_ref {
        TableRef::Named { table, alias } => {
            let info = db.catalog().get_table(db_name, table)?;
            let alias = alias.clone().unwrap_or_else(|| table.clone());
            if out.iter().any(|r| r.alias == alias) {
                return Err(GraniteError::semantic(&format!(
                    "duplicate table alias: {}",
                    alias
                )));
            }
            let width = info.get_schema().width();
            out.push(BoundRelation {
                table: info,
                alias,
                offset: 0,
                width,
                semi: false,
            });
            Ok(())
        }
        TableRef::Join {
            left, right, kind, ..
        } => {
            if !matches!(kind, JoinKind::Inner | JoinKind::Cross) {
                *reorderable = false;
            }
            collect_relations(db, db_name, left, out, reorderable)?;
            collect_relations(db, db_name, right, out, reorderable)
        }
    }
}

/// Fold the ON conditions of a reorderable (all-inner) tree into the
/// conjunct list.
fn merge_inner_on(
    db: &Database,
    db_name: &str,
    scope: &Scope,
    table_ref: &TableRef,
    conjuncts: &mut Vec<BoundPredicate>,
    next_leaf: &mut usize,
) -> Result<(), GraniteError> {
    match table_ref {
        TableRef::Named { .. } => {
            *next_leaf += 1;
            Ok(())
        }
        TableRef::Join {
            left, right, on, ..
        } => {
            merge_inner_on(db, db_name, scope, left, conjuncts, next_leaf)?;
            merge_inner_on(db, db_name, scope, right, conjuncts, next_leaf)?;
            if let Some(on) = on {
                let bound = bind_expr(db, db_name, scope, on)?;
                for conjunct in normalize::split_conjuncts(bound) {
                    conjuncts.push(make_predicate(scope, conjunct));
                }
            }
            Ok(())
        }
    }
}

fn bind_join_tree(
    db: &Database,
    db_name: &str,
    scope: &Scope,
    table_ref: &TableRef,
    next_leaf: &mut usize,
) -> Result<BoundJoinNode, GraniteError> {
    match table_ref {
        TableRef::Named { .. } => {
            let leaf = BoundJoinNode::Leaf(*next_leaf);
            *next_leaf += 1;
            Ok(leaf)
        }
        TableRef::Join {
            left,
            right,
            kind,
            on,
        } => {
            let left = bind_join_tree(db, db_name, scope, left, next_leaf)?;
            let right = bind_join_tree(db, db_name, scope, right, next_leaf)?;
            let on = match on {
                Some(expr) => Some(bind_expr(db, db_name, scope, expr)?),
                None => None,
            };
            Ok(BoundJoinNode::Join {
                left: Box::new(left),
                right: Box::new(right),
                kind: *kind,
                on,
            })
        }
    }
}

fn bind_conjuncts(
    db: &Database,
    db_name: &str,
    scope: &Scope,
    clause: &Option<Expr>,
) -> Result<Vec<BoundPredicate>, GraniteError> {
    let mut out = Vec::new();
    if let Some(clause) = clause {
        let bound = bind_expr(db, db_name, scope, clause)?;
        for conjunct in normalize::split_conjuncts(bound) {
            out.push(make_predicate(scope, conjunct));
        }
    }
    Ok(out)
}

fn make_predicate(scope: &Scope, expr: Expr) -> BoundPredicate {
    let mut columns = Vec::new();
    expr.collect_columns(&mut columns);
    let mut mask = 0u64;
    for column in columns {
        for (i, relation) in scope.relations.iter().enumerate() {
            if column >= relation.offset && column < relation.offset + relation.width {
                mask |= 1 << i;
            }
        }
    }
    BoundPredicate { expr, mask }
}

/// `x IN (SELECT c FROM t WHERE ...)` turns into a semi join against
/// `t` when the subquery is a plain single-table select. Anything
/// else stays an expression and is materialized at execution.
fn rewrite_in_subqueries(
    db: &Database,
    db_name: &str,
    scope: &mut Scope,
    conjuncts: &mut Vec<BoundPredicate>,
) -> Result<(), GraniteError> {
    let mut rewritten = Vec::new();

    for predicate in std::mem::take(conjuncts) {
        let replaced = match &predicate.expr {
            Expr::In {
                expr,
                list: InList::Subquery(sub),
                negated: false,
            } => try_semi_join(db, db_name, scope, expr, sub)?,
            _ => None,
        };

        match replaced {
            Some(mut extra) => rewritten.append(&mut extra),
            None => rewritten.push(predicate),
        }
    }

    *conjuncts = rewritten;
    Ok(())
}

/// Whether an IN-subquery can rewrite into a semi join: a plain
/// single-table single-projection select.
pub fn semi_join_eligible(sub: &SelectStmt) -> bool {
    sub.group_by.is_empty()
        && sub.having.is_none()
        && sub.order_by.is_empty()
        && sub.limit.is_none()
        && sub.set_op.is_none()
        && !sub.distinct
        && sub.from.len() == 1
        && sub.projections.len() == 1
        && matches!(&sub.from[0], TableRef::Named { .. })
        && matches!(
            &sub.projections[0],
            Projection::Expr { expr, .. } if !expr.contains_aggregate()
        )
}

fn try_semi_join(
    db: &Database,
    db_name: &str,
    scope: &mut Scope,
    outer: &Expr,
    sub: &SelectStmt,
) -> Result<Option<Vec<BoundPredicate>>, GraniteError> {
    if !semi_join_eligible(sub) {
        return Ok(None);
    }

    let (table_name, alias) = match &sub.from[0] {
        TableRef::Named { table, alias } => (table.clone(), alias.clone().unwrap_or_else(|| table.clone())),
        TableRef::Join { .. } => return Ok(None),
    };
    let projection = match &sub.projections[0] {
        crate::plan::ast::Projection::Expr { expr, .. } => expr.clone(),
        crate::plan::ast::Projection::Wildcard => return Ok(None),
    };
    if projection.contains_aggregate() {
        return Ok(None);
    }

    let table = db.catalog().get_table(db_name, &table_name)?;
    let width = table.get_schema().width();

    // semi relation lands after the current ones; give it a scoped
    // alias so it can never clash with user names
    let semi_alias = format!("__semi_{}_{}", alias, scope.relations.len());
    let offset = scope
        .relations
        .iter()
        .map(|r| r.width)
        .sum::<usize>();
    scope.relations.push(BoundRelation {
        table,
        alias: semi_alias.clone(),
        offset,
        width,
        semi: true,
    });

    // bind the subquery projection and filter in a scope where only
    // the semi relation resolves unqualified names
    let semi_scope = Scope {
        relations: vec![BoundRelation {
            table: Arc::clone(&scope.relations.last().unwrap().table),
            alias,
            offset,
            width,
            semi: true,
        }],
    };

    let mut extra = Vec::new();
    let inner_key = bind_expr(db, db_name, &semi_scope, &projection)?;
    let outer_key = bind_expr(db, db_name, scope, outer)?;
    extra.push(make_predicate(scope, Expr::eq(outer_key, inner_key)));

    if let Some(where_clause) = &sub.where_clause {
        let bound = bind_expr(db, db_name, &semi_scope, where_clause)?;
        for conjunct in normalize::split_conjuncts(bound) {
            extra.push(make_predicate(scope, conjunct));
        }
    }

    Ok(Some(extra))
}

fn display_name(expr: &Expr) -> String {
    match expr {
        Expr::ColumnRef { column, .. } => column.clone(),
        Expr::Aggregate { func, .. } => format!("{:?}", func).to_lowercase(),
        _ => "?column?".to_string(),
    }
}

/// Rewrite a canonical-layout expression over the aggregate output
/// layout, registering aggregates as they are found. Fails when a
/// bare column survives that is not a grouping expression.
fn rebind_over_groups(
    expr: Expr,
    group_by: &[Expr],
    aggregates: &mut Vec<BoundAggregate>,
) -> Result<Expr, ()> {
    if let Some(i) = group_by.iter().position(|g| *g == expr) {
        return Ok(Expr::BoundColumn(i));
    }

    match expr {
        Expr::Aggregate {
            func,
            arg,
            distinct,
        } => {
            let arg = arg.map(|a| *a);
            let position = aggregates.iter().position(|a| {
                a.func == func && a.arg == arg && a.distinct == distinct
            });
            let index = match position {
                Some(i) => i,
                None => {
                    aggregates.push(BoundAggregate {
                        func,
                        arg,
                        distinct,
                    });
                    aggregates.len() - 1
                }
            };
            Ok(Expr::BoundColumn(group_by.len() + index))
        }
        Expr::BoundColumn(_) => Err(()),
        Expr::Literal(_) => Ok(expr),
        Expr::BinaryOp { op, left, right } => Ok(Expr::BinaryOp {
            op,
            left: Box::new(rebind_over_groups(*left, group_by, aggregates)?),
            right: Box::new(rebind_over_groups(*right, group_by, aggregates)?),
        }),
        Expr::UnaryOp { op, expr } => Ok(Expr::UnaryOp {
            op,
            expr: Box::new(rebind_over_groups(*expr, group_by, aggregates)?),
        }),
        Expr::IsNull { expr, negated } => Ok(Expr::IsNull {
            expr: Box::new(rebind_over_groups(*expr, group_by, aggregates)?),
            negated,
        }),
        Expr::Case {
            operand,
            branches,
            else_result,
        } => {
            let operand = match operand {
                Some(e) => Some(Box::new(rebind_over_groups(*e, group_by, aggregates)?)),
                None => None,
            };
            let mut rebound = Vec::with_capacity(branches.len());
            for (w, t) in branches {
                rebound.push((
                    rebind_over_groups(w, group_by, aggregates)?,
                    rebind_over_groups(t, group_by, aggregates)?,
                ));
            }
            let else_result = match else_result {
                Some(e) => Some(Box::new(rebind_over_groups(*e, group_by, aggregates)?)),
                None => None,
            };
            Ok(Expr::Case {
                operand,
                branches: rebound,
                else_result,
            })
        }
        _ => Err(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_order_target(
    db: &Database,
    db_name: &str,
    scope: &Scope,
    expr: &Expr,
    projections: &[(Expr, String)],
    grouped: bool,
    group_by: &[Expr],
    aggregates: &mut Vec<BoundAggregate>,
) -> Result<usize, GraniteError> {
    // ordinal form: ORDER BY 2
    if let Expr::Literal(Cell::Int64(ordinal)) = expr {
        let index = *ordinal as usize;
        if index == 0 || index > projections.len() {
            return Err(GraniteError::semantic(&format!(
                "ORDER BY position {} is out of range",
                ordinal
            )));
        }
        return Ok(index - 1);
    }

    // alias form: ORDER BY output_name
    if let Expr::ColumnRef {
        table: None,
        column,
    } = expr
    {
        if let Some(i) = projections.iter().position(|(_, name)| name == column) {
            return Ok(i);
        }
    }

    // expression form: must match one of the outputs
    let bound = bind_expr(db, db_name, scope, expr)?;
    let target = if grouped {
        rebind_over_groups(bound, group_by, aggregates)
            .map_err(|_| GraniteError::semantic("ORDER BY must use grouped columns or aggregates"))?
    } else {
        bound
    };
    projections
        .iter()
        .position(|(e, _)| *e == target)
        .ok_or_else(|| GraniteError::semantic("ORDER BY expression must appear in the select list"))
}

/// Bind one expression against a scope: column references become
/// canonical positions, subqueries are semantically checked, types
/// are validated where the operator demands it.
pub fn bind_expr(
    db: &Database,
    db_name: &str,
    scope: &Scope,
    expr: &Expr,
) -> Result<Expr, GraniteError> {
    let bound = match expr {
        Expr::Literal(cell) => Expr::Literal(cell.clone()),
        Expr::BoundColumn(i) => Expr::BoundColumn(*i),
        Expr::ColumnRef { table, column } => Expr::BoundColumn(scope.resolve(table, column)?),
        Expr::BinaryOp { op, left, right } => {
            let left = bind_expr(db, db_name, scope, left)?;
            let right = bind_expr(db, db_name, scope, right)?;
            if op.is_comparison() {
                let lt = infer_type(scope, &left);
                let rt = infer_type(scope, &right);
                if let (Some(lt), Some(rt)) = (lt, rt) {
                    if !comparable(lt, rt) {
                        return Err(GraniteError::semantic(&format!(
                            "cannot compare {} with {}",
                            lt.name(),
                            rt.name()
                        )));
                    }
                }
            }
            Expr::BinaryOp {
                op: *op,
                left: Box::new(left),
                right: Box::new(right),
            }
        }
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(bind_expr(db, db_name, scope, expr)?),
        },
        Expr::FunctionCall { name, args } => {
            let known = ["abs", "length", "upper", "lower"];
            if !known.contains(&name.to_ascii_lowercase().as_str()) {
                return Err(GraniteError::semantic(&format!("unknown function: {}", name)));
            }
            if args.len() != 1 {
                return Err(GraniteError::semantic(&format!(
                    "{} takes exactly one argument",
                    name
                )));
            }
            Expr::FunctionCall {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|a| bind_expr(db, db_name, scope, a))
                    .collect::<Result<_, _>>()?,
            }
        }
        Expr::Aggregate {
            func,
            arg,
            distinct,
        } => Expr::Aggregate {
            func: *func,
            arg: match arg {
                Some(a) => Some(Box::new(bind_expr(db, db_name, scope, a)?)),
                None => None,
            },
            distinct: *distinct,
        },
        Expr::Subquery(sub) => {
            // scalar subqueries must bind on their own: correlated
            // references surface here as unknown columns
            bind_select(db, db_name, sub)?;
            Expr::Subquery(sub.clone())
        }
        Expr::In {
            expr,
            list,
            negated,
        } => {
            let list = match list {
                InList::Exprs(exprs) => InList::Exprs(
                    exprs
                        .iter()
                        .map(|e| bind_expr(db, db_name, scope, e))
                        .collect::<Result<_, _>>()?,
                ),
                InList::Subquery(sub) => {
                    let bound = bind_select(db, db_name, sub)?;
                    if bound.projections.len() != 1 {
                        return Err(GraniteError::semantic(
                            "IN subquery must yield exactly one column",
                        ));
                    }
                    InList::Subquery(sub.clone())
                }
            };
            Expr::In {
                expr: Box::new(bind_expr(db, db_name, scope, expr)?),
                list,
                negated: *negated,
            }
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: Box::new(bind_expr(db, db_name, scope, expr)?),
            low: Box::new(bind_expr(db, db_name, scope, low)?),
            high: Box::new(bind_expr(db, db_name, scope, high)?),
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => Expr::Like {
            expr: Box::new(bind_expr(db, db_name, scope, expr)?),
            pattern: Box::new(bind_expr(db, db_name, scope, pattern)?),
            negated: *negated,
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(bind_expr(db, db_name, scope, expr)?),
            negated: *negated,
        },
        Expr::Case {
            operand,
            branches,
            else_result,
        } => Expr::Case {
            operand: match operand {
                Some(e) => Some(Box::new(bind_expr(db, db_name, scope, e)?)),
                None => None,
            },
            branches: branches
                .iter()
                .map(|(w, t)| {
                    Ok((
                        bind_expr(db, db_name, scope, w)?,
                        bind_expr(db, db_name, scope, t)?,
                    ))
                })
                .collect::<Result<Vec<_>, GraniteError>>()?,
            else_result: match else_result {
                Some(e) => Some(Box::new(bind_expr(db, db_name, scope, e)?)),
                None => None,
            },
        },
    };
    Ok(bound)
}

fn comparable(a: Type, b: Type) -> bool {
    use Type::*;
    matches!(
        (a, b),
        (Bool, Bool)
            | (Int64, Int64)
            | (Float64, Float64)
            | (Int64, Float64)
            | (Float64, Int64)
            | (String, String)
    )
}

fn check_type(actual: Option<Type>, expected: Type, column: &str) -> Result<(), GraniteError> {
    if let Some(actual) = actual {
        if !comparable(actual, expected) {
            return Err(GraniteError::semantic(&format!(
                "cannot assign {} to column {} of type {}",
                actual.name(),
                column,
                expected.name()
            )));
        }
    }
    Ok(())
}

fn infer_type(scope: &Scope, expr: &Expr) -> Option<Type> {
    match expr {
        Expr::Literal(cell) => cell.get_type(),
        Expr::BoundColumn(i) => scope.column_type(*i),
        Expr::BinaryOp { op, left, right } => {
            if op.is_comparison() || matches!(op, crate::plan::ast::BinaryOperator::And | crate::plan::ast::BinaryOperator::Or) {
                Some(Type::Bool)
            } else {
                match (infer_type(scope, left), infer_type(scope, right)) {
                    (Some(Type::Float64), _) | (_, Some(Type::Float64)) => Some(Type::Float64),
                    (Some(Type::Int64), Some(Type::Int64)) => Some(Type::Int64),
                    _ => None,
                }
            }
        }
        Expr::UnaryOp { op, expr } => match op {
            crate::plan::ast::UnaryOperator::Not => Some(Type::Bool),
            crate::plan::ast::UnaryOperator::Negate => infer_type(scope, expr),
        },
        Expr::FunctionCall { name, .. } => match name.to_ascii_lowercase().as_str() {
            "abs" => None,
            "length" => Some(Type::Int64),
            "upper" | "lower" => Some(Type::String),
            _ => None,
        },
        Expr::Aggregate { func, arg, .. } => match func {
            crate::plan::ast::AggregateFunc::Count => Some(Type::Int64),
            crate::plan::ast::AggregateFunc::Avg => Some(Type::Float64),
            _ => arg.as_ref().and_then(|a| infer_type(scope, a)),
        },
        Expr::In { .. }
        | Expr::Between { .. }
        | Expr::Like { .. }
        | Expr::IsNull { .. } => Some(Type::Bool),
        Expr::Case {
            branches,
            else_result,
            ..
        } => branches
            .first()
            .map(|(_, t)| infer_type(scope, t))
            .flatten()
            .or_else(|| else_result.as_ref().and_then(|e| infer_type(scope, e))),
        Expr::Subquery(_) | Expr::ColumnRef { .. } => None,
    }
}

/// Output column types for the result protocol, inferred from the
/// bound projections.
pub fn output_types(_db: &Database, bound: &BoundSelect) -> Vec<Option<Type>> {
    let scope = Scope {
        relations: bound
            .relations
            .iter()
            .map(|r| BoundRelation {
                table: Arc::clone(&r.table),
                alias: r.alias.clone(),
                offset: r.offset,
                width: r.width,
                semi: r.semi,
            })
            .collect(),
    };
    bound
        .projections
        .iter()
        .map(|(expr, _)| {
            if bound.is_grouped() {
                // grouped outputs reference the aggregate layout;
                // fall back to shallow inference
                match expr {
                    Expr::BoundColumn(i) if *i < bound.group_by.len() => {
                        infer_type(&scope, &bound.group_by[*i])
                    }
                    _ => None,
                }
            } else {
                infer_type(&scope, expr)
            }
        })
        .collect()
}
