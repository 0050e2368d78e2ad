//! The pull-based operator contract: `open`, `next`, `close` over a
//! tagged operator sum type. No runtime type inspection happens
//! outside this dispatch.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    database::Database,
    error::GraniteError,
    exec::{
        aggregate::{HashAggregateOp, SortAggregateOp},
        dml::{DeleteOp, InsertOp, UpdateOp},
        join::{BlockNestedLoopJoinOp, CrossJoinOp, HashJoinOp, IndexNestedLoopJoinOp, SortMergeJoinOp},
        misc::{DistinctOp, FilterOp, LimitOp, ProjectOp, TopNOp, ValuesOp},
        parallel::ParallelSeqScanOp,
        scan::{CountStarOp, IndexEdgeOp, IndexOnlyScanOp, IndexScanOp, SeqScanOp},
        set_op::SetOpOp,
        sort::SortOp,
    },
    plan::PhysicalPlan,
    storage::{Rid, Row},
    transaction::{LockId, LockMode, Transaction},
    types::GraniteResult,
};

/// Everything an operator needs at runtime: the engine context, the
/// owning transaction, cancellation state and instrumentation
/// counters.
pub struct ExecContext {
    pub db: Arc<Database>,
    pub tx: Transaction,
    pub db_name: String,
    pub deadline: Option<Instant>,
    pub cancel_flag: Arc<AtomicBool>,
    pub rows_examined: AtomicU64,
}

impl ExecContext {
    pub fn new(db: Arc<Database>, tx: Transaction, db_name: &str, deadline: Option<Instant>) -> Self {
        Self {
            db,
            tx,
            db_name: db_name.to_string(),
            deadline,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            rows_examined: AtomicU64::new(0),
        }
    }

    /// Cancellation check at operator safe points. Timeouts and
    /// explicit cancellation surface through the same path.
    pub fn check_cancelled(&self) -> GraniteResult {
        if self.cancel_flag.load(Ordering::Relaxed) {
            return Err(GraniteError::cancelled("statement cancelled"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(GraniteError::cancelled("statement timeout exceeded"));
            }
        }
        Ok(())
    }

    pub fn note_row(&self) {
        self.rows_examined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_table_shared(&self, table_id: u32) -> GraniteResult {
        self.db.lock_manager().acquire(
            self.tx.get_id(),
            LockId::table(table_id),
            LockMode::IntentShared,
        )
    }

    pub fn lock_table_exclusive_intent(&self, table_id: u32) -> GraniteResult {
        self.db.lock_manager().acquire(
            self.tx.get_id(),
            LockId::table(table_id),
            LockMode::IntentExclusive,
        )
    }

    pub fn lock_row_shared(&self, table_id: u32, rid: Rid) -> GraniteResult {
        self.db
            .lock_manager()
            .acquire(self.tx.get_id(), LockId::row(table_id, rid), LockMode::Shared)
    }

    pub fn lock_row_exclusive(&self, table_id: u32, rid: Rid) -> GraniteResult {
        self.db.lock_manager().acquire(
            self.tx.get_id(),
            LockId::row(table_id, rid),
            LockMode::Exclusive,
        )
    }
}

pub enum Operator {
    SeqScan(SeqScanOp),
    ParallelSeqScan(ParallelSeqScanOp),
    IndexScan(IndexScanOp),
    IndexOnlyScan(IndexOnlyScanOp),
    CountStar(CountStarOp),
    IndexEdge(IndexEdgeOp),
    Filter(FilterOp),
    Project(ProjectOp),
    Sort(SortOp),
    TopN(TopNOp),
    Limit(LimitOp),
    Distinct(DistinctOp),
    HashAggregate(HashAggregateOp),
    SortAggregate(SortAggregateOp),
    HashJoin(HashJoinOp),
    SortMergeJoin(SortMergeJoinOp),
    IndexNestedLoopJoin(IndexNestedLoopJoinOp),
    BlockNestedLoopJoin(BlockNestedLoopJoinOp),
    CrossJoin(CrossJoinOp),
    SetOp(SetOpOp),
    Values(ValuesOp),
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
}

macro_rules! dispatch {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            Operator::SeqScan(op) => op.$method($($arg),*),
            Operator::ParallelSeqScan(op) => op.$method($($arg),*),
            Operator::IndexScan(op) => op.$method($($arg),*),
            Operator::IndexOnlyScan(op) => op.$method($($arg),*),
            Operator::CountStar(op) => op.$method($($arg),*),
            Operator::IndexEdge(op) => op.$method($($arg),*),
            Operator::Filter(op) => op.$method($($arg),*),
            Operator::Project(op) => op.$method($($arg),*),
            Operator::Sort(op) => op.$method($($arg),*),
            Operator::TopN(op) => op.$method($($arg),*),
            Operator::Limit(op) => op.$method($($arg),*),
            Operator::Distinct(op) => op.$method($($arg),*),
            Operator::HashAggregate(op) => op.$method($($arg),*),
            Operator::SortAggregate(op) => op.$method($($arg),*),
            Operator::HashJoin(op) => op.$method($($arg),*),
            Operator::SortMergeJoin(op) => op.$method($($arg),*),
            Operator::IndexNestedLoopJoin(op) => op.$method($($arg),*),
            Operator::BlockNestedLoopJoin(op) => op.$method($($arg),*),
            Operator::CrossJoin(op) => op.$method($($arg),*),
            Operator::SetOp(op) => op.$method($($arg),*),
            Operator::Values(op) => op.$method($($arg),*),
            Operator::Insert(op) => op.$method($($arg),*),
            Operator::Update(op) => op.$method($($arg),*),
            Operator::Delete(op) => op.$method($($arg),*),
        }
    };
}

impl Operator {
    /// Build the operator tree for a physical plan.
    pub fn build(plan: &PhysicalPlan) -> Operator {
        match plan {
            PhysicalPlan::SeqScan {
                table,
                predicate,
                with_rid,
            } => Operator::SeqScan(SeqScanOp::new(
                Arc::clone(table),
                predicate.clone(),
                *with_rid,
            )),
            PhysicalPlan::ParallelSeqScan {
                table,
                predicate,
                degree,
            } => Operator::ParallelSeqScan(ParallelSeqScanOp::new(
                Arc::clone(table),
                predicate.clone(),
                *degree,
            )),
            PhysicalPlan::IndexScan {
                table,
                index,
                lo,
                hi,
                direction,
                predicate,
                with_rid,
            } => Operator::IndexScan(IndexScanOp::new(
                Arc::clone(table),
                Arc::clone(index),
                lo.clone(),
                hi.clone(),
                *direction,
                predicate.clone(),
                *with_rid,
            )),
            PhysicalPlan::IndexOnlyScan {
                table,
                index,
                lo,
                hi,
                direction,
                predicate,
            } => Operator::IndexOnlyScan(IndexOnlyScanOp::new(
                Arc::clone(table),
                Arc::clone(index),
                lo.clone(),
                hi.clone(),
                *direction,
                predicate.clone(),
            )),
            PhysicalPlan::CountStar { table } => {
                Operator::CountStar(CountStarOp::new(Arc::clone(table)))
            }
            PhysicalPlan::IndexEdge { table, index, max } => {
                Operator::IndexEdge(IndexEdgeOp::new(Arc::clone(table), Arc::clone(index), *max))
            }
            PhysicalPlan::Filter { input, predicate } => Operator::Filter(FilterOp::new(
                Box::new(Operator::build(input)),
                predicate.clone(),
            )),
            PhysicalPlan::Project { input, exprs } => Operator::Project(ProjectOp::new(
                Box::new(Operator::build(input)),
                exprs.clone(),
            )),
            PhysicalPlan::Sort { input, keys } => {
                Operator::Sort(SortOp::new(Box::new(Operator::build(input)), keys.clone()))
            }
            PhysicalPlan::TopN {
                input,
                keys,
                limit,
                offset,
            } => Operator::TopN(TopNOp::new(
                Box::new(Operator::build(input)),
                keys.clone(),
                *limit,
                *offset,
            )),
            PhysicalPlan::Limit {
                input,
                limit,
                offset,
            } => Operator::Limit(LimitOp::new(
                Box::new(Operator::build(input)),
                *limit,
                *offset,
            )),
            PhysicalPlan::Distinct { input } => {
                Operator::Distinct(DistinctOp::new(Box::new(Operator::build(input))))
            }
            PhysicalPlan::HashAggregate {
                input,
                groups,
                aggregates,
            } => Operator::HashAggregate(HashAggregateOp::new(
                Box::new(Operator::build(input)),
                groups.clone(),
                aggregates.clone(),
            )),
            PhysicalPlan::SortAggregate {
                input,
                groups,
                aggregates,
            } => Operator::SortAggregate(SortAggregateOp::new(
                Box::new(Operator::build(input)),
                groups.clone(),
                aggregates.clone(),
            )),
            PhysicalPlan::HashJoin {
                left,
                right,
                kind,
                left_keys,
                right_keys,
                build_left,
                residual,
                right_width,
            } => Operator::HashJoin(HashJoinOp::new(
                Box::new(Operator::build(left)),
                Box::new(Operator::build(right)),
                *kind,
                left_keys.clone(),
                right_keys.clone(),
                *build_left,
                residual.clone(),
                *right_width,
            )),
            PhysicalPlan::SortMergeJoin {
                left,
                right,
                kind,
                left_keys,
                right_keys,
                residual,
                right_width,
            } => Operator::SortMergeJoin(SortMergeJoinOp::new(
                Box::new(Operator::build(left)),
                Box::new(Operator::build(right)),
                *kind,
                left_keys.clone(),
                right_keys.clone(),
                residual.clone(),
                *right_width,
            )),
            PhysicalPlan::IndexNestedLoopJoin {
                outer,
                inner_table,
                inner_index,
                inner_predicate,
                outer_keys,
                kind,
                residual,
            } => Operator::IndexNestedLoopJoin(IndexNestedLoopJoinOp::new(
                Box::new(Operator::build(outer)),
                Arc::clone(inner_table),
                Arc::clone(inner_index),
                inner_predicate.clone(),
                outer_keys.clone(),
                *kind,
                residual.clone(),
            )),
            PhysicalPlan::BlockNestedLoopJoin {
                left,
                right,
                kind,
                predicate,
                right_width,
            } => Operator::BlockNestedLoopJoin(BlockNestedLoopJoinOp::new(
                Box::new(Operator::build(left)),
                Box::new(Operator::build(right)),
                *kind,
                predicate.clone(),
                *right_width,
            )),
            PhysicalPlan::CrossJoin { left, right } => Operator::CrossJoin(CrossJoinOp::new(
                Box::new(Operator::build(left)),
                Box::new(Operator::build(right)),
            )),
            PhysicalPlan::SetOp {
                left,
                right,
                op,
                all,
                hashed,
            } => Operator::SetOp(SetOpOp::new(
                Box::new(Operator::build(left)),
                Box::new(Operator::build(right)),
                *op,
                *all,
                *hashed,
            )),
            PhysicalPlan::Values { rows } => Operator::Values(ValuesOp::new(rows.clone())),
            PhysicalPlan::Insert {
                table,
                columns,
                input,
            } => Operator::Insert(InsertOp::new(
                Arc::clone(table),
                columns.clone(),
                Box::new(Operator::build(input)),
            )),
            PhysicalPlan::Update {
                table,
                assignments,
                input,
            } => Operator::Update(UpdateOp::new(
                Arc::clone(table),
                assignments.clone(),
                Box::new(Operator::build(input)),
            )),
            PhysicalPlan::Delete { table, input } => Operator::Delete(DeleteOp::new(
                Arc::clone(table),
                Box::new(Operator::build(input)),
            )),
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        dispatch!(self, open, ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        dispatch!(self, next, ctx)
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        dispatch!(self, close, ctx)
    }

    /// DML operators report how many rows they touched.
    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Operator::Insert(op) => Some(op.affected()),
            Operator::Update(op) => Some(op.affected()),
            Operator::Delete(op) => Some(op.affected()),
            _ => None,
        }
    }
}
