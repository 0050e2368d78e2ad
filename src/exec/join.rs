//! Join algorithms: hash join (Grace partitioning on build overflow),
//! sort-merge join (key ties expand into cross sub-products), index
//! nested loop, block nested loop, and the plain cross join.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    hash::{Hash, Hasher},
    ops::Bound,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

use log::debug;

use crate::{
    btree::{ScanDirection, TreeCursor},
    catalog::{IndexInfo, TableInfo},
    error::{ErrorKind, GraniteError},
    exec::{
        expr::{eval, eval_predicate},
        operator::{ExecContext, Operator},
    },
    io::{Decodeable, Encodeable, GraniteFile, GraniteReader},
    plan::ast::{Expr, JoinKind},
    storage::{Cell, Row},
    types::GraniteResult,
};

static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Join keys with any NULL never match anything.
fn eval_keys(keys: &[Expr], row: &Row) -> Result<Option<Vec<Cell>>, GraniteError> {
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let value = eval(key, row)?;
        if value.is_null() {
            return Ok(None);
        }
        out.push(value);
    }
    Ok(Some(out))
}

fn null_row(width: usize) -> Row {
    Row::new(vec![Cell::Null; width])
}

fn key_hash(key: &[Cell], salt: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    salt.hash(&mut hasher);
    for cell in key {
        cell.hash(&mut hasher);
    }
    hasher.finish()
}

/// Rows spooled to a temp file, length-prefixed, for Grace partitions
/// and block-rescanned inners.
struct RowSpool {
    path: PathBuf,
    file: GraniteFile,
    size: u64,
    count: u64,
}

impl RowSpool {
    fn create(ctx: &ExecContext, label: &str) -> Result<RowSpool, GraniteError> {
        let id = SPOOL_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        let path = ctx
            .db
            .tmp_dir()
            .join(format!("{}_{}_{}.spool", label, ctx.tx.get_id(), id));
        let file = GraniteFile::create(&path)?;
        Ok(RowSpool {
            path,
            file,
            size: 0,
            count: 0,
        })
    }

    fn append(&mut self, row: &Row) -> GraniteResult {
        let payload = row.encode();
        let mut buf = Vec::with_capacity(payload.len() + 4);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        self.file.append(&buf)?;
        self.size += buf.len() as u64;
        self.count += 1;
        Ok(())
    }

    fn reader(&self) -> SpoolReader<'_> {
        SpoolReader {
            spool: self,
            offset: 0,
        }
    }
}

impl Drop for RowSpool {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

struct SpoolReader<'a> {
    spool: &'a RowSpool,
    offset: u64,
}

impl<'a> SpoolReader<'a> {
    fn next(&mut self) -> Result<Option<Row>, GraniteError> {
        if self.offset >= self.spool.size {
            return Ok(None);
        }
        let len_bytes = self.spool.file.read_at(self.offset, 4)?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let payload = self.spool.file.read_at(self.offset + 4, len as usize)?;
        self.offset += 4 + len as u64;
        let mut reader = GraniteReader::new(&payload);
        Ok(Some(Row::decode_from(&mut reader)?))
    }
}

// ----------------------------------------------------------------------
// hash join
// ----------------------------------------------------------------------

const GRACE_PARTITIONS: usize = 16;
const MAX_GRACE_DEPTH: usize = 3;

/// One partition pair awaiting processing.
struct Partition {
    build: RowSpool,
    probe: RowSpool,
    depth: usize,
}

pub struct HashJoinOp {
    left: Box<Operator>,
    right: Box<Operator>,
    kind: JoinKind,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    build_left: bool,
    residual: Option<Expr>,
    right_width: usize,

    /// In-memory table for the current partition (or the whole build
    /// side when it fit).
    table: HashMap<Vec<Cell>, Vec<Row>>,
    /// Probe rows stream either from the child (in-memory mode) or
    /// from partition spools.
    partitions: VecDeque<Partition>,
    current_probe: Option<RowSpool>,
    current_probe_offset: u64,
    in_memory: bool,
    pending: VecDeque<Row>,
    done: bool,
}

impl HashJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<Operator>,
        right: Box<Operator>,
        kind: JoinKind,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        build_left: bool,
        residual: Option<Expr>,
        right_width: usize,
    ) -> Self {
        Self {
            left,
            right,
            kind,
            left_keys,
            right_keys,
            build_left,
            residual,
            right_width,
            table: HashMap::new(),
            partitions: VecDeque::new(),
            current_probe: None,
            current_probe_offset: 0,
            in_memory: true,
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn build_side(&mut self) -> &mut Box<Operator> {
        if self.build_left {
            &mut self.left
        } else {
            &mut self.right
        }
    }

    fn build_keys(&self) -> &[Expr] {
        if self.build_left {
            &self.left_keys
        } else {
            &self.right_keys
        }
    }

    fn probe_keys(&self) -> &[Expr] {
        if self.build_left {
            &self.right_keys
        } else {
            &self.left_keys
        }
    }

    /// Output row for a (probe, match) pair, in left-right order.
    fn concat(&self, probe: &Row, matched: &Row) -> Row {
        if self.build_left {
            matched.concat(probe)
        } else {
            probe.concat(matched)
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        debug_assert!(
            self.kind == JoinKind::Inner || !self.build_left,
            "outer and semi joins build on the inner side"
        );

        self.table.clear();
        self.partitions.clear();
        self.pending.clear();
        self.done = false;
        self.in_memory = true;

        self.left.open(ctx)?;
        self.right.open(ctx)?;

        let budget = ctx.db.get_config().operator_memory_budget;
        let build_keys = self.build_keys().to_vec();

        let mut bytes = 0usize;
        let mut overflow: Option<Vec<RowSpool>> = None;

        loop {
            ctx.check_cancelled()?;
            let row = match self.build_side().next(ctx)? {
                Some(row) => row,
                None => break,
            };
            let key = match eval_keys(&build_keys, &row)? {
                Some(key) => key,
                None => continue,
            };

            match &mut overflow {
                None => {
                    bytes += row.size_hint() + 32;
                    self.table.entry(key).or_insert_with(Vec::new).push(row);

                    if bytes > budget {
                        // the build side outgrew memory: switch to
                        // Grace partitioning, respreading what we have
                        debug!("hash join build side overflowed, partitioning");
                        let mut spools = Vec::with_capacity(GRACE_PARTITIONS);
                        for _ in 0..GRACE_PARTITIONS {
                            spools.push(RowSpool::create(ctx, "hj_build")?);
                        }
                        for (key, rows) in self.table.drain() {
                            let p = key_hash(&key, 0) as usize % GRACE_PARTITIONS;
                            for row in rows {
                                spools[p].append(&row)?;
                            }
                        }
                        overflow = Some(spools);
                        self.in_memory = false;
                    }
                }
                Some(spools) => {
                    let p = key_hash(&key, 0) as usize % GRACE_PARTITIONS;
                    spools[p].append(&row)?;
                }
            }
        }

        if let Some(build_spools) = overflow {
            // partition the probe side the same way
            let mut probe_spools = Vec::with_capacity(GRACE_PARTITIONS);
            for _ in 0..GRACE_PARTITIONS {
                probe_spools.push(RowSpool::create(ctx, "hj_probe")?);
            }
            let probe_keys = self.probe_keys().to_vec();
            let probe_child = if self.build_left {
                &mut self.right
            } else {
                &mut self.left
            };
            loop {
                ctx.check_cancelled()?;
                let row = match (*probe_child).next(ctx)? {
                    Some(row) => row,
                    None => break,
                };
                match eval_keys(&probe_keys, &row)? {
                    Some(key) => {
                        let p = key_hash(&key, 0) as usize % GRACE_PARTITIONS;
                        probe_spools[p].append(&row)?;
                    }
                    None => {
                        // null-keyed probe rows only matter for outer
                        // joins; route them to partition zero
                        if self.kind == JoinKind::Left {
                            probe_spools[0].append(&row)?;
                        }
                    }
                }
            }

            for (build, probe) in build_spools.into_iter().zip(probe_spools) {
                self.partitions.push_back(Partition {
                    build,
                    probe,
                    depth: 1,
                });
            }
            self.advance_partition(ctx)?;
        }

        Ok(())
    }

    /// Load the next partition's build side into memory,
    /// repartitioning with a new salt when it still does not fit.
    fn advance_partition(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.table.clear();
        self.current_probe = None;
        self.current_probe_offset = 0;

        let budget = ctx.db.get_config().operator_memory_budget;
        let build_keys = self.build_keys().to_vec();

        while let Some(partition) = self.partitions.pop_front() {
            if partition.build.count == 0 && self.kind != JoinKind::Left {
                continue;
            }

            if partition.build.size as usize > budget {
                if partition.depth >= MAX_GRACE_DEPTH {
                    return Err(GraniteError::new(
                        ErrorKind::Capacity,
                        "hash join partition exceeds memory budget after repeated partitioning",
                    ));
                }
                // respread with a different salt
                let salt = partition.depth as u64;
                let mut build_spools = Vec::with_capacity(GRACE_PARTITIONS);
                let mut probe_spools = Vec::with_capacity(GRACE_PARTITIONS);
                for _ in 0..GRACE_PARTITIONS {
                    build_spools.push(RowSpool::create(ctx, "hj_build")?);
                    probe_spools.push(RowSpool::create(ctx, "hj_probe")?);
                }

                let mut reader = partition.build.reader();
                while let Some(row) = reader.next()? {
                    if let Some(key) = eval_keys(&build_keys, &row)? {
                        let p = key_hash(&key, salt) as usize % GRACE_PARTITIONS;
                        build_spools[p].append(&row)?;
                    }
                }
                let probe_keys = self.probe_keys().to_vec();
                let mut reader = partition.probe.reader();
                while let Some(row) = reader.next()? {
                    match eval_keys(&probe_keys, &row)? {
                        Some(key) => {
                            let p = key_hash(&key, salt) as usize % GRACE_PARTITIONS;
                            probe_spools[p].append(&row)?;
                        }
                        None => {
                            if self.kind == JoinKind::Left {
                                probe_spools[0].append(&row)?;
                            }
                        }
                    }
                }

                for (build, probe) in build_spools.into_iter().zip(probe_spools) {
                    self.partitions.push_front(Partition {
                        build,
                        probe,
                        depth: partition.depth + 1,
                    });
                }
                continue;
            }

            let mut reader = partition.build.reader();
            while let Some(row) = reader.next()? {
                if let Some(key) = eval_keys(&build_keys, &row)? {
                    self.table.entry(key).or_insert_with(Vec::new).push(row);
                }
            }
            self.current_probe = Some(partition.probe);
            self.current_probe_offset = 0;
            return Ok(());
        }

        self.done = true;
        Ok(())
    }

    fn next_probe_row(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        if self.in_memory {
            let probe_child = if self.build_left {
                &mut self.right
            } else {
                &mut self.left
            };
            return probe_child.next(ctx);
        }

        loop {
            if self.done {
                return Ok(None);
            }
            let (row, new_offset) = match &self.current_probe {
                Some(spool) => {
                    let mut reader = SpoolReader {
                        spool,
                        offset: self.current_probe_offset,
                    };
                    (reader.next()?, reader.offset)
                }
                None => (None, 0),
            };
            match row {
                Some(row) => {
                    self.current_probe_offset = new_offset;
                    return Ok(Some(row));
                }
                None => self.advance_partition(ctx)?,
            }
        }
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            if self.done && !self.in_memory {
                return Ok(None);
            }

            ctx.check_cancelled()?;
            let probe = match self.next_probe_row(ctx)? {
                Some(row) => row,
                None => return Ok(None),
            };

            let probe_keys = self.probe_keys().to_vec();
            let key = eval_keys(&probe_keys, &probe)?;
            let matches: &[Row] = match &key {
                Some(key) => self.table.get(key).map(|v| v.as_slice()).unwrap_or(&[]),
                None => &[],
            };

            let mut matched = false;
            for candidate in matches {
                let combined = self.concat(&probe, candidate);
                if let Some(residual) = &self.residual {
                    if !eval_predicate(residual, &combined)? {
                        continue;
                    }
                }
                matched = true;
                match self.kind {
                    JoinKind::Semi => {
                        self.pending.push_back(probe.clone());
                        break;
                    }
                    _ => self.pending.push_back(combined),
                }
            }

            if !matched && self.kind == JoinKind::Left {
                self.pending
                    .push_back(probe.concat(&null_row(self.right_width)));
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.table.clear();
        self.partitions.clear();
        self.current_probe = None;
        self.pending.clear();
        self.left.close(ctx)?;
        self.right.close(ctx)
    }
}

// ----------------------------------------------------------------------
// sort-merge join
// ----------------------------------------------------------------------

pub struct SortMergeJoinOp {
    left: Box<Operator>,
    right: Box<Operator>,
    kind: JoinKind,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    residual: Option<Expr>,
    right_width: usize,
    output: VecDeque<Row>,
    done: bool,
}

impl SortMergeJoinOp {
    pub fn new(
        left: Box<Operator>,
        right: Box<Operator>,
        kind: JoinKind,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Option<Expr>,
        right_width: usize,
    ) -> Self {
        Self {
            left,
            right,
            kind,
            left_keys,
            right_keys,
            residual,
            right_width,
            output: VecDeque::new(),
            done: false,
        }
    }

    fn drain_sorted(
        child: &mut Operator,
        keys: &[Expr],
        ctx: &ExecContext,
    ) -> Result<Vec<(Option<Vec<Cell>>, Row)>, GraniteError> {
        let mut rows = Vec::new();
        while let Some(row) = child.next(ctx)? {
            ctx.check_cancelled()?;
            let key = eval_keys(keys, &row)?;
            rows.push((key, row));
        }
        // null-keyed rows sort first and never match
        rows.sort_by(|a, b| match (&a.0, &b.0) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        });
        Ok(rows)
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.done = false;

        self.left.open(ctx)?;
        self.right.open(ctx)?;

        let left_rows = Self::drain_sorted(&mut self.left, &self.left_keys.clone(), ctx)?;
        let right_rows = Self::drain_sorted(&mut self.right, &self.right_keys.clone(), ctx)?;

        let mut l = 0;
        let mut r = 0;

        // unmatched null-keyed left rows still surface for LEFT joins
        while l < left_rows.len() && left_rows[l].0.is_none() {
            if self.kind == JoinKind::Left {
                self.output
                    .push_back(left_rows[l].1.concat(&null_row(self.right_width)));
            }
            l += 1;
        }
        while r < right_rows.len() && right_rows[r].0.is_none() {
            r += 1;
        }

        while l < left_rows.len() {
            let left_key = left_rows[l].0.as_ref().unwrap();

            // advance the right side to the left key
            while r < right_rows.len() && right_rows[r].0.as_ref().unwrap() < left_key {
                r += 1;
            }

            let group_matches = r < right_rows.len() && right_rows[r].0.as_ref().unwrap() == left_key;
            if !group_matches {
                if self.kind == JoinKind::Left {
                    self.output
                        .push_back(left_rows[l].1.concat(&null_row(self.right_width)));
                }
                l += 1;
                continue;
            }

            // equal-key groups on both sides expand into their cross
            // product
            let r_group_start = r;
            let mut r_group_end = r;
            while r_group_end < right_rows.len()
                && right_rows[r_group_end].0.as_ref().unwrap() == left_key
            {
                r_group_end += 1;
            }

            let mut l_end = l;
            while l_end < left_rows.len() && left_rows[l_end].0.as_ref().unwrap() == left_key {
                l_end += 1;
            }

            for li in l..l_end {
                let mut matched = false;
                for ri in r_group_start..r_group_end {
                    let combined = left_rows[li].1.concat(&right_rows[ri].1);
                    if let Some(residual) = &self.residual {
                        if !eval_predicate(residual, &combined)? {
                            continue;
                        }
                    }
                    matched = true;
                    match self.kind {
                        JoinKind::Semi => {
                            self.output.push_back(left_rows[li].1.clone());
                            break;
                        }
                        _ => self.output.push_back(combined),
                    }
                }
                if !matched && self.kind == JoinKind::Left {
                    self.output
                        .push_back(left_rows[li].1.concat(&null_row(self.right_width)));
                }
            }

            l = l_end;
            r = r_group_end;
        }

        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        Ok(self.output.pop_front())
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.left.close(ctx)?;
        self.right.close(ctx)
    }
}

// ----------------------------------------------------------------------
// index nested loop join
// ----------------------------------------------------------------------

/// For every outer row, probe the inner relation through an index on
/// its join column.
pub struct IndexNestedLoopJoinOp {
    outer: Box<Operator>,
    inner_table: Arc<TableInfo>,
    inner_index: Arc<IndexInfo>,
    inner_predicate: Option<Expr>,
    outer_keys: Vec<Expr>,
    kind: JoinKind,
    residual: Option<Expr>,
    pending: VecDeque<Row>,
}

impl IndexNestedLoopJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outer: Box<Operator>,
        inner_table: Arc<TableInfo>,
        inner_index: Arc<IndexInfo>,
        inner_predicate: Option<Expr>,
        outer_keys: Vec<Expr>,
        kind: JoinKind,
        residual: Option<Expr>,
    ) -> Self {
        Self {
            outer,
            inner_table,
            inner_index,
            inner_predicate,
            outer_keys,
            kind,
            residual,
            pending: VecDeque::new(),
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        ctx.lock_table_shared(self.inner_table.id)?;
        self.pending.clear();
        self.outer.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }

            ctx.check_cancelled()?;
            let outer_row = match self.outer.next(ctx)? {
                Some(row) => row,
                None => return Ok(None),
            };

            let key = match eval_keys(&self.outer_keys, &outer_row)? {
                Some(key) => key,
                None => {
                    if self.kind == JoinKind::Left {
                        let width = self.inner_table.get_schema().width();
                        self.pending.push_back(outer_row.concat(&null_row(width)));
                    }
                    continue;
                }
            };

            let mut cursor = TreeCursor::new(
                Arc::clone(&self.inner_index.tree),
                Arc::clone(&ctx.db),
                Bound::Included(key.clone()),
                Bound::Included(key),
                ScanDirection::Forward,
            );

            let mut matched = false;
            while let Some(entry) = cursor.next_row()? {
                ctx.note_row();
                let rid = IndexInfo::rid_of(&entry);
                let inner_row = match self.inner_table.fetch(&ctx.db, rid)? {
                    Some(row) => row,
                    None => continue,
                };
                if let Some(predicate) = &self.inner_predicate {
                    if !eval_predicate(predicate, &inner_row)? {
                        continue;
                    }
                }

                let combined = outer_row.concat(&inner_row);
                if let Some(residual) = &self.residual {
                    if !eval_predicate(residual, &combined)? {
                        continue;
                    }
                }

                ctx.lock_row_shared(self.inner_table.id, rid)?;
                matched = true;
                match self.kind {
                    JoinKind::Semi => {
                        self.pending.push_back(outer_row.clone());
                        break;
                    }
                    _ => self.pending.push_back(combined),
                }
            }

            if !matched && self.kind == JoinKind::Left {
                let width = self.inner_table.get_schema().width();
                self.pending.push_back(outer_row.concat(&null_row(width)));
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.pending.clear();
        self.outer.close(ctx)
    }
}

// ----------------------------------------------------------------------
// block nested loop join
// ----------------------------------------------------------------------

const BLOCK_ROWS: usize = 1024;

/// The fallback join: the inner side is spooled once, the outer side
/// processed in blocks, the inner rescanned per block.
pub struct BlockNestedLoopJoinOp {
    left: Box<Operator>,
    right: Box<Operator>,
    kind: JoinKind,
    predicate: Option<Expr>,
    right_width: usize,
    inner: Option<RowSpool>,
    output: VecDeque<Row>,
    left_done: bool,
}

impl BlockNestedLoopJoinOp {
    pub fn new(
        left: Box<Operator>,
        right: Box<Operator>,
        kind: JoinKind,
        predicate: Option<Expr>,
        right_width: usize,
    ) -> Self {
        Self {
            left,
            right,
            kind,
            predicate,
            right_width,
            inner: None,
            output: VecDeque::new(),
            left_done: false,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.output.clear();
        self.left_done = false;

        self.left.open(ctx)?;
        self.right.open(ctx)?;

        let mut spool = RowSpool::create(ctx, "bnl_inner")?;
        while let Some(row) = self.right.next(ctx)? {
            ctx.check_cancelled()?;
            spool.append(&row)?;
        }
        self.inner = Some(spool);
        Ok(())
    }

    fn fill_block(&mut self, ctx: &ExecContext) -> GraniteResult {
        let mut block = Vec::with_capacity(BLOCK_ROWS);
        while block.len() < BLOCK_ROWS {
            match self.left.next(ctx)? {
                Some(row) => block.push(row),
                None => {
                    self.left_done = true;
                    break;
                }
            }
        }
        if block.is_empty() {
            return Ok(());
        }

        let inner = self.inner.as_ref().unwrap();
        let mut matched = vec![false; block.len()];

        let mut reader = inner.reader();
        while let Some(inner_row) = reader.next()? {
            ctx.check_cancelled()?;
            for (i, outer_row) in block.iter().enumerate() {
                let combined = outer_row.concat(&inner_row);
                let hit = match &self.predicate {
                    Some(predicate) => eval_predicate(predicate, &combined)?,
                    None => true,
                };
                if !hit {
                    continue;
                }
                matched[i] = true;
                match self.kind {
                    JoinKind::Semi => {}
                    _ => self.output.push_back(combined),
                }
            }
        }

        for (i, outer_row) in block.iter().enumerate() {
            match self.kind {
                JoinKind::Left if !matched[i] => {
                    self.output
                        .push_back(outer_row.concat(&null_row(self.right_width)));
                }
                JoinKind::Semi if matched[i] => {
                    self.output.push_back(outer_row.clone());
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        loop {
            if let Some(row) = self.output.pop_front() {
                return Ok(Some(row));
            }
            if self.left_done {
                return Ok(None);
            }
            self.fill_block(ctx)?;
            if self.output.is_empty() && self.left_done {
                return Ok(None);
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.inner = None;
        self.output.clear();
        self.left.close(ctx)?;
        self.right.close(ctx)
    }
}

/// Cartesian product, expressed through the block loop without a
/// predicate.
pub struct CrossJoinOp {
    inner: BlockNestedLoopJoinOp,
}

impl CrossJoinOp {
    pub fn new(left: Box<Operator>, right: Box<Operator>) -> Self {
        Self {
            inner: BlockNestedLoopJoinOp::new(left, right, JoinKind::Inner, None, 0),
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.inner.open(ctx)
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        self.inner.next(ctx)
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.inner.close(ctx)
    }
}
