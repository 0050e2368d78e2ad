use std::{
    cmp::Ordering,
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use log::debug;

use crate::{
    error::GraniteError,
    exec::operator::{ExecContext, Operator},
    io::{Decodeable, Encodeable, GraniteFile, GraniteReader},
    storage::Row,
    types::GraniteResult,
};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sort-key comparison over output-layout column positions; NULL
/// sorts first on ascending keys.
pub fn compare_rows(keys: &[(usize, bool)], a: &Row, b: &Row) -> Ordering {
    for (column, descending) in keys {
        let ordering = a.get_cell(*column).cmp(b.get_cell(*column));
        let ordering = if *descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// One spilled run: sorted rows, length-prefixed on disk.
struct Run {
    path: PathBuf,
    file: GraniteFile,
    offset: u64,
    size: u64,
}

impl Run {
    fn spill(ctx: &ExecContext, rows: &[Row]) -> Result<Run, GraniteError> {
        let id = RUN_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        let path = ctx
            .db
            .tmp_dir()
            .join(format!("sort_{}_{}.run", ctx.tx.get_id(), id));
        let file = GraniteFile::create(&path)?;

        let mut buf = Vec::new();
        for row in rows {
            let payload = row.encode();
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&payload);
        }
        file.append(&buf)?;
        let size = file.get_size()?;

        debug!("spilled sort run of {} rows to {:?}", rows.len(), path);
        Ok(Run {
            path,
            file,
            offset: 0,
            size,
        })
    }

    fn next(&mut self) -> Result<Option<Row>, GraniteError> {
        if self.offset >= self.size {
            return Ok(None);
        }
        let len_bytes = self.file.read_at(self.offset, 4)?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let payload = self.file.read_at(self.offset + 4, len as usize)?;
        self.offset += 4 + len as u64;

        let mut reader = GraniteReader::new(&payload);
        Ok(Some(Row::decode_from(&mut reader)?))
    }
}

/// Merges spilled runs plus one in-memory tail.
struct MergeState {
    runs: Vec<Run>,
    heads: Vec<Option<Row>>,
    memory: Vec<Row>,
    memory_pos: usize,
}

/// Full sort with external merge: rows accumulate up to the memory
/// budget, overflow is sorted and spilled as runs, and the output
/// phase merges all runs with the in-memory remainder.
pub struct SortOp {
    input: Box<Operator>,
    keys: Vec<(usize, bool)>,
    merge: Option<MergeState>,
}

impl SortOp {
    pub fn new(input: Box<Operator>, keys: Vec<(usize, bool)>) -> Self {
        Self {
            input,
            keys,
            merge: None,
        }
    }

    pub fn open(&mut self, ctx: &ExecContext) -> GraniteResult {
        self.input.open(ctx)?;

        let budget = ctx.db.get_config().operator_memory_budget;
        let keys = self.keys.clone();

        let mut runs: Vec<Run> = Vec::new();
        let mut memory: Vec<Row> = Vec::new();
        let mut memory_bytes = 0usize;

        while let Some(row) = self.input.next(ctx)? {
            ctx.check_cancelled()?;
            memory_bytes += row.size_hint();
            memory.push(row);

            if memory_bytes > budget {
                memory.sort_by(|a, b| compare_rows(&keys, a, b));
                runs.push(Run::spill(ctx, &memory)?);
                memory.clear();
                memory_bytes = 0;
            }
        }

        memory.sort_by(|a, b| compare_rows(&keys, a, b));

        let mut heads = Vec::with_capacity(runs.len());
        for run in runs.iter_mut() {
            heads.push(run.next()?);
        }

        self.merge = Some(MergeState {
            runs,
            heads,
            memory,
            memory_pos: 0,
        });
        Ok(())
    }

    pub fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>, GraniteError> {
        let merge = match self.merge.as_mut() {
            Some(merge) => merge,
            None => return Err(GraniteError::internal("sort used before open")),
        };

        // smallest among the run heads and the in-memory cursor
        let mut best_run: Option<usize> = None;
        for i in 0..merge.heads.len() {
            if merge.heads[i].is_none() {
                continue;
            }
            let better = match best_run {
                None => true,
                Some(current) => {
                    let candidate = merge.heads[i].as_ref().unwrap();
                    let incumbent = merge.heads[current].as_ref().unwrap();
                    compare_rows(&self.keys, candidate, incumbent) == Ordering::Less
                }
            };
            if better {
                best_run = Some(i);
            }
        }

        let take_memory = match (best_run, merge.memory.get(merge.memory_pos)) {
            (None, Some(_)) => true,
            (Some(run), Some(mem_row)) => {
                let run_row = merge.heads[run].as_ref().unwrap();
                compare_rows(&self.keys, mem_row, run_row) != Ordering::Greater
            }
            _ => false,
        };

        if take_memory {
            let row = merge.memory[merge.memory_pos].clone();
            merge.memory_pos += 1;
            return Ok(Some(row));
        }

        match best_run {
            None => Ok(None),
            Some(i) => {
                let row = merge.heads[i].take().unwrap();
                merge.heads[i] = merge.runs[i].next()?;
                Ok(Some(row))
            }
        }
    }

    pub fn close(&mut self, ctx: &ExecContext) -> GraniteResult {
        if let Some(merge) = self.merge.take() {
            for run in merge.runs {
                let _ = fs::remove_file(&run.path);
            }
        }
        self.input.close(ctx)
    }
}
