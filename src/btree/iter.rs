use std::{cmp::Ordering, ops::Bound, sync::Arc};

use crate::{
    btree::{
        file::{BTreeFile, ScanDirection},
        page::BTreePage,
        page_id::{PageCategory, PageId},
    },
    database::Database,
    error::GraniteError,
    storage::{Cell, Row},
    utils::HandyRwLock,
};

enum CursorState {
    NotStarted,
    Running {
        leaf_index: u32,
        /// Key of the last emitted row. The cursor re-locates it in
        /// the leaf on every step, so concurrent slot shifts (and, via
        /// re-seek, merges and splits) cannot skip or repeat rows.
        last_key: Vec<Cell>,
    },
    Done,
}

/// A lazy range scan over one tree: holds a (leaf page id, position)
/// cursor and advances on `next()`. Latches exactly one leaf at a
/// time; restartable because it can always re-seek from its last key.
/// Owns its handles, so operators can hold it across calls.
pub struct TreeCursor {
    tree: Arc<BTreeFile>,
    db: Arc<Database>,
    lo: Bound<Vec<Cell>>,
    hi: Bound<Vec<Cell>>,
    direction: ScanDirection,
    state: CursorState,
}

impl TreeCursor {
    pub fn new(
        tree: Arc<BTreeFile>,
        db: Arc<Database>,
        lo: Bound<Vec<Cell>>,
        hi: Bound<Vec<Cell>>,
        direction: ScanDirection,
    ) -> Self {
        Self {
            tree,
            db,
            lo,
            hi,
            direction,
            state: CursorState::NotStarted,
        }
    }

    /// Whole-tree scan.
    pub fn full(tree: Arc<BTreeFile>, db: Arc<Database>, direction: ScanDirection) -> Self {
        Self::new(tree, db, Bound::Unbounded, Bound::Unbounded, direction)
    }

    fn leaf_pid(&self, index: u32) -> PageId {
        PageId::new(PageCategory::Leaf, self.tree.get_file_id(), index)
    }

    /// Compare a stored key against a bound tuple, prefix-wise: only
    /// the bound's width participates, so a bound of `[5]` treats
    /// every `[5, ...]` key as equal. This is what makes
    /// compound-index prefix scans include all extensions of the
    /// prefix.
    fn cmp_prefix(&self, key: &[Cell], bound: &[Cell]) -> Ordering {
        let width = bound.len().min(key.len());
        self.tree.get_comparator().compare(&key[..width], bound)
    }

    /// Whether `key` is inside the bound the scan runs toward.
    fn within_limit(&self, key: &[Cell]) -> bool {
        match self.direction {
            ScanDirection::Forward => match &self.hi {
                Bound::Unbounded => true,
                Bound::Included(hi) => self.cmp_prefix(key, hi) != Ordering::Greater,
                Bound::Excluded(hi) => self.cmp_prefix(key, hi) == Ordering::Less,
            },
            ScanDirection::Backward => match &self.lo {
                Bound::Unbounded => true,
                Bound::Included(lo) => self.cmp_prefix(key, lo) != Ordering::Less,
                Bound::Excluded(lo) => self.cmp_prefix(key, lo) == Ordering::Greater,
            },
        }
    }

    /// First candidate position, honoring the start bound.
    fn start(&mut self) -> Result<Option<(Vec<Cell>, Row)>, GraniteError> {
        let comparator = self.tree.get_comparator();

        let (start_bound, edge) = match self.direction {
            ScanDirection::Forward => (self.lo.clone(), ScanDirection::Forward),
            ScanDirection::Backward => (self.hi.clone(), ScanDirection::Backward),
        };

        let mut pid = match &start_bound {
            Bound::Unbounded => self.tree.edge_leaf(&self.db, edge)?,
            Bound::Included(key) | Bound::Excluded(key) => self.tree.find_leaf(&self.db, key)?,
        };

        loop {
            let pod = self.tree.fetch_leaf(&self.db, &pid)?;
            let leaf = pod.rl();

            let candidate = match self.direction {
                ScanDirection::Forward => {
                    let first_slot = match &start_bound {
                        Bound::Unbounded => 0,
                        Bound::Included(key) => match leaf.locate(key) {
                            Ok(slot) => slot,
                            Err(slot) => slot,
                        },
                        Bound::Excluded(key) => match leaf.locate(key) {
                            Ok(slot) => slot + 1,
                            Err(slot) => slot,
                        },
                    };
                    if first_slot < leaf.entry_count() {
                        Some(first_slot)
                    } else {
                        None
                    }
                }
                ScanDirection::Backward => {
                    let mut past_slot = match &start_bound {
                        Bound::Unbounded => leaf.entry_count(),
                        Bound::Included(key) | Bound::Excluded(key) => match leaf.locate(key) {
                            Ok(slot) => slot,
                            Err(slot) => slot,
                        },
                    };
                    // an Included bound admits every key extending it
                    // as a prefix; walk past them (chasing the chain
                    // when they spill into the next leaf)
                    if let Bound::Included(key) = &start_bound {
                        while past_slot < leaf.entry_count()
                            && self.cmp_prefix(&leaf.key_at(past_slot), key) != Ordering::Greater
                        {
                            past_slot += 1;
                        }
                        if past_slot == leaf.entry_count() {
                            if let Some(right) = leaf.get_right_sibling() {
                                let right_pid = self.leaf_pid(right);
                                let right_pod = self.tree.fetch_leaf(&self.db, &right_pid)?;
                                let right_leaf = right_pod.rl();
                                if right_leaf
                                    .first_key()
                                    .map_or(false, |k| self.cmp_prefix(&k, key) != Ordering::Greater)
                                {
                                    drop(right_leaf);
                                    drop(leaf);
                                    pid = right_pid;
                                    continue;
                                }
                            }
                        }
                    }
                    if past_slot > 0 {
                        Some(past_slot - 1)
                    } else {
                        None
                    }
                }
            };

            match candidate {
                Some(slot) => {
                    let key = leaf.key_at(slot);

                    // the descent hint can be one leaf off when a
                    // split raced us; chase the chain once
                    if self.direction == ScanDirection::Forward {
                        if let (Bound::Included(start) | Bound::Excluded(start), Some(right)) =
                            (&start_bound, leaf.get_right_sibling())
                        {
                            let last = leaf.last_key().unwrap();
                            if comparator.compare(start, &last) == Ordering::Greater {
                                pid = self.leaf_pid(right);
                                continue;
                            }
                        }
                    }

                    if !self.within_limit(&key) {
                        self.state = CursorState::Done;
                        return Ok(None);
                    }
                    let row = leaf.get_row(slot).clone();
                    self.state = CursorState::Running {
                        leaf_index: leaf.get_pid().page_index,
                        last_key: key.clone(),
                    };
                    return Ok(Some((key, row)));
                }
                None => {
                    // empty side of the chain; move along it
                    let next = match self.direction {
                        ScanDirection::Forward => leaf.get_right_sibling(),
                        ScanDirection::Backward => leaf.get_left_sibling(),
                    };
                    match next {
                        Some(index) => {
                            pid = self.leaf_pid(index);
                            continue;
                        }
                        None => {
                            self.state = CursorState::Done;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Advance past `last_key` inside the chain starting at
    /// `leaf_index`.
    fn step(
        &mut self,
        leaf_index: u32,
        last_key: Vec<Cell>,
    ) -> Result<Option<(Vec<Cell>, Row)>, GraniteError> {
        let mut pid = self.leaf_pid(leaf_index);

        loop {
            let pod = match self.tree.fetch_leaf(&self.db, &pid) {
                Ok(pod) => pod,
                // the leaf was merged away or recycled; restart from
                // the root using the last key
                Err(_) => return self.reseek(last_key),
            };
            let leaf = pod.rl();

            // the page may have been recycled for a different key
            // range since the previous step
            if leaf.entry_count() > 0 {
                let comparator = self.tree.get_comparator();
                let first = leaf.first_key().unwrap();
                let last = leaf.last_key().unwrap();
                let below = comparator.compare(&last_key, &first) == Ordering::Less;
                let above = comparator.compare(&last_key, &last) == Ordering::Greater;
                let stale = match self.direction {
                    ScanDirection::Forward => below && leaf.get_left_sibling().is_some(),
                    ScanDirection::Backward => above && leaf.get_right_sibling().is_some(),
                };
                if stale {
                    drop(leaf);
                    return self.reseek(last_key);
                }
            }

            let candidate = match self.direction {
                ScanDirection::Forward => {
                    let slot = match leaf.locate(&last_key) {
                        Ok(slot) => slot + 1,
                        Err(slot) => slot,
                    };
                    if slot < leaf.entry_count() {
                        Some(slot)
                    } else {
                        None
                    }
                }
                ScanDirection::Backward => {
                    let slot = match leaf.locate(&last_key) {
                        Ok(slot) => slot,
                        Err(slot) => slot,
                    };
                    if slot > 0 {
                        Some(slot - 1)
                    } else {
                        None
                    }
                }
            };

            match candidate {
                Some(slot) => {
                    let key = leaf.key_at(slot);
                    if !self.within_limit(&key) {
                        self.state = CursorState::Done;
                        return Ok(None);
                    }
                    let row = leaf.get_row(slot).clone();
                    self.state = CursorState::Running {
                        leaf_index: leaf.get_pid().page_index,
                        last_key: key.clone(),
                    };
                    return Ok(Some((key, row)));
                }
                None => {
                    let next = match self.direction {
                        ScanDirection::Forward => leaf.get_right_sibling(),
                        ScanDirection::Backward => leaf.get_left_sibling(),
                    };
                    match next {
                        Some(index) => {
                            pid = self.leaf_pid(index);
                            continue;
                        }
                        None => {
                            self.state = CursorState::Done;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Restart the scan from the root, positioned just past the last
    /// emitted key.
    fn reseek(&mut self, last_key: Vec<Cell>) -> Result<Option<(Vec<Cell>, Row)>, GraniteError> {
        match self.direction {
            ScanDirection::Forward => self.lo = Bound::Excluded(last_key),
            ScanDirection::Backward => self.hi = Bound::Excluded(last_key),
        }
        self.state = CursorState::NotStarted;
        self.start()
    }

    /// The next (key, row) in scan order, or None at the end of the
    /// range.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<Cell>, Row)>, GraniteError> {
        match std::mem::replace(&mut self.state, CursorState::Done) {
            CursorState::NotStarted => self.start(),
            CursorState::Done => Ok(None),
            CursorState::Running {
                leaf_index,
                last_key,
            } => self.step(leaf_index, last_key),
        }
    }

    pub fn next_row(&mut self) -> Result<Option<Row>, GraniteError> {
        Ok(self.next_entry()?.map(|(_, row)| row))
    }

    /// Drain the cursor. Test and small-result helper.
    pub fn collect_rows(&mut self) -> Result<Vec<Row>, GraniteError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }
}
