use log::debug;

use crate::{
    btree::{
        file::BTreeFile,
        page::{BTreePage, InternalPage, LeafPage},
        page_id::{PageCategory, PageId},
    },
    database::Database,
    error::GraniteError,
    io::Encodeable,
    storage::{Cell, Row},
    transaction::Transaction,
    types::GraniteResult,
    utils::HandyRwLock,
    wal::{Lsn, RecordKind, StructuralKind, StructuralOp},
};

/// What to do when the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    /// Duplicate keys are an error.
    Strict,
    /// Replace the stored row. Used by recovery redo, which must be
    /// idempotent.
    Replace,
}

impl BTreeFile {
    /// Insert a row, keeping keys in sorted order. The common case
    /// descends with read latches and write-latches only the target
    /// leaf; a leaf that would overflow falls back to the pessimistic
    /// pass, which write-latches the whole path and splits on unwind.
    ///
    /// `lsn` is the WAL record already covering this change; every
    /// page the insert touches is stamped with it.
    pub fn insert(
        &self,
        db: &Database,
        tx: &Transaction,
        row: &Row,
        lsn: Lsn,
    ) -> GraniteResult {
        self.insert_with_mode(db, tx, row, lsn, InsertMode::Strict)
    }

    /// Insert-or-replace by exact key. Recovery redo path.
    pub fn upsert(
        &self,
        db: &Database,
        tx: &Transaction,
        row: &Row,
        lsn: Lsn,
    ) -> GraniteResult {
        self.insert_with_mode(db, tx, row, lsn, InsertMode::Replace)
    }

    fn insert_with_mode(
        &self,
        db: &Database,
        tx: &Transaction,
        row: &Row,
        lsn: Lsn,
        mode: InsertMode,
    ) -> GraniteResult {
        let key = self.key_of(row);

        if self.try_leaf_insert(db, tx, row, &key, lsn, mode)? {
            return Ok(());
        }

        // the leaf is full: take the structural latch and redo the
        // descent holding write latches the whole way down
        let _structural = self.structural.lock().unwrap();

        let root = self.get_root_pid();
        if let Some((separator, right)) = self.insert_descend(db, tx, &root, row, &key, lsn, mode)? {
            self.grow_root(db, tx, root, separator, right)?;
        }
        Ok(())
    }

    /// Optimistic pass. Returns false when the leaf needs a split.
    fn try_leaf_insert(
        &self,
        db: &Database,
        tx: &Transaction,
        row: &Row,
        key: &[Cell],
        lsn: Lsn,
        mode: InsertMode,
    ) -> Result<bool, GraniteError> {
        let mut pid = self.find_leaf(db, key)?;

        loop {
            let pod = self.fetch_leaf(db, &pid)?;
            let mut leaf = pod.wl();

            // a concurrent split may have moved the key range right
            // between the descent and this latch; chase the chain
            if let (Some(last), Some(right)) = (leaf.last_key(), leaf.get_right_sibling()) {
                if self.get_comparator().compare(key, &last) == std::cmp::Ordering::Greater {
                    pid = PageId::new(PageCategory::Leaf, self.get_file_id(), right);
                    continue;
                }
            }

            let slot = match leaf.locate(key) {
                Ok(slot) => {
                    return match mode {
                        InsertMode::Replace => {
                            leaf.replace_at(slot, row.clone());
                            self.mark_page_dirty(db, tx, &mut *leaf, lsn);
                            Ok(true)
                        }
                        InsertMode::Strict => Err(self.duplicate_key_error(key)),
                    };
                }
                Err(slot) => slot,
            };

            if leaf.entry_count() < self.get_order() && leaf.fits_in(row, self.get_page_size()) {
                leaf.insert_at(slot, row.clone());
                self.mark_page_dirty(db, tx, &mut *leaf, lsn);
                self.meta().entry_count += 1;
                return Ok(true);
            }

            return Ok(false);
        }
    }

    fn duplicate_key_error(&self, key: &[Cell]) -> GraniteError {
        if self.is_unique() {
            GraniteError::constraint(&format!(
                "duplicate key {:?} in unique tree {}",
                key,
                self.get_file_id()
            ))
        } else {
            GraniteError::internal(&format!(
                "exact duplicate of full key {:?} in tree {}",
                key,
                self.get_file_id()
            ))
        }
    }

    /// Pessimistic descent. Returns the (separator, new right node)
    /// pair when this subtree's root split and the parent must route
    /// it.
    fn insert_descend(
        &self,
        db: &Database,
        tx: &Transaction,
        pid: &PageId,
        row: &Row,
        key: &[Cell],
        lsn: Lsn,
        mode: InsertMode,
    ) -> Result<Option<(Vec<Cell>, PageId)>, GraniteError> {
        match pid.category {
            PageCategory::Leaf => self.insert_into_leaf(db, tx, pid, row, key, lsn, mode),
            PageCategory::Internal => {
                let pod = self.fetch_internal(db, pid)?;
                let mut node = pod.wl();

                let child_index = node.child_index_for(key);
                let child = node.child_at(child_index);

                let split = self.insert_descend(db, tx, &child, row, key, lsn, mode)?;

                let (separator, right) = match split {
                    None => return Ok(None),
                    Some(parts) => parts,
                };

                node.insert_split(separator, &child, right);
                self.mark_page_dirty(db, tx, &mut *node, lsn);

                if node.key_count() <= self.get_order()
                    && node.serialized_size() <= self.get_page_size()
                {
                    return Ok(None);
                }

                self.split_internal(db, tx, &mut node, lsn).map(Some)
            }
            PageCategory::Header => Err(GraniteError::internal(
                "header page reached during pessimistic descent",
            )),
        }
    }

    fn insert_into_leaf(
        &self,
        db: &Database,
        tx: &Transaction,
        pid: &PageId,
        row: &Row,
        key: &[Cell],
        lsn: Lsn,
        mode: InsertMode,
    ) -> Result<Option<(Vec<Cell>, PageId)>, GraniteError> {
        let pod = self.fetch_leaf(db, pid)?;
        let mut leaf = pod.wl();

        let slot = match leaf.locate(key) {
            Ok(slot) => {
                return match mode {
                    InsertMode::Replace => {
                        leaf.replace_at(slot, row.clone());
                        self.mark_page_dirty(db, tx, &mut *leaf, lsn);
                        Ok(None)
                    }
                    InsertMode::Strict => Err(self.duplicate_key_error(key)),
                };
            }
            Err(slot) => slot,
        };

        leaf.insert_at(slot, row.clone());
        self.mark_page_dirty(db, tx, &mut *leaf, lsn);
        self.meta().entry_count += 1;

        if leaf.entry_count() <= self.get_order()
            && leaf.serialized_size() <= self.get_page_size()
        {
            return Ok(None);
        }

        self.split_leaf(db, tx, &mut leaf, lsn).map(Some)
    }

    /// Split an over-full leaf. The left node keeps the upper median
    /// count, the right node takes the rest; the sibling chain is
    /// relinked and the right node's first key goes up as separator.
    fn split_leaf(
        &self,
        db: &Database,
        tx: &Transaction,
        leaf: &mut LeafPage,
        lsn: Lsn,
    ) -> Result<(Vec<Cell>, PageId), GraniteError> {
        let keep = (leaf.entry_count() + 1) / 2;
        let moved = leaf.split_off(keep);

        let right_pod = self.allocate_leaf(db)?;
        let mut right = right_pod.wl();
        right.extend(moved);

        let right_index = right.get_pid().page_index;
        let old_right = leaf.get_right_sibling();
        right.set_right_sibling(old_right);
        right.set_left_sibling(Some(leaf.get_pid().page_index));
        leaf.set_right_sibling(Some(right_index));

        if let Some(old_right_index) = old_right {
            let old_right_pid =
                PageId::new(PageCategory::Leaf, self.get_file_id(), old_right_index);
            let pod = self.fetch_leaf(db, &old_right_pid)?;
            let mut old_right_leaf = pod.wl();
            old_right_leaf.set_left_sibling(Some(right_index));
            self.mark_page_dirty(db, tx, &mut *old_right_leaf, lsn);
        }

        let separator = right
            .first_key()
            .ok_or_else(|| GraniteError::internal("split produced an empty right leaf"))?;

        let structural_lsn = self.log_structural(
            db,
            tx,
            StructuralKind::SplitLeaf,
            vec![leaf.get_pid().page_index, right_index],
        )?;
        self.mark_page_dirty(db, tx, &mut *leaf, structural_lsn);
        self.mark_page_dirty(db, tx, &mut *right, structural_lsn);

        debug!(
            "split leaf {} -> {} (separator {:?})",
            leaf.get_pid(),
            right.get_pid(),
            separator
        );
        Ok((separator, right.get_pid()))
    }

    /// Split an over-full internal node around its middle key, which
    /// moves up instead of staying in either half.
    fn split_internal(
        &self,
        db: &Database,
        tx: &Transaction,
        node: &mut InternalPage,
        lsn: Lsn,
    ) -> Result<(Vec<Cell>, PageId), GraniteError> {
        let keep = node.key_count() / 2;
        let (promoted, right_keys, right_children) = node.split_off(keep);

        let right_index = self.allocate_index()?;
        let right_pid = PageId::new(PageCategory::Internal, self.get_file_id(), right_index);
        let right_page = InternalPage::from_parts(
            right_pid,
            right_keys,
            right_children,
            self.get_comparator(),
        );
        let right_pod = self.allocate_internal(db, right_page)?;
        let mut right = right_pod.wl();

        let structural_lsn = self.log_structural(
            db,
            tx,
            StructuralKind::SplitInternal,
            vec![node.get_pid().page_index, right_index],
        )?;
        self.mark_page_dirty(db, tx, &mut *node, structural_lsn);
        self.mark_page_dirty(db, tx, &mut *right, structural_lsn);

        debug!("split internal {} -> {}", node.get_pid(), right_pid);
        Ok((promoted, right_pid))
    }

    /// The old root split: the tree grows upward through a new root
    /// routing between the two halves.
    fn grow_root(
        &self,
        db: &Database,
        tx: &Transaction,
        old_root: PageId,
        separator: Vec<Cell>,
        right: PageId,
    ) -> GraniteResult {
        let index = self.allocate_index()?;
        let new_root_pid = PageId::new(PageCategory::Internal, self.get_file_id(), index);
        let new_root = InternalPage::new_root(
            new_root_pid,
            separator,
            old_root,
            right,
            self.get_comparator(),
        );
        let pod = self.allocate_internal(db, new_root)?;

        let structural_lsn =
            self.log_structural(db, tx, StructuralKind::RootGrow, vec![index])?;
        {
            let mut root = pod.wl();
            self.mark_page_dirty(db, tx, &mut *root, structural_lsn);
        }

        let mut meta = self.meta();
        meta.root = new_root_pid;
        meta.height += 1;
        debug!("tree {} grew to height {}", self.get_file_id(), meta.height);
        Ok(())
    }

    pub(crate) fn log_structural(
        &self,
        db: &Database,
        tx: &Transaction,
        kind: StructuralKind,
        pages: Vec<u32>,
    ) -> Result<Lsn, GraniteError> {
        let op = crate::wal::StructuralPayload::Op(StructuralOp {
            file_id: self.get_file_id(),
            kind,
            pages,
        });
        db.mut_log_manager()
            .append(tx.get_id(), RecordKind::StructuralMod, op.encode(), false)
    }
}
