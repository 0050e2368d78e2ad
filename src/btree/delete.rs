use log::debug;

use crate::{
    btree::{
        file::BTreeFile,
        page::{BTreePage, InternalPage},
        page_id::{PageCategory, PageId},
    },
    database::Database,
    error::GraniteError,
    storage::Cell,
    transaction::Transaction,
    utils::HandyRwLock,
    wal::{Lsn, StructuralKind},
};

enum DeleteAttempt {
    Removed,
    NotFound,
    /// Removing the entry would leave the leaf under-full; the
    /// pessimistic pass has to rebalance.
    NeedsRebalance,
}

impl BTreeFile {
    /// Delete by exact key. Returns whether the key existed. Like
    /// insert, the common case touches only the target leaf; a leaf
    /// that would underflow goes through the pessimistic pass, which
    /// redistributes from a sibling or merges on unwind.
    pub fn delete(
        &self,
        db: &Database,
        tx: &Transaction,
        key: &[Cell],
        lsn: Lsn,
    ) -> Result<bool, GraniteError> {
        match self.try_leaf_delete(db, tx, key, lsn)? {
            DeleteAttempt::Removed => return Ok(true),
            DeleteAttempt::NotFound => return Ok(false),
            DeleteAttempt::NeedsRebalance => {}
        }

        let _structural = self.structural.lock().unwrap();

        let root = self.get_root_pid();
        let (removed, _) = self.delete_descend(db, tx, &root, key, lsn, true)?;
        self.collapse_root(db, tx)?;
        Ok(removed)
    }

    fn try_leaf_delete(
        &self,
        db: &Database,
        tx: &Transaction,
        key: &[Cell],
        lsn: Lsn,
    ) -> Result<DeleteAttempt, GraniteError> {
        let mut pid = self.find_leaf(db, key)?;

        loop {
            let pod = self.fetch_leaf(db, &pid)?;
            let mut leaf = pod.wl();

            if let (Some(last), Some(right)) = (leaf.last_key(), leaf.get_right_sibling()) {
                if self.get_comparator().compare(key, &last) == std::cmp::Ordering::Greater {
                    pid = PageId::new(PageCategory::Leaf, self.get_file_id(), right);
                    continue;
                }
            }

            let slot = match leaf.locate(key) {
                Ok(slot) => slot,
                Err(_) => return Ok(DeleteAttempt::NotFound),
            };

            let is_root = self.get_root_pid() == leaf.get_pid();
            if !is_root && leaf.entry_count() <= self.min_entries() {
                return Ok(DeleteAttempt::NeedsRebalance);
            }

            leaf.remove_at(slot);
            self.mark_page_dirty(db, tx, &mut *leaf, lsn);
            self.meta().entry_count -= 1;
            return Ok(DeleteAttempt::Removed);
        }
    }

    /// Pessimistic descent with write latches down the path. Returns
    /// (removed, this node underflowed).
    fn delete_descend(
        &self,
        db: &Database,
        tx: &Transaction,
        pid: &PageId,
        key: &[Cell],
        lsn: Lsn,
        is_root: bool,
    ) -> Result<(bool, bool), GraniteError> {
        match pid.category {
            PageCategory::Leaf => {
                let pod = self.fetch_leaf(db, pid)?;
                let mut leaf = pod.wl();
                let slot = match leaf.locate(key) {
                    Ok(slot) => slot,
                    Err(_) => return Ok((false, false)),
                };
                leaf.remove_at(slot);
                self.mark_page_dirty(db, tx, &mut *leaf, lsn);
                self.meta().entry_count -= 1;
                let underflow = !is_root && leaf.entry_count() < self.min_entries();
                Ok((true, underflow))
            }
            PageCategory::Internal => {
                let pod = self.fetch_internal(db, pid)?;
                let mut node = pod.wl();

                let child_index = node.child_index_for(key);
                let child = node.child_at(child_index);

                let (removed, child_underflow) =
                    self.delete_descend(db, tx, &child, key, lsn, false)?;

                if child_underflow {
                    self.fix_child_underflow(db, tx, &mut node, child_index, lsn)?;
                }

                let underflow = !is_root && node.key_count() < self.min_entries();
                Ok((removed, underflow))
            }
            PageCategory::Header => Err(GraniteError::internal(
                "header page reached during pessimistic descent",
            )),
        }
    }

    /// An internal root left with a single child collapses into it;
    /// an empty leaf root just stays, representing the empty tree.
    fn collapse_root(&self, db: &Database, tx: &Transaction) -> Result<(), GraniteError> {
        let root = self.get_root_pid();
        if root.category != PageCategory::Internal {
            return Ok(());
        }

        let only_child = {
            let pod = self.fetch_internal(db, &root)?;
            let node = pod.rl();
            if node.key_count() > 0 {
                return Ok(());
            }
            node.child_at(0)
        };

        self.log_structural(
            db,
            tx,
            StructuralKind::RootCollapse,
            vec![root.page_index, only_child.page_index],
        )?;

        {
            let mut meta = self.meta();
            meta.root = only_child;
            meta.height -= 1;
            debug!(
                "tree {} collapsed to height {}",
                self.get_file_id(),
                meta.height
            );
        }
        self.free_page(db, &root);
        Ok(())
    }

    /// Rebalance the under-full child at `child_index`: borrow one
    /// entry from an adjacent sibling that can spare it, merge with
    /// the sibling otherwise. The parent is write-latched by the
    /// caller; sibling pairs are latched left to right.
    fn fix_child_underflow(
        &self,
        db: &Database,
        tx: &Transaction,
        parent: &mut InternalPage,
        child_index: usize,
        lsn: Lsn,
    ) -> Result<(), GraniteError> {
        let child_pid = parent.child_at(child_index);
        match child_pid.category {
            PageCategory::Leaf => self.rebalance_leaf(db, tx, parent, child_index, lsn),
            PageCategory::Internal => self.rebalance_internal(db, tx, parent, child_index),
            PageCategory::Header => Err(GraniteError::internal("header page as tree child")),
        }
    }

    fn rebalance_leaf(
        &self,
        db: &Database,
        tx: &Transaction,
        parent: &mut InternalPage,
        child_index: usize,
        lsn: Lsn,
    ) -> Result<(), GraniteError> {
        let child_pid = parent.child_at(child_index);

        if child_index > 0 {
            // left sibling first, matching the latch order
            let left_pid = parent.child_at(child_index - 1);
            let left_pod = self.fetch_leaf(db, &left_pid)?;
            let child_pod = self.fetch_leaf(db, &child_pid)?;
            let mut left = left_pod.wl();
            let mut child = child_pod.wl();

            if left.entry_count() > self.min_entries() {
                // borrow the largest row from the left
                let last_index = left.entry_count() - 1;
                let moved = left.remove_at(last_index);
                child.insert_at(0, moved);
                let separator = child.first_key().unwrap();
                parent.set_key_at(child_index - 1, separator);

                let structural_lsn = self.log_structural(
                    db,
                    tx,
                    StructuralKind::Redistribute,
                    vec![left_pid.page_index, child_pid.page_index],
                )?;
                self.mark_page_dirty(db, tx, &mut *left, structural_lsn);
                self.mark_page_dirty(db, tx, &mut *child, structural_lsn);
                self.mark_page_dirty(db, tx, parent, structural_lsn);
                return Ok(());
            }

            // merge child into the left sibling
            let rows = child.split_off(0);
            left.extend(rows);
            let child_right = child.get_right_sibling();
            left.set_right_sibling(child_right);
            drop(child);

            if let Some(right_index) = child_right {
                let right_pid =
                    PageId::new(PageCategory::Leaf, self.get_file_id(), right_index);
                let pod = self.fetch_leaf(db, &right_pid)?;
                let mut right = pod.wl();
                right.set_left_sibling(Some(left_pid.page_index));
                self.mark_page_dirty(db, tx, &mut *right, lsn);
            }

            let (_, removed_pid) = parent.remove_child_at(child_index);
            let structural_lsn = self.log_structural(
                db,
                tx,
                StructuralKind::MergeLeaf,
                vec![left_pid.page_index, removed_pid.page_index],
            )?;
            self.mark_page_dirty(db, tx, &mut *left, structural_lsn);
            self.mark_page_dirty(db, tx, parent, structural_lsn);
            self.free_page(db, &removed_pid);
            debug!("merged leaf {} into {}", removed_pid, left_pid);
            return Ok(());
        }

        // left-most child: work with the right sibling
        let right_pid = parent.child_at(child_index + 1);
        let child_pod = self.fetch_leaf(db, &child_pid)?;
        let right_pod = self.fetch_leaf(db, &right_pid)?;
        let mut child = child_pod.wl();
        let mut right = right_pod.wl();

        if right.entry_count() > self.min_entries() {
            let moved = right.remove_at(0);
            let slot = child.entry_count();
            child.insert_at(slot, moved);
            let separator = right.first_key().unwrap();
            parent.set_key_at(child_index, separator);

            let structural_lsn = self.log_structural(
                db,
                tx,
                StructuralKind::Redistribute,
                vec![child_pid.page_index, right_pid.page_index],
            )?;
            self.mark_page_dirty(db, tx, &mut *child, structural_lsn);
            self.mark_page_dirty(db, tx, &mut *right, structural_lsn);
            self.mark_page_dirty(db, tx, parent, structural_lsn);
            return Ok(());
        }

        // merge the right sibling into the child
        let rows = right.split_off(0);
        child.extend(rows);
        let right_right = right.get_right_sibling();
        child.set_right_sibling(right_right);
        drop(right);

        if let Some(rr_index) = right_right {
            let rr_pid = PageId::new(PageCategory::Leaf, self.get_file_id(), rr_index);
            let pod = self.fetch_leaf(db, &rr_pid)?;
            let mut rr = pod.wl();
            rr.set_left_sibling(Some(child_pid.page_index));
            self.mark_page_dirty(db, tx, &mut *rr, lsn);
        }

        let (_, removed_pid) = parent.remove_child_at(child_index + 1);
        let structural_lsn = self.log_structural(
            db,
            tx,
            StructuralKind::MergeLeaf,
            vec![child_pid.page_index, removed_pid.page_index],
        )?;
        self.mark_page_dirty(db, tx, &mut *child, structural_lsn);
        self.mark_page_dirty(db, tx, parent, structural_lsn);
        self.free_page(db, &removed_pid);
        debug!("merged leaf {} into {}", removed_pid, child_pid);
        Ok(())
    }

    fn rebalance_internal(
        &self,
        db: &Database,
        tx: &Transaction,
        parent: &mut InternalPage,
        child_index: usize,
    ) -> Result<(), GraniteError> {
        let child_pid = parent.child_at(child_index);

        if child_index > 0 {
            let left_pid = parent.child_at(child_index - 1);
            let left_pod = self.fetch_internal(db, &left_pid)?;
            let child_pod = self.fetch_internal(db, &child_pid)?;
            let mut left = left_pod.wl();
            let mut child = child_pod.wl();

            if left.key_count() > self.min_entries() {
                // rotate through the parent: the old separator comes
                // down in front of the child, left's last key goes up
                let (up_key, moved_child) = left.pop_last();
                let down_key = parent.key_at(child_index - 1).to_vec();
                child.push_front(down_key, moved_child);
                parent.set_key_at(child_index - 1, up_key);

                let structural_lsn = self.log_structural(
                    db,
                    tx,
                    StructuralKind::Redistribute,
                    vec![left_pid.page_index, child_pid.page_index],
                )?;
                self.mark_page_dirty(db, tx, &mut *left, structural_lsn);
                self.mark_page_dirty(db, tx, &mut *child, structural_lsn);
                self.mark_page_dirty(db, tx, parent, structural_lsn);
                return Ok(());
            }

            let (keys, children) = child.take_all();
            drop(child);
            let (separator, removed_pid) = parent.remove_child_at(child_index);
            left.absorb_right(separator, keys, children);

            let structural_lsn = self.log_structural(
                db,
                tx,
                StructuralKind::MergeInternal,
                vec![left_pid.page_index, removed_pid.page_index],
            )?;
            self.mark_page_dirty(db, tx, &mut *left, structural_lsn);
            self.mark_page_dirty(db, tx, parent, structural_lsn);
            self.free_page(db, &removed_pid);
            debug!("merged internal {} into {}", removed_pid, left_pid);
            return Ok(());
        }

        let right_pid = parent.child_at(child_index + 1);
        let child_pod = self.fetch_internal(db, &child_pid)?;
        let right_pod = self.fetch_internal(db, &right_pid)?;
        let mut child = child_pod.wl();
        let mut right = right_pod.wl();

        if right.key_count() > self.min_entries() {
            let (up_key, moved_child) = right.pop_first();
            let down_key = parent.key_at(child_index).to_vec();
            child.push_back(down_key, moved_child);
            parent.set_key_at(child_index, up_key);

            let structural_lsn = self.log_structural(
                db,
                tx,
                StructuralKind::Redistribute,
                vec![child_pid.page_index, right_pid.page_index],
            )?;
            self.mark_page_dirty(db, tx, &mut *child, structural_lsn);
            self.mark_page_dirty(db, tx, &mut *right, structural_lsn);
            self.mark_page_dirty(db, tx, parent, structural_lsn);
            return Ok(());
        }

        let (keys, children) = right.take_all();
        drop(right);
        let (separator, removed_pid) = parent.remove_child_at(child_index + 1);
        child.absorb_right(separator, keys, children);

        let structural_lsn = self.log_structural(
            db,
            tx,
            StructuralKind::MergeInternal,
            vec![child_pid.page_index, removed_pid.page_index],
        )?;
        self.mark_page_dirty(db, tx, &mut *child, structural_lsn);
        self.mark_page_dirty(db, tx, parent, structural_lsn);
        self.free_page(db, &removed_pid);
        debug!("merged internal {} into {}", removed_pid, child_pid);
        Ok(())
    }
}
