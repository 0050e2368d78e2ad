use std::cmp::Ordering;

use log::info;

use crate::{
    btree::{
        file::BTreeFile,
        page::{BTreePage, InternalPage, LeafPage},
        page_id::{PageCategory, PageId},
    },
    buffer::FramePage,
    database::Database,
    error::GraniteError,
    storage::{Cell, Row},
    transaction::Transaction,
    types::GraniteResult,
    utils::HandyRwLock,
    wal::{Lsn, StructuralKind},
};

impl BTreeFile {
    /// Build the tree from rows already sorted by key. Leaves are
    /// filled to roughly 90% of the fan-out and the interior is built
    /// bottom-up; the result behaves exactly like a tree grown by
    /// repeated inserts. Only valid on an empty tree.
    pub fn bulk_load(
        &self,
        db: &Database,
        tx: &Transaction,
        rows: Vec<Row>,
        lsn: Lsn,
    ) -> GraniteResult {
        if self.entry_count() > 0 {
            return Err(GraniteError::internal(&format!(
                "bulk load into non-empty tree {}",
                self.get_file_id()
            )));
        }
        if rows.is_empty() {
            return Ok(());
        }

        let comparator = self.get_comparator();
        for pair in rows.windows(2) {
            let a = self.key_of(&pair[0]);
            let b = self.key_of(&pair[1]);
            match comparator.compare(&a, &b) {
                Ordering::Less => {}
                Ordering::Equal => {
                    return Err(if self.is_unique() {
                        GraniteError::constraint(&format!("duplicate key {:?} in bulk load", a))
                    } else {
                        GraniteError::internal("bulk load input repeats a full key")
                    });
                }
                Ordering::Greater => {
                    return Err(GraniteError::internal("bulk load input is not sorted"));
                }
            }
        }

        let _structural = self.structural.lock().unwrap();

        let fill = (self.get_order() * 9 / 10).max(2);
        let row_count = rows.len() as u64;

        // stage 1: pack the leaf level
        let mut chunks: Vec<Vec<Row>> = Vec::new();
        let mut current: Vec<Row> = Vec::new();
        for row in rows {
            current.push(row);
            if current.len() == fill {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            // never leave the last leaf under-full: steal from the
            // previous chunk when needed
            if current.len() < self.min_entries() && !chunks.is_empty() {
                let prev = chunks.last_mut().unwrap();
                let need = self.min_entries() - current.len();
                let mut borrowed = prev.split_off(prev.len() - need);
                borrowed.extend(std::mem::take(&mut current));
                current = borrowed;
            }
            chunks.push(current);
        }

        let mut level: Vec<(Vec<Cell>, PageId)> = Vec::new();
        let mut previous_index: Option<u32> = None;
        let mut built_pages = Vec::new();

        // the pre-allocated root (page 1) becomes the first leaf
        let mut first = true;
        for chunk in chunks {
            let index = if first {
                first = false;
                1
            } else {
                self.allocate_index()?
            };
            let pid = PageId::new(PageCategory::Leaf, self.get_file_id(), index);

            let mut leaf = LeafPage::new_empty(pid, self.get_key_spec().to_vec(), comparator);
            leaf.extend(chunk);
            leaf.set_left_sibling(previous_index);
            leaf.set_lsn(lsn);

            if let Some(prev) = previous_index {
                let prev_pid = PageId::new(PageCategory::Leaf, self.get_file_id(), prev);
                let pod = self.fetch_leaf(db, &prev_pid)?;
                pod.wl().set_right_sibling(Some(index));
            }

            let first_key = leaf.first_key().unwrap();
            let pod = std::sync::Arc::new(std::sync::RwLock::new(leaf));
            db.mut_buffer_pool().put_new_page(
                self.share_file(),
                pid,
                FramePage::Leaf(std::sync::Arc::clone(&pod)),
            )?;
            db.mut_txn_manager().add_dirty_page(tx.get_id(), pid);

            level.push((first_key, pid));
            built_pages.push(index);
            previous_index = Some(index);
        }

        let leaf_count = level.len();

        // stage 2: build the interior bottom-up
        let mut height = 1;
        while level.len() > 1 {
            let mut next_level: Vec<(Vec<Cell>, PageId)> = Vec::new();

            for group in level.chunks(fill + 1) {
                let index = self.allocate_index()?;
                let pid = PageId::new(PageCategory::Internal, self.get_file_id(), index);

                let children: Vec<PageId> = group.iter().map(|(_, pid)| *pid).collect();
                let keys: Vec<Vec<Cell>> =
                    group.iter().skip(1).map(|(key, _)| key.clone()).collect();
                let lowest = group[0].0.clone();

                let mut node = InternalPage::from_parts(pid, keys, children, comparator);
                node.set_lsn(lsn);
                let pod = self.allocate_internal(db, node)?;
                {
                    let mut guard = pod.wl();
                    self.mark_page_dirty(db, tx, &mut *guard, lsn);
                }

                next_level.push((lowest, pid));
                built_pages.push(index);
            }

            level = next_level;
            height += 1;
        }

        let root = level[0].1;
        {
            let mut meta = self.meta();
            meta.root = root;
            meta.height = height;
            meta.entry_count = row_count;
        }

        self.log_structural(db, tx, StructuralKind::BulkLoad, built_pages)?;
        info!(
            "bulk loaded tree {}: {} rows, {} leaves, height {}",
            self.get_file_id(),
            row_count,
            leaf_count,
            height
        );
        Ok(())
    }
}
