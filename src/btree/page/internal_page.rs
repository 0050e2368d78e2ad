use std::cmp::Ordering;

use crate::{
    btree::{
        page::{decode_key, encode_key, BasePage, BTreePage},
        page_id::{PageCategory, PageId},
    },
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader, GraniteWriter},
    storage::{Cell, KeyComparator},
};

const INTERNAL_TYPE_TAG: u8 = 1;

/// An internal node: `k` separator keys routing into `k + 1` children.
/// For the separator at position `i`, every key in child `i` is
/// strictly less than it and every key in child `i + 1` is greater or
/// equal.
pub struct InternalPage {
    base: BasePage,

    keys: Vec<Vec<Cell>>,
    children: Vec<PageId>,

    comparator: KeyComparator,
}

impl InternalPage {
    /// A fresh internal node routing between exactly two children, as
    /// produced by a root split.
    pub fn new_root(
        pid: PageId,
        separator: Vec<Cell>,
        left: PageId,
        right: PageId,
        comparator: KeyComparator,
    ) -> Self {
        Self {
            base: BasePage::new(pid),
            keys: vec![separator],
            children: vec![left, right],
            comparator,
        }
    }

    pub fn new_empty(pid: PageId, comparator: KeyComparator) -> Self {
        Self {
            base: BasePage::new(pid),
            keys: Vec::new(),
            children: Vec::new(),
            comparator,
        }
    }

    /// Assemble a node out of pre-built parts (splits, bulk loading).
    pub fn from_parts(
        pid: PageId,
        keys: Vec<Vec<Cell>>,
        children: Vec<PageId>,
        comparator: KeyComparator,
    ) -> Self {
        Self {
            base: BasePage::new(pid),
            keys,
            children,
            comparator,
        }
    }

    /// # Format
    ///
    /// - 1 byte: node type
    /// - 1 byte: flags
    /// - 2 bytes: key count
    /// - 8 bytes: lsn
    /// - key count + 1 children, 9 bytes each
    /// - key count separator keys
    pub fn parse(
        pid: PageId,
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> Result<Self, GraniteError> {
        let mut reader = GraniteReader::new(bytes);

        let type_tag = u8::decode_from(&mut reader)?;
        if type_tag != INTERNAL_TYPE_TAG {
            return Err(GraniteError::storage(&format!(
                "invalid node: expected internal at {}, found type tag {}",
                pid, type_tag
            )));
        }
        let _flags = u8::decode_from(&mut reader)?;
        let n_keys = u16::decode_from(&mut reader)?;
        let lsn = u64::decode_from(&mut reader)?;

        let mut children = Vec::with_capacity(n_keys as usize + 1);
        for _ in 0..n_keys + 1 {
            children.push(PageId::decode_from(&mut reader)?);
        }

        let mut keys = Vec::with_capacity(n_keys as usize);
        for _ in 0..n_keys {
            keys.push(decode_key(&mut reader)?);
        }

        Ok(Self {
            base: BasePage::with_lsn(pid, lsn),
            keys,
            children,
            comparator,
        })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn key_at(&self, i: usize) -> &[Cell] {
        &self.keys[i]
    }

    pub fn child_at(&self, i: usize) -> PageId {
        self.children[i]
    }

    /// Which child subtree `key` belongs to: the first child whose
    /// separator exceeds the key, the last child otherwise.
    pub fn child_index_for(&self, key: &[Cell]) -> usize {
        for (i, separator) in self.keys.iter().enumerate() {
            if self.comparator.compare(key, separator) == Ordering::Less {
                return i;
            }
        }
        self.children.len() - 1
    }

    pub fn child_for(&self, key: &[Cell]) -> PageId {
        self.children[self.child_index_for(key)]
    }

    pub fn position_of_child(&self, child: &PageId) -> Option<usize> {
        self.children.iter().position(|c| c == child)
    }

    /// Install a new separator after `left` split into (`left`,
    /// `right`): the separator lands at left's slot, `right` right of
    /// it.
    pub fn insert_split(&mut self, separator: Vec<Cell>, left: &PageId, right: PageId) {
        let position = match self.position_of_child(left) {
            Some(p) => p,
            None => {
                // left must be routable by the separator
                debug_assert!(false, "split child {} not found in {}", left, self.get_pid());
                self.child_index_for(&separator)
            }
        };
        self.keys.insert(position, separator);
        self.children.insert(position + 1, right);
    }

    /// Remove the child at `position` and the separator left of it,
    /// as part of merging it into its left sibling. Position 0 is
    /// never removed this way.
    pub fn remove_child_at(&mut self, position: usize) -> (Vec<Cell>, PageId) {
        let separator = self.keys.remove(position - 1);
        let child = self.children.remove(position);
        (separator, child)
    }

    pub fn set_key_at(&mut self, i: usize, key: Vec<Cell>) {
        self.keys[i] = key;
    }

    pub fn set_child_at(&mut self, i: usize, child: PageId) {
        self.children[i] = child;
    }

    /// Split the node: keep the first `keep` keys, return the
    /// promoted middle key plus the tail keys/children for the new
    /// right sibling. The promoted key routes between the two nodes
    /// and does not stay in either.
    pub fn split_off(&mut self, keep: usize) -> (Vec<Cell>, Vec<Vec<Cell>>, Vec<PageId>) {
        let promoted = self.keys.remove(keep);
        let right_keys = self.keys.split_off(keep);
        let right_children = self.children.split_off(keep + 1);
        (promoted, right_keys, right_children)
    }

    /// Give up the right-most (key, child) pair, for redistribution
    /// into a right sibling.
    pub fn pop_last(&mut self) -> (Vec<Cell>, PageId) {
        (self.keys.pop().unwrap(), self.children.pop().unwrap())
    }

    /// Give up the left-most (key, child) pair, for redistribution
    /// into a left sibling.
    pub fn pop_first(&mut self) -> (Vec<Cell>, PageId) {
        (self.keys.remove(0), self.children.remove(0))
    }

    pub fn push_front(&mut self, key: Vec<Cell>, child: PageId) {
        self.keys.insert(0, key);
        self.children.insert(0, child);
    }

    pub fn push_back(&mut self, key: Vec<Cell>, child: PageId) {
        self.keys.push(key);
        self.children.push(child);
    }

    /// Absorb the right sibling during a merge: the separator that
    /// used to route between the two nodes comes down in the middle.
    pub fn absorb_right(
        &mut self,
        separator: Vec<Cell>,
        keys: Vec<Vec<Cell>>,
        children: Vec<PageId>,
    ) {
        self.keys.push(separator);
        self.keys.extend(keys);
        self.children.extend(children);
    }

    pub fn take_all(&mut self) -> (Vec<Vec<Cell>>, Vec<PageId>) {
        (
            std::mem::take(&mut self.keys),
            std::mem::take(&mut self.children),
        )
    }

    fn header_size() -> usize {
        1 + 1 + 2 + 8
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = Self::header_size() + self.children.len() * 9;
        for key in &self.keys {
            size += encode_key(key).len();
        }
        size
    }

    pub fn fits_in(&self, key: &[Cell], page_size: usize) -> bool {
        self.serialized_size() + encode_key(key).len() + 9 <= page_size
    }

    pub fn check_integrity(&self) {
        assert!(
            self.children.len() == self.keys.len() + 1,
            "internal node {} has {} keys but {} children",
            self.get_pid(),
            self.keys.len(),
            self.children.len()
        );
        for window in self.keys.windows(2) {
            assert!(
                self.comparator.compare(&window[0], &window[1]) == Ordering::Less,
                "internal keys out of order at {}",
                self.get_pid()
            );
        }
    }
}

impl BTreePage for InternalPage {
    fn get_pid(&self) -> PageId {
        self.base.get_pid()
    }

    fn get_lsn(&self) -> u64 {
        self.base.get_lsn()
    }

    fn set_lsn(&mut self, lsn: u64) {
        self.base.set_lsn(lsn)
    }

    fn serialize(&self, page_size: usize) -> Result<Vec<u8>, GraniteError> {
        let mut writer = GraniteWriter::new();
        writer.write_raw(&[INTERNAL_TYPE_TAG, 0]);
        writer.write(&(self.keys.len() as u16));
        writer.write(&self.get_lsn());

        for child in &self.children {
            writer.write(child);
        }
        for key in &self.keys {
            writer.write_raw(&encode_key(key));
        }

        writer.to_padded_bytes(page_size).map_err(|_| {
            GraniteError::storage(&format!(
                "internal node {} overflows page size {} ({} bytes)",
                self.get_pid(),
                page_size,
                self.serialized_size()
            ))
        })
    }
}

pub fn internal_pid(file_id: u32, page_index: u32) -> PageId {
    PageId::new(PageCategory::Internal, file_id, page_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::leaf_page::leaf_pid;

    fn int_key(k: i64) -> Vec<Cell> {
        vec![Cell::Int64(k)]
    }

    fn sample_node() -> InternalPage {
        // children: [leaf1) [leaf2) [leaf3), separators 10, 20
        let mut node = InternalPage::new_root(
            internal_pid(1, 5),
            int_key(10),
            leaf_pid(1, 1),
            leaf_pid(1, 2),
            KeyComparator::default_order(),
        );
        node.insert_split(int_key(20), &leaf_pid(1, 2), leaf_pid(1, 3));
        node
    }

    #[test]
    fn test_child_routing() {
        let node = sample_node();
        node.check_integrity();

        assert_eq!(node.child_for(&int_key(5)), leaf_pid(1, 1));
        assert_eq!(node.child_for(&int_key(10)), leaf_pid(1, 2));
        assert_eq!(node.child_for(&int_key(15)), leaf_pid(1, 2));
        assert_eq!(node.child_for(&int_key(20)), leaf_pid(1, 3));
        assert_eq!(node.child_for(&int_key(100)), leaf_pid(1, 3));
    }

    #[test]
    fn test_round_trip() {
        let mut node = sample_node();
        node.set_lsn(9);

        let bytes = node.serialize(8192).unwrap();
        let parsed =
            InternalPage::parse(node.get_pid(), &bytes, KeyComparator::default_order()).unwrap();

        assert_eq!(parsed.key_count(), 2);
        assert_eq!(parsed.child_count(), 3);
        assert_eq!(parsed.get_lsn(), 9);
        assert_eq!(parsed.child_for(&int_key(15)), leaf_pid(1, 2));
    }

    #[test]
    fn test_split_and_absorb() {
        let mut node = InternalPage::new_root(
            internal_pid(1, 9),
            int_key(10),
            leaf_pid(1, 1),
            leaf_pid(1, 2),
            KeyComparator::default_order(),
        );
        node.insert_split(int_key(20), &leaf_pid(1, 2), leaf_pid(1, 3));
        node.insert_split(int_key(30), &leaf_pid(1, 3), leaf_pid(1, 4));

        // keys: 10 20 30, children: l1 l2 l3 l4
        let (promoted, right_keys, right_children) = node.split_off(1);
        assert_eq!(promoted, int_key(20));
        assert_eq!(node.key_count(), 1);
        assert_eq!(node.child_count(), 2);
        assert_eq!(right_keys, vec![int_key(30)]);
        assert_eq!(right_children, vec![leaf_pid(1, 3), leaf_pid(1, 4)]);

        // merging back restores the original shape
        node.absorb_right(promoted, right_keys, right_children);
        node.check_integrity();
        assert_eq!(node.key_count(), 3);
        assert_eq!(node.child_for(&int_key(25)), leaf_pid(1, 3));
    }
}
