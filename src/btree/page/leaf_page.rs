use std::cmp::Ordering;

use crate::{
    btree::{
        page::{BasePage, BTreePage},
        page_id::{PageCategory, PageId},
    },
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader, GraniteWriter},
    storage::{Cell, KeyComparator, Row},
};

/// No sibling. Page 0 is always the header page, so 0 is a safe
/// sentinel.
pub const NO_SIBLING: u32 = 0;

const LEAF_TYPE_TAG: u8 = 2;

/// A leaf node: ordered rows plus forward/backward links into the
/// sibling chain. The key of a row is the projection of the key
/// columns; every stored key is unique within its tree (non-unique
/// secondary indexes append the RID to the key).
pub struct LeafPage {
    base: BasePage,

    rows: Vec<Row>,

    left_sibling: u32,
    right_sibling: u32,

    key_spec: Vec<usize>,
    comparator: KeyComparator,
}

impl LeafPage {
    pub fn new_empty(pid: PageId, key_spec: Vec<usize>, comparator: KeyComparator) -> Self {
        Self {
            base: BasePage::new(pid),
            rows: Vec::new(),
            left_sibling: NO_SIBLING,
            right_sibling: NO_SIBLING,
            key_spec,
            comparator,
        }
    }

    /// # Format
    ///
    /// - 1 byte: node type
    /// - 1 byte: flags
    /// - 2 bytes: row count
    /// - 8 bytes: lsn
    /// - 4 bytes: left sibling index
    /// - 4 bytes: right sibling index
    /// - rows, each length-prefixed (4 bytes)
    pub fn parse(
        pid: PageId,
        bytes: &[u8],
        key_spec: Vec<usize>,
        comparator: KeyComparator,
    ) -> Result<Self, GraniteError> {
        let mut reader = GraniteReader::new(bytes);

        let type_tag = u8::decode_from(&mut reader)?;
        if type_tag != LEAF_TYPE_TAG {
            return Err(GraniteError::storage(&format!(
                "invalid node: expected leaf at {}, found type tag {}",
                pid, type_tag
            )));
        }
        let _flags = u8::decode_from(&mut reader)?;
        let n_rows = u16::decode_from(&mut reader)?;
        let lsn = u64::decode_from(&mut reader)?;
        let left_sibling = u32::decode_from(&mut reader)?;
        let right_sibling = u32::decode_from(&mut reader)?;

        let mut rows = Vec::with_capacity(n_rows as usize);
        for _ in 0..n_rows {
            let len = u32::decode_from(&mut reader)?;
            let payload = reader.read_exact(len as usize)?;
            let mut row_reader = GraniteReader::new(payload);
            rows.push(Row::decode_from(&mut row_reader)?);
        }

        Ok(Self {
            base: BasePage::with_lsn(pid, lsn),
            rows,
            left_sibling,
            right_sibling,
            key_spec,
            comparator,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get_row(&self, slot: usize) -> &Row {
        &self.rows[slot]
    }

    pub fn key_at(&self, slot: usize) -> Vec<Cell> {
        self.rows[slot].project(&self.key_spec)
    }

    pub fn first_key(&self) -> Option<Vec<Cell>> {
        if self.rows.is_empty() {
            None
        } else {
            Some(self.key_at(0))
        }
    }

    pub fn last_key(&self) -> Option<Vec<Cell>> {
        if self.rows.is_empty() {
            None
        } else {
            Some(self.key_at(self.rows.len() - 1))
        }
    }

    /// Binary search for `key`. `Ok(slot)` when present, `Err(slot)`
    /// with the insertion position otherwise.
    pub fn locate(&self, key: &[Cell]) -> Result<usize, usize> {
        let comparator = self.comparator;
        let key_spec = &self.key_spec;
        self.rows
            .binary_search_by(|row| comparator.compare(&row.project(key_spec), key))
    }

    pub fn insert_at(&mut self, slot: usize, row: Row) {
        self.rows.insert(slot, row);
    }

    pub fn replace_at(&mut self, slot: usize, row: Row) -> Row {
        std::mem::replace(&mut self.rows[slot], row)
    }

    pub fn remove_at(&mut self, slot: usize) -> Row {
        self.rows.remove(slot)
    }

    /// Move the upper half out for a split: keep `keep` rows, return
    /// the tail.
    pub fn split_off(&mut self, keep: usize) -> Vec<Row> {
        self.rows.split_off(keep)
    }

    pub fn extend(&mut self, rows: Vec<Row>) {
        self.rows.extend(rows);
    }

    pub fn get_left_sibling(&self) -> Option<u32> {
        if self.left_sibling == NO_SIBLING {
            None
        } else {
            Some(self.left_sibling)
        }
    }

    pub fn get_right_sibling(&self) -> Option<u32> {
        if self.right_sibling == NO_SIBLING {
            None
        } else {
            Some(self.right_sibling)
        }
    }

    pub fn set_left_sibling(&mut self, index: Option<u32>) {
        self.left_sibling = index.unwrap_or(NO_SIBLING);
    }

    pub fn set_right_sibling(&mut self, index: Option<u32>) {
        self.right_sibling = index.unwrap_or(NO_SIBLING);
    }

    fn header_size() -> usize {
        // type + flags + count + lsn + two sibling links
        1 + 1 + 2 + 8 + 4 + 4
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = Self::header_size();
        for row in &self.rows {
            size += 4 + row.encode().len();
        }
        size
    }

    /// Byte-wise room check against the configured page size.
    pub fn fits_in(&self, row: &Row, page_size: usize) -> bool {
        self.serialized_size() + 4 + row.encode().len() <= page_size
    }

    pub fn check_integrity(&self, lower: Option<&[Cell]>, upper: Option<&[Cell]>) {
        let mut previous: Option<Vec<Cell>> = lower.map(|k| k.to_vec());
        for slot in 0..self.rows.len() {
            let key = self.key_at(slot);
            if let Some(prev) = &previous {
                assert!(
                    self.comparator.compare(prev, &key) != Ordering::Greater,
                    "leaf keys out of order at {}: {:?} > {:?}",
                    self.get_pid(),
                    prev,
                    key
                );
            }
            previous = Some(key);
        }

        if let (Some(last), Some(upper)) = (self.last_key(), upper) {
            assert!(
                self.comparator.compare(&last, upper) == Ordering::Less,
                "leaf key exceeds upper bound at {}",
                self.get_pid()
            );
        }
    }
}

impl BTreePage for LeafPage {
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
        writer.write_raw(&[LEAF_TYPE_TAG, 0]);
        writer.write(&(self.rows.len() as u16));
        writer.write(&self.get_lsn());
        writer.write(&self.left_sibling);
        writer.write(&self.right_sibling);

        for row in &self.rows {
            let payload = row.encode();
            writer.write(&(payload.len() as u32));
            writer.write_raw(&payload);
        }

        writer.to_padded_bytes(page_size).map_err(|_| {
            GraniteError::storage(&format!(
                "leaf {} overflows page size {} ({} bytes)",
                self.get_pid(),
                page_size,
                self.serialized_size()
            ))
        })
    }
}

pub fn leaf_pid(file_id: u32, page_index: u32) -> PageId {
    PageId::new(PageCategory::Leaf, file_id, page_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_row(k: i64) -> Row {
        Row::new(vec![Cell::Int64(k), Cell::String(format!("v{}", k))])
    }

    fn empty_leaf() -> LeafPage {
        LeafPage::new_empty(
            leaf_pid(1, 3),
            vec![0],
            KeyComparator::default_order(),
        )
    }

    #[test]
    fn test_locate_and_insert_sorted() {
        let mut leaf = empty_leaf();
        for k in [5i64, 1, 3, 2, 4] {
            let row = int_row(k);
            let slot = leaf.locate(&[Cell::Int64(k)]).unwrap_err();
            leaf.insert_at(slot, row);
        }

        let keys: Vec<Vec<Cell>> = (0..leaf.entry_count()).map(|i| leaf.key_at(i)).collect();
        assert_eq!(
            keys,
            (1..=5)
                .map(|k| vec![Cell::Int64(k)])
                .collect::<Vec<Vec<Cell>>>()
        );
        leaf.check_integrity(None, None);
    }

    #[test]
    fn test_round_trip() {
        let mut leaf = empty_leaf();
        leaf.set_left_sibling(Some(2));
        leaf.set_right_sibling(Some(4));
        leaf.set_lsn(77);
        for k in 1..=10 {
            let slot = leaf.locate(&[Cell::Int64(k)]).unwrap_err();
            leaf.insert_at(slot, int_row(k));
        }

        let bytes = leaf.serialize(8192).unwrap();
        assert_eq!(bytes.len(), 8192);

        let parsed = LeafPage::parse(
            leaf.get_pid(),
            &bytes,
            vec![0],
            KeyComparator::default_order(),
        )
        .unwrap();

        assert_eq!(parsed.entry_count(), 10);
        assert_eq!(parsed.get_lsn(), 77);
        assert_eq!(parsed.get_left_sibling(), Some(2));
        assert_eq!(parsed.get_right_sibling(), Some(4));
        assert_eq!(parsed.get_row(0), &int_row(1));
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let leaf = empty_leaf();
        let mut bytes = leaf.serialize(8192).unwrap();
        bytes[0] = 9;
        assert!(LeafPage::parse(
            leaf.get_pid(),
            &bytes,
            vec![0],
            KeyComparator::default_order(),
        )
        .is_err());
    }
}
