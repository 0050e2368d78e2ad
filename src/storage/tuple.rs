use std::{cmp::Ordering, fmt};

use crate::{
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    storage::cell::Cell,
};

/// Row identifier: a stable, monotonically-assigned integer that is
/// the tuple address inside a table's clustering tree. Never reused
/// within a table's lifetime.
pub type Rid = u64;

/// A row: one cell per column, in declared column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn get_cell(&self, i: usize) -> &Cell {
        &self.cells[i]
    }

    pub fn set_cell(&mut self, i: usize, cell: Cell) {
        self.cells[i] = cell;
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }

    pub fn width(&self) -> usize {
        self.cells.len()
    }

    /// Extract the cells at `indexes`, in that order. Used to build
    /// key tuples out of rows.
    pub fn project(&self, indexes: &[usize]) -> Vec<Cell> {
        indexes.iter().map(|i| self.cells[*i].clone()).collect()
    }

    /// Concatenate two rows, used by join operators.
    pub fn concat(&self, other: &Row) -> Row {
        let mut cells = self.cells.clone();
        cells.extend_from_slice(&other.cells);
        Row::new(cells)
    }

    /// Rough in-memory footprint, used by spill accounting.
    pub fn size_hint(&self) -> usize {
        self.cells
            .iter()
            .map(|c| match c {
                Cell::String(s) => 17 + s.len(),
                _ => 17,
            })
            .sum()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self.cells.iter().map(|c| c.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// # Format
///
/// - 2 bytes: cell count
/// - n cells, each self-describing
impl Encodeable for Row {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.cells.len() as u16).to_le_bytes());
        for cell in &self.cells {
            buf.extend_from_slice(&cell.encode());
        }
        buf
    }
}

impl Decodeable for Row {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let count = u16::decode_from(reader)?;
        let mut cells = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cells.push(Cell::decode_from(reader)?);
        }
        Ok(Row::new(cells))
    }
}

/// Where NULL sorts relative to non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullOrder {
    First,
    Last,
}

/// Compares key tuples cell by cell. Fixed at tree creation; the
/// comparator identity is persisted in the tree file header so a
/// reopened tree keeps its ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyComparator {
    pub null_order: NullOrder,
}

impl KeyComparator {
    pub fn new(null_order: NullOrder) -> Self {
        Self { null_order }
    }

    pub fn default_order() -> Self {
        Self::new(NullOrder::First)
    }

    /// Persisted identity. Must stay stable across versions.
    pub fn id(&self) -> u8 {
        match self.null_order {
            NullOrder::First => 0,
            NullOrder::Last => 1,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, GraniteError> {
        match id {
            0 => Ok(Self::new(NullOrder::First)),
            1 => Ok(Self::new(NullOrder::Last)),
            _ => Err(GraniteError::storage(&format!(
                "invalid comparator id: {}",
                id
            ))),
        }
    }

    pub fn compare_cell(&self, a: &Cell, b: &Cell) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => match self.null_order {
                NullOrder::First => Ordering::Less,
                NullOrder::Last => Ordering::Greater,
            },
            (false, true) => match self.null_order {
                NullOrder::First => Ordering::Greater,
                NullOrder::Last => Ordering::Less,
            },
            (false, false) => a.cmp(b),
        }
    }

    /// Lexicographic comparison of key tuples. A shorter tuple that is
    /// a prefix of the longer one compares less, which is what prefix
    /// range scans over compound indexes rely on.
    pub fn compare(&self, a: &[Cell], b: &[Cell]) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            match self.compare_cell(x, y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_and_concat() {
        let row = Row::new(vec![
            Cell::Int64(1),
            Cell::String("x".to_string()),
            Cell::Int64(3),
        ]);
        assert_eq!(
            row.project(&[2, 0]),
            vec![Cell::Int64(3), Cell::Int64(1)]
        );

        let joined = row.concat(&Row::new(vec![Cell::Bool(true)]));
        assert_eq!(joined.width(), 4);
    }

    #[test]
    fn test_comparator_null_order() {
        let first = KeyComparator::new(NullOrder::First);
        let last = KeyComparator::new(NullOrder::Last);

        let a = vec![Cell::Null];
        let b = vec![Cell::Int64(0)];
        assert_eq!(first.compare(&a, &b), Ordering::Less);
        assert_eq!(last.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_comparator_prefix() {
        let cmp = KeyComparator::default_order();
        let short = vec![Cell::Int64(1)];
        let long = vec![Cell::Int64(1), Cell::Int64(2)];
        assert_eq!(cmp.compare(&short, &long), Ordering::Less);
        assert_eq!(cmp.compare(&long, &long), Ordering::Equal);
    }

    #[test]
    fn test_row_round_trip() {
        let row = Row::new(vec![Cell::Null, Cell::Int64(9), Cell::String("abc".into())]);
        let bytes = row.encode();
        let mut reader = GraniteReader::new(&bytes);
        assert_eq!(Row::decode_from(&mut reader).unwrap(), row);
    }
}
