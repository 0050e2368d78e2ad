use log::info;

use crate::{
    btree::ScanDirection,
    catalog::table::TableInfo,
    database::Database,
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    storage::Cell,
    utils::HandyRwLock,
};

/// Selectivity fallbacks when a column has no statistics.
pub const DEFAULT_EQ_SELECTIVITY: f64 = 0.1;
pub const DEFAULT_RANGE_SELECTIVITY: f64 = 0.3;
pub const DEFAULT_UNKNOWN_SELECTIVITY: f64 = 0.5;

/// Equi-depth histogram: `bounds` holds bin upper boundaries chosen
/// so every bin covers about the same number of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bounds: Vec<Cell>,
    rows_per_bin: f64,
    total_rows: u64,
}

impl Histogram {
    /// Build from the column's non-null values in sorted order.
    pub fn build(sorted: &[Cell], bins: usize) -> Option<Histogram> {
        if sorted.is_empty() || bins == 0 {
            return None;
        }

        let bins = bins.min(sorted.len());
        let per_bin = sorted.len() as f64 / bins as f64;
        let mut bounds = Vec::with_capacity(bins);
        for b in 1..=bins {
            let index = ((b as f64 * per_bin) as usize).min(sorted.len()) - 1;
            bounds.push(sorted[index].clone());
        }

        Some(Histogram {
            bounds,
            rows_per_bin: per_bin,
            total_rows: sorted.len() as u64,
        })
    }

    /// Estimated fraction of rows with value strictly below `cell`.
    pub fn fraction_below(&self, cell: &Cell) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        let below_bins = self.bounds.iter().filter(|b| *b < cell).count();
        let fraction = below_bins as f64 / self.bounds.len() as f64;
        fraction.min(1.0)
    }

    pub fn bin_count(&self) -> usize {
        self.bounds.len()
    }
}

impl Encodeable for Histogram {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.bounds.len() as u32).to_le_bytes());
        for bound in &self.bounds {
            buf.extend_from_slice(&bound.encode());
        }
        buf.extend_from_slice(&self.rows_per_bin.to_le_bytes());
        buf.extend_from_slice(&self.total_rows.to_le_bytes());
        buf
    }
}

impl Decodeable for Histogram {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let count = u32::decode_from(reader)?;
        let mut bounds = Vec::with_capacity(count as usize);
        for _ in 0..count {
            bounds.push(Cell::decode_from(reader)?);
        }
        Ok(Histogram {
            bounds,
            rows_per_bin: f64::decode_from(reader)?,
            total_rows: u64::decode_from(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStatistics {
    pub distinct: u64,
    pub null_count: u64,
    pub min: Option<Cell>,
    pub max: Option<Cell>,
    pub histogram: Option<Histogram>,
}

impl ColumnStatistics {
    pub fn empty() -> Self {
        Self {
            distinct: 0,
            null_count: 0,
            min: None,
            max: None,
            histogram: None,
        }
    }

    /// Selectivity of `column = value`.
    pub fn eq_selectivity(&self) -> f64 {
        if self.distinct == 0 {
            DEFAULT_EQ_SELECTIVITY
        } else {
            1.0 / self.distinct as f64
        }
    }

    /// Selectivity of `column < value` (and friends, composed by the
    /// cost model).
    pub fn below_selectivity(&self, value: &Cell) -> f64 {
        match &self.histogram {
            Some(hist) => hist.fraction_below(value),
            None => DEFAULT_RANGE_SELECTIVITY,
        }
    }
}

impl Encodeable for ColumnStatistics {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.distinct.to_le_bytes());
        buf.extend_from_slice(&self.null_count.to_le_bytes());
        for opt in [&self.min, &self.max] {
            match opt {
                Some(cell) => {
                    buf.push(1);
                    buf.extend_from_slice(&cell.encode());
                }
                None => buf.push(0),
            }
        }
        match &self.histogram {
            Some(hist) => {
                buf.push(1);
                buf.extend_from_slice(&hist.encode());
            }
            None => buf.push(0),
        }
        buf
    }
}

impl Decodeable for ColumnStatistics {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let distinct = u64::decode_from(reader)?;
        let null_count = u64::decode_from(reader)?;
        let mut cells = [None, None];
        for slot in cells.iter_mut() {
            if u8::decode_from(reader)? == 1 {
                *slot = Some(Cell::decode_from(reader)?);
            }
        }
        let histogram = if u8::decode_from(reader)? == 1 {
            Some(Histogram::decode_from(reader)?)
        } else {
            None
        };
        let [min, max] = cells;
        Ok(ColumnStatistics {
            distinct,
            null_count,
            min,
            max,
            histogram,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableStatistics {
    pub row_count: u64,
    pub columns: Vec<ColumnStatistics>,
}

impl TableStatistics {
    pub fn empty(width: usize) -> Self {
        Self {
            row_count: 0,
            columns: (0..width).map(|_| ColumnStatistics::empty()).collect(),
        }
    }

    pub fn column(&self, i: usize) -> Option<&ColumnStatistics> {
        self.columns.get(i)
    }
}

impl Encodeable for TableStatistics {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.row_count.to_le_bytes());
        buf.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for column in &self.columns {
            buf.extend_from_slice(&column.encode());
        }
        buf
    }
}

impl Decodeable for TableStatistics {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let row_count = u64::decode_from(reader)?;
        let count = u16::decode_from(reader)?;
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(ColumnStatistics::decode_from(reader)?);
        }
        Ok(TableStatistics { row_count, columns })
    }
}

/// Rebuild a table's statistics with one full scan: row count, and
/// per column the distinct count, null count, min/max and an
/// equi-depth histogram.
pub fn analyze_table(db: &Database, table: &TableInfo) -> Result<TableStatistics, GraniteError> {
    let schema = table.get_schema();
    let width = schema.width();
    let bins = db.get_config().histogram_bins;

    let mut row_count = 0u64;
    let mut values: Vec<Vec<Cell>> = (0..width).map(|_| Vec::new()).collect();
    let mut null_counts = vec![0u64; width];

    let mut cursor = table.scan(db, ScanDirection::Forward);
    while let Some(stored) = cursor.next_row()? {
        let row = table.user_row(&stored);
        row_count += 1;
        for (i, cell) in row.cells().iter().enumerate() {
            if cell.is_null() {
                null_counts[i] += 1;
            } else {
                values[i].push(cell.clone());
            }
        }
    }

    let mut columns = Vec::with_capacity(width);
    for (i, mut column_values) in values.into_iter().enumerate() {
        column_values.sort();

        // values are sorted, so distinct = adjacent changes
        let mut distinct = 0u64;
        let mut prev: Option<&Cell> = None;
        for v in &column_values {
            if prev.map_or(true, |p| p != v) {
                distinct += 1;
            }
            prev = Some(v);
        }

        let stats = ColumnStatistics {
            distinct,
            null_count: null_counts[i],
            min: column_values.first().cloned(),
            max: column_values.last().cloned(),
            histogram: Histogram::build(&column_values, bins),
        };
        columns.push(stats);
    }

    let stats = TableStatistics { row_count, columns };
    *table.stats.wl() = stats.clone();
    info!(
        "analyzed {}.{}: {} rows",
        table.db_name, table.name, row_count
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_fraction_below() {
        let values: Vec<Cell> = (1..=100).map(Cell::Int64).collect();
        let hist = Histogram::build(&values, 10).unwrap();
        assert_eq!(hist.bin_count(), 10);

        assert!(hist.fraction_below(&Cell::Int64(1)) < 0.15);
        let mid = hist.fraction_below(&Cell::Int64(50));
        assert!(mid > 0.3 && mid < 0.7, "mid fraction: {}", mid);
        assert!(hist.fraction_below(&Cell::Int64(1000)) >= 0.9);
    }

    #[test]
    fn test_histogram_round_trip() {
        let values: Vec<Cell> = (1..=50).map(Cell::Int64).collect();
        let hist = Histogram::build(&values, 5).unwrap();
        let bytes = hist.encode();
        let mut reader = GraniteReader::new(&bytes);
        assert_eq!(Histogram::decode_from(&mut reader).unwrap(), hist);
    }

    #[test]
    fn test_eq_selectivity() {
        let mut stats = ColumnStatistics::empty();
        assert_eq!(stats.eq_selectivity(), DEFAULT_EQ_SELECTIVITY);
        stats.distinct = 4;
        assert_eq!(stats.eq_selectivity(), 0.25);
    }
}
