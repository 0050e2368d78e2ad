use crate::{
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    storage::Row,
    wal::{Lsn, TxnId},
};

const COMPENSATION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Begin,
    Insert,
    Update,
    Delete,
    IndexOp,
    StructuralMod,
    Commit,
    Abort,
    Checkpoint,
}

impl RecordKind {
    fn tag(&self) -> u8 {
        match self {
            RecordKind::Begin => 0,
            RecordKind::Insert => 1,
            RecordKind::Update => 2,
            RecordKind::Delete => 3,
            RecordKind::IndexOp => 4,
            RecordKind::StructuralMod => 5,
            RecordKind::Commit => 6,
            RecordKind::Abort => 7,
            RecordKind::Checkpoint => 8,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, GraniteError> {
        match tag {
            0 => Ok(RecordKind::Begin),
            1 => Ok(RecordKind::Insert),
            2 => Ok(RecordKind::Update),
            3 => Ok(RecordKind::Delete),
            4 => Ok(RecordKind::IndexOp),
            5 => Ok(RecordKind::StructuralMod),
            6 => Ok(RecordKind::Commit),
            7 => Ok(RecordKind::Abort),
            8 => Ok(RecordKind::Checkpoint),
            _ => Err(GraniteError::storage(&format!(
                "invalid log record kind: {}",
                tag
            ))),
        }
    }
}

/// One WAL record.
///
/// # On-disk format
///
/// - 8 bytes: lsn
/// - 8 bytes: prev lsn of the same transaction (0 for the first)
/// - 8 bytes: transaction id
/// - 1 byte: kind, high bit marks a compensation record
/// - 4 bytes: payload length
/// - n bytes: payload
/// - 4 bytes: crc32 over everything above
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TxnId,
    pub kind: RecordKind,
    /// Set on records written while rolling back (CLRs). A
    /// compensation record is never undone again.
    pub compensation: bool,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn encoded_len(&self) -> usize {
        8 + 8 + 8 + 1 + 4 + self.payload.len() + 4
    }
}

impl Encodeable for LogRecord {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        let mut kind = self.kind.tag();
        if self.compensation {
            kind |= COMPENSATION_FLAG;
        }
        buf.push(kind);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

impl Decodeable for LogRecord {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let lsn = u64::decode_from(reader)?;
        let prev_lsn = u64::decode_from(reader)?;
        let txn_id = u64::decode_from(reader)?;
        let kind_byte = u8::decode_from(reader)?;
        let len = u32::decode_from(reader)?;
        let payload = reader.read_exact(len as usize)?.to_vec();
        let stored_crc = u32::decode_from(reader)?;

        // recompute over the header + payload bytes
        let mut head = Vec::with_capacity(29 + payload.len());
        head.extend_from_slice(&lsn.to_le_bytes());
        head.extend_from_slice(&prev_lsn.to_le_bytes());
        head.extend_from_slice(&txn_id.to_le_bytes());
        head.push(kind_byte);
        head.extend_from_slice(&len.to_le_bytes());
        head.extend_from_slice(&payload);
        if crc32fast::hash(&head) != stored_crc {
            return Err(GraniteError::storage(&format!(
                "log record checksum mismatch at lsn {}",
                lsn
            )));
        }

        Ok(LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            kind: RecordKind::from_tag(kind_byte & !COMPENSATION_FLAG)?,
            compensation: kind_byte & COMPENSATION_FLAG != 0,
            payload,
        })
    }
}

/// Payload of Insert / Update / Delete records: the affected table,
/// the tuple address, and the pre/post images. Secondary index entries
/// are derived from the images on redo and undo.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table_id: u32,
    pub rid: u64,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl RowChange {
    pub fn insert(table_id: u32, rid: u64, after: Row) -> Self {
        Self {
            table_id,
            rid,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(table_id: u32, rid: u64, before: Row, after: Row) -> Self {
        Self {
            table_id,
            rid,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(table_id: u32, rid: u64, before: Row) -> Self {
        Self {
            table_id,
            rid,
            before: Some(before),
            after: None,
        }
    }

    /// The change that undoes this one.
    pub fn inverse(&self) -> RowChange {
        RowChange {
            table_id: self.table_id,
            rid: self.rid,
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

fn encode_opt_row(row: &Option<Row>, buf: &mut Vec<u8>) {
    match row {
        Some(r) => {
            buf.push(1);
            buf.extend_from_slice(&r.encode());
        }
        None => buf.push(0),
    }
}

fn decode_opt_row(reader: &mut GraniteReader) -> Result<Option<Row>, GraniteError> {
    if u8::decode_from(reader)? == 1 {
        Ok(Some(Row::decode_from(reader)?))
    } else {
        Ok(None)
    }
}

impl Encodeable for RowChange {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.rid.to_le_bytes());
        encode_opt_row(&self.before, &mut buf);
        encode_opt_row(&self.after, &mut buf);
        buf
    }
}

impl Decodeable for RowChange {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        Ok(RowChange {
            table_id: u32::decode_from(reader)?,
            rid: u64::decode_from(reader)?,
            before: decode_opt_row(reader)?,
            after: decode_opt_row(reader)?,
        })
    }
}

/// Payload of a StructuralMod record: which tree changed shape and
/// how. Redo is logical (row records rebuild the structure), so these
/// records document the change rather than drive replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralKind {
    SplitLeaf,
    SplitInternal,
    RootGrow,
    MergeLeaf,
    MergeInternal,
    RootCollapse,
    Redistribute,
    BulkLoad,
}

impl StructuralKind {
    fn tag(&self) -> u8 {
        match self {
            StructuralKind::SplitLeaf => 0,
            StructuralKind::SplitInternal => 1,
            StructuralKind::RootGrow => 2,
            StructuralKind::MergeLeaf => 3,
            StructuralKind::MergeInternal => 4,
            StructuralKind::RootCollapse => 5,
            StructuralKind::Redistribute => 6,
            StructuralKind::BulkLoad => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, GraniteError> {
        match tag {
            0 => Ok(StructuralKind::SplitLeaf),
            1 => Ok(StructuralKind::SplitInternal),
            2 => Ok(StructuralKind::RootGrow),
            3 => Ok(StructuralKind::MergeLeaf),
            4 => Ok(StructuralKind::MergeInternal),
            5 => Ok(StructuralKind::RootCollapse),
            6 => Ok(StructuralKind::Redistribute),
            7 => Ok(StructuralKind::BulkLoad),
            _ => Err(GraniteError::storage(&format!(
                "invalid structural kind: {}",
                tag
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuralOp {
    pub file_id: u32,
    pub kind: StructuralKind,
    pub pages: Vec<u32>,
}

/// The physical image of one page, logged immediately before the page
/// itself is written back (the literal WAL-before-data step). Recovery
/// replays these byte-wise, which makes a half-finished write-back set
/// whole again before any logical replay walks the tree. Page 0 images
/// carry the tree header (root pid, counters, free list).
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub file_id: u32,
    pub page_index: u32,
    pub bytes: Vec<u8>,
}

/// What a StructuralMod record carries: either a shape-change note or
/// a physical page image.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralPayload {
    Op(StructuralOp),
    Page(PageImage),
}

impl Encodeable for StructuralPayload {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            StructuralPayload::Op(op) => {
                buf.push(0);
                buf.extend_from_slice(&op.encode());
            }
            StructuralPayload::Page(image) => {
                buf.push(1);
                buf.extend_from_slice(&image.file_id.to_le_bytes());
                buf.extend_from_slice(&image.page_index.to_le_bytes());
                buf.extend_from_slice(&(image.bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(&image.bytes);
            }
        }
        buf
    }
}

impl Decodeable for StructuralPayload {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        match u8::decode_from(reader)? {
            0 => Ok(StructuralPayload::Op(StructuralOp::decode_from(reader)?)),
            1 => {
                let file_id = u32::decode_from(reader)?;
                let page_index = u32::decode_from(reader)?;
                let len = u32::decode_from(reader)?;
                let bytes = reader.read_exact(len as usize)?.to_vec();
                Ok(StructuralPayload::Page(PageImage {
                    file_id,
                    page_index,
                    bytes,
                }))
            }
            tag => Err(GraniteError::storage(&format!(
                "invalid structural payload tag: {}",
                tag
            ))),
        }
    }
}

impl Encodeable for StructuralOp {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.push(self.kind.tag());
        buf.extend_from_slice(&(self.pages.len() as u16).to_le_bytes());
        for page in &self.pages {
            buf.extend_from_slice(&page.to_le_bytes());
        }
        buf
    }
}

impl Decodeable for StructuralOp {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let file_id = u32::decode_from(reader)?;
        let kind = StructuralKind::from_tag(u8::decode_from(reader)?)?;
        let count = u16::decode_from(reader)?;
        let mut pages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pages.push(u32::decode_from(reader)?);
        }
        Ok(StructuralOp {
            file_id,
            kind,
            pages,
        })
    }
}

/// Payload of a Checkpoint record: the transactions active at
/// checkpoint time (with their begin LSNs) and the oldest LSN that
/// may still be missing from a data page. Segments entirely below the
/// recovery point of the latest checkpoint can be truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointBody {
    pub active_txns: Vec<(TxnId, Lsn)>,
    pub oldest_dirty_lsn: Lsn,
}

impl CheckpointBody {
    /// Where redo must start to cover everything this checkpoint may
    /// not have on disk.
    pub fn recovery_lsn(&self, own_lsn: Lsn) -> Lsn {
        let mut lsn = own_lsn;
        if self.oldest_dirty_lsn != 0 {
            lsn = lsn.min(self.oldest_dirty_lsn);
        }
        for (_, last) in &self.active_txns {
            if *last != 0 {
                lsn = lsn.min(*last);
            }
        }
        lsn
    }
}

impl Encodeable for CheckpointBody {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.active_txns.len() as u32).to_le_bytes());
        for (txn, lsn) in &self.active_txns {
            buf.extend_from_slice(&txn.to_le_bytes());
            buf.extend_from_slice(&lsn.to_le_bytes());
        }
        buf.extend_from_slice(&self.oldest_dirty_lsn.to_le_bytes());
        buf
    }
}

impl Decodeable for CheckpointBody {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let count = u32::decode_from(reader)?;
        let mut active_txns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let txn = u64::decode_from(reader)?;
            let lsn = u64::decode_from(reader)?;
            active_txns.push((txn, lsn));
        }
        Ok(CheckpointBody {
            active_txns,
            oldest_dirty_lsn: u64::decode_from(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Cell;

    #[test]
    fn test_record_round_trip() {
        let change = RowChange::insert(
            3,
            17,
            Row::new(vec![Cell::Int64(17), Cell::String("x".to_string())]),
        );
        let record = LogRecord {
            lsn: 42,
            prev_lsn: 40,
            txn_id: 7,
            kind: RecordKind::Insert,
            compensation: false,
            payload: change.encode(),
        };

        let bytes = record.encode();
        let mut reader = GraniteReader::new(&bytes);
        let decoded = LogRecord::decode_from(&mut reader).unwrap();
        assert_eq!(decoded.lsn, 42);
        assert_eq!(decoded.kind, RecordKind::Insert);
        assert!(!decoded.compensation);

        let mut payload_reader = GraniteReader::new(&decoded.payload);
        assert_eq!(RowChange::decode_from(&mut payload_reader).unwrap(), change);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let record = LogRecord {
            lsn: 1,
            prev_lsn: 0,
            txn_id: 1,
            kind: RecordKind::Begin,
            compensation: false,
            payload: vec![],
        };
        let mut bytes = record.encode();
        bytes[8] ^= 0xff;
        let mut reader = GraniteReader::new(&bytes);
        assert!(LogRecord::decode_from(&mut reader).is_err());
    }

    #[test]
    fn test_compensation_flag() {
        let record = LogRecord {
            lsn: 9,
            prev_lsn: 8,
            txn_id: 2,
            kind: RecordKind::Delete,
            compensation: true,
            payload: vec![],
        };
        let bytes = record.encode();
        let mut reader = GraniteReader::new(&bytes);
        let decoded = LogRecord::decode_from(&mut reader).unwrap();
        assert_eq!(decoded.kind, RecordKind::Delete);
        assert!(decoded.compensation);
    }

    #[test]
    fn test_inverse() {
        let row = Row::new(vec![Cell::Int64(1)]);
        let change = RowChange::delete(1, 5, row.clone());
        let inverse = change.inverse();
        assert_eq!(inverse.after, Some(row));
        assert_eq!(inverse.before, None);
    }
}
