use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    config::{DbConfig, FsyncMode},
    error::GraniteError,
    fault,
    io::{Decodeable, Encodeable, GraniteFile, GraniteReader},
    types::GraniteResult,
    wal::{
        record::{CheckpointBody, LogRecord, RecordKind},
        Lsn, TxnId, NO_LSN,
    },
};

const CHECKPOINT_META: &str = "checkpoint.meta";
const CLEAN_MARKER: &str = "clean.marker";

struct SegmentMeta {
    first_lsn: Lsn,
    path: PathBuf,
}

/// The write-ahead log: an append-only stream of records split over
/// segment files. All mutation goes through the owning pod's write
/// lock, which doubles as the single append mutex.
pub struct LogManager {
    dir: PathBuf,
    segment_size: u64,
    fsync_mode: FsyncMode,

    /// Sorted by first lsn; the last entry is the open segment.
    segments: Vec<SegmentMeta>,
    current: GraniteFile,
    current_size: u64,

    next_lsn: Lsn,
    written_lsn: Lsn,
    flushed_lsn: Lsn,

    /// Last record appended per live transaction, chained into
    /// `prev_lsn` so undo can walk backward.
    last_txn_lsn: HashMap<TxnId, Lsn>,

    last_checkpoint_lsn: Lsn,

    /// Whether the previous shutdown left a valid clean marker.
    clean_start: bool,
}

fn segment_path(dir: &Path, first_lsn: Lsn) -> PathBuf {
    dir.join(format!("wal_{:016x}.log", first_lsn))
}

impl LogManager {
    pub fn open(dir: &Path, config: &DbConfig) -> Result<Self, GraniteError> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(hex) = name
                .strip_prefix("wal_")
                .and_then(|rest| rest.strip_suffix(".log"))
            {
                if let Ok(first_lsn) = Lsn::from_str_radix(hex, 16) {
                    segments.push(SegmentMeta {
                        first_lsn,
                        path: entry.path(),
                    });
                }
            }
        }
        segments.sort_by_key(|s| s.first_lsn);

        if segments.is_empty() {
            segments.push(SegmentMeta {
                first_lsn: 1,
                path: segment_path(dir, 1),
            });
        }

        // scan the open segment to find the append point, truncating a
        // torn tail if the last boot died mid-write
        let tail = segments.last().unwrap();
        let current = GraniteFile::create(&tail.path)?;
        let bytes = current.read_at(0, current.get_size()? as usize)?;
        let mut reader = GraniteReader::new(&bytes);
        let mut next_lsn = tail.first_lsn;
        let mut good_end = 0usize;
        while reader.remaining() > 0 {
            match LogRecord::decode_from(&mut reader) {
                Ok(record) => {
                    next_lsn = record.lsn + 1;
                    good_end = reader.position();
                }
                Err(_) => {
                    warn!(
                        "torn record at end of {}, truncating to {} bytes",
                        tail.path.display(),
                        good_end
                    );
                    current.set_len(good_end as u64)?;
                    break;
                }
            }
        }

        let checkpoint_meta = dir.join(CHECKPOINT_META);
        let last_checkpoint_lsn = match fs::read(&checkpoint_meta) {
            Ok(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Lsn::from_le_bytes(buf)
            }
            _ => NO_LSN,
        };

        let written_lsn = next_lsn.saturating_sub(1);

        // a clean marker is only good for one boot, and only when it
        // covers the whole log
        let marker_path = dir.join(CLEAN_MARKER);
        let clean_start = match fs::read(&marker_path) {
            Ok(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Lsn::from_le_bytes(buf) == written_lsn
            }
            _ => false,
        };
        let _ = fs::remove_file(&marker_path);

        info!(
            "wal opened: {} segments, next lsn {}, last checkpoint {}, clean start: {}",
            segments.len(),
            next_lsn,
            last_checkpoint_lsn,
            clean_start
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size: config.wal_segment_size,
            fsync_mode: config.wal_fsync_mode,
            segments,
            current_size: current.get_size()?,
            current,
            next_lsn,
            written_lsn,
            flushed_lsn: written_lsn,
            last_txn_lsn: HashMap::new(),
            last_checkpoint_lsn,
            clean_start,
        })
    }

    pub fn was_clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    pub fn written_lsn(&self) -> Lsn {
        self.written_lsn
    }

    pub fn last_lsn_of(&self, txn_id: TxnId) -> Lsn {
        self.last_txn_lsn.get(&txn_id).copied().unwrap_or(NO_LSN)
    }

    /// Append one record, assigning its LSN. Commit records are forced
    /// to disk before return unless running in periodic mode.
    pub fn append(
        &mut self,
        txn_id: TxnId,
        kind: RecordKind,
        payload: Vec<u8>,
        compensation: bool,
    ) -> Result<Lsn, GraniteError> {
        let lsn = self.next_lsn;
        let record = LogRecord {
            lsn,
            prev_lsn: self.last_lsn_of(txn_id),
            txn_id,
            kind,
            compensation,
            payload,
        };

        let bytes = record.encode();

        if self.current_size > 0 && self.current_size + bytes.len() as u64 > self.segment_size {
            self.roll_segment(lsn)?;
        }

        self.current.append(&bytes)?;
        self.current_size += bytes.len() as u64;
        self.next_lsn += 1;
        self.written_lsn = lsn;
        self.last_txn_lsn.insert(txn_id, lsn);

        debug!("wal append: lsn {}, txn {}, kind {:?}", lsn, txn_id, kind);

        match kind {
            RecordKind::Commit | RecordKind::Abort => {
                self.last_txn_lsn.remove(&txn_id);
                if self.fsync_mode != FsyncMode::Periodic {
                    self.flush_to(lsn)?;
                }
            }
            _ => {
                if self.fsync_mode == FsyncMode::Always {
                    self.flush_to(lsn)?;
                }
            }
        }

        Ok(lsn)
    }

    fn roll_segment(&mut self, first_lsn: Lsn) -> GraniteResult {
        self.current.sync()?;
        self.flushed_lsn = self.written_lsn;

        let path = segment_path(&self.dir, first_lsn);
        self.current = GraniteFile::create(&path)?;
        self.current_size = 0;
        self.segments.push(SegmentMeta { first_lsn, path });
        debug!("wal rolled over to segment starting at lsn {}", first_lsn);
        Ok(())
    }

    /// Make everything up to `lsn` durable. Idempotent.
    pub fn flush_to(&mut self, lsn: Lsn) -> GraniteResult {
        if self.flushed_lsn >= lsn {
            return Ok(());
        }
        fault::check(fault::WAL_FLUSH)?;
        self.current.sync()?;
        self.flushed_lsn = self.written_lsn;
        Ok(())
    }

    /// Write a checkpoint record and remember its position so the next
    /// recovery can start from it.
    pub fn log_checkpoint(&mut self, body: CheckpointBody) -> Result<Lsn, GraniteError> {
        let lsn = self.append(0, RecordKind::Checkpoint, body.encode(), false)?;
        self.flush_to(lsn)?;

        let meta_tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_META));
        fs::write(&meta_tmp, lsn.to_le_bytes())?;
        fs::rename(&meta_tmp, self.dir.join(CHECKPOINT_META))?;

        self.last_checkpoint_lsn = lsn;
        info!("checkpoint at lsn {}", lsn);
        Ok(lsn)
    }

    /// Drop whole segments that end below `up_to_lsn`. The open
    /// segment always survives.
    pub fn truncate(&mut self, up_to_lsn: Lsn) -> GraniteResult {
        let mut kept = Vec::new();
        for i in 0..self.segments.len() {
            let is_last = i + 1 == self.segments.len();
            let segment_end = if is_last {
                self.written_lsn
            } else {
                self.segments[i + 1].first_lsn - 1
            };

            if !is_last && segment_end < up_to_lsn {
                info!(
                    "truncating wal segment {} (ends at lsn {})",
                    self.segments[i].path.display(),
                    segment_end
                );
                fs::remove_file(&self.segments[i].path)?;
            } else {
                kept.push(SegmentMeta {
                    first_lsn: self.segments[i].first_lsn,
                    path: self.segments[i].path.clone(),
                });
            }
        }
        self.segments = kept;
        Ok(())
    }

    /// Run `apply` over every record with lsn >= `from_lsn`, in append
    /// order. A torn tail ends the walk without error.
    pub fn replay(
        &self,
        from_lsn: Lsn,
        apply: &mut dyn FnMut(&LogRecord) -> GraniteResult,
    ) -> GraniteResult {
        for (i, segment) in self.segments.iter().enumerate() {
            let is_last = i + 1 == self.segments.len();
            if !is_last && self.segments[i + 1].first_lsn <= from_lsn {
                continue;
            }

            let file = GraniteFile::create(&segment.path)?;
            let bytes = file.read_at(0, file.get_size()? as usize)?;
            let mut reader = GraniteReader::new(&bytes);
            while reader.remaining() > 0 {
                let record = match LogRecord::decode_from(&mut reader) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("stopping replay at torn record: {}", e);
                        return Ok(());
                    }
                };
                if record.lsn < from_lsn {
                    continue;
                }
                apply(&record)?;
            }
        }
        Ok(())
    }

    /// Called on clean shutdown after every dirty page is on disk.
    pub fn write_clean_marker(&mut self) -> GraniteResult {
        self.flush_to(self.written_lsn)?;
        let path = self.dir.join(CLEAN_MARKER);
        fs::write(&path, self.written_lsn.to_le_bytes())?;
        info!("clean shutdown marker written at lsn {}", self.written_lsn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::RowChange;
    use crate::storage::{Cell, Row};

    fn test_config() -> DbConfig {
        let mut config = DbConfig::default();
        config.wal_fsync_mode = FsyncMode::Always;
        config
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = LogManager::open(dir.path(), &test_config()).unwrap();

        wal.append(1, RecordKind::Begin, vec![], false).unwrap();
        let change = RowChange::insert(1, 1, Row::new(vec![Cell::Int64(1)]));
        wal.append(1, RecordKind::Insert, change.encode(), false)
            .unwrap();
        wal.append(1, RecordKind::Commit, vec![], false).unwrap();

        let mut kinds = Vec::new();
        wal.replay(1, &mut |record| {
            kinds.push(record.kind);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            kinds,
            vec![RecordKind::Begin, RecordKind::Insert, RecordKind::Commit]
        );
    }

    #[test]
    fn test_prev_lsn_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = LogManager::open(dir.path(), &test_config()).unwrap();

        let l1 = wal.append(5, RecordKind::Begin, vec![], false).unwrap();
        let l2 = wal.append(5, RecordKind::Insert, vec![], false).unwrap();
        assert_eq!(l2, l1 + 1);

        let mut prevs = Vec::new();
        wal.replay(1, &mut |record| {
            prevs.push(record.prev_lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(prevs, vec![NO_LSN, l1]);
    }

    #[test]
    fn test_reopen_continues_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let mut wal = LogManager::open(dir.path(), &test_config()).unwrap();
            wal.append(1, RecordKind::Begin, vec![], false).unwrap();
            wal.append(1, RecordKind::Commit, vec![], false).unwrap()
        };

        let mut wal = LogManager::open(dir.path(), &test_config()).unwrap();
        let next = wal.append(2, RecordKind::Begin, vec![], false).unwrap();
        assert_eq!(next, last + 1);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = LogManager::open(dir.path(), &test_config()).unwrap();
            wal.append(1, RecordKind::Begin, vec![], false).unwrap();
        }

        // chop bytes off the tail to simulate a torn write
        let path = segment_path(dir.path(), 1);
        let file = GraniteFile::create(&path).unwrap();
        let size = file.get_size().unwrap();
        file.set_len(size - 3).unwrap();

        let wal = LogManager::open(dir.path(), &test_config()).unwrap();
        let mut count = 0;
        wal.replay(1, &mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_segment_rollover_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.wal_segment_size = 256;

        let mut wal = LogManager::open(dir.path(), &config).unwrap();
        for _ in 0..20 {
            wal.append(1, RecordKind::Insert, vec![0u8; 64], false)
                .unwrap();
        }
        assert!(wal.segments.len() > 1);

        let high = wal.written_lsn();
        wal.truncate(high).unwrap();
        assert_eq!(wal.segments.len(), 1);

        // the surviving open segment still replays
        let mut count = 0;
        wal.replay(1, &mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert!(count >= 1);
    }

    #[test]
    fn test_clean_marker() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = LogManager::open(dir.path(), &test_config()).unwrap();
            wal.append(1, RecordKind::Begin, vec![], false).unwrap();
            wal.write_clean_marker().unwrap();
        }
        {
            let wal = LogManager::open(dir.path(), &test_config()).unwrap();
            assert!(wal.was_clean_start());
        }
        {
            // marker is single-use
            let wal = LogManager::open(dir.path(), &test_config()).unwrap();
            assert!(!wal.was_clean_start());
        }
    }
}
