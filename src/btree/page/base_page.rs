use crate::{btree::page_id::PageId, error::GraniteError};

/// State shared by every node type: its address and the LSN of the
/// last WAL record that touched it. The LSN gates write-back: a page
/// must not reach disk before the WAL prefix up to its LSN is durable.
pub struct BasePage {
    pid: PageId,
    lsn: u64,
}

impl BasePage {
    pub fn new(pid: PageId) -> Self {
        Self { pid, lsn: 0 }
    }

    pub fn with_lsn(pid: PageId, lsn: u64) -> Self {
        Self { pid, lsn }
    }

    pub fn get_pid(&self) -> PageId {
        self.pid
    }

    pub fn get_lsn(&self) -> u64 {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
    }
}

pub trait BTreePage {
    fn get_pid(&self) -> PageId;
    fn get_lsn(&self) -> u64;
    fn set_lsn(&mut self, lsn: u64);
    /// Serialize into exactly `page_size` bytes (zero padded).
    fn serialize(&self, page_size: usize) -> Result<Vec<u8>, GraniteError>;
}
