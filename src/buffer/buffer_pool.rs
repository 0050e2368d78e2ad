use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::debug;

use crate::{
    btree::{
        file::BTreeFile,
        page::{BTreePage, InternalPage, LeafPage},
        page_id::{PageCategory, PageId},
    },
    error::GraniteError,
    fault,
    io::GraniteFile,
    types::{GraniteResult, Pod, ResultPod},
    utils::HandyRwLock,
    wal::{LogManager, Lsn, PageImage, RecordKind, StructuralPayload},
};
use crate::io::Encodeable;

/// Accesses before a page migrates from the LRU segment into the LFU
/// segment.
const LFU_PROMOTE_HITS: u32 = 3;

/// A cached page, typed. Pods hand out shared ownership; the inner
/// RwLock is the node latch.
#[derive(Clone)]
pub enum FramePage {
    Leaf(Pod<LeafPage>),
    Internal(Pod<InternalPage>),
}

impl FramePage {
    /// Page LSN without blocking: the pool must never wait on a node
    /// latch while holding its own lock (a latch holder may be waiting
    /// for the pool). None when the page is write-latched right now.
    fn try_lsn(&self) -> Option<Lsn> {
        match self {
            FramePage::Leaf(pod) => pod.try_read().ok().map(|p| p.get_lsn()),
            FramePage::Internal(pod) => pod.try_read().ok().map(|p| p.get_lsn()),
        }
    }

    /// Serialize without blocking on the node latch; None when the
    /// page is currently write-latched.
    fn try_serialize(&self, page_size: usize) -> Option<Result<Vec<u8>, GraniteError>> {
        match self {
            FramePage::Leaf(pod) => pod.try_read().ok().map(|p| p.serialize(page_size)),
            FramePage::Internal(pod) => pod.try_read().ok().map(|p| p.serialize(page_size)),
        }
    }

    /// How many pods besides the pool's own reference are alive.
    fn borrowers(&self) -> usize {
        let count = match self {
            FramePage::Leaf(pod) => Arc::strong_count(pod),
            FramePage::Internal(pod) => Arc::strong_count(pod),
        };
        count - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictClass {
    Lru,
    Lfu,
}

struct Frame {
    page: FramePage,
    file: Arc<GraniteFile>,
    dirty: bool,
    pin_count: u32,
    last_access: u64,
    hit_count: u32,
    class: EvictClass,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dirty_writebacks: u64,
}

/// Bounded page cache between the tree files and the file system.
///
/// Eviction is hybrid: a configurable fraction of the frame budget is
/// managed by recency (LRU), the rest by frequency (LFU). A page
/// enters the LRU segment and is promoted once its hit count crosses
/// the threshold; cold LFU pages migrate back. Dirty pages reach disk
/// only after the WAL prefix up to their page LSN is durable.
pub struct BufferPool {
    frames: HashMap<PageId, Frame>,
    budget: usize,
    lru_ratio: f64,
    page_size: usize,
    tick: u64,
    log_manager: Pod<LogManager>,
    stats: BufferPoolStats,
}

impl BufferPool {
    pub fn new(
        budget: usize,
        lru_ratio: f64,
        page_size: usize,
        log_manager: Pod<LogManager>,
    ) -> Self {
        Self {
            frames: HashMap::new(),
            budget: budget.max(2),
            lru_ratio,
            page_size,
            tick: 0,
            log_manager,
            stats: BufferPoolStats::default(),
        }
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn get_stats(&self) -> BufferPoolStats {
        self.stats
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn touch(&mut self, pid: &PageId) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(frame) = self.frames.get_mut(pid) {
            frame.last_access = tick;
            frame.hit_count += 1;
            if frame.class == EvictClass::Lru && frame.hit_count >= LFU_PROMOTE_HITS {
                frame.class = EvictClass::Lfu;
            }
        }
    }

    pub fn get_leaf_page(&mut self, tree: &BTreeFile, pid: &PageId) -> ResultPod<LeafPage> {
        if let Some(frame) = self.frames.get(pid) {
            let pod = match &frame.page {
                FramePage::Leaf(pod) => Arc::clone(pod),
                _ => {
                    return Err(GraniteError::internal(&format!(
                        "page {} cached with wrong node type",
                        pid
                    )))
                }
            };
            self.stats.hits += 1;
            self.touch(pid);
            return Ok(pod);
        }

        self.stats.misses += 1;
        self.ensure_room()?;

        debug!("page fault, reading {} from disk", pid);
        let bytes = tree
            .get_file()
            .read_at(pid.offset(self.page_size), self.page_size)?;
        let page = LeafPage::parse(
            *pid,
            &bytes,
            tree.get_key_spec().to_vec(),
            tree.get_comparator(),
        )?;

        let pod = Arc::new(std::sync::RwLock::new(page));
        self.install(*pid, FramePage::Leaf(Arc::clone(&pod)), tree.share_file(), false);
        Ok(pod)
    }

    pub fn get_internal_page(&mut self, tree: &BTreeFile, pid: &PageId) -> ResultPod<InternalPage> {
        if let Some(frame) = self.frames.get(pid) {
            let pod = match &frame.page {
                FramePage::Internal(pod) => Arc::clone(pod),
                _ => {
                    return Err(GraniteError::internal(&format!(
                        "page {} cached with wrong node type",
                        pid
                    )))
                }
            };
            self.stats.hits += 1;
            self.touch(pid);
            return Ok(pod);
        }

        self.stats.misses += 1;
        self.ensure_room()?;

        debug!("page fault, reading {} from disk", pid);
        let bytes = tree
            .get_file()
            .read_at(pid.offset(self.page_size), self.page_size)?;
        let page = InternalPage::parse(*pid, &bytes, tree.get_comparator())?;

        let pod = Arc::new(std::sync::RwLock::new(page));
        self.install(
            *pid,
            FramePage::Internal(Arc::clone(&pod)),
            tree.share_file(),
            false,
        );
        Ok(pod)
    }

    /// Register a freshly allocated page. It is dirty by construction.
    pub fn put_new_page(
        &mut self,
        file: Arc<GraniteFile>,
        pid: PageId,
        page: FramePage,
    ) -> GraniteResult {
        self.ensure_room()?;
        self.install(pid, page, file, true);
        Ok(())
    }

    fn install(&mut self, pid: PageId, page: FramePage, file: Arc<GraniteFile>, dirty: bool) {
        self.tick += 1;
        self.frames.insert(
            pid,
            Frame {
                page,
                file,
                dirty,
                pin_count: 0,
                last_access: self.tick,
                hit_count: 1,
                class: EvictClass::Lru,
            },
        );
    }

    pub fn pin(&mut self, pid: &PageId) {
        if let Some(frame) = self.frames.get_mut(pid) {
            frame.pin_count += 1;
        }
    }

    pub fn unpin(&mut self, pid: &PageId, dirty: bool) {
        if let Some(frame) = self.frames.get_mut(pid) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
            frame.dirty |= dirty;
        }
    }

    pub fn mark_dirty(&mut self, pid: &PageId) {
        if let Some(frame) = self.frames.get_mut(pid) {
            frame.dirty = true;
        }
    }

    /// Smallest page LSN among dirty frames, for checkpoint records.
    /// A page whose latch is busy counts as LSN 0, which only widens
    /// the recovery window.
    pub fn oldest_dirty_lsn(&self) -> Lsn {
        self.frames
            .values()
            .filter(|f| f.dirty)
            .map(|f| f.page.try_lsn().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Write one page back if dirty.
    pub fn flush_page(&mut self, pid: &PageId) -> GraniteResult {
        self.flush_set(&[*pid])
    }

    pub fn flush_pages(&mut self, pids: &HashSet<PageId>) -> GraniteResult {
        let pids: Vec<PageId> = pids.iter().copied().collect();
        self.flush_set(&pids)
    }

    /// Flush every dirty frame. Must complete before the WAL records
    /// a clean-shutdown marker.
    pub fn flush_all(&mut self) -> GraniteResult {
        let pids: Vec<PageId> = self.frames.keys().copied().collect();
        self.flush_set(&pids)
    }

    /// The write-back protocol. Phase one logs a physical image of
    /// every page about to be written and forces the log; phase two
    /// writes the pages. A crash between the two leaves the images in
    /// the durable log, so recovery completes the write-back set
    /// byte-wise instead of meeting a half-written tree.
    ///
    /// A page whose latch is write-held right now stays dirty and is
    /// picked up by a later flush; durability rests on the WAL either
    /// way.
    fn flush_set(&mut self, pids: &[PageId]) -> GraniteResult {
        let page_size = self.page_size;

        let mut staged: Vec<(PageId, Vec<u8>, Arc<GraniteFile>)> = Vec::new();
        for pid in pids {
            if let Some(frame) = self.frames.get(pid) {
                if !frame.dirty {
                    continue;
                }
                if let Some(serialized) = frame.page.try_serialize(page_size) {
                    staged.push((*pid, serialized?, Arc::clone(&frame.file)));
                }
            }
        }
        if staged.is_empty() {
            return Ok(());
        }

        {
            let mut log = self.log_manager.wl();
            let mut last_lsn = 0;
            for (pid, bytes, _) in &staged {
                let image = StructuralPayload::Page(PageImage {
                    file_id: pid.file_id,
                    page_index: pid.page_index,
                    bytes: bytes.clone(),
                });
                last_lsn = log.append(0, RecordKind::StructuralMod, image.encode(), false)?;
            }
            log.flush_to(last_lsn)?;
        }

        fault::check(fault::PAGE_WRITE)?;
        for (pid, bytes, file) in staged {
            file.write_at(pid.offset(page_size), &bytes)?;
            if let Some(frame) = self.frames.get_mut(&pid) {
                frame.dirty = false;
            }
            self.stats.dirty_writebacks += 1;
        }
        Ok(())
    }

    /// Drop a cached page without writing it back. Used when rolling
    /// back freshly allocated pages and when freeing nodes.
    pub fn discard(&mut self, pid: &PageId) {
        self.frames.remove(pid);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.tick = 0;
    }

    fn ensure_room(&mut self) -> GraniteResult {
        while self.frames.len() >= self.budget {
            match self.pick_victim() {
                Some(victim) => self.evict(&victim)?,
                None => {
                    // everything is pinned or borrowed; caller keeps
                    // going with an oversized pool rather than failing
                    debug!("buffer pool over budget with no evictable frame");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn evict(&mut self, pid: &PageId) -> GraniteResult {
        self.flush_page(pid)?;
        self.frames.remove(pid);
        self.stats.evictions += 1;
        debug!("evicted page {}", pid);
        Ok(())
    }

    /// Hybrid victim selection. The LRU segment owns `lru_ratio` of
    /// the budget; whichever segment is over its share gives up its
    /// coldest page. Ties break by lower pin count, then lower page
    /// id, which keeps the choice deterministic.
    fn pick_victim(&mut self) -> Option<PageId> {
        // demote LFU pages that stopped being hot
        for frame in self.frames.values_mut() {
            if frame.class == EvictClass::Lfu && frame.hit_count < LFU_PROMOTE_HITS {
                frame.class = EvictClass::Lru;
            }
        }

        // dirty pages are written back only through the logged flush
        // protocol at commit and checkpoint, never by eviction
        let evictable =
            |frame: &Frame| !frame.dirty && frame.pin_count == 0 && frame.page.borrowers() == 0;

        let lru_budget = (self.budget as f64 * self.lru_ratio) as usize;
        let lru_count = self
            .frames
            .values()
            .filter(|f| f.class == EvictClass::Lru)
            .count();

        let prefer_lru = lru_count > lru_budget || lru_count == self.frames.len();

        let from_class = |pool: &HashMap<PageId, Frame>, class: EvictClass| -> Option<PageId> {
            pool.iter()
                .filter(|(_, f)| f.class == class && evictable(f))
                .min_by_key(|(pid, f)| {
                    let rank = match class {
                        EvictClass::Lru => f.last_access,
                        EvictClass::Lfu => f.hit_count as u64,
                    };
                    (rank, f.pin_count, pid.file_id, pid.page_index)
                })
                .map(|(pid, _)| *pid)
        };

        let (first, second) = if prefer_lru {
            (EvictClass::Lru, EvictClass::Lfu)
        } else {
            (EvictClass::Lfu, EvictClass::Lru)
        };

        from_class(&self.frames, first).or_else(|| from_class(&self.frames, second))
    }

    /// Page ids of dirty frames belonging to the given tree file.
    pub fn dirty_pages_of(&self, file_id: u32) -> Vec<PageId> {
        self.frames
            .iter()
            .filter(|(pid, f)| pid.file_id == file_id && f.dirty)
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// True when the page is cached. Test hook for scan instrumentation.
    pub fn contains(&self, pid: &PageId) -> bool {
        self.frames.contains_key(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyComparator;

    fn empty_leaf_pod(pid: PageId) -> FramePage {
        FramePage::Leaf(Arc::new(std::sync::RwLock::new(LeafPage::new_empty(
            pid,
            vec![0],
            KeyComparator::default_order(),
        ))))
    }

    fn test_pool(budget: usize) -> (BufferPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::DbConfig::default();
        let log = Arc::new(std::sync::RwLock::new(
            LogManager::open(&dir.path().join("wal"), &config).unwrap(),
        ));
        (BufferPool::new(budget, 0.7, 8192, log), dir)
    }

    #[test]
    fn test_eviction_prefers_cold_lru() {
        let (mut pool, dir) = test_pool(2);
        let file = Arc::new(GraniteFile::create(dir.path().join("t.db")).unwrap());
        // preallocate three pages worth of file
        file.set_len(8192 * 4).unwrap();

        let p1 = PageId::new(PageCategory::Leaf, 1, 1);
        let p2 = PageId::new(PageCategory::Leaf, 1, 2);
        let p3 = PageId::new(PageCategory::Leaf, 1, 3);

        pool.put_new_page(Arc::clone(&file), p1, empty_leaf_pod(p1)).unwrap();
        pool.put_new_page(Arc::clone(&file), p2, empty_leaf_pod(p2)).unwrap();
        // only clean pages are eviction candidates
        pool.flush_all().unwrap();

        // heat p1 so it gets promoted; p2 stays cold
        for _ in 0..4 {
            pool.touch(&p1);
        }

        pool.put_new_page(Arc::clone(&file), p3, empty_leaf_pod(p3)).unwrap();

        assert!(pool.contains(&p1));
        assert!(!pool.contains(&p2), "cold LRU page should be the victim");
        assert!(pool.contains(&p3));
        assert_eq!(pool.get_stats().evictions, 1);
    }

    #[test]
    fn test_pinned_page_not_evicted() {
        let (mut pool, dir) = test_pool(2);
        let file = Arc::new(GraniteFile::create(dir.path().join("t.db")).unwrap());
        file.set_len(8192 * 4).unwrap();

        let p1 = PageId::new(PageCategory::Leaf, 1, 1);
        let p2 = PageId::new(PageCategory::Leaf, 1, 2);
        let p3 = PageId::new(PageCategory::Leaf, 1, 3);

        pool.put_new_page(Arc::clone(&file), p1, empty_leaf_pod(p1)).unwrap();
        pool.pin(&p1);
        pool.put_new_page(Arc::clone(&file), p2, empty_leaf_pod(p2)).unwrap();
        pool.flush_all().unwrap();
        pool.put_new_page(Arc::clone(&file), p3, empty_leaf_pod(p3)).unwrap();

        assert!(pool.contains(&p1), "pinned page must survive eviction");
        pool.unpin(&p1, false);
    }

    #[test]
    fn test_flush_clears_dirty() {
        let (mut pool, dir) = test_pool(4);
        let file = Arc::new(GraniteFile::create(dir.path().join("t.db")).unwrap());
        file.set_len(8192 * 2).unwrap();

        let p1 = PageId::new(PageCategory::Leaf, 1, 1);
        pool.put_new_page(Arc::clone(&file), p1, empty_leaf_pod(p1)).unwrap();
        assert_eq!(pool.dirty_pages_of(1).len(), 1);

        pool.flush_all().unwrap();
        assert!(pool.dirty_pages_of(1).is_empty());
        assert_eq!(pool.get_stats().dirty_writebacks, 1);
    }
}
