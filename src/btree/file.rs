use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, info};

use crate::{
    btree::{
        page::{BTreePage, InternalPage, LeafPage},
        page_id::{FileId, PageCategory, PageId},
    },
    config::DbConfig,
    database::Database,
    error::GraniteError,
    io::{Decodeable, GraniteFile, GraniteReader, GraniteWriter},
    storage::{Cell, KeyComparator, Row, Schema},
    transaction::Transaction,
    types::{GraniteResult, Pod, ResultPod},
    utils::HandyRwLock,
};

const TREE_MAGIC: &[u8; 4] = b"DBTR";
const TREE_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Mutable tree-level state, persisted in the header page. Guarded by
/// its own mutex so page allocation never contends with node latches.
pub struct TreeMeta {
    pub root: PageId,
    pub next_page_index: u32,
    pub free_list: Vec<u32>,
    pub entry_count: u64,
    pub height: u32,
}

/// One on-disk B+ tree: a file of fixed-size pages. Page 0 is the
/// header; every other page holds one node. Keys are projections of
/// the stored rows over `key_spec`, compared by a comparator fixed at
/// creation. Tables store their rows in a tree keyed by RID; secondary
/// indexes store (key columns..., rid) rows.
pub struct BTreeFile {
    file_id: FileId,
    file: Arc<GraniteFile>,
    schema: Schema,
    key_spec: Vec<usize>,
    comparator: KeyComparator,
    unique: bool,
    order: usize,
    page_size: usize,

    meta: Mutex<TreeMeta>,

    /// Serializes structural modification passes (splits, merges,
    /// root changes). Readers and in-place leaf updates never take it.
    pub(crate) structural: Mutex<()>,
}

impl BTreeFile {
    pub fn create<P: AsRef<Path>>(
        path: P,
        file_id: FileId,
        schema: Schema,
        key_spec: Vec<usize>,
        comparator: KeyComparator,
        unique: bool,
        config: &DbConfig,
    ) -> Result<Self, GraniteError> {
        let file = GraniteFile::create(&path)?;

        let tree = Self {
            file_id,
            file: Arc::new(file),
            schema,
            key_spec,
            comparator,
            unique,
            order: config.btree_order,
            page_size: config.page_size,
            meta: Mutex::new(TreeMeta {
                root: PageId::new(PageCategory::Leaf, file_id, 1),
                next_page_index: 2,
                free_list: Vec::new(),
                entry_count: 0,
                height: 1,
            }),
            structural: Mutex::new(()),
        };

        // materialize the empty root so a load after crash sees a
        // well-formed tree
        let root = LeafPage::new_empty(
            tree.meta().root,
            tree.key_spec.clone(),
            tree.comparator,
        );
        tree.file
            .write_at(tree.page_size as u64, &root.serialize(tree.page_size)?)?;
        tree.write_header()?;
        tree.file.sync()?;

        info!("created tree file {} at {:?}", file_id, path.as_ref());
        Ok(tree)
    }

    pub fn load<P: AsRef<Path>>(
        path: P,
        file_id: FileId,
        schema: Schema,
        key_spec: Vec<usize>,
        unique: bool,
        config: &DbConfig,
    ) -> Result<Self, GraniteError> {
        let file = GraniteFile::create(&path)?;
        let bytes = file.read_at(0, config.page_size)?;
        let (order, comparator, meta) = Self::parse_header(&bytes)?;

        debug!(
            "loaded tree file {}: root {}, {} entries, height {}",
            file_id, meta.root, meta.entry_count, meta.height
        );

        Ok(Self {
            file_id,
            file: Arc::new(file),
            schema,
            key_spec,
            comparator,
            unique,
            order,
            page_size: config.page_size,
            meta: Mutex::new(meta),
            structural: Mutex::new(()),
        })
    }

    fn parse_header(bytes: &[u8]) -> Result<(usize, KeyComparator, TreeMeta), GraniteError> {
        let mut reader = GraniteReader::new(bytes);

        let magic = reader.read_exact(4)?;
        if magic != TREE_MAGIC {
            return Err(GraniteError::storage("not a tree file"));
        }
        let version = u16::decode_from(&mut reader)?;
        if version != TREE_VERSION {
            return Err(GraniteError::storage(&format!(
                "unsupported tree version {}",
                version
            )));
        }

        let order = u16::decode_from(&mut reader)? as usize;
        let comparator = KeyComparator::from_id(u8::decode_from(&mut reader)?)?;
        let _flags = u8::decode_from(&mut reader)?;
        let root = PageId::decode_from(&mut reader)?;
        let next_page_index = u32::decode_from(&mut reader)?;
        let entry_count = u64::decode_from(&mut reader)?;
        let height = u32::decode_from(&mut reader)?;
        let free_count = u32::decode_from(&mut reader)?;
        let mut free_list = Vec::with_capacity(free_count as usize);
        for _ in 0..free_count {
            free_list.push(u32::decode_from(&mut reader)?);
        }

        Ok((
            order,
            comparator,
            TreeMeta {
                root,
                next_page_index,
                free_list,
                entry_count,
                height,
            },
        ))
    }

    /// Replace the in-memory tree state with a header image replayed
    /// by recovery.
    pub fn reload_meta(&self, bytes: &[u8]) -> GraniteResult {
        let (_, _, meta) = Self::parse_header(bytes)?;
        *self.meta() = meta;
        Ok(())
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    pub fn get_file_id(&self) -> FileId {
        self.file_id
    }

    pub fn get_file(&self) -> &GraniteFile {
        &self.file
    }

    pub fn share_file(&self) -> Arc<GraniteFile> {
        Arc::clone(&self.file)
    }

    pub fn get_schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get_key_spec(&self) -> &[usize] {
        &self.key_spec
    }

    pub fn get_comparator(&self) -> KeyComparator {
        self.comparator
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn get_order(&self) -> usize {
        self.order
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    /// Minimum entries in a non-root node.
    pub fn min_entries(&self) -> usize {
        self.order / 2
    }

    pub fn key_of(&self, row: &Row) -> Vec<Cell> {
        row.project(&self.key_spec)
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, TreeMeta> {
        self.meta.lock().unwrap()
    }

    pub fn get_root_pid(&self) -> PageId {
        self.meta().root
    }

    pub fn entry_count(&self) -> u64 {
        self.meta().entry_count
    }

    pub fn height(&self) -> u32 {
        self.meta().height
    }

    // ------------------------------------------------------------------
    // page plumbing
    // ------------------------------------------------------------------

    pub(crate) fn fetch_leaf(&self, db: &Database, pid: &PageId) -> ResultPod<LeafPage> {
        db.mut_buffer_pool().get_leaf_page(self, pid)
    }

    pub(crate) fn fetch_internal(&self, db: &Database, pid: &PageId) -> ResultPod<InternalPage> {
        db.mut_buffer_pool().get_internal_page(self, pid)
    }

    /// Allocate a page index, reusing the free list when possible, and
    /// grow the file so the slot is addressable.
    pub(crate) fn allocate_index(&self) -> Result<u32, GraniteError> {
        let index = {
            let mut meta = self.meta();
            match meta.free_list.pop() {
                Some(index) => index,
                None => {
                    let index = meta.next_page_index;
                    meta.next_page_index += 1;
                    index
                }
            }
        };

        let needed = (index as u64 + 1) * self.page_size as u64;
        if self.file.get_size()? < needed {
            self.file.set_len(needed)?;
        }
        Ok(index)
    }

    pub(crate) fn allocate_leaf(&self, db: &Database) -> ResultPod<LeafPage> {
        let index = self.allocate_index()?;
        let pid = PageId::new(PageCategory::Leaf, self.file_id, index);
        let pod: Pod<LeafPage> = Arc::new(std::sync::RwLock::new(LeafPage::new_empty(
            pid,
            self.key_spec.clone(),
            self.comparator,
        )));
        db.mut_buffer_pool().put_new_page(
            self.share_file(),
            pid,
            crate::buffer::FramePage::Leaf(Arc::clone(&pod)),
        )?;
        Ok(pod)
    }

    pub(crate) fn allocate_internal(&self, db: &Database, page: InternalPage) -> ResultPod<InternalPage> {
        let pid = page.get_pid();
        let pod: Pod<InternalPage> = Arc::new(std::sync::RwLock::new(page));
        db.mut_buffer_pool().put_new_page(
            self.share_file(),
            pid,
            crate::buffer::FramePage::Internal(Arc::clone(&pod)),
        )?;
        Ok(pod)
    }

    pub(crate) fn free_page(&self, db: &Database, pid: &PageId) {
        self.meta().free_list.push(pid.page_index);
        db.mut_buffer_pool().discard(pid);
    }

    /// Stamp a modified page with the LSN of the record that covers
    /// the change and remember it as dirty, both in the pool and on
    /// the owning transaction.
    pub(crate) fn mark_page_dirty<P: BTreePage>(
        &self,
        db: &Database,
        tx: &Transaction,
        page: &mut P,
        lsn: u64,
    ) {
        if lsn != 0 {
            page.set_lsn(lsn);
        }
        let pid = page.get_pid();
        db.mut_buffer_pool().mark_dirty(&pid);
        db.mut_txn_manager().add_dirty_page(tx.get_id(), pid);
    }

    // ------------------------------------------------------------------
    // lookups
    // ------------------------------------------------------------------

    /// Exact-key lookup. Descends with read latches held along the
    /// path, so a structural change can never be observed half-done.
    pub fn search(&self, db: &Database, key: &[Cell]) -> Result<Option<Row>, GraniteError> {
        let root = self.get_root_pid();
        self.search_node(db, &root, key)
    }

    fn search_node(
        &self,
        db: &Database,
        pid: &PageId,
        key: &[Cell],
    ) -> Result<Option<Row>, GraniteError> {
        match pid.category {
            PageCategory::Leaf => {
                let pod = self.fetch_leaf(db, pid)?;
                let leaf = pod.rl();
                match leaf.locate(key) {
                    Ok(slot) => Ok(Some(leaf.get_row(slot).clone())),
                    Err(_) => Ok(None),
                }
            }
            PageCategory::Internal => {
                let pod = self.fetch_internal(db, pid)?;
                let guard = pod.rl();
                let child = guard.child_for(key);
                // the parent latch is still held here; drop it only
                // after the child lookup borrowed its own latch
                let result = self.search_node(db, &child, key);
                drop(guard);
                result
            }
            PageCategory::Header => Err(GraniteError::internal(&format!(
                "header page {} reached during descent",
                pid
            ))),
        }
    }

    /// Find the leaf that owns `key`, for cursor seeks. The returned
    /// pid is a hint: cursors re-validate against the leaf content.
    pub(crate) fn find_leaf(&self, db: &Database, key: &[Cell]) -> Result<PageId, GraniteError> {
        let mut pid = self.get_root_pid();
        loop {
            match pid.category {
                PageCategory::Leaf => return Ok(pid),
                PageCategory::Internal => {
                    let pod = self.fetch_internal(db, &pid)?;
                    let guard = pod.rl();
                    pid = guard.child_for(key);
                }
                PageCategory::Header => {
                    return Err(GraniteError::internal("header page reached during descent"))
                }
            }
        }
    }

    /// Left-most or right-most leaf, for unbounded scans.
    pub(crate) fn edge_leaf(
        &self,
        db: &Database,
        direction: ScanDirection,
    ) -> Result<PageId, GraniteError> {
        let mut pid = self.get_root_pid();
        loop {
            match pid.category {
                PageCategory::Leaf => return Ok(pid),
                PageCategory::Internal => {
                    let pod = self.fetch_internal(db, &pid)?;
                    let guard = pod.rl();
                    pid = match direction {
                        ScanDirection::Forward => guard.child_at(0),
                        ScanDirection::Backward => guard.child_at(guard.child_count() - 1),
                    };
                }
                PageCategory::Header => {
                    return Err(GraniteError::internal("header page reached during descent"))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    fn header_bytes(&self) -> Result<Vec<u8>, GraniteError> {
        let meta = self.meta();
        let mut writer = GraniteWriter::new();
        writer.write_raw(TREE_MAGIC);
        writer.write(&TREE_VERSION);
        writer.write(&(self.order as u16));
        writer.write_raw(&[self.comparator.id(), 0]);
        writer.write(&meta.root);
        writer.write(&meta.next_page_index);
        writer.write(&meta.entry_count);
        writer.write(&meta.height);
        writer.write(&(meta.free_list.len() as u32));
        for index in &meta.free_list {
            writer.write(index);
        }
        writer.to_padded_bytes(self.page_size)
    }

    fn write_header(&self) -> GraniteResult {
        let bytes = self.header_bytes()?;
        self.file.write_at(0, &bytes)?;
        Ok(())
    }

    /// Write the header page through the image-logging protocol, so a
    /// torn header write is replayable byte-wise.
    pub fn persist_header(&self, db: &Database) -> GraniteResult {
        let bytes = self.header_bytes()?;
        {
            let mut log = db.mut_log_manager();
            let image = crate::wal::StructuralPayload::Page(crate::wal::PageImage {
                file_id: self.file_id,
                page_index: 0,
                bytes: bytes.clone(),
            });
            let lsn = log.append(
                0,
                crate::wal::RecordKind::StructuralMod,
                crate::io::Encodeable::encode(&image),
                false,
            )?;
            log.flush_to(lsn)?;
        }
        self.file.write_at(0, &bytes)?;
        Ok(())
    }

    /// Flush this tree's dirty pages and its header down to disk.
    pub fn persist(&self, db: &Database) -> GraniteResult {
        {
            let mut pool = db.mut_buffer_pool();
            let dirty = pool.dirty_pages_of(self.file_id);
            pool.flush_pages(&dirty.into_iter().collect())?;
        }
        self.persist_header(db)?;
        self.file.sync()?;
        Ok(())
    }

    /// Walk the whole tree checking ordering and occupancy bounds.
    /// Test harness hook; panics on violations.
    pub fn check_integrity(&self, db: &Database) {
        let root = self.get_root_pid();
        let depth = self.check_node(db, &root, None, None, true);
        assert_eq!(depth as u32, self.height(), "height counter out of date");
    }

    fn check_node(
        &self,
        db: &Database,
        pid: &PageId,
        lower: Option<&[Cell]>,
        upper: Option<&[Cell]>,
        is_root: bool,
    ) -> usize {
        match pid.category {
            PageCategory::Leaf => {
                let pod = self.fetch_leaf(db, pid).unwrap();
                let leaf = pod.rl();
                leaf.check_integrity(lower, upper);
                if !is_root {
                    assert!(
                        leaf.entry_count() >= self.min_entries(),
                        "leaf {} under-full: {} < {}",
                        pid,
                        leaf.entry_count(),
                        self.min_entries()
                    );
                }
                1
            }
            PageCategory::Internal => {
                let pod = self.fetch_internal(db, pid).unwrap();
                let node = pod.rl();
                node.check_integrity();
                if !is_root {
                    assert!(
                        node.key_count() >= self.min_entries(),
                        "internal {} under-full",
                        pid
                    );
                }

                let mut depth = None;
                for i in 0..node.child_count() {
                    let child_lower = if i == 0 { lower } else { Some(node.key_at(i - 1)) };
                    let child_upper = if i == node.key_count() {
                        upper
                    } else {
                        Some(node.key_at(i))
                    };
                    let child_depth =
                        self.check_node(db, &node.child_at(i), child_lower, child_upper, false);
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) => assert_eq!(d, child_depth, "uneven leaf depth under {}", pid),
                    }
                }
                depth.unwrap_or(0) + 1
            }
            PageCategory::Header => panic!("header page in tree interior"),
        }
    }
}
