use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::{
    btree::{BTreeFile, ScanDirection, TreeCursor},
    catalog::statistics::TableStatistics,
    database::Database,
    error::GraniteError,
    io::Encodeable,
    storage::{Cell, Rid, Row, Schema},
    transaction::Transaction,
    types::{GraniteResult, Pod},
    utils::HandyRwLock,
    wal::{Lsn, RecordKind, RowChange},
};

pub type TableId = u32;

/// A secondary index: an ordered mapping from a key tuple to a RID.
/// Unique indexes key on the columns alone; non-unique indexes append
/// the RID so every stored key stays distinct.
pub struct IndexInfo {
    pub id: u32,
    pub name: String,
    pub column_names: Vec<String>,
    pub columns: Vec<usize>,
    pub unique: bool,
    pub tree: Arc<BTreeFile>,
}

impl IndexInfo {
    /// The row stored in the index tree for a table row.
    pub fn entry_for(&self, rid: Rid, row: &Row) -> Row {
        let mut cells = row.project(&self.columns);
        cells.push(Cell::Int64(rid as i64));
        Row::new(cells)
    }

    /// Key prefix for probing by column values only.
    pub fn probe_key(&self, values: &[Cell]) -> Vec<Cell> {
        values.to_vec()
    }

    pub fn rid_of(entry: &Row) -> Rid {
        match entry.get_cell(entry.width() - 1) {
            Cell::Int64(v) => *v as Rid,
            other => panic!("index entry without rid payload: {:?}", other),
        }
    }
}

/// One table: schema, the RID-keyed clustering tree holding the rows,
/// and the secondary indexes (the primary key is a mandatory unique
/// index). The stored row layout is `[rid, user columns...]`.
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub db_name: String,
    schema: RwLock<Schema>,
    pub clustering: Arc<BTreeFile>,
    indexes: RwLock<Vec<Arc<IndexInfo>>>,
    next_rid: AtomicU64,
    pub stats: Pod<TableStatistics>,
}

impl TableInfo {
    pub fn new(
        id: TableId,
        db_name: &str,
        name: &str,
        schema: Schema,
        clustering: Arc<BTreeFile>,
        next_rid: Rid,
    ) -> Self {
        let width = schema.width();
        Self {
            id,
            name: name.to_string(),
            db_name: db_name.to_string(),
            schema: RwLock::new(schema),
            clustering,
            indexes: RwLock::new(Vec::new()),
            next_rid: AtomicU64::new(next_rid.max(1)),
            stats: Arc::new(RwLock::new(TableStatistics::empty(width))),
        }
    }

    pub fn get_schema(&self) -> Schema {
        self.schema.rl().clone()
    }

    pub fn set_schema(&self, schema: Schema) {
        *self.schema.wl() = schema;
    }

    pub fn get_indexes(&self) -> Vec<Arc<IndexInfo>> {
        self.indexes.rl().clone()
    }

    pub fn add_index(&self, index: Arc<IndexInfo>) {
        self.indexes.wl().push(index);
    }

    pub fn remove_index(&self, name: &str) -> Option<Arc<IndexInfo>> {
        let mut indexes = self.indexes.wl();
        let position = indexes.iter().position(|i| i.name == name)?;
        Some(indexes.remove(position))
    }

    pub fn index_by_name(&self, name: &str) -> Option<Arc<IndexInfo>> {
        self.indexes.rl().iter().find(|i| i.name == name).cloned()
    }

    /// The unique index backing the declared primary key, if any.
    pub fn primary_key_index(&self) -> Option<Arc<IndexInfo>> {
        let schema = self.schema.rl();
        if schema.primary_key.is_empty() {
            return None;
        }
        let pk_columns = schema.resolve_columns(&schema.primary_key).ok()?;
        drop(schema);
        self.indexes
            .rl()
            .iter()
            .find(|i| i.unique && i.columns == pk_columns)
            .cloned()
    }

    /// An index whose column list starts with the given columns, for
    /// access-method selection (a full match is just the longest
    /// prefix case).
    pub fn index_with_prefix(&self, columns: &[usize]) -> Option<Arc<IndexInfo>> {
        self.indexes
            .rl()
            .iter()
            .filter(|i| !columns.is_empty() && i.columns.len() >= columns.len())
            .find(|i| i.columns[..columns.len()] == *columns)
            .cloned()
    }

    pub fn allocate_rid(&self) -> Rid {
        self.next_rid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peek_next_rid(&self) -> Rid {
        self.next_rid.load(Ordering::Relaxed)
    }

    /// Keep the RID counter ahead of anything observed (recovery).
    pub fn bump_next_rid(&self, floor: Rid) {
        self.next_rid.fetch_max(floor, Ordering::Relaxed);
    }

    pub fn row_count(&self) -> u64 {
        self.clustering.entry_count()
    }

    // ------------------------------------------------------------------
    // stored row layout
    // ------------------------------------------------------------------

    fn stored_row(&self, rid: Rid, row: &Row) -> Row {
        let mut cells = Vec::with_capacity(row.width() + 1);
        cells.push(Cell::Int64(rid as i64));
        cells.extend_from_slice(row.cells());
        Row::new(cells)
    }

    pub fn rid_key(rid: Rid) -> Vec<Cell> {
        vec![Cell::Int64(rid as i64)]
    }

    pub fn rid_of_stored(stored: &Row) -> Rid {
        match stored.get_cell(0) {
            Cell::Int64(v) => *v as Rid,
            other => panic!("stored row without rid column: {:?}", other),
        }
    }

    /// Strip the RID column and adapt the stored cells to the current
    /// schema width: columns added after the row was written read as
    /// their declared default.
    pub fn user_row(&self, stored: &Row) -> Row {
        let schema = self.schema.rl();
        let mut cells: Vec<Cell> = stored.cells()[1..].to_vec();
        while cells.len() < schema.width() {
            cells.push(schema.default_cell(cells.len()));
        }
        cells.truncate(schema.width());
        Row::new(cells)
    }

    // ------------------------------------------------------------------
    // logged row operations
    // ------------------------------------------------------------------

    /// Insert a row, logging it and recording it in the transaction's
    /// write set. Uniqueness is enforced by the unique index trees.
    pub fn insert_row(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        row: &Row,
    ) -> GraniteResult {
        db.txn_manager().ensure_active(tx.get_id())?;
        self.get_schema().validate_row(row)?;

        let change = RowChange::insert(self.id, rid, row.clone());
        let lsn = db.mut_log_manager().append(
            tx.get_id(),
            RecordKind::Insert,
            change.encode(),
            false,
        )?;
        db.mut_txn_manager()
            .record_write(tx.get_id(), crate::transaction::WriteRecord { change, lsn })?;

        self.apply_insert(db, tx, rid, row, lsn)
    }

    /// Physically add the row to the clustering tree and every index.
    /// No logging; shared by the forward path, redo and undo.
    pub fn apply_insert(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        row: &Row,
        lsn: Lsn,
    ) -> GraniteResult {
        // probe unique indexes before touching anything so a
        // duplicate leaves no partial state behind
        for index in self.get_indexes().iter().filter(|i| i.unique) {
            let key = row.project(&index.columns);
            if index.tree.search(db, &key)?.is_some() {
                return Err(GraniteError::constraint(&format!(
                    "duplicate key {:?} violates unique index {}",
                    key, index.name
                )));
            }
        }

        self.clustering
            .insert(db, tx, &self.stored_row(rid, row), lsn)?;

        for index in self.get_indexes().iter() {
            index.tree.insert(db, tx, &index.entry_for(rid, row), lsn)?;
        }
        Ok(())
    }

    /// Idempotent variant for recovery redo.
    pub fn redo_insert(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        row: &Row,
        lsn: Lsn,
    ) -> GraniteResult {
        self.clustering
            .upsert(db, tx, &self.stored_row(rid, row), lsn)?;
        for index in self.get_indexes().iter() {
            index.tree.upsert(db, tx, &index.entry_for(rid, row), lsn)?;
        }
        self.bump_next_rid(rid + 1);
        Ok(())
    }

    /// Delete a row by RID, logging the pre-image. Returns the
    /// deleted user row, None when the RID is gone already.
    pub fn delete_row(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
    ) -> Result<Option<Row>, GraniteError> {
        db.txn_manager().ensure_active(tx.get_id())?;

        let before = match self.fetch(db, rid)? {
            Some(row) => row,
            None => return Ok(None),
        };

        let change = RowChange::delete(self.id, rid, before.clone());
        let lsn = db.mut_log_manager().append(
            tx.get_id(),
            RecordKind::Delete,
            change.encode(),
            false,
        )?;
        db.mut_txn_manager()
            .record_write(tx.get_id(), crate::transaction::WriteRecord { change, lsn })?;

        self.apply_delete(db, tx, rid, &before, lsn)?;
        Ok(Some(before))
    }

    /// Remove the row and its index entries. The pre-image drives the
    /// index maintenance, so a rollback restores secondary entries
    /// exactly.
    pub fn apply_delete(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        before: &Row,
        lsn: Lsn,
    ) -> GraniteResult {
        self.clustering.delete(db, tx, &Self::rid_key(rid), lsn)?;
        for index in self.get_indexes().iter() {
            let entry = index.entry_for(rid, before);
            index.tree.delete(db, tx, &index.tree.key_of(&entry), lsn)?;
        }
        Ok(())
    }

    /// Update in place, logging both images.
    pub fn update_row(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        after: &Row,
    ) -> GraniteResult {
        db.txn_manager().ensure_active(tx.get_id())?;
        self.get_schema().validate_row(after)?;

        let before = match self.fetch(db, rid)? {
            Some(row) => row,
            None => {
                return Err(GraniteError::internal(&format!(
                    "update of missing rid {} in {}",
                    rid, self.name
                )))
            }
        };

        let change = RowChange::update(self.id, rid, before.clone(), after.clone());
        let lsn = db.mut_log_manager().append(
            tx.get_id(),
            RecordKind::Update,
            change.encode(),
            false,
        )?;
        db.mut_txn_manager()
            .record_write(tx.get_id(), crate::transaction::WriteRecord { change, lsn })?;

        self.apply_update(db, tx, rid, &before, after, lsn)
    }

    pub fn apply_update(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        before: &Row,
        after: &Row,
        lsn: Lsn,
    ) -> GraniteResult {
        // unique probes first, ignoring our own rid
        for index in self.get_indexes().iter().filter(|i| i.unique) {
            let new_key = after.project(&index.columns);
            if new_key != before.project(&index.columns) {
                if let Some(entry) = index.tree.search(db, &new_key)? {
                    if IndexInfo::rid_of(&entry) != rid {
                        return Err(GraniteError::constraint(&format!(
                            "duplicate key {:?} violates unique index {}",
                            new_key, index.name
                        )));
                    }
                }
            }
        }

        self.clustering
            .upsert(db, tx, &self.stored_row(rid, after), lsn)?;

        for index in self.get_indexes().iter() {
            let old_entry = index.entry_for(rid, before);
            let new_entry = index.entry_for(rid, after);
            if old_entry != new_entry {
                index
                    .tree
                    .delete(db, tx, &index.tree.key_of(&old_entry), lsn)?;
                index.tree.insert(db, tx, &new_entry, lsn)?;
            }
        }
        Ok(())
    }

    /// Overwrite the stored row image without touching indexes, for
    /// layout rewrites whose indexed values are unchanged (DROP
    /// COLUMN). Logged like any update.
    pub fn rewrite_row(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        before: &Row,
        after: &Row,
    ) -> GraniteResult {
        db.txn_manager().ensure_active(tx.get_id())?;
        let change = RowChange::update(self.id, rid, before.clone(), after.clone());
        let lsn = db.mut_log_manager().append(
            tx.get_id(),
            RecordKind::Update,
            change.encode(),
            false,
        )?;
        db.mut_txn_manager()
            .record_write(tx.get_id(), crate::transaction::WriteRecord { change, lsn })?;
        self.clustering
            .upsert(db, tx, &self.stored_row(rid, after), lsn)
    }

    /// Drive the row at `rid` to exactly `target` (present with that
    /// image, or absent), maintaining every index from the images.
    /// Idempotent; recovery redo and undo both funnel through it.
    pub fn force_row_state(
        &self,
        db: &Database,
        tx: &Transaction,
        rid: Rid,
        target: Option<&Row>,
        lsn: Lsn,
    ) -> GraniteResult {
        if let Some(current) = self.fetch(db, rid)? {
            self.apply_delete(db, tx, rid, &current, lsn)?;
        }
        if let Some(row) = target {
            self.clustering
                .insert(db, tx, &self.stored_row(rid, row), lsn)?;
            for index in self.get_indexes().iter() {
                index.tree.upsert(db, tx, &index.entry_for(rid, row), lsn)?;
            }
            self.bump_next_rid(rid + 1);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // lookups
    // ------------------------------------------------------------------

    /// Fetch the current user row at a RID.
    pub fn fetch(&self, db: &Database, rid: Rid) -> Result<Option<Row>, GraniteError> {
        Ok(self
            .clustering
            .search(db, &Self::rid_key(rid))?
            .map(|stored| self.user_row(&stored)))
    }

    /// Full-table cursor over the clustering tree.
    pub fn scan(&self, db: &Database, direction: ScanDirection) -> TreeCursor {
        TreeCursor::full(Arc::clone(&self.clustering), db.arc(), direction)
    }

    /// Largest RID currently stored, for fixing the counter after
    /// recovery.
    pub fn max_rid(&self, db: &Database) -> Result<Option<Rid>, GraniteError> {
        let mut cursor = TreeCursor::new(
            Arc::clone(&self.clustering),
            db.arc(),
            Bound::Unbounded,
            Bound::Unbounded,
            ScanDirection::Backward,
        );
        Ok(cursor
            .next_row()?
            .map(|stored| Self::rid_of_stored(&stored)))
    }
}
