use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};

use crate::{
    btree::{BTreeFile, ScanDirection},
    catalog::{
        statistics::TableStatistics,
        table::{IndexInfo, TableId, TableInfo},
    },
    config::DbConfig,
    database::Database,
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader, GraniteWriter},
    storage::{Cell, Column, ForeignKey, KeyComparator, Schema, Type},
    transaction::Transaction,
    types::GraniteResult,
    utils::HandyRwLock,
    wal::RecordKind,
};

const CATALOG_FILE: &str = "catalog.gdb";
const ENGINE_META_FILE: &str = "engine.meta";
const CATALOG_MAGIC: &[u8; 4] = b"GCAT";

/// The schema catalog: databases, tables, indexes, statistics and the
/// foreign-key graph. Fully cached in memory; every DDL bumps the
/// version (which keys the plan cache) and rewrites the per-database
/// catalog file via write-temp-and-rename.
pub struct Catalog {
    dir: PathBuf,
    databases: HashMap<String, HashMap<String, Arc<TableInfo>>>,
    version: u64,
    next_file_id: u32,
}

impl Catalog {
    pub fn open(dir: &Path, config: &DbConfig) -> Result<Self, GraniteError> {
        fs::create_dir_all(dir)?;

        let (next_file_id, version) = match fs::read(dir.join(ENGINE_META_FILE)) {
            Ok(bytes) => {
                let mut reader = GraniteReader::new(&bytes);
                (u32::decode_from(&mut reader)?, u64::decode_from(&mut reader)?)
            }
            Err(_) => (1, 0),
        };

        let mut catalog = Self {
            dir: dir.to_path_buf(),
            databases: HashMap::new(),
            version,
            next_file_id,
        };

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().join(CATALOG_FILE).exists() {
                let tables = catalog.load_database(&name, config)?;
                catalog.databases.insert(name, tables);
            }
        }

        info!(
            "catalog opened: {} databases, version {}",
            catalog.databases.len(),
            catalog.version
        );
        Ok(catalog)
    }

    pub fn get_version(&self) -> u64 {
        self.version
    }

    fn bump_version(&mut self) -> GraniteResult {
        self.version += 1;
        self.persist_engine_meta()
    }

    fn allocate_file_id(&mut self) -> u32 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }

    fn db_dir(&self, db_name: &str) -> PathBuf {
        self.dir.join(db_name)
    }

    // ------------------------------------------------------------------
    // databases
    // ------------------------------------------------------------------

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn create_database(&mut self, name: &str) -> GraniteResult {
        if self.databases.contains_key(name) {
            return Err(GraniteError::semantic(&format!(
                "database {} already exists",
                name
            )));
        }
        fs::create_dir_all(self.db_dir(name))?;
        self.databases.insert(name.to_string(), HashMap::new());
        self.persist_database(name)?;
        self.bump_version()?;
        info!("created database {}", name);
        Ok(())
    }

    /// Drop a database and its files. The caller guarantees no open
    /// transaction touches its tables.
    pub fn drop_database(&mut self, name: &str) -> GraniteResult {
        if self.databases.remove(name).is_none() {
            return Err(GraniteError::semantic(&format!("unknown database: {}", name)));
        }
        fs::remove_dir_all(self.db_dir(name))?;
        self.bump_version()?;
        info!("dropped database {}", name);
        Ok(())
    }

    fn tables_of(&self, db_name: &str) -> Result<&HashMap<String, Arc<TableInfo>>, GraniteError> {
        self.databases
            .get(db_name)
            .ok_or_else(|| GraniteError::semantic(&format!("unknown database: {}", db_name)))
    }

    // ------------------------------------------------------------------
    // tables
    // ------------------------------------------------------------------

    pub fn list_tables(&self, db_name: &str) -> Result<Vec<String>, GraniteError> {
        let mut names: Vec<String> = self.tables_of(db_name)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn get_table(&self, db_name: &str, name: &str) -> Result<Arc<TableInfo>, GraniteError> {
        self.tables_of(db_name)?
            .get(name)
            .cloned()
            .ok_or_else(|| GraniteError::semantic(&format!("unknown table: {}", name)))
    }

    /// Any tree file (clustering or index) by its stable file id.
    /// None when its table or index was dropped later.
    pub fn tree_by_file_id(&self, id: u32) -> Option<Arc<BTreeFile>> {
        for tables in self.databases.values() {
            for table in tables.values() {
                if table.id == id {
                    return Some(Arc::clone(&table.clustering));
                }
                for index in table.get_indexes() {
                    if index.id == id {
                        return Some(Arc::clone(&index.tree));
                    }
                }
            }
        }
        None
    }

    /// Lookup by stable table id, used by recovery when replaying row
    /// records. None when the table was dropped after the record was
    /// written.
    pub fn table_by_id(&self, id: TableId) -> Option<Arc<TableInfo>> {
        for tables in self.databases.values() {
            for table in tables.values() {
                if table.id == id {
                    return Some(Arc::clone(table));
                }
            }
        }
        None
    }

    /// The stored layout of a table tree: the hidden RID column
    /// followed by the user columns.
    fn stored_schema(schema: &Schema) -> Schema {
        let mut columns = vec![Column::new("__rid", Type::Int64).not_null()];
        columns.extend(schema.columns.iter().cloned());
        Schema::new(columns)
    }

    fn validate_new_table(&self, db_name: &str, schema: &Schema) -> GraniteResult {
        // primary key columns must exist; they are implicitly NOT NULL
        schema.resolve_columns(&schema.primary_key)?;
        for (_, columns) in &schema.uniques {
            schema.resolve_columns(columns)?;
        }

        for fk in &schema.foreign_keys {
            schema.resolve_columns(&fk.columns)?;
            let parent = self.get_table(db_name, &fk.parent_table)?;
            let parent_schema = parent.get_schema();
            let parent_columns = parent_schema.resolve_columns(&fk.parent_columns)?;
            if parent.index_with_prefix(&parent_columns).map(|i| i.unique) != Some(true) {
                return Err(GraniteError::semantic(&format!(
                    "foreign key {} must reference a primary key or unique index of {}",
                    fk.name, fk.parent_table
                )));
            }
        }
        Ok(())
    }

    pub fn create_table(
        &mut self,
        db: &Database,
        db_name: &str,
        name: &str,
        mut schema: Schema,
    ) -> Result<Arc<TableInfo>, GraniteError> {
        if self.tables_of(db_name)?.contains_key(name) {
            return Err(GraniteError::semantic(&format!(
                "table {} already exists",
                name
            )));
        }

        // primary key columns are implicitly NOT NULL
        for pk in schema.primary_key.clone() {
            if let Some(i) = schema.column_index(&pk) {
                schema.columns[i].nullable = false;
            }
        }
        self.validate_new_table(db_name, &schema)?;

        let table_id = self.allocate_file_id();
        let path = self.db_dir(db_name).join(format!("{}.tbl", name));
        let clustering = Arc::new(BTreeFile::create(
            &path,
            table_id,
            Self::stored_schema(&schema),
            vec![0],
            KeyComparator::default_order(),
            true,
            db.get_config(),
        )?);

        let table = Arc::new(TableInfo::new(table_id, db_name, name, schema.clone(), clustering, 1));

        // the declared primary key materializes as a mandatory unique
        // index mapping pk tuple -> rid
        if !schema.primary_key.is_empty() {
            let pk_name = format!("pk_{}", name);
            let index =
                self.build_index_info(db, db_name, &table, &pk_name, &schema.primary_key, true)?;
            table.add_index(index);
        }
        for (unique_name, columns) in &schema.uniques {
            let index = self.build_index_info(db, db_name, &table, unique_name, columns, true)?;
            table.add_index(index);
        }

        self.databases
            .get_mut(db_name)
            .unwrap()
            .insert(name.to_string(), Arc::clone(&table));
        self.persist_database(db_name)?;
        self.bump_version()?;
        info!("created table {}.{} (id {})", db_name, name, table_id);
        Ok(table)
    }

    fn build_index_info(
        &mut self,
        db: &Database,
        db_name: &str,
        table: &TableInfo,
        name: &str,
        column_names: &[String],
        unique: bool,
    ) -> Result<Arc<IndexInfo>, GraniteError> {
        let schema = table.get_schema();
        let columns = schema.resolve_columns(column_names)?;

        let mut index_columns: Vec<Column> = columns
            .iter()
            .map(|i| schema.column(*i).clone())
            .collect();
        index_columns.push(Column::new("__rid", Type::Int64).not_null());
        let index_schema = Schema::new(index_columns);

        let key_spec: Vec<usize> = if unique {
            (0..columns.len()).collect()
        } else {
            (0..=columns.len()).collect()
        };

        let index_id = self.allocate_file_id();
        let path = self
            .db_dir(db_name)
            .join(format!("{}.{}.idx", table.name, name));
        let tree = Arc::new(BTreeFile::create(
            &path,
            index_id,
            index_schema,
            key_spec,
            KeyComparator::default_order(),
            unique,
            db.get_config(),
        )?);

        Ok(Arc::new(IndexInfo {
            id: index_id,
            name: name.to_string(),
            column_names: column_names.to_vec(),
            columns,
            unique,
            tree,
        }))
    }

    /// Tables in `db_name` whose foreign keys reference `name`.
    pub fn dependents_of(
        &self,
        db_name: &str,
        name: &str,
    ) -> Result<Vec<(Arc<TableInfo>, ForeignKey)>, GraniteError> {
        let mut dependents = Vec::new();
        for table in self.tables_of(db_name)?.values() {
            for fk in table.get_schema().foreign_keys {
                if fk.parent_table == name {
                    dependents.push((Arc::clone(table), fk));
                }
            }
        }
        Ok(dependents)
    }

    /// The parent table and the unique index to probe when enforcing
    /// a foreign key.
    pub fn parent_index_for(
        &self,
        db_name: &str,
        fk: &ForeignKey,
    ) -> Result<(Arc<TableInfo>, Arc<IndexInfo>), GraniteError> {
        let parent = self.get_table(db_name, &fk.parent_table)?;
        let parent_schema = parent.get_schema();
        let parent_columns = parent_schema.resolve_columns(&fk.parent_columns)?;
        let index = parent
            .index_with_prefix(&parent_columns)
            .filter(|i| i.unique)
            .ok_or_else(|| {
                GraniteError::internal(&format!(
                    "foreign key {} lost its parent index on {}",
                    fk.name, fk.parent_table
                ))
            })?;
        Ok((parent, index))
    }

    pub fn drop_table(&mut self, db_name: &str, name: &str, cascade: bool) -> GraniteResult {
        let table = self.get_table(db_name, name)?;

        let dependents: Vec<(Arc<TableInfo>, ForeignKey)> = self
            .dependents_of(db_name, name)?
            .into_iter()
            .filter(|(child, _)| child.name != name)
            .collect();
        if !dependents.is_empty() && !cascade {
            let names: Vec<String> = dependents
                .iter()
                .map(|(child, fk)| format!("{} ({})", child.name, fk.name))
                .collect();
            return Err(GraniteError::semantic(&format!(
                "cannot drop {}: referenced by foreign keys {}",
                name,
                names.join(", ")
            )));
        }
        // with CASCADE the referencing constraints are dropped, not
        // the referencing tables
        for (child, fk) in dependents {
            let mut child_schema = child.get_schema();
            child_schema.foreign_keys.retain(|f| f.name != fk.name);
            child.set_schema(child_schema);
        }

        let _ = fs::remove_file(table.clustering.get_file().get_path());
        for index in table.get_indexes() {
            let _ = fs::remove_file(index.tree.get_file().get_path());
        }

        self.databases.get_mut(db_name).unwrap().remove(name);
        self.persist_database(db_name)?;
        self.bump_version()?;
        info!("dropped table {}.{}", db_name, name);
        Ok(())
    }

    /// Replace a table's schema after ALTER. Caller has already
    /// rewritten rows when the change required it.
    pub fn alter_table(&mut self, db_name: &str, name: &str, schema: Schema) -> GraniteResult {
        let table = self.get_table(db_name, name)?;
        table.set_schema(schema);
        self.persist_database(db_name)?;
        self.bump_version()
    }

    // ------------------------------------------------------------------
    // indexes
    // ------------------------------------------------------------------

    pub fn list_indexes(&self, db_name: &str, table: &str) -> Result<Vec<String>, GraniteError> {
        Ok(self
            .get_table(db_name, table)?
            .get_indexes()
            .iter()
            .map(|i| i.name.clone())
            .collect())
    }

    /// Create a secondary index and backfill it from the table's
    /// clustering tree.
    pub fn create_index(
        &mut self,
        db: &Database,
        tx: &Transaction,
        db_name: &str,
        table_name: &str,
        name: &str,
        column_names: &[String],
        unique: bool,
    ) -> GraniteResult {
        let table = self.get_table(db_name, table_name)?;
        if table.index_by_name(name).is_some() {
            return Err(GraniteError::semantic(&format!(
                "index {} already exists on {}",
                name, table_name
            )));
        }

        let index = self.build_index_info(db, db_name, &table, name, column_names, unique)?;

        let mut payload = GraniteWriter::new();
        payload.write(&table.id);
        payload.write(&index.id);
        payload.write_raw(&[1]);
        payload.write(&name.to_string());
        db.mut_log_manager().append(
            tx.get_id(),
            RecordKind::IndexOp,
            payload.to_bytes(),
            false,
        )?;

        // backfill: sorted entries feed the bulk loader
        let mut entries: Vec<(Vec<Cell>, crate::storage::Row)> = Vec::new();
        let mut cursor = table.scan(db, ScanDirection::Forward);
        while let Some(stored) = cursor.next_row()? {
            let rid = TableInfo::rid_of_stored(&stored);
            let row = table.user_row(&stored);
            let entry = index.entry_for(rid, &row);
            entries.push((index.tree.key_of(&entry), entry));
        }
        let comparator = index.tree.get_comparator();
        entries.sort_by(|a, b| comparator.compare(&a.0, &b.0));
        for pair in entries.windows(2) {
            if unique && comparator.compare(&pair[0].0, &pair[1].0) == std::cmp::Ordering::Equal {
                return Err(GraniteError::constraint(&format!(
                    "duplicate key {:?} violates new unique index {}",
                    pair[0].0, name
                )));
            }
        }
        index
            .tree
            .bulk_load(db, tx, entries.into_iter().map(|(_, e)| e).collect(), 0)?;

        table.add_index(index);
        self.persist_database(db_name)?;
        self.bump_version()?;
        info!("created index {} on {}.{}", name, db_name, table_name);
        Ok(())
    }

    pub fn drop_index(&mut self, db_name: &str, table_name: &str, name: &str) -> GraniteResult {
        let table = self.get_table(db_name, table_name)?;

        if let Some(pk) = table.primary_key_index() {
            if pk.name == name {
                return Err(GraniteError::semantic(&format!(
                    "cannot drop primary key index {}",
                    name
                )));
            }
        }

        match table.remove_index(name) {
            Some(index) => {
                let _ = fs::remove_file(index.tree.get_file().get_path());
            }
            None => {
                return Err(GraniteError::semantic(&format!(
                    "unknown index {} on {}",
                    name, table_name
                )))
            }
        }

        self.persist_database(db_name)?;
        self.bump_version()?;
        info!("dropped index {} on {}.{}", name, db_name, table_name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // statistics bookkeeping
    // ------------------------------------------------------------------

    /// Persist freshly recorded statistics and invalidate dependent
    /// cached plans via the version bump.
    pub fn record_statistics(&mut self, db_name: &str) -> GraniteResult {
        self.persist_database(db_name)?;
        self.bump_version()
    }

    pub fn fetch_statistics(
        &self,
        db_name: &str,
        table: &str,
    ) -> Result<TableStatistics, GraniteError> {
        Ok(self.get_table(db_name, table)?.stats.rl().clone())
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    fn persist_engine_meta(&self) -> GraniteResult {
        let mut writer = GraniteWriter::new();
        writer.write(&self.next_file_id);
        writer.write(&self.version);

        let tmp = self.dir.join(format!("{}.tmp", ENGINE_META_FILE));
        fs::write(&tmp, writer.to_bytes())?;
        fs::rename(&tmp, self.dir.join(ENGINE_META_FILE))?;
        Ok(())
    }

    /// Atomically rewrite one database's catalog file.
    pub fn persist_database(&self, db_name: &str) -> GraniteResult {
        let tables = self.tables_of(db_name)?;

        let mut writer = GraniteWriter::new();
        writer.write_raw(CATALOG_MAGIC);
        writer.write(&(tables.len() as u32));

        let mut sorted: Vec<&Arc<TableInfo>> = tables.values().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for table in sorted {
            writer.write(&table.id);
            writer.write(&table.name);
            writer.write(&table.peek_next_rid());
            writer.write(&table.get_schema());
            writer.write(&table.stats.rl().clone());

            let indexes = table.get_indexes();
            writer.write(&(indexes.len() as u16));
            for index in indexes {
                writer.write(&index.id);
                writer.write(&index.name);
                writer.write(&(index.column_names.len() as u16));
                for column in &index.column_names {
                    writer.write(column);
                }
                writer.write(&index.unique);
            }
        }

        let dir = self.db_dir(db_name);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", CATALOG_FILE));
        fs::write(&tmp, writer.to_bytes())?;
        fs::rename(&tmp, dir.join(CATALOG_FILE))?;
        debug!("persisted catalog for {}", db_name);
        Ok(())
    }

    fn load_database(
        &mut self,
        db_name: &str,
        config: &DbConfig,
    ) -> Result<HashMap<String, Arc<TableInfo>>, GraniteError> {
        let dir = self.db_dir(db_name);
        let bytes = fs::read(dir.join(CATALOG_FILE))?;
        let mut reader = GraniteReader::new(&bytes);

        let magic = reader.read_exact(4)?;
        if magic != CATALOG_MAGIC {
            return Err(GraniteError::storage(&format!(
                "corrupted catalog for database {}",
                db_name
            )));
        }

        let table_count = u32::decode_from(&mut reader)?;
        let mut tables = HashMap::new();

        for _ in 0..table_count {
            let id = TableId::decode_from(&mut reader)?;
            let name = String::decode_from(&mut reader)?;
            let next_rid = u64::decode_from(&mut reader)?;
            let schema = Schema::decode_from(&mut reader)?;
            let stats = TableStatistics::decode_from(&mut reader)?;

            let path = dir.join(format!("{}.tbl", name));
            let clustering = Arc::new(BTreeFile::load(
                &path,
                id,
                Self::stored_schema(&schema),
                vec![0],
                true,
                config,
            )?);

            let table = Arc::new(TableInfo::new(id, db_name, &name, schema.clone(), clustering, next_rid));
            *table.stats.wl() = stats;

            let index_count = u16::decode_from(&mut reader)?;
            for _ in 0..index_count {
                let index_id = u32::decode_from(&mut reader)?;
                let index_name = String::decode_from(&mut reader)?;
                let column_count = u16::decode_from(&mut reader)?;
                let mut column_names = Vec::with_capacity(column_count as usize);
                for _ in 0..column_count {
                    column_names.push(String::decode_from(&mut reader)?);
                }
                let unique = bool::decode_from(&mut reader)?;

                let columns = schema.resolve_columns(&column_names)?;
                let mut index_columns: Vec<Column> = columns
                    .iter()
                    .map(|i| schema.column(*i).clone())
                    .collect();
                index_columns.push(Column::new("__rid", Type::Int64).not_null());
                let key_spec: Vec<usize> = if unique {
                    (0..columns.len()).collect()
                } else {
                    (0..=columns.len()).collect()
                };

                let index_path = dir.join(format!("{}.{}.idx", name, index_name));
                let tree = Arc::new(BTreeFile::load(
                    &index_path,
                    index_id,
                    Schema::new(index_columns),
                    key_spec,
                    unique,
                    config,
                )?);

                table.add_index(Arc::new(IndexInfo {
                    id: index_id,
                    name: index_name,
                    column_names,
                    columns,
                    unique,
                    tree,
                }));
            }

            tables.insert(name, table);
        }

        debug!("loaded database {} ({} tables)", db_name, tables.len());
        Ok(tables)
    }
}
