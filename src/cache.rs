//! Three-tier cache hierarchy: `CachePool` owns one `DbBranch` per open
//! database, each `DbBranch` owns one `TableBranch` per table touched
//! this session, each `TableBranch` keeps a heat-ranked set of `Page`s
//! and `BPTree`s resident and evicts the coldest once it grows past
//! its size budget.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::btree::BPTree;
use crate::constants::{DEFAULT_CACHE_BRANCH_SIZE, INDEX_EXT, PAGE_EXT};
use crate::database::Database;
use crate::errors::{DbError, Result};
use crate::fs as dbfs;
use crate::page::Page;
use crate::record::Record;
use crate::table::Table;

/// Either of the two object kinds a leaf cache entry can hold. Replaces
/// the source's attribute-bag cache objects with one tagged sum (Design
/// Notes §9).
#[derive(Debug)]
pub enum CacheObject {
    Page(Page),
    Index(BPTree),
}

impl CacheObject {
    pub fn as_page(&self) -> Option<&Page> {
        match self {
            CacheObject::Page(p) => Some(p),
            CacheObject::Index(_) => None,
        }
    }

    pub fn as_page_mut(&mut self) -> Option<&mut Page> {
        match self {
            CacheObject::Page(p) => Some(p),
            CacheObject::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<&BPTree> {
        match self {
            CacheObject::Index(t) => Some(t),
            CacheObject::Page(_) => None,
        }
    }

    pub fn as_index_mut(&mut self) -> Option<&mut BPTree> {
        match self {
            CacheObject::Index(t) => Some(t),
            CacheObject::Page(_) => None,
        }
    }

    fn commit(&self) -> Result<()> {
        match self {
            CacheObject::Page(p) => p.commit(),
            CacheObject::Index(t) => t.commit(),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        match self {
            CacheObject::Page(p) => p.rollback(),
            CacheObject::Index(t) => t.rollback(),
        }
    }
}

#[derive(Debug)]
pub struct LeafCacheEntry {
    pub object: CacheObject,
    pub heat: u64,
    pub dirty: bool,
}

fn page_key(number: usize) -> String {
    format!("page:{}", number)
}

fn index_key(name: &str) -> String {
    format!("index:{}", name)
}

/// Caches a single table's live Pages and BPTrees, on top of its
/// metadata (`Table`).
#[derive(Debug)]
pub struct TableBranch {
    pub table: Table,
    pub leaves: IndexMap<String, LeafCacheEntry>,
    pub size: usize,
}

impl TableBranch {
    pub fn new(table: Table) -> Self {
        TableBranch { table, leaves: IndexMap::new(), size: DEFAULT_CACHE_BRANCH_SIZE }
    }

    fn average_heat(&self) -> u64 {
        if self.leaves.is_empty() {
            return 0;
        }
        let total: u64 = self.leaves.values().map(|e| e.heat).sum();
        total / self.leaves.len() as u64
    }

    /// Commits-then-evicts the coldest entry once the branch grows past
    /// `size`, mirroring the source's `restore_size`. Suspended while a
    /// transaction holds `auto_commit_signal` false.
    fn restore_size(&mut self, auto_commit: bool) -> Result<()> {
        if !auto_commit {
            return Ok(());
        }
        while self.leaves.len() >= self.size {
            let average = self.average_heat();
            let Some(key) = self
                .leaves
                .iter()
                .filter(|(_, e)| e.heat <= average)
                .min_by_key(|(_, e)| e.heat)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = self.leaves.get(&key) {
                if entry.dirty {
                    entry.object.commit()?;
                }
            }
            debug!("{}: evicting coldest cache entry {} (branch size {})", self.table.name, key, self.leaves.len());
            self.leaves.shift_remove(&key);
        }
        Ok(())
    }

    fn insert_leaf(&mut self, key: String, object: CacheObject, auto_commit: bool) -> Result<()> {
        self.restore_size(auto_commit)?;
        let heat = self.average_heat() + 1;
        self.leaves.insert(key, LeafCacheEntry { object, heat, dirty: true });
        Ok(())
    }

    fn page_path(&self, number: usize) -> PathBuf {
        let mut p = self.table.path.clone();
        p.push(format!("{}.{}", number, PAGE_EXT));
        p
    }

    fn index_path(&self, name: &str) -> PathBuf {
        let mut p = self.table.path.clone();
        p.push(format!("{}.{}", name, INDEX_EXT));
        p
    }

    /// Loads a page from disk into the cache (creating an empty one if
    /// it has never been written), then bumps its heat and marks it
    /// dirty — the cache's `get` unconditionally marks dirty, a
    /// deliberately conservative choice (Design Notes §9).
    pub fn get_or_create_page(&mut self, number: usize, auto_commit: bool) -> Result<&mut Page> {
        let key = page_key(number);
        if !self.leaves.contains_key(&key) {
            let path = self.page_path(number);
            let page = if dbfs::exists(&path) {
                let bytes = dbfs::read(&path)?;
                let mut r = crate::codec::Reader::new(&bytes);
                let mut page = Page::decode(&mut r)?;
                page.path = Some(path);
                page
            } else {
                let mut page = Page::new(number);
                page.path = Some(path);
                page
            };
            self.insert_leaf(key.clone(), CacheObject::Page(page), auto_commit)?;
        }
        let entry = self.leaves.get_mut(&key).expect("just inserted");
        entry.heat += 1;
        entry.dirty = true;
        Ok(entry.object.as_page_mut().expect("page entry"))
    }

    pub fn get_or_create_index(&mut self, name: &str, domain: usize, auto_commit: bool) -> Result<&mut BPTree> {
        let key = index_key(name);
        if !self.leaves.contains_key(&key) {
            let path = self.index_path(name);
            let tree = if dbfs::exists(&path) {
                let bytes = dbfs::read(&path)?;
                let mut r = crate::codec::Reader::new(&bytes);
                let mut tree = BPTree::decode(&mut r)?;
                tree.path = Some(path);
                tree
            } else {
                let mut tree = BPTree::new(name, domain);
                tree.path = Some(path);
                tree
            };
            self.insert_leaf(key.clone(), CacheObject::Index(tree), auto_commit)?;
        }
        let entry = self.leaves.get_mut(&key).expect("just inserted");
        entry.heat += 1;
        entry.dirty = true;
        Ok(entry.object.as_index_mut().expect("index entry"))
    }

    pub fn drop_index_cache(&mut self, name: &str) {
        self.leaves.shift_remove(&index_key(name));
    }

    pub fn dirty_names(&self) -> Vec<String> {
        self.leaves.iter().filter(|(_, e)| e.dirty).map(|(k, _)| k.clone()).collect()
    }

    pub fn commit(&mut self) -> Result<()> {
        trace!("{}: committing table branch ({} cached leaves)", self.table.name, self.leaves.len());
        self.table.commit()?;
        for entry in self.leaves.values_mut() {
            if entry.dirty {
                entry.object.commit()?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        debug!("{}: rolling back table branch", self.table.name);
        self.table.rollback()?;
        for entry in self.leaves.values_mut() {
            entry.object.rollback()?;
            entry.dirty = false;
        }
        Ok(())
    }
}

/// One open database: its `Database` and `Record` metadata, plus a
/// `TableBranch` per table touched this session.
#[derive(Debug)]
pub struct DbBranch {
    pub database: Database,
    pub record: Record,
    pub tables: IndexMap<String, TableBranch>,
}

impl DbBranch {
    pub fn new(database: Database, record: Record) -> Self {
        DbBranch { database, record, tables: IndexMap::new() }
    }

    pub fn table_branch(&mut self, name: &str) -> Option<&mut TableBranch> {
        self.tables.get_mut(name)
    }

    pub fn add_table_branch(&mut self, name: impl Into<String>, branch: TableBranch) {
        self.tables.insert(name.into(), branch);
    }

    pub fn drop_table_branch(&mut self, name: &str) {
        self.tables.shift_remove(name);
    }

    pub fn commit(&mut self) -> Result<()> {
        debug!("{}: committing database branch ({} tables cached)", self.database.name, self.tables.len());
        self.database.commit()?;
        self.record.commit()?;
        for branch in self.tables.values_mut() {
            branch.commit()?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        debug!("{}: rolling back database branch", self.database.name);
        self.database.rollback()?;
        self.record.rollback()?;
        for branch in self.tables.values_mut() {
            branch.rollback()?;
        }
        Ok(())
    }
}

/// Process-wide (within one `Engine`) pool of open databases, keyed by
/// name. Only one database is "current" at a time, matching the
/// source's single active-connection model.
#[derive(Debug)]
pub struct CachePool {
    pub root: PathBuf,
    current: Option<String>,
    branches: IndexMap<String, DbBranch>,
    auto_commit: bool,
}

impl CachePool {
    pub fn new(root: PathBuf) -> Self {
        CachePool { root, current: None, branches: IndexMap::new(), auto_commit: true }
    }

    pub fn set_auto_commit(&mut self, value: bool) {
        self.auto_commit = value;
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn current_db_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.branches.contains_key(name)
    }

    pub fn add_branch(&mut self, name: impl Into<String>, branch: DbBranch) {
        self.branches.insert(name.into(), branch);
    }

    pub fn drop_branch(&mut self, name: &str) {
        self.branches.shift_remove(name);
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
    }

    /// Switches the active database, committing whatever was active
    /// before — unconditionally, even when switching to the same name
    /// — whenever auto-commit is on. This literal per-statement
    /// commit-then-switch is what a transaction suspends by turning
    /// auto-commit off first.
    pub fn get_cache(&mut self, name: &str) -> Result<&mut DbBranch> {
        if self.auto_commit {
            if let Some(current) = self.current.clone() {
                if let Some(branch) = self.branches.get_mut(&current) {
                    branch.commit()?;
                }
            }
        } else {
            trace!("switching to database {} with auto-commit suspended", name);
        }
        self.current = Some(name.to_string());
        self.branches
            .get_mut(name)
            .ok_or_else(|| DbError::NotFound(format!("{} is not exists.", name)))
    }

    pub fn current_branch(&mut self) -> Result<&mut DbBranch> {
        let name = self.current.clone().ok_or_else(|| DbError::State("no database selected".into()))?;
        self.branches
            .get_mut(&name)
            .ok_or_else(|| DbError::NotFound(format!("{} is not exists.", name)))
    }

    pub fn flush_cache_to_disk(&mut self) -> Result<()> {
        info!("flushing {} open database branch(es) to disk", self.branches.len());
        for branch in self.branches.values_mut() {
            branch.commit()?;
        }
        Ok(())
    }

    pub fn rollback_all(&mut self) -> Result<()> {
        warn!("rolling back {} open database branch(es)", self.branches.len());
        for branch in self.branches.values_mut() {
            branch.rollback()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldConstraints, FieldSchema, FieldType, FieldValue};

    fn sample_table(dir: &std::path::Path) -> Table {
        let schema = vec![FieldSchema::new("id", FieldType::Int, FieldConstraints::PRIMARY, FieldValue::Null)];
        Table::new(dir.to_path_buf(), "shop", "items", schema, 2, 4)
    }

    #[test]
    fn evicts_coldest_leaf_past_size() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        let mut branch = TableBranch::new(table);
        branch.size = 2;
        branch.get_or_create_page(0, true).unwrap();
        branch.get_or_create_page(1, true).unwrap();
        branch.get_or_create_page(2, true).unwrap();
        assert!(branch.leaves.len() <= 2);
    }

    #[test]
    fn evicts_down_to_size_when_branch_grew_several_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        let mut branch = TableBranch::new(table);
        branch.size = 2;
        // Grow the branch well past its size cap while auto-commit is
        // suspended, the way a transaction would, then confirm a single
        // auto-commit insert brings it all the way back under size
        // instead of only shrinking it by one.
        for number in 0..6 {
            branch.get_or_create_page(number, false).unwrap();
        }
        assert_eq!(branch.leaves.len(), 6);
        branch.get_or_create_page(6, true).unwrap();
        assert!(branch.leaves.len() <= 2);
    }

    #[test]
    fn get_cache_commits_previous_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = CachePool::new(dir.path().to_path_buf());
        let db_a = Database::new(dir.path().join("a"), "a");
        let rec_a = Record::new(dir.path().join("a").join("a.rcd"), "a");
        pool.add_branch("a", DbBranch::new(db_a, rec_a));
        let db_b = Database::new(dir.path().join("b"), "b");
        let rec_b = Record::new(dir.path().join("b").join("b.rcd"), "b");
        pool.add_branch("b", DbBranch::new(db_b, rec_b));

        pool.get_cache("a").unwrap();
        pool.get_cache("b").unwrap();
        assert_eq!(pool.current_db_name(), Some("b"));
    }
}
