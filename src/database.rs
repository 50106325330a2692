//! A Database owns a directory of Tables and their shared metadata
//! (`Record`).

use std::path::PathBuf;

use crate::codec::{Reader, Writer};
use crate::errors::{DbError, Result};
use crate::fs as dbfs;

#[derive(Debug, Clone)]
pub struct Database {
    pub path: PathBuf,
    pub name: String,
    tables: Vec<String>,
}

impl Database {
    pub fn new(path: PathBuf, name: impl Into<String>) -> Self {
        Database { path, name: name.into(), tables: Vec::new() }
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t == name)
    }

    pub fn create_table(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.has_table(&name) {
            return Err(DbError::Schema(format!("table {} already exists", name)));
        }
        self.tables.push(name);
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let pos = self
            .tables
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| DbError::NotFound(format!("table {} does not exist", name)))?;
        self.tables.remove(pos);
        Ok(())
    }

    fn obj_path(dir: &PathBuf, name: &str) -> PathBuf {
        let mut p = dir.clone();
        p.push(format!("{}.obj", name));
        p
    }

    pub fn load_or_create(dir: PathBuf, name: &str) -> Result<Self> {
        dbfs::ensure_dir(&dir)?;
        let path = Self::obj_path(&dir, name);
        if dbfs::exists(&path) {
            let bytes = dbfs::read(&path)?;
            let mut r = Reader::new(&bytes);
            Database::decode(dir, &mut r)
        } else {
            let db = Database::new(dir, name);
            db.commit()?;
            Ok(db)
        }
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_str(&self.name);
        w.write_seq(&self.tables, |w, t| w.write_str(t));
    }

    pub fn decode(dir: PathBuf, r: &mut Reader) -> Result<Self> {
        let name = r.read_str()?;
        let tables = r.read_seq(|r| r.read_str())?;
        Ok(Database { path: dir, name, tables })
    }

    pub fn commit(&self) -> Result<()> {
        let mut w = Writer::new();
        self.encode(&mut w);
        dbfs::atomic_write(&Self::obj_path(&self.path, &self.name), &w.into_vec())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let path = Self::obj_path(&self.path, &self.name);
        let bytes = dbfs::read(&path)?;
        let mut r = Reader::new(&bytes);
        let dir = self.path.clone();
        *self = Database::decode(dir, &mut r)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_drop_table() {
        let mut db = Database::new(PathBuf::from("/tmp/unused"), "shop");
        db.create_table("orders").unwrap();
        assert!(db.has_table("orders"));
        assert!(db.create_table("orders").is_err());
        db.drop_table("orders").unwrap();
        assert!(!db.has_table("orders"));
        assert!(db.drop_table("orders").is_err());
    }

    #[test]
    fn round_trips_through_codec() {
        let mut db = Database::new(PathBuf::from("/tmp/unused"), "shop");
        db.create_table("orders").unwrap();
        let mut w = Writer::new();
        db.encode(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let back = Database::decode(PathBuf::from("/tmp/unused"), &mut r).unwrap();
        assert_eq!(back.tables(), db.tables());
    }
}
