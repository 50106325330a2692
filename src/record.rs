//! Per-database metadata: table schemas and stored-procedure bodies.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::codec::{Reader, Writer};
use crate::errors::{DbError, Result};
use crate::field::FieldSchema;
use crate::fs as dbfs;

#[derive(Debug, Clone)]
pub struct ProcedureDef {
    pub params: Vec<String>,
    pub statements: Vec<String>,
}

impl ProcedureDef {
    fn encode(&self, w: &mut Writer) {
        w.write_seq(&self.params, |w, p| w.write_str(p));
        w.write_seq(&self.statements, |w, s| w.write_str(s));
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        let params = r.read_seq(|r| r.read_str())?;
        let statements = r.read_seq(|r| r.read_str())?;
        Ok(ProcedureDef { params, statements })
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub path: PathBuf,
    pub db_name: String,
    table_fields: IndexMap<String, Vec<FieldSchema>>,
    procedures: IndexMap<String, ProcedureDef>,
}

impl Record {
    pub fn new(path: PathBuf, db_name: impl Into<String>) -> Self {
        Record { path, db_name: db_name.into(), table_fields: IndexMap::new(), procedures: IndexMap::new() }
    }

    pub fn get_table_field(&self, table_name: &str) -> Result<&[FieldSchema]> {
        self.table_fields
            .get(table_name)
            .map(|v| v.as_slice())
            .ok_or_else(|| DbError::NotFound(format!("{} has no field record", table_name)))
    }

    pub fn add_table_field(&mut self, table_name: impl Into<String>, schema: Vec<FieldSchema>) {
        self.table_fields.insert(table_name.into(), schema);
    }

    pub fn delete_table_field(&mut self, table_name: &str) {
        self.table_fields.shift_remove(table_name);
    }

    pub fn create_procedure(&mut self, name: impl Into<String>, def: ProcedureDef) -> Result<()> {
        let name = name.into();
        if self.procedures.contains_key(&name) {
            return Err(DbError::Schema(format!("{} already exists", name)));
        }
        self.procedures.insert(name, def);
        Ok(())
    }

    pub fn get_procedure(&self, name: &str) -> Result<&ProcedureDef> {
        self.procedures
            .get(name)
            .ok_or_else(|| DbError::NotFound(format!("{} does not exist", name)))
    }

    pub fn list_procedures(&self) -> Vec<String> {
        self.procedures.keys().cloned().collect()
    }

    pub fn delete_procedure(&mut self, name: &str) -> Result<()> {
        if self.procedures.shift_remove(name).is_none() {
            return Err(DbError::NotFound(format!("{} does not exist", name)));
        }
        Ok(())
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_str(&self.db_name);
        w.write_seq(&self.table_fields.iter().collect::<Vec<_>>(), |w, (name, schema)| {
            w.write_str(name);
            w.write_seq(schema, |w, s| s.encode(w));
        });
        w.write_seq(&self.procedures.iter().collect::<Vec<_>>(), |w, (name, def)| {
            w.write_str(name);
            def.encode(w);
        });
    }

    pub fn decode(path: PathBuf, r: &mut Reader) -> Result<Self> {
        let db_name = r.read_str()?;
        let table_fields_vec = r.read_seq(|r| {
            let name = r.read_str()?;
            let schema = r.read_seq(FieldSchema::decode)?;
            Ok((name, schema))
        })?;
        let procedures_vec = r.read_seq(|r| {
            let name = r.read_str()?;
            let def = ProcedureDef::decode(r)?;
            Ok((name, def))
        })?;
        let mut table_fields = IndexMap::new();
        table_fields.extend(table_fields_vec);
        let mut procedures = IndexMap::new();
        procedures.extend(procedures_vec);
        Ok(Record { path, db_name, table_fields, procedures })
    }

    pub fn commit(&self) -> Result<()> {
        let mut w = Writer::new();
        self.encode(&mut w);
        dbfs::atomic_write(&self.path, &w.into_vec())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let bytes = dbfs::read(&self.path)?;
        let mut r = Reader::new(&bytes);
        let path = self.path.clone();
        *self = Record::decode(path, &mut r)?;
        Ok(())
    }

    pub fn load_or_create(path: PathBuf, db_name: &str) -> Result<Self> {
        if dbfs::exists(&path) {
            let bytes = dbfs::read(&path)?;
            let mut r = Reader::new(&bytes);
            Record::decode(path, &mut r)
        } else {
            let record = Record::new(path, db_name);
            record.commit()?;
            Ok(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldConstraints, FieldType, FieldValue};

    #[test]
    fn round_trips_schema_and_procedures() {
        let mut rec = Record::new(PathBuf::from("/tmp/doesnotmatter.rcd"), "shop");
        rec.add_table_field(
            "t",
            vec![FieldSchema::new("id", FieldType::Int, FieldConstraints::PRIMARY, FieldValue::Null)],
        );
        rec.create_procedure(
            "p1",
            ProcedureDef { params: vec!["x".into()], statements: vec!["SELECT * FROM t;".into()] },
        )
        .unwrap();

        let mut w = Writer::new();
        rec.encode(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let back = Record::decode(PathBuf::from("/tmp/doesnotmatter.rcd"), &mut r).unwrap();
        assert_eq!(back.get_table_field("t").unwrap().len(), 1);
        assert_eq!(back.get_procedure("p1").unwrap().params, vec!["x".to_string()]);
    }

    #[test]
    fn missing_table_field_errors() {
        let rec = Record::new(PathBuf::from("/tmp/x.rcd"), "shop");
        assert!(rec.get_table_field("missing").is_err());
    }
}
