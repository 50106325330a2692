//! A Page is a horizontal slice of a table: one Field per column, all of
//! equal length.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::codec::{Reader, Writer};
use crate::errors::{DbError, Result};
use crate::field::{Field, FieldValue};
use crate::fs as dbfs;

#[derive(Debug, Clone)]
pub struct Page {
    pub path: Option<PathBuf>,
    pub number: usize,
    fields: IndexMap<String, Field>,
}

impl Page {
    pub fn new(number: usize) -> Self {
        Page { path: None, number, fields: IndexMap::new() }
    }

    pub fn row_count(&self) -> usize {
        self.fields.values().next().map(|f| f.len()).unwrap_or(0)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.get_mut(name)
    }

    pub fn fields(&self) -> &IndexMap<String, Field> {
        &self.fields
    }

    /// Adds a field to the page. If the page already has rows, the new
    /// field must either come pre-filled to the same length, or be
    /// empty — in which case it is back-filled with `filler`.
    pub fn add_field(&mut self, name: impl Into<String>, mut field: Field, filler: FieldValue) -> Result<()> {
        let current_len = self.row_count();
        if self.fields.is_empty() {
            self.fields.insert(name.into(), field);
            return Ok(());
        }
        if field.is_empty() {
            field.backfill(current_len, filler)?;
        } else if field.len() != current_len {
            return Err(DbError::Schema(format!(
                "field length {} does not match page length {}",
                field.len(),
                current_len
            )));
        }
        self.fields.insert(name.into(), field);
        Ok(())
    }

    /// Row-major projection of every column, in schema order.
    pub fn get_data(&self) -> Vec<Vec<FieldValue>> {
        let len = self.row_count();
        let mut rows = Vec::with_capacity(len);
        for row in 0..len {
            let mut record = Vec::with_capacity(self.fields.len());
            for field in self.fields.values() {
                record.push(field.get(row).cloned().unwrap_or(FieldValue::Null));
            }
            rows.push(record);
        }
        rows
    }

    /// Every field on this page must report the same length.
    pub fn check_uniform(&self) -> Result<()> {
        let mut lengths = self.fields.values().map(|f| f.len());
        if let Some(first) = lengths.next() {
            if lengths.any(|l| l != first) {
                return Err(DbError::Schema(format!("page {} has non-uniform field lengths", self.number)));
            }
        }
        Ok(())
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u32(self.number as u32);
        w.write_seq(&self.fields.iter().collect::<Vec<_>>(), |w, (name, field)| {
            w.write_str(name);
            field.encode(w);
        });
    }

    pub fn decode(r: &mut Reader) -> Result<Self> {
        let number = r.read_u32()? as usize;
        let entries = r.read_seq(|r| {
            let name = r.read_str()?;
            let field = Field::decode(r)?;
            Ok((name, field))
        })?;
        let mut fields = IndexMap::new();
        for (name, field) in entries {
            fields.insert(name, field);
        }
        Ok(Page { path: None, number, fields })
    }

    pub fn commit(&self) -> Result<()> {
        if let Some(path) = &self.path {
            trace!("page {}: committing to {}", self.number, path.display());
            let mut w = Writer::new();
            self.encode(&mut w);
            dbfs::atomic_write(path, &w.into_vec())?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if let Some(path) = self.path.clone() {
            debug!("page {}: rolling back from {}", self.number, path.display());
            let bytes = dbfs::read(&path)?;
            let mut r = Reader::new(&bytes);
            let mut reloaded = Page::decode(&mut r)?;
            reloaded.path = Some(path);
            *self = reloaded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldConstraints, FieldSchema, FieldType};

    fn int_field(name: &str, values: &[i64]) -> Field {
        let mut f = Field::new(FieldSchema::new(name, FieldType::Int, FieldConstraints::empty(), FieldValue::Null));
        for v in values {
            f.add(FieldValue::Int(*v)).unwrap();
        }
        f
    }

    #[test]
    fn rejects_mismatched_length() {
        let mut page = Page::new(0);
        page.add_field("a", int_field("a", &[1, 2, 3]), FieldValue::Null).unwrap();
        let err = page.add_field("b", int_field("b", &[1, 2]), FieldValue::Null);
        assert!(err.is_err());
    }

    #[test]
    fn backfills_empty_field() {
        let mut page = Page::new(0);
        page.add_field("a", int_field("a", &[1, 2, 3]), FieldValue::Null).unwrap();
        page.add_field("b", int_field("b", &[]), FieldValue::Int(0)).unwrap();
        assert_eq!(page.field("b").unwrap().len(), 3);
        page.check_uniform().unwrap();
    }

    #[test]
    fn round_trips_through_codec() {
        let mut page = Page::new(3);
        page.add_field("a", int_field("a", &[1, 2, 3]), FieldValue::Null).unwrap();
        let mut w = Writer::new();
        page.encode(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let back = Page::decode(&mut r).unwrap();
        assert_eq!(back.get_data(), page.get_data());
        assert_eq!(back.number, 3);
    }
}
