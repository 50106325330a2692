//! A Table's own metadata (`Table`) plus the row-level operations that
//! need live cache access (`impl TableBranch`): insert, delete, update,
//! search, and the condition planner that fuses index scans with
//! post-filters.

use std::collections::HashSet;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::cache::TableBranch;
use crate::codec::{Reader, Writer};
use crate::condition::Case;
use crate::errors::{DbError, Result};
use crate::field::{Field, FieldConstraints, FieldSchema, FieldType, FieldValue};
use crate::fs as dbfs;

pub type Row = IndexMap<String, FieldValue>;

#[derive(Debug, Clone)]
pub struct Table {
    pub path: PathBuf,
    pub db_name: String,
    pub name: String,
    pub schema: Vec<FieldSchema>,
    pub pages: Vec<usize>,
    pub indexes: IndexMap<String, String>,
    pub row_count: usize,
    pub page_size: usize,
    pub tree_domain: usize,
}

impl Table {
    pub fn new(
        path: PathBuf,
        db_name: impl Into<String>,
        name: impl Into<String>,
        schema: Vec<FieldSchema>,
        page_size: usize,
        tree_domain: usize,
    ) -> Self {
        Table {
            path,
            db_name: db_name.into(),
            name: name.into(),
            schema,
            pages: Vec::new(),
            indexes: IndexMap::new(),
            row_count: 0,
            page_size,
            tree_domain,
        }
    }

    pub fn primary_field(&self) -> Result<&FieldSchema> {
        self.schema
            .iter()
            .find(|f| f.constraints.contains(FieldConstraints::PRIMARY))
            .ok_or_else(|| DbError::Schema(format!("{} has no primary key", self.name)))
    }

    pub fn field_schema(&self, name: &str) -> Result<&FieldSchema> {
        self.schema
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| DbError::NotFound(format!("{} is not exists.", name)))
    }

    fn obj_path(&self) -> PathBuf {
        let mut p = self.path.clone();
        p.push(format!("{}.obj", self.name));
        p
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_str(&self.db_name);
        w.write_str(&self.name);
        w.write_seq(&self.schema, |w, s| s.encode(w));
        w.write_seq(&self.pages, |w, p| w.write_u64(*p as u64));
        w.write_seq(&self.indexes.iter().collect::<Vec<_>>(), |w, (k, v)| {
            w.write_str(k);
            w.write_str(v);
        });
        w.write_u64(self.row_count as u64);
        w.write_u64(self.page_size as u64);
        w.write_u64(self.tree_domain as u64);
    }

    pub fn decode(path: PathBuf, r: &mut Reader) -> Result<Self> {
        let db_name = r.read_str()?;
        let name = r.read_str()?;
        let schema = r.read_seq(FieldSchema::decode)?;
        let pages = r.read_seq(|r| Ok(r.read_u64()? as usize))?;
        let indexes_vec = r.read_seq(|r| {
            let k = r.read_str()?;
            let v = r.read_str()?;
            Ok((k, v))
        })?;
        let row_count = r.read_u64()? as usize;
        let page_size = r.read_u64()? as usize;
        let tree_domain = r.read_u64()? as usize;
        let mut indexes = IndexMap::new();
        indexes.extend(indexes_vec);
        Ok(Table { path, db_name, name, schema, pages, indexes, row_count, page_size, tree_domain })
    }

    pub fn commit(&self) -> Result<()> {
        let mut w = Writer::new();
        self.encode(&mut w);
        dbfs::atomic_write(&self.obj_path(), &w.into_vec())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let bytes = dbfs::read(&self.obj_path())?;
        let mut r = Reader::new(&bytes);
        let path = self.path.clone();
        *self = Table::decode(path, &mut r)?;
        Ok(())
    }

    pub fn load_or_create(
        path: PathBuf,
        db_name: &str,
        name: &str,
        schema: Vec<FieldSchema>,
        page_size: usize,
        tree_domain: usize,
    ) -> Result<Self> {
        let mut obj_path = path.clone();
        obj_path.push(format!("{}.obj", name));
        if dbfs::exists(&obj_path) {
            let bytes = dbfs::read(&obj_path)?;
            let mut r = Reader::new(&bytes);
            Table::decode(path, &mut r)
        } else {
            let table = Table::new(path, db_name, name, schema, page_size, tree_domain);
            table.commit()?;
            Ok(table)
        }
    }
}

/// Converts a primary-key value into its 0-based logical row index.
/// Row placement is keyed by the primary key itself (§4.3): a
/// monotonically auto-incrementing key yields dense pages, a sparse one
/// yields sparse pages.
fn logical_row(pk: i64) -> usize {
    (pk - 1).max(0) as usize
}

impl TableBranch {
    fn pk_name(&self) -> Result<String> {
        Ok(self.table.primary_field()?.name.clone())
    }

    fn page_num_for_pk(&self, pk: i64) -> usize {
        logical_row(pk) / self.table.page_size
    }

    /// Ensures a page exists in the table's page list with every schema
    /// column present (freshly created pages start with no rows at
    /// all — the first row written fills every column in lockstep).
    fn ensure_page(&mut self, page_num: usize, auto_commit: bool) -> Result<()> {
        let schema = self.table.schema.clone();
        let page = self.get_or_create_page(page_num, auto_commit)?;
        for field_schema in &schema {
            if page.field(&field_schema.name).is_none() {
                page.add_field(field_schema.name.clone(), Field::new(field_schema.clone()), field_schema.default.clone())?;
            }
        }
        if !self.table.pages.contains(&page_num) {
            self.table.pages.push(page_num);
            self.table.pages.sort_unstable();
        }
        Ok(())
    }

    pub fn insert_row(&mut self, mut values: Row, auto_commit: bool) -> Result<i64> {
        let schema = self.table.schema.clone();
        let pk_name = self.pk_name()?;

        if !values.contains_key(&pk_name) {
            values.insert(pk_name.clone(), FieldValue::Int(self.table.row_count as i64 + 1));
        }
        let pk_value = match values.get(&pk_name) {
            Some(FieldValue::Int(v)) => *v,
            _ => return Err(DbError::Constraint(format!("{}: primary key must be an integer", pk_name))),
        };

        let page_num = self.page_num_for_pk(pk_value);
        let page_size = self.table.page_size;
        let row = logical_row(pk_value);
        self.ensure_page(page_num, auto_commit)?;

        // Phase 1: validate every column without mutating anything, so a
        // failure partway through never leaves a page with ragged
        // column lengths.
        {
            let page = self.get_or_create_page(page_num, auto_commit)?;
            for field_schema in &schema {
                let candidate = values.get(&field_schema.name).cloned().unwrap_or(FieldValue::Null);
                let field = page
                    .field(&field_schema.name)
                    .ok_or_else(|| DbError::Schema(format!("{} missing from page", field_schema.name)))?;
                field.check_value(candidate)?;
            }
        }

        // Phase 2: commit every column.
        {
            let page = self.get_or_create_page(page_num, auto_commit)?;
            for field_schema in &schema {
                let candidate = values.get(&field_schema.name).cloned().unwrap_or(FieldValue::Null);
                let field = page.field_mut(&field_schema.name).expect("validated above");
                field.add(candidate)?;
            }
        }

        let index_fields: Vec<(String, String)> =
            self.table.indexes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let domain = self.table.tree_domain;
        for (index_name, field_name) in &index_fields {
            let value = {
                let page = self.get_or_create_page(page_num, auto_commit)?;
                page.field(field_name).expect("schema field").get(row % page_size).cloned().unwrap_or(FieldValue::Null)
            };
            let tree = self.get_or_create_index(index_name, domain, auto_commit)?;
            tree.insert(value, pk_value);
        }

        self.table.row_count += 1;
        Ok(pk_value)
    }

    /// Partitions `conditions` into indexed/non-indexed, resolves the
    /// indexed half through B+-tree operations and intersects the
    /// results, then filters the remainder by direct evaluation —
    /// against a full scan if no condition was indexed, or against the
    /// already-narrowed candidate set otherwise. Returns matches as
    /// `(primary key, page number, offset within page)`, ordered by
    /// physical row position.
    fn resolve_rows(&mut self, conditions: &IndexMap<String, Case>, auto_commit: bool) -> Result<Vec<(i64, usize, usize)>> {
        let schema = self.table.schema.clone();
        let pk_name = self.pk_name()?;
        let page_size = self.table.page_size;
        let domain = self.table.tree_domain;
        let indexes = self.table.indexes.clone();

        for field_name in conditions.keys() {
            if !schema.iter().any(|f| &f.name == field_name) {
                return Err(DbError::NotFound(format!("{} is not exists.", field_name)));
            }
        }

        if conditions.is_empty() {
            return self.full_scan_pks(&pk_name, auto_commit);
        }

        let mut indexed: Vec<(String, Case)> = Vec::new();
        let mut unindexed: Vec<(String, Case)> = Vec::new();
        for (field_name, case) in conditions {
            let index_name = indexes.iter().find(|(_, f)| *f == field_name).map(|(k, _)| k.clone());
            match index_name {
                Some(ix) if case.is_indexable() => indexed.push((ix, case.clone())),
                _ => unindexed.push((field_name.clone(), case.clone())),
            }
        }

        let mut candidate: Option<HashSet<i64>> = None;
        for (index_name, case) in &indexed {
            let tree = self.get_or_create_index(index_name, domain, auto_commit)?;
            let set: HashSet<i64> = match case {
                Case::Eq(v) => tree.get_data(v).into_iter().collect(),
                Case::NotEq(v) => {
                    let excluded = tree.get_data(v);
                    tree.traversal().into_iter().map(|(_, pk)| pk).filter(|pk| Some(*pk) != excluded).collect()
                }
                Case::Lt(v) => tree.get_range(None, true, Some(v), false).into_iter().map(|(_, pk)| pk).collect(),
                Case::Le(v) => tree.get_range(None, true, Some(v), true).into_iter().map(|(_, pk)| pk).collect(),
                Case::Gt(v) => tree.get_range(Some(v), false, None, true).into_iter().map(|(_, pk)| pk).collect(),
                Case::Ge(v) => tree.get_range(Some(v), true, None, true).into_iter().map(|(_, pk)| pk).collect(),
                Case::In(vs) => vs.iter().filter_map(|v| tree.get_data(v)).collect(),
                Case::NotIn(vs) => {
                    let excluded: HashSet<i64> = vs.iter().filter_map(|v| tree.get_data(v)).collect();
                    tree.traversal().into_iter().map(|(_, pk)| pk).filter(|pk| !excluded.contains(pk)).collect()
                }
                Case::Range(lo, hi) => tree.get_range(Some(lo), true, Some(hi), true).into_iter().map(|(_, pk)| pk).collect(),
                Case::Like(_) => unreachable!("LIKE is never routed to an index"),
            };
            candidate = Some(match candidate {
                Some(existing) => existing.intersection(&set).copied().collect(),
                None => set,
            });
            if candidate.as_ref().is_some_and(HashSet::is_empty) {
                return Ok(Vec::new());
            }
        }

        let mut result_pks: Vec<i64> = match candidate {
            Some(set) => set.into_iter().collect(),
            None => {
                let all = self.full_scan_pks(&pk_name, auto_commit)?;
                all.into_iter().map(|(pk, _, _)| pk).collect()
            }
        };

        for (field_name, case) in &unindexed {
            let ty = schema.iter().find(|f| &f.name == field_name).expect("checked above").ty;
            let mut kept = Vec::with_capacity(result_pks.len());
            for pk in &result_pks {
                let page_num = self.page_num_for_pk(*pk);
                let page = self.get_or_create_page(page_num, auto_commit)?;
                let Some(pk_field) = page.field(&pk_name) else { continue };
                let Some(offset) = pk_field.get_real_index(&FieldValue::Int(*pk)) else { continue };
                let field = page
                    .field(field_name)
                    .ok_or_else(|| DbError::NotFound(format!("{} is not exists.", field_name)))?;
                let value = field.get(offset).cloned().unwrap_or(FieldValue::Null);
                if case.evaluate(&value, ty)? {
                    kept.push(*pk);
                }
            }
            result_pks = kept;
        }

        let mut out = Vec::with_capacity(result_pks.len());
        for pk in result_pks {
            let page_num = self.page_num_for_pk(pk);
            let page = self.get_or_create_page(page_num, auto_commit)?;
            if let Some(offset) = page.field(&pk_name).and_then(|f| f.get_real_index(&FieldValue::Int(pk))) {
                out.push((pk, page_num, offset));
            }
        }
        out.sort_by_key(|(_, page_num, offset)| (*page_num, *offset));
        Ok(out)
    }

    fn full_scan_pks(&mut self, pk_name: &str, auto_commit: bool) -> Result<Vec<(i64, usize, usize)>> {
        let mut out = Vec::new();
        let pages: Vec<usize> = self.table.pages.clone();
        for page_num in pages {
            let page = self.get_or_create_page(page_num, auto_commit)?;
            if let Some(pk_field) = page.field(pk_name) {
                for (offset, value) in pk_field.values().iter().enumerate() {
                    if let FieldValue::Int(pk) = value {
                        out.push((*pk, page_num, offset));
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn search_rows(
        &mut self,
        fields: &[String],
        conditions: &IndexMap<String, Case>,
        desc: bool,
        auto_commit: bool,
    ) -> Result<Vec<Row>> {
        let matches = self.resolve_rows(conditions, auto_commit)?;
        let project_fields: Vec<String> = if fields.is_empty() {
            self.table.schema.iter().map(|f| f.name.clone()).collect()
        } else {
            fields.to_vec()
        };

        let mut rows = Vec::with_capacity(matches.len());
        for (_, page_num, offset) in &matches {
            let page = self.get_or_create_page(*page_num, auto_commit)?;
            let mut row = Row::new();
            for field_name in &project_fields {
                let field = page
                    .field(field_name)
                    .ok_or_else(|| DbError::NotFound(format!("{} is not exists.", field_name)))?;
                row.insert(field_name.clone(), field.get(*offset).cloned().unwrap_or(FieldValue::Null));
            }
            rows.push(row);
        }
        if desc {
            rows.reverse();
        }
        Ok(rows)
    }

    pub fn delete_rows(&mut self, conditions: &IndexMap<String, Case>, auto_commit: bool) -> Result<usize> {
        let matches = self.resolve_rows(conditions, auto_commit)?;
        let schema = self.table.schema.clone();
        let index_fields: Vec<(String, String)> =
            self.table.indexes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let domain = self.table.tree_domain;

        let mut by_page: std::collections::BTreeMap<usize, Vec<usize>> = std::collections::BTreeMap::new();
        for (_, page_num, offset) in &matches {
            by_page.entry(*page_num).or_default().push(*offset);
        }

        for (page_num, mut offsets) in by_page {
            offsets.sort_unstable();
            offsets.dedup();
            // Highest offset first: removing a later row never shifts
            // the position of one we still need to delete.
            for offset in offsets.into_iter().rev() {
                let mut removed: Vec<(String, FieldValue)> = Vec::with_capacity(schema.len());
                {
                    let page = self.get_or_create_page(page_num, auto_commit)?;
                    for field_schema in &schema {
                        let field = page.field_mut(&field_schema.name).expect("schema field");
                        let value = field.delete(offset)?;
                        removed.push((field_schema.name.clone(), value));
                    }
                }
                for (index_name, field_name) in &index_fields {
                    if let Some((_, value)) = removed.iter().find(|(n, _)| n == field_name) {
                        let tree = self.get_or_create_index(index_name, domain, auto_commit)?;
                        tree.delete(value)?;
                    }
                }
            }
        }

        self.table.row_count -= matches.len();
        Ok(matches.len())
    }

    pub fn update_rows(&mut self, data: &Row, conditions: &IndexMap<String, Case>, auto_commit: bool) -> Result<usize> {
        let matches = self.resolve_rows(conditions, auto_commit)?;
        let pk_name = self.pk_name()?;
        let index_fields: Vec<(String, String)> =
            self.table.indexes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let domain = self.table.tree_domain;

        for (old_pk, page_num, offset) in &matches {
            for (field_name, new_value) in data {
                let old_value = {
                    let page = self.get_or_create_page(*page_num, auto_commit)?;
                    let field = page
                        .field_mut(field_name)
                        .ok_or_else(|| DbError::NotFound(format!("{} is not exists.", field_name)))?;
                    let old_value = field.get(*offset).cloned().unwrap_or(FieldValue::Null);
                    field.modify(*offset, new_value.clone())?;
                    old_value
                };
                if let Some((index_name, _)) = index_fields.iter().find(|(_, f)| f == field_name) {
                    let tree = self.get_or_create_index(index_name, domain, auto_commit)?;
                    tree.update_key(&old_value, new_value.clone())?;
                }
            }

            if let Some(new_pk_value) = data.get(&pk_name) {
                let FieldValue::Int(new_pk) = new_pk_value else {
                    return Err(DbError::Constraint("primary key must remain an integer".into()));
                };
                // The primary key itself changed: every index's satellite
                // (which stores the PK, not the row position) needs to
                // point at the new value, wherever its key currently
                // points at the old one.
                for (index_name, _) in &index_fields {
                    let tree = self.get_or_create_index(index_name, domain, auto_commit)?;
                    if let Some(key) = tree.get_key(*old_pk) {
                        tree.update_item(&key, *new_pk)?;
                    }
                }
            }
        }
        Ok(matches.len())
    }

    pub fn create_index(&mut self, index_name: &str, field_name: &str, auto_commit: bool) -> Result<()> {
        if self.table.indexes.contains_key(index_name) {
            return Err(DbError::Schema(format!("{} is exist.", index_name)));
        }
        if self.table.indexes.values().any(|f| f == field_name) {
            return Err(DbError::Schema(format!("There is already an index to {}.", field_name)));
        }
        let field_schema = self.table.field_schema(field_name)?.clone();
        if field_schema.constraints.contains(FieldConstraints::PRIMARY) {
            return Err(DbError::Index("do not need to create an index for the primary key".into()));
        }
        if !matches!(field_schema.ty, FieldType::Int | FieldType::Float) {
            return Err(DbError::Index(format!("{} data type is not supported for an index", field_name)));
        }
        let eligible = field_schema.constraints.contains(FieldConstraints::AUTO_INCREMENT)
            || (field_schema.constraints.contains(FieldConstraints::NOT_NULL)
                && field_schema.constraints.contains(FieldConstraints::UNIQUE));
        if !eligible {
            return Err(DbError::Index(format!("{} field key is incorrect", field_name)));
        }

        let domain = self.table.tree_domain;
        let pk_name = self.pk_name()?;
        let pages: Vec<usize> = self.table.pages.clone();
        {
            let _ = self.get_or_create_index(index_name, domain, auto_commit)?;
        }
        for page_num in pages {
            let page = self.get_or_create_page(page_num, auto_commit)?;
            let values = page.field(field_name).expect("schema field").values().to_vec();
            let pks = page.field(&pk_name).expect("schema field").values().to_vec();
            let pairs: Vec<(FieldValue, i64)> = values
                .into_iter()
                .zip(pks)
                .filter_map(|(v, pk)| match pk {
                    FieldValue::Int(pk) => Some((v, pk)),
                    _ => None,
                })
                .collect();
            let tree = self.get_or_create_index(index_name, domain, auto_commit)?;
            for (v, pk) in pairs {
                tree.insert(v, pk);
            }
        }
        self.table.indexes.insert(index_name.to_string(), field_name.to_string());
        Ok(())
    }

    pub fn drop_index(&mut self, index_name: &str) -> Result<()> {
        if self.table.indexes.shift_remove(index_name).is_none() {
            return Err(DbError::NotFound(format!("{} is not exists.", index_name)));
        }
        self.drop_index_cache(index_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TableBranch;
    use crate::field::{FieldConstraints, FieldSchema, FieldType, FieldValue};

    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("id", FieldType::Int, FieldConstraints::PRIMARY | FieldConstraints::AUTO_INCREMENT, FieldValue::Null),
            FieldSchema::new("name", FieldType::Text, FieldConstraints::empty(), FieldValue::Null),
            FieldSchema::new(
                "score",
                FieldType::Int,
                FieldConstraints::NOT_NULL | FieldConstraints::UNIQUE,
                FieldValue::Null,
            ),
        ]
    }

    fn branch(dir: &std::path::Path) -> TableBranch {
        let table = Table::new(dir.to_path_buf(), "shop", "items", schema(), 2, 4);
        TableBranch::new(table)
    }

    fn row(id: Option<i64>, name: &str, score: i64) -> Row {
        let mut r = Row::new();
        if let Some(id) = id {
            r.insert("id".into(), FieldValue::Int(id));
        }
        r.insert("name".into(), FieldValue::Text(name.to_string()));
        r.insert("score".into(), FieldValue::Int(score));
        r
    }

    #[test]
    fn insert_assigns_auto_increment_pk_and_places_by_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = branch(dir.path());
        for i in 1..=5 {
            let pk = b.insert_row(row(None, &format!("n{}", i), i * 10), true).unwrap();
            assert_eq!(pk, i);
        }
        assert_eq!(b.table.row_count, 5);
        // page_size = 2: pages 0,1 hold two rows each, page 2 holds one.
        assert_eq!(b.table.pages, vec![0, 1, 2]);
    }

    #[test]
    fn search_with_indexed_and_unindexed_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = branch(dir.path());
        for i in 1..=4 {
            b.insert_row(row(None, if i % 2 == 0 { "even" } else { "odd" }, i * 10), true).unwrap();
        }
        b.create_index("score_idx", "score", true).unwrap();

        let mut conditions = IndexMap::new();
        conditions.insert("score".to_string(), Case::Ge(FieldValue::Int(20)));
        conditions.insert("name".to_string(), Case::Eq(FieldValue::Text("even".to_string())));
        let rows = b.search_rows(&[], &conditions, false, true).unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.get("name"), Some(&FieldValue::Text("even".to_string())));
        }
    }

    #[test]
    fn delete_then_row_count_and_index_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = branch(dir.path());
        for i in 1..=3 {
            b.insert_row(row(None, "n", i * 10), true).unwrap();
        }
        b.create_index("score_idx", "score", true).unwrap();
        let mut conditions = IndexMap::new();
        conditions.insert("score".to_string(), Case::Eq(FieldValue::Int(20)));
        let deleted = b.delete_rows(&conditions, true).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(b.table.row_count, 2);

        let remaining = b.search_rows(&[], &IndexMap::new(), false, true).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn update_primary_key_rewrites_index_satellite() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = branch(dir.path());
        b.insert_row(row(Some(1), "a", 10), true).unwrap();
        b.insert_row(row(Some(2), "b", 20), true).unwrap();
        b.create_index("score_idx", "score", true).unwrap();

        let mut conditions = IndexMap::new();
        conditions.insert("id".to_string(), Case::Eq(FieldValue::Int(1)));
        let mut data = Row::new();
        data.insert("id".to_string(), FieldValue::Int(100));
        let updated = b.update_rows(&data, &conditions, true).unwrap();
        assert_eq!(updated, 1);

        let tree = b.get_or_create_index("score_idx", 4, true).unwrap();
        assert_eq!(tree.get_data(&FieldValue::Int(10)), Some(100));
    }
}
