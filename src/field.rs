//! Typed columns with per-column constraint enforcement.

use crate::codec::{Reader, Writer};
use crate::errors::{DbError, Result};

/// The three column types the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Float,
    Text,
}

impl FieldType {
    fn tag(self) -> u8 {
        match self {
            FieldType::Int => 0,
            FieldType::Float => 1,
            FieldType::Text => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(FieldType::Int),
            1 => Ok(FieldType::Float),
            2 => Ok(FieldType::Text),
            other => Err(DbError::Schema(format!("unknown field type tag {}", other))),
        }
    }
}

/// A single cell. `Null` only ever appears transiently (e.g. as the
/// "empty value" sentinel passed into `check_value`) — a stored column
/// never retains `Null` once `check_value` has substituted a default or
/// auto-increment value, unless the field allows it explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl FieldValue {
    pub fn type_of(&self) -> Option<FieldType> {
        match self {
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::Float(_) => Some(FieldType::Float),
            FieldValue::Text(_) => Some(FieldType::Text),
            FieldValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn matches_type(&self, ty: FieldType) -> bool {
        matches!(
            (self, ty),
            (FieldValue::Int(_), FieldType::Int)
                | (FieldValue::Float(_), FieldType::Float)
                | (FieldValue::Text(_), FieldType::Text)
        )
    }

    /// Total order used by the B+-tree and by range/LIKE comparisons.
    /// Panics only if the two values are of different, non-numeric types,
    /// which callers must rule out before comparing (schema/index setup
    /// guarantees a single type per indexed column).
    pub fn cmp_value(&self, other: &FieldValue) -> std::cmp::Ordering {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
            (FieldValue::Float(a), FieldValue::Float(b)) => {
                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
            }
            (FieldValue::Int(a), FieldValue::Float(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
            }
            (FieldValue::Float(a), FieldValue::Int(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(std::cmp::Ordering::Equal)
            }
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }

    pub fn encode(&self, w: &mut Writer) {
        match self {
            FieldValue::Null => w.write_u8(0),
            FieldValue::Int(v) => {
                w.write_u8(1);
                w.write_i64(*v);
            }
            FieldValue::Float(v) => {
                w.write_u8(2);
                w.write_f64(*v);
            }
            FieldValue::Text(v) => {
                w.write_u8(3);
                w.write_str(v);
            }
        }
    }

    pub fn decode(r: &mut Reader) -> Result<Self> {
        Ok(match r.read_u8()? {
            0 => FieldValue::Null,
            1 => FieldValue::Int(r.read_i64()?),
            2 => FieldValue::Float(r.read_f64()?),
            3 => FieldValue::Text(r.read_str()?),
            other => return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown field value tag {}", other),
            ))),
        })
    }
}

bitflags! {
    /// Constraint set on a column. Combinations are validated once, at
    /// schema-creation time, by `FieldSchema::validate`.
    #[derive(Default)]
    pub struct FieldConstraints: u8 {
        const PRIMARY        = 0b00001;
        const UNIQUE         = 0b00010;
        const NOT_NULL       = 0b00100;
        const AUTO_INCREMENT = 0b01000;
    }
}

/// Column definition, immutable once the table is created.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub ty: FieldType,
    pub constraints: FieldConstraints,
    pub default: FieldValue,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, ty: FieldType, constraints: FieldConstraints, default: FieldValue) -> Self {
        FieldSchema {
            name: name.into(),
            ty,
            constraints,
            default,
        }
    }

    /// Rejects illegal constraint combinations at schema-creation time.
    pub fn validate(&self) -> Result<()> {
        let c = self.constraints;
        if c.contains(FieldConstraints::AUTO_INCREMENT) && !c.contains(FieldConstraints::PRIMARY) {
            return Err(DbError::Schema(format!(
                "{}: AUTO_INCREMENT requires PRIMARY",
                self.name
            )));
        }
        if c.contains(FieldConstraints::AUTO_INCREMENT) && self.ty != FieldType::Int {
            return Err(DbError::Schema(format!(
                "{}: AUTO_INCREMENT requires an INT column",
                self.name
            )));
        }
        if c.contains(FieldConstraints::UNIQUE) && !self.default.is_null() {
            return Err(DbError::Schema(format!(
                "{}: UNIQUE columns may not carry a default value",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_indexable(&self) -> bool {
        matches!(self.ty, FieldType::Int | FieldType::Float)
            && !self.constraints.contains(FieldConstraints::PRIMARY)
            && (self.constraints.contains(FieldConstraints::AUTO_INCREMENT)
                || (self.constraints.contains(FieldConstraints::NOT_NULL)
                    && self.constraints.contains(FieldConstraints::UNIQUE)))
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_str(&self.name);
        w.write_u8(self.ty.tag());
        w.write_u8(self.constraints.bits());
        self.default.encode(w);
    }

    pub fn decode(r: &mut Reader) -> Result<Self> {
        let name = r.read_str()?;
        let ty = FieldType::from_tag(r.read_u8()?)?;
        let constraints = FieldConstraints::from_bits_truncate(r.read_u8()?);
        let default = FieldValue::decode(r)?;
        Ok(FieldSchema { name, ty, constraints, default })
    }
}

/// A single column's data plus its constraints.
#[derive(Debug, Clone)]
pub struct Field {
    pub schema: FieldSchema,
    values: Vec<FieldValue>,
}

impl Field {
    pub fn new(schema: FieldSchema) -> Self {
        Field { schema, values: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get_real_index(&self, value: &FieldValue) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }

    /// The constraint pipeline described in the field column design:
    /// substitute empties, then check duplicate/null/type in order.
    /// Returns the normalized value to store; does not mutate the field.
    pub fn check_value(&self, value: FieldValue) -> Result<FieldValue> {
        let c = self.schema.constraints;
        let mut value = value;

        if value.is_null() {
            if c.contains(FieldConstraints::AUTO_INCREMENT) {
                value = FieldValue::Int(self.len() as i64 + 1);
            } else if !self.schema.default.is_null() {
                value = self.schema.default.clone();
            }
        }

        if (c.contains(FieldConstraints::AUTO_INCREMENT)
            || c.contains(FieldConstraints::PRIMARY)
            || c.contains(FieldConstraints::UNIQUE))
            && self.get_real_index(&value).is_some()
        {
            return Err(DbError::Constraint(format!(
                "{}: duplicate value for a primary/unique/auto-increment column",
                self.schema.name
            )));
        }

        if (c.contains(FieldConstraints::PRIMARY) || c.contains(FieldConstraints::NOT_NULL))
            && value.is_null()
        {
            return Err(DbError::Constraint(format!(
                "{}: null not allowed",
                self.schema.name
            )));
        }

        if !value.is_null() && !value.matches_type(self.schema.ty) {
            return Err(DbError::Constraint(format!(
                "{}: value type does not match column type",
                self.schema.name
            )));
        }

        Ok(value)
    }

    pub fn add(&mut self, value: FieldValue) -> Result<()> {
        let normalized = self.check_value(value)?;
        self.values.push(normalized);
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<FieldValue> {
        if index >= self.values.len() {
            return Err(DbError::NotFound(format!(
                "{}: row index {} out of range",
                self.schema.name, index
            )));
        }
        Ok(self.values.remove(index))
    }

    pub fn modify(&mut self, index: usize, value: FieldValue) -> Result<()> {
        if index >= self.values.len() {
            return Err(DbError::NotFound(format!(
                "{}: row index {} out of range",
                self.schema.name, index
            )));
        }
        // Run the check against the field without the value being
        // replaced, so a value unchanged in position doesn't trip the
        // duplicate check against itself.
        let mut without_current = self.clone();
        without_current.values.remove(index);
        let normalized = without_current.check_value(value)?;
        self.values[index] = normalized;
        Ok(())
    }

    /// Backfill an empty field up to `len` entries when it's attached to
    /// a page that already holds other, longer columns.
    pub fn backfill(&mut self, len: usize, filler: FieldValue) -> Result<()> {
        while self.values.len() < len {
            self.add(filler.clone())?;
        }
        Ok(())
    }

    pub fn encode(&self, w: &mut Writer) {
        self.schema.encode(w);
        w.write_seq(&self.values, |w, v| v.encode(w));
    }

    pub fn decode(r: &mut Reader) -> Result<Self> {
        let schema = FieldSchema::decode(r)?;
        let values = r.read_seq(FieldValue::decode)?;
        Ok(Field { schema, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_schema(name: &str, constraints: FieldConstraints) -> FieldSchema {
        FieldSchema::new(name, FieldType::Int, constraints, FieldValue::Null)
    }

    #[test]
    fn auto_increment_fills_empty_values() {
        let mut f = Field::new(int_schema(
            "id",
            FieldConstraints::PRIMARY | FieldConstraints::AUTO_INCREMENT,
        ));
        f.add(FieldValue::Null).unwrap();
        f.add(FieldValue::Null).unwrap();
        assert_eq!(f.get(0), Some(&FieldValue::Int(1)));
        assert_eq!(f.get(1), Some(&FieldValue::Int(2)));
    }

    #[test]
    fn duplicate_primary_key_rejected() {
        let mut f = Field::new(int_schema("id", FieldConstraints::PRIMARY));
        f.add(FieldValue::Int(1)).unwrap();
        assert!(f.add(FieldValue::Int(1)).is_err());
    }

    #[test]
    fn duplicate_null_rejected_on_unique() {
        let mut f = Field::new(int_schema("k", FieldConstraints::UNIQUE));
        f.add(FieldValue::Null).unwrap();
        assert!(f.add(FieldValue::Null).is_err());
    }

    #[test]
    fn null_rejected_on_not_null() {
        let f = Field::new(int_schema("id", FieldConstraints::NOT_NULL));
        assert!(f.check_value(FieldValue::Null).is_err());
    }

    #[test]
    fn type_mismatch_rejected() {
        let f = Field::new(int_schema("id", FieldConstraints::empty()));
        assert!(f.check_value(FieldValue::Text("x".into())).is_err());
    }

    #[test]
    fn schema_rejects_auto_increment_without_primary() {
        let s = int_schema("id", FieldConstraints::AUTO_INCREMENT);
        assert!(s.validate().is_err());
    }

    #[test]
    fn schema_rejects_unique_with_default() {
        let s = FieldSchema::new(
            "k",
            FieldType::Int,
            FieldConstraints::UNIQUE,
            FieldValue::Int(0),
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn round_trips_through_codec() {
        let mut f = Field::new(int_schema("id", FieldConstraints::PRIMARY));
        f.add(FieldValue::Int(1)).unwrap();
        f.add(FieldValue::Int(2)).unwrap();

        let mut w = Writer::new();
        f.encode(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let back = Field::decode(&mut r).unwrap();
        assert_eq!(back.values(), f.values());
    }
}
